//! The per-channel context threaded through every component, replacing
//! process-wide mutable globals (spec §9 design note on "global mutable
//! state").

use crate::address::Address;
use crate::config::StackConfig;
use crate::transport::{FailureDetector, Transport};
use crate::view::View;
use std::sync::{Arc, RwLock};

/// State shared by every protocol in one channel: the local process's own
/// address, the currently installed view, and configuration. Constructed
/// once when the channel is built; `local_address` and `view` are updated
/// only in response to explicit events (`SET_LOCAL_ADDRESS`,
/// `VIEW_CHANGE`), never mutated through a singleton.
pub struct Context {
    local_address: RwLock<Option<Address>>,
    view: RwLock<Option<View>>,
    config: RwLock<StackConfig>,
    pub transport: Arc<dyn Transport>,
    pub failure_detector: Arc<dyn FailureDetector>,
}

impl Context {
    pub fn new(transport: Arc<dyn Transport>, failure_detector: Arc<dyn FailureDetector>) -> Self {
        Self {
            local_address: RwLock::new(None),
            view: RwLock::new(None),
            config: RwLock::new(StackConfig::default()),
            transport,
            failure_detector,
        }
    }

    pub fn local_address(&self) -> Option<Address> {
        *self.local_address.read().unwrap()
    }

    pub fn set_local_address(&self, address: Address) {
        *self.local_address.write().unwrap() = Some(address);
    }

    pub fn view(&self) -> Option<View> {
        self.view.read().unwrap().clone()
    }

    pub fn set_view(&self, view: View) {
        *self.view.write().unwrap() = Some(view);
    }

    pub fn config(&self) -> StackConfig {
        self.config.read().unwrap().clone()
    }

    pub fn set_config(&self, config: StackConfig) {
        *self.config.write().unwrap() = config;
    }

    /// Whether the local process has joined a view yet (NAKACK's
    /// `is_server` flag, spec §4.2).
    pub fn is_server(&self) -> bool {
        self.view().is_some()
    }
}
