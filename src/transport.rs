//! The external collaborators this crate only ever reaches through a
//! trait boundary: best-effort datagram transport and the failure
//! detector (spec §6).

use crate::address::Address;
use crate::message::Message;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport rejected the frame")]
    Rejected,
    #[error("destination {0} is unknown to the transport")]
    UnknownDestination(Address),
}

/// Best-effort datagram delivery with an address-based destination (spec
/// §6). Implementors must preserve message boundaries and must not
/// silently duplicate messages; NAKACK tolerates duplicates but wastes
/// bandwidth on them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `message` to `message.destination`, or multicasts it to the
    /// whole view if `None`. A transient failure must leave the message
    /// recoverable by the caller (NAKACK never decrements a seqno on
    /// failure; see spec §4.2, §7).
    async fn send(&self, message: Message) -> Result<(), TransportError>;
}

/// Emits `SUSPECT(addr)` when it believes `addr` has failed; may be
/// spurious (spec §6).
#[async_trait]
pub trait FailureDetector: Send + Sync {
    async fn suspected(&self) -> Vec<Address>;
}

pub mod testing {
    //! An in-process loopback transport double used by this crate's own
    //! tests and available to integration tests under `tests/`.

    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// A shared bus connecting a set of loopback endpoints. Each endpoint
    /// gets its own inbound queue; `send` fans a multicast out to every
    /// other endpoint, or delivers directly for a unicast.
    pub struct LoopbackNetwork {
        inboxes: Mutex<std::collections::HashMap<Address, mpsc::UnboundedSender<Message>>>,
        /// `(sender, seqno)` pairs to silently drop, for fault injection
        /// (spec §8 scenario S2).
        drops: Mutex<std::collections::HashSet<(Address, u64)>>,
    }

    impl LoopbackNetwork {
        pub fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self {
                inboxes: Mutex::new(std::collections::HashMap::new()),
                drops: Mutex::new(std::collections::HashSet::new()),
            })
        }

        /// Registers `address` and returns its inbound queue.
        pub fn register(&self, address: Address) -> mpsc::UnboundedReceiver<Message> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.inboxes.lock().unwrap().insert(address, tx);
            rx
        }

        /// Drops the next occurrence of `(sender, seqno)` destined for any
        /// recipient. Only applies to NAKACK `MSG` headers.
        pub fn drop_once(&self, sender: Address, seqno: u64) {
            self.drops.lock().unwrap().insert((sender, seqno));
        }

        fn should_drop(&self, message: &Message) -> bool {
            let Some(crate::headers::NakAckHeader::Msg { seqno }) = message.headers.nakack() else {
                return false;
            };
            let key = (message.source, seqno.get());
            self.drops.lock().unwrap().remove(&key)
        }
    }

    /// A handle bound to one address on a [`LoopbackNetwork`].
    pub struct LoopbackTransport {
        network: std::sync::Arc<LoopbackNetwork>,
        local: Address,
    }

    impl LoopbackTransport {
        pub fn new(network: std::sync::Arc<LoopbackNetwork>, local: Address) -> Self {
            Self { network, local }
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn send(&self, message: Message) -> Result<(), TransportError> {
            if self.network.should_drop(&message) {
                return Ok(());
            }
            let inboxes = self.network.inboxes.lock().unwrap();
            match message.destination {
                Some(dest) => {
                    if let Some(tx) = inboxes.get(&dest) {
                        let _ = tx.send(message);
                    }
                }
                None => {
                    for (&addr, tx) in inboxes.iter() {
                        if addr != self.local {
                            let _ = tx.send(message.clone());
                        }
                    }
                }
            }
            Ok(())
        }
    }

    /// A failure detector whose suspicions are set by the test.
    #[derive(Default)]
    pub struct ManualFailureDetector {
        suspects: Mutex<Vec<Address>>,
    }

    impl ManualFailureDetector {
        pub fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self::default())
        }

        pub fn suspect(&self, address: Address) {
            self.suspects.lock().unwrap().push(address);
        }
    }

    #[async_trait]
    impl FailureDetector for ManualFailureDetector {
        async fn suspected(&self) -> Vec<Address> {
            self.suspects.lock().unwrap().clone()
        }
    }
}
