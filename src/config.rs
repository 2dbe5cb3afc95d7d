//! Plain configuration structs with the defaults spec.md names.
//!
//! Parsing these from an external config file/format is the collaborator
//! named out of scope in spec.md §1; this module only owns the typed
//! values and their defaults, the same shape as the grounding crate's
//! `Default`-derived protocol structs.

use std::time::Duration;

/// Configuration for the sender window / retransmitter (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    /// Backoff schedule for retransmit requests; the last interval repeats
    /// indefinitely until cancelled.
    pub retransmit_intervals: Vec<Duration>,
    /// `gcLag`: entries within this distance of `high_delivered` are kept
    /// around by `stable` even though they've been delivered.
    pub gc_lag: u64,
    /// `maxBufSize`: 0 disables bounded eviction.
    pub max_buf_size: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            retransmit_intervals: vec![
                Duration::from_millis(600),
                Duration::from_millis(1200),
                Duration::from_millis(2400),
                Duration::from_millis(4800),
            ],
            gc_lag: 20,
            max_buf_size: 0,
        }
    }
}

/// Configuration for NAKACK (spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakAckConfig {
    pub window: WindowConfig,
    /// Largest payload to pack into a single XMIT_RSP bundle.
    pub max_xmit_size: usize,
    /// Multicast XMIT_RSP instead of unicasting to the requester.
    pub use_mcast_xmit: bool,
    /// Address XMIT_REQ to a random live member instead of the original
    /// sender.
    pub xmit_from_random_member: bool,
    /// Interval between REBROADCAST passes.
    pub rebroadcast_interval: Duration,
    /// Upper bound on how long REBROADCAST may run before giving up.
    pub max_rebroadcast_timeout: Duration,
}

impl Default for NakAckConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            max_xmit_size: 64 * 1024,
            use_mcast_xmit: false,
            xmit_from_random_member: false,
            rebroadcast_interval: Duration::from_millis(500),
            max_rebroadcast_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for FLUSH (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushConfig {
    /// Bound on how long the upward BLOCK wait may take before the local
    /// process auto-acks it.
    pub block_timeout: Duration,
    /// Bound on the downward gate a blocked/blocking process imposes on
    /// outgoing multicasts.
    pub flush_timeout: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(8),
            flush_timeout: Duration::from_secs(8),
        }
    }
}

/// Configuration for the group request dispatcher (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupRequestConfig {
    /// Maximum number of suspect entries retained (oldest evicted FIFO).
    pub max_suspect_history: usize,
}

impl Default for GroupRequestConfig {
    fn default() -> Self {
        Self { max_suspect_history: 40 }
    }
}

/// Aggregate configuration threaded through the whole stack (the `CONFIG`
/// event of spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub nakack: NakAckConfig,
    pub flush: FlushConfig,
    pub group_request: GroupRequestConfig,
    /// Published by the transport collaborator; NAKACK uses it to size
    /// `max_xmit_size` when no more specific value is configured.
    pub max_bundle_size: Option<usize>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            nakack: NakAckConfig::default(),
            flush: FlushConfig::default(),
            group_request: GroupRequestConfig::default(),
            max_bundle_size: None,
        }
    }
}
