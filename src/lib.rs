//! A reliable group communication stack: per-sender FIFO multicast with
//! negative-ack retransmission (NAKACK), a cluster-wide quiescence
//! barrier (FLUSH), and a completion-policy RPC dispatcher (Group
//! Request), wired together through a small event pipeline (spec §2).
//!
//! Transport, failure detection, discovery, fragmentation, encryption,
//! state serialization, the channel façade and config-file parsing are
//! external collaborators reached only through the trait boundaries in
//! [`transport`] and [`event`]; this crate does not implement them.

pub mod address;
pub mod application;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod event;
pub mod headers;
pub mod message;
pub mod protocols;
pub mod sent_table;
pub mod seqno;
pub mod transport;
pub mod view;
pub mod window;

pub use address::Address;
pub use application::Application;
pub use config::{FlushConfig, GroupRequestConfig, NakAckConfig, StackConfig, WindowConfig};
pub use context::Context;
pub use digest::{Digest, DigestEntry};
pub use error::{FlushError, GroupRequestError, NakAckError, PipelineError, WindowError};
pub use event::{Event, Protocol, Stack};
pub use message::{Headers, Message};
pub use protocols::{CompletionPolicy, CompletionPredicate, Flush, FlushState, GroupRequest, NakAck, ResponseRecord};
pub use seqno::Seqno;
pub use view::{MergeView, View, ViewId};
