//! The three core protocol components (spec §4): the sender window and
//! NAKACK retransmitter, the FLUSH barrier, and the group request
//! dispatcher. Each is a [`crate::event::Protocol`] and also exposes a
//! direct `async fn` API for operations (digests, suspend/resume, RPC
//! completion) that don't fit the uniform up/down event shape.

pub mod flush;
pub mod group_request;
pub mod nakack;

pub use flush::{Flush, FlushState};
pub use group_request::{CompletionPolicy, CompletionPredicate, GroupRequest, ResponseRecord};
pub use nakack::NakAck;
