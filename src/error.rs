//! Component-scoped error taxonomy (spec §7), composed into one
//! [`PipelineError`] at the `Protocol` boundary, mirroring the grounding
//! crate's `DemuxError`/`StartError` pattern.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("seqno space exhausted for this sender")]
    Wraparound,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NakAckError {
    #[error("message from a non-member sender was dropped")]
    NonMember,
    #[error("received a message before the local process had joined (is_server == false)")]
    NotServer,
    #[error("failed to decode a NAKACK header")]
    Header(#[from] crate::headers::HeaderError),
    #[error(transparent)]
    Window(#[from] WindowError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlushError {
    #[error("failed to decode a FLUSH header")]
    Header(#[from] crate::headers::HeaderError),
    #[error("the downward gate timed out waiting to unblock")]
    GateTimeout,
    #[error("BLOCK_OK was not received from the application within block_timeout")]
    BlockTimeout,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GroupRequestError {
    #[error("recipient {0} is not part of this request")]
    UnknownRecipient(crate::address::Address),
    #[error("the request timed out before the completion policy was satisfied")]
    Timeout,
}

/// The error surfaced at the `Protocol::handle_up`/`handle_down` boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    NakAck(#[from] NakAckError),
    #[error(transparent)]
    Flush(#[from] FlushError),
    #[error(transparent)]
    GroupRequest(#[from] GroupRequestError),
    #[error("transport error: {0}")]
    Transport(String),
}
