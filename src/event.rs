//! The uniform event pipeline (spec §2, §6, §9 design note on dynamic
//! dispatch).
//!
//! Each component is a value implementing [`Protocol`], consuming an event
//! from above (`handle_down`) or below (`handle_up`) and returning the
//! (possibly empty, possibly expanded) set of events to keep travelling
//! along the chain — an XMIT_RSP absorbs one event and emits several
//! (spec §4.2), a gap in the receive window absorbs one and emits zero
//! until the gap fills. (spec §9: "Model each protocol as a value with
//! two methods handleUp, handleDown ... the chain is a vector built at
//! configuration time.")

use crate::context::Context;
use crate::digest::Digest;
use crate::error::PipelineError;
use crate::message::Message;
use crate::view::View;
use async_trait::async_trait;
use std::sync::Arc;

/// A control signal or message travelling through the pipeline.
///
/// Not `Clone`: `GetDigest`/`GetDigestStable` carry a one-shot reply
/// channel, which isn't cloneable, and nothing in the pipeline needs to
/// duplicate a whole event (only the payloads inside a few variants are
/// ever cloned).
#[derive(Debug)]
pub enum Event {
    Msg(Message),
    ViewChange(View),
    TmpView(View),
    Suspect(crate::address::Address),
    SetLocalAddress(crate::address::Address),
    Stable(Digest),
    Rebroadcast(Digest),
    Disconnect,
    Suspend(Option<View>),
    Resume,
    SuspendOk,
    Block,
    BlockOk,
    Unblock,
    BecomeServer,
    EnableUnicastsTo(crate::address::Address),
    DisableUnicastsTo(crate::address::Address),
    /// `GET_DIGEST` (spec §6): request the current window-based digest;
    /// reply carries the answer back out-of-band since `handle_down`'s
    /// return channel is for forward pipeline events, not RPC replies.
    GetDigest(tokio::sync::oneshot::Sender<Digest>),
    /// `GET_DIGEST_STABLE` (spec §6): like `GetDigest`, truncated to the
    /// stable (fully-delivered) prefix.
    GetDigestStable(tokio::sync::oneshot::Sender<Digest>),
    /// `SET_DIGEST` (spec §6): seeds windows from a remote digest (state
    /// transfer target).
    SetDigest(Digest),
    /// `MERGE_DIGEST` (spec §6): folds a remote digest into the existing
    /// windows without discarding already-buffered entries (merge view
    /// installation).
    MergeDigest(Digest),
}

/// A member of the event pipeline: a down/up filter with two methods and
/// no subtype polymorphism beyond this pair (spec §9).
#[async_trait]
pub trait Protocol: Send + Sync {
    async fn handle_down(&self, event: Event, ctx: &Context) -> Result<Vec<Event>, PipelineError>;
    async fn handle_up(&self, event: Event, ctx: &Context) -> Result<Vec<Event>, PipelineError>;
}

/// A configuration-time vector of protocols, ordered top (application-most)
/// to bottom (transport-most). `down` walks forward, `up` walks in
/// reverse; each stage's output becomes the next stage's input frontier,
/// so the chain naturally absorbs events (return nothing) or expands them
/// (return several) without special-casing either in the driver.
pub struct Stack {
    protocols: Vec<Arc<dyn Protocol>>,
}

impl Stack {
    pub fn new(protocols: Vec<Arc<dyn Protocol>>) -> Self {
        Self { protocols }
    }

    /// Walks `event` down through every protocol in order, returning
    /// whatever falls off the bottom of the chain instead of discarding it.
    /// For a multicast `Msg`, NAKACK absorbs the send and the leftover
    /// frontier is the locally self-delivered copy (spec §1's
    /// self-delivery invariant) — already a fully delivered application
    /// event, not something to push back through `up` a second time.
    pub async fn down(&self, event: Event, ctx: &Context) -> Result<Vec<Event>, PipelineError> {
        let mut frontier = vec![event];
        for protocol in self.protocols.iter() {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for ev in frontier {
                next.extend(protocol.handle_down(ev, ctx).await?);
            }
            frontier = next;
        }
        Ok(frontier)
    }

    pub async fn up(&self, event: Event, ctx: &Context) -> Result<Vec<Event>, PipelineError> {
        let mut frontier = vec![event];
        for protocol in self.protocols.iter().rev() {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for ev in frontier {
                next.extend(protocol.handle_up(ev, ctx).await?);
            }
            frontier = next;
        }
        Ok(frontier)
    }
}
