//! FLUSH: a cluster-wide stop-the-world barrier (spec §4.3) used to
//! quiesce traffic around view changes and state transfer.
//!
//! `suspend`/`resume` are exposed as direct async operations (the same
//! shape as [`super::nakack::NakAck`]'s digest operations) because their
//! caller needs the boolean completion result the spec describes (§9,
//! "timed waits return a boolean"); the `Protocol` impl additionally
//! passes `SUSPEND`/`RESUME`/`BLOCK_OK` through the generic event chain
//! for callers that only have a `Stack` handle.

use crate::address::Address;
use crate::config::FlushConfig;
use crate::context::Context;
use crate::error::PipelineError;
use crate::event::{Event, Protocol};
use crate::headers::FlushHeader;
use crate::message::Message;
use crate::view::{View, ViewId};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Open,
    Blocking,
    Blocked,
    Completing,
}

struct FlushControl {
    state: FlushState,
    view_id: Option<ViewId>,
    /// Participants still expected to FLUSH_OK (suspected members removed).
    participants: HashSet<Address>,
    flush_ok: HashSet<Address>,
    is_coordinator: bool,
}

/// Per-process FLUSH state machine (spec §4.3).
pub struct Flush {
    config: FlushConfig,
    context: Arc<Context>,
    control: Mutex<FlushControl>,
    /// Signalled when the coordinator's `flush_ok` set covers every
    /// expected participant (or a `FLUSH_COMPLETED` arrives directly).
    completion: Notify,
    /// `true` while multicasts may proceed downward unobstructed.
    gate_open: AtomicBool,
    gate_notify: Notify,
    seen_first_view: AtomicBool,
    self_weak: Weak<Flush>,
}

impl Flush {
    pub fn new(config: FlushConfig, context: Arc<Context>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Flush {
            config,
            context,
            control: Mutex::new(FlushControl {
                state: FlushState::Open,
                view_id: None,
                participants: HashSet::new(),
                flush_ok: HashSet::new(),
                is_coordinator: false,
            }),
            completion: Notify::new(),
            gate_open: AtomicBool::new(true),
            gate_notify: Notify::new(),
            seen_first_view: AtomicBool::new(false),
            self_weak: weak.clone(),
        })
    }

    pub fn state(&self) -> FlushState {
        self.control.lock().unwrap().state
    }

    /// `SUSPEND(view?)` (spec §4.3, coordinator side): broadcasts
    /// START_FLUSH to the intersection of `requested_view` and the
    /// current view, then waits (bounded by `flush_timeout`) for every
    /// participant's FLUSH_OK before returning `true`.
    pub async fn suspend(&self, requested_view: Option<View>) -> bool {
        let Some(current) = self.context.view() else { return true };
        let participants: Vec<Address> = match requested_view {
            Some(rv) => current.members().iter().copied().filter(|a| rv.contains(*a)).collect(),
            None => current.members().to_vec(),
        };
        if participants.is_empty() {
            return true;
        }
        let view_id = current.id;
        {
            let mut ctrl = self.control.lock().unwrap();
            ctrl.state = FlushState::Blocking;
            ctrl.view_id = Some(view_id);
            ctrl.participants = participants.iter().copied().collect();
            ctrl.flush_ok.clear();
            ctrl.is_coordinator = current.coordinator() == self.context.local_address();
        }
        self.gate_open.store(false, Ordering::SeqCst);

        if let Some(local) = self.context.local_address() {
            let start = Message::multicast(local, Vec::new()).with_flush(FlushHeader::StartFlush {
                view_id,
                participants: participants.clone(),
            });
            if let Err(e) = self.context.transport.send(start).await {
                tracing::warn!(error = %e, "failed broadcasting START_FLUSH");
            }
        }

        // The broadcast transport never loops back to the sender, but the
        // coordinator is itself a participant and must go through the
        // same BLOCKING transition as everyone else.
        self.on_start_flush(view_id, participants).await;

        let completed = self.completion.notified();
        tokio::select! {
            _ = completed => true,
            _ = tokio::time::sleep(self.config.flush_timeout) => {
                tracing::warn!("SUSPEND timed out waiting for FLUSH_COMPLETED");
                false
            }
        }
    }

    /// `RESUME` (spec §4.3): broadcasts STOP_FLUSH, releasing every
    /// participant's downward gate.
    pub async fn resume(&self) {
        let view_id = self.control.lock().unwrap().view_id;
        let Some(view_id) = view_id else { return };
        if let Some(local) = self.context.local_address() {
            let stop = Message::multicast(local, Vec::new()).with_flush(FlushHeader::StopFlush { view_id });
            if let Err(e) = self.context.transport.send(stop).await {
                tracing::warn!(error = %e, "failed broadcasting STOP_FLUSH");
            }
        }
        self.on_stop_flush(view_id);
    }

    /// `OPEN + START_FLUSH(v, P) → BLOCKING` (spec §4.3): emits `BLOCK`
    /// upward and arms a `block_timeout` timer that force-acks it if the
    /// application never replies.
    async fn on_start_flush(&self, view_id: ViewId, participants: Vec<Address>) -> Vec<Event> {
        {
            let mut ctrl = self.control.lock().unwrap();
            if ctrl.state != FlushState::Blocking || ctrl.view_id != Some(view_id) {
                ctrl.state = FlushState::Blocking;
                ctrl.view_id = Some(view_id);
                ctrl.participants = participants.into_iter().collect();
                ctrl.flush_ok.clear();
            }
        }
        self.gate_open.store(false, Ordering::SeqCst);
        self.spawn_block_timeout(view_id);
        vec![Event::Block]
    }

    fn spawn_block_timeout(&self, view_id: ViewId) {
        let Some(flush) = self.self_weak.upgrade() else { return };
        let timeout = self.config.block_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_blocking = {
                let ctrl = flush.control.lock().unwrap();
                ctrl.state == FlushState::Blocking && ctrl.view_id == Some(view_id)
            };
            if still_blocking {
                tracing::warn!("BLOCK_OK not received within block_timeout, forcing it");
                flush.on_block_ok().await;
            }
        });
    }

    /// App acked BLOCK (or the timer forced it): broadcast FLUSH_OK and
    /// enter BLOCKED.
    async fn on_block_ok(&self) {
        let view_id = {
            let mut ctrl = self.control.lock().unwrap();
            if ctrl.state != FlushState::Blocking {
                return;
            }
            ctrl.state = FlushState::Blocked;
            ctrl.view_id
        };
        let Some(view_id) = view_id else { return };
        let Some(local) = self.context.local_address() else { return };
        let ok = Message::multicast(local, Vec::new()).with_flush(FlushHeader::FlushOk { view_id });
        if let Err(e) = self.context.transport.send(ok).await {
            tracing::warn!(error = %e, "failed broadcasting FLUSH_OK");
        }
        self.on_flush_ok(local, view_id).await;
    }

    /// `BLOCKED + FLUSH_OK(v) from each participant in P → on the
    /// coordinator, emit FLUSH_COMPLETED` (spec §4.3).
    async fn on_flush_ok(&self, sender: Address, view_id: ViewId) {
        let complete = {
            let mut ctrl = self.control.lock().unwrap();
            if !ctrl.is_coordinator || ctrl.view_id != Some(view_id) {
                return;
            }
            ctrl.flush_ok.insert(sender);
            !ctrl.participants.is_empty() && ctrl.flush_ok.is_superset(&ctrl.participants)
        };
        if complete {
            self.control.lock().unwrap().state = FlushState::Completing;
            self.completion.notify_waiters();
        }
    }

    fn on_flush_completed(&self, view_id: ViewId) {
        let mut ctrl = self.control.lock().unwrap();
        if ctrl.view_id == Some(view_id) {
            ctrl.state = FlushState::Completing;
            drop(ctrl);
            self.completion.notify_waiters();
        }
    }

    /// `BLOCKED + STOP_FLUSH(v) → OPEN` (spec §4.3). Returns whether this
    /// call actually transitioned the state (so the caller only emits
    /// `UNBLOCK` once).
    fn on_stop_flush(&self, view_id: ViewId) -> bool {
        let mut ctrl = self.control.lock().unwrap();
        if ctrl.view_id != Some(view_id) || ctrl.state == FlushState::Open {
            return false;
        }
        ctrl.state = FlushState::Open;
        drop(ctrl);
        self.gate_open.store(true, Ordering::SeqCst);
        self.gate_notify.notify_waiters();
        true
    }

    /// `Any state + SUSPECT(a)`: drops `a` from the expected set; if that
    /// completes the FLUSH_OK set, emits FLUSH_COMPLETED.
    async fn on_suspect(&self, addr: Address) {
        let complete = {
            let mut ctrl = self.control.lock().unwrap();
            ctrl.participants.remove(&addr);
            ctrl.flush_ok.remove(&addr);
            ctrl.is_coordinator
                && ctrl.state != FlushState::Open
                && !ctrl.participants.is_empty()
                && ctrl.flush_ok.is_superset(&ctrl.participants)
        };
        if complete {
            self.control.lock().unwrap().state = FlushState::Completing;
            self.completion.notify_waiters();
        }
    }

    /// First-view synthesis and coordinator handover (spec §4.3).
    async fn handle_view_change(&self, view: View) -> Vec<Event> {
        let mut out = vec![Event::ViewChange(view.clone())];

        if !self.seen_first_view.swap(true, Ordering::SeqCst) {
            self.gate_open.store(true, Ordering::SeqCst);
            self.gate_notify.notify_waiters();
            out.push(Event::Unblock);
        }

        let (was_wedged, old_caller_gone, becomes_coordinator) = {
            let mut ctrl = self.control.lock().unwrap();
            let was_wedged = matches!(ctrl.state, FlushState::Blocked | FlushState::Completing);
            let old_caller_gone = ctrl.view_id.is_some_and(|vid| !view.contains(vid.coordinator));
            let becomes_coordinator = view.coordinator() == self.context.local_address();
            ctrl.is_coordinator = becomes_coordinator;
            (was_wedged, old_caller_gone, becomes_coordinator)
        };
        if was_wedged && old_caller_gone && becomes_coordinator {
            self.resume().await;
        }
        out
    }

    /// The downward message gate (spec §4.3, §5): while BLOCKING/BLOCKED,
    /// a multicast waits here for up to `flush_timeout` before the
    /// process unilaterally unwedges itself.
    async fn wait_for_gate(&self) {
        loop {
            if self.gate_open.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.gate_notify.notified();
            if self.gate_open.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.config.flush_timeout) => {
                    tracing::warn!("FLUSH downward gate timed out; forcing SUSPEND_OK to unwedge");
                    self.force_unwedge();
                    return;
                }
            }
        }
    }

    fn force_unwedge(&self) {
        self.control.lock().unwrap().state = FlushState::Open;
        self.gate_open.store(true, Ordering::SeqCst);
        self.gate_notify.notify_waiters();
        self.completion.notify_waiters();
    }
}

#[async_trait]
impl Protocol for Flush {
    async fn handle_down(&self, event: Event, _ctx: &Context) -> Result<Vec<Event>, PipelineError> {
        match event {
            Event::Msg(msg) => {
                if msg.is_multicast() {
                    self.wait_for_gate().await;
                }
                Ok(vec![Event::Msg(msg)])
            }
            Event::BlockOk => {
                self.on_block_ok().await;
                Ok(Vec::new())
            }
            Event::Suspend(view) => {
                let ok = self.suspend(view).await;
                tracing::debug!(ok, "SUSPEND completed");
                Ok(Vec::new())
            }
            Event::Resume => {
                self.resume().await;
                Ok(Vec::new())
            }
            other => Ok(vec![other]),
        }
    }

    async fn handle_up(&self, event: Event, _ctx: &Context) -> Result<Vec<Event>, PipelineError> {
        match event {
            Event::Msg(msg) => {
                let Some(header) = msg.headers.flush().cloned() else {
                    return Ok(vec![Event::Msg(msg)]);
                };
                match header {
                    FlushHeader::StartFlush { view_id, participants } => Ok(self.on_start_flush(view_id, participants).await),
                    FlushHeader::FlushOk { view_id } => {
                        self.on_flush_ok(msg.source, view_id).await;
                        Ok(Vec::new())
                    }
                    FlushHeader::FlushCompleted { view_id } => {
                        self.on_flush_completed(view_id);
                        Ok(Vec::new())
                    }
                    FlushHeader::StopFlush { view_id } => {
                        if self.on_stop_flush(view_id) {
                            Ok(vec![Event::Unblock])
                        } else {
                            Ok(Vec::new())
                        }
                    }
                }
            }
            Event::ViewChange(view) => Ok(self.handle_view_change(view).await),
            Event::Suspect(addr) => {
                self.on_suspect(addr).await;
                Ok(vec![Event::Suspect(addr)])
            }
            other => Ok(vec![other]),
        }
    }
}
