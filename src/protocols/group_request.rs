//! Group Request dispatcher: broadcasts/anycasts an RPC, collects
//! responses under a configurable completion policy, and surfaces the
//! aggregated result (spec §4.4).

use crate::address::Address;
use crate::config::GroupRequestConfig;
use crate::context::Context;
use crate::error::PipelineError;
use crate::event::{Event, Protocol, Stack};
use crate::message::Message;
use crate::view::View;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Done immediately after `send`.
    None,
    /// Done when any response is received, or every recipient is suspected.
    First,
    /// Done when `received + suspected >= total`.
    All,
    /// Done when `received + suspected >= floor(total / 2) + 1`.
    Majority,
    /// Done when `received >= floor(total / 2) + 1`; suspicions don't count.
    AbsMajority,
    /// Done when `received >= expected`, `received + suspected >= expected`,
    /// or `expected` is unreachable (clamped to `total`, spec §9 bug fix).
    N(usize),
}

/// Per-recipient response state (spec §3, "Response record").
///
/// `received` and `suspected` are never simultaneously true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub sender: Address,
    pub value: Option<Vec<u8>>,
    pub received: bool,
    pub suspected: bool,
}

/// Overrides the numeric [`CompletionPolicy`] when present (spec §4.4).
pub trait CompletionPredicate: Send + Sync {
    fn needs_more_responses(&self, responses: &[ResponseRecord]) -> bool;
}

struct GroupRequestState {
    responses: FxHashMap<Address, ResponseRecord>,
    policy: CompletionPolicy,
    predicate: Option<Arc<dyn CompletionPredicate>>,
    /// Bounded FIFO history of suspected senders (spec §4.4, "Suspects
    /// list is bounded (default 40): older entries are evicted FIFO").
    suspect_history: VecDeque<Address>,
    max_suspects: usize,
}

/// A single in-flight (or idle, between calls) group request. `send`,
/// `receive_response`, `suspect` and `view_change` may be invoked
/// concurrently; every mutation happens under `state`'s mutex, and
/// `completion` is notified whenever they bring the call to completion
/// (spec §4.4, "Concurrency contract").
pub struct GroupRequest {
    context: Arc<Context>,
    /// FLUSH + NAKACK, in that order (spec §2: "application ⇄ Group
    /// Request ⇄ FLUSH ⇄ NAKACK ⇄ transport"). `send` drives its unicasts
    /// down through this rather than calling the transport directly, so
    /// an RPC still gets NAKACK's reliability and FLUSH's barrier even
    /// though the individual sends are unicast (spec §4.4 does not
    /// distinguish RPC traffic from ordinary multicast at this layer).
    below: Arc<Stack>,
    state: Mutex<GroupRequestState>,
    completion: Notify,
}

impl GroupRequest {
    pub fn new(config: GroupRequestConfig, context: Arc<Context>, below: Arc<Stack>) -> Arc<Self> {
        Arc::new(Self {
            context,
            below,
            state: Mutex::new(GroupRequestState {
                responses: FxHashMap::default(),
                policy: CompletionPolicy::None,
                predicate: None,
                suspect_history: VecDeque::new(),
                max_suspects: config.max_suspect_history,
            }),
            completion: Notify::new(),
        })
    }

    /// `send` (spec §4.4): fixes the response table's key set to
    /// `recipients` and unicasts `payload` to each of them through the
    /// FLUSH/NAKACK chain below.
    pub async fn send(
        &self,
        recipients: Vec<Address>,
        policy: CompletionPolicy,
        predicate: Option<Arc<dyn CompletionPredicate>>,
        payload: Vec<u8>,
    ) {
        {
            let mut state = self.state.lock().unwrap();
            state.responses = recipients
                .iter()
                .map(|&sender| {
                    (
                        sender,
                        ResponseRecord {
                            sender,
                            value: None,
                            received: false,
                            suspected: false,
                        },
                    )
                })
                .collect();
            state.policy = policy;
            state.predicate = predicate;
        }

        if let Some(local) = self.context.local_address() {
            for &recipient in &recipients {
                let msg = Message::unicast(local, recipient, payload.clone());
                if let Err(e) = self.below.down(Event::Msg(msg), &self.context).await {
                    tracing::warn!(error = %e, recipient = %recipient, "group request send failed");
                }
            }
        }

        if self.is_complete() {
            self.completion.notify_waiters();
        }
    }

    /// `receiveResponse` (spec §4.4). Silently ignores a sender outside
    /// the fixed key set (spec §4.4 invariant).
    pub fn receive_response(&self, sender: Address, value: Vec<u8>) {
        let complete = {
            let mut state = self.state.lock().unwrap();
            let Some(record) = state.responses.get_mut(&sender) else {
                tracing::debug!(%sender, "ignoring response from a non-recipient");
                return;
            };
            record.value = Some(value);
            record.received = true;
            record.suspected = false;
            Self::is_complete_locked(&state)
        };
        if complete {
            self.completion.notify_waiters();
        }
    }

    /// `suspect` (spec §4.4): marks `sender` suspected unless it already
    /// responded, and records the suspicion in the bounded history.
    pub fn suspect(&self, sender: Address) {
        let complete = {
            let mut state = self.state.lock().unwrap();
            if !state.responses.contains_key(&sender) {
                return;
            }
            if let Some(record) = state.responses.get_mut(&sender) {
                if !record.received {
                    record.suspected = true;
                    record.value = None;
                }
            }
            state.suspect_history.push_back(sender);
            if state.suspect_history.len() > state.max_suspects {
                state.suspect_history.pop_front();
            }
            Self::is_complete_locked(&state)
        };
        if complete {
            self.completion.notify_waiters();
        }
    }

    /// `viewChange` (spec §4.4): any key-set member absent from `view` is
    /// marked suspected; a sender outside the key set is ignored.
    pub fn view_change(&self, view: &View) {
        let complete = {
            let mut state = self.state.lock().unwrap();
            let departed: Vec<Address> = state.responses.keys().copied().filter(|a| !view.contains(*a)).collect();
            for sender in departed {
                if let Some(record) = state.responses.get_mut(&sender) {
                    if !record.received {
                        record.suspected = true;
                        record.value = None;
                    }
                }
            }
            Self::is_complete_locked(&state)
        };
        if complete {
            self.completion.notify_waiters();
        }
    }

    fn is_complete(&self) -> bool {
        Self::is_complete_locked(&self.state.lock().unwrap())
    }

    fn is_complete_locked(state: &GroupRequestState) -> bool {
        let responses: Vec<ResponseRecord> = state.responses.values().cloned().collect();
        if let Some(predicate) = &state.predicate {
            return !predicate.needs_more_responses(&responses);
        }

        let total = state.responses.len();
        let received = responses.iter().filter(|r| r.received).count();
        let suspected = responses.iter().filter(|r| r.suspected).count();

        match state.policy {
            CompletionPolicy::None => true,
            CompletionPolicy::First => received >= 1 || suspected >= total,
            CompletionPolicy::All => received + suspected >= total,
            CompletionPolicy::Majority => received + suspected >= total / 2 + 1,
            CompletionPolicy::AbsMajority => received >= total / 2 + 1,
            CompletionPolicy::N(expected) => {
                // spec §9 open question: `expected >= total` is treated as ALL
                // rather than as the self-recursive bug in the source.
                let expected = expected.min(total);
                received >= expected || received + suspected >= expected
            }
        }
    }

    /// `get()` / `get(timeout)` (spec §4.4): waits on the completion
    /// condition, then snapshots the response table. `None` waits
    /// indefinitely; `Some(d)` returns the current (possibly incomplete)
    /// snapshot once `d` elapses.
    pub async fn get(&self, timeout: Option<Duration>) -> Vec<ResponseRecord> {
        loop {
            if self.is_complete() {
                return self.snapshot();
            }
            let notified = self.completion.notified();
            if self.is_complete() {
                return self.snapshot();
            }
            match timeout {
                Some(d) => {
                    if tokio::time::timeout(d, notified).await.is_err() {
                        return self.snapshot();
                    }
                }
                None => notified.await,
            }
        }
    }

    fn snapshot(&self) -> Vec<ResponseRecord> {
        self.state.lock().unwrap().responses.values().cloned().collect()
    }
}

#[async_trait]
impl Protocol for GroupRequest {
    async fn handle_down(&self, event: Event, _ctx: &Context) -> Result<Vec<Event>, PipelineError> {
        // `send` drives its own unicasts through `self.below` directly,
        // bypassing this method; nothing downward to intercept here.
        Ok(vec![event])
    }

    async fn handle_up(&self, event: Event, _ctx: &Context) -> Result<Vec<Event>, PipelineError> {
        match event {
            Event::Msg(msg) if msg.headers.nakack().is_none() && msg.headers.flush().is_none() => {
                self.receive_response(msg.source, msg.payload.clone());
                Ok(Vec::new())
            }
            Event::ViewChange(view) => {
                self.view_change(&view);
                Ok(vec![Event::ViewChange(view)])
            }
            Event::Suspect(addr) => {
                self.suspect(addr);
                Ok(vec![Event::Suspect(addr)])
            }
            other => Ok(vec![other]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::flush::Flush;
    use crate::protocols::nakack::NakAck;
    use crate::transport::testing::{LoopbackNetwork, ManualFailureDetector};
    use crate::view::ViewId;

    fn context(network: &Arc<LoopbackNetwork>, local: Address) -> Arc<Context> {
        let transport = Arc::new(crate::transport::testing::LoopbackTransport::new(network.clone(), local));
        let ctx = Arc::new(Context::new(transport, ManualFailureDetector::new()));
        ctx.set_local_address(local);
        ctx
    }

    /// FLUSH + NAKACK below a `GroupRequest` under test, matching the
    /// layering `send` now drives its unicasts through.
    fn below(ctx: &Arc<Context>) -> Arc<Stack> {
        let flush: Arc<dyn Protocol> = Flush::new(crate::config::FlushConfig::default(), ctx.clone());
        let nakack: Arc<dyn Protocol> = NakAck::new(crate::config::NakAckConfig::default(), ctx.clone());
        Arc::new(Stack::new(vec![flush, nakack]))
    }

    #[tokio::test]
    async fn all_policy_completes_when_suspicion_covers_the_gap() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let b = Address::new(2);
        let c = Address::new(3);
        network.register(a);
        let ctx = context(&network, a);

        let gr = GroupRequest::new(GroupRequestConfig::default(), ctx.clone(), below(&ctx));
        gr.send(vec![a, b, c], CompletionPolicy::All, None, b"ping".to_vec()).await;
        assert!(!gr.is_complete());

        gr.receive_response(a, b"pong-a".to_vec());
        gr.receive_response(c, b"pong-c".to_vec());
        assert!(!gr.is_complete(), "b has neither responded nor been suspected yet");

        gr.suspect(b);
        assert!(gr.is_complete());

        let snapshot = gr.get(None).await;
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().find(|r| r.sender == b).unwrap().suspected);
    }

    #[tokio::test]
    async fn first_policy_completes_on_a_single_response() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let b = Address::new(2);
        network.register(a);
        let ctx = context(&network, a);

        let gr = GroupRequest::new(GroupRequestConfig::default(), ctx.clone(), below(&ctx));
        gr.send(vec![a, b], CompletionPolicy::First, None, Vec::new()).await;
        gr.receive_response(a, b"first".to_vec());
        assert!(gr.is_complete());
    }

    #[tokio::test]
    async fn abs_majority_ignores_suspicions() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let b = Address::new(2);
        let c = Address::new(3);
        network.register(a);
        let ctx = context(&network, a);

        let gr = GroupRequest::new(GroupRequestConfig::default(), ctx.clone(), below(&ctx));
        gr.send(vec![a, b, c], CompletionPolicy::AbsMajority, None, Vec::new()).await;
        gr.suspect(b);
        gr.suspect(c);
        assert!(!gr.is_complete(), "suspicions alone never satisfy ABS_MAJORITY");
        gr.receive_response(a, Vec::new());
        assert!(!gr.is_complete(), "one of three is not yet a majority");
    }

    #[tokio::test]
    async fn n_policy_clamps_an_unreachable_target_to_all() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let b = Address::new(2);
        network.register(a);
        let ctx = context(&network, a);

        let gr = GroupRequest::new(GroupRequestConfig::default(), ctx.clone(), below(&ctx));
        gr.send(vec![a, b], CompletionPolicy::N(5), None, Vec::new()).await;
        gr.receive_response(a, Vec::new());
        assert!(!gr.is_complete());
        gr.receive_response(b, Vec::new());
        assert!(gr.is_complete(), "expected=5 > total=2 clamps to ALL");
    }

    #[tokio::test]
    async fn response_from_a_non_recipient_is_ignored() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let outsider = Address::new(99);
        network.register(a);
        let ctx = context(&network, a);

        let gr = GroupRequest::new(GroupRequestConfig::default(), ctx.clone(), below(&ctx));
        gr.send(vec![a], CompletionPolicy::All, None, Vec::new()).await;
        gr.receive_response(outsider, Vec::new());
        assert!(!gr.is_complete(), "key set is fixed at send time");
    }

    #[tokio::test]
    async fn view_change_suspects_departed_recipients() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let b = Address::new(2);
        network.register(a);
        let ctx = context(&network, a);

        let gr = GroupRequest::new(GroupRequestConfig::default(), ctx.clone(), below(&ctx));
        gr.send(vec![a, b], CompletionPolicy::All, None, Vec::new()).await;
        gr.receive_response(a, Vec::new());
        gr.view_change(&View::new(ViewId::new(a, 2), vec![a]));
        assert!(gr.is_complete());
    }

    #[tokio::test]
    async fn suspect_history_is_bounded_fifo() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        network.register(a);
        let ctx = context(&network, a);

        let mut config = GroupRequestConfig::default();
        config.max_suspect_history = 2;
        let gr = GroupRequest::new(config, ctx.clone(), below(&ctx));
        let members: Vec<Address> = (0..5u64).map(Address::new).collect();
        gr.send(members.clone(), CompletionPolicy::None, None, Vec::new()).await;
        for &m in &members {
            gr.suspect(m);
        }
        assert_eq!(gr.state.lock().unwrap().suspect_history.len(), 2);
    }
}
