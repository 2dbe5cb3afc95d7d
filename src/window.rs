//! Per-sender receive window and retransmission scheduler (spec §4.1).

use crate::address::Address;
use crate::config::WindowConfig;
use crate::digest::DigestEntry;
use crate::error::WindowError;
use crate::message::Message;
use crate::seqno::Seqno;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Supplied by NAKACK so a window's retransmit tasks can ask for a
/// missing range without the window knowing anything about transport.
#[async_trait]
pub trait RetransmitCommand: Send + Sync {
    async fn request_retransmit(&self, sender: Address, low: Seqno, high: Seqno);
}

struct WindowState {
    /// Messages from `lowest_retained` through `highest_received`,
    /// delivered or not: delivered entries stay here (so this process can
    /// serve XMIT_REQ for them) until `stable` prunes them.
    entries: BTreeMap<u64, Message>,
    /// Seqnos that were dispatched upward immediately as OOB and must be
    /// skipped, not redelivered, by the in-order drain.
    oob: HashSet<u64>,
    highest_delivered: Option<u64>,
    highest_received: Option<u64>,
    lowest_retained: u64,
    tasks: HashMap<u64, JoinHandle<()>>,
}

impl WindowState {
    fn new(start_at: Seqno) -> Self {
        Self {
            entries: BTreeMap::new(),
            oob: HashSet::new(),
            highest_delivered: if start_at.get() == 0 { None } else { Some(start_at.get() - 1) },
            highest_received: if start_at.get() == 0 { None } else { Some(start_at.get() - 1) },
            lowest_retained: start_at.get(),
            tasks: HashMap::new(),
        }
    }

    fn cancel_all_tasks(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

/// A per-sender reordering buffer with its own retransmission tasks
/// (spec §4.1). Delivery is serialised per window via [`SenderWindow::drain`].
pub struct SenderWindow {
    sender: Address,
    config: WindowConfig,
    retransmit: Arc<dyn RetransmitCommand>,
    state: Mutex<WindowState>,
    delivery_lock: tokio::sync::Mutex<()>,
}

impl SenderWindow {
    pub fn new(sender: Address, config: WindowConfig, retransmit: Arc<dyn RetransmitCommand>) -> Self {
        Self::starting_at(sender, config, retransmit, Seqno::ZERO)
    }

    /// Creates a window whose next expected message is `start_at` (used by
    /// `SET_DIGEST`/`MERGE_DIGEST`, where earlier messages are considered
    /// already delivered elsewhere).
    pub fn starting_at(
        sender: Address,
        config: WindowConfig,
        retransmit: Arc<dyn RetransmitCommand>,
        start_at: Seqno,
    ) -> Self {
        Self {
            sender,
            config,
            retransmit,
            state: Mutex::new(WindowState::new(start_at)),
            delivery_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    /// Inserts `msg` at `seqno` if it's new and not already delivered,
    /// opening retransmit tasks for any gap the insertion reveals. Returns
    /// whether the message was newly added.
    pub fn add(&self, seqno: Seqno, msg: Message, oob: bool) -> bool {
        let seqno_val = seqno.get();
        let mut state = self.state.lock().unwrap();

        let already_delivered = state.highest_delivered.is_some_and(|hd| seqno_val <= hd);
        if already_delivered || state.entries.contains_key(&seqno_val) {
            return false;
        }

        state.entries.insert(seqno_val, msg);
        if oob {
            state.oob.insert(seqno_val);
        }

        let prev_high = state.highest_received;
        if prev_high.map_or(true, |h| seqno_val > h) {
            let gap_start = prev_high.map_or(0, |h| h + 1);
            for missing in gap_start..seqno_val {
                if !state.entries.contains_key(&missing) {
                    self.schedule_retransmit(&mut state, missing);
                }
            }
            state.highest_received = Some(seqno_val);
        }

        // The arriving seqno resolves whatever gap task was tracking it.
        if let Some(handle) = state.tasks.remove(&seqno_val) {
            handle.abort();
        }

        true
    }

    fn schedule_retransmit(&self, state: &mut WindowState, missing: u64) {
        let sender = self.sender;
        let retransmit = self.retransmit.clone();
        let intervals = self.config.retransmit_intervals.clone();
        let handle = tokio::spawn(async move {
            let mut idx = 0usize;
            loop {
                let wait = intervals
                    .get(idx)
                    .copied()
                    .unwrap_or_else(|| *intervals.last().expect("retransmit schedule is never empty"));
                tokio::time::sleep(wait).await;
                retransmit
                    .request_retransmit(sender, Seqno::new(missing), Seqno::new(missing))
                    .await;
                idx = (idx + 1).min(intervals.len());
            }
        });
        state.tasks.insert(missing, handle);
    }

    /// Drains every currently deliverable message in strict seqno order,
    /// skipping (but advancing past) seqnos already delivered out-of-band.
    /// Holds the per-window delivery lock for the duration, so concurrent
    /// callers never interleave deliveries from the same sender.
    pub async fn drain(&self) -> Vec<Message> {
        let _guard = self.delivery_lock.lock().await;
        let mut out = Vec::new();
        loop {
            let mut state = self.state.lock().unwrap();
            let next = state.highest_delivered.map_or(0, |h| h + 1);
            let Some(msg) = state.entries.get(&next).cloned() else {
                break;
            };
            let was_oob = state.oob.remove(&next);
            state.highest_delivered = Some(next);
            drop(state);
            if !was_oob {
                out.push(msg);
            }
        }
        out
    }

    /// Drops delivered entries at or below `up_to` and cancels any
    /// retransmit tasks still tracking seqnos in that range.
    pub fn stable(&self, up_to: Seqno) {
        let mut state = self.state.lock().unwrap();
        let up_to = up_to.get();
        state.entries.retain(|&seqno, _| seqno > up_to);
        state.lowest_retained = state.lowest_retained.max(up_to.saturating_add(1));
        let stale: Vec<u64> = state.tasks.keys().copied().filter(|&s| s <= up_to).collect();
        for s in stale {
            if let Some(handle) = state.tasks.remove(&s) {
                handle.abort();
            }
        }
    }

    /// Evicts the oldest delivered-and-retained entries beyond
    /// `max_buf_size`, if configured. Entries not yet delivered are never
    /// evicted.
    pub fn enforce_bound(&self) {
        if self.config.max_buf_size == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let Some(highest_delivered) = state.highest_delivered else {
            return;
        };
        let max = self.config.max_buf_size;
        while state.entries.len() as u64 > max {
            let Some(&oldest) = state.entries.keys().next() else {
                break;
            };
            if oldest > highest_delivered {
                break;
            }
            state.entries.remove(&oldest);
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancel_all_tasks();
        *state = WindowState::new(Seqno::ZERO);
    }

    pub fn destroy(&self) {
        self.state.lock().unwrap().cancel_all_tasks();
    }

    /// Looks up a retained message, delivered or not, for XMIT_RSP.
    pub fn get(&self, seqno: Seqno) -> Option<Message> {
        self.state.lock().unwrap().entries.get(&seqno.get()).cloned()
    }

    pub fn highest_delivered(&self) -> Option<Seqno> {
        self.state.lock().unwrap().highest_delivered.map(Seqno::new)
    }

    pub fn highest_received(&self) -> Option<Seqno> {
        self.state.lock().unwrap().highest_received.map(Seqno::new)
    }

    pub fn digest_entry(&self) -> DigestEntry {
        let state = self.state.lock().unwrap();
        DigestEntry::new(
            Seqno::new(state.lowest_retained),
            Seqno::new(state.highest_delivered.unwrap_or(0)),
            Seqno::new(state.highest_received.unwrap_or(0)),
        )
    }

    /// Returns `Err` if this sender's own counter would wrap (used by
    /// NAKACK when assigning the next local seqno; see spec §8).
    pub fn next_local_seqno(current: Seqno) -> Result<Seqno, WindowError> {
        current.next().map_err(|_| WindowError::Wraparound)
    }
}

impl Drop for SenderWindow {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRetransmit(Arc<AtomicUsize>);

    #[async_trait]
    impl RetransmitCommand for CountingRetransmit {
        async fn request_retransmit(&self, _sender: Address, _low: Seqno, _high: Seqno) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn msg(source: Address, seqno: Seqno) -> Message {
        Message::multicast(source, b"x".to_vec())
            .with_nakack(crate::headers::NakAckHeader::Msg { seqno })
    }

    #[tokio::test]
    async fn in_order_delivery_is_strict_seqno_order() {
        let sender = Address::new(1);
        let window = SenderWindow::new(sender, WindowConfig::default(), Arc::new(CountingRetransmit(Arc::new(AtomicUsize::new(0)))));

        assert!(window.add(Seqno::new(0), msg(sender, Seqno::new(0)), false));
        assert!(window.add(Seqno::new(1), msg(sender, Seqno::new(1)), false));
        assert!(window.add(Seqno::new(2), msg(sender, Seqno::new(2)), false));

        let delivered = window.drain().await;
        assert_eq!(delivered.len(), 3);
        for (i, m) in delivered.iter().enumerate() {
            assert_eq!(m.headers.nakack(), Some(&crate::headers::NakAckHeader::Msg { seqno: Seqno::new(i as u64) }));
        }
    }

    #[tokio::test]
    async fn gap_blocks_delivery_until_filled() {
        let sender = Address::new(1);
        let window = SenderWindow::new(sender, WindowConfig::default(), Arc::new(CountingRetransmit(Arc::new(AtomicUsize::new(0)))));

        window.add(Seqno::new(0), msg(sender, Seqno::new(0)), false);
        window.add(Seqno::new(2), msg(sender, Seqno::new(2)), false);
        assert_eq!(window.drain().await.len(), 1, "only seqno 0 is deliverable, 1 is missing");

        window.add(Seqno::new(1), msg(sender, Seqno::new(1)), false);
        assert_eq!(window.drain().await.len(), 2, "filling the gap unblocks 1 and 2");
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let sender = Address::new(1);
        let window = SenderWindow::new(sender, WindowConfig::default(), Arc::new(CountingRetransmit(Arc::new(AtomicUsize::new(0)))));
        assert!(window.add(Seqno::new(0), msg(sender, Seqno::new(0)), false));
        assert!(!window.add(Seqno::new(0), msg(sender, Seqno::new(0)), false));
        window.drain().await;
        assert!(!window.add(Seqno::new(0), msg(sender, Seqno::new(0)), false));
    }

    #[tokio::test]
    async fn oob_is_skipped_by_in_order_drain() {
        let sender = Address::new(1);
        let window = SenderWindow::new(sender, WindowConfig::default(), Arc::new(CountingRetransmit(Arc::new(AtomicUsize::new(0)))));
        window.add(Seqno::new(0), msg(sender, Seqno::new(0)), true);
        window.add(Seqno::new(1), msg(sender, Seqno::new(1)), false);
        let delivered = window.drain().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].headers.nakack(), Some(&crate::headers::NakAckHeader::Msg { seqno: Seqno::new(1) }));
    }

    #[tokio::test]
    async fn stable_prunes_delivered_entries() {
        let sender = Address::new(1);
        let window = SenderWindow::new(sender, WindowConfig::default(), Arc::new(CountingRetransmit(Arc::new(AtomicUsize::new(0)))));
        window.add(Seqno::new(0), msg(sender, Seqno::new(0)), false);
        window.drain().await;
        assert!(window.get(Seqno::new(0)).is_some());
        window.stable(Seqno::new(0));
        assert!(window.get(Seqno::new(0)).is_none());
    }
}
