//! NAKACK: per-sender, sequence-numbered negative-acknowledgement
//! reliable multicast (spec §4.2), built on the [`SenderWindow`] and
//! [`SentTable`] primitives.
//!
//! NAKACK sits at the bottom of the chain (spec §2: "application ⇄ Group
//! Request ⇄ FLUSH ⇄ NAKACK ⇄ transport"): it is the component that
//! actually calls [`Transport::send`], so a downward MSG event is
//! absorbed here rather than passed further down the `Stack`.

use crate::address::Address;
use crate::context::Context;
use crate::digest::{Digest, DigestEntry};
use crate::error::{NakAckError, PipelineError, WindowError};
use crate::event::{Event, Protocol};
use crate::headers::{HeaderError, NakAckHeader};
use crate::message::Message;
use crate::seqno::Seqno;
use crate::sent_table::SentTable;
use crate::view::View;
use crate::window::{RetransmitCommand, SenderWindow};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::{rngs::SmallRng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

use crate::config::NakAckConfig;

/// Forwards a missing-range request back into [`NakAck::send_xmit_req`]
/// without the [`SenderWindow`] holding a strong reference back to its
/// owner (spec §9, "no strong back-reference from task to window object").
struct RetransmitHandle(Weak<NakAck>);

#[async_trait]
impl RetransmitCommand for RetransmitHandle {
    async fn request_retransmit(&self, sender: Address, low: Seqno, high: Seqno) {
        if let Some(nakack) = self.0.upgrade() {
            nakack.send_xmit_req(sender, low, high).await;
        }
    }
}

/// Packs `original_sender` once per bundle plus a `(seqno, payload)` list;
/// the wire-level `XMIT_RSP` header only carries `(low, high)` (spec §6),
/// so the per-message source travels inside this opaque payload instead.
fn encode_bundle(original_sender: Address, entries: &[(Seqno, Vec<u8>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&original_sender.into_inner().to_be_bytes());
    buf.extend_from_slice(&(entries.len() as u64).to_be_bytes());
    for (seqno, payload) in entries {
        buf.extend_from_slice(&seqno.get().to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        buf.extend_from_slice(payload);
    }
    buf
}

fn decode_bundle(bytes: &[u8]) -> Result<(Address, Vec<(Seqno, Vec<u8>)>), HeaderError> {
    fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64, HeaderError> {
        let end = *pos + 8;
        let slice = bytes.get(*pos..end).ok_or(HeaderError::Truncated)?;
        *pos = end;
        Ok(u64::from_be_bytes(slice.try_into().unwrap()))
    }

    let mut pos = 0usize;
    let original_sender = Address::new(read_u64(bytes, &mut pos)?);
    let count = read_u64(bytes, &mut pos)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let seqno = Seqno::new(read_u64(bytes, &mut pos)?);
        let len = read_u64(bytes, &mut pos)? as usize;
        let end = pos + len;
        let payload = bytes.get(pos..end).ok_or(HeaderError::Truncated)?.to_vec();
        pos = end;
        out.push((seqno, payload));
    }
    Ok((original_sender, out))
}

/// Greedily groups `entries` into chunks whose encoded size stays under
/// `max_size`, each becoming one `XMIT_RSP` (spec §4.2, "bundle into one
/// or more XMIT_RSP messages each bounded by maxXmitSize").
fn bundle_chunks(entries: &[(Seqno, Vec<u8>)], max_size: usize) -> Vec<Vec<(Seqno, Vec<u8>)>> {
    const HEADER_OVERHEAD: usize = 16; // original_sender + count, accounted once per chunk below
    const ENTRY_OVERHEAD: usize = 16; // seqno + length prefix

    let mut chunks = Vec::new();
    let mut current: Vec<(Seqno, Vec<u8>)> = Vec::new();
    let mut current_size = HEADER_OVERHEAD;
    for entry in entries {
        let entry_size = ENTRY_OVERHEAD + entry.1.len();
        if !current.is_empty() && current_size + entry_size > max_size {
            chunks.push(std::mem::take(&mut current));
            current_size = HEADER_OVERHEAD;
        }
        current_size += entry_size;
        current.push(entry.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Assigns seqnos, reorders, drives retransmission and digest exchange
/// (spec §4.2).
pub struct NakAck {
    config: NakAckConfig,
    context: Arc<Context>,
    sent_table: SentTable,
    local_seqno: Mutex<Option<Seqno>>,
    windows: DashMap<Address, Arc<SenderWindow>>,
    rebroadcast: Mutex<Option<JoinHandle<()>>>,
    self_weak: Weak<NakAck>,
    /// Members `DISABLE_UNICASTS_TO` has opted out of unicast `XMIT_RSP`
    /// delivery for (spec §6); `handle_xmit_req` falls back to multicast
    /// for them even when `use_mcast_xmit` is otherwise off.
    disabled_unicasts: Mutex<HashSet<Address>>,
}

impl NakAck {
    pub fn new(config: NakAckConfig, context: Arc<Context>) -> Arc<Self> {
        Arc::new_cyclic(|weak| NakAck {
            config,
            context,
            sent_table: SentTable::new(),
            local_seqno: Mutex::new(None),
            windows: DashMap::new(),
            rebroadcast: Mutex::new(None),
            self_weak: weak.clone(),
            disabled_unicasts: Mutex::new(HashSet::new()),
        })
    }

    /// Number of entries currently retained in the local sent table.
    pub fn sent_table_len(&self) -> usize {
        self.sent_table.len()
    }

    fn retransmit_handle(&self) -> Arc<dyn RetransmitCommand> {
        Arc::new(RetransmitHandle(self.self_weak.clone()))
    }

    fn window_for(&self, sender: Address) -> Arc<SenderWindow> {
        self.windows
            .entry(sender)
            .or_insert_with(|| Arc::new(SenderWindow::new(sender, self.config.window.clone(), self.retransmit_handle())))
            .clone()
    }

    fn next_seqno(&self) -> Result<Seqno, NakAckError> {
        let mut guard = self.local_seqno.lock().unwrap();
        let next = match *guard {
            None => Seqno::ZERO,
            Some(s) => s.next().map_err(|_| WindowError::Wraparound)?,
        };
        *guard = Some(next);
        Ok(next)
    }

    /// `MSG, multicast` (spec §4.2): assigns the next seqno, attaches the
    /// header, and records the message in the sent table before it ever
    /// reaches the transport, so a send failure still leaves it
    /// recoverable via `XMIT_REQ` (spec §7).
    fn multicast(&self, msg: Message) -> Result<Message, NakAckError> {
        let seqno = self.next_seqno()?;
        let msg = msg.with_nakack(NakAckHeader::Msg { seqno });
        self.sent_table.append(seqno, msg.clone());
        Ok(msg)
    }

    /// `max_xmit_size`, overridden by a `CONFIG`-published `max_bundle_size`
    /// when the multiplexer has set one (spec §6: "A max_bundle_size
    /// parameter may be published via CONFIG and is read by NAKACK to
    /// size max_xmit_size").
    fn effective_max_xmit_size(&self) -> usize {
        self.context.config().max_bundle_size.unwrap_or(self.config.max_xmit_size)
    }

    fn random_live_member(&self, exclude: Address) -> Option<Address> {
        let view = self.context.view()?;
        let candidates: Vec<Address> = view.members().iter().copied().filter(|&a| a != exclude).collect();
        let mut rng = SmallRng::from_entropy();
        candidates.choose(&mut rng).copied()
    }

    /// Sends a targeted `XMIT_REQ`. Used both by a window's retransmit
    /// tasks (via [`RetransmitHandle`]) and by `STABLE`/`REBROADCAST` gap
    /// recovery.
    async fn send_xmit_req(&self, original_sender: Address, low: Seqno, high: Seqno) {
        let Some(local) = self.context.local_address() else { return };
        if original_sender == local {
            return;
        }
        let target = if self.config.xmit_from_random_member {
            self.random_live_member(local).unwrap_or(original_sender)
        } else {
            original_sender
        };
        let msg = Message::unicast(local, target, Vec::new()).with_nakack(NakAckHeader::XmitReq {
            low,
            high,
            original_sender,
        });
        if let Err(e) = self.context.transport.send(msg).await {
            tracing::debug!(error = %e, sender = %original_sender, "XMIT_REQ send failed, next backoff tick will retry");
        }
    }

    /// Upward delivery path shared by ordinary `MSG` frames and messages
    /// unbundled out of an `XMIT_RSP` (spec §4.2: "reinject each as a
    /// regular MSG event through up, so the normal in-order delivery path
    /// takes over").
    async fn receive(&self, source: Address, seqno: Seqno, msg: Message, oob: bool) -> Result<Vec<Event>, NakAckError> {
        if !self.context.is_server() {
            return Ok(Vec::new());
        }
        if let Some(view) = self.context.view() {
            if !view.contains(source) {
                tracing::warn!(sender = %source, "dropping MSG from a non-member");
                return Ok(Vec::new());
            }
        }
        let window = self.window_for(source);
        if !window.add(seqno, msg.clone(), oob) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        if oob {
            out.push(Event::Msg(msg));
        }
        out.extend(window.drain().await.into_iter().map(Event::Msg));
        Ok(out)
    }

    /// `MSG with NakAck/XMIT_REQ` (spec §4.2): looks up the requested
    /// range from either the sent table (if we are `originalSender`) or
    /// the remote sender's window, and replies with one or more bundled
    /// `XMIT_RSP` messages.
    async fn handle_xmit_req(&self, requester: Address, low: Seqno, high: Seqno, original_sender: Address) {
        let local = self.context.local_address();
        let mut entries = Vec::new();
        for raw in low.get()..=high.get() {
            let seqno = Seqno::new(raw);
            let found = if Some(original_sender) == local {
                self.sent_table.get(seqno)
            } else {
                self.windows.get(&original_sender).and_then(|w| w.get(seqno))
            };
            match found {
                Some(msg) => entries.push((seqno, msg.payload)),
                None => tracing::debug!(sender = %original_sender, seqno = raw, "missing message for XMIT_REQ, skipping"),
            }
        }
        if entries.is_empty() {
            return;
        }
        let Some(local) = local else { return };
        let unicasts_disabled = self.disabled_unicasts.lock().unwrap().contains(&requester);
        for chunk in bundle_chunks(&entries, self.effective_max_xmit_size()) {
            let chunk_low = chunk.first().unwrap().0;
            let chunk_high = chunk.last().unwrap().0;
            let payload = encode_bundle(original_sender, &chunk);
            let destination = if self.config.use_mcast_xmit || unicasts_disabled { None } else { Some(requester) };
            let msg = Message {
                source: local,
                destination,
                headers: crate::message::Headers::new().with_nakack(NakAckHeader::XmitRsp {
                    low: chunk_low,
                    high: chunk_high,
                }),
                payload,
                oob: false,
            };
            if let Err(e) = self.context.transport.send(msg).await {
                tracing::warn!(error = %e, "failed sending XMIT_RSP");
            }
        }
    }

    /// `MSG with NakAck/XMIT_RSP` (spec §4.2): demarshals the bundle and
    /// reinjects each contained message through [`NakAck::receive`].
    async fn handle_xmit_rsp(&self, payload: &[u8]) -> Result<Vec<Event>, NakAckError> {
        let (original_sender, entries) = decode_bundle(payload)?;
        let mut out = Vec::new();
        for (seqno, data) in entries {
            let msg = Message::multicast(original_sender, data).with_nakack(NakAckHeader::Msg { seqno });
            out.extend(self.receive(original_sender, seqno, msg, false).await?);
        }
        Ok(out)
    }

    /// `VIEW_CHANGE` / `TMP_VIEW` (spec §4.2): adds fresh windows for new
    /// members; a real `VIEW_CHANGE` additionally drops windows for
    /// members no longer present, while a `TMP_VIEW` never removes.
    async fn view_change(&self, new_view: View, may_remove: bool) {
        for &member in new_view.members() {
            self.windows
                .entry(member)
                .or_insert_with(|| Arc::new(SenderWindow::new(member, self.config.window.clone(), self.retransmit_handle())));
        }
        if may_remove {
            let keep: std::collections::HashSet<Address> = new_view.members().iter().copied().collect();
            self.windows.retain(|addr, _| keep.contains(addr));
        }
        self.context.set_view(new_view);
    }

    /// `SUSPECT(addr)` (spec §4.2): cancels any active rebroadcast so its
    /// caller is never left blocked forever.
    fn suspect(&self, _addr: Address) {
        if let Some(handle) = self.rebroadcast.lock().unwrap().take() {
            handle.abort();
            tracing::debug!("cancelling rebroadcast after SUSPECT");
        }
    }

    /// `DISCONNECT` (spec §4.2): resets local state entirely.
    fn disconnect(&self) {
        self.windows.clear();
        self.sent_table.reset();
        *self.local_seqno.lock().unwrap() = None;
        if let Some(handle) = self.rebroadcast.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// `STABLE(digest)` (spec §4.2): local entries in the sent table are
    /// truncated below `highDelivered - gcLag`; remote windows are told
    /// to drop delivered entries in the same band, and a lagging window
    /// is proactively asked to recover its last missing message.
    async fn stable(&self, digest: &Digest) {
        let local = self.context.local_address();
        let gc_lag = self.config.window.gc_lag;
        for (sender, entry) in digest.iter() {
            if Some(sender) == local {
                self.sent_table.truncate(entry.high_delivered.saturating_sub(gc_lag));
                continue;
            }
            let Some(window) = self.windows.get(&sender).map(|w| w.clone()) else {
                continue;
            };
            let my_high = window.highest_received();
            if entry.high_seen.get() > my_high.map_or(0, Seqno::get) {
                let low = my_high.and_then(|h| h.next().ok()).unwrap_or(Seqno::ZERO);
                self.send_xmit_req(sender, low, entry.high_seen).await;
            }
            window.stable(entry.high_delivered.saturating_sub(gc_lag));
        }
    }

    /// `GET_DIGEST` (spec §4.2): current digest with each sender's
    /// `highestReceived`.
    pub fn get_digest(&self) -> Digest {
        self.build_digest(false)
    }

    /// `GET_DIGEST_STABLE` (spec §4.2): current digest with each sender's
    /// `highestDelivered` substituted for `highestReceived`.
    pub fn get_digest_stable(&self) -> Digest {
        self.build_digest(true)
    }

    fn build_digest(&self, stable: bool) -> Digest {
        let mut digest = Digest::new();
        if let Some(local) = self.context.local_address() {
            let seqno = self.local_seqno.lock().unwrap().unwrap_or(Seqno::ZERO);
            digest.set(local, DigestEntry::new(Seqno::ZERO, seqno, seqno));
        }
        for entry in self.windows.iter() {
            let mut e = entry.value().digest_entry();
            if stable {
                e.high_seen = e.high_delivered;
            }
            digest.set(*entry.key(), e);
        }
        digest
    }

    /// `SET_DIGEST` (spec §4.2): replaces every sender window with a
    /// fresh one initialised at the digest's `highestDelivered`.
    pub fn set_digest(&self, digest: &Digest) {
        self.windows.clear();
        let local = self.context.local_address();
        for (sender, entry) in digest.iter() {
            if Some(sender) == local {
                continue;
            }
            let start_at = entry.high_delivered.next().unwrap_or(entry.high_delivered);
            self.windows
                .insert(sender, Arc::new(SenderWindow::starting_at(sender, self.config.window.clone(), self.retransmit_handle(), start_at)));
        }
    }

    /// `MERGE_DIGEST` (spec §4.2): creates a window at the digest's high
    /// for senders we don't know yet; replaces an existing window only if
    /// it lags behind the digest's `highestReceived`.
    pub fn merge_digest(&self, digest: &Digest) {
        let local = self.context.local_address();
        for (sender, entry) in digest.iter() {
            if Some(sender) == local {
                continue;
            }
            let start_at = entry.high_delivered.next().unwrap_or(entry.high_delivered);
            let needs_replace = match self.windows.get(&sender).map(|w| w.highest_received()) {
                None => true,
                Some(high) => high.map_or(true, |h| h < entry.high_seen),
            };
            if needs_replace {
                self.windows
                    .insert(sender, Arc::new(SenderWindow::starting_at(sender, self.config.window.clone(), self.retransmit_handle(), start_at)));
            }
        }
    }

    /// `REBROADCAST(targetDigest)` (spec §4.2): repeatedly compares the
    /// local digest to `target` and issues `XMIT_REQ`s for every gap,
    /// until the local digest dominates the target or
    /// `maxRebroadcastTimeout` elapses. Cancelled externally by `SUSPECT`
    /// or `DISCONNECT` aborting the spawned task in
    /// [`NakAck::spawn_rebroadcast`].
    pub async fn rebroadcast(&self, target: Digest) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.max_rebroadcast_timeout;
        loop {
            let local_digest = self.get_digest_stable();
            if local_digest.dominates(&target) {
                return true;
            }
            for (sender, their) in target.iter() {
                if Some(sender) == self.context.local_address() {
                    continue;
                }
                let ours = local_digest.get(sender).map(|e| e.high_seen).unwrap_or(Seqno::ZERO);
                if their.high_seen > ours {
                    let low = ours.next().unwrap_or(ours);
                    self.send_xmit_req(sender, low, their.high_seen).await;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.rebroadcast_interval).await;
        }
    }

    /// Spawns [`NakAck::rebroadcast`] as a dedicated background task
    /// (spec §9, "spawn a dedicated worker task per activity"), replacing
    /// whatever rebroadcast was previously running.
    fn spawn_rebroadcast(&self, target: Digest) {
        let Some(nakack) = self.self_weak.upgrade() else { return };
        let mut guard = self.rebroadcast.lock().unwrap();
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(tokio::spawn(async move {
            let done = nakack.rebroadcast(target).await;
            tracing::debug!(done, "rebroadcast pass finished");
        }));
    }
}

#[async_trait]
impl Protocol for NakAck {
    async fn handle_down(&self, event: Event, _ctx: &Context) -> Result<Vec<Event>, PipelineError> {
        match event {
            Event::Msg(msg) => {
                if !msg.is_multicast() {
                    if let Err(e) = self.context.transport.send(msg).await {
                        tracing::warn!(error = %e, "transport send failed");
                    }
                    return Ok(Vec::new());
                }
                let msg = self.multicast(msg)?;
                if let Err(e) = self.context.transport.send(msg.clone()).await {
                    tracing::warn!(error = %e, "transport send failed; message remains in the sent table for recovery");
                }
                // Real multicast transports never loop a broadcast back to
                // its own sender (`transport::testing::LoopbackNetwork`
                // excludes `self.local` the same way), but virtual
                // synchrony requires the sender to deliver its own
                // messages in the same FIFO order as everyone else (spec
                // §1, scenario S1: "A delivers the same [messages]").
                // Feed the just-stamped message through the ordinary
                // receive path exactly as an incoming MSG would be.
                let NakAckHeader::Msg { seqno } = *msg.headers.nakack().expect("just attached by multicast()") else {
                    unreachable!("multicast() always attaches a NakAckHeader::Msg header")
                };
                Ok(self.receive(msg.source, seqno, msg, false).await?)
            }
            Event::Stable(digest) => {
                self.stable(&digest).await;
                Ok(Vec::new())
            }
            Event::Rebroadcast(target) => {
                self.spawn_rebroadcast(target);
                Ok(Vec::new())
            }
            Event::Disconnect => {
                self.disconnect();
                Ok(Vec::new())
            }
            Event::GetDigest(reply) => {
                let _ = reply.send(self.get_digest());
                Ok(Vec::new())
            }
            Event::GetDigestStable(reply) => {
                let _ = reply.send(self.get_digest_stable());
                Ok(Vec::new())
            }
            Event::SetDigest(digest) => {
                self.set_digest(&digest);
                Ok(Vec::new())
            }
            Event::MergeDigest(digest) => {
                self.merge_digest(&digest);
                Ok(Vec::new())
            }
            Event::SetLocalAddress(addr) => {
                self.context.set_local_address(addr);
                Ok(Vec::new())
            }
            Event::BecomeServer => {
                tracing::debug!("BECOME_SERVER");
                Ok(Vec::new())
            }
            Event::EnableUnicastsTo(addr) => {
                self.disabled_unicasts.lock().unwrap().remove(&addr);
                Ok(Vec::new())
            }
            Event::DisableUnicastsTo(addr) => {
                self.disabled_unicasts.lock().unwrap().insert(addr);
                Ok(Vec::new())
            }
            other => Ok(vec![other]),
        }
    }

    async fn handle_up(&self, event: Event, _ctx: &Context) -> Result<Vec<Event>, PipelineError> {
        match event {
            Event::Msg(msg) => {
                let Some(header) = msg.headers.nakack().copied() else {
                    return Ok(vec![Event::Msg(msg)]);
                };
                match header {
                    NakAckHeader::Msg { seqno } => Ok(self.receive(msg.source, seqno, msg.clone(), msg.oob).await?),
                    NakAckHeader::XmitReq { low, high, original_sender } => {
                        self.handle_xmit_req(msg.source, low, high, original_sender).await;
                        Ok(Vec::new())
                    }
                    NakAckHeader::XmitRsp { .. } => Ok(self.handle_xmit_rsp(&msg.payload).await?),
                }
            }
            Event::ViewChange(view) => {
                self.view_change(view.clone(), true).await;
                Ok(vec![Event::ViewChange(view)])
            }
            Event::TmpView(view) => {
                self.view_change(view.clone(), false).await;
                Ok(vec![Event::TmpView(view)])
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
    use crate::config::StackConfig;
    use crate::transport::testing::{LoopbackNetwork, ManualFailureDetector};
    use crate::view::ViewId;

    fn context(network: &Arc<LoopbackNetwork>, local: Address) -> Arc<Context> {
        let transport = Arc::new(crate::transport::testing::LoopbackTransport::new(network.clone(), local));
        Arc::new(Context::new(transport, ManualFailureDetector::new()))
    }

    fn install_view(ctx: &Context, members: Vec<Address>) {
        ctx.set_local_address(members[0]);
        ctx.set_view(View::new(ViewId::new(members[0], 1), members));
    }

    #[tokio::test]
    async fn multicast_assigns_increasing_seqnos_and_fills_sent_table() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let b = Address::new(2);
        network.register(a);
        let mut rx_b = network.register(b);
        let ctx = context(&network, a);
        install_view(&ctx, vec![a, b]);
        ctx.set_config(StackConfig::default());

        let nakack = NakAck::new(NakAckConfig::default(), ctx.clone());
        for payload in ["m1", "m2", "m3"] {
            nakack
                .handle_down(Event::Msg(Message::multicast(a, payload.as_bytes().to_vec())), &ctx)
                .await
                .unwrap();
        }

        for expected in [0u64, 1, 2] {
            let msg = rx_b.recv().await.unwrap();
            assert_eq!(msg.headers.nakack(), Some(&NakAckHeader::Msg { seqno: Seqno::new(expected) }));
        }
    }

    #[tokio::test]
    async fn receive_delivers_in_order_and_detects_a_gap() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let b = Address::new(2);
        network.register(a);
        network.register(b);
        let ctx = context(&network, b);
        install_view(&ctx, vec![a, b]);

        let nakack = NakAck::new(NakAckConfig::default(), ctx.clone());

        let msg0 = Message::multicast(a, b"m1".to_vec()).with_nakack(NakAckHeader::Msg { seqno: Seqno::new(0) });
        let msg2 = Message::multicast(a, b"m3".to_vec()).with_nakack(NakAckHeader::Msg { seqno: Seqno::new(2) });

        let delivered = nakack.handle_up(Event::Msg(msg0), &ctx).await.unwrap();
        assert_eq!(delivered.len(), 1);

        let delivered = nakack.handle_up(Event::Msg(msg2), &ctx).await.unwrap();
        assert!(delivered.is_empty(), "seqno 1 is still missing");

        let msg1 = Message::multicast(a, b"m2".to_vec()).with_nakack(NakAckHeader::Msg { seqno: Seqno::new(1) });
        let delivered = nakack.handle_up(Event::Msg(msg1), &ctx).await.unwrap();
        assert_eq!(delivered.len(), 2, "filling the gap releases seqno 1 and 2");
    }

    #[tokio::test]
    async fn message_from_non_member_is_dropped() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let b = Address::new(2);
        let outsider = Address::new(99);
        network.register(a);
        network.register(b);
        let ctx = context(&network, b);
        install_view(&ctx, vec![a, b]);

        let nakack = NakAck::new(NakAckConfig::default(), ctx.clone());
        let msg = Message::multicast(outsider, b"x".to_vec()).with_nakack(NakAckHeader::Msg { seqno: Seqno::new(0) });
        let delivered = nakack.handle_up(Event::Msg(msg), &ctx).await.unwrap();
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn xmit_req_is_answered_with_a_bundled_xmit_rsp() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let c = Address::new(3);
        network.register(a);
        let mut rx_c = network.register(c);
        let ctx = context(&network, a);
        install_view(&ctx, vec![a, c]);

        let nakack = NakAck::new(NakAckConfig::default(), ctx.clone());
        for payload in ["m1", "m2", "m3"] {
            nakack
                .handle_down(Event::Msg(Message::multicast(a, payload.as_bytes().to_vec())), &ctx)
                .await
                .unwrap();
            rx_c.try_recv().ok();
        }

        let req = Message::unicast(c, a, Vec::new()).with_nakack(NakAckHeader::XmitReq {
            low: Seqno::new(1),
            high: Seqno::new(2),
            original_sender: a,
        });
        nakack.handle_up(Event::Msg(req), &ctx).await.unwrap();

        let rsp = rx_c.recv().await.unwrap();
        let NakAckHeader::XmitRsp { low, high } = rsp.headers.nakack().copied().unwrap() else {
            panic!("expected XMIT_RSP");
        };
        assert_eq!((low, high), (Seqno::new(1), Seqno::new(2)));
    }

    #[tokio::test]
    async fn xmit_rsp_unbundles_and_delivers_in_order() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        let c = Address::new(3);
        network.register(a);
        network.register(c);
        let ctx = context(&network, c);
        install_view(&ctx, vec![a, c]);

        let nakack = NakAck::new(NakAckConfig::default(), ctx.clone());
        let bundle = encode_bundle(a, &[(Seqno::new(0), b"m1".to_vec()), (Seqno::new(1), b"m2".to_vec())]);
        let rsp = Message::unicast(a, c, bundle).with_nakack(NakAckHeader::XmitRsp { low: Seqno::new(0), high: Seqno::new(1) });

        let delivered = nakack.handle_up(Event::Msg(rsp), &ctx).await.unwrap();
        assert_eq!(delivered.len(), 2);
    }

    #[tokio::test]
    async fn stable_truncates_local_sent_table() {
        let network = LoopbackNetwork::new();
        let a = Address::new(1);
        network.register(a);
        let ctx = context(&network, a);
        install_view(&ctx, vec![a]);

        let mut config = NakAckConfig::default();
        config.window.gc_lag = 0;
        let nakack = NakAck::new(config, ctx.clone());
        for payload in ["m1", "m2", "m3"] {
            nakack
                .handle_down(Event::Msg(Message::multicast(a, payload.as_bytes().to_vec())), &ctx)
                .await
                .unwrap();
        }
        assert_eq!(nakack.sent_table.len(), 3);

        let mut digest = Digest::new();
        digest.set(a, DigestEntry::new(Seqno::ZERO, Seqno::new(2), Seqno::new(2)));
        nakack.handle_down(Event::Stable(digest), &ctx).await.unwrap();
        assert_eq!(nakack.sent_table.len(), 1, "only seqno 2 (> high_delivered - gc_lag) survives");
    }

    #[test]
    fn bundle_round_trips() {
        let a = Address::new(7);
        let entries = vec![(Seqno::new(0), b"hello".to_vec()), (Seqno::new(1), b"world".to_vec())];
        let encoded = encode_bundle(a, &entries);
        let (decoded_sender, decoded_entries) = decode_bundle(&encoded).unwrap();
        assert_eq!(decoded_sender, a);
        assert_eq!(decoded_entries, entries);
    }
}
