//! Per-sender digests used to synchronise state after joins and merges.

use crate::address::Address;
use crate::seqno::Seqno;
use rustc_hash::FxHashMap;

/// A single sender's summary: the lowest retained seqno, the highest one
/// delivered to the application, and the highest one received at all
/// (possibly out of order and not yet delivered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestEntry {
    pub low_retained: Seqno,
    pub high_delivered: Seqno,
    pub high_seen: Seqno,
}

impl DigestEntry {
    pub const fn new(low_retained: Seqno, high_delivered: Seqno, high_seen: Seqno) -> Self {
        Self {
            low_retained,
            high_delivered,
            high_seen,
        }
    }
}

/// A mapping `Address -> DigestEntry`, exchanged to synchronise state
/// after joins and merges and to guide rebroadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Digest(FxHashMap<Address, DigestEntry>);

impl Digest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, sender: Address, entry: DigestEntry) {
        self.0.insert(sender, entry);
    }

    pub fn get(&self, sender: Address) -> Option<DigestEntry> {
        self.0.get(&sender).copied()
    }

    pub fn remove(&mut self, sender: Address) {
        self.0.remove(&sender);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, DigestEntry)> + '_ {
        self.0.iter().map(|(&a, &e)| (a, e))
    }

    pub fn senders(&self) -> impl Iterator<Item = Address> + '_ {
        self.0.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Combines two digests entrywise: the result's `high_delivered` and
    /// `high_seen` are the max of both inputs (so it dominates both), and
    /// `low_retained` is the min (conservative: never claim to have
    /// discarded more than either side actually has).
    ///
    /// `merge(d, d) == d`, and `merge(a, b)` dominates both `a` and `b`.
    pub fn merge(&self, other: &Digest) -> Digest {
        let mut out = self.clone();
        for (sender, entry) in other.0.iter() {
            out.0
                .entry(*sender)
                .and_modify(|existing| {
                    existing.low_retained = existing.low_retained.min(entry.low_retained);
                    existing.high_delivered = existing.high_delivered.max(entry.high_delivered);
                    existing.high_seen = existing.high_seen.max(entry.high_seen);
                })
                .or_insert(*entry);
        }
        out
    }

    /// `self.dominates(other)` holds when, for every sender `other` knows
    /// about, `self` has an entry whose high-water marks are pointwise `>=`
    /// `other`'s. Senders present only in `self` don't affect the result;
    /// senders in `other` but missing from `self` make it incomparable
    /// (return `false`).
    pub fn dominates(&self, other: &Digest) -> bool {
        other.0.iter().all(|(sender, their)| {
            self.0.get(sender).is_some_and(|ours| {
                ours.high_delivered >= their.high_delivered && ours.high_seen >= their.high_seen
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(low: u64, hd: u64, hs: u64) -> DigestEntry {
        DigestEntry::new(Seqno::new(low), Seqno::new(hd), Seqno::new(hs))
    }

    #[test]
    fn merge_is_idempotent() {
        let mut d = Digest::new();
        d.set(Address::new(1), entry(0, 5, 5));
        assert_eq!(d.merge(&d), d);
    }

    #[test]
    fn merge_dominates_both_inputs() {
        let mut d1 = Digest::new();
        d1.set(Address::new(1), entry(0, 5, 5));
        d1.set(Address::new(2), entry(0, 1, 1));

        let mut d2 = Digest::new();
        d2.set(Address::new(1), entry(0, 3, 8));
        d2.set(Address::new(3), entry(0, 2, 2));

        let merged = d1.merge(&d2);
        assert!(merged.dominates(&d1));
        assert!(merged.dominates(&d2));

        let combined = merged.get(Address::new(1)).unwrap();
        assert_eq!(combined.high_delivered, Seqno::new(5));
        assert_eq!(combined.high_seen, Seqno::new(8));
    }

    #[test]
    fn missing_sender_is_not_dominated() {
        let mut d1 = Digest::new();
        d1.set(Address::new(1), entry(0, 5, 5));
        let mut d2 = Digest::new();
        d2.set(Address::new(2), entry(0, 1, 1));
        assert!(!d1.dominates(&d2));
    }
}
