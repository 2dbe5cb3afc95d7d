//! NAKACK's table of messages this process has multicast itself.

use crate::message::Message;
use crate::seqno::Seqno;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// An ordered `seqno -> message` mapping, guarded by its own mutex
/// (spec §5: "Sent table: guarded by its own mutex. Writers: sender
/// (append), stable (truncate), reset.").
#[derive(Default)]
pub struct SentTable {
    entries: Mutex<BTreeMap<u64, Message>>,
}

impl SentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, seqno: Seqno, message: Message) {
        self.entries.lock().unwrap().insert(seqno.get(), message);
    }

    pub fn get(&self, seqno: Seqno) -> Option<Message> {
        self.entries.lock().unwrap().get(&seqno.get()).cloned()
    }

    /// Truncates entries with seqno `<= up_to`.
    pub fn truncate(&self, up_to: Seqno) {
        let up_to = up_to.get();
        self.entries.lock().unwrap().retain(|&seqno, _| seqno > up_to);
    }

    pub fn reset(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn range(&self, low: Seqno, high: Seqno) -> Vec<(Seqno, Message)> {
        self.entries
            .lock()
            .unwrap()
            .range(low.get()..=high.get())
            .map(|(&s, m)| (Seqno::new(s), m.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    #[test]
    fn truncate_drops_everything_at_or_below_the_bound() {
        let table = SentTable::new();
        let src = Address::new(1);
        for i in 0..5 {
            table.append(Seqno::new(i), Message::multicast(src, b"x".to_vec()));
        }
        table.truncate(Seqno::new(2));
        assert!(table.get(Seqno::new(2)).is_none());
        assert!(table.get(Seqno::new(3)).is_some());
        assert_eq!(table.len(), 2);
    }
}
