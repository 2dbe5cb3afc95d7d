//! Process identifiers.

use const_fnv1a_hash::fnv1a_hash_64;
use std::fmt;

/// An opaque, comparable, hashable identifier for a process in the cluster.
///
/// Ordering is a plain numeric comparison; the smallest `Address` in a
/// [`View`](crate::view::View) is always the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address {
    /// Creates an address from a raw numeric identifier.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Creates a pseudorandom address by hashing a stable process name.
    ///
    /// Two calls with the same `name` always yield the same `Address`, which
    /// is convenient for tests and for processes that know their own logical
    /// name ahead of time (e.g. `"node-1"`).
    pub fn from_name(name: &str) -> Self {
        Self(fnv1a_hash_64(name.as_bytes(), None))
    }

    /// Returns the underlying numeric identifier.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<u64> for Address {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<Address> for u64 {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_picks_smallest_as_coordinator() {
        let a = Address::new(1);
        let b = Address::new(2);
        assert!(a < b);
        assert_eq!([a, b].iter().min().copied(), Some(a));
    }

    #[test]
    fn from_name_is_stable() {
        assert_eq!(Address::from_name("node-1"), Address::from_name("node-1"));
        assert_ne!(Address::from_name("node-1"), Address::from_name("node-2"));
    }
}
