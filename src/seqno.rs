//! Per-sender monotonic sequence numbers.

use std::fmt;
use thiserror::Error;

/// A 64-bit, strictly monotonic per-sender sequence number.
///
/// Seqnos start at 0 and must never wrap; [`Seqno::next`] reports
/// wraparound as an error rather than silently overflowing (see spec §8,
/// "seqno wraparound at 2^63 must not [happen]").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Seqno(u64);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SeqnoError {
    #[error("sequence number space exhausted")]
    Wraparound,
}

impl Seqno {
    pub const ZERO: Seqno = Seqno(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number, or an error if the counter would
    /// wrap around `u64::MAX`.
    pub fn next(self) -> Result<Seqno, SeqnoError> {
        self.0.checked_add(1).map(Seqno).ok_or(SeqnoError::Wraparound)
    }

    /// Returns `self - amount`, saturating at zero. Used for gc-lag math.
    pub fn saturating_sub(self, amount: u64) -> Seqno {
        Seqno(self.0.saturating_sub(amount))
    }
}

impl From<u64> for Seqno {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Seqno> for u64 {
    fn from(s: Seqno) -> Self {
        s.0
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraparound_is_an_error_not_ub() {
        let max = Seqno::new(u64::MAX);
        assert_eq!(max.next(), Err(SeqnoError::Wraparound));
    }

    #[test]
    fn ordinary_increment() {
        assert_eq!(Seqno::ZERO.next(), Ok(Seqno::new(1)));
    }
}
