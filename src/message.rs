//! The [`Message`] envelope passed up and down the pipeline.

use crate::address::Address;
use crate::headers::{FlushHeader, NakAckHeader};
use rustc_hash::FxHashMap;

/// The protocol names used as keys into a message's [`Headers`] map.
pub const NAKACK: &str = "NAKACK";
pub const FLUSH: &str = "FLUSH";

/// A typed header record attached by one of the two core protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    NakAck(NakAckHeader),
    Flush(FlushHeader),
}

/// A mapping from protocol name to typed header record (spec §3).
///
/// A message not meant for a given layer simply has no entry under that
/// layer's name, and is passed through unchanged (spec §7, "header absent
/// on MSG").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(FxHashMap<&'static str, HeaderValue>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nakack(mut self, header: NakAckHeader) -> Self {
        self.0.insert(NAKACK, HeaderValue::NakAck(header));
        self
    }

    pub fn with_flush(mut self, header: FlushHeader) -> Self {
        self.0.insert(FLUSH, HeaderValue::Flush(header));
        self
    }

    pub fn nakack(&self) -> Option<&NakAckHeader> {
        match self.0.get(NAKACK) {
            Some(HeaderValue::NakAck(h)) => Some(h),
            _ => None,
        }
    }

    pub fn flush(&self) -> Option<&FlushHeader> {
        match self.0.get(FLUSH) {
            Some(HeaderValue::Flush(h)) => Some(h),
            _ => None,
        }
    }
}

/// `(source, destination, headers, payload)` per spec §3. `destination ==
/// None` means multicast to the whole view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: Address,
    pub destination: Option<Address>,
    pub headers: Headers,
    pub payload: Vec<u8>,
    /// Exempts this message from per-sender FIFO ordering: NAKACK still
    /// tracks it for gap detection but dispatches it upward immediately
    /// instead of queuing it behind an outstanding gap (spec §4.1, §4.2).
    pub oob: bool,
}

impl Message {
    pub fn multicast(source: Address, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            destination: None,
            headers: Headers::new(),
            payload: payload.into(),
            oob: false,
        }
    }

    pub fn unicast(source: Address, destination: Address, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            destination: Some(destination),
            headers: Headers::new(),
            payload: payload.into(),
            oob: false,
        }
    }

    pub fn is_multicast(&self) -> bool {
        self.destination.is_none()
    }

    pub fn with_nakack(mut self, header: NakAckHeader) -> Self {
        self.headers = self.headers.with_nakack(header);
        self
    }

    pub fn with_flush(mut self, header: FlushHeader) -> Self {
        self.headers = self.headers.with_flush(header);
        self
    }

    pub fn as_oob(mut self) -> Self {
        self.oob = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seqno::Seqno;

    #[test]
    fn header_absent_leaves_message_untouched() {
        let msg = Message::multicast(Address::new(1), b"hi".to_vec());
        assert!(msg.headers.nakack().is_none());
        assert!(msg.headers.flush().is_none());
    }

    #[test]
    fn headers_round_trip_through_the_map() {
        let msg = Message::multicast(Address::new(1), b"hi".to_vec())
            .with_nakack(NakAckHeader::Msg { seqno: Seqno::new(3) });
        assert_eq!(msg.headers.nakack(), Some(&NakAckHeader::Msg { seqno: Seqno::new(3) }));
        assert!(msg.headers.flush().is_none());
    }
}
