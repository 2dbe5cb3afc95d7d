//! Wire headers for the NAKACK and FLUSH protocols.
//!
//! Encoding follows the grounding crate's manual, self-describing
//! byte-layout style (a leading type tag followed by fixed-width fields),
//! the same approach used for parsing TCP segments: no serde, no derive
//! magic, just explicit `to_be_bytes`/`from_be_bytes` round trips.

use crate::address::Address;
use crate::seqno::Seqno;
use crate::view::ViewId;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header was truncated before all fields could be read")]
    Truncated,
    #[error("unrecognized header type tag: {0}")]
    UnknownTag(u8),
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, HeaderError> {
        let b = *self.bytes.get(self.pos).ok_or(HeaderError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u64(&mut self) -> Result<u64, HeaderError> {
        let end = self.pos + 8;
        let slice = self.bytes.get(self.pos..end).ok_or(HeaderError::Truncated)?;
        self.pos = end;
        Ok(u64::from_be_bytes(slice.try_into().unwrap()))
    }

    fn address(&mut self) -> Result<Address, HeaderError> {
        Ok(Address::new(self.u64()?))
    }

    fn seqno(&mut self) -> Result<Seqno, HeaderError> {
        Ok(Seqno::new(self.u64()?))
    }

    fn view_id(&mut self) -> Result<ViewId, HeaderError> {
        let coordinator = self.address()?;
        let counter = self.u64()?;
        Ok(ViewId::new(coordinator, counter))
    }

    fn address_list(&mut self) -> Result<Vec<Address>, HeaderError> {
        let len = self.u64()? as usize;
        (0..len).map(|_| self.address()).collect()
    }
}

fn push_view_id(buf: &mut Vec<u8>, view_id: ViewId) {
    buf.extend_from_slice(&view_id.coordinator.into_inner().to_be_bytes());
    buf.extend_from_slice(&view_id.counter.to_be_bytes());
}

fn push_address_list(buf: &mut Vec<u8>, addrs: &[Address]) {
    buf.extend_from_slice(&(addrs.len() as u64).to_be_bytes());
    for a in addrs {
        buf.extend_from_slice(&a.into_inner().to_be_bytes());
    }
}

/// `type:byte, seqno:int64, high:int64, originalSender:Address` per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakAckHeader {
    Msg { seqno: Seqno },
    XmitReq { low: Seqno, high: Seqno, original_sender: Address },
    XmitRsp { low: Seqno, high: Seqno },
}

impl NakAckHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(25);
        match *self {
            NakAckHeader::Msg { seqno } => {
                buf.push(0);
                buf.extend_from_slice(&seqno.get().to_be_bytes());
            }
            NakAckHeader::XmitReq { low, high, original_sender } => {
                buf.push(1);
                buf.extend_from_slice(&low.get().to_be_bytes());
                buf.extend_from_slice(&high.get().to_be_bytes());
                buf.extend_from_slice(&original_sender.into_inner().to_be_bytes());
            }
            NakAckHeader::XmitRsp { low, high } => {
                buf.push(2);
                buf.extend_from_slice(&low.get().to_be_bytes());
                buf.extend_from_slice(&high.get().to_be_bytes());
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        let mut r = ByteReader::new(bytes);
        match r.u8()? {
            0 => Ok(NakAckHeader::Msg { seqno: r.seqno()? }),
            1 => {
                let low = r.seqno()?;
                let high = r.seqno()?;
                let original_sender = r.address()?;
                Ok(NakAckHeader::XmitReq { low, high, original_sender })
            }
            2 => {
                let low = r.seqno()?;
                let high = r.seqno()?;
                Ok(NakAckHeader::XmitRsp { low, high })
            }
            other => Err(HeaderError::UnknownTag(other)),
        }
    }
}

/// `type:byte, viewId:int64, participants:list<Address>` per spec §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushHeader {
    StartFlush { view_id: ViewId, participants: Vec<Address> },
    FlushOk { view_id: ViewId },
    FlushCompleted { view_id: ViewId },
    StopFlush { view_id: ViewId },
}

impl FlushHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        match self {
            FlushHeader::StartFlush { view_id, participants } => {
                buf.push(0);
                push_view_id(&mut buf, *view_id);
                push_address_list(&mut buf, participants);
            }
            FlushHeader::FlushOk { view_id } => {
                buf.push(1);
                push_view_id(&mut buf, *view_id);
            }
            FlushHeader::FlushCompleted { view_id } => {
                buf.push(2);
                push_view_id(&mut buf, *view_id);
            }
            FlushHeader::StopFlush { view_id } => {
                buf.push(3);
                push_view_id(&mut buf, *view_id);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        let mut r = ByteReader::new(bytes);
        match r.u8()? {
            0 => {
                let view_id = r.view_id()?;
                let participants = r.address_list()?;
                Ok(FlushHeader::StartFlush { view_id, participants })
            }
            1 => Ok(FlushHeader::FlushOk { view_id: r.view_id()? }),
            2 => Ok(FlushHeader::FlushCompleted { view_id: r.view_id()? }),
            3 => Ok(FlushHeader::StopFlush { view_id: r.view_id()? }),
            other => Err(HeaderError::UnknownTag(other)),
        }
    }

    pub fn view_id(&self) -> ViewId {
        match *self {
            FlushHeader::StartFlush { view_id, .. }
            | FlushHeader::FlushOk { view_id }
            | FlushHeader::FlushCompleted { view_id }
            | FlushHeader::StopFlush { view_id } => view_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nakack_header_round_trips() {
        let headers = [
            NakAckHeader::Msg { seqno: Seqno::new(42) },
            NakAckHeader::XmitReq {
                low: Seqno::new(1),
                high: Seqno::new(9),
                original_sender: Address::new(7),
            },
            NakAckHeader::XmitRsp { low: Seqno::new(1), high: Seqno::new(9) },
        ];
        for h in headers {
            assert_eq!(NakAckHeader::decode(&h.encode()).unwrap(), h);
        }
    }

    #[test]
    fn flush_header_round_trips() {
        let view_id = ViewId::new(Address::new(1), 3);
        let headers = vec![
            FlushHeader::StartFlush {
                view_id,
                participants: vec![Address::new(1), Address::new(2), Address::new(3)],
            },
            FlushHeader::FlushOk { view_id },
            FlushHeader::FlushCompleted { view_id },
            FlushHeader::StopFlush { view_id },
        ];
        for h in headers {
            assert_eq!(FlushHeader::decode(&h.encode()).unwrap(), h);
        }
    }

    #[test]
    fn truncated_header_is_an_error_not_a_panic() {
        assert_eq!(NakAckHeader::decode(&[0, 1, 2]), Err(HeaderError::Truncated));
        assert_eq!(NakAckHeader::decode(&[9]), Err(HeaderError::UnknownTag(9)));
    }
}
