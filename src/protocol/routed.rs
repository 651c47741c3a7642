//! Routing header prepended to every routed payload.
//!
//! ```text
//! ┌──────┬────────┬──────┬────┬───────┬─────────┐
//! │ DEST │ SOURCE │ HOPS │ ID │ FLAGS │ payload │
//! └──────┴────────┴──────┴────┴───────┴─────────┘
//! ```
//!
//! It travels inside the datagram payload, so the datagram header carries
//! the current hop while this header carries the end-to-end addresses.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::header::Address;

/// Length of the routing header.
pub const ROUTED_HEADER_LEN: usize = 5;

/// End-to-end routing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutedHeader {
    /// Final destination.
    pub dest: Address,
    /// Originating node.
    pub source: Address,
    /// Hops travelled so far.
    pub hops: u8,
    /// End-to-end message id.
    pub id: u8,
    /// Application-specific flags (low nibble only).
    pub flags: u8,
}

impl RoutedHeader {
    /// Encodes the header followed by `payload`.
    #[must_use]
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(ROUTED_HEADER_LEN + payload.len());
        buf.put_u8(self.dest);
        buf.put_u8(self.source);
        buf.put_u8(self.hops);
        buf.put_u8(self.id);
        buf.put_u8(self.flags);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Splits a routed message into its header and payload.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<(Self, &[u8])> {
        if data.len() < ROUTED_HEADER_LEN {
            return None;
        }
        let header = Self {
            dest: data[0],
            source: data[1],
            hops: data[2],
            id: data[3],
            flags: data[4],
        };
        Some((header, &data[ROUTED_HEADER_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routed_header_layout() {
        let header = RoutedHeader {
            dest: 4,
            source: 1,
            hops: 2,
            id: 9,
            flags: 0x03,
        };
        let message = header.encode(b"data");
        assert_eq!(&message[..], &[4, 1, 2, 9, 3, b'd', b'a', b't', b'a']);

        let (decoded, payload) = RoutedHeader::decode(&message).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"data");
    }

    #[test]
    fn test_decode_too_short() {
        assert!(RoutedHeader::decode(&[1, 2, 3, 4]).is_none());
    }
}
