//! Mesh message codec.
//!
//! The first octet of every routed mesh payload names its type:
//!
//! ```text
//! Application:        [0, payload...]
//! Discovery request:  [1, discovery_id, dest, route...]
//! Discovery response: [2, discovery_id, dest, route...]
//! Route failure:      [3, dest]
//! ```
//!
//! `route` lists the nodes a discovery request passed through on its way
//! out, not counting the node that started it.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::Address;

/// Mesh message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Application payload.
    Application = 0,
    /// Flooded request for a route to a node.
    RouteDiscoveryRequest = 1,
    /// Reply from the node that was looked for.
    RouteDiscoveryResponse = 2,
    /// A relay could not forward towards a node.
    RouteFailure = 3,
}

impl MessageType {
    /// Try to convert a byte to a message type.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Application),
            1 => Some(Self::RouteDiscoveryRequest),
            2 => Some(Self::RouteDiscoveryResponse),
            3 => Some(Self::RouteFailure),
            _ => None,
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as Self
    }
}

/// Body of a discovery request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// Per-originator discovery number.
    pub discovery_id: u8,
    /// The node being looked for.
    pub dest: Address,
    /// Relays passed so far.
    pub route: Vec<Address>,
}

/// A decoded mesh payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshFrame {
    /// Application payload.
    Application(Bytes),
    /// Flooded route request.
    DiscoveryRequest(Discovery),
    /// Answer from the requested node.
    DiscoveryResponse(Discovery),
    /// `dest` can no longer be reached through the sender.
    RouteFailure { dest: Address },
}

impl MeshFrame {
    /// The type octet this frame is sent with.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Application(_) => MessageType::Application,
            Self::DiscoveryRequest(_) => MessageType::RouteDiscoveryRequest,
            Self::DiscoveryResponse(_) => MessageType::RouteDiscoveryResponse,
            Self::RouteFailure { .. } => MessageType::RouteFailure,
        }
    }

    /// Encodes the frame as a routed payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.message_type().into());
        match self {
            Self::Application(payload) => buf.put_slice(payload),
            Self::DiscoveryRequest(discovery) | Self::DiscoveryResponse(discovery) => {
                buf.put_u8(discovery.discovery_id);
                buf.put_u8(discovery.dest);
                buf.put_slice(&discovery.route);
            }
            Self::RouteFailure { dest } => buf.put_u8(*dest),
        }
        buf.freeze()
    }

    /// Decodes a routed payload.
    ///
    /// Returns `None` for an unknown type or a truncated body.
    #[must_use]
    pub fn decode(data: &Bytes) -> Option<Self> {
        let (&kind, body) = data.split_first()?;
        match MessageType::from_byte(kind)? {
            MessageType::Application => Some(Self::Application(data.slice(1..))),
            MessageType::RouteDiscoveryRequest => Self::discovery(body).map(Self::DiscoveryRequest),
            MessageType::RouteDiscoveryResponse => {
                Self::discovery(body).map(Self::DiscoveryResponse)
            }
            MessageType::RouteFailure => body.first().map(|&dest| Self::RouteFailure { dest }),
        }
    }

    fn discovery(body: &[u8]) -> Option<Discovery> {
        match body {
            [discovery_id, dest, route @ ..] => Some(Discovery {
                discovery_id: *discovery_id,
                dest: *dest,
                route: route.to_vec(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_from_byte() {
        assert_eq!(MessageType::from_byte(0), Some(MessageType::Application));
        assert_eq!(MessageType::from_byte(3), Some(MessageType::RouteFailure));
        assert_eq!(MessageType::from_byte(4), None);
        assert_eq!(u8::from(MessageType::RouteDiscoveryResponse), 2);
    }

    #[test]
    fn test_discovery_layout() {
        let frame = MeshFrame::DiscoveryRequest(Discovery {
            discovery_id: 7,
            dest: 4,
            route: vec![2, 3],
        });
        let encoded = frame.encode();
        assert_eq!(&encoded[..], &[1, 7, 4, 2, 3]);
        assert_eq!(MeshFrame::decode(&encoded), Some(frame));
    }

    #[test]
    fn test_application_and_failure() {
        let encoded = MeshFrame::Application(Bytes::from_static(b"hi")).encode();
        assert_eq!(&encoded[..], &[0, b'h', b'i']);
        assert_eq!(
            MeshFrame::decode(&Bytes::from_static(&[3, 9])),
            Some(MeshFrame::RouteFailure { dest: 9 })
        );
    }

    #[test]
    fn test_malformed() {
        assert_eq!(MeshFrame::decode(&Bytes::new()), None);
        assert_eq!(MeshFrame::decode(&Bytes::from_static(&[1, 7])), None);
        assert_eq!(MeshFrame::decode(&Bytes::from_static(&[3])), None);
        assert_eq!(MeshFrame::decode(&Bytes::from_static(&[0x42, 1])), None);
    }

    #[test]
    fn test_empty_application_payload() {
        let decoded = MeshFrame::decode(&Bytes::from_static(&[0])).unwrap();
        assert_eq!(decoded, MeshFrame::Application(Bytes::new()));
    }
}
