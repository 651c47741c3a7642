//! The 4-octet addressing header carried by every datagram.
//!
//! ```text
//! ┌──────┬──────┬──────┬───────┐
//! │  TO  │ FROM │  ID  │ FLAGS │
//! └──────┴──────┴──────┴───────┘
//! ```

/// Node address. 0-254 are unicast, 255 is broadcast.
pub type Address = u8;

/// The broadcast address.
pub const BROADCAST_ADDRESS: Address = 0xff;

/// Length of the addressing header.
pub const HEADER_LEN: usize = 4;

/// Header flag bits.
///
/// The high nibble is reserved for the protocol layers, the low nibble is
/// free for applications.
pub mod flags {
    /// No flags.
    pub const NONE: u8 = 0x00;
    /// Frame is an acknowledgement.
    pub const ACK: u8 = 0x80;
    /// Sender expects an acknowledgement.
    pub const ACK_REQUEST: u8 = 0x40;
    /// Bits reserved for protocol use.
    pub const RESERVED: u8 = 0xf0;
    /// Bits available to applications.
    pub const APPLICATION_SPECIFIC: u8 = 0x0f;
}

/// Addressing header of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    /// Destination node.
    pub to: Address,
    /// Sending node.
    pub from: Address,
    /// Sequence / correlation number.
    pub id: u8,
    /// Flag bits, see [`flags`].
    pub flags: u8,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            to: BROADCAST_ADDRESS,
            from: BROADCAST_ADDRESS,
            id: 0,
            flags: flags::NONE,
        }
    }
}

impl Header {
    /// Returns true if this header marks an acknowledgement.
    #[must_use]
    pub const fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    /// Returns true if the sender asked for an acknowledgement.
    #[must_use]
    pub const fn wants_ack(&self) -> bool {
        self.flags & flags::ACK_REQUEST != 0
    }

    /// Returns true if addressed to everyone.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDRESS
    }

    /// Wire representation.
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; HEADER_LEN] {
        [self.to, self.from, self.id, self.flags]
    }

    /// Parses a header from the start of `data`.
    #[must_use]
    pub const fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            to: data[0],
            from: data[1],
            id: data[2],
            flags: data[3],
        })
    }
}
