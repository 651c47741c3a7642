//! Error types for the radiomesh library.

use thiserror::Error;

use crate::protocol::Address;

/// The main error type for radiomesh operations.
///
/// Every variant is a recoverable return value; nothing in the messaging
/// layers aborts the process.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The driver has not been initialised.
    #[error("driver not initialised")]
    NotInitialised,

    /// Payload plus headers exceed what the layer below can carry.
    #[error("invalid length: {len} bytes exceeds maximum {max}")]
    InvalidLength { len: usize, max: usize },

    /// No valid route to the destination is known.
    #[error("no route to {dest}")]
    NoRoute { dest: Address },

    /// The next hop never acknowledged the message.
    #[error("unable to deliver to {to}: no acknowledgement")]
    UnableToDeliver { to: Address },
}

/// Framing errors detected by the serial framer.
///
/// These never reach callers of the messaging layers: the framer resets to
/// idle and the frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame content exceeds the receive buffer.
    #[error("frame overflow: more than {max} bytes")]
    Overflow { max: usize },

    /// A byte that is not allowed in the current framer state.
    #[error("unexpected byte 0x{byte:02x} after DLE")]
    UnexpectedByte { byte: u8 },

    /// Frame check sequence mismatch.
    #[error("bad FCS: computed 0x{computed:04x}, received 0x{received:04x}")]
    BadFcs { computed: u16, received: u16 },

    /// Frame too short to contain the addressing header.
    #[error("frame too short: need at least 4 bytes, got {0}")]
    TooShort(usize),
}

/// Result type alias for radiomesh operations.
pub type Result<T> = std::result::Result<T, Error>;
