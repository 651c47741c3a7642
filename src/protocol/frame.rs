//! Frame encoding and decoding for serial links.
//!
//! The wire format uses DLE stuffing and a CCITT CRC-16:
//! ```text
//! ┌─────┬─────┬────┬──────┬────┬───────┬─────────┬─────┬─────┬────────┬────────┐
//! │ DLE │ STX │ TO │ FROM │ ID │ FLAGS │ payload │ DLE │ ETX │ FCS lo │ FCS hi │
//! └─────┴─────┴────┴──────┴────┴───────┴─────────┴─────┴─────┴────────┴────────┘
//! ```
//!
//! A literal DLE between TO and the end of the payload is sent twice. The
//! FCS covers TO through ETX inclusive, but not the stuffed DLEs.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::protocol::crc::{FCS_INIT, crc_ccitt_update};
use crate::protocol::header::{HEADER_LEN, Header};

/// Start of text.
pub const STX: u8 = 0x02;
/// End of text.
pub const ETX: u8 = 0x03;
/// Data link escape.
pub const DLE: u8 = 0x10;

/// Maximum frame content (header plus payload).
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Maximum application payload carried by one frame.
pub const MAX_MESSAGE_LEN: usize = MAX_PAYLOAD_LEN - HEADER_LEN;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Addressing header.
    pub header: Header,
    /// Payload following the header.
    pub payload: Bytes,
}

/// Encodes a header and payload into a stuffed, checksummed frame.
///
/// # Errors
///
/// Returns `FrameError::Overflow` if the payload exceeds [`MAX_MESSAGE_LEN`].
pub fn encode(header: &Header, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(FrameError::Overflow {
            max: MAX_MESSAGE_LEN,
        });
    }

    // Worst case every content byte is stuffed
    let mut buf = BytesMut::with_capacity(6 + 2 * (HEADER_LEN + payload.len()));
    let mut fcs = FCS_INIT;

    buf.put_u8(DLE);
    buf.put_u8(STX);
    for &byte in header.to_bytes().iter().chain(payload) {
        if byte == DLE {
            buf.put_u8(DLE);
        }
        buf.put_u8(byte);
        fcs = crc_ccitt_update(fcs, byte);
    }
    buf.put_u8(DLE);
    buf.put_u8(ETX);
    fcs = crc_ccitt_update(fcs, DLE);
    fcs = crc_ccitt_update(fcs, ETX);
    buf.put_u16_le(fcs);

    Ok(buf.freeze())
}

/// Receiver states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxState {
    /// Waiting for the DLE that starts a frame.
    #[default]
    Idle,
    /// Got DLE, waiting for STX.
    ExpectDle,
    /// Receiving frame content.
    Receiving,
    /// Got a DLE while receiving.
    Escape,
    /// Got DLE ETX, waiting for the first FCS octet.
    WaitFcs1,
    /// Waiting for the second FCS octet.
    WaitFcs2,
}

/// Byte-at-a-time frame decoder.
///
/// Any malformed input drops the frame in progress and returns the decoder
/// to [`RxState::Idle`].
#[derive(Debug)]
pub struct Framer {
    state: RxState,
    buffer: BytesMut,
    fcs: u16,
    received_fcs: u16,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    /// Creates a new framer in the idle state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RxState::Idle,
            buffer: BytesMut::with_capacity(MAX_PAYLOAD_LEN),
            fcs: FCS_INIT,
            received_fcs: 0,
        }
    }

    /// Current receiver state.
    #[must_use]
    pub const fn state(&self) -> RxState {
        self.state
    }

    /// Number of content bytes buffered for the frame in progress.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any frame in progress.
    pub fn reset(&mut self) {
        self.state = RxState::Idle;
        self.buffer.clear();
        self.fcs = FCS_INIT;
    }

    /// Feeds one received byte.
    ///
    /// Returns `Ok(Some(frame))` when the byte completes a valid frame,
    /// `Ok(None)` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a `FrameError` when the frame in progress was discarded. The
    /// framer is idle again afterwards.
    pub fn push(&mut self, byte: u8) -> Result<Option<Frame>, FrameError> {
        match self.state {
            RxState::Idle => {
                if byte == DLE {
                    self.state = RxState::ExpectDle;
                }
            }
            RxState::ExpectDle => {
                if byte == STX {
                    self.buffer.clear();
                    self.fcs = FCS_INIT;
                    self.state = RxState::Receiving;
                } else {
                    self.state = RxState::Idle;
                }
            }
            RxState::Receiving => {
                if byte == DLE {
                    self.state = RxState::Escape;
                } else {
                    self.append(byte)?;
                }
            }
            RxState::Escape => match byte {
                DLE => {
                    self.state = RxState::Receiving;
                    self.append(byte)?;
                }
                ETX => {
                    self.fcs = crc_ccitt_update(self.fcs, DLE);
                    self.fcs = crc_ccitt_update(self.fcs, ETX);
                    self.state = RxState::WaitFcs1;
                }
                _ => {
                    self.reset();
                    return Err(FrameError::UnexpectedByte { byte });
                }
            },
            RxState::WaitFcs1 => {
                self.received_fcs = u16::from(byte);
                self.state = RxState::WaitFcs2;
            }
            RxState::WaitFcs2 => {
                self.received_fcs |= u16::from(byte) << 8;
                self.state = RxState::Idle;
                return self.validate().map(Some);
            }
        }
        Ok(None)
    }

    /// Feeds a slice, returning every valid frame it completes.
    ///
    /// Framing errors are skipped; the framer resynchronises on its own.
    pub fn push_slice(&mut self, data: &[u8]) -> Vec<Frame> {
        data.iter()
            .filter_map(|&byte| self.push(byte).ok().flatten())
            .collect()
    }

    fn append(&mut self, byte: u8) -> Result<(), FrameError> {
        if self.buffer.len() >= MAX_PAYLOAD_LEN {
            self.reset();
            return Err(FrameError::Overflow {
                max: MAX_PAYLOAD_LEN,
            });
        }
        self.buffer.put_u8(byte);
        self.fcs = crc_ccitt_update(self.fcs, byte);
        Ok(())
    }

    fn validate(&mut self) -> Result<Frame, FrameError> {
        let content = self.buffer.split().freeze();
        if self.fcs != self.received_fcs {
            return Err(FrameError::BadFcs {
                computed: self.fcs,
                received: self.received_fcs,
            });
        }
        let header = Header::from_bytes(&content).ok_or(FrameError::TooShort(content.len()))?;
        Ok(Frame {
            header,
            payload: content.slice(HEADER_LEN..),
        })
    }
}
