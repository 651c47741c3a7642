//! Protocol definitions for radiomesh communication.
//!
//! This module contains the wire-level types including:
//! - The 4-octet addressing header and its flag bits
//! - Serial frame encoding/decoding with DLE stuffing
//! - The CCITT CRC-16 frame check sequence
//! - The routing header used for multi-hop delivery

pub mod crc;
pub mod frame;
pub mod header;
pub mod routed;

pub use crc::{crc_ccitt, crc_ccitt_update};
pub use frame::{Frame, Framer, MAX_MESSAGE_LEN, MAX_PAYLOAD_LEN, RxState, encode as encode_frame};
pub use header::{Address, BROADCAST_ADDRESS, HEADER_LEN, Header, flags};
pub use routed::{ROUTED_HEADER_LEN, RoutedHeader};
