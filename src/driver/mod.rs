//! Driver layer for radiomesh communication.
//!
//! A driver moves unaddressed, unreliable datagrams: it queues one outbound
//! message at a time and holds at most one validated inbound message until
//! it is collected. Everything above this module talks to drivers only
//! through the [`Driver`] trait.
//!
//! Two drivers are provided:
//! - [`SerialDriver`] frames messages over any byte stream (serial ports,
//!   serial radio modems)
//! - [`SimDriver`] attaches to a simulated [`Ether`] for tests and
//!   multi-node simulations

pub mod serial;
pub mod sim;

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::protocol::{Address, BROADCAST_ADDRESS, Frame, Header};

pub use serial::{SerialConfig, SerialDriver};
pub use sim::{Ether, SimDriver};

/// Operating mode of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// `init()` has not completed yet.
    #[default]
    Initialising,
    /// Ready, neither sending nor listening.
    Idle,
    /// Transmitting.
    Tx,
    /// Listening.
    Rx,
    /// Low power.
    Sleep,
}

/// Frame counters kept by every driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStats {
    /// Frames dropped for framing or checksum errors.
    pub rx_bad: u32,
    /// Frames accepted for this node.
    pub rx_good: u32,
    /// Frames transmitted.
    pub tx_good: u32,
}

/// Addressing and bookkeeping state shared by all drivers.
#[derive(Debug, Clone)]
pub struct DriverState {
    mode: Mode,
    this_address: Address,
    tx_header: Header,
    rx_header: Header,
    promiscuous: bool,
    stats: DriverStats,
}

impl Default for DriverState {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverState {
    /// Creates state with every address set to broadcast.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: Mode::Initialising,
            this_address: BROADCAST_ADDRESS,
            tx_header: Header::default(),
            rx_header: Header::default(),
            promiscuous: false,
            stats: DriverStats::default(),
        }
    }

    /// Current mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Sets the mode.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Header that the next transmitted frame will carry.
    #[must_use]
    pub const fn tx_header(&self) -> Header {
        self.tx_header
    }

    /// Header of the last collected frame.
    #[must_use]
    pub const fn rx_header(&self) -> Header {
        self.rx_header
    }

    /// Counters.
    #[must_use]
    pub const fn stats(&self) -> DriverStats {
        self.stats
    }

    /// Returns true if a frame with this header is for this node.
    #[must_use]
    pub const fn accepts(&self, header: &Header) -> bool {
        self.promiscuous || header.to == self.this_address || header.to == BROADCAST_ADDRESS
    }

    /// Screens a validated inbound frame, counting it if it is kept.
    pub fn admit(&mut self, frame: &Frame) -> bool {
        if self.accepts(&frame.header) {
            self.stats.rx_good = self.stats.rx_good.wrapping_add(1);
            true
        } else {
            tracing::trace!(
                "frame for {} ignored by {}",
                frame.header.to,
                self.this_address
            );
            false
        }
    }

    /// Records a frame dropped by the receiver.
    pub fn record_rx_bad(&mut self) {
        self.stats.rx_bad = self.stats.rx_bad.wrapping_add(1);
    }

    /// Records a transmitted frame.
    pub fn record_tx_good(&mut self) {
        self.stats.tx_good = self.stats.tx_good.wrapping_add(1);
    }

    /// Hands a collected frame to the caller.
    ///
    /// Copies as much payload as fits in `buf` and remembers the header.
    pub fn deliver(&mut self, frame: &Frame, buf: &mut [u8]) -> usize {
        let len = frame.payload.len().min(buf.len());
        buf[..len].copy_from_slice(&frame.payload[..len]);
        self.rx_header = frame.header;
        self.mode = Mode::Idle;
        len
    }
}

/// Trait for driver implementations.
///
/// `available` and `recv` are polled: they never block. Operations that may
/// perform I/O return boxed futures.
pub trait Driver: Send {
    /// Initialises the transport.
    fn init(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Queues one message using the current transmit header.
    ///
    /// Fails with `Error::InvalidLength` if `data` exceeds
    /// [`max_message_length`](Self::max_message_length).
    fn send(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Waits until the previous message has left the transmitter.
    ///
    /// Returns false if `timeout` expired first.
    fn wait_packet_sent(&mut self, timeout: Option<Duration>) -> BoxFuture<'_, bool>;

    /// Returns true if a validated message for this node is waiting.
    ///
    /// A driver holds one message. One that arrives before the previous
    /// is collected replaces it.
    fn available(&mut self) -> bool;

    /// Collects the waiting message into `buf`, truncating if it does not
    /// fit, and returns the number of bytes copied.
    fn recv(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Largest payload `send` accepts.
    fn max_message_length(&self) -> u8;

    /// Shared bookkeeping state.
    fn state(&self) -> &DriverState;

    /// Shared bookkeeping state.
    fn state_mut(&mut self) -> &mut DriverState;

    /// Current mode.
    fn mode(&self) -> Mode {
        self.state().mode()
    }

    /// This node's address.
    fn this_address(&self) -> Address {
        self.state().this_address
    }

    /// Sets the address used to filter inbound frames.
    fn set_this_address(&mut self, address: Address) {
        self.state_mut().this_address = address;
    }

    /// Sets TO for subsequent transmissions.
    fn set_header_to(&mut self, to: Address) {
        self.state_mut().tx_header.to = to;
    }

    /// Sets FROM for subsequent transmissions.
    fn set_header_from(&mut self, from: Address) {
        self.state_mut().tx_header.from = from;
    }

    /// Sets ID for subsequent transmissions.
    fn set_header_id(&mut self, id: u8) {
        self.state_mut().tx_header.id = id;
    }

    /// Sets then clears FLAGS bits for subsequent transmissions.
    fn set_header_flags(&mut self, set: u8, clear: u8) {
        let header = &mut self.state_mut().tx_header;
        header.flags |= set;
        header.flags &= !clear;
    }

    /// TO of the last received message.
    fn header_to(&self) -> Address {
        self.state().rx_header.to
    }

    /// FROM of the last received message.
    fn header_from(&self) -> Address {
        self.state().rx_header.from
    }

    /// ID of the last received message.
    fn header_id(&self) -> u8 {
        self.state().rx_header.id
    }

    /// FLAGS of the last received message.
    fn header_flags(&self) -> u8 {
        self.state().rx_header.flags
    }

    /// Accept frames regardless of their TO address.
    fn set_promiscuous(&mut self, promiscuous: bool) {
        self.state_mut().promiscuous = promiscuous;
    }

    /// Frame counters.
    fn stats(&self) -> DriverStats {
        self.state().stats()
    }
}
