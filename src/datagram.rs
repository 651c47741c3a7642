//! Addressed, unreliable datagrams.
//!
//! [`Datagram`] owns a [`Driver`] and stamps every outbound message with
//! this node's address as FROM. Inbound messages not addressed to this node
//! (or broadcast) are dropped by the driver unless it is promiscuous. There
//! are no acknowledgements: a lost message is simply never delivered.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::driver::Driver;
use crate::error::Result;
use crate::protocol::{Address, Header};

/// Metadata of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Number of payload bytes copied into the caller's buffer.
    pub len: usize,
    /// Addressing header the message arrived with.
    pub header: Header,
}

/// Addressed datagram service over a driver.
pub struct Datagram<D> {
    driver: D,
    this_address: Address,
}

impl<D: Driver> Datagram<D> {
    /// Creates a datagram service for the node at `this_address`.
    pub fn new(mut driver: D, this_address: Address) -> Self {
        driver.set_this_address(this_address);
        driver.set_header_from(this_address);
        Self {
            driver,
            this_address,
        }
    }

    /// Initialises the driver.
    pub async fn init(&mut self) -> Result<()> {
        self.driver.init().await
    }

    /// This node's address.
    #[must_use]
    pub const fn this_address(&self) -> Address {
        self.this_address
    }

    /// Changes this node's address.
    pub fn set_this_address(&mut self, address: Address) {
        self.driver.set_this_address(address);
        self.driver.set_header_from(address);
        self.this_address = address;
    }

    /// Sends `buf` to `to` (broadcast if `to` is the broadcast address).
    pub async fn send_to(&mut self, buf: &[u8], to: Address) -> Result<()> {
        self.driver.set_header_to(to);
        self.driver.send(Bytes::copy_from_slice(buf)).await
    }

    /// Collects a waiting message into `buf`, truncating if necessary.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Option<Received> {
        let len = self.driver.recv(buf)?;
        Some(Received {
            len,
            header: self.driver.state().rx_header(),
        })
    }

    /// Returns true if a message is waiting.
    pub fn available(&mut self) -> bool {
        self.driver.available()
    }

    /// Polls until a message is waiting or `timeout` elapses.
    pub async fn wait_available_timeout(&mut self, timeout: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if self.driver.available() {
                return true;
            }
            tokio::task::yield_now().await;
        }
        false
    }

    /// Waits for the driver to finish transmitting.
    pub async fn wait_packet_sent(&mut self) -> bool {
        self.driver.wait_packet_sent(None).await
    }

    /// Largest payload one datagram can carry.
    pub fn max_message_length(&self) -> u8 {
        self.driver.max_message_length()
    }

    /// Sets ID for subsequent transmissions.
    pub fn set_header_id(&mut self, id: u8) {
        self.driver.set_header_id(id);
    }

    /// Sets then clears FLAGS bits for subsequent transmissions.
    pub fn set_header_flags(&mut self, set: u8, clear: u8) {
        self.driver.set_header_flags(set, clear);
    }

    /// The underlying driver.
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    /// The underlying driver.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}
