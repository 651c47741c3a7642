//! Acknowledged datagrams with retransmission and duplicate suppression.
//!
//! Each unicast message carries a sequence id and the `ACK_REQUEST` flag.
//! The receiver answers with an empty `ACK` frame carrying the same id and
//! delivers the payload only if the id differs from the last one it
//! accepted from that sender. The sender retransmits the identical frame
//! until the ACK arrives or its retries run out.
//!
//! Only one message per peer may be outstanding: duplicate suppression
//! remembers a single id per sender, there is no window.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::datagram::{Datagram, Received};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::protocol::{Address, BROADCAST_ADDRESS, flags};

/// Default time to wait for an ACK before retransmitting.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

/// Default number of retransmissions after the first attempt.
pub const DEFAULT_RETRIES: u8 = 3;

/// Delay policy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Wait a random time in `[timeout, 2 * timeout)` so that two nodes
    /// retrying at once drift apart.
    #[default]
    Randomized,
    /// Always wait exactly `timeout`.
    Fixed,
}

/// Configuration for acknowledged delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableConfig {
    /// Base time to wait for an ACK.
    pub timeout: Duration,
    /// Retransmissions after the first attempt.
    pub retries: u8,
    /// Delay policy between attempts.
    pub backoff: Backoff,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            backoff: Backoff::Randomized,
        }
    }
}

impl ReliableConfig {
    /// Sets the ACK timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry count.
    #[must_use]
    pub const fn retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub const fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn attempt_timeout(&self) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.timeout,
            Backoff::Randomized => {
                let jitter: u32 = rand::thread_rng().gen_range(0..256);
                self.timeout + self.timeout * jitter / 256
            }
        }
    }
}

/// Acknowledged datagram service.
pub struct ReliableDatagram<D> {
    datagram: Datagram<D>,
    config: ReliableConfig,
    last_sequence: u8,
    last_sent_ids: [Option<u8>; 256],
    seen_ids: [Option<u8>; 256],
    retransmissions: u32,
}

impl<D: Driver> ReliableDatagram<D> {
    /// Creates a reliable datagram service with default settings.
    pub fn new(driver: D, this_address: Address) -> Self {
        Self::with_config(driver, this_address, ReliableConfig::default())
    }

    /// Creates a reliable datagram service with custom settings.
    pub fn with_config(driver: D, this_address: Address, config: ReliableConfig) -> Self {
        Self {
            datagram: Datagram::new(driver, this_address),
            config,
            last_sequence: 0,
            last_sent_ids: [None; 256],
            seen_ids: [None; 256],
            retransmissions: 0,
        }
    }

    /// Initialises the driver.
    pub async fn init(&mut self) -> Result<()> {
        self.datagram.init().await
    }

    /// This node's address.
    #[must_use]
    pub const fn this_address(&self) -> Address {
        self.datagram.this_address()
    }

    /// Changes this node's address.
    pub fn set_this_address(&mut self, address: Address) {
        self.datagram.set_this_address(address);
    }

    /// Current settings.
    #[must_use]
    pub const fn config(&self) -> &ReliableConfig {
        &self.config
    }

    /// Sets the ACK timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    /// Sets the retry count.
    pub fn set_retries(&mut self, retries: u8) {
        self.config.retries = retries;
    }

    /// Number of retransmissions since creation or the last reset.
    #[must_use]
    pub const fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    /// Resets the retransmission counter.
    pub fn reset_retransmissions(&mut self) {
        self.retransmissions = 0;
    }

    /// Id of the last message sent to `to`, if any.
    #[must_use]
    pub const fn last_sent_id(&self, to: Address) -> Option<u8> {
        self.last_sent_ids[to as usize]
    }

    /// Largest payload one message can carry.
    pub fn max_message_length(&self) -> u8 {
        self.datagram.max_message_length()
    }

    /// Sends `buf` to `to` and waits for its acknowledgement.
    ///
    /// Broadcasts are sent once and never acknowledged. Inbound messages that
    /// arrive while waiting are discarded, except that repeats of the last
    /// accepted message are acknowledged again.
    ///
    /// # Errors
    ///
    /// `InvalidLength` if `buf` does not fit in one message (nothing is sent),
    /// `UnableToDeliver` if no ACK arrived after all retries.
    pub async fn send_to_wait(&mut self, buf: &[u8], to: Address) -> Result<()> {
        let max = usize::from(self.max_message_length());
        if buf.len() > max {
            return Err(Error::InvalidLength {
                len: buf.len(),
                max,
            });
        }

        self.last_sequence = self.last_sequence.wrapping_add(1);
        let id = self.last_sequence;
        self.last_sent_ids[usize::from(to)] = Some(id);
        let this_address = self.this_address();

        for attempt in 0..=self.config.retries {
            self.datagram.set_header_id(id);
            if to == BROADCAST_ADDRESS {
                self.datagram
                    .set_header_flags(flags::NONE, flags::ACK | flags::ACK_REQUEST);
            } else {
                self.datagram.set_header_flags(flags::ACK_REQUEST, flags::ACK);
            }
            self.datagram.send_to(buf, to).await?;
            self.datagram.wait_packet_sent().await;

            if to == BROADCAST_ADDRESS {
                return Ok(());
            }
            if attempt > 0 {
                self.retransmissions = self.retransmissions.wrapping_add(1);
                tracing::debug!("retransmission {} of id {} to {}", attempt, id, to);
            }

            // The timeout does not include the transmit time
            let timeout = self.config.attempt_timeout();
            let sent_at = Instant::now();
            loop {
                let elapsed = sent_at.elapsed();
                if elapsed >= timeout {
                    break;
                }
                if self.datagram.wait_available_timeout(timeout - elapsed).await {
                    if let Some(received) = self.datagram.recv_from(&mut []) {
                        let header = received.header;
                        if header.from == to
                            && header.to == this_address
                            && header.is_ack()
                            && header.id == id
                        {
                            tracing::trace!("ack for id {} from {}", id, to);
                            return Ok(());
                        }
                        if !header.is_ack()
                            && header.to == this_address
                            && self.seen_ids[usize::from(header.from)] == Some(header.id)
                        {
                            // Our earlier ACK was lost
                            self.acknowledge(header.id, header.from).await;
                        }
                    }
                }
                tokio::task::yield_now().await;
            }
        }

        tracing::warn!(
            "no ack for id {} from {} after {} attempts",
            id,
            to,
            u16::from(self.config.retries) + 1
        );
        Err(Error::UnableToDeliver { to })
    }

    /// Collects a waiting message, acknowledging it if asked to.
    ///
    /// Returns `None` if nothing is waiting, or if the message was an ACK or
    /// a duplicate of the last message accepted from the same sender.
    pub async fn recv_from_ack(&mut self, buf: &mut [u8]) -> Option<Received> {
        if !self.datagram.available() {
            return None;
        }
        let received = self.datagram.recv_from(buf)?;
        let header = received.header;

        if header.is_ack() {
            tracing::trace!("stray ack for id {} from {}", header.id, header.from);
            return None;
        }
        if header.wants_ack() && header.to == self.this_address() {
            self.acknowledge(header.id, header.from).await;
        }

        let seen = &mut self.seen_ids[usize::from(header.from)];
        if *seen == Some(header.id) {
            tracing::debug!("duplicate id {} from {} suppressed", header.id, header.from);
            return None;
        }
        *seen = Some(header.id);
        Some(received)
    }

    /// Polls [`recv_from_ack`](Self::recv_from_ack) until a message is
    /// delivered or `timeout` elapses.
    pub async fn recv_from_ack_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Option<Received> {
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return None;
            }
            if self.datagram.wait_available_timeout(timeout - elapsed).await {
                if let Some(received) = self.recv_from_ack(buf).await {
                    return Some(received);
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Polls until a message is waiting or `timeout` elapses.
    pub async fn wait_available_timeout(&mut self, timeout: Duration) -> bool {
        self.datagram.wait_available_timeout(timeout).await
    }

    /// Sends an empty ACK for `id` back to `to`.
    async fn acknowledge(&mut self, id: u8, to: Address) {
        self.datagram.set_header_id(id);
        self.datagram.set_header_flags(flags::ACK, flags::ACK_REQUEST);
        match self.datagram.send_to(&[], to).await {
            Ok(()) => {
                self.datagram.wait_packet_sent().await;
                tracing::trace!("acked id {} to {}", id, to);
            }
            Err(e) => tracing::warn!("failed to ack id {} to {}: {}", id, to, e),
        }
    }

    /// The datagram layer below.
    pub const fn datagram(&self) -> &Datagram<D> {
        &self.datagram
    }

    /// The datagram layer below.
    pub fn datagram_mut(&mut self) -> &mut Datagram<D> {
        &mut self.datagram
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Ether, SimDriver};

    fn fast() -> ReliableConfig {
        ReliableConfig::default()
            .timeout(Duration::from_millis(30))
            .backoff(Backoff::Fixed)
    }

    async fn node(ether: &Ether, address: Address) -> ReliableDatagram<SimDriver> {
        let mut node = ReliableDatagram::with_config(ether.attach(address), address, fast());
        node.init().await.unwrap();
        node
    }

    /// Runs `node` as a receiver, forwarding each delivered payload.
    fn serve(
        mut node: ReliableDatagram<SimDriver>,
    ) -> (
        tokio::sync::mpsc::UnboundedReceiver<(Received, Vec<u8>)>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                if let Some(received) = node
                    .recv_from_ack_timeout(&mut buf, Duration::from_millis(50))
                    .await
                {
                    let _ = tx.send((received, buf[..received.len].to_vec()));
                }
            }
        });
        (rx, task)
    }

    #[test]
    fn test_config_defaults() {
        let config = ReliableConfig::default();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.retries, DEFAULT_RETRIES);
        assert_eq!(config.backoff, Backoff::Randomized);
    }

    #[test]
    fn test_randomized_timeout_range() {
        let config = ReliableConfig::default();
        for _ in 0..100 {
            let t = config.attempt_timeout();
            assert!(t >= DEFAULT_TIMEOUT && t < DEFAULT_TIMEOUT * 2);
        }
        assert_eq!(fast().attempt_timeout(), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_round_trip_without_retries() {
        let ether = Ether::new();
        let mut client = node(&ether, 1).await;
        let server = node(&ether, 2).await;
        let (mut rx, task) = serve(server);

        // Four earlier messages put the next id at 5
        for _ in 0..4 {
            client.send_to_wait(b"warmup", 2).await.unwrap();
        }
        client.send_to_wait(b"hello", 2).await.unwrap();
        assert_eq!(client.last_sent_id(2), Some(5));
        assert_eq!(client.retransmissions(), 0);

        let mut last = None;
        for _ in 0..5 {
            last = rx.recv().await;
        }
        let (received, payload) = last.unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(received.header.id, 5);
        assert_eq!(received.header.from, 1);
        // data + ack per message
        assert_eq!(ether.frames_sent(), 10);
        task.abort();
    }

    #[tokio::test]
    async fn test_lost_data_is_retransmitted() {
        let ether = Ether::new();
        let mut client = node(&ether, 1).await;
        let server = node(&ether, 2).await;
        let (mut rx, task) = serve(server);

        ether.drop_next(1, 2, 2);
        client.send_to_wait(b"again", 2).await.unwrap();
        assert_eq!(client.retransmissions(), 2);

        let (_, payload) = rx.recv().await.unwrap();
        assert_eq!(payload, b"again");
        task.abort();
    }

    #[tokio::test]
    async fn test_lost_ack_delivers_once() {
        let ether = Ether::new();
        let mut client = node(&ether, 1).await;
        let server = node(&ether, 2).await;
        let (mut rx, task) = serve(server);

        ether.drop_next(2, 1, 1);
        client.send_to_wait(b"once", 2).await.unwrap();
        assert_eq!(client.retransmissions(), 1);
        client.send_to_wait(b"twice", 2).await.unwrap();

        let (_, first) = rx.recv().await.unwrap();
        let (_, second) = rx.recv().await.unwrap();
        assert_eq!(first, b"once");
        assert_eq!(second, b"twice");
        task.abort();
    }

    #[tokio::test]
    async fn test_duplicate_is_acked_but_not_delivered() {
        let ether = Ether::new();
        let mut raw = Datagram::new(ether.attach(1), 1);
        raw.init().await.unwrap();
        let mut server = node(&ether, 2).await;
        let mut buf = [0u8; 16];

        raw.set_header_id(9);
        raw.set_header_flags(flags::ACK_REQUEST, flags::NONE);
        raw.send_to(b"dup", 2).await.unwrap();
        let first = server.recv_from_ack(&mut buf).await.unwrap();
        assert_eq!(&buf[..first.len], b"dup");

        // One ack per copy
        for copy in 0..2 {
            let ack = raw.recv_from(&mut buf).unwrap();
            assert!(ack.header.is_ack(), "copy {copy}");
            assert_eq!(ack.header.id, 9);
            assert_eq!(ack.len, 0);

            if copy == 0 {
                raw.send_to(b"dup", 2).await.unwrap();
                assert!(server.recv_from_ack(&mut buf).await.is_none());
            }
        }
        assert!(!raw.available());
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let ether = Ether::new();
        let mut client = node(&ether, 1).await;

        let result = client.send_to_wait(b"anyone?", 2).await;
        assert!(matches!(result, Err(Error::UnableToDeliver { to: 2 })));
        assert_eq!(client.retransmissions(), u32::from(DEFAULT_RETRIES));
        assert_eq!(ether.frames_sent(), u64::from(DEFAULT_RETRIES) + 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_not_sent() {
        let ether = Ether::new();
        let mut client = node(&ether, 1).await;
        let payload = vec![0u8; usize::from(client.max_message_length()) + 1];

        let result = client.send_to_wait(&payload, 2).await;
        assert!(matches!(result, Err(Error::InvalidLength { .. })));
        assert_eq!(ether.frames_sent(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_not_acked() {
        let ether = Ether::new();
        let mut client = node(&ether, 1).await;
        let mut server = node(&ether, 2).await;
        let mut buf = [0u8; 16];

        client.send_to_wait(b"all", BROADCAST_ADDRESS).await.unwrap();
        let received = server.recv_from_ack(&mut buf).await.unwrap();
        assert!(received.header.is_broadcast());
        assert!(!received.header.wants_ack());
        assert_eq!(ether.frames_sent(), 1);
    }

    #[tokio::test]
    async fn test_acked_over_serial_link() {
        use crate::driver::SerialDriver;

        let (a, b) = tokio::io::duplex(1024);
        let config = ReliableConfig::default().backoff(Backoff::Fixed);
        let mut client = ReliableDatagram::with_config(SerialDriver::new(a), 1, config);
        let mut server = ReliableDatagram::with_config(SerialDriver::new(b), 2, config);
        client.init().await.unwrap();
        server.init().await.unwrap();

        let task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let received = server
                .recv_from_ack_timeout(&mut buf, Duration::from_secs(1))
                .await
                .unwrap();
            (received.header, buf[..received.len].to_vec())
        });

        client.send_to_wait(b"over the wire", 2).await.unwrap();
        assert_eq!(client.retransmissions(), 0);

        let (header, payload) = task.await.unwrap();
        assert_eq!(payload, b"over the wire");
        assert_eq!(header.from, 1);
        assert!(header.wants_ack());
    }

    #[tokio::test]
    async fn test_unreliable_sender_not_acked() {
        let ether = Ether::new();
        let mut raw = Datagram::new(ether.attach(1), 1);
        raw.init().await.unwrap();
        let mut server = node(&ether, 2).await;
        let mut buf = [0u8; 16];

        raw.send_to(b"plain", 2).await.unwrap();
        assert!(server.recv_from_ack(&mut buf).await.is_some());
        assert!(!raw.available());
    }
}
