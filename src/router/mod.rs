//! Multi-hop store-and-forward routing over reliable datagrams.
//!
//! Every routed payload is prefixed with a [`RoutedHeader`] carrying the
//! end-to-end source and destination. The datagram header below it only
//! ever names the current hop. Each hop is acknowledged by the reliable
//! layer, so a successful send means the first hop has the message, not
//! that the destination does.
//!
//! # Example
//!
//! ```no_run
//! use radiomesh::driver::Ether;
//! use radiomesh::router::{RouteState, Router};
//!
//! # async fn example() -> radiomesh::Result<()> {
//! let ether = Ether::linear(&[1, 2, 3]);
//! let mut router = Router::new(ether.attach(1), 1);
//! router.init().await?;
//! router.add_route_to(3, 2, RouteState::Valid);
//! router.send_to_wait(b"hello", 3).await?;
//! # Ok(())
//! # }
//! ```

mod table;

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::protocol::{Address, BROADCAST_ADDRESS, ROUTED_HEADER_LEN, RoutedHeader, flags};
use crate::reliable::{ReliableConfig, ReliableDatagram};

pub use table::{DEFAULT_TABLE_CAPACITY, RouteEntry, RouteState, RoutingTable};

/// Default hop limit.
pub const DEFAULT_MAX_HOPS: u8 = 30;

/// Configuration for a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Messages that have travelled this many hops are not forwarded.
    pub max_hops: u8,
    /// Number of routes the table holds.
    pub table_capacity: usize,
    /// Per-hop delivery settings.
    pub reliable: ReliableConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            table_capacity: DEFAULT_TABLE_CAPACITY,
            reliable: ReliableConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Sets the hop limit.
    #[must_use]
    pub const fn max_hops(mut self, max_hops: u8) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Sets the routing table capacity.
    #[must_use]
    pub const fn table_capacity(mut self, capacity: usize) -> Self {
        self.table_capacity = capacity;
        self
    }

    /// Sets the per-hop delivery settings.
    #[must_use]
    pub const fn reliable(mut self, reliable: ReliableConfig) -> Self {
        self.reliable = reliable;
        self
    }
}

/// A routed message addressed to this node or broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    /// End-to-end header.
    pub header: RoutedHeader,
    /// Neighbour that handed the message to this node.
    pub hop_from: Address,
    /// Application payload.
    pub payload: Bytes,
}

/// What the router did with an inbound routed message.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// Addressed to this node or broadcast.
    Deliver(RoutedMessage),
    /// Handed on towards its destination.
    Forwarded {
        message: RoutedMessage,
        outcome: Result<()>,
    },
    /// Hop limit reached.
    Dropped,
}

/// Static multi-hop router.
pub struct Router<D> {
    reliable: ReliableDatagram<D>,
    table: RoutingTable,
    max_hops: u8,
    last_e2e_id: u8,
}

impl<D: Driver> Router<D> {
    /// Creates a router with default settings and an empty table.
    pub fn new(driver: D, this_address: Address) -> Self {
        Self::with_config(driver, this_address, RouterConfig::default())
    }

    /// Creates a router with custom settings and an empty table.
    pub fn with_config(driver: D, this_address: Address, config: RouterConfig) -> Self {
        Self {
            reliable: ReliableDatagram::with_config(driver, this_address, config.reliable),
            table: RoutingTable::new(config.table_capacity),
            max_hops: config.max_hops,
            last_e2e_id: 0,
        }
    }

    /// Initialises the driver.
    pub async fn init(&mut self) -> Result<()> {
        self.reliable.init().await
    }

    /// This node's address.
    #[must_use]
    pub const fn this_address(&self) -> Address {
        self.reliable.this_address()
    }

    /// Hop limit.
    #[must_use]
    pub const fn max_hops(&self) -> u8 {
        self.max_hops
    }

    /// Sets the hop limit.
    pub fn set_max_hops(&mut self, max_hops: u8) {
        self.max_hops = max_hops;
    }

    /// Largest application payload one routed message can carry.
    pub fn max_message_length(&self) -> usize {
        usize::from(self.reliable.max_message_length()).saturating_sub(ROUTED_HEADER_LEN)
    }

    /// The routing table.
    #[must_use]
    pub const fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Adds or updates the route to `dest`.
    pub fn add_route_to(&mut self, dest: Address, next_hop: Address, state: RouteState) {
        self.table.add_route_to(dest, next_hop, state);
    }

    /// Returns the route to `dest` unless it is `Invalid`.
    #[must_use]
    pub fn get_route_to(&self, dest: Address) -> Option<&RouteEntry> {
        self.table.get_route_to(dest)
    }

    /// Deletes the route to `dest`.
    pub fn delete_route_to(&mut self, dest: Address) -> bool {
        self.table.delete_route_to(dest)
    }

    /// Deletes the route that was added or updated longest ago.
    pub fn retire_oldest_route(&mut self) -> Option<RouteEntry> {
        self.table.retire_oldest_route()
    }

    /// Deletes every route.
    pub fn clear_routing_table(&mut self) {
        self.table.clear();
    }

    /// Sends `buf` to `dest` via the routing table.
    ///
    /// Succeeds once the first hop has acknowledged.
    ///
    /// # Errors
    ///
    /// `InvalidLength` if `buf` plus the routing header does not fit,
    /// `NoRoute` if no valid route to `dest` is known (nothing is sent),
    /// `UnableToDeliver` if the first hop never acknowledged.
    pub async fn send_to_wait(&mut self, buf: &[u8], dest: Address) -> Result<()> {
        let source = self.this_address();
        self.send_to_from_source_wait(buf, dest, source, flags::NONE).await
    }

    /// Sends `buf` to `dest` as though it originated at `source`.
    ///
    /// Only the low nibble of `app_flags` is carried.
    pub async fn send_to_from_source_wait(
        &mut self,
        buf: &[u8],
        dest: Address,
        source: Address,
        app_flags: u8,
    ) -> Result<()> {
        let max = self.max_message_length();
        if buf.len() > max {
            return Err(Error::InvalidLength {
                len: buf.len(),
                max,
            });
        }

        self.last_e2e_id = self.last_e2e_id.wrapping_add(1);
        let header = RoutedHeader {
            dest,
            source,
            hops: 0,
            id: self.last_e2e_id,
            flags: app_flags & flags::APPLICATION_SPECIFIC,
        };
        self.route(&header.encode(buf), dest).await
    }

    /// Hands an encoded routed message to the next hop towards `dest`.
    async fn route(&mut self, message: &[u8], dest: Address) -> Result<()> {
        let next_hop = if dest == BROADCAST_ADDRESS {
            BROADCAST_ADDRESS
        } else {
            self.table.next_hop(dest).ok_or(Error::NoRoute { dest })?
        };
        tracing::trace!("routing to {} via {}", dest, next_hop);
        self.reliable.send_to_wait(message, next_hop).await
    }

    /// Collects one waiting routed message without acting on it.
    pub(crate) async fn next_routed(&mut self) -> Option<RoutedMessage> {
        let mut buf = [0u8; u8::MAX as usize];
        let received = self.reliable.recv_from_ack(&mut buf).await?;
        let Some((header, payload)) = RoutedHeader::decode(&buf[..received.len]) else {
            tracing::debug!(
                "{}-byte message from {} has no routing header",
                received.len,
                received.header.from
            );
            return None;
        };
        Some(RoutedMessage {
            header,
            hop_from: received.header.from,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Delivers a message addressed here, or forwards it one hop.
    pub(crate) async fn dispatch(&mut self, mut message: RoutedMessage) -> Dispatch {
        let dest = message.header.dest;
        if dest == self.this_address() || dest == BROADCAST_ADDRESS {
            return Dispatch::Deliver(message);
        }
        if message.header.hops >= self.max_hops {
            tracing::debug!(
                "dropping message {} from {} to {}: hop limit {} reached",
                message.header.id,
                message.header.source,
                dest,
                self.max_hops
            );
            return Dispatch::Dropped;
        }

        message.header.hops += 1;
        let encoded = message.header.encode(&message.payload);
        let outcome = self.route(&encoded, dest).await;
        Dispatch::Forwarded { message, outcome }
    }

    /// Collects a waiting message, forwarding it if it is for another node.
    ///
    /// Returns a message only if it was addressed to this node or broadcast.
    pub async fn recv_from_ack(&mut self) -> Option<RoutedMessage> {
        let message = self.next_routed().await?;
        match self.dispatch(message).await {
            Dispatch::Deliver(message) => Some(message),
            Dispatch::Forwarded {
                message,
                outcome: Err(e),
            } => {
                tracing::warn!(
                    "failed to forward message from {} to {}: {}",
                    message.header.source,
                    message.header.dest,
                    e
                );
                None
            }
            Dispatch::Forwarded { .. } | Dispatch::Dropped => None,
        }
    }

    /// Polls [`recv_from_ack`](Self::recv_from_ack) until a message is
    /// delivered or `timeout` elapses.
    pub async fn recv_from_ack_timeout(&mut self, timeout: Duration) -> Option<RoutedMessage> {
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return None;
            }
            if self.reliable.wait_available_timeout(timeout - elapsed).await {
                if let Some(message) = self.recv_from_ack().await {
                    return Some(message);
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Polls until a message is waiting or `timeout` elapses.
    pub(crate) async fn wait_available_timeout(&mut self, timeout: Duration) -> bool {
        self.reliable.wait_available_timeout(timeout).await
    }

    /// The reliable datagram layer below.
    pub const fn reliable(&self) -> &ReliableDatagram<D> {
        &self.reliable
    }

    /// The reliable datagram layer below.
    pub fn reliable_mut(&mut self) -> &mut ReliableDatagram<D> {
        &mut self.reliable
    }

    pub(crate) fn table_mut(&mut self) -> &mut RoutingTable {
        &mut self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Ether, SimDriver};
    use crate::reliable::Backoff;

    fn config() -> RouterConfig {
        RouterConfig::default().reliable(
            ReliableConfig::default()
                .timeout(Duration::from_millis(30))
                .backoff(Backoff::Fixed),
        )
    }

    async fn node(ether: &Ether, address: Address) -> Router<SimDriver> {
        let mut router = Router::with_config(ether.attach(address), address, config());
        router.init().await.unwrap();
        router
    }

    fn serve(
        mut router: Router<SimDriver>,
    ) -> (
        tokio::sync::mpsc::UnboundedReceiver<RoutedMessage>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                if let Some(message) = router
                    .recv_from_ack_timeout(Duration::from_millis(50))
                    .await
                {
                    let _ = tx.send(message);
                }
            }
        });
        (rx, task)
    }

    /// Chain 1 - 2 - 3 with static routes in both directions.
    async fn chain(ether: &Ether) -> [Router<SimDriver>; 3] {
        let mut a = node(ether, 1).await;
        let mut b = node(ether, 2).await;
        let mut c = node(ether, 3).await;
        a.add_route_to(2, 2, RouteState::Valid);
        a.add_route_to(3, 2, RouteState::Valid);
        b.add_route_to(1, 1, RouteState::Valid);
        b.add_route_to(3, 3, RouteState::Valid);
        c.add_route_to(2, 2, RouteState::Valid);
        c.add_route_to(1, 2, RouteState::Valid);
        [a, b, c]
    }

    #[test]
    fn test_config_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.max_hops, DEFAULT_MAX_HOPS);
        assert_eq!(config.table_capacity, DEFAULT_TABLE_CAPACITY);
    }

    #[tokio::test]
    async fn test_no_route_fails_immediately() {
        let ether = Ether::new();
        let mut a = node(&ether, 1).await;
        let _b = node(&ether, 2).await;

        let started = std::time::Instant::now();
        let result = a.send_to_wait(b"hello", 2).await;
        assert!(matches!(result, Err(Error::NoRoute { dest: 2 })));
        assert!(started.elapsed() < Duration::from_millis(30));
        assert_eq!(ether.frames_sent(), 0);
    }

    #[tokio::test]
    async fn test_discovering_route_is_no_route() {
        let ether = Ether::new();
        let mut a = node(&ether, 1).await;
        a.add_route_to(2, 2, RouteState::Discovering);
        let result = a.send_to_wait(b"hello", 2).await;
        assert!(matches!(result, Err(Error::NoRoute { dest: 2 })));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let ether = Ether::new();
        let mut a = node(&ether, 1).await;
        a.add_route_to(2, 2, RouteState::Valid);

        let payload = vec![0u8; a.max_message_length() + 1];
        let result = a.send_to_wait(&payload, 2).await;
        assert!(matches!(result, Err(Error::InvalidLength { .. })));
        assert_eq!(ether.frames_sent(), 0);
    }

    #[tokio::test]
    async fn test_multi_hop_delivery() {
        let ether = Ether::linear(&[1, 2, 3]);
        let [mut a, b, c] = chain(&ether).await;
        let (_, relay) = serve(b);
        let (mut inbox, sink) = serve(c);

        a.send_to_wait(b"over the hill", 3).await.unwrap();

        let message = inbox.recv().await.unwrap();
        assert_eq!(&message.payload[..], b"over the hill");
        assert_eq!(message.header.source, 1);
        assert_eq!(message.header.dest, 3);
        assert_eq!(message.header.hops, 1);
        assert_eq!(message.hop_from, 2);
        relay.abort();
        sink.abort();
    }

    #[tokio::test]
    async fn test_hop_limit_drops() {
        let ether = Ether::linear(&[1, 2, 3]);
        let [mut a, mut b, c] = chain(&ether).await;
        b.set_max_hops(0);
        let (_, relay) = serve(b);
        let (mut inbox, sink) = serve(c);

        // The first hop still acknowledges
        a.send_to_wait(b"too far", 3).await.unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(100), inbox.recv()).await;
        assert!(nothing.is_err());
        relay.abort();
        sink.abort();
    }

    #[tokio::test]
    async fn test_first_hop_ack_is_success() {
        let ether = Ether::linear(&[1, 2, 3]);
        let [mut a, mut b, _c] = chain(&ether).await;
        // The relay cannot reach 3 but the sender is not told
        b.delete_route_to(3);
        let (_, relay) = serve(b);

        a.send_to_wait(b"lost downstream", 3).await.unwrap();
        relay.abort();
    }

    #[tokio::test]
    async fn test_broadcast_needs_no_route() {
        let ether = Ether::new();
        let mut a = node(&ether, 1).await;
        let b = node(&ether, 2).await;
        let (mut inbox, task) = serve(b);

        a.send_to_wait(b"all", BROADCAST_ADDRESS).await.unwrap();
        let message = inbox.recv().await.unwrap();
        assert_eq!(message.header.dest, BROADCAST_ADDRESS);
        assert_eq!(&message.payload[..], b"all");
        task.abort();
    }

    #[tokio::test]
    async fn test_app_flags_masked() {
        let ether = Ether::new();
        let mut a = node(&ether, 1).await;
        let b = node(&ether, 2).await;
        a.add_route_to(2, 2, RouteState::Valid);
        let (mut inbox, task) = serve(b);

        a.send_to_from_source_wait(b"x", 2, 9, 0xff).await.unwrap();
        let message = inbox.recv().await.unwrap();
        assert_eq!(message.header.source, 9);
        assert_eq!(message.header.flags, flags::APPLICATION_SPECIFIC);
        task.abort();
    }
}
