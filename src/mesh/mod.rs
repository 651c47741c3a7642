//! Mesh routing with on-demand route discovery.
//!
//! [`Mesh`] wraps a [`Router`] and fills its table automatically. Sending to
//! a node with no valid route floods a discovery request; every relay
//! records a reverse route to the requester and refloods, and the node that
//! was looked for answers with a unicast response along the reverse path.
//! Relays and the requester learn forward routes from the response as it
//! passes. A relay that fails to forward reports a route failure back to
//! the source so stale routes are dropped along the way.
//!
//! Discovery and failure messages are handled internally and never reach
//! the application.

mod message;

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::protocol::{Address, BROADCAST_ADDRESS};
use crate::router::{Dispatch, RouteState, RoutedMessage, Router, RouterConfig};

pub use message::{Discovery, MeshFrame, MessageType};

/// Default time to wait for a discovery response.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(4000);

/// Configuration for a mesh node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshConfig {
    /// How long `discover_route` waits for a response.
    pub discovery_timeout: Duration,
    /// Routing settings.
    pub router: RouterConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            router: RouterConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Sets the discovery timeout.
    #[must_use]
    pub const fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Sets the routing settings.
    #[must_use]
    pub const fn router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }
}

/// Outcome of processing one inbound message.
enum Polled {
    Application(RoutedMessage),
    DiscoveryResponse { dest: Address },
    Nothing,
}

/// Self-routing mesh node.
pub struct Mesh<D> {
    router: Router<D>,
    discovery_timeout: Duration,
    last_discovery_id: u8,
    seen_discoveries: [Option<u8>; 256],
    backlog: VecDeque<RoutedMessage>,
}

impl<D: Driver> Mesh<D> {
    /// Creates a mesh node with default settings.
    pub fn new(driver: D, this_address: Address) -> Self {
        Self::with_config(driver, this_address, MeshConfig::default())
    }

    /// Creates a mesh node with custom settings.
    pub fn with_config(driver: D, this_address: Address, config: MeshConfig) -> Self {
        Self {
            router: Router::with_config(driver, this_address, config.router),
            discovery_timeout: config.discovery_timeout,
            last_discovery_id: 0,
            seen_discoveries: [None; 256],
            backlog: VecDeque::new(),
        }
    }

    /// Initialises the driver.
    pub async fn init(&mut self) -> Result<()> {
        self.router.init().await
    }

    /// This node's address.
    #[must_use]
    pub const fn this_address(&self) -> Address {
        self.router.this_address()
    }

    /// Largest application payload one message can carry.
    pub fn max_message_length(&self) -> usize {
        self.router.max_message_length().saturating_sub(1)
    }

    /// The router below, including its routing table.
    pub const fn router(&self) -> &Router<D> {
        &self.router
    }

    /// The router below, including its routing table.
    pub fn router_mut(&mut self) -> &mut Router<D> {
        &mut self.router
    }

    /// Sends `buf` to `dest`, discovering a route first if needed.
    ///
    /// If the first hop of a known route stops answering, the route is
    /// dropped, rediscovered and the message is sent once more.
    ///
    /// # Errors
    ///
    /// `InvalidLength` if `buf` does not fit, `NoRoute` if discovery found
    /// nothing, `UnableToDeliver` if the first hop never acknowledged.
    pub async fn send_to_wait(&mut self, buf: &[u8], dest: Address) -> Result<()> {
        let max = self.max_message_length();
        if buf.len() > max {
            return Err(Error::InvalidLength {
                len: buf.len(),
                max,
            });
        }

        if dest != BROADCAST_ADDRESS && self.router.table().next_hop(dest).is_none() {
            self.discover_route(dest).await?;
        }

        let frame = MeshFrame::Application(Bytes::copy_from_slice(buf)).encode();
        match self.router.send_to_wait(&frame, dest).await {
            Err(Error::UnableToDeliver { to }) if dest != BROADCAST_ADDRESS => {
                tracing::info!("next hop {} towards {} failed, rediscovering", to, dest);
                self.discover_route(dest).await?;
                self.router.send_to_wait(&frame, dest).await
            }
            result => result,
        }
    }

    /// Floods a discovery request for `dest` and waits for the response.
    ///
    /// Any existing route to `dest` is marked `Discovering` meanwhile. On
    /// success the route is `Valid`; on timeout it is deleted. Application
    /// messages that arrive while waiting are kept for `recv_from_ack`.
    pub async fn discover_route(&mut self, dest: Address) -> Result<()> {
        if dest == BROADCAST_ADDRESS {
            return Ok(());
        }

        self.last_discovery_id = self.last_discovery_id.wrapping_add(1);
        let request = MeshFrame::DiscoveryRequest(Discovery {
            discovery_id: self.last_discovery_id,
            dest,
            route: Vec::new(),
        });
        if let Some(entry) = self.router.get_route_to(dest).copied() {
            self.router
                .add_route_to(dest, entry.next_hop, RouteState::Discovering);
        }
        tracing::debug!(
            "discovering route to {} (discovery {})",
            dest,
            self.last_discovery_id
        );
        self.router
            .send_to_wait(&request.encode(), BROADCAST_ADDRESS)
            .await?;

        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.discovery_timeout {
                break;
            }
            if self
                .router
                .wait_available_timeout(self.discovery_timeout - elapsed)
                .await
            {
                match self.poll_once().await {
                    Polled::Application(message) => self.keep_for_later(message),
                    Polled::DiscoveryResponse { dest: found } if found == dest => {
                        if self.router.table().next_hop(dest).is_some() {
                            tracing::info!("route to {} discovered", dest);
                            return Ok(());
                        }
                    }
                    Polled::DiscoveryResponse { .. } | Polled::Nothing => {}
                }
            }
            tokio::task::yield_now().await;
        }

        if self
            .router
            .get_route_to(dest)
            .is_some_and(|entry| entry.state == RouteState::Discovering)
        {
            self.router.delete_route_to(dest);
        }
        tracing::warn!("no route to {} found", dest);
        Err(Error::NoRoute { dest })
    }

    /// Collects a waiting application message.
    ///
    /// Messages for other nodes are forwarded and discovery traffic is
    /// handled; neither is returned.
    pub async fn recv_from_ack(&mut self) -> Option<RoutedMessage> {
        if let Some(message) = self.backlog.pop_front() {
            return Some(message);
        }
        match self.poll_once().await {
            Polled::Application(message) => Some(message),
            Polled::DiscoveryResponse { .. } | Polled::Nothing => None,
        }
    }

    /// Polls [`recv_from_ack`](Self::recv_from_ack) until an application
    /// message arrives or `timeout` elapses.
    pub async fn recv_from_ack_timeout(&mut self, timeout: Duration) -> Option<RoutedMessage> {
        if let Some(message) = self.backlog.pop_front() {
            return Some(message);
        }
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return None;
            }
            if self.router.wait_available_timeout(timeout - elapsed).await {
                if let Some(message) = self.recv_from_ack().await {
                    return Some(message);
                }
            }
            tokio::task::yield_now().await;
        }
    }

    /// Holds an application message that arrived during discovery. The
    /// backlog is bounded by the routing table capacity, oldest out first.
    fn keep_for_later(&mut self, message: RoutedMessage) {
        if self.backlog.len() >= self.router.table().capacity() {
            if let Some(dropped) = self.backlog.pop_front() {
                tracing::debug!(
                    "backlog full, dropping message {} from {}",
                    dropped.header.id,
                    dropped.header.source
                );
            }
        }
        self.backlog.push_back(message);
    }

    async fn poll_once(&mut self) -> Polled {
        let Some(message) = self.router.next_routed().await else {
            return Polled::Nothing;
        };
        let frame = MeshFrame::decode(&message.payload);
        if let Some(frame) = &frame {
            self.peek(frame, message.hop_from);
        }

        match self.router.dispatch(message).await {
            Dispatch::Deliver(message) => match frame {
                Some(MeshFrame::Application(payload)) => Polled::Application(RoutedMessage {
                    payload,
                    ..message
                }),
                Some(MeshFrame::DiscoveryRequest(discovery)) => {
                    self.handle_discovery_request(&message, discovery).await;
                    Polled::Nothing
                }
                Some(MeshFrame::DiscoveryResponse(discovery))
                    if message.header.dest == self.this_address() =>
                {
                    Polled::DiscoveryResponse {
                        dest: discovery.dest,
                    }
                }
                Some(_) => Polled::Nothing,
                None => {
                    tracing::debug!("undecodable mesh message from {}", message.header.source);
                    Polled::Nothing
                }
            },
            Dispatch::Forwarded {
                message,
                outcome: Err(e),
            } => {
                self.handle_forward_failure(&message, frame.as_ref(), &e).await;
                Polled::Nothing
            }
            Dispatch::Forwarded { outcome: Ok(()), .. } | Dispatch::Dropped => Polled::Nothing,
        }
    }

    /// Learns from discovery responses and route failures, whether they
    /// are addressed here or only passing through.
    fn peek(&mut self, frame: &MeshFrame, hop_from: Address) {
        match frame {
            MeshFrame::DiscoveryResponse(discovery) => {
                let this_address = self.this_address();
                let table = self.router.table_mut();
                table.add_route_to(discovery.dest, hop_from, RouteState::Valid);
                // Nodes between here and the responder sit behind hop_from
                let beyond = discovery
                    .route
                    .iter()
                    .position(|&node| node == this_address)
                    .map_or(0, |index| index + 1);
                for &node in &discovery.route[beyond..] {
                    table.add_route_to(node, hop_from, RouteState::Valid);
                }
            }
            MeshFrame::RouteFailure { dest } => {
                if self.router.delete_route_to(*dest) {
                    tracing::debug!("route to {} reported broken", dest);
                }
            }
            MeshFrame::Application(_) | MeshFrame::DiscoveryRequest(_) => {}
        }
    }

    async fn handle_discovery_request(
        &mut self,
        message: &RoutedMessage,
        mut discovery: Discovery,
    ) {
        let this_address = self.this_address();
        let source = message.header.source;
        if source == this_address
            || self.seen_discoveries[usize::from(source)] == Some(discovery.discovery_id)
            || discovery.route.contains(&this_address)
        {
            return;
        }
        self.seen_discoveries[usize::from(source)] = Some(discovery.discovery_id);

        // Reverse routes towards the requester
        let hop_from = message.hop_from;
        self.router.add_route_to(source, hop_from, RouteState::Valid);
        for &node in &discovery.route {
            self.router.add_route_to(node, hop_from, RouteState::Valid);
        }

        if discovery.dest == this_address {
            tracing::debug!("answering discovery {} from {}", discovery.discovery_id, source);
            let response = MeshFrame::DiscoveryResponse(discovery).encode();
            if let Err(e) = self.router.send_to_wait(&response, source).await {
                tracing::warn!("failed to answer discovery from {}: {}", source, e);
            }
        } else if discovery.route.len() < usize::from(self.router.max_hops()) {
            discovery.route.push(this_address);
            let request = MeshFrame::DiscoveryRequest(discovery).encode();
            if let Err(e) = self
                .router
                .send_to_from_source_wait(&request, BROADCAST_ADDRESS, source, 0)
                .await
            {
                tracing::debug!("not reflooding discovery from {}: {}", source, e);
            }
        }
    }

    async fn handle_forward_failure(
        &mut self,
        message: &RoutedMessage,
        frame: Option<&MeshFrame>,
        error: &Error,
    ) {
        let dest = message.header.dest;
        let source = message.header.source;
        tracing::warn!("cannot forward from {} to {}: {}", source, dest, error);

        self.router.delete_route_to(dest);
        if source == self.this_address() || matches!(frame, Some(MeshFrame::RouteFailure { .. }))
        {
            return;
        }
        self.router
            .add_route_to(source, message.hop_from, RouteState::Valid);
        let failure = MeshFrame::RouteFailure { dest }.encode();
        if let Err(e) = self.router.send_to_wait(&failure, source).await {
            tracing::warn!("failed to report broken route to {}: {}", source, e);
        }
    }
}
