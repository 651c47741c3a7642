//! # radiomesh
//!
//! Addressed, acknowledged and mesh-routed datagrams for packet radios and
//! serial links.
//!
//! The crate is a stack of layers, each owning the one below it:
//!
//! - [`Datagram`] adds node addresses to a raw [`Driver`]
//! - [`ReliableDatagram`] adds acknowledgements, retries and duplicate
//!   suppression
//! - [`Router`] forwards messages over several hops using a routing table
//! - [`Mesh`] discovers routes on demand and repairs broken ones
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Byte-exact DLE/STX serial framing with a CCITT CRC-16
//! - A simulated radio medium for multi-node tests
//! - Recoverable, typed errors for every failure
//!
//! ## Quick Start
//!
//! ```no_run
//! use radiomesh::{Ether, Mesh};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), radiomesh::Error> {
//!     // Three nodes in a row: 1 cannot hear 3 directly
//!     let ether = Ether::linear(&[1, 2, 3]);
//!     let mut a = Mesh::new(ether.attach(1), 1);
//!     let mut b = Mesh::new(ether.attach(2), 2);
//!     let mut c = Mesh::new(ether.attach(3), 3);
//!     a.init().await?;
//!     b.init().await?;
//!     c.init().await?;
//!
//!     tokio::spawn(async move {
//!         loop {
//!             b.recv_from_ack().await;
//!             tokio::task::yield_now().await;
//!         }
//!     });
//!     tokio::spawn(async move {
//!         loop {
//!             if let Some(message) = c.recv_from_ack().await {
//!                 println!("from {}: {:?}", message.header.source, message.payload);
//!             }
//!             tokio::task::yield_now().await;
//!         }
//!     });
//!
//!     // Finds the route through 2, then sends
//!     a.send_to_wait(b"hello", 3).await?;
//!     println!("{}", a.router().table());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Wire formats (addressing header, serial frames, CRC,
//!   routing header)
//! - [`driver`] - The [`Driver`] trait plus serial and simulated drivers
//! - [`datagram`] - Addressed unreliable datagrams
//! - [`reliable`] - Acknowledged datagrams
//! - [`router`] - Static multi-hop routing
//! - [`mesh`] - Dynamic route discovery

pub mod datagram;
pub mod driver;
pub mod error;
pub mod mesh;
pub mod protocol;
pub mod reliable;
pub mod router;

// Re-exports for convenience
pub use datagram::{Datagram, Received};
pub use driver::{Driver, DriverStats, Ether, Mode, SerialConfig, SerialDriver, SimDriver};
pub use driver::serial::list_ports;
pub use error::{Error, FrameError, Result};
pub use mesh::{Mesh, MeshConfig};
pub use protocol::{Address, BROADCAST_ADDRESS, Header};
pub use reliable::{Backoff, ReliableConfig, ReliableDatagram};
pub use router::{RouteEntry, RouteState, RoutedMessage, Router, RouterConfig, RoutingTable};
