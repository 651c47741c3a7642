//! Simulated radio medium.
//!
//! An [`Ether`] connects any number of [`SimDriver`]s in one process. Every
//! transmitted frame reaches each station linked to the sender, where the
//! driver filters it by address exactly as a real radio would. Links can be
//! restricted to build multi-hop topologies, and frames can be dropped to
//! exercise retransmission. Like a radio's receive buffer, each driver keeps
//! one frame: a frame not collected before the next one lands is lost.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::driver::{Driver, DriverState, Mode};
use crate::error::{Error, Result};
use crate::protocol::{Frame, MAX_MESSAGE_LEN};

/// Identifies a station on the ether, independent of its node address.
pub type StationId = u8;

/// Seed for the loss generator, so lossy runs are repeatable.
const LOSS_SEED: u64 = 0x5eed;

struct EtherInner {
    stations: HashMap<StationId, mpsc::UnboundedSender<Frame>>,
    /// `None` while every station hears every other.
    links: Option<HashSet<(StationId, StationId)>>,
    drops: HashMap<(StationId, StationId), u32>,
    loss: f64,
    rng: StdRng,
    frames_sent: u64,
}

impl EtherInner {
    fn hears(&self, from: StationId, to: StationId) -> bool {
        self.links
            .as_ref()
            .is_none_or(|links| links.contains(&(from, to)))
    }

    /// Switches to explicit links, keeping the current full connectivity.
    fn restrict(&mut self) -> &mut HashSet<(StationId, StationId)> {
        let stations: Vec<StationId> = self.stations.keys().copied().collect();
        self.links.get_or_insert_with(|| {
            stations
                .iter()
                .flat_map(|&a| stations.iter().map(move |&b| (a, b)))
                .filter(|(a, b)| a != b)
                .collect()
        })
    }

    fn lost(&mut self, from: StationId, to: StationId) -> bool {
        if let Some(count) = self.drops.get_mut(&(from, to)) {
            if *count > 0 {
                *count -= 1;
                return true;
            }
        }
        self.loss > 0.0 && self.rng.gen_bool(self.loss)
    }
}

/// A shared broadcast medium.
#[derive(Clone)]
pub struct Ether {
    inner: Arc<Mutex<EtherInner>>,
}

impl Default for Ether {
    fn default() -> Self {
        Self::new()
    }
}

impl Ether {
    /// Creates a medium where every station hears every other.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EtherInner {
                stations: HashMap::new(),
                links: None,
                drops: HashMap::new(),
                loss: 0.0,
                rng: StdRng::seed_from_u64(LOSS_SEED),
                frames_sent: 0,
            })),
        }
    }

    /// Creates a chain where only neighbours in `stations` hear each other.
    #[must_use]
    pub fn linear(stations: &[StationId]) -> Self {
        let ether = Self::new();
        ether.inner.lock().links = Some(HashSet::new());
        for pair in stations.windows(2) {
            ether.link(pair[0], pair[1]);
        }
        ether
    }

    /// Attaches a new station and returns its driver.
    ///
    /// The driver's node address starts out equal to `station`.
    #[must_use]
    pub fn attach(&self, station: StationId) -> SimDriver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().stations.insert(station, tx);

        let mut state = DriverState::new();
        state.this_address = station;
        SimDriver {
            station,
            ether: self.clone(),
            state,
            rx,
            frame: None,
            max_message_length: MAX_MESSAGE_LEN as u8,
        }
    }

    /// Lets `a` and `b` hear each other.
    pub fn link(&self, a: StationId, b: StationId) {
        let mut inner = self.inner.lock();
        let links = inner.restrict();
        links.insert((a, b));
        links.insert((b, a));
    }

    /// Stops `a` and `b` from hearing each other.
    pub fn unlink(&self, a: StationId, b: StationId) {
        let mut inner = self.inner.lock();
        let links = inner.restrict();
        links.remove(&(a, b));
        links.remove(&(b, a));
    }

    /// Returns true if frames sent by `from` reach `to`.
    #[must_use]
    pub fn can_hear(&self, from: StationId, to: StationId) -> bool {
        from != to && self.inner.lock().hears(from, to)
    }

    /// Drops the next `count` frames travelling from `from` to `to`.
    pub fn drop_next(&self, from: StationId, to: StationId, count: u32) {
        *self.inner.lock().drops.entry((from, to)).or_default() += count;
    }

    /// Sets the probability that any single delivery is lost.
    pub fn set_loss(&self, probability: f64) {
        self.inner.lock().loss = probability.clamp(0.0, 1.0);
    }

    /// Number of frames transmitted on this medium so far.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.inner.lock().frames_sent
    }

    fn transmit(&self, from: StationId, frame: &Frame) {
        let mut inner = self.inner.lock();
        inner.frames_sent += 1;

        let receivers: Vec<StationId> = inner
            .stations
            .keys()
            .copied()
            .filter(|&to| to != from && inner.hears(from, to))
            .collect();

        for to in receivers {
            if inner.lost(from, to) {
                tracing::trace!("ether lost frame {} -> {}", from, to);
                continue;
            }
            if let Some(tx) = inner.stations.get(&to) {
                // A detached station simply hears nothing
                let _ = tx.send(frame.clone());
            }
        }
    }
}

/// Driver for a station on an [`Ether`].
pub struct SimDriver {
    station: StationId,
    ether: Ether,
    state: DriverState,
    rx: mpsc::UnboundedReceiver<Frame>,
    frame: Option<Frame>,
    max_message_length: u8,
}

impl SimDriver {
    /// Limits the payload length, like a radio with a smaller FIFO.
    #[must_use]
    pub fn with_max_message_length(mut self, len: u8) -> Self {
        self.max_message_length = len;
        self
    }

    /// The station id on the ether.
    #[must_use]
    pub const fn station(&self) -> StationId {
        self.station
    }

    /// Puts the radio to sleep or wakes it. A sleeping radio hears nothing.
    pub fn set_sleep(&mut self, sleep: bool) {
        if sleep {
            self.state.set_mode(Mode::Sleep);
            self.frame = None;
        } else if self.state.mode() == Mode::Sleep {
            self.state.set_mode(Mode::Idle);
        }
    }

    fn transmit(&mut self, data: Bytes) -> Result<()> {
        match self.state.mode() {
            Mode::Initialising => return Err(Error::NotInitialised),
            Mode::Sleep => self.state.set_mode(Mode::Idle),
            _ => {}
        }
        let max = usize::from(self.max_message_length);
        if data.len() > max {
            return Err(Error::InvalidLength {
                len: data.len(),
                max,
            });
        }

        let frame = Frame {
            header: self.state.tx_header(),
            payload: data,
        };
        tracing::trace!(
            "station {} sends {:?} {}",
            self.station,
            frame.header,
            hex::encode(&frame.payload)
        );
        self.state.set_mode(Mode::Tx);
        self.ether.transmit(self.station, &frame);
        self.state.set_mode(Mode::Idle);
        self.state.record_tx_good();
        Ok(())
    }
}

impl Driver for SimDriver {
    fn init(&mut self) -> BoxFuture<'_, Result<()>> {
        self.state.set_mode(Mode::Idle);
        future::ready(Ok(())).boxed()
    }

    fn send(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        future::ready(self.transmit(data)).boxed()
    }

    fn wait_packet_sent(&mut self, _timeout: Option<Duration>) -> BoxFuture<'_, bool> {
        future::ready(self.state.mode() != Mode::Tx).boxed()
    }

    fn available(&mut self) -> bool {
        match self.state.mode() {
            Mode::Initialising => return false,
            Mode::Sleep => {
                // Frames arriving while asleep are never heard
                while self.rx.try_recv().is_ok() {}
                return self.frame.is_some();
            }
            Mode::Tx => {}
            _ => self.state.set_mode(Mode::Rx),
        }
        // Everything on the air since the last poll has landed; a newer
        // frame overwrites one that was never collected
        while let Ok(frame) = self.rx.try_recv() {
            if self.state.admit(&frame) && self.frame.replace(frame).is_some() {
                tracing::trace!("station {}: unread frame overwritten", self.station);
            }
        }
        self.frame.is_some()
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        if !self.available() {
            return None;
        }
        let frame = self.frame.take()?;
        Some(self.state.deliver(&frame, buf))
    }

    fn max_message_length(&self) -> u8 {
        self.max_message_length
    }

    fn state(&self) -> &DriverState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DriverState {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BROADCAST_ADDRESS;

    async fn ready(ether: &Ether, station: StationId) -> SimDriver {
        let mut driver = ether.attach(station);
        driver.init().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_fully_connected_by_default() {
        let ether = Ether::new();
        let mut a = ready(&ether, 1).await;
        let mut b = ready(&ether, 2).await;
        let mut c = ready(&ether, 3).await;

        a.set_header_to(BROADCAST_ADDRESS);
        a.send(Bytes::from_static(b"hi all")).await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf), Some(6));
        assert_eq!(c.recv(&mut buf), Some(6));
        assert_eq!(a.recv(&mut buf), None);
        assert_eq!(ether.frames_sent(), 1);
    }

    #[tokio::test]
    async fn test_linear_topology() {
        let ether = Ether::linear(&[1, 2, 3]);
        assert!(ether.can_hear(1, 2));
        assert!(ether.can_hear(2, 3));
        assert!(!ether.can_hear(1, 3));

        let mut a = ready(&ether, 1).await;
        let mut c = ready(&ether, 3).await;
        a.set_header_to(BROADCAST_ADDRESS);
        a.send(Bytes::from_static(b"x")).await.unwrap();
        assert!(!c.available());
    }

    #[tokio::test]
    async fn test_unlink_from_full_mesh() {
        let ether = Ether::new();
        let _a = ether.attach(1);
        let _b = ether.attach(2);
        let _c = ether.attach(3);
        ether.unlink(1, 3);
        assert!(ether.can_hear(1, 2));
        assert!(ether.can_hear(2, 3));
        assert!(!ether.can_hear(3, 1));
    }

    #[tokio::test]
    async fn test_newer_frame_overwrites_slot() {
        let ether = Ether::new();
        let mut a = ready(&ether, 1).await;
        let mut b = ready(&ether, 2).await;
        a.set_header_to(2);
        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();

        let mut buf = [0u8; 8];
        assert!(b.available());
        let len = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"two");
        assert!(!b.available());
        assert_eq!(b.recv(&mut buf), None);
        assert_eq!(b.stats().rx_good, 2);
    }

    #[tokio::test]
    async fn test_uncollected_frame_overwritten_after_poll() {
        let ether = Ether::new();
        let mut a = ready(&ether, 1).await;
        let mut b = ready(&ether, 2).await;
        a.set_header_to(2);

        a.send(Bytes::from_static(b"one")).await.unwrap();
        assert!(b.available());
        a.send(Bytes::from_static(b"two")).await.unwrap();

        let mut buf = [0u8; 8];
        let len = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"two");
        assert_eq!(b.recv(&mut buf), None);
    }

    #[tokio::test]
    async fn test_drop_next() {
        let ether = Ether::new();
        let mut a = ready(&ether, 1).await;
        let mut b = ready(&ether, 2).await;
        ether.drop_next(1, 2, 1);

        a.set_header_to(2);
        a.send(Bytes::from_static(b"lost")).await.unwrap();
        a.send(Bytes::from_static(b"kept")).await.unwrap();

        let mut buf = [0u8; 8];
        let len = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"kept");
        assert!(!b.available());
    }

    #[tokio::test]
    async fn test_total_loss() {
        let ether = Ether::new();
        let mut a = ready(&ether, 1).await;
        let mut b = ready(&ether, 2).await;
        ether.set_loss(1.0);
        a.send(Bytes::from_static(b"gone")).await.unwrap();
        assert!(!b.available());
    }

    #[tokio::test]
    async fn test_sleeping_radio_hears_nothing() {
        let ether = Ether::new();
        let mut a = ready(&ether, 1).await;
        let mut b = ready(&ether, 2).await;
        b.set_sleep(true);

        a.send(Bytes::from_static(b"zzz")).await.unwrap();
        assert!(!b.available());
        assert_eq!(b.mode(), Mode::Sleep);

        b.set_sleep(false);
        assert!(!b.available());
        a.send(Bytes::from_static(b"awake")).await.unwrap();
        assert!(b.available());
    }

    #[tokio::test]
    async fn test_not_initialised() {
        let ether = Ether::new();
        let mut a = ether.attach(1);
        assert!(matches!(
            a.send(Bytes::from_static(b"x")).await,
            Err(Error::NotInitialised)
        ));
    }

    #[tokio::test]
    async fn test_max_message_length() {
        let ether = Ether::new();
        let mut a = ready(&ether, 1).await.with_max_message_length(4);
        assert_eq!(a.max_message_length(), 4);
        assert!(matches!(
            a.send(Bytes::from_static(b"12345")).await,
            Err(Error::InvalidLength { len: 5, max: 4 })
        ));
    }
}
