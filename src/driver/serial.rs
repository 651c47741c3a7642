//! Serial driver implementation.
//!
//! This module sends and receives framed datagrams over a serial byte
//! stream: RS232/RS485 links or radio modems with a serial interface. See
//! [`crate::protocol::frame`] for the wire format.

use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::driver::{Driver, DriverState, Mode};
use crate::error::{Error, Result};
use crate::protocol::{Frame, Framer, MAX_MESSAGE_LEN, encode_frame};

/// Default baud rate, as used by common serial telemetry radios.
pub const DEFAULT_BAUD_RATE: u32 = 57_600;

/// Raw chunks buffered between the read loop and the framer.
const CHUNK_QUEUE_DEPTH: usize = 64;

/// Configuration for a serial port.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }
}

/// Driver for framed datagrams over a byte stream.
///
/// A background task reads the stream and queues raw chunks; `available()`
/// runs everything queued through the [`Framer`]. Each valid frame for this
/// node lands in the single receive slot, overwriting one that was not yet
/// collected.
pub struct SerialDriver<S> {
    state: DriverState,
    stream: Option<S>,
    writer: Option<WriteHalf<S>>,
    chunks: Option<mpsc::Receiver<Bytes>>,
    pending: Bytes,
    framer: Framer,
    frame: Option<Frame>,
    read_task: Option<JoinHandle<()>>,
}

impl SerialDriver<SerialStream> {
    /// Opens a serial port.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        tracing::info!(
            "opening serial port {} at {} baud",
            config.port,
            config.baud_rate
        );
        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .open_native_async()
            .map_err(Error::Serial)?;
        Ok(Self::new(stream))
    }
}

impl<S> SerialDriver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Creates a driver over an already open byte stream.
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self {
            state: DriverState::new(),
            stream: Some(stream),
            writer: None,
            chunks: None,
            pending: Bytes::new(),
            framer: Framer::new(),
            frame: None,
            read_task: None,
        }
    }

    /// Runs the read loop, forwarding raw chunks until the stream closes.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the stream is closed.
    pub async fn run_read_loop(mut reader: ReadHalf<S>, chunk_tx: mpsc::Sender<Bytes>) -> Result<()> {
        let mut buf = [0u8; 256];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("serial stream closed");
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "serial stream closed",
                    )));
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("serial read error: {}", e);
                    return Err(Error::Io(e));
                }
            };

            tracing::trace!("received {} bytes", n);
            if chunk_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                tracing::debug!("serial driver dropped");
                return Ok(());
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let stream = self.stream.take().ok_or(Error::NotInitialised)?;

        let (reader, writer) = tokio::io::split(stream);
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        self.read_task = Some(tokio::spawn(async move {
            if let Err(e) = Self::run_read_loop(reader, chunk_tx).await {
                tracing::debug!("read loop ended: {}", e);
            }
        }));
        self.writer = Some(writer);
        self.chunks = Some(chunk_rx);
        self.framer.reset();
        self.state.set_mode(Mode::Idle);
        Ok(())
    }

    /// Runs all buffered bytes through the framer. The last frame for this
    /// node ends up in the receive slot.
    fn fill_slot(&mut self) -> bool {
        loop {
            while self.pending.has_remaining() {
                let byte = self.pending.get_u8();
                match self.framer.push(byte) {
                    Ok(Some(frame)) => {
                        if self.state.admit(&frame) && self.frame.replace(frame).is_some() {
                            tracing::trace!("unread serial frame overwritten");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!("dropping serial frame: {}", e);
                        self.state.record_rx_bad();
                    }
                }
            }

            let Some(chunks) = self.chunks.as_mut() else {
                return self.frame.is_some();
            };
            match chunks.try_recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return self.frame.is_some(),
            }
        }
    }
}

impl<S> Driver for SerialDriver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn init(&mut self) -> BoxFuture<'_, Result<()>> {
        future::ready(self.start()).boxed()
    }

    fn send(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if data.len() > MAX_MESSAGE_LEN {
                return Err(Error::InvalidLength {
                    len: data.len(),
                    max: MAX_MESSAGE_LEN,
                });
            }
            let frame = encode_frame(&self.state.tx_header(), &data)?;
            let writer = self.writer.as_mut().ok_or(Error::NotInitialised)?;

            tracing::trace!("sending frame {}", hex::encode(&frame));
            self.state.set_mode(Mode::Tx);
            let written = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }
            .await;
            self.state.set_mode(Mode::Idle);

            written.map_err(Error::Io)?;
            self.state.record_tx_good();
            Ok(())
        })
    }

    fn wait_packet_sent(&mut self, _timeout: Option<Duration>) -> BoxFuture<'_, bool> {
        // Writes complete inside `send`
        future::ready(self.state.mode() != Mode::Tx).boxed()
    }

    fn available(&mut self) -> bool {
        if self.state.mode() == Mode::Initialising {
            return false;
        }
        self.state.set_mode(Mode::Rx);
        self.fill_slot()
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        if !self.available() {
            return None;
        }
        let frame = self.frame.take()?;
        Some(self.state.deliver(&frame, buf))
    }

    fn max_message_length(&self) -> u8 {
        MAX_MESSAGE_LEN as u8
    }

    fn state(&self) -> &DriverState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DriverState {
        &mut self.state
    }
}

impl<S> Drop for SerialDriver<S> {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
