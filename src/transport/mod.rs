//! Serial transport to the probe box bus.
//!
//! A [`Transport`] owns exactly one connection and exposes the handful of
//! primitives the polling loop needs: open/close, write, a bounded
//! read-until-terminator, and a buffer discard before each command.
//!
//! # Implementations
//!
//! - [`SerialTransport`]: real hardware through `tokio-serial`, or any
//!   `AsyncRead + AsyncWrite` stream (e.g. `tokio::io::duplex` in tests).
//! - [`mock::MockTransport`]: simulated box bus for tests and demos.
//!
//! Every suspension point is bounded: writes by the write timeout, reads by
//! the caller's timeout, so a dead device can never hang the loop.

pub mod claims;
pub mod mock;

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::spawn_blocking;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, trace};

/// Default bound on a single command write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Connection primitives used by the acquisition scheduler.
#[async_trait]
pub trait Transport: Send {
    /// Port name used for ownership claims and logging.
    fn port_name(&self) -> &str;

    /// Whether a physical handle is currently open.
    fn is_open(&self) -> bool;

    /// Open the connection.
    ///
    /// # Errors
    /// - [`TransportError::AlreadyOpen`] if a handle is already open
    /// - [`TransportError::PortUnavailable`] if the device cannot be opened
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Write all bytes, bounded by the transport's write timeout.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read until `terminator` arrives or `timeout` elapses.
    ///
    /// Best effort: returns whatever accumulated, possibly nothing, and never
    /// fails. The terminator is included when it arrived.
    async fn read_until_or_timeout(&mut self, terminator: u8, timeout: Duration) -> Vec<u8>;

    /// Drop any stale input waiting in the receive path.
    async fn discard_buffers(&mut self);

    /// Close the connection. No-op when already closed.
    async fn close(&mut self);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn port_name(&self) -> &str {
        (**self).port_name()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        (**self).open().await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes).await
    }

    async fn read_until_or_timeout(&mut self, terminator: u8, timeout: Duration) -> Vec<u8> {
        (**self).read_until_or_timeout(terminator, timeout).await
    }

    async fn discard_buffers(&mut self) {
        (**self).discard_buffers().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// SerialTransport
// =============================================================================

/// Transport over a serial port (8N1, no flow control).
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    write_timeout: Duration,
    /// Pre-connected stream handed over on the next `open`
    staged: Option<DynSerial>,
    stream: Option<DynSerial>,
    /// Bytes read past the last terminator
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Transport for a device path such as `/dev/ttyUSB0` or `COM3`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            staged: None,
            stream: None,
            pending: Vec::new(),
        }
    }

    /// Transport over an already-connected stream.
    ///
    /// The stream is adopted on the first `open`; once closed it cannot be
    /// reopened.
    pub fn from_stream(port_name: impl Into<String>, stream: DynSerial) -> Self {
        let mut transport = Self::new(port_name, 0);
        transport.staged = Some(stream);
        transport
    }

    /// Set the bound on a single write.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Configured baud rate (0 for adopted streams).
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Take up to and including the first `terminator` out of `pending`.
    fn take_through(&mut self, terminator: u8) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == terminator)? + 1;
        let rest = self.pending.split_off(end);
        Some(std::mem::replace(&mut self.pending, rest))
    }
}

/// Open a serial port on a blocking thread (8N1, no flow control).
pub async fn open_serial_async(
    port_name: &str,
    baud_rate: u32,
) -> Result<tokio_serial::SerialStream, TransportError> {
    let port_owned = port_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::PortUnavailable {
                port: port_owned.clone(),
                reason: e.to_string(),
            })
    })
    .await
    .map_err(|e| TransportError::PortUnavailable {
        port: port_name.to_string(),
        reason: format!("open task failed: {}", e),
    })?
}

/// Names of serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    tokio_serial::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| TransportError::PortUnavailable {
            port: "*".into(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl Transport for SerialTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        let stream: DynSerial = match self.staged.take() {
            Some(stream) => stream,
            None => Box::new(open_serial_async(&self.port_name, self.baud_rate).await?),
        };
        self.stream = Some(stream);
        self.pending.clear();
        debug!(port = %self.port_name, baud = self.baud_rate, "serial transport opened");
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;

        let write = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                trace!(port = %self.port_name, command = %String::from_utf8_lossy(bytes).escape_default(), "sent");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::WriteTimeout(self.write_timeout)),
        }
    }

    async fn read_until_or_timeout(&mut self, terminator: u8, timeout: Duration) -> Vec<u8> {
        if let Some(reply) = self.take_through(terminator) {
            return reply;
        }
        let Some(stream) = self.stream.as_mut() else {
            return std::mem::take(&mut self.pending);
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; 64];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    let had_terminator = chunk[..n].contains(&terminator);
                    self.pending.extend_from_slice(&chunk[..n]);
                    if had_terminator {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!(port = %self.port_name, error = %e, "serial read failed");
                    break;
                }
                Err(_) => break,
            }
        }

        self.take_through(terminator)
            .unwrap_or_else(|| std::mem::take(&mut self.pending))
    }

    async fn discard_buffers(&mut self) {
        self.pending.clear();
        if let Some(stream) = self.stream.as_mut() {
            let discarded = drain_ready(stream).await;
            if discarded > 0 {
                debug!(port = %self.port_name, discarded, "discarded stale bytes");
            }
        }
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(port = %self.port_name, "serial transport closed");
        }
        self.pending.clear();
    }
}

/// Read and discard bytes for as long as they are immediately available.
///
/// Never waits for new data; returns the number of bytes thrown away.
pub async fn drain_ready<R: AsyncRead + Unpin + ?Sized>(port: &mut R) -> usize {
    let mut discard = [0u8; 256];
    let mut total_discarded = 0usize;

    loop {
        match tokio::time::timeout(Duration::ZERO, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}
