//! Byte transports between the host and a power monitor.
//!
//! The sampling engine only needs three things from a link: write a frame,
//! read whatever has arrived within a timeout, and close. [`Transport`]
//! captures exactly that, so real serial ports, in-memory duplex streams and
//! the scripted [`mock`] port are interchangeable.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite
//! - [`StreamTransport`]: [`Transport`] over any [`SerialPortIO`]
//! - [`TransportFactory`]: Opens the transport of one instrument
//!
//! # Utilities
//!
//! - [`drain_input`]: Discard stale bytes before talking to a device

pub mod mock;
#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::{open_serial_async, SerialTransport, SerialTransportFactory};

use crate::error::{PowerMonitorError, Result};
use crate::types::HardwareFamily;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Trait alias for async byte-stream I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can carry
/// the wire protocol. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (simulator)
/// - [`mock::MockPort`] (scripted tests)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Byte-oriented duplex link to one power monitor.
#[async_trait]
pub trait Transport: Send {
    /// Write one complete frame.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read whatever arrives within `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time. A link closed by the
    /// far end is an error, never `Ok(0)`.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the link. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Type-erased transport.
pub type DynTransport = Box<dyn Transport>;

/// Opens the transport of one instrument.
///
/// Called lazily, on the instrument's first command.
pub trait TransportFactory: Send + Sync {
    /// Open a link to the monitor identified by `family` and `serial`.
    fn connect(&self, family: HardwareFamily, serial: u32) -> BoxFuture<'static, Result<DynTransport>>;
}

impl<F> TransportFactory for F
where
    F: Fn(HardwareFamily, u32) -> BoxFuture<'static, Result<DynTransport>> + Send + Sync,
{
    fn connect(&self, family: HardwareFamily, serial: u32) -> BoxFuture<'static, Result<DynTransport>> {
        self(family, serial)
    }
}

/// [`Transport`] over any async byte stream.
#[derive(Debug)]
pub struct StreamTransport<T> {
    io: T,
    label: String,
    closed: bool,
}

impl<T: SerialPortIO> StreamTransport<T> {
    /// Wrap a stream; `label` names the link in errors and logs.
    pub fn new(io: T, label: impl Into<String>) -> Self {
        Self {
            io,
            label: label.into(),
            closed: false,
        }
    }

    /// Name of the link.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(PowerMonitorError::transport(format!(
                "{} is closed",
                self.label
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: SerialPortIO> Transport for StreamTransport<T> {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.io.write_all(bytes).await.map_err(|e| {
            PowerMonitorError::transport(format!("write to {} failed: {e}", self.label))
        })?;
        self.io.flush().await.map_err(|e| {
            PowerMonitorError::transport(format!("flush of {} failed: {e}", self.label))
        })
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.ensure_open()?;
        match tokio::time::timeout(timeout, self.io.read(buf)).await {
            Err(_) => Ok(0),
            Ok(Ok(0)) => Err(PowerMonitorError::transport(format!(
                "{} closed by device",
                self.label
            ))),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Ok(0)
            }
            Ok(Err(e)) => Err(PowerMonitorError::transport(format!(
                "read from {} failed: {e}",
                self.label
            ))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!(link = %self.label, "Closing transport");
        self.io.shutdown().await.map_err(|e| {
            PowerMonitorError::transport(format!("shutdown of {} failed: {e}", self.label))
        })
    }
}

/// Discard stale bytes from a freshly opened link.
///
/// Reads until nothing arrives for `quiet` or `budget` elapses. Returns the
/// number of bytes discarded.
pub async fn drain_input(
    transport: &mut dyn Transport,
    quiet: Duration,
    budget: Duration,
) -> Result<usize> {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + budget;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match transport.read(&mut discard, quiet.min(remaining)).await? {
            0 => break,
            n => total_discarded += n,
        }
    }

    Ok(total_discarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_times_out_with_zero() {
        let (_device, host) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(host, "duplex");
        let mut buf = [0u8; 8];
        let n = transport
            .read(&mut buf, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn closed_peer_is_an_error() {
        let (device, host) = tokio::io::duplex(64);
        drop(device);
        let mut transport = StreamTransport::new(host, "duplex");
        let mut buf = [0u8; 8];
        let err = transport
            .read(&mut buf, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PowerMonitorError::Transport { .. }));
    }

    #[tokio::test]
    async fn write_after_close_fails_and_close_is_idempotent() {
        let (mut device, host) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(host, "duplex");
        transport.write(b"\x7e\x02\x06\x08").await.unwrap();

        let mut received = [0u8; 4];
        device.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"\x7e\x02\x06\x08");

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.write(b"\x00").await.is_err());
    }

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut device, host) = tokio::io::duplex(256);
        device.write_all(&[0x55; 40]).await.unwrap();
        let mut transport = StreamTransport::new(host, "duplex");

        let discarded = drain_input(
            &mut transport,
            Duration::from_millis(20),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert_eq!(discarded, 40);
    }
}
