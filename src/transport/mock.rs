//! Scripted in-memory port for byte-level protocol tests.
//!
//! `MockPort` implements `AsyncRead` and `AsyncWrite` and is handed to the
//! code under test (usually wrapped in a [`StreamTransport`]);
//! `MockDevice` stays in the test and plays the power monitor: it asserts on
//! the frames the host writes and feeds back response bytes in whatever
//! chunking the test wants.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut device) = mock::pair();
//! let codec = FrameCodec::new(HardwareFamily::Lvpm);
//!
//! device.expect_write(&codec.encode_command(&Command::GetStatus)).await;
//! device.send(&codec.encode_frame(&Frame::Status(status))?)?;
//! ```

use super::StreamTransport;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout, Duration};

/// Host-facing side of the mock port.
#[derive(Debug)]
pub struct MockPort {
    /// Bytes written by the host, forwarded to the device
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Bytes sent by the device, waiting to be read
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Received from the device but not yet read by the host
    read_buffer: VecDeque<u8>,
    shutdowns: Arc<AtomicUsize>,
}

/// Test-facing side of the mock port.
#[derive(Debug)]
pub struct MockDevice {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Written by the host but not yet asserted
    write_buffer: Vec<u8>,
    shutdowns: Arc<AtomicUsize>,
}

/// Create a connected port/device pair.
#[must_use]
pub fn pair() -> (MockPort, MockDevice) {
    let (host_to_device_tx, host_to_device_rx) = mpsc::unbounded_channel();
    let (device_to_host_tx, device_to_host_rx) = mpsc::unbounded_channel();
    let shutdowns = Arc::new(AtomicUsize::new(0));

    let port = MockPort {
        writes_tx: host_to_device_tx,
        reads_rx: device_to_host_rx,
        read_buffer: VecDeque::new(),
        shutdowns: Arc::clone(&shutdowns),
    };

    let device = MockDevice {
        writes_rx: host_to_device_rx,
        reads_tx: device_to_host_tx,
        write_buffer: Vec::new(),
        shutdowns,
    };

    (port, device)
}

/// Create a pair with the port already wrapped as a transport.
#[must_use]
pub fn transport(label: &str) -> (StreamTransport<MockPort>, MockDevice) {
    let (port, device) = pair();
    (StreamTransport::new(port, label), device)
}

impl MockPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Device dropped: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

impl MockDevice {
    /// Send bytes to the host as if the device produced them.
    ///
    /// # Errors
    /// Returns error if the host port has been dropped.
    pub fn send(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "host port disconnected")
    }

    /// Send bytes split into chunks of at most `chunk` bytes.
    ///
    /// # Errors
    /// Returns error if the host port has been dropped.
    pub fn send_chunked(&self, data: &[u8], chunk: usize) -> Result<(), &'static str> {
        for piece in data.chunks(chunk.max(1)) {
            self.send(piece)?;
        }
        Ok(())
    }

    /// Wait for the host to write `expected` and assert on it.
    ///
    /// # Panics
    /// Panics if the bytes do not arrive within 2 seconds or differ.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let timeout_duration = Duration::from_secs(2);

        while self.write_buffer.len() < expected.len() {
            match timeout(timeout_duration, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("host port closed while expecting a write"),
                Err(_) => panic!(
                    "timeout waiting for write: expected {:02x?}, received {:02x?}",
                    expected, self.write_buffer
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual, expected,
            "write mismatch: expected {expected:02x?}, got {actual:02x?}"
        );

        // Keep any excess for the next expectation
        self.write_buffer.drain(..expected.len());
    }

    /// Expect a write, then send a response.
    ///
    /// # Panics
    /// Panics on a mismatched write or a disconnected host.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send(response) {
            panic!("failed to send response: {e}");
        }
    }

    /// Discard pending writes without asserting on them.
    pub async fn drain_writes(&mut self) {
        let short_timeout = Duration::from_millis(50);

        while let Ok(Some(chunk)) = timeout(short_timeout, self.writes_rx.recv()).await {
            self.write_buffer.extend_from_slice(&chunk);
        }
        self.write_buffer.clear();
    }

    /// How many times the host shut the port down.
    #[must_use]
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    #[tokio::test]
    async fn command_response() {
        let (mut transport, mut device) = transport("mock");

        let host = tokio::spawn(async move {
            transport.write(&[0x7E, 0x02, 0x06, 0x08]).await.unwrap();
            let mut buf = [0u8; 16];
            let n = transport
                .read(&mut buf, Duration::from_secs(1))
                .await
                .unwrap();
            buf[..n].to_vec()
        });

        device
            .expect_and_respond(&[0x7E, 0x02, 0x06, 0x08], &[0x7E, 0x06])
            .await;
        assert_eq!(host.await.unwrap(), vec![0x7E, 0x06]);
    }

    #[tokio::test]
    async fn chunked_responses_arrive_in_pieces() {
        let (mut transport, device) = transport("mock");
        device.send_chunked(&[1, 2, 3, 4, 5], 2).unwrap();

        let mut buf = [0u8; 16];
        let mut received = Vec::new();
        while received.len() < 5 {
            let n = transport
                .read(&mut buf, Duration::from_millis(100))
                .await
                .unwrap();
            assert!(n <= 2);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn dropped_device_reads_as_closed() {
        let (mut transport, device) = transport("mock");
        drop(device);
        let mut buf = [0u8; 4];
        assert!(transport
            .read(&mut buf, Duration::from_millis(50))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn shutdowns_are_counted_once_per_close() {
        let (mut transport, mut device) = transport("mock");
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        device.drain_writes().await;
        assert_eq!(device.shutdown_count(), 1);
    }
}
