//! Duplex message transport to one daemon endpoint.
//!
//! On the wire this is a Unix domain socket carrying the binary frames from
//! [`crate::daemon::codec`]. The transport can also be assembled from any
//! `AsyncRead`/`AsyncWrite` pair, which is how tests drive it with in-memory
//! duplex pipes.
//!
//! The two halves are independent: once split, the read half belongs to the
//! connection's receive pump and the write half is only ever touched under
//! the connection's dispatch lock. The transport itself does no locking and
//! is not safe for concurrent writers.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;

use crate::daemon::codec;
use crate::daemon::message::Message;
use crate::error::TransportError;

/// Read half of a transport. Exclusive to the receive pump.
pub struct TransportReader {
    inner: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
}

/// Write half of a transport. Writes are buffered; nothing reaches the OS
/// until [`TransportWriter::flush`] is called.
pub struct TransportWriter {
    inner: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
}

/// A connected duplex channel to a daemon.
pub struct DaemonTransport {
    reader: TransportReader,
    writer: TransportWriter,
}

impl std::fmt::Debug for DaemonTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonTransport").finish_non_exhaustive()
    }
}

impl DaemonTransport {
    /// Connect to the daemon listening at `socket_path`.
    pub async fn connect(
        socket_path: &Path,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(connect_timeout, UnixStream::connect(socket_path))
            .await
            .map_err(|_| TransportError::Io {
                kind: io::ErrorKind::TimedOut,
                message: format!(
                    "timed out after {:?} connecting to daemon at {}",
                    connect_timeout,
                    socket_path.display()
                ),
            })??;
        Ok(Self::new(stream))
    }

    pub fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_parts(reader, writer)
    }

    /// Assemble a transport from arbitrary halves, e.g. `tokio::io::duplex`.
    pub fn from_parts(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: TransportReader {
                inner: BufReader::new(Box::new(reader)),
            },
            writer: TransportWriter {
                inner: BufWriter::new(Box::new(writer)),
            },
        }
    }

    /// Split into independent halves for concurrent reader-and-writer use.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }

    /// Encode and write one frame without flushing.
    pub async fn dispatch(&mut self, message: &Message) -> Result<(), TransportError> {
        self.writer.dispatch(message).await
    }

    /// Force buffered bytes out to the OS.
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        self.writer.flush().await
    }

    /// Read one frame; `None` on clean EOF.
    pub async fn receive(&mut self) -> Result<Option<Message>, TransportError> {
        self.reader.receive().await
    }

    /// Shut down both halves. Errors are swallowed; teardown must not fail.
    pub async fn close(mut self) {
        self.writer.close().await;
    }
}

impl TransportReader {
    pub async fn receive(&mut self) -> Result<Option<Message>, TransportError> {
        codec::read_message(&mut self.inner).await
    }
}

impl TransportWriter {
    pub async fn dispatch(&mut self, message: &Message) -> Result<(), TransportError> {
        codec::write_message(&mut self.inner, message).await
    }

    pub async fn flush(&mut self) -> Result<(), TransportError> {
        self.inner.flush().await.map_err(TransportError::from)
    }

    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Strategy consulted on I/O failures to decide whether the daemon behind
/// the recorded endpoint is gone, as opposed to merely misbehaving.
///
/// Injected at connection construction so tests can force either answer and
/// the connector can plug in different heuristics per transport kind.
pub trait StaleAddressDetector: Send + Sync {
    /// True if the failure should be attributed to a stale registry entry.
    fn maybe_stale_address(&self, failure: &TransportError) -> bool;
}

/// Detector for Unix socket endpoints: errors that mean "nobody is listening
/// there any more" mark the address stale. Timeouts and malformed frames do
/// not; the daemon may be alive but slow or incompatible.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketStaleAddressDetector;

impl StaleAddressDetector for SocketStaleAddressDetector {
    fn maybe_stale_address(&self, failure: &TransportError) -> bool {
        matches!(
            failure.io_kind(),
            Some(
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotFound
                    | io::ErrorKind::AddrNotAvailable
            )
        )
    }
}
