//! Bidirectional proxy relay
//!
//! A [`ProxySession`] bridges one raw TCP stream and one framed control
//! stream. Two directions run as independent tasks: frames from the
//! wrapped stream are unwrapped onto the raw stream, and raw bytes are
//! chunked into `Payload` frames going the other way. The first direction
//! to terminate decides the session outcome; the second is drained for a
//! bounded grace period and its result only logged.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use nb_protocol::{FramedReader, Message, ProtocolError, SharedWriter};

/// Upper bound on one raw-stream read; a chunk is whatever is immediately
/// available up to this cap.
pub const RELAY_CHUNK_SIZE: usize = 16 * 1024;

/// How long the losing direction may keep draining after the session
/// outcome is decided.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Relay direction, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    WrappedToRaw,
    RawToWrapped,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::WrappedToRaw => write!(f, "wrapped->raw"),
            Direction::RawToWrapped => write!(f, "raw->wrapped"),
        }
    }
}

/// One end-to-end relay session between a framed control stream and a raw
/// TCP stream.
pub struct ProxySession<R, W> {
    wrapped_rx: FramedReader<R>,
    wrapped_tx: SharedWriter<W>,
    raw: TcpStream,
    peer: String,
}

impl<R, W> ProxySession<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Create a session; `peer` labels log lines (client name or address).
    pub fn new(
        wrapped_rx: FramedReader<R>,
        wrapped_tx: SharedWriter<W>,
        raw: TcpStream,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            wrapped_rx,
            wrapped_tx,
            raw,
            peer: peer.into(),
        }
    }

    /// Run both directions to completion.
    ///
    /// Returns the outcome of the first direction to terminate. Exactly one
    /// `Disconnect` is written to the wrapped stream by the relay itself,
    /// best-effort, when that first termination happens.
    pub async fn run(self) -> Result<(), ProtocolError> {
        let Self {
            wrapped_rx,
            wrapped_tx,
            raw,
            peer,
        } = self;

        tracing::debug!("Relay for {} starting", peer);

        let (raw_rd, raw_wr) = raw.into_split();
        let (done_tx, mut done_rx) = mpsc::channel::<(Direction, Result<(), ProtocolError>)>(2);

        let unwrap_handle = tokio::spawn({
            let done_tx = done_tx.clone();
            async move {
                let result = wrapped_to_raw(wrapped_rx, raw_wr).await;
                let _ = done_tx.send((Direction::WrappedToRaw, result)).await;
            }
        });
        let wrap_handle = tokio::spawn({
            let wrapped_tx = wrapped_tx.clone();
            async move {
                let result = raw_to_wrapped(raw_rd, wrapped_tx).await;
                let _ = done_tx.send((Direction::RawToWrapped, result)).await;
            }
        });

        let (winner, outcome) = done_rx
            .recv()
            .await
            .expect("relay directions dropped without reporting");
        match &outcome {
            Ok(()) => tracing::debug!("Relay for {}: {} finished", peer, winner),
            Err(e) => tracing::warn!("Relay for {}: {} failed: {}", peer, winner, e),
        }

        // Peer may already be gone; this write is best-effort by design of
        // the protocol, so failures are swallowed.
        if let Err(e) = wrapped_tx.send(&Message::Disconnect).await {
            tracing::debug!("Relay for {}: disconnect notify failed: {}", peer, e);
        }

        match tokio::time::timeout(DRAIN_GRACE, done_rx.recv()).await {
            Ok(Some((direction, result))) => {
                if let Err(e) = result {
                    tracing::debug!("Relay for {}: {} ended late: {}", peer, direction, e);
                }
            }
            Ok(None) => {}
            Err(_) => {
                tracing::warn!("Relay for {}: draining direction timed out, aborting", peer);
                unwrap_handle.abort();
                wrap_handle.abort();
            }
        }

        tracing::debug!("Relay for {} finished", peer);
        outcome
    }
}

/// wrapped->raw: unwrap `Payload` frames onto the raw stream until a
/// `Disconnect` arrives or either stream fails.
async fn wrapped_to_raw<R>(
    mut wrapped_rx: FramedReader<R>,
    mut raw_wr: OwnedWriteHalf,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match wrapped_rx.read_message().await? {
            Message::Payload(bytes) => {
                raw_wr.write_all(&bytes).await?;
            }
            Message::Disconnect => {
                tracing::debug!("Tunneled peer disconnected, stopping relay");
                shutdown_raw(&mut raw_wr).await;
                return Ok(());
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "PAYLOAD or DISCONNECT",
                    got: other.name(),
                })
            }
        }
    }
}

/// raw->wrapped: chunk raw bytes into `Payload` frames until EOF or error.
async fn raw_to_wrapped<W>(
    mut raw_rd: OwnedReadHalf,
    wrapped_tx: SharedWriter<W>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    loop {
        let n = raw_rd.read(&mut buf).await?;
        if n == 0 {
            tracing::debug!("Raw stream EOF, stopping relay");
            return Ok(());
        }
        wrapped_tx
            .send(&Message::Payload(Bytes::copy_from_slice(&buf[..n])))
            .await?;
    }
}

/// Shut down the raw write side; repeated shutdowns are a no-op.
async fn shutdown_raw(raw_wr: &mut OwnedWriteHalf) {
    if let Err(e) = raw_wr.shutdown().await {
        if e.kind() != std::io::ErrorKind::NotConnected {
            tracing::debug!("Raw stream shutdown: {}", e);
        }
    }
}
