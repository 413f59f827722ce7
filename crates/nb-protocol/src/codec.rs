//! Framed message I/O over async streams
//!
//! A control connection is used from more than one task at a time (the
//! handshake logic and a relay direction both write), so the write half is
//! shared behind [`SharedWriter`], which serializes whole frames. Message
//! boundaries are never interleaved on one stream.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::ProtocolError;
use crate::frame::{self, MAX_FRAME_SIZE, MAX_LENGTH_PREFIX_BYTES};
use crate::message::Message;

/// Reads length-prefixed messages from a stream.
pub struct FramedReader<R> {
    inner: R,
}

impl<R> FramedReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap the read half of a control connection
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one complete message: length prefix, exact body, deserialize.
    pub async fn read_message(&mut self) -> Result<Message, ProtocolError> {
        let len = frame::read_length(&mut self.inner).await?;
        if len > MAX_FRAME_SIZE as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut body = vec![0u8; len as usize];
        self.inner.read_exact(&mut body).await?;

        let message: Message = bincode::deserialize(&body)?;
        tracing::trace!("Read {} frame of {} B", message.name(), len);
        Ok(message)
    }
}

/// Writes length-prefixed messages to a stream.
pub struct FramedWriter<W> {
    inner: W,
}

impl<W> FramedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wrap the write half of a control connection
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Serialize and write one message as a single length-prefixed frame.
    pub async fn write_message(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let body = bincode::serialize(message)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len() as u64,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(MAX_LENGTH_PREFIX_BYTES + body.len());
        frame::encode_length(body.len() as u64, &mut buf);
        buf.extend_from_slice(&body);

        tracing::trace!("Writing {} frame of {} B", message.name(), body.len());
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the underlying write half.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Cloneable, mutex-guarded handle to a [`FramedWriter`].
///
/// Concurrent writers on the same wrapped stream go through the mutex, so
/// a frame is always written atomically at the logical level.
pub struct SharedWriter<W> {
    inner: Arc<Mutex<FramedWriter<W>>>,
}

impl<W> Clone for SharedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W> SharedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Share a framed writer between tasks
    pub fn new(writer: FramedWriter<W>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Write one message, holding the stream lock for the whole frame.
    pub async fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        self.inner.lock().await.write_message(message).await
    }

    /// Shut down the underlying write half.
    pub async fn shutdown(&self) -> std::io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}
