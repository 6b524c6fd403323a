//! Async framing over a byte stream.
//!
//! The read side accumulates bytes and splits whole frames out with
//! the codec's `frame_size`, the same shape as a length-prefixed TCP
//! read loop. `Framed` owns a whole stream for the lock-step
//! commissioning exchange; sessions split their stream instead and use
//! `FrameReader` plus `write_frame` on the halves.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use codec::frame::{FRAME_HEADER_SIZE, encode_frame, frame_size};
use codec::message::commissioning::CommissioningMessage;

use crate::ServiceError;

pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// The next frame payload, or `None` on a clean end of stream.
    pub async fn next(&mut self) -> Result<Option<BytesMut>, ServiceError> {
        loop {
            if let Some(size) = frame_size(&self.buf)? {
                let mut frame = self.buf.split_to(size);
                return Ok(Some(frame.split_off(FRAME_HEADER_SIZE)));
            }

            if self.reader.read_buf(&mut self.buf).await? == 0 {
                // A partial frame at EOF is a peer bug, not a clean
                // shutdown.
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ServiceError::Protocol(codec::Error::InvalidInput))
                };
            }
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), ServiceError> {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    encode_frame(payload, &mut out)?;
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// A whole framed stream, for the lock-step commissioning paths.
pub struct Framed<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Framed<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Option<BytesMut>, ServiceError> {
        loop {
            if let Some(size) = frame_size(&self.buf)? {
                let mut frame = self.buf.split_to(size);
                return Ok(Some(frame.split_off(FRAME_HEADER_SIZE)));
            }

            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ServiceError::Protocol(codec::Error::InvalidInput))
                };
            }
        }
    }

    pub async fn write_payload(&mut self, payload: &[u8]) -> Result<(), ServiceError> {
        write_frame(&mut self.stream, payload).await
    }

    /// Reads one frame and decodes it as a commissioning message; a
    /// closed stream surfaces as `SessionClosed`.
    pub async fn read_commissioning(&mut self) -> Result<CommissioningMessage, ServiceError> {
        let frame = self
            .read_frame()
            .await?
            .ok_or(ServiceError::SessionClosed)?;

        Ok(CommissioningMessage::decode(&frame)?)
    }

    pub async fn write_commissioning(
        &mut self,
        message: &CommissioningMessage,
    ) -> Result<(), ServiceError> {
        let payload = message.encode()?;
        self.write_payload(&payload).await
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
