//! Length-prefixed frame codec.
//!
//! Every frame on the wire is a 4-byte big-endian body length followed by the
//! JSON body. The receiver knows a frame is complete once `4 + length` bytes are
//! buffered; it never has to guess completion by attempting a parse.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::frame::Frame;

pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default cap on a single frame body (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Serialize a frame into its length-prefixed wire form.
pub fn encode_frame(frame: &Frame, max_frame_size: usize) -> Result<Bytes, ProtocolError> {
    let body = serde_json::to_vec(frame).map_err(ProtocolError::Malformed)?;
    let limit = max_frame_size.min(u32::MAX as usize);
    if body.len() > limit {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            limit,
        });
    }

    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    out.put_u32(body.len() as u32);
    out.put_slice(&body);
    Ok(out.freeze())
}

/// Result of asking the decoder for the next frame.
#[derive(Debug)]
pub enum DecodeStatus {
    Complete(Frame),
    /// More bytes are needed before a frame boundary is reached.
    Incomplete,
}

/// Accumulates stream chunks and cuts complete frames out of them.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Cut the next frame out of the buffer if one is complete.
    ///
    /// An oversized declared length fails immediately, before the body is
    /// accumulated.
    pub fn decode(&mut self) -> Result<DecodeStatus, ProtocolError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(DecodeStatus::Incomplete);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let body_len = u32::from_be_bytes(prefix) as usize;

        if body_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                limit: self.max_frame_size,
            });
        }

        if self.buffer.len() < LENGTH_PREFIX_SIZE + body_len {
            return Ok(DecodeStatus::Incomplete);
        }

        self.buffer.advance(LENGTH_PREFIX_SIZE);
        let body = self.buffer.split_to(body_len);
        let frame = serde_json::from_slice(&body).map_err(ProtocolError::Malformed)?;
        Ok(DecodeStatus::Complete(frame))
    }

    /// Called at end of stream. Leftover bytes mean the peer went away mid-frame.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::StreamClosed {
                buffered: self.buffer.len(),
            })
        }
    }
}

/// Read from `reader` in chunks of `chunk_size` until the next frame is complete.
///
/// Returns `Ok(None)` when the stream closes cleanly on a frame boundary. Safe to
/// cancel: bytes are only handed to the decoder after a read completes.
pub async fn read_frame<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    chunk_size: usize,
) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; chunk_size.max(1)];
    loop {
        if let DecodeStatus::Complete(frame) = decoder.decode()? {
            return Ok(Some(frame));
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            decoder.finish()?;
            return Ok(None);
        }
        decoder.extend(&chunk[..n]);
    }
}

/// Encode `frame` and write all of it, returning the number of bytes written.
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &Frame,
    max_frame_size: usize,
) -> Result<usize, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame, max_frame_size)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(bytes.len())
}
