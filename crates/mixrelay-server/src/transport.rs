//! Framed packet transport over any async byte stream.
//!
//! In production the stream is a TLS connection; tests drive sessions over
//! in-memory duplex pipes.

use std::io;

use bytes::BytesMut;
use mixrelay_proto::{FrameDecodeError, FrameDecoder, FrameEncodeError, Packet, encode_frame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes reserved ahead of each read.
const READ_CHUNK: usize = 32 * 1024;

/// Errors that end a transport's packet sequence.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Remote closed the stream
    #[error("connection closed by peer")]
    Closed,

    /// Socket or TLS failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer sent a frame over the size limit
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge {
        /// Configured limit
        max: usize,
    },

    /// Frame body is not a packet
    #[error("undecodable packet: {0}")]
    Decode(#[source] FrameDecodeError),

    /// Packet could not be serialized
    #[error("unencodable packet: {0}")]
    Encode(#[from] FrameEncodeError),
}

impl From<FrameDecodeError> for TransportError {
    fn from(err: FrameDecodeError) -> Self {
        match err {
            FrameDecodeError::TooLarge { max } => Self::FrameTooLarge { max },
            err @ FrameDecodeError::Decode(_) => Self::Decode(err),
        }
    }
}

/// One stream carrying terminator-delimited packets.
///
/// Not shareable: the owning session task performs every read and write, so
/// outbound frames never interleave.
#[derive(Debug)]
pub struct FramedTransport<S> {
    stream: S,
    decoder: FrameDecoder,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream.
    pub fn new(stream: S, max_frame_len: usize) -> Self {
        Self { stream, decoder: FrameDecoder::new(max_frame_len) }
    }

    /// Next inbound packet.
    ///
    /// Cancel safe: a partially received frame stays buffered.
    ///
    /// # Errors
    ///
    /// Any error is terminal for the connection.
    pub async fn receive(&mut self) -> Result<Packet, TransportError> {
        loop {
            if let Some(packet) = self.decoder.next_packet()? {
                return Ok(packet);
            }

            let buffer = reserve_read_space(self.decoder.buffer_mut());
            if self.stream.read_buf(buffer).await? == 0 {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Write one packet as a complete frame and flush it.
    ///
    /// # Errors
    ///
    /// Encoding or I/O failure.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let frame = encode_frame(packet)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write half.
    ///
    /// # Errors
    ///
    /// I/O failure while shutting down.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Underlying stream, for writes that bypass framing.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

fn reserve_read_space(buffer: &mut BytesMut) -> &mut BytesMut {
    if buffer.capacity() - buffer.len() < READ_CHUNK / 4 {
        buffer.reserve(READ_CHUNK);
    }
    buffer
}
