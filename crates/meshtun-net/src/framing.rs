//! Stream deframing
//!
//! Peer streams deliver bytes, not messages. [`FramingEngine`] keeps an
//! append-only accumulator and yields frames once their header and full
//! payload have arrived, however the bytes were split.

use bytes::{Buf, BytesMut};
use meshtun_core::{WireHeader, WirePacket, HEADER_SIZE};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

/// Framing errors; both are fatal to the stream they occur on
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("wire error: {0}")]
    Wire(#[from] meshtun_core::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec for VPN wire frames
///
/// Wire format:
/// - 88 bytes: fixed header (see `meshtun_core::wire`)
/// - N bytes: payload, N taken from the header size field
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_payload: usize,
}

impl WireCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.max_payload {
            return Err(meshtun_core::Error::FrameTooLarge {
                size,
                max: self.max_payload,
            }
            .into());
        }
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = WirePacket;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Peek at the header
        let header = match WireHeader::decode(src) {
            Ok(header) => header,
            Err(e) if e.is_incomplete() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.check_size(header.size as usize)?;

        match WirePacket::decode(src) {
            Ok((packet, consumed)) => {
                src.advance(consumed);
                Ok(Some(packet))
            }
            Err(e) if e.is_incomplete() => {
                src.reserve(header.frame_len().saturating_sub(src.len()));
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Encoder<WirePacket> for WireCodec {
    type Error = FrameError;

    fn encode(&mut self, item: WirePacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.check_size(item.payload().len())?;
        item.encode_into(dst);
        Ok(())
    }
}

/// Accumulator plus codec for one byte stream
#[derive(Debug)]
pub struct FramingEngine {
    buffer: BytesMut,
    codec: WireCodec,
}

impl FramingEngine {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(HEADER_SIZE * 2),
            codec: WireCodec::new(max_payload),
        }
    }

    /// Append newly received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<WirePacket>, FrameError> {
        self.codec.decode(&mut self.buffer)
    }

    /// Append bytes and drain every frame they complete
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<WirePacket>, FrameError> {
        self.push(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes held for a frame that has not completed yet
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Read from `reader` until one frame completes.
    ///
    /// Returns `None` if the stream ends first. Bytes past the frame stay
    /// buffered for the next call.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<WirePacket>, FrameError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }
            if reader.read_buf(&mut self.buffer).await? == 0 {
                return Ok(None);
            }
        }
    }
}
