//! VPN wire frame: fixed 88-byte header followed by the payload
//!
//! Layout (big-endian integers):
//!
//! ```text
//! offset 0:  version          (1 byte)
//! offset 1:  size             (4 bytes, payload length)
//! offset 5:  count            (4 bytes, sequence counter, unused)
//! offset 9:  type             (1 byte: 0 = DATA, 1 = HANDSHAKE)
//! offset 10: reserved         (2 bytes)
//! offset 12: destination id   (38 bytes)
//! offset 50: source id        (38 bytes)
//! offset 88: payload          (size bytes)
//! ```

use crate::error::{Error, Result};
use crate::peer::{PeerId, PEER_ID_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 88;

/// Protocol version written into every frame we emit
pub const PROTOCOL_VERSION: u8 = 1;

const SIZE_OFFSET: usize = 1;
const COUNT_OFFSET: usize = 5;
const TYPE_OFFSET: usize = 9;
const RESERVED_OFFSET: usize = 10;
const DST_OFFSET: usize = 12;
const SRC_OFFSET: usize = DST_OFFSET + PEER_ID_SIZE;

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Transform-chain processed IP packet
    Data = 0,
    /// Noise handshake message, never run through the chain
    Handshake = 1,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Handshake),
            other => Err(Error::UnknownFrameType(other)),
        }
    }
}

/// Fixed-size frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireHeader {
    pub version: u8,
    /// Payload length; rewritten from the payload before every encode
    pub size: u32,
    pub count: u32,
    pub frame_type: FrameType,
    pub reserved: [u8; 2],
    pub dst: PeerId,
    pub src: PeerId,
}

impl WireHeader {
    /// Create a header for the current protocol version
    pub fn new(frame_type: FrameType, dst: PeerId, src: PeerId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            size: 0,
            count: 0,
            frame_type,
            reserved: [0; 2],
            dst,
            src,
        }
    }

    /// Write the header to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.version);
        dst.put_u32(self.size);
        dst.put_u32(self.count);
        dst.put_u8(self.frame_type as u8);
        dst.put_slice(&self.reserved);
        dst.put_slice(self.dst.as_bytes());
        dst.put_slice(self.src.as_bytes());
    }

    /// Decode a header from the front of `src` without consuming anything.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(Error::IncompleteFrame {
                needed: HEADER_SIZE,
                available: src.len(),
            });
        }

        let size = u32::from_be_bytes([
            src[SIZE_OFFSET],
            src[SIZE_OFFSET + 1],
            src[SIZE_OFFSET + 2],
            src[SIZE_OFFSET + 3],
        ]);
        let count = u32::from_be_bytes([
            src[COUNT_OFFSET],
            src[COUNT_OFFSET + 1],
            src[COUNT_OFFSET + 2],
            src[COUNT_OFFSET + 3],
        ]);

        Ok(Self {
            version: src[0],
            size,
            count,
            frame_type: FrameType::try_from(src[TYPE_OFFSET])?,
            reserved: [src[RESERVED_OFFSET], src[RESERVED_OFFSET + 1]],
            dst: PeerId::from_slice(&src[DST_OFFSET..SRC_OFFSET]),
            src: PeerId::from_slice(&src[SRC_OFFSET..HEADER_SIZE]),
        })
    }

    /// Total encoded length of the frame this header describes
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.size as usize
    }
}

/// A header plus its opaque payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WirePacket {
    pub header: WireHeader,
    payload: Bytes,
}

impl WirePacket {
    /// Create a new frame; the header size tracks `payload`.
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>, dst: PeerId, src: PeerId) -> Self {
        let mut packet = Self {
            header: WireHeader::new(frame_type, dst, src),
            payload: Bytes::new(),
        };
        packet.set_payload(payload);
        packet
    }

    /// Create a data frame
    pub fn data(payload: impl Into<Bytes>, dst: PeerId, src: PeerId) -> Self {
        Self::new(FrameType::Data, payload, dst, src)
    }

    /// Create a handshake frame
    pub fn handshake(payload: impl Into<Bytes>, dst: PeerId, src: PeerId) -> Self {
        Self::new(FrameType::Handshake, payload, dst, src)
    }

    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Replace the payload and recompute the header size.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
        self.sync_size();
    }

    /// Overwrite `header.size` from the actual payload length.
    pub fn sync_size(&mut self) {
        self.header.size = self.payload.len() as u32;
    }

    /// Encoded length: header plus payload
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        let mut header = self.header;
        header.size = self.payload.len() as u32;
        dst.reserve(self.encoded_len());
        header.encode_into(dst);
        dst.put_slice(&self.payload);
    }

    /// Encode to a fresh buffer of exactly `encoded_len()` bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns the frame and the number of bytes it occupied. Nothing is
    /// consumed; on `IncompleteFrame`/`IncompletePayload` the caller keeps
    /// its buffer and retries once more bytes arrive.
    pub fn decode(src: &[u8]) -> Result<(Self, usize)> {
        let header = WireHeader::decode(src)?;
        let available = src.len() - HEADER_SIZE;
        let declared = header.size as usize;
        if available < declared {
            return Err(Error::IncompletePayload {
                declared,
                available,
            });
        }

        let payload = Bytes::copy_from_slice(&src[HEADER_SIZE..HEADER_SIZE + declared]);
        Ok((Self { header, payload }, HEADER_SIZE + declared))
    }
}
