//! Gzip payload compression stage

use crate::chain::{ChainError, TransformStage};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use meshtun_core::WirePacket;
use std::io::{Read, Write};
use tracing::debug;

/// Compresses outbound payloads, decompresses inbound ones
#[derive(Debug, Clone)]
pub struct Compressor {
    level: Compression,
    /// Decompression output cap, guards against gzip bombs
    max_output: usize,
}

impl Compressor {
    pub fn new(max_output: usize) -> Self {
        Self {
            level: Compression::default(),
            max_output,
        }
    }

    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), self.level);
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ChainError> {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .take(self.max_output as u64 + 1)
            .read_to_end(&mut out)
            .map_err(ChainError::Decompress)?;
        if out.len() > self.max_output {
            return Err(ChainError::DecompressedTooLarge(self.max_output));
        }
        Ok(out)
    }
}

impl TransformStage for Compressor {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn inbound(&self, mut packet: WirePacket) -> Result<WirePacket, ChainError> {
        let plain = self.decompress(packet.payload())?;
        packet.set_payload(plain);
        Ok(packet)
    }

    fn outbound(&self, mut packet: WirePacket) -> WirePacket {
        match self.compress(packet.payload()) {
            Ok(compressed) => packet.set_payload(compressed),
            Err(e) => {
                debug!("compression failed, sending empty payload: {}", e);
                packet.set_payload(Vec::new());
            }
        }
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtun_core::PeerId;

    fn packet(payload: Vec<u8>) -> WirePacket {
        WirePacket::data(payload, PeerId::ZERO, PeerId::ZERO)
    }

    #[test]
    fn test_roundtrip() {
        let stage = Compressor::new(64 * 1024);
        let data: Vec<u8> = (0..1400u32).map(|i| (i % 7) as u8).collect();

        let sent = stage.outbound(packet(data.clone()));
        assert!(sent.payload().len() < data.len());
        assert_eq!(sent.payload()[..2], [0x1f, 0x8b]);

        let received = stage.inbound(sent).unwrap();
        assert_eq!(received.payload().as_ref(), data.as_slice());
    }

    #[test]
    fn test_empty_payload() {
        let stage = Compressor::new(1024);
        let sent = stage.outbound(packet(Vec::new()));
        assert!(!sent.payload().is_empty());
        assert!(stage.inbound(sent).unwrap().payload().is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let stage = Compressor::new(1024);
        assert!(matches!(
            stage.inbound(packet(vec![1, 2, 3, 4])),
            Err(ChainError::Decompress(_))
        ));
    }

    #[test]
    fn test_output_cap() {
        let big = Compressor::new(1 << 20);
        let sent = big.outbound(packet(vec![0u8; 100_000]));

        let small = Compressor::new(1000);
        assert!(matches!(
            small.inbound(sent),
            Err(ChainError::DecompressedTooLarge(1000))
        ));
    }
}
