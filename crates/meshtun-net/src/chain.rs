//! Bidirectional transform chain
//!
//! Stages are listed wire-side first. Inbound data from the network walks
//! the list front to back; outbound data walks it back to front. With
//! `[seal, compress]` that yields decrypt-then-decompress inbound and
//! compress-then-encrypt outbound.

use crate::crypto::HandshakeError;
use meshtun_core::WirePacket;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::trace;

/// Transform stage errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("decompressed payload exceeds {0} bytes")]
    DecompressedTooLarge(usize),
    #[error("no session for key {0}")]
    SessionNotFound(String),
    #[error("decryption failed: {0}")]
    Decrypt(#[source] HandshakeError),
}

/// One reversible payload transformation
pub trait TransformStage: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Undo this stage on a packet arriving from the network
    fn inbound(&self, packet: WirePacket) -> Result<WirePacket, ChainError>;

    /// Apply this stage to a packet about to be sent.
    ///
    /// Failures yield an empty payload instead of an error so a bad packet
    /// never stalls the outbound path.
    fn outbound(&self, packet: WirePacket) -> WirePacket;
}

/// Ordered list of stages
#[derive(Default)]
pub struct TransformChain {
    stages: Vec<Box<dyn TransformStage>>,
    degraded: AtomicU64,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage further from the wire than the existing ones
    pub fn with<S: TransformStage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run a received packet through every stage, wire side first.
    pub fn inbound(&self, mut packet: WirePacket) -> Result<WirePacket, ChainError> {
        for stage in &self.stages {
            packet = stage.inbound(packet)?;
            packet.sync_size();
        }
        Ok(packet)
    }

    /// Run an outgoing packet through every stage, wire side last.
    pub fn outbound(&self, mut packet: WirePacket) -> WirePacket {
        let had_payload = !packet.payload().is_empty();
        for stage in self.stages.iter().rev() {
            packet = stage.outbound(packet);
            packet.sync_size();
        }
        if had_payload && packet.payload().is_empty() {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
        packet
    }

    /// Outbound packets whose payload a stage dropped
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }
}

/// Pass-through stage that traces frame headers
#[derive(Debug, Default)]
pub struct PacketLogger;

impl TransformStage for PacketLogger {
    fn name(&self) -> &'static str {
        "logger"
    }

    fn inbound(&self, packet: WirePacket) -> Result<WirePacket, ChainError> {
        let h = &packet.header;
        trace!(src = %h.src, dst = %h.dst, version = h.version, count = h.count, size = h.size, "> inbound");
        Ok(packet)
    }

    fn outbound(&self, packet: WirePacket) -> WirePacket {
        let h = &packet.header;
        trace!(src = %h.src, dst = %h.dst, version = h.version, count = h.count, size = h.size, "< outbound");
        packet
    }
}
