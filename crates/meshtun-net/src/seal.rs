//! Session-keyed AEAD stage

use crate::chain::{ChainError, TransformStage};
use crate::session::{SessionKey, SessionMap};
use meshtun_core::WirePacket;
use std::sync::Arc;
use tracing::debug;

/// Encrypts with the cipher negotiated for the frame's (src, dst) pair
pub struct NoiseSealer {
    sessions: Arc<SessionMap>,
}

impl NoiseSealer {
    pub fn new(sessions: Arc<SessionMap>) -> Self {
        Self { sessions }
    }
}

impl TransformStage for NoiseSealer {
    fn name(&self) -> &'static str {
        "noise"
    }

    fn inbound(&self, mut packet: WirePacket) -> Result<WirePacket, ChainError> {
        let key = SessionKey::for_header(&packet.header);
        let cipher = self
            .sessions
            .get(&key)
            .and_then(|s| s.cipher)
            .ok_or_else(|| ChainError::SessionNotFound(key.as_str().to_string()))?;

        let plain = cipher
            .decrypt(packet.payload())
            .map_err(ChainError::Decrypt)?;
        packet.set_payload(plain);
        Ok(packet)
    }

    fn outbound(&self, mut packet: WirePacket) -> WirePacket {
        let key = SessionKey::for_header(&packet.header);
        let sealed = match self.sessions.get(&key).and_then(|s| s.cipher) {
            Some(cipher) => cipher.encrypt(packet.payload()).unwrap_or_else(|e| {
                debug!(dst = %packet.header.dst, "encryption failed: {}", e);
                Vec::new()
            }),
            None => {
                debug!(dst = %packet.header.dst, "no negotiated session, sending empty payload");
                Vec::new()
            }
        };
        packet.set_payload(sealed);
        packet
    }
}
