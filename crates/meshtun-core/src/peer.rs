//! Peer identity

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Width of a peer identity on the wire
pub const PEER_ID_SIZE: usize = 38;

/// Identity multihash prefix: identity hash, 36-byte digest, protobuf key
/// type field, key data field of 32 bytes.
const KEY_PREFIX: [u8; 6] = [0x00, 0x24, 0x08, 0x01, 0x12, 0x20];

/// Fixed-width opaque peer identifier.
///
/// Equality is byte-for-byte. Identities derived with [`PeerId::from_public_key`]
/// embed the peer's X25519 public key so it can be recovered without a
/// separate key store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; PEER_ID_SIZE]);

impl PeerId {
    /// The all-zero identity
    pub const ZERO: PeerId = PeerId([0; PEER_ID_SIZE]);

    /// Create from transport public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut id = [0u8; PEER_ID_SIZE];
        id[..KEY_PREFIX.len()].copy_from_slice(&KEY_PREFIX);
        id[KEY_PREFIX.len()..].copy_from_slice(public_key);
        Self(id)
    }

    /// Build from arbitrary bytes, zero-padding or truncating to the wire width.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut id = [0u8; PEER_ID_SIZE];
        let len = bytes.len().min(PEER_ID_SIZE);
        id[..len].copy_from_slice(&bytes[..len]);
        Self(id)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// The embedded public key, if this identity was derived from one.
    pub fn public_key(&self) -> Option<[u8; 32]> {
        if self.0[..KEY_PREFIX.len()] != KEY_PREFIX {
            return None;
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.0[KEY_PREFIX.len()..]);
        Some(key)
    }

    /// Full lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Skip the constant key prefix so short ids stay distinguishable
        let start = if self.public_key().is_some() {
            KEY_PREFIX.len()
        } else {
            0
        };
        write!(f, "{}", hex::encode(&self.0[start..start + 8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    /// Parses either a full 76-character identity or a 64-character
    /// public key, from which the identity is derived.
    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidPeerId(e.to_string()))?;
        match bytes.len() {
            PEER_ID_SIZE => Ok(Self::from_slice(&bytes)),
            32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                Ok(Self::from_public_key(&key))
            }
            n => Err(Error::InvalidPeerId(format!("unexpected length {n}"))),
        }
    }
}
