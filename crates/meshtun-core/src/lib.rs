//! meshtun Core Library
//!
//! This crate provides the wire-level building blocks of the meshtun
//! overlay VPN.
//!
//! # Modules
//!
//! - [`wire`]: Frame header and packet encoding (88-byte fixed header)
//! - [`peer`]: Fixed-width peer identities
//! - [`packet`]: IP header inspection for routing and TUN framing
//! - [`error`]: Error types

pub mod error;
pub mod packet;
pub mod peer;
pub mod wire;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use peer::{PeerId, PEER_ID_SIZE};
pub use wire::{FrameType, WireHeader, WirePacket, HEADER_SIZE, PROTOCOL_VERSION};
