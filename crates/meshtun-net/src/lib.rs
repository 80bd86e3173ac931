//! Packet pipeline for the meshtun overlay VPN
//!
//! This crate provides:
//! - Stream deframing over the 88-byte wire header
//! - The gzip + Noise transform chain
//! - Per peer-pair sessions and the pre-shared-key Noise handshake
//! - Outbound routing with a bounded retry queue
//! - The service entrypoint tying the local device to peer streams

pub mod chain;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod framing;
pub mod interface;
pub mod ring;
pub mod routing;
pub mod seal;
pub mod service;
pub mod session;
pub mod transport;

pub use chain::{TransformChain, TransformStage};
pub use config::InterfaceConfig;
pub use crypto::{HandshakePattern, KeyPair, PreSharedKey};
pub use device::{DeviceFraming, DeviceReader, DeviceWriter};
pub use error::VpnError;
pub use framing::{FramingEngine, WireCodec};
pub use interface::{FrameOutcome, InterfaceStats, VpnInterface};
pub use ring::RetryRing;
pub use routing::{DirectoryError, PeerDirectory, Resolution, Router};
pub use service::{Device, ServiceHandle, VpnService};
pub use session::{SessionKey, SessionMap};
pub use transport::{PeerHost, PeerStream};
