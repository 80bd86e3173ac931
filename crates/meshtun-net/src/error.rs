//! Pipeline error type

use crate::chain::ChainError;
use crate::crypto::HandshakeError;
use crate::framing::FrameError;
use crate::transport::TransportError;
use meshtun_core::{FrameType, PeerId};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the VPN pipeline
#[derive(Debug, Error)]
pub enum VpnError {
    #[error("wire error: {0}")]
    Wire(#[from] meshtun_core::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    #[error("transform failed: {0}")]
    Chain(#[from] ChainError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No peer is known for the packet's destination address yet
    #[error("destination unknown: {0}")]
    DestinationUnknown(IpAddr),

    /// Frame addressed to some other peer
    #[error("frame for {dst} is not addressed to us")]
    Misrouted { dst: PeerId },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("empty packet")]
    EmptyPacket,

    /// Peer answered a handshake with something else, or not at all
    #[error("handshake with {peer} aborted: {reason}")]
    HandshakeAborted { peer: PeerId, reason: String },

    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),

    /// Local virtual device read or write failed
    #[error("device error: {0}")]
    Device(#[source] std::io::Error),

    /// Device write did not finish in time; the frame is lost
    #[error("device write timed out after {0:?}")]
    DeviceTimeout(Duration),

    /// Frame claims a source other than the peer the stream belongs to
    #[error("frame from {claimed} arrived on a stream owned by {stream_peer}")]
    SpoofedSource { claimed: PeerId, stream_peer: PeerId },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl VpnError {
    /// Whether the reader that hit this error can keep going.
    ///
    /// Per-frame failures drop the frame. Framing failures leave the stream
    /// unable to resync, a failed decrypt leaves the session's nonce
    /// sequence behind the sender's, and device failures leave nothing to
    /// deliver to.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            VpnError::Framing(_)
                | VpnError::Device(_)
                | VpnError::Chain(ChainError::Decrypt(_))
                | VpnError::Config(_)
                | VpnError::Join(_)
        )
    }

    /// Whether the packet that caused this error is worth queueing for retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VpnError::DestinationUnknown(_)
                | VpnError::Transport(_)
                | VpnError::HandshakeAborted { .. }
        ) || matches!(self, VpnError::Framing(FrameError::Io(_)))
    }

    /// Shorthand for a handshake that ended early
    pub(crate) fn aborted(peer: PeerId, reason: impl Into<String>) -> Self {
        VpnError::HandshakeAborted {
            peer,
            reason: reason.into(),
        }
    }
}
