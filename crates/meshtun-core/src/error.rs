//! Error types for meshtun wire handling

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// meshtun core error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Fewer bytes than a full header are buffered
    #[error("incomplete frame: need {needed} header bytes, have {available}")]
    IncompleteFrame { needed: usize, available: usize },

    /// The header decoded but the declared payload has not fully arrived
    #[error("incomplete payload: header declares {declared} bytes, have {available}")]
    IncompletePayload { declared: usize, available: usize },

    /// Declared payload exceeds the accepted maximum
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame type byte is neither DATA nor HANDSHAKE
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    /// IP header is shorter than its version requires
    #[error("truncated IPv{version} packet: {len} bytes")]
    TruncatedIpPacket { version: u8, len: usize },

    /// IP version nibble is neither 4 nor 6
    #[error("cannot identify IP header version: {0}")]
    UnsupportedIpVersion(u8),

    /// Peer identity string could not be parsed
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}

impl Error {
    /// Whether this error only means "wait for more bytes".
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            Error::IncompleteFrame { .. } | Error::IncompletePayload { .. }
        )
    }
}
