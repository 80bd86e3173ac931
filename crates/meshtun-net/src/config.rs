//! Interface configuration

use crate::crypto::HandshakePattern;
use crate::error::VpnError;
use std::time::Duration;

/// Default retry ring capacity (5 MiB)
pub const DEFAULT_RETRY_CAPACITY: usize = 5 * 1024 * 1024;

/// Default largest payload accepted from a peer (64 KiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Configuration for one VPN interface instance
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Shared secret phrase mixed into every handshake
    pub pre_shared_key: String,
    /// MTU on interface level
    pub mtu: usize,
    /// Noise pattern used for new sessions
    pub pattern: HandshakePattern,
    /// Bound on opening a stream plus the handshake round trip
    pub handshake_timeout: Duration,
    /// Bound on a single frame write to a peer stream
    pub write_timeout: Duration,
    /// Minimum gap between resolution requests for one address
    pub lookup_debounce: Duration,
    /// Total bytes the retry ring may hold
    pub retry_capacity: usize,
    /// Age after which queued packets are discarded unretried
    pub retry_max_age: Duration,
    /// How often the retry ring is drained
    pub retry_interval: Duration,
    /// Largest payload a peer may declare in a frame header
    pub max_payload: usize,
    /// Add a tracing stage to the transform chain
    pub log_packets: bool,
}

impl InterfaceConfig {
    /// Defaults with the given pre-shared key phrase
    pub fn new(pre_shared_key: impl Into<String>) -> Self {
        Self {
            pre_shared_key: pre_shared_key.into(),
            ..Self::default()
        }
    }

    /// Use a different handshake pattern
    pub fn with_pattern(mut self, pattern: HandshakePattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Set the MTU.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), VpnError> {
        if self.pre_shared_key.is_empty() {
            return Err(VpnError::Config("pre-shared key must not be empty".into()));
        }
        if self.mtu == 0 || self.mtu > self.max_payload {
            return Err(VpnError::Config(format!(
                "mtu {} outside 1..={}",
                self.mtu, self.max_payload
            )));
        }
        if self.retry_interval.is_zero() {
            return Err(VpnError::Config("retry interval must be positive".into()));
        }
        if self.handshake_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(VpnError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Size of the buffer needed to read one frame from the local device,
    /// including any platform info header.
    pub fn device_buffer_len(&self) -> usize {
        self.mtu + meshtun_core::packet::TUN_INFO_HEADER_SIZE
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            pre_shared_key: String::new(),
            mtu: 1420,
            pattern: HandshakePattern::default(),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            lookup_debounce: Duration::from_secs(5),
            retry_capacity: DEFAULT_RETRY_CAPACITY,
            retry_max_age: Duration::from_secs(20),
            retry_interval: Duration::from_secs(1),
            max_payload: DEFAULT_MAX_PAYLOAD,
            log_packets: false,
        }
    }
}
