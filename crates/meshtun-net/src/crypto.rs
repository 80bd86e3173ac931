//! Identity keys, pre-shared key derivation and the Noise handshake
//!
//! A session is bootstrapped by a two-message Noise exchange with the
//! pre-shared key mixed in before the first message (`psk0`), so a peer
//! holding the wrong key fails on the very first message it reads.

use meshtun_core::PeerId;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use snow::params::NoiseParams;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Largest Noise message, transport or handshake
pub const MAX_NOISE_MESSAGE: usize = 65535;

/// AEAD tag appended to every encrypted message
pub const TAG_LEN: usize = 16;

const PSK_CONTEXT: &str = "meshtun 2024-06 noise pre-shared key";

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake not complete")]
    NotComplete,
    #[error("handshake already complete")]
    AlreadyComplete,
    #[error("handshake previously failed")]
    Failed,
    #[error("handshake message expected")]
    MissingMessage,
    #[error("unexpected handshake message")]
    UnexpectedMessage,
    #[error("handshake carried an unexpected payload of {0} bytes")]
    UnexpectedPayload(usize),
    #[error("no public key known for peer {0}")]
    UnknownPeerKey(PeerId),
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error("noise error: {0}")]
    Noise(#[from] snow::Error),
}

/// Noise handshake pattern for new sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakePattern {
    /// Ephemeral-only exchange; the pre-shared key authenticates membership
    #[default]
    Anonymous,
    /// Both static keys are known up front and authenticated
    Known,
}

impl HandshakePattern {
    fn params(self) -> Result<NoiseParams, HandshakeError> {
        let name = match self {
            Self::Anonymous => "Noise_NNpsk0_25519_ChaChaPoly_BLAKE2b",
            Self::Known => "Noise_KKpsk0_25519_ChaChaPoly_BLAKE2b",
        };
        Ok(name.parse()?)
    }

    fn needs_static_keys(self) -> bool {
        matches!(self, Self::Known)
    }
}

impl std::str::FromStr for HandshakePattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anonymous" | "nn" => Ok(Self::Anonymous),
            "known" | "kk" => Ok(Self::Known),
            other => Err(format!("unknown handshake pattern: {other}")),
        }
    }
}

/// Long-term X25519 identity keypair
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: X25519Public,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Create from private key bytes
    pub fn from_private_key(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Raw private key bytes, as the Noise builder expects them
    pub fn private_key(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// The identity other peers know us by
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }
}

/// 32-byte Noise pre-shared key
#[derive(Clone, PartialEq, Eq)]
pub struct PreSharedKey([u8; 32]);

impl PreSharedKey {
    /// Derive from a configured phrase with BLAKE3 in key derivation mode
    pub fn derive(phrase: &str) -> Self {
        Self(blake3::derive_key(PSK_CONTEXT, phrase.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PreSharedKey(..)")
    }
}

/// Which side of the exchange we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Receiver,
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    /// Initiator that has not produced its first message yet
    Idle,
    /// Initiator waiting for the receiver's response
    EphemeralSent,
    /// Receiver waiting for the initiator's first message
    AwaitingEphemeral,
    /// Transport keys derived on this side
    Ready,
    /// A message failed to verify; the state is unusable
    Failed,
}

/// One side of a session handshake, and afterwards its transport cipher.
pub struct Handshake {
    role: HandshakeRole,
    stage: HandshakeStage,
    noise: Option<snow::HandshakeState>,
    transport: Option<snow::TransportState>,
}

impl Handshake {
    /// Start a handshake towards `remote`
    pub fn initiator(
        pattern: HandshakePattern,
        local: &KeyPair,
        remote: &PeerId,
        psk: &PreSharedKey,
    ) -> Result<Self, HandshakeError> {
        Self::build(HandshakeRole::Initiator, pattern, local, remote, psk)
    }

    /// Prepare to answer a handshake from `remote`
    pub fn receiver(
        pattern: HandshakePattern,
        local: &KeyPair,
        remote: &PeerId,
        psk: &PreSharedKey,
    ) -> Result<Self, HandshakeError> {
        Self::build(HandshakeRole::Receiver, pattern, local, remote, psk)
    }

    fn build(
        role: HandshakeRole,
        pattern: HandshakePattern,
        local: &KeyPair,
        remote: &PeerId,
        psk: &PreSharedKey,
    ) -> Result<Self, HandshakeError> {
        let private = local.private_key();
        let remote_key;
        let mut builder = snow::Builder::new(pattern.params()?).psk(0, psk.as_bytes());
        if pattern.needs_static_keys() {
            remote_key = remote
                .public_key()
                .ok_or(HandshakeError::UnknownPeerKey(*remote))?;
            builder = builder
                .local_private_key(&private)
                .remote_public_key(&remote_key);
        }

        let (noise, stage) = match role {
            HandshakeRole::Initiator => (builder.build_initiator()?, HandshakeStage::Idle),
            HandshakeRole::Receiver => {
                (builder.build_responder()?, HandshakeStage::AwaitingEphemeral)
            }
        };

        Ok(Self {
            role,
            stage,
            noise: Some(noise),
            transport: None,
        })
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    pub fn is_ready(&self) -> bool {
        self.stage == HandshakeStage::Ready
    }

    /// Advance the exchange.
    ///
    /// The initiator calls `step(None)` to get its first message, then
    /// `step(Some(response))`. The receiver calls `step(Some(first))` and
    /// gets the response to send back. Returns the message to transmit, if
    /// any.
    pub fn step(&mut self, message: Option<&[u8]>) -> Result<Option<Vec<u8>>, HandshakeError> {
        let result = self.advance(message);
        if result.is_err() && self.stage != HandshakeStage::Ready {
            self.stage = HandshakeStage::Failed;
            self.noise = None;
        }
        result
    }

    fn advance(&mut self, message: Option<&[u8]>) -> Result<Option<Vec<u8>>, HandshakeError> {
        match (self.stage, message) {
            (HandshakeStage::Ready, _) => Err(HandshakeError::AlreadyComplete),
            (HandshakeStage::Failed, _) => Err(HandshakeError::Failed),

            (HandshakeStage::Idle, None) => {
                let first = self.write_handshake()?;
                self.stage = HandshakeStage::EphemeralSent;
                Ok(Some(first))
            }
            (HandshakeStage::Idle, Some(_)) => Err(HandshakeError::UnexpectedMessage),

            (HandshakeStage::EphemeralSent, Some(response)) => {
                self.read_handshake(response)?;
                self.finish()?;
                Ok(None)
            }
            (HandshakeStage::AwaitingEphemeral, Some(first)) => {
                self.read_handshake(first)?;
                let response = self.write_handshake()?;
                self.finish()?;
                Ok(Some(response))
            }
            (HandshakeStage::EphemeralSent | HandshakeStage::AwaitingEphemeral, None) => {
                Err(HandshakeError::MissingMessage)
            }
        }
    }

    fn noise(&mut self) -> Result<&mut snow::HandshakeState, HandshakeError> {
        self.noise.as_mut().ok_or(HandshakeError::Failed)
    }

    fn write_handshake(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self.noise()?.write_message(&[], &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    fn read_handshake(&mut self, message: &[u8]) -> Result<(), HandshakeError> {
        if message.len() > MAX_NOISE_MESSAGE {
            return Err(HandshakeError::MessageTooLarge(message.len()));
        }
        let mut buf = vec![0u8; MAX_NOISE_MESSAGE];
        let len = self.noise()?.read_message(message, &mut buf)?;
        if len != 0 {
            return Err(HandshakeError::UnexpectedPayload(len));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), HandshakeError> {
        let noise = self.noise.take().ok_or(HandshakeError::Failed)?;
        if !noise.is_handshake_finished() {
            return Err(HandshakeError::NotComplete);
        }
        self.transport = Some(noise.into_transport_mode()?);
        self.stage = HandshakeStage::Ready;
        Ok(())
    }

    fn transport(&mut self) -> Result<&mut snow::TransportState, HandshakeError> {
        if self.stage != HandshakeStage::Ready {
            return Err(HandshakeError::NotComplete);
        }
        self.transport.as_mut().ok_or(HandshakeError::NotComplete)
    }

    /// Seal a message for the other side
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let len = plaintext.len() + TAG_LEN;
        if len > MAX_NOISE_MESSAGE {
            return Err(HandshakeError::MessageTooLarge(plaintext.len()));
        }
        let mut buf = vec![0u8; len];
        let written = self.transport()?.write_message(plaintext, &mut buf)?;
        buf.truncate(written);
        Ok(buf)
    }

    /// Open a message from the other side
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if ciphertext.len() > MAX_NOISE_MESSAGE {
            return Err(HandshakeError::MessageTooLarge(ciphertext.len()));
        }
        let transport = self.transport()?;
        let mut buf = vec![0u8; ciphertext.len()];
        let read = transport.read_message(ciphertext, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("stage", &self.stage)
            .finish()
    }
}

/// Negotiated cipher shared between the session map and the seal stage
pub struct SessionCipher {
    inner: Mutex<Handshake>,
}

impl SessionCipher {
    /// Wrap a completed handshake
    pub fn new(handshake: Handshake) -> Result<Self, HandshakeError> {
        if !handshake.is_ready() {
            return Err(HandshakeError::NotComplete);
        }
        Ok(Self {
            inner: Mutex::new(handshake),
        })
    }

    pub fn role(&self) -> HandshakeRole {
        self.inner.lock().role()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.inner.lock().encrypt(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.inner.lock().decrypt(ciphertext)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("role", &self.role())
            .finish()
    }
}
