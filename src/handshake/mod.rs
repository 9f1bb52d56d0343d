//! Key exchange engine contract.
//!
//! The secure channel drives an [`EncryptionRunner`] one step per inbound handshake frame and
//! reacts to the [`HandshakeState`] each step reports. Engines are opaque: the channel only
//! looks at the reported state, the next outbound bytes, the verification codes and the key.

use thiserror::Error;

use crate::crypto::SessionKey;

pub mod x25519;

pub use x25519::{X25519Initiator, X25519Runner};

/// Handshake progress as reported by the key exchange engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Unknown,
    InProgress,
    VerificationNeeded,
    OobVerificationNeeded,
    Finished,
    ResumingSession,
}

impl HandshakeState {
    /// Position in the handshake; a channel never moves to a lower rank.
    pub fn rank(self) -> u8 {
        match self {
            HandshakeState::Unknown => 0,
            HandshakeState::InProgress => 1,
            HandshakeState::VerificationNeeded
            | HandshakeState::OobVerificationNeeded
            | HandshakeState::ResumingSession => 2,
            HandshakeState::Finished => 3,
        }
    }

    pub fn can_advance_to(self, next: HandshakeState) -> bool {
        next.rank() >= self.rank()
    }
}

/// Result of a single engine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub state: HandshakeState,
    pub next_message: Option<Vec<u8>>,
    pub verification_code: Option<String>,
    pub oob_verification_code: Option<Vec<u8>>,
    pub key: Option<SessionKey>,
}

impl HandshakeMessage {
    pub fn new(state: HandshakeState) -> Self {
        Self {
            state,
            next_message: None,
            verification_code: None,
            oob_verification_code: None,
            key: None,
        }
    }

    #[must_use]
    pub fn with_next_message(mut self, bytes: Vec<u8>) -> Self {
        self.next_message = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_verification_code(mut self, code: impl Into<String>) -> Self {
        self.verification_code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_oob_verification_code(mut self, code: Vec<u8>) -> Self {
        self.oob_verification_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: SessionKey) -> Self {
        self.key = Some(key);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("engine called in unexpected state {0:?}")]
    InvalidState(HandshakeState),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
}

/// Stateful key agreement primitive used by the secure channel (server side).
pub trait EncryptionRunner: Send {
    /// Handles the peer's init frame.
    fn respond_to_init_request(&mut self, message: &[u8]) -> Result<HandshakeMessage, HandshakeError>;

    /// Handles the peer's continuation frame.
    fn continue_handshake(&mut self, message: &[u8]) -> Result<HandshakeMessage, HandshakeError>;

    /// Confirms the verification code was accepted out of band and yields the key.
    fn verify_pin(&mut self) -> Result<HandshakeMessage, HandshakeError>;

    /// Authenticates a resumed session against the previously stored key.
    fn authenticate_reconnection(
        &mut self,
        message: &[u8],
        previous_key: &[u8],
    ) -> Result<HandshakeMessage, HandshakeError>;

    /// Selects the reconnection flow: after the continuation frame the engine reports
    /// [`HandshakeState::ResumingSession`] instead of asking for verification.
    fn set_is_reconnect(&mut self, is_reconnect: bool);
}
