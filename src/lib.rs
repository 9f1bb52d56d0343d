//! Secure channel for pairing and reconnecting companion devices.
//!
//! Implements association (first-time pairing confirmed by a verification code) and
//! reconnection (challenge/response against a stored secret, then session resumption with
//! key rotation) on top of a framed message stream. Key agreement uses X25519 + HKDF, frames
//! are encrypted with ChaCha20-Poly1305, and wire envelopes are encoded using CBOR.

pub mod advertisement;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod handshake;
pub mod messages;
pub mod storage;
pub mod stream;
pub mod transport;

pub use advertisement::ReconnectAdvertisement;
pub use channel::{
    ChannelError, ChannelErrorCode, ChannelKind, ChannelPhase, SecureChannel,
    SecureChannelCallback, ShowVerificationCodeListener, ThreadSafeCallbacks, Verification,
};
pub use config::{ChannelConfig, ConfigError};
pub use crypto::{CryptoError, OobChannel, OobCipher, OobError, SessionKey};
pub use handshake::{
    EncryptionRunner, HandshakeError, HandshakeMessage, HandshakeState, X25519Initiator,
    X25519Runner,
};
pub use messages::{DeviceMessage, OperationType, StreamMessage, VersionExchange};
pub use storage::{InMemorySecretStore, SecretStore, StorageError, CHALLENGE_SECRET_BYTES};
pub use stream::{
    DeviceMessageStream, FrameTransport, LengthPrefixedStream, PacketStream, StreamError,
    StreamListener,
};
pub use transport::{LinkTransport, PipeTransport, PipeWriter, TimeoutTransport, TransportError};
