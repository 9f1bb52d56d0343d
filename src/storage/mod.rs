//! Per-device secret persistence.
//!
//! A device id is the primary key for everything stored here: the session key negotiated
//! with that device and the challenge secret used for reconnection proofs.

use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{hmac_sha256, CryptoError};

pub mod memory;

pub use memory::{InMemorySecretStore, StoreSnapshot};

/// Exact length of a challenge secret.
pub const CHALLENGE_SECRET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("challenge secret must be {CHALLENGE_SECRET_BYTES} bytes, got {0}")]
    InvalidSecretLength(usize),
    #[error("no challenge secret stored for device {0}")]
    MissingSecret(Uuid),
    #[error("failed to seal secret: {0}")]
    Seal(CryptoError),
    #[error("failed to unseal secret: {0}")]
    Unseal(CryptoError),
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Key-value store for per-device secrets, shared by every channel.
///
/// Implementations must be safe to call concurrently from channels serving different
/// devices, and each save must either fully apply or leave the previous value in place.
pub trait SecretStore: Send + Sync {
    /// Stable identifier of this device, sent to peers during association.
    fn unique_id(&self) -> Uuid;

    fn encryption_key(&self, device_id: &Uuid) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError>;

    /// Replaces any key previously stored for `device_id`.
    fn save_encryption_key(&self, device_id: &Uuid, key: &[u8]) -> Result<(), StorageError>;

    fn challenge_secret(&self, device_id: &Uuid)
        -> Result<Option<Zeroizing<Vec<u8>>>, StorageError>;

    /// Rejects secrets that are not exactly [`CHALLENGE_SECRET_BYTES`] long.
    fn save_challenge_secret(&self, device_id: &Uuid, secret: &[u8]) -> Result<(), StorageError>;

    /// Removes every secret held for `device_id`.
    fn forget_device(&self, device_id: &Uuid) -> Result<(), StorageError>;

    /// HMAC-SHA256 of `value` keyed with the device's challenge secret.
    fn hash_with_challenge_secret(
        &self,
        device_id: &Uuid,
        value: &[u8],
    ) -> Result<Vec<u8>, StorageError> {
        let secret = self
            .challenge_secret(device_id)?
            .ok_or(StorageError::MissingSecret(*device_id))?;
        Ok(hmac_sha256(&secret, &[value]))
    }
}
