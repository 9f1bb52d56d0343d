//! Reconnection advertisement payload.
//!
//! ```text
//! salt     = 8 random bytes
//! padded   = salt ‖ 8 zero bytes
//! response = HMAC-SHA256(challenge secret, padded)
//! payload  = response[..3] ‖ salt            (11 bytes)
//! ```
//!
//! The advertising side keeps the full `response`; a returning device must open its first
//! reconnection frame with it.

use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::random_bytes;
use crate::storage::{SecretStore, StorageError};

pub const SALT_BYTES: usize = 8;
pub const PADDED_SALT_BYTES: usize = 16;
pub const TRUNCATED_BYTES: usize = 3;
pub const ADVERTISEMENT_BYTES: usize = TRUNCATED_BYTES + SALT_BYTES;

/// Advertisement for one device plus the response it must later prove.
pub struct ReconnectAdvertisement {
    payload: [u8; ADVERTISEMENT_BYTES],
    expected_challenge_response: Zeroizing<Vec<u8>>,
}

impl ReconnectAdvertisement {
    /// Draws a fresh salt and hashes it with the challenge secret stored for `device_id`.
    pub fn create(store: &dyn SecretStore, device_id: &Uuid) -> Result<Self, StorageError> {
        let mut salt = [0u8; SALT_BYTES];
        salt.copy_from_slice(&random_bytes(SALT_BYTES));
        Self::with_salt(store, device_id, salt)
    }

    fn with_salt(
        store: &dyn SecretStore,
        device_id: &Uuid,
        salt: [u8; SALT_BYTES],
    ) -> Result<Self, StorageError> {
        let response = Zeroizing::new(respond_to_salt(store, device_id, &salt)?);
        let mut payload = [0u8; ADVERTISEMENT_BYTES];
        payload[..TRUNCATED_BYTES].copy_from_slice(&response[..TRUNCATED_BYTES]);
        payload[TRUNCATED_BYTES..].copy_from_slice(&salt);
        Ok(Self {
            payload,
            expected_challenge_response: response,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Full HMAC to hand to [`crate::SecureChannel::reconnection`].
    pub fn expected_challenge_response(&self) -> &[u8] {
        &self.expected_challenge_response
    }

    pub fn into_expected_challenge_response(self) -> Vec<u8> {
        self.expected_challenge_response.to_vec()
    }

    /// Scanning side: whether `payload` was produced with the challenge secret of `device_id`.
    pub fn matches(
        store: &dyn SecretStore,
        device_id: &Uuid,
        payload: &[u8],
    ) -> Result<bool, StorageError> {
        if payload.len() != ADVERTISEMENT_BYTES {
            return Ok(false);
        }
        let response = respond_to_salt(store, device_id, &payload[TRUNCATED_BYTES..])?;
        Ok(bool::from(
            response[..TRUNCATED_BYTES].ct_eq(&payload[..TRUNCATED_BYTES]),
        ))
    }

    /// Scanning side: the full challenge response that opens the reconnection handshake.
    pub fn respond(
        store: &dyn SecretStore,
        device_id: &Uuid,
        payload: &[u8],
    ) -> Result<Vec<u8>, StorageError> {
        if payload.len() != ADVERTISEMENT_BYTES {
            return Err(StorageError::Corrupt(format!(
                "advertisement must be {} bytes, got {}",
                ADVERTISEMENT_BYTES,
                payload.len()
            )));
        }
        respond_to_salt(store, device_id, &payload[TRUNCATED_BYTES..])
    }
}

impl std::fmt::Debug for ReconnectAdvertisement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectAdvertisement")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

fn respond_to_salt(
    store: &dyn SecretStore,
    device_id: &Uuid,
    salt: &[u8],
) -> Result<Vec<u8>, StorageError> {
    let mut padded = [0u8; PADDED_SALT_BYTES];
    padded[..salt.len()].copy_from_slice(salt);
    store.hash_with_challenge_secret(device_id, &padded)
}
