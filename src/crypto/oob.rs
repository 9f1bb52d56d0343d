//! Out-of-band verification code exchange.
//!
//! A token (key plus one nonce per direction) travels over a channel distinct from the one
//! being secured, e.g. an RFCOMM socket or a QR code. Both sides then encrypt the verification
//! code produced by the key exchange and swap the ciphertexts over the insecure link; matching
//! codes prove both ends saw the same token.

use thiserror::Error;
use zeroize::Zeroizing;

use super::{open_with_nonce, random_bytes, seal_with_nonce, CryptoError, KEY_BYTES, NONCE_BYTES};

/// Total length of the token pushed over the out-of-band channel.
pub const OOB_DATA_BYTES: usize = NONCE_BYTES * 2 + KEY_BYTES;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OobError {
    #[error("out-of-band data must be {OOB_DATA_BYTES} bytes, got {0}")]
    InvalidData(usize),
    #[error("out-of-band channel failed: {0}")]
    Channel(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Side channel used to deliver the token.
pub trait OobChannel {
    fn send_oob_data(&self, data: &[u8]) -> Result<(), OobError>;
}

/// Encrypts and decrypts verification codes with the out-of-band token.
pub struct OobCipher {
    key: Zeroizing<Vec<u8>>,
    encrypt_nonce: [u8; NONCE_BYTES],
    decrypt_nonce: [u8; NONCE_BYTES],
}

impl OobCipher {
    /// Generates a fresh token and pushes it to the peer.
    ///
    /// The peer receives our nonces swapped (`decrypt || encrypt || key`) so that its encrypt
    /// nonce is our decrypt nonce.
    pub fn start_exchange(channel: &dyn OobChannel) -> Result<Self, OobError> {
        let key = Zeroizing::new(random_bytes(KEY_BYTES));
        let mut encrypt_nonce = [0u8; NONCE_BYTES];
        let mut decrypt_nonce = [0u8; NONCE_BYTES];
        encrypt_nonce.copy_from_slice(&random_bytes(NONCE_BYTES));
        decrypt_nonce.copy_from_slice(&random_bytes(NONCE_BYTES));

        let mut data = Zeroizing::new(Vec::with_capacity(OOB_DATA_BYTES));
        data.extend_from_slice(&decrypt_nonce);
        data.extend_from_slice(&encrypt_nonce);
        data.extend_from_slice(&key);
        channel.send_oob_data(&data)?;

        Ok(Self {
            key,
            encrypt_nonce,
            decrypt_nonce,
        })
    }

    /// Builds the receiving side from a token delivered out of band.
    pub fn from_oob_data(data: &[u8]) -> Result<Self, OobError> {
        if data.len() != OOB_DATA_BYTES {
            return Err(OobError::InvalidData(data.len()));
        }
        let mut encrypt_nonce = [0u8; NONCE_BYTES];
        let mut decrypt_nonce = [0u8; NONCE_BYTES];
        encrypt_nonce.copy_from_slice(&data[..NONCE_BYTES]);
        decrypt_nonce.copy_from_slice(&data[NONCE_BYTES..NONCE_BYTES * 2]);
        Ok(Self {
            key: Zeroizing::new(data[NONCE_BYTES * 2..].to_vec()),
            encrypt_nonce,
            decrypt_nonce,
        })
    }

    pub fn encrypt_code(&self, code: &[u8]) -> Result<Vec<u8>, OobError> {
        Ok(seal_with_nonce(&self.key, &self.encrypt_nonce, code)?)
    }

    pub fn decrypt_code(&self, encrypted: &[u8]) -> Result<Vec<u8>, OobError> {
        Ok(open_with_nonce(&self.key, &self.decrypt_nonce, encrypted)?)
    }
}

impl std::fmt::Debug for OobCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OobCipher").finish_non_exhaustive()
    }
}
