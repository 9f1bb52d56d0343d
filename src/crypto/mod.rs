//! Symmetric primitives shared by the channel, the key exchange engine and the secret store.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

pub mod oob;

pub use oob::{OobChannel, OobCipher, OobError};

/// Length of every symmetric key handled by this crate.
pub const KEY_BYTES: usize = 32;
/// ChaCha20-Poly1305 nonce length.
pub const NONCE_BYTES: usize = 12;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key must be {KEY_BYTES} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("ciphertext too short")]
    Truncated,
    #[error("encryption failed")]
    Encrypt,
    #[error("authentication tag mismatch")]
    Decrypt,
}

/// Symmetric key negotiated by the key exchange engine.
///
/// Encryption output is `nonce || ciphertext || tag`; a fresh random nonce is drawn per call.
#[derive(Clone)]
pub struct SessionKey {
    bytes: Zeroizing<[u8; KEY_BYTES]>,
}

impl SessionKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_BYTES {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        let mut key = Zeroizing::new([0u8; KEY_BYTES]);
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_BYTES]);
        OsRng.fill_bytes(&mut key[..]);
        Self { bytes: key }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    pub fn encrypt_data(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal(self.as_bytes(), plaintext)
    }

    pub fn decrypt_data(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(self.as_bytes(), ciphertext)
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.as_bytes().ct_eq(other.as_bytes()).into()
    }
}

impl Eq for SessionKey {}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Encrypts with a random nonce and prepends it to the output.
pub(crate) fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    let mut out = Vec::with_capacity(NONCE_BYTES + plaintext.len() + 16);
    out.extend_from_slice(&nonce);
    out.extend(seal_with_nonce(key, &nonce, plaintext)?);
    Ok(out)
}

pub(crate) fn open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_BYTES {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_BYTES);
    open_with_nonce(key, nonce, ciphertext)
}

pub(crate) fn seal_with_nonce(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    cipher(key)?
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)
}

pub(crate) fn open_with_nonce(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    cipher(key)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

fn cipher(key: &[u8]) -> Result<ChaCha20Poly1305, CryptoError> {
    if key.len() != KEY_BYTES {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    Ok(ChaCha20Poly1305::new(Key::from_slice(key)))
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time check of an HMAC-SHA256 tag.
pub fn verify_hmac_sha256(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

/// Fills a fresh buffer with `len` random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}
