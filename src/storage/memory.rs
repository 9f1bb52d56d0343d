use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{SecretStore, StorageError, CHALLENGE_SECRET_BYTES};
use crate::crypto::SessionKey;

/// Sealed secrets for one device. Values are `nonce || ciphertext || tag` under the store's
/// wrapping key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecrets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_secret: Option<Vec<u8>>,
}

/// Serializable image of an [`InMemorySecretStore`]; contains no plaintext secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub unique_id: Uuid,
    pub devices: HashMap<Uuid, SealedSecrets>,
}

impl StoreSnapshot {
    pub fn to_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, StorageError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Secret store keeping sealed values in memory.
///
/// The wrapping key stands in for a platform keystore; embedding applications persist
/// [`StoreSnapshot`]s and keep the wrapping key somewhere safer.
pub struct InMemorySecretStore {
    unique_id: Uuid,
    wrapping_key: SessionKey,
    devices: RwLock<HashMap<Uuid, SealedSecrets>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::with_unique_id(Uuid::new_v4())
    }

    pub fn with_unique_id(unique_id: Uuid) -> Self {
        Self {
            unique_id,
            wrapping_key: SessionKey::generate(),
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Restores a store from a snapshot sealed under `wrapping_key`.
    ///
    /// Every value is test-opened so a wrong key is reported here rather than at first use.
    pub fn from_snapshot(
        snapshot: StoreSnapshot,
        wrapping_key: SessionKey,
    ) -> Result<Self, StorageError> {
        for (id, sealed) in &snapshot.devices {
            for value in [&sealed.encryption_key, &sealed.challenge_secret]
                .into_iter()
                .flatten()
            {
                wrapping_key.decrypt_data(value).map_err(|e| {
                    StorageError::Corrupt(format!("device {}: {}", id, e))
                })?;
            }
        }
        Ok(Self {
            unique_id: snapshot.unique_id,
            wrapping_key,
            devices: RwLock::new(snapshot.devices),
        })
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            unique_id: self.unique_id,
            devices: self.devices.read().clone(),
        }
    }

    pub fn wrapping_key(&self) -> &SessionKey {
        &self.wrapping_key
    }

    pub fn known_devices(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.devices.read().keys().copied().collect();
        ids.sort();
        ids
    }

    fn seal(&self, value: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.wrapping_key
            .encrypt_data(value)
            .map_err(StorageError::Seal)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, StorageError> {
        self.wrapping_key
            .decrypt_data(sealed)
            .map(Zeroizing::new)
            .map_err(StorageError::Unseal)
    }

    fn read_field<F>(&self, device_id: &Uuid, field: F) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError>
    where
        F: Fn(&SealedSecrets) -> Option<&Vec<u8>>,
    {
        let devices = self.devices.read();
        match devices.get(device_id).and_then(field) {
            Some(sealed) => self.unseal(sealed).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for InMemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for InMemorySecretStore {
    fn unique_id(&self) -> Uuid {
        self.unique_id
    }

    fn encryption_key(&self, device_id: &Uuid) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        self.read_field(device_id, |s| s.encryption_key.as_ref())
    }

    fn save_encryption_key(&self, device_id: &Uuid, key: &[u8]) -> Result<(), StorageError> {
        let sealed = self.seal(key)?;
        self.devices
            .write()
            .entry(*device_id)
            .or_default()
            .encryption_key = Some(sealed);
        debug!(device = %device_id, "stored encryption key");
        Ok(())
    }

    fn challenge_secret(
        &self,
        device_id: &Uuid,
    ) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        self.read_field(device_id, |s| s.challenge_secret.as_ref())
    }

    fn save_challenge_secret(&self, device_id: &Uuid, secret: &[u8]) -> Result<(), StorageError> {
        if secret.len() != CHALLENGE_SECRET_BYTES {
            return Err(StorageError::InvalidSecretLength(secret.len()));
        }
        let sealed = self.seal(secret)?;
        self.devices
            .write()
            .entry(*device_id)
            .or_default()
            .challenge_secret = Some(sealed);
        debug!(device = %device_id, "stored challenge secret");
        Ok(())
    }

    fn forget_device(&self, device_id: &Uuid) -> Result<(), StorageError> {
        if self.devices.write().remove(device_id).is_some() {
            debug!(device = %device_id, "forgot device");
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemorySecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySecretStore")
            .field("unique_id", &self.unique_id)
            .field("devices", &self.devices.read().len())
            .finish_non_exhaustive()
    }
}
