use std::sync::Arc;
use std::thread;

use companion::crypto::hmac_sha256;
use companion::storage::StoreSnapshot;
use companion::{InMemorySecretStore, SecretStore, SessionKey, StorageError, CHALLENGE_SECRET_BYTES};
use uuid::Uuid;

#[test]
fn challenge_secret_must_be_exactly_32_bytes() {
    let store = InMemorySecretStore::new();
    let id = Uuid::new_v4();

    store.save_challenge_secret(&id, &[1u8; CHALLENGE_SECRET_BYTES]).unwrap();
    assert_eq!(
        store.challenge_secret(&id).unwrap().unwrap().as_slice(),
        &[1u8; CHALLENGE_SECRET_BYTES][..]
    );

    assert!(matches!(
        store.save_challenge_secret(&id, &[2u8; 31]),
        Err(StorageError::InvalidSecretLength(31))
    ));
    assert!(matches!(
        store.save_challenge_secret(&id, &[2u8; 33]),
        Err(StorageError::InvalidSecretLength(33))
    ));
    // Rejected writes leave the previous secret in place.
    assert_eq!(
        store.challenge_secret(&id).unwrap().unwrap().as_slice(),
        &[1u8; CHALLENGE_SECRET_BYTES][..]
    );
}

#[test]
fn saving_a_key_replaces_the_previous_one() {
    let store = InMemorySecretStore::new();
    let id = Uuid::new_v4();
    assert!(store.encryption_key(&id).unwrap().is_none());

    store.save_encryption_key(&id, &[1u8; 32]).unwrap();
    store.save_encryption_key(&id, &[2u8; 32]).unwrap();

    assert_eq!(
        store.encryption_key(&id).unwrap().unwrap().as_slice(),
        &[2u8; 32][..]
    );
}

#[test]
fn hash_is_keyed_with_the_device_secret() {
    let store = InMemorySecretStore::new();
    let id = Uuid::new_v4();
    let secret = [7u8; 32];
    store.save_challenge_secret(&id, &secret).unwrap();

    let hashed = store.hash_with_challenge_secret(&id, b"salt").unwrap();

    assert_eq!(hashed, hmac_sha256(&secret, &[&b"salt"[..]]));
    assert!(matches!(
        store.hash_with_challenge_secret(&Uuid::new_v4(), b"salt"),
        Err(StorageError::MissingSecret(_))
    ));
}

#[test]
fn concurrent_devices_do_not_interfere() {
    let store = Arc::new(InMemorySecretStore::new());
    let handles: Vec<_> = (0u8..8)
        .map(|n| {
            let store = store.clone();
            thread::spawn(move || {
                let id = Uuid::new_v4();
                for round in 0u8..20 {
                    store.save_encryption_key(&id, &[n ^ round; 32]).unwrap();
                    store.save_challenge_secret(&id, &[n; 32]).unwrap();
                    assert_eq!(
                        store.encryption_key(&id).unwrap().unwrap().as_slice(),
                        &[n ^ round; 32][..]
                    );
                }
                (id, n)
            })
        })
        .collect();

    for handle in handles {
        let (id, n) = handle.join().unwrap();
        assert_eq!(
            store.challenge_secret(&id).unwrap().unwrap().as_slice(),
            &[n; 32][..]
        );
    }
    assert_eq!(store.known_devices().len(), 8);
}

#[test]
fn snapshot_survives_a_json_round_trip() {
    let store = InMemorySecretStore::new();
    let id = Uuid::new_v4();
    store.save_encryption_key(&id, &[3u8; 32]).unwrap();
    store.save_challenge_secret(&id, &[4u8; 32]).unwrap();

    let json = store.snapshot().to_json().unwrap();

    let restored = InMemorySecretStore::from_snapshot(
        StoreSnapshot::from_json(&json).unwrap(),
        store.wrapping_key().clone(),
    )
    .unwrap();
    assert_eq!(restored.unique_id(), store.unique_id());
    assert_eq!(
        restored.encryption_key(&id).unwrap().unwrap().as_slice(),
        &[3u8; 32][..]
    );

    let wrong_key = InMemorySecretStore::from_snapshot(
        StoreSnapshot::from_json(&json).unwrap(),
        SessionKey::generate(),
    );
    assert!(matches!(wrong_key, Err(StorageError::Corrupt(_))));
}

#[test]
fn forgetting_a_device_removes_its_secrets() {
    let store = InMemorySecretStore::new();
    let id = Uuid::new_v4();
    store.save_encryption_key(&id, &[5u8; 32]).unwrap();
    store.save_challenge_secret(&id, &[6u8; 32]).unwrap();

    store.forget_device(&id).unwrap();

    assert!(store.encryption_key(&id).unwrap().is_none());
    assert!(store.challenge_secret(&id).unwrap().is_none());
    assert!(store.known_devices().is_empty());
}
