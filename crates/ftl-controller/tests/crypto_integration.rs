//! Encryption bootstrap across controller restarts: the keyset is
//! generated once, verified on every start, and a different master key
//! is rejected before any work is accepted.

use ftl_controller::crypto::{self, KmsKey, SubKey};
use ftl_controller::error::Error;
use ftl_controller::storage::Database;

fn uri(byte: u8) -> String {
    KmsKey::encode_uri(&[byte; 32])
}

#[tokio::test]
async fn restart_with_the_same_key_verifies() {
    let db = Database::new();
    let uri = uri(1);

    let mut tx = db.begin().await;
    let first = crypto::bootstrap(&mut tx, Some(&uri)).unwrap();
    tx.commit().unwrap();

    // Simulated restart over the same durable state.
    let mut tx = db.begin().await;
    let second = crypto::bootstrap(&mut tx, Some(&uri)).unwrap();
    tx.commit().unwrap();

    // Both encryptors hold the same keyset: ciphertexts interoperate.
    let mut column = crypto::EncryptedColumn::default();
    first.encrypt(SubKey::Async, b"payload", &mut column).unwrap();
    assert_eq!(second.decrypt(SubKey::Async, &column).unwrap(), b"payload");
}

#[tokio::test]
async fn bootstrap_stores_one_verification_ciphertext_per_subkey() {
    let db = Database::new();
    let mut tx = db.begin().await;
    crypto::bootstrap(&mut tx, Some(&uri(4))).unwrap();
    tx.commit().unwrap();

    let tx = db.begin().await;
    let row = tx.tables().encryption_key.as_ref().unwrap();
    let slots = [&row.verify_timeline, &row.verify_async, &row.verify_identity];
    for slot in slots {
        assert!(slot.is_some());
    }
    // Each subkey seals independently, so the ciphertexts differ.
    assert_ne!(row.verify_timeline, row.verify_async);
    assert_ne!(row.verify_async, row.verify_identity);
}

#[tokio::test]
async fn restart_with_a_different_key_is_rejected() {
    let db = Database::new();

    let mut tx = db.begin().await;
    crypto::bootstrap(&mut tx, Some(&uri(1))).unwrap();
    tx.commit().unwrap();

    let mut tx = db.begin().await;
    let err = crypto::bootstrap(&mut tx, Some(&uri(2))).unwrap_err();
    assert!(matches!(err, Error::Crypto { .. }));
}

#[tokio::test]
async fn malformed_kms_uri_is_rejected() {
    let db = Database::new();
    let mut tx = db.begin().await;
    for bad in ["fake-kms://not-base64!!!", "vault://abc", "fake-kms://"] {
        assert!(crypto::bootstrap(&mut tx, Some(bad)).is_err(), "{bad} should fail");
    }
}

#[tokio::test]
async fn no_kms_uri_stores_plaintext() {
    let db = Database::new();
    let mut tx = db.begin().await;
    let encryptor = crypto::bootstrap(&mut tx, None).unwrap();
    tx.commit().unwrap();

    let mut column = crypto::EncryptedColumn::default();
    encryptor.encrypt(SubKey::Async, b"visible", &mut column).unwrap();
    assert_eq!(column.as_bytes(), b"visible");

    // No keyset row is written in no-op mode.
    let tx = db.begin().await;
    assert!(tx.tables().encryption_key.is_none());
}

#[tokio::test]
async fn subkeys_do_not_interoperate() {
    let db = Database::new();
    let mut tx = db.begin().await;
    let encryptor = crypto::bootstrap(&mut tx, Some(&uri(3))).unwrap();
    tx.commit().unwrap();

    let mut column = crypto::EncryptedColumn::default();
    encryptor
        .encrypt(SubKey::Timeline, b"audit", &mut column)
        .unwrap();
    let err = encryptor.decrypt(SubKey::Async, &column).unwrap_err();
    assert!(matches!(err, Error::Crypto { .. }));
}
