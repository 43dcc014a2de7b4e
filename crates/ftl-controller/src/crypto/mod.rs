//! Subkey-derived encryption for payload columns.
//!
//! Every payload that flows through the queue is encrypted under a key
//! derived from a master keyset: HKDF-SHA-256 with the subkey label as
//! salt yields one AES-256-GCM key per [`SubKey`]. Leaking ciphertext of
//! one class never enables decrypting another, and decrypting under the
//! wrong subkey fails without revealing why.
//!
//! The master keyset lives in the `encryption_keys` singleton, wrapped
//! under a key-management escrow selected by `FTL_KMS_URI`. [`bootstrap`]
//! creates the keyset on first run and self-verifies it on every start
//! by round-tripping a fixed sentinel per subkey.

use std::collections::HashMap;
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::storage::tables::EncryptionKeyRow;
use crate::storage::Transaction;

/// AES-256 key size in bytes.
const KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes; each ciphertext is `nonce || ct`.
const NONCE_SIZE: usize = 12;

/// URI scheme of the development/test key escrow.
const FAKE_KMS_SCHEME: &str = "fake-kms://";

/// Sentinel round-tripped through every subkey at bootstrap.
const VERIFICATION_SENTINEL: &[u8] =
    "FTL - Towards a \u{1d77a}-calculus for large-scale systems".as_bytes();

/// Identifies the derived key a payload column is encrypted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubKey {
    /// Timeline and audit-log payloads.
    Timeline,
    /// Async-call and topic-event payloads.
    Async,
    /// Identity-signing material.
    Identity,
}

impl SubKey {
    const ALL: [Self; 3] = [Self::Timeline, Self::Async, Self::Identity];

    /// The derivation salt; the lowercase subkey name.
    #[must_use]
    pub const fn label(self) -> &'static [u8] {
        match self {
            Self::Timeline => b"timeline",
            Self::Async => b"async",
            Self::Identity => b"identity",
        }
    }
}

/// An encrypted payload column: `nonce || ciphertext`, or plaintext in
/// no-op mode. The subkey is bound to the derived key, not the bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptedColumn(Vec<u8>);

impl EncryptedColumn {
    /// Wraps bytes read back from storage.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The stored byte form.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the column, yielding the stored bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Encrypts and decrypts payload columns.
///
/// `Derived` is the production mode; `Noop` stores plaintext unchanged
/// and is selected when no KMS URI is configured.
pub enum Encryptor {
    /// Subkey-derived AES-256-GCM over a master keyset.
    Derived(DerivedEncryptor),
    /// Plaintext passthrough.
    Noop,
}

impl Encryptor {
    /// Creates a derived encryptor over a raw keyset. Exposed for tests;
    /// production keysets come from [`bootstrap`].
    #[must_use]
    pub fn derived(keyset: [u8; KEY_SIZE]) -> Self {
        Self::Derived(DerivedEncryptor {
            keyset,
            derived: Mutex::new(HashMap::new()),
        })
    }

    /// Encrypts `plaintext` under `subkey`, overwriting `dest`.
    pub fn encrypt(
        &self,
        subkey: SubKey,
        plaintext: &[u8],
        dest: &mut EncryptedColumn,
    ) -> Result<()> {
        match self {
            Self::Derived(inner) => {
                dest.0 = inner.seal(subkey, plaintext)?;
                Ok(())
            }
            Self::Noop => {
                dest.0 = plaintext.to_vec();
                Ok(())
            }
        }
    }

    /// Decrypts a column previously encrypted under `subkey`.
    ///
    /// A ciphertext produced under a different subkey or master key
    /// fails with [`Error::Crypto`]; the reason is not distinguished.
    pub fn decrypt(&self, subkey: SubKey, column: &EncryptedColumn) -> Result<Vec<u8>> {
        match self {
            Self::Derived(inner) => inner.open(subkey, &column.0),
            Self::Noop => Ok(column.0.clone()),
        }
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        match self {
            Self::Derived(_) => f.write_str("Encryptor::Derived"),
            Self::Noop => f.write_str("Encryptor::Noop"),
        }
    }
}

/// Production encryptor: one AES-256-GCM primitive per subkey, derived
/// lazily and cached under a mutex.
pub struct DerivedEncryptor {
    keyset: [u8; KEY_SIZE],
    derived: Mutex<HashMap<SubKey, Aes256Gcm>>,
}

impl DerivedEncryptor {
    fn seal(&self, subkey: SubKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.primitive(subkey)?;
        aead_seal(&cipher, plaintext)
    }

    fn open(&self, subkey: SubKey, bytes: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.primitive(subkey)?;
        aead_open(&cipher, bytes)
    }

    fn primitive(&self, subkey: SubKey) -> Result<Aes256Gcm> {
        let mut cache = self
            .derived
            .lock()
            .map_err(|_| Error::crypto("key cache poisoned"))?;
        if let Some(cipher) = cache.get(&subkey) {
            return Ok(cipher.clone());
        }
        let key = derive_key(&self.keyset, subkey)?;
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|_| Error::crypto("invalid derived key"))?;
        cache.insert(subkey, cipher.clone());
        Ok(cipher)
    }
}

/// HKDF-SHA-256 over the keyset with the subkey label as salt.
fn derive_key(keyset: &[u8; KEY_SIZE], subkey: SubKey) -> Result<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(Some(subkey.label()), keyset);
    let mut out = [0u8; KEY_SIZE];
    hkdf.expand(&[], &mut out)
        .map_err(|_| Error::crypto("key derivation failed"))?;
    Ok(out)
}

fn aead_seal(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::crypto("encryption failed"))?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_open(cipher: &Aes256Gcm, bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < NONCE_SIZE {
        return Err(Error::crypto("decryption failed"));
    }
    let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::crypto("decryption failed"))
}

/// The master key held by the key-management escrow.
///
/// Only the development/test escrow is supported:
/// `fake-kms://<base64url 32-byte key>`.
pub struct KmsKey {
    cipher: Aes256Gcm,
}

impl KmsKey {
    /// Parses a KMS URI into a master key.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let Some(encoded) = uri.strip_prefix(FAKE_KMS_SCHEME) else {
            return Err(Error::crypto(format!("unsupported KMS URI scheme: {uri}")));
        };
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| Error::crypto("malformed KMS key encoding"))?;
        if raw.len() != KEY_SIZE {
            return Err(Error::crypto("KMS key must be 32 bytes"));
        }
        let cipher =
            Aes256Gcm::new_from_slice(&raw).map_err(|_| Error::crypto("invalid KMS key"))?;
        Ok(Self { cipher })
    }

    /// Builds a `fake-kms://` URI from raw key bytes. Test helper.
    #[must_use]
    pub fn encode_uri(raw: &[u8; KEY_SIZE]) -> String {
        format!("{FAKE_KMS_SCHEME}{}", URL_SAFE_NO_PAD.encode(raw))
    }

    fn wrap(&self, keyset: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
        aead_seal(&self.cipher, keyset)
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<[u8; KEY_SIZE]> {
        let raw = aead_open(&self.cipher, wrapped)?;
        raw.try_into().map_err(|_| Error::crypto("decryption failed"))
    }
}

/// Ensures a keyset exists and self-verifies it, inside `tx`.
///
/// - No KMS URI: no-op mode, verification skipped.
/// - No singleton row: generate a keyset, wrap it under the KMS key,
///   store it.
/// - Existing row: unwrap it; a different master key surfaces as
///   [`Error::Crypto`].
/// - Per subkey: store a sentinel ciphertext on first run, otherwise
///   decrypt the stored one and compare. Mismatch is fatal before any
///   queue operation is accepted.
pub fn bootstrap(tx: &mut Transaction, kms_uri: Option<&str>) -> Result<Encryptor> {
    let Some(uri) = kms_uri else {
        tracing::warn!("no KMS URI configured, payloads will be stored in plaintext");
        return Ok(Encryptor::Noop);
    };
    let kms = KmsKey::from_uri(uri)?;

    let keyset = match tx.tables().encryption_key.as_ref() {
        Some(row) => kms.unwrap(&row.wrapped_keyset)?,
        None => {
            let mut keyset = [0u8; KEY_SIZE];
            OsRng.fill_bytes(&mut keyset);
            let wrapped = kms.wrap(&keyset)?;
            tx.tables_mut().encryption_key = Some(EncryptionKeyRow {
                wrapped_keyset: wrapped,
                verify_timeline: None,
                verify_async: None,
                verify_identity: None,
            });
            tracing::info!("generated new encryption keyset");
            keyset
        }
    };

    let encryptor = Encryptor::derived(keyset);
    for subkey in SubKey::ALL {
        verify_subkey(tx, &encryptor, subkey)?;
    }
    Ok(encryptor)
}

fn verify_subkey(tx: &mut Transaction, encryptor: &Encryptor, subkey: SubKey) -> Result<()> {
    let stored = {
        let row = singleton(tx.tables().encryption_key.as_ref())?;
        verification_slot(row, subkey).clone()
    };
    match stored {
        None => {
            let mut column = EncryptedColumn::default();
            encryptor.encrypt(subkey, VERIFICATION_SENTINEL, &mut column)?;
            let row = singleton_mut(tx.tables_mut().encryption_key.as_mut())?;
            *verification_slot_mut(row, subkey) = Some(column.into_bytes());
            tracing::debug!(subkey = ?subkey, "stored verification ciphertext");
            Ok(())
        }
        Some(bytes) => {
            let plaintext = encryptor.decrypt(subkey, &EncryptedColumn::from_bytes(bytes))?;
            if plaintext != VERIFICATION_SENTINEL {
                return Err(Error::crypto("key verification failed"));
            }
            Ok(())
        }
    }
}

fn singleton(row: Option<&EncryptionKeyRow>) -> Result<&EncryptionKeyRow> {
    row.ok_or_else(|| Error::crypto("encryption key row missing"))
}

fn singleton_mut(row: Option<&mut EncryptionKeyRow>) -> Result<&mut EncryptionKeyRow> {
    row.ok_or_else(|| Error::crypto("encryption key row missing"))
}

fn verification_slot(row: &EncryptionKeyRow, subkey: SubKey) -> &Option<Vec<u8>> {
    match subkey {
        SubKey::Timeline => &row.verify_timeline,
        SubKey::Async => &row.verify_async,
        SubKey::Identity => &row.verify_identity,
    }
}

fn verification_slot_mut(row: &mut EncryptionKeyRow, subkey: SubKey) -> &mut Option<Vec<u8>> {
    match subkey {
        SubKey::Timeline => &mut row.verify_timeline,
        SubKey::Async => &mut row.verify_async,
        SubKey::Identity => &mut row.verify_identity,
    }
}
