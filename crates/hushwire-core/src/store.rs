//! Local key store.
//!
//! Every persisted record (account pickle, prekey ledger, pairwise session
//! pickles, group session snapshots) goes through [`KeyStore`]:
//!
//! - values are CBOR-encoded and sealed with XChaCha20-Poly1305 under a key
//!   derived from the device's [`StoreSecret`]
//! - names are keyed hashes of `(namespace, key)`, so user ids, device keys
//!   and conversation ids never appear in the backend
//!
//! The backend itself is a dumb byte map behind [`StoreBackend`]. A single
//! plaintext metadata record holds the passphrase salt and a sealed verifier
//! that rejects a wrong secret at open time.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use argon2::{Algorithm, Argon2, Params, Version};
use hushwire_crypto::{RecordNamer, SEAL_NONCE_SIZE, SealingKey, derive_subkey};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use zeroize::{Zeroize, Zeroizing};

use crate::{env::Environment, error::StoreError};

/// Plaintext name of the metadata record.
const META_RECORD: &[u8] = b"hushwire/meta";

/// Current on-disk layout version.
const STORE_VERSION: u32 = 1;

/// Plaintext sealed into the metadata verifier.
const VERIFIER: &[u8] = b"hushwire key store";

/// Salt size for passphrase stretching.
const SALT_SIZE: usize = 16;

/// Argon2id memory cost in KiB (19 MiB).
const ARGON2_M_COST: u32 = 19 * 1024;

/// Argon2id iterations.
const ARGON2_T_COST: u32 = 2;

/// Record namespaces.
pub(crate) mod namespace {
    /// Device identity record
    pub const DEVICE: &str = "device";
    /// Pickled pairwise account
    pub const ACCOUNT: &str = "account";
    /// Prekey ledger
    pub const PREKEYS: &str = "prekeys";
    /// Pickled pairwise session, keyed by user id and device curve key
    pub const PAIRWISE: &str = "pairwise";
    /// Outbound group session, keyed by conversation id
    pub const GROUP_OUTBOUND: &str = "group-outbound";
    /// Inbound group session, keyed by conversation id and sender key
    pub const GROUP_INBOUND: &str = "group-inbound";
}

/// Raw persistence layer underneath the key store.
///
/// Implementations only move opaque bytes. They never see plaintext key
/// material or readable record names.
pub trait StoreBackend: Send + Sync {
    /// Read a record.
    fn get(&self, name: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Create or replace a record.
    fn put(&self, name: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Delete a record. Deleting a missing record is not an error.
    fn delete(&self, name: &[u8]) -> Result<(), StoreError>;

    /// Delete every record.
    fn clear(&self) -> Result<(), StoreError>;
}

/// In-memory backend.
///
/// Clone shares the same underlying map, so a test can drop a router and
/// open a new one over the same records to simulate a restart.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryBackendInner>>,
}

#[derive(Default)]
struct MemoryBackendInner {
    records: HashMap<Vec<u8>, Vec<u8>>,
    unavailable: bool,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Backend`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// True if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `needle` appears verbatim in any record name or value. An
    /// empty needle is always contained.
    pub fn contains_bytes(&self, needle: &[u8]) -> bool {
        if needle.is_empty() {
            return true;
        }
        let inner = self.lock();
        let found = |haystack: &[u8]| haystack.windows(needle.len()).any(|w| w == needle);
        inner.records.iter().any(|(name, value)| found(name) || found(value))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBackendInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn available(&self) -> Result<std::sync::MutexGuard<'_, MemoryBackendInner>, StoreError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(StoreError::Backend("memory backend marked unavailable".to_string()));
        }
        Ok(inner)
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, name: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.available()?.records.get(name).cloned())
    }

    fn put(&self, name: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.available()?.records.insert(name.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, name: &[u8]) -> Result<(), StoreError> {
        self.available()?.records.remove(name);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.available()?;
        for value in inner.records.values_mut() {
            value.zeroize();
        }
        inner.records.clear();
        Ok(())
    }
}

/// Secret protecting the key store.
pub enum StoreSecret {
    /// 32 bytes of key material, used directly
    Key(Zeroizing<[u8; 32]>),
    /// Passphrase stretched with Argon2id and the store's salt
    Passphrase(Zeroizing<String>),
}

impl StoreSecret {
    /// Raw key secret.
    pub fn key(key: [u8; 32]) -> Self {
        Self::Key(Zeroizing::new(key))
    }

    /// Passphrase secret.
    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        Self::Passphrase(Zeroizing::new(passphrase.into()))
    }

    fn master_key(&self, salt: &[u8; SALT_SIZE]) -> Result<Zeroizing<[u8; 32]>, StoreError> {
        match self {
            Self::Key(key) => Ok(key.clone()),
            Self::Passphrase(passphrase) => {
                let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, 1, Some(32))
                    .map_err(|e| StoreError::KeyDerivation(e.to_string()))?;
                let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

                let mut output = Zeroizing::new([0u8; 32]);
                argon2
                    .hash_password_into(passphrase.as_bytes(), salt, &mut *output)
                    .map_err(|e| StoreError::KeyDerivation(e.to_string()))?;
                Ok(output)
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoreMeta {
    version: u32,
    salt: [u8; SALT_SIZE],
    verifier: Vec<u8>,
}

/// Sealed, name-hashed view over a [`StoreBackend`].
pub(crate) struct KeyStore<E: Environment> {
    backend: Arc<dyn StoreBackend>,
    env: E,
    sealing: SealingKey,
    namer: RecordNamer,
    fingerprint: [u8; 32],
}

impl<E: Environment> KeyStore<E> {
    /// Open the store with `secret`, creating the metadata record if absent.
    ///
    /// # Errors
    ///
    /// - `Sealed` if `secret` is not the one the store was created with
    /// - `Backend` if the metadata record cannot be read or written
    pub fn open(
        backend: Arc<dyn StoreBackend>,
        secret: &StoreSecret,
        env: E,
    ) -> Result<Self, StoreError> {
        let existing = match backend.get(META_RECORD)? {
            Some(bytes) => Some(
                ciborium::from_reader::<StoreMeta, _>(bytes.as_slice())
                    .map_err(|e| StoreError::Codec(e.to_string()))?,
            ),
            None => None,
        };

        if let Some(meta) = &existing {
            if meta.version != STORE_VERSION {
                return Err(StoreError::Codec(format!(
                    "unsupported store version {}",
                    meta.version
                )));
            }
        }

        let salt = existing.as_ref().map_or_else(|| env.random_array(), |meta| meta.salt);
        let master = secret.master_key(&salt)?;
        let store = Self {
            backend,
            env,
            sealing: SealingKey::new(derive_subkey(&*master, b"seal")),
            namer: RecordNamer::new(derive_subkey(&*master, b"names")),
            fingerprint: derive_subkey(&*master, b"fingerprint"),
        };

        match existing {
            Some(meta) => {
                let opened = store.sealing.open(&meta.verifier).map_err(|_| StoreError::Sealed)?;
                if opened != VERIFIER {
                    return Err(StoreError::Sealed);
                }
            },
            None => {
                let verifier = store.sealing.seal(VERIFIER, store.env.random_array());
                let meta = StoreMeta { version: STORE_VERSION, salt, verifier };
                let mut bytes = Vec::new();
                ciborium::into_writer(&meta, &mut bytes)
                    .map_err(|e| StoreError::Codec(e.to_string()))?;
                store.backend.put(META_RECORD, &bytes)?;
            },
        }

        Ok(store)
    }

    /// Identifies the secret without revealing it. Equal secrets over the
    /// same store give equal fingerprints.
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// Read and unseal a record.
    pub fn load<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        let Some(sealed) = self.backend.get(&self.namer.name(namespace, key))? else {
            return Ok(None);
        };

        let plaintext = Zeroizing::new(self.sealing.open(&sealed).map_err(|_| StoreError::Sealed)?);
        ciborium::from_reader(plaintext.as_slice())
            .map(Some)
            .map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Seal and write a record.
    pub fn save<T: Serialize>(
        &self,
        namespace: &str,
        key: &[u8],
        value: &T,
    ) -> Result<(), StoreError> {
        let mut plaintext = Zeroizing::new(Vec::new());
        ciborium::into_writer(value, &mut *plaintext)
            .map_err(|e| StoreError::Codec(e.to_string()))?;

        let nonce: [u8; SEAL_NONCE_SIZE] = self.env.random_array();
        let sealed = self.sealing.seal(&plaintext, nonce);
        self.backend.put(&self.namer.name(namespace, key), &sealed)
    }

    /// Delete a record.
    pub fn remove(&self, namespace: &str, key: &[u8]) -> Result<(), StoreError> {
        self.backend.delete(&self.namer.name(namespace, key))
    }

    /// Delete every record, metadata included.
    pub fn wipe(&self) -> Result<(), StoreError> {
        self.backend.clear()
    }
}

impl<E: Environment> Drop for KeyStore<E> {
    fn drop(&mut self) {
        self.fingerprint.zeroize();
    }
}
