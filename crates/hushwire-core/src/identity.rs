//! Identity and device store.
//!
//! Owns this device's long-term pairwise account, its public identity and
//! the key store it is persisted in. Initialization is idempotent: the same
//! secret always yields the same identity, restored from the backend when the
//! process restarts. Identity keys are only ever regenerated after an
//! explicit [`IdentityStore::wipe`].

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vodozemac::olm::{Account, AccountPickle};

use crate::{
    config::CryptoConfig,
    env::Environment,
    error::{CryptoError, StoreError},
    prekeys::PrekeyLedger,
    store::{KeyStore, StoreBackend, StoreSecret, namespace},
    types::{DeviceIdentity, E2eeStatus, IdentityBundle, UserId},
};

/// Pairwise account plus its prekey ledger. Always locked together so a
/// consumed prekey and the account that consumed it persist as one.
pub(crate) struct AccountState {
    pub(crate) account: Account,
    pub(crate) prekeys: PrekeyLedger,
}

impl AccountState {
    pub(crate) fn new_account() -> Self {
        Self { account: Account::new(), prekeys: PrekeyLedger::default() }
    }

    /// Write account pickle and ledger.
    pub(crate) fn persist<E: Environment>(&self, store: &KeyStore<E>) -> Result<(), StoreError> {
        store.save(namespace::ACCOUNT, b"", &self.account.pickle())?;
        store.save(namespace::PREKEYS, b"", &self.prekeys)
    }

    fn restore<E: Environment>(store: &KeyStore<E>) -> Result<Option<Self>, StoreError> {
        let Some(pickle) = store.load::<AccountPickle>(namespace::ACCOUNT, b"")? else {
            return Ok(None);
        };
        let prekeys = store.load::<PrekeyLedger>(namespace::PREKEYS, b"")?.unwrap_or_default();
        Ok(Some(Self { account: Account::from_pickle(pickle), prekeys }))
    }
}

#[derive(Serialize, Deserialize)]
struct DeviceRecord {
    identity: DeviceIdentity,
}

/// A loaded device: identity, account and the store they live in.
pub(crate) struct Device<E: Environment> {
    pub(crate) identity: DeviceIdentity,
    pub(crate) store: KeyStore<E>,
    pub(crate) env: E,
    pub(crate) account: tokio::sync::Mutex<AccountState>,
}

impl<E: Environment> Device<E> {
    /// This device's curve25519 identity key (base64).
    pub(crate) fn curve_key(&self) -> &str {
        &self.identity.identity_key_curve25519
    }
}

/// Identity and device store for one user on this device.
pub struct IdentityStore<E: Environment> {
    user_id: UserId,
    backend: Arc<dyn StoreBackend>,
    env: E,
    config: CryptoConfig,
    device: RwLock<Option<Arc<Device<E>>>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl<E: Environment> IdentityStore<E> {
    /// Create an uninitialized store for `user_id` over `backend`.
    pub fn new(
        user_id: UserId,
        backend: Arc<dyn StoreBackend>,
        env: E,
        config: CryptoConfig,
    ) -> Self {
        Self {
            user_id,
            backend,
            env,
            config,
            device: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Owner of this store.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Load or create this device's identity.
    ///
    /// - Already initialized with the same secret: returns the loaded
    ///   identity unchanged.
    /// - Already initialized with another secret: `AlreadyInitializedConflict`.
    /// - Backend holds an identity: restores it. A wrong secret yields
    ///   `StorageUnavailable`.
    /// - Otherwise: creates a new identity and an initial prekey batch.
    pub async fn initialize(&self, secret: StoreSecret) -> Result<IdentityBundle, CryptoError> {
        let _init = self.init_lock.lock().await;

        if let Some(device) = self.loaded() {
            let store = KeyStore::open(Arc::clone(&self.backend), &secret, self.env.clone())
                .map_err(|_| CryptoError::AlreadyInitializedConflict)?;
            if store.fingerprint() != device.store.fingerprint() {
                return Err(CryptoError::AlreadyInitializedConflict);
            }
            return Ok(bundle(&device).await);
        }

        let store = KeyStore::open(Arc::clone(&self.backend), &secret, self.env.clone())?;
        let device = match self.restore(store)? {
            Restored::Device(device) => {
                info!(device_id = %device.identity.device_id, "restored device identity");
                device
            },
            Restored::Empty(store) => self.create(store)?,
        };

        let device = Arc::new(device);
        *self.device.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&device));
        Ok(bundle(&device).await)
    }

    /// Create a brand-new identity, refusing if one exists.
    ///
    /// Regenerating identity keys silently breaks every pairwise session
    /// peers hold with this device, so an existing identity (loaded or
    /// persisted) must be removed with [`Self::wipe`] first.
    pub async fn force_reinitialize(
        &self,
        secret: StoreSecret,
    ) -> Result<IdentityBundle, CryptoError> {
        {
            let _init = self.init_lock.lock().await;
            if self.loaded().is_some() {
                return Err(CryptoError::AlreadyInitializedConflict);
            }
            let store = KeyStore::open(Arc::clone(&self.backend), &secret, self.env.clone())
                .map_err(|_| CryptoError::AlreadyInitializedConflict)?;
            if store.load::<DeviceRecord>(namespace::DEVICE, b"")?.is_some() {
                return Err(CryptoError::AlreadyInitializedConflict);
            }
        }
        self.initialize(secret).await
    }

    /// Current initialization status.
    pub fn status(&self) -> E2eeStatus {
        match self.loaded() {
            Some(device) => E2eeStatus {
                initialized: true,
                device_id: Some(device.identity.device_id),
                has_identity_keys: true,
            },
            None => E2eeStatus { initialized: false, device_id: None, has_identity_keys: false },
        }
    }

    /// Public identity of the loaded device.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.loaded().map(|device| device.identity.clone())
    }

    /// This device's curve25519 key. Reflects the current identity: it
    /// changes only through `initialize` after a `wipe`.
    pub fn own_curve_key(&self) -> Option<String> {
        self.loaded().map(|device| device.curve_key().to_string())
    }

    /// Drop the loaded identity. Key material is zeroized once the last
    /// in-flight operation releases it. Persisted state is kept.
    pub fn logout(&self) {
        if self.device.write().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            info!("identity unloaded");
        }
    }

    /// Delete all persisted state and unload the identity.
    pub async fn wipe(&self) -> Result<(), CryptoError> {
        let _init = self.init_lock.lock().await;
        let device = self.device.write().unwrap_or_else(PoisonError::into_inner).take();
        match device {
            Some(device) => device.store.wipe()?,
            None => self.backend.clear()?,
        }
        warn!("key store wiped");
        Ok(())
    }

    pub(crate) fn device(&self) -> Result<Arc<Device<E>>, CryptoError> {
        self.loaded().ok_or(CryptoError::NotInitialized)
    }

    pub(crate) fn config(&self) -> &CryptoConfig {
        &self.config
    }

    fn loaded(&self) -> Option<Arc<Device<E>>> {
        self.device.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn restore(&self, store: KeyStore<E>) -> Result<Restored<E>, CryptoError> {
        let Some(record) = store.load::<DeviceRecord>(namespace::DEVICE, b"")? else {
            return Ok(Restored::Empty(store));
        };
        if record.identity.user_id != self.user_id {
            return Err(CryptoError::AlreadyInitializedConflict);
        }
        let state = AccountState::restore(&store)?.ok_or_else(|| {
            CryptoError::StorageUnavailable("device record without account".to_string())
        })?;

        Ok(Restored::Device(Device {
            identity: record.identity,
            store,
            env: self.env.clone(),
            account: tokio::sync::Mutex::new(state),
        }))
    }

    fn create(&self, store: KeyStore<E>) -> Result<Device<E>, CryptoError> {
        let mut state = AccountState::new_account();
        let keys = state.account.identity_keys();
        let device_id = uuid::Builder::from_random_bytes(self.env.random_array()).into_uuid();
        let identity = DeviceIdentity {
            user_id: self.user_id,
            device_id,
            identity_key_ed25519: keys.ed25519.to_base64(),
            identity_key_curve25519: keys.curve25519.to_base64(),
        };

        state.generate_prekeys(device_id, self.config.initial_prekey_count);
        state.persist(&store)?;
        store.save(namespace::DEVICE, b"", &DeviceRecord { identity: identity.clone() })?;

        info!(%device_id, prekeys = self.config.initial_prekey_count, "created device identity");
        Ok(Device {
            identity,
            store,
            env: self.env.clone(),
            account: tokio::sync::Mutex::new(state),
        })
    }
}

enum Restored<E: Environment> {
    Device(Device<E>),
    Empty(KeyStore<E>),
}

async fn bundle<E: Environment>(device: &Device<E>) -> IdentityBundle {
    let account = device.account.lock().await;
    IdentityBundle {
        identity: device.identity.clone(),
        unpublished_prekeys: account.unpublished_prekeys(device.identity.device_id),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{env::MockEnv, store::MemoryBackend};

    fn store_over(backend: &MemoryBackend) -> IdentityStore<MockEnv> {
        IdentityStore::new(
            UserId::from_u128(1),
            Arc::new(backend.clone()),
            MockEnv::with_seed(3),
            CryptoConfig { initial_prekey_count: 5, ..CryptoConfig::default() },
        )
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let backend = MemoryBackend::new();
        let store = store_over(&backend);

        let first = store.initialize(StoreSecret::key([1; 32])).await.unwrap();
        let second = store.initialize(StoreSecret::key([1; 32])).await.unwrap();

        assert_eq!(first.identity, second.identity);
        assert_eq!(first.unpublished_prekeys.len(), 5);
    }

    #[tokio::test]
    async fn reinitialize_with_other_secret_conflicts() {
        let backend = MemoryBackend::new();
        let store = store_over(&backend);
        store.initialize(StoreSecret::key([1; 32])).await.unwrap();

        let result = store.initialize(StoreSecret::key([2; 32])).await;
        assert_eq!(result.err(), Some(CryptoError::AlreadyInitializedConflict));
    }

    #[tokio::test]
    async fn restart_restores_identity() {
        let backend = MemoryBackend::new();
        let original = store_over(&backend).initialize(StoreSecret::key([1; 32])).await.unwrap();

        let restarted = store_over(&backend);
        let restored = restarted.initialize(StoreSecret::key([1; 32])).await.unwrap();

        assert_eq!(restored.identity, original.identity);
        assert_eq!(restored.unpublished_prekeys, original.unpublished_prekeys);
    }

    #[tokio::test]
    async fn restore_with_wrong_secret_is_storage_error() {
        let backend = MemoryBackend::new();
        store_over(&backend).initialize(StoreSecret::key([1; 32])).await.unwrap();

        let result = store_over(&backend).initialize(StoreSecret::key([9; 32])).await;
        assert!(matches!(result, Err(CryptoError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn force_reinitialize_requires_wipe() {
        let backend = MemoryBackend::new();
        let store = store_over(&backend);
        let original = store.initialize(StoreSecret::key([1; 32])).await.unwrap();

        store.logout();
        let refused = store.force_reinitialize(StoreSecret::key([1; 32])).await;
        assert_eq!(refused.err(), Some(CryptoError::AlreadyInitializedConflict));

        store.wipe().await.unwrap();
        let fresh = store.force_reinitialize(StoreSecret::key([1; 32])).await.unwrap();
        assert_ne!(
            fresh.identity.identity_key_curve25519,
            original.identity.identity_key_curve25519
        );
    }

    #[tokio::test]
    async fn status_tracks_lifecycle() {
        let backend = MemoryBackend::new();
        let store = store_over(&backend);
        assert!(!store.status().initialized);
        assert!(store.own_curve_key().is_none());

        let bundle = store.initialize(StoreSecret::key([1; 32])).await.unwrap();
        let status = store.status();
        assert!(status.initialized && status.has_identity_keys);
        assert_eq!(status.device_id, Some(bundle.identity.device_id));
        assert_eq!(store.own_curve_key(), Some(bundle.identity.identity_key_curve25519));

        store.logout();
        assert!(!store.status().initialized);
    }

    #[tokio::test]
    async fn unavailable_backend_fails_initialize() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);

        let result = store_over(&backend).initialize(StoreSecret::key([1; 32])).await;
        assert!(matches!(result, Err(CryptoError::StorageUnavailable(_))));
    }
}
