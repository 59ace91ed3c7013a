//! Key directory: device lookup and one-time prekey claims.
//!
//! [`KeyDirectory`] is the seam to the server. [`InMemoryDirectory`] backs
//! tests and the simulation. [`DirectoryClient`] wraps any directory with a
//! per-call timeout and a single retry for transient failures.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    error::DirectoryError,
    types::{ClaimedPrekey, DeviceId, DeviceIdentity, PrekeyInfo, UserId},
};

/// Remote registry of device identities and published prekeys.
///
/// # Invariants
///
/// - `claim_prekey` hands out each published prekey at most once
/// - `claim_prekey` is not idempotent: every call consumes a key
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Devices registered for `user_id`.
    async fn resolve_devices(&self, user_id: UserId) -> Result<Vec<DeviceIdentity>, DirectoryError>;

    /// Claim one unused prekey of `(user_id, device_id)`.
    async fn claim_prekey(
        &self,
        user_id: UserId,
        device_id: DeviceId,
    ) -> Result<ClaimedPrekey, DirectoryError>;
}

/// In-memory directory.
///
/// Thread-safe via Arc<Mutex<_>>. Clone shares the same underlying state.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    inner: Arc<Mutex<InMemoryDirectoryInner>>,
}

#[derive(Default)]
struct InMemoryDirectoryInner {
    /// Registered devices per user, in registration order.
    devices: HashMap<UserId, Vec<DeviceIdentity>>,
    /// Unclaimed prekeys per device, oldest first.
    prekeys: HashMap<(UserId, DeviceId), VecDeque<PrekeyInfo>>,
    /// Number of upcoming calls that fail with a network error.
    failures_pending: usize,
    /// Claims served so far.
    claims_served: usize,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a device identity.
    pub fn register_device(&self, identity: DeviceIdentity) {
        let mut inner = self.lock();
        let devices = inner.devices.entry(identity.user_id).or_default();
        devices.retain(|existing| existing.device_id != identity.device_id);
        devices.push(identity);
    }

    /// Upload prekeys for a registered device.
    pub fn publish_prekeys(&self, user_id: UserId, device_id: DeviceId, prekeys: Vec<PrekeyInfo>) {
        self.lock().prekeys.entry((user_id, device_id)).or_default().extend(prekeys);
    }

    /// Unclaimed prekeys left for a device.
    pub fn available_prekeys(&self, user_id: UserId, device_id: DeviceId) -> usize {
        self.lock().prekeys.get(&(user_id, device_id)).map_or(0, VecDeque::len)
    }

    /// Make the next `count` calls fail with a network error.
    pub fn fail_next(&self, count: usize) {
        self.lock().failures_pending = count;
    }

    /// Prekey claims served so far.
    pub fn claims_served(&self) -> usize {
        self.lock().claims_served
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryDirectoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InMemoryDirectoryInner {
    fn injected_failure(&mut self) -> Result<(), DirectoryError> {
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(DirectoryError::Network("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyDirectory for InMemoryDirectory {
    async fn resolve_devices(
        &self,
        user_id: UserId,
    ) -> Result<Vec<DeviceIdentity>, DirectoryError> {
        let mut inner = self.lock();
        inner.injected_failure()?;

        match inner.devices.get(&user_id) {
            Some(devices) if !devices.is_empty() => Ok(devices.clone()),
            _ => Err(DirectoryError::UserHasNoDevices(user_id)),
        }
    }

    async fn claim_prekey(
        &self,
        user_id: UserId,
        device_id: DeviceId,
    ) -> Result<ClaimedPrekey, DirectoryError> {
        let mut inner = self.lock();
        inner.injected_failure()?;

        let device = inner
            .devices
            .get(&user_id)
            .and_then(|devices| devices.iter().find(|device| device.device_id == device_id))
            .cloned()
            .ok_or(DirectoryError::UnknownDevice { user_id, device_id })?;

        let prekey = inner
            .prekeys
            .get_mut(&(user_id, device_id))
            .and_then(VecDeque::pop_front)
            .ok_or(DirectoryError::DeviceExhausted { user_id, device_id })?;

        inner.claims_served += 1;
        Ok(ClaimedPrekey::with_prekey(&device, prekey))
    }
}

/// Directory wrapper applying timeout and retry policy.
#[derive(Clone)]
pub struct DirectoryClient {
    directory: Arc<dyn KeyDirectory>,
    timeout: Duration,
    retry_transient: bool,
}

impl DirectoryClient {
    /// Wrap `directory`.
    pub fn new(directory: Arc<dyn KeyDirectory>, timeout: Duration, retry_transient: bool) -> Self {
        Self { directory, timeout, retry_transient }
    }

    /// Devices registered for `user_id`.
    pub async fn resolve_devices(
        &self,
        user_id: UserId,
    ) -> Result<Vec<DeviceIdentity>, DirectoryError> {
        self.call("resolve_devices", || self.directory.resolve_devices(user_id)).await
    }

    /// Claim one prekey for `(user_id, device_id)`.
    pub async fn claim_prekey(
        &self,
        user_id: UserId,
        device_id: DeviceId,
    ) -> Result<ClaimedPrekey, DirectoryError> {
        self.call("claim_prekey", || self.directory.claim_prekey(user_id, device_id)).await
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        request: F,
    ) -> Result<T, DirectoryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DirectoryError>>,
    {
        match self.attempt(&request).await {
            Err(err) if err.is_transient() && self.retry_transient => {
                debug!(operation, error = %err, "retrying directory call");
                self.attempt(&request).await
            },
            result => result,
        }
    }

    async fn attempt<T, F, Fut>(&self, request: &F) -> Result<T, DirectoryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DirectoryError>>,
    {
        tokio::time::timeout(self.timeout, request()).await.unwrap_or_else(|_| {
            Err(DirectoryError::Network(format!("timed out after {:?}", self.timeout)))
        })
    }
}
