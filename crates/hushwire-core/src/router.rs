//! Message cipher router.
//!
//! Entry point for the messaging layer. Decides between pairwise and group
//! sessions per conversation, drives multi-device fan-out through the key
//! directory, and turns every decrypt failure into a displayable
//! placeholder. The engines never talk to each other; the router carries
//! data between them (for instance a group session key delivered over a
//! pairwise session).
//!
//! # Send
//!
//! ```text
//! Direct: recipients ─resolve─▶ devices ─claim if no session─▶ pairwise fan-out
//! Group:  conversation ─▶ outbound group session (created if absent) ─▶ one ciphertext
//! ```
//!
//! A direct send fails closed: if not a single device could be encrypted
//! for, the send returns [`CryptoError::NoUsableRecipients`] and nothing is
//! produced. Partial failures are reported in the [`SendReceipt`].

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::{
    config::CryptoConfig,
    directory::{DirectoryClient, KeyDirectory},
    env::Environment,
    envelope::{EncryptedGroupEnvelope, Envelope, PairwisePayload},
    error::{CryptoError, DirectoryError, Placeholder},
    group::GroupEngine,
    identity::{Device, IdentityStore},
    pairwise::{DeviceWarning, PairwiseEngine},
    store::{StoreBackend, StoreSecret},
    types::{
        ClaimedPrekey, ConversationId, ConversationKind, DeviceId, DeviceIdentity, E2eeStatus,
        IdentityBundle, OneTimePrekey, UserId,
    },
};

/// Text shown for a delivered group session key.
const SESSION_KEY_TEXT: &str = "Encryption keys updated";

/// A recipient (or one of its devices) left out of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecipient {
    /// Recipient
    pub user_id: UserId,
    /// Device, or `None` when the whole user was skipped
    pub device_id: Option<DeviceId>,
    /// Why it was skipped
    pub error: CryptoError,
    /// A later send may reach it
    pub retryable: bool,
}

impl SkippedRecipient {
    fn new(user_id: UserId, device_id: Option<DeviceId>, error: CryptoError) -> Self {
        let retryable =
            error.is_transient() || matches!(error, CryptoError::DeviceExhausted { .. });
        Self { user_id, device_id, error, retryable }
    }
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Envelope to transmit
    pub envelope: Envelope,
    /// Recipients or devices that could not be resolved or claimed
    pub skipped: Vec<SkippedRecipient>,
    /// Devices that failed during encryption
    pub warnings: Vec<DeviceWarning>,
}

/// Outcome of [`CryptoRouter::receive`]. Always displayable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Decrypted chat message
    Text(String),
    /// A group session key was installed
    GroupSessionKey {
        /// Conversation the key belongs to
        conversation_id: ConversationId,
        /// Sender device's curve25519 key
        sender_key: String,
    },
    /// Decryption failed; render the placeholder instead
    Failed {
        /// Fixed text for conversation history
        placeholder: Placeholder,
        /// Underlying error
        error: CryptoError,
    },
}

impl Received {
    /// Text to render in conversation history.
    pub fn display_text(&self) -> &str {
        match self {
            Self::Text(body) => body,
            Self::GroupSessionKey { .. } => SESSION_KEY_TEXT,
            Self::Failed { placeholder, .. } => placeholder.text(),
        }
    }

    /// True if decryption failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// E2EE entry point for one user on one device.
pub struct CryptoRouter<E: Environment> {
    identity: IdentityStore<E>,
    directory: DirectoryClient,
    pairwise: PairwiseEngine,
    group: GroupEngine,
    env: E,
}

impl<E: Environment> CryptoRouter<E> {
    /// Create a router for `user_id`. Nothing is loaded until
    /// [`Self::initialize`].
    pub fn new(
        user_id: UserId,
        backend: Arc<dyn StoreBackend>,
        directory: Arc<dyn KeyDirectory>,
        env: E,
        config: CryptoConfig,
    ) -> Self {
        let directory =
            DirectoryClient::new(directory, config.claim_timeout(), config.retry_network_errors);
        Self {
            identity: IdentityStore::new(user_id, backend, env.clone(), config),
            directory,
            pairwise: PairwiseEngine::new(),
            group: GroupEngine::new(),
            env,
        }
    }

    /// Load or create this device's identity. See [`IdentityStore::initialize`].
    pub async fn initialize(&self, secret: StoreSecret) -> Result<IdentityBundle, CryptoError> {
        self.identity.initialize(secret).await
    }

    /// Create a new identity after a wipe. See
    /// [`IdentityStore::force_reinitialize`].
    pub async fn force_reinitialize(
        &self,
        secret: StoreSecret,
    ) -> Result<IdentityBundle, CryptoError> {
        self.identity.force_reinitialize(secret).await
    }

    /// Initialization status.
    pub fn status(&self) -> E2eeStatus {
        self.identity.status()
    }

    /// True once an identity is loaded.
    pub fn is_available(&self) -> bool {
        self.identity.status().initialized
    }

    /// Public identity of this device.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.identity()
    }

    /// This device's curve25519 key.
    pub fn own_curve_key(&self) -> Option<String> {
        self.identity.own_curve_key()
    }

    /// Generate and persist `count` new one-time prekeys.
    pub async fn generate_prekeys(&self, count: usize) -> Result<Vec<OneTimePrekey>, CryptoError> {
        let device = self.identity.device()?;
        let mut account = device.account.lock().await;
        let prekeys = account.generate_prekeys(device.identity.device_id, count);
        account.persist(&device.store)?;
        Ok(prekeys)
    }

    /// Prekeys generated but not uploaded yet.
    pub async fn unpublished_prekeys(&self) -> Result<Vec<OneTimePrekey>, CryptoError> {
        let device = self.identity.device()?;
        let account = device.account.lock().await;
        Ok(account.unpublished_prekeys(device.identity.device_id))
    }

    /// True if generated prekeys are waiting for upload.
    pub async fn needs_prekey_upload(&self) -> Result<bool, CryptoError> {
        let device = self.identity.device()?;
        let account = device.account.lock().await;
        Ok(account.needs_upload())
    }

    /// True if usable prekeys dropped below the low-water mark.
    pub async fn needs_prekey_replenishment(&self) -> Result<bool, CryptoError> {
        let device = self.identity.device()?;
        let account = device.account.lock().await;
        Ok(account.needs_replenishment(self.identity.config().prekey_low_water_mark))
    }

    /// Record that `key_ids` were uploaded to the directory.
    pub async fn mark_prekeys_published(&self, key_ids: &[String]) -> Result<usize, CryptoError> {
        let device = self.identity.device()?;
        let mut account = device.account.lock().await;
        let marked = account.mark_prekeys_published(key_ids);
        account.persist(&device.store)?;
        debug!(marked, "marked prekeys published");
        Ok(marked)
    }

    /// Encrypt `plaintext` for a conversation.
    ///
    /// # Errors
    ///
    /// - `NotInitialized` before [`Self::initialize`]
    /// - `NoUsableRecipients` if a direct send reached no device
    /// - `StorageUnavailable` if the advanced session could not be persisted
    pub async fn send(
        &self,
        kind: ConversationKind,
        conversation_id: ConversationId,
        recipients: &[UserId],
        plaintext: &str,
    ) -> Result<SendReceipt, CryptoError> {
        let device = self.identity.device()?;
        match kind {
            ConversationKind::Direct => {
                let payload = PairwisePayload::Text { body: plaintext.to_string() };
                self.send_pairwise(&device, recipients, &payload).await
            },
            ConversationKind::Group => {
                self.group.ensure_outbound(&device, conversation_id).await?;
                let ciphertext =
                    self.group.encrypt_group(&device, conversation_id, plaintext.as_bytes()).await?;
                Ok(SendReceipt {
                    envelope: Envelope::Group(EncryptedGroupEnvelope {
                        conversation_id,
                        sender_key: device.curve_key().to_string(),
                        ciphertext,
                    }),
                    skipped: Vec::new(),
                    warnings: Vec::new(),
                })
            },
        }
    }

    /// Deliver the current group session key of `conversation_id` to every
    /// device of `members` over pairwise sessions. Creates the outbound
    /// session if absent.
    pub async fn share_group_session(
        &self,
        conversation_id: ConversationId,
        members: &[UserId],
    ) -> Result<SendReceipt, CryptoError> {
        let device = self.identity.device()?;
        self.group.ensure_outbound(&device, conversation_id).await?;
        let session_key = self.group.export(&device, conversation_id).await?;

        let payload = PairwisePayload::GroupSessionKey { conversation_id, session_key };
        let receipt = self.send_pairwise(&device, members, &payload).await?;
        info!(%conversation_id, devices = receipt_devices(&receipt), "shared group session");
        Ok(receipt)
    }

    /// Replace the outbound group session of `conversation_id`. Members need
    /// the new key (see [`Self::share_group_session`]) before they can read
    /// further messages.
    pub async fn rotate_group_session(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), CryptoError> {
        let device = self.identity.device()?;
        self.group.create_outbound_session(&device, conversation_id).await?;
        info!(%conversation_id, "rotated group session");
        Ok(())
    }

    /// True if an outbound group session exists for `conversation_id`.
    pub async fn has_group_session(
        &self,
        conversation_id: ConversationId,
    ) -> Result<bool, CryptoError> {
        let device = self.identity.device()?;
        self.group.has_outbound_session(&device, conversation_id).await
    }

    /// Decrypt an incoming envelope. Never fails: errors become a
    /// [`Received::Failed`] carrying the placeholder to render.
    pub async fn receive(&self, sender_user_id: UserId, envelope: &Envelope) -> Received {
        match self.try_receive(sender_user_id, envelope).await {
            Ok(received) => received,
            Err(error) => {
                warn!(%sender_user_id, %error, "message could not be decrypted");
                Received::Failed { placeholder: error.placeholder(), error }
            },
        }
    }

    /// Drop every cached session and unload the identity. Persisted state is
    /// kept; a later [`Self::initialize`] with the same secret restores it.
    pub fn logout(&self) {
        self.pairwise.clear();
        self.group.clear();
        self.identity.logout();
    }

    /// Drop every cached session and delete all persisted state.
    pub async fn wipe(&self) -> Result<(), CryptoError> {
        self.pairwise.clear();
        self.group.clear();
        self.identity.wipe().await
    }

    async fn try_receive(
        &self,
        sender_user_id: UserId,
        envelope: &Envelope,
    ) -> Result<Received, CryptoError> {
        let device = self.identity.device()?;
        if envelope.sender_key().is_empty() {
            return Err(CryptoError::NoIdentityInfo);
        }

        match envelope {
            Envelope::Pairwise(envelope) => {
                let entry = envelope
                    .ciphertext_for(device.identity.user_id, device.identity.device_id)
                    .ok_or(CryptoError::NoCiphertextForDevice)?;
                let plaintext = self
                    .pairwise
                    .decrypt(
                        &device,
                        sender_user_id,
                        &envelope.sender_key,
                        entry.message_type,
                        &entry.ciphertext,
                    )
                    .await?;

                match PairwisePayload::from_bytes(&plaintext)? {
                    PairwisePayload::Text { body } => Ok(Received::Text(body)),
                    PairwisePayload::GroupSessionKey { conversation_id, session_key } => {
                        let sender_key = &envelope.sender_key;
                        self.group
                            .add_inbound_session(&device, conversation_id, sender_key, &session_key)
                            .await?;
                        Ok(Received::GroupSessionKey {
                            conversation_id,
                            sender_key: envelope.sender_key.clone(),
                        })
                    },
                }
            },
            Envelope::Group(envelope) => {
                let plaintext = self
                    .group
                    .decrypt_group(
                        &device,
                        envelope.conversation_id,
                        &envelope.sender_key,
                        &envelope.ciphertext,
                    )
                    .await?;
                String::from_utf8(plaintext)
                    .map(Received::Text)
                    .map_err(|e| CryptoError::Codec(e.to_string()))
            },
        }
    }

    /// Fan a pairwise payload out to every device of `recipients`.
    async fn send_pairwise(
        &self,
        device: &Device<E>,
        recipients: &[UserId],
        payload: &PairwisePayload,
    ) -> Result<SendReceipt, CryptoError> {
        let plaintext = payload.to_bytes()?;

        let mut unique = recipients.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let resolved =
            join_all(unique.iter().map(|&user_id| self.targets_for(device, user_id))).await;

        let mut targets = Vec::new();
        let mut skipped = Vec::new();
        for (&user_id, result) in unique.iter().zip(resolved) {
            match result {
                Ok((user_targets, user_skipped)) => {
                    targets.extend(user_targets);
                    skipped.extend(user_skipped);
                },
                Err(error) => {
                    warn!(%user_id, %error, "skipping recipient");
                    skipped.push(SkippedRecipient::new(user_id, None, error));
                },
            }
        }

        let (envelope, warnings) = self.pairwise.encrypt_for(device, targets, &plaintext).await;
        if envelope.device_count() == 0 {
            return Err(CryptoError::NoUsableRecipients);
        }

        debug!(
            devices = envelope.device_count(),
            skipped = skipped.len(),
            warnings = warnings.len(),
            "pairwise send"
        );
        Ok(SendReceipt { envelope: Envelope::Pairwise(envelope), skipped, warnings })
    }

    /// Encryption targets for every device of `user_id` except our own.
    async fn targets_for(
        &self,
        device: &Device<E>,
        user_id: UserId,
    ) -> Result<(Vec<ClaimedPrekey>, Vec<SkippedRecipient>), CryptoError> {
        let devices = self.directory.resolve_devices(user_id).await?;
        let remote: Vec<&DeviceIdentity> = devices
            .iter()
            .filter(|remote| remote.identity_key_curve25519 != device.curve_key())
            .collect();

        let claims = join_all(remote.iter().map(|remote| self.target_for(device, remote))).await;

        let mut targets = Vec::new();
        let mut skipped = Vec::new();
        for (remote, claim) in remote.iter().zip(claims) {
            match claim {
                Ok(target) => targets.push(target),
                Err(error) => {
                    warn!(%user_id, device_id = %remote.device_id, %error, "skipping device");
                    skipped.push(SkippedRecipient::new(user_id, Some(remote.device_id), error));
                },
            }
        }
        Ok((targets, skipped))
    }

    /// Reuse an existing session or claim a prekey for one device.
    async fn target_for(
        &self,
        device: &Device<E>,
        remote: &DeviceIdentity,
    ) -> Result<ClaimedPrekey, CryptoError> {
        let curve_key = &remote.identity_key_curve25519;
        if self.pairwise.has_session(device, remote.user_id, curve_key).await? {
            return Ok(ClaimedPrekey::existing_session(remote));
        }

        match self.directory.claim_prekey(remote.user_id, remote.device_id).await {
            Err(err @ DirectoryError::DeviceExhausted { .. }) => {
                let Some(delay) = self.identity.config().exhausted_retry_delay() else {
                    return Err(err.into());
                };
                debug!(device_id = %remote.device_id, ?delay, "device exhausted, retrying claim");
                self.env.sleep(delay).await;
                Ok(self.directory.claim_prekey(remote.user_id, remote.device_id).await?)
            },
            result => Ok(result?),
        }
    }
}

fn receipt_devices(receipt: &SendReceipt) -> usize {
    match &receipt.envelope {
        Envelope::Pairwise(envelope) => envelope.device_count(),
        Envelope::Group(_) => 0,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{directory::InMemoryDirectory, env::MockEnv, store::MemoryBackend};

    fn router() -> CryptoRouter<MockEnv> {
        CryptoRouter::new(
            UserId::from_u128(1),
            Arc::new(MemoryBackend::new()),
            Arc::new(InMemoryDirectory::new()),
            MockEnv::with_seed(1),
            CryptoConfig::default(),
        )
    }

    #[tokio::test]
    async fn uninitialized_router_refuses_to_send() {
        let router = router();
        assert!(!router.is_available());

        let recipients = [UserId::from_u128(2)];
        let result =
            router.send(ConversationKind::Direct, ConversationId::nil(), &recipients, "hi").await;
        assert_eq!(result, Err(CryptoError::NotInitialized));
        assert_eq!(router.generate_prekeys(1).await, Err(CryptoError::NotInitialized));
    }

    #[tokio::test]
    async fn uninitialized_router_renders_placeholder() {
        let router = router();
        let envelope = Envelope::Group(EncryptedGroupEnvelope {
            conversation_id: ConversationId::nil(),
            sender_key: "key".to_string(),
            ciphertext: String::new(),
        });

        let received = router.receive(UserId::from_u128(2), &envelope).await;
        assert_eq!(received.display_text(), "Encrypted message (E2EE not initialized)");
        assert!(received.is_failure());
    }

    #[tokio::test]
    async fn missing_sender_key_is_reported() {
        let router = router();
        router.initialize(StoreSecret::key([1; 32])).await.unwrap();

        let envelope = Envelope::Group(EncryptedGroupEnvelope {
            conversation_id: ConversationId::nil(),
            sender_key: String::new(),
            ciphertext: String::new(),
        });

        let received = router.receive(UserId::from_u128(2), &envelope).await;
        assert_eq!(received.display_text(), "Encrypted message (missing sender identity)");
    }

    #[tokio::test]
    async fn prekey_lifecycle_passthroughs() {
        let router = router();
        let bundle = router.initialize(StoreSecret::key([1; 32])).await.unwrap();
        assert!(router.needs_prekey_upload().await.unwrap());

        let ids: Vec<String> =
            bundle.unpublished_prekeys.iter().map(|key| key.key_id.clone()).collect();
        assert_eq!(router.mark_prekeys_published(&ids).await.unwrap(), ids.len());
        assert!(!router.needs_prekey_upload().await.unwrap());
        assert!(!router.needs_prekey_replenishment().await.unwrap());

        let mut more = router.generate_prekeys(3).await.unwrap();
        let mut pending = router.unpublished_prekeys().await.unwrap();
        more.sort_by(|a, b| a.key_id.cmp(&b.key_id));
        pending.sort_by(|a, b| a.key_id.cmp(&b.key_id));
        assert_eq!(pending, more);
    }

    #[test]
    fn skipped_exhausted_device_is_retryable() {
        let (user_id, device_id) = (UserId::from_u128(1), DeviceId::from_u128(2));

        let exhausted = CryptoError::DeviceExhausted { user_id, device_id };
        assert!(SkippedRecipient::new(user_id, Some(device_id), exhausted).retryable);

        let network = CryptoError::NetworkError("reset".to_string());
        assert!(SkippedRecipient::new(user_id, Some(device_id), network).retryable);

        let deviceless = CryptoError::UserHasNoDevices(user_id);
        assert!(!SkippedRecipient::new(user_id, None, deviceless).retryable);
    }
}
