//! Scripted multi-user, multi-device conversation.
//!
//! Every device runs its own [`CryptoRouter`] over a private in-memory key
//! store; all of them share one [`InMemoryDirectory`]. Envelopes travel as
//! CBOR bytes and are delivered to every device of every participant, the
//! sender's other devices included.

use std::sync::Arc;

use hushwire_core::{
    ConversationId, ConversationKind, CryptoConfig, CryptoError, CryptoRouter, Envelope,
    InMemoryDirectory, MemoryBackend, MockEnv, OneTimePrekey, Received, SendReceipt,
    StoreSecret, UserId,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Scenario failures. Placeholders on receive are counted, not raised.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// Router operation failed
    #[error("{context}: {source}")]
    Crypto {
        /// What the scenario was doing
        context: String,
        /// Underlying error
        source: CryptoError,
    },

    /// Population cannot be simulated
    #[error("invalid scenario: {0}")]
    Invalid(&'static str),
}

trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T, ScenarioError>;
}

impl<T> Context<T> for Result<T, CryptoError> {
    fn context(self, context: impl Into<String>) -> Result<T, ScenarioError> {
        self.map_err(|source| ScenarioError::Crypto { context: context.into(), source })
    }
}

/// Shape of the simulated population.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Number of users
    pub users: usize,
    /// Devices registered per user
    pub devices_per_user: usize,
    /// Direct messages sent per user
    pub direct_rounds: usize,
    /// Group messages sent per user
    pub group_rounds: usize,
    /// Network failures injected before the direct phase
    pub injected_failures: usize,
    /// Base seed; each device derives its own
    pub seed: u64,
    /// Router tunables shared by every device
    pub crypto: CryptoConfig,
}

/// Outcome counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Envelopes produced
    pub sent: usize,
    /// Messages decrypted to text
    pub delivered: usize,
    /// Group session keys installed
    pub keys_installed: usize,
    /// Messages rendered as placeholders
    pub placeholders: usize,
    /// Recipients or devices skipped by a send
    pub skipped: usize,
    /// Prekey batches uploaded after the initial one
    pub replenished: usize,
}

struct SimDevice {
    user_id: UserId,
    router: CryptoRouter<MockEnv>,
}

/// The simulated population and its shared directory.
pub struct Scenario {
    config: ScenarioConfig,
    directory: InMemoryDirectory,
    devices: Vec<SimDevice>,
    summary: Summary,
}

impl Scenario {
    /// Initialize every device and publish its prekeys.
    pub async fn setup(config: ScenarioConfig) -> Result<Self, ScenarioError> {
        if config.users == 0 || config.devices_per_user == 0 {
            return Err(ScenarioError::Invalid("needs at least one user and one device"));
        }

        let directory = InMemoryDirectory::new();
        let mut devices = Vec::with_capacity(config.users * config.devices_per_user);

        for user in 0..config.users {
            let owner = user_id(user);
            for device in 0..config.devices_per_user {
                let seed = config.seed.wrapping_add((user * 1000 + device) as u64);
                let router = CryptoRouter::new(
                    owner,
                    Arc::new(MemoryBackend::new()),
                    Arc::new(directory.clone()),
                    MockEnv::with_seed(seed),
                    config.crypto.clone(),
                );
                let mut key = [0u8; 32];
                key[..8].copy_from_slice(&seed.to_le_bytes());
                router.initialize(StoreSecret::key(key)).await.context("initialize")?;

                let sim = SimDevice { user_id: owner, router };
                publish(&directory, &sim).await?;
                devices.push(sim);
            }
        }

        info!(users = config.users, devices = devices.len(), "population ready");
        Ok(Self { config, directory, devices, summary: Summary::default() })
    }

    /// Run the direct and group phases, then top up prekeys.
    pub async fn run(mut self) -> Result<Summary, ScenarioError> {
        self.direct_phase().await?;
        self.group_phase().await?;
        self.replenish().await?;
        Ok(self.summary)
    }

    /// Each user's first device messages the next user, round robin. The
    /// sender's own user is addressed too so its other devices get a copy.
    async fn direct_phase(&mut self) -> Result<(), ScenarioError> {
        if self.config.injected_failures > 0 {
            info!(count = self.config.injected_failures, "injecting directory failures");
            self.directory.fail_next(self.config.injected_failures);
        }

        let conversation = ConversationId::from_u128(0xD1EC7);
        for round in 0..self.config.direct_rounds {
            for user in 0..self.config.users {
                let sender = user * self.config.devices_per_user;
                let recipient = user_id((user + 1) % self.config.users);
                let recipients = [recipient, self.devices[sender].user_id];
                let body = format!("direct {round} from user {}", user + 1);

                let result = self.devices[sender]
                    .router
                    .send(ConversationKind::Direct, conversation, &recipients, &body)
                    .await;
                match result {
                    Ok(receipt) => self.deliver(sender, &receipt).await,
                    Err(CryptoError::NoUsableRecipients) => {
                        warn!(%recipient, "direct send reached nobody");
                        self.summary.skipped += 1;
                    },
                    Err(source) => {
                        return Err(ScenarioError::Crypto {
                            context: "direct send".to_string(),
                            source,
                        });
                    },
                }
            }
        }
        Ok(())
    }

    /// The first device of every user shares a group session with all users,
    /// then sends over it.
    async fn group_phase(&mut self) -> Result<(), ScenarioError> {
        let conversation = ConversationId::from_u128(0x6A0);
        let members: Vec<UserId> = (0..self.config.users).map(user_id).collect();

        for user in 0..self.config.users {
            let sender = user * self.config.devices_per_user;
            let share = self.devices[sender]
                .router
                .share_group_session(conversation, &members)
                .await
                .context("share group session")?;
            self.deliver(sender, &share).await;
        }

        for round in 0..self.config.group_rounds {
            for user in 0..self.config.users {
                let sender = user * self.config.devices_per_user;
                let body = format!("group {round} from user {}", user + 1);
                let receipt = self.devices[sender]
                    .router
                    .send(ConversationKind::Group, conversation, &[], &body)
                    .await
                    .context("group send")?;
                self.deliver(sender, &receipt).await;
            }
        }
        Ok(())
    }

    /// Upload a fresh batch for every device below the low-water mark.
    async fn replenish(&mut self) -> Result<(), ScenarioError> {
        for device in &self.devices {
            if device.router.needs_prekey_replenishment().await.context("prekey status")? {
                device
                    .router
                    .generate_prekeys(self.config.crypto.initial_prekey_count)
                    .await
                    .context("generate prekeys")?;
                publish(&self.directory, device).await?;
                self.summary.replenished += 1;
            }
        }
        Ok(())
    }

    /// Hand the envelope to every device except the sender's, through its
    /// wire encoding.
    async fn deliver(&mut self, sender: usize, receipt: &SendReceipt) {
        self.summary.sent += 1;
        self.summary.skipped += receipt.skipped.len();
        for skipped in &receipt.skipped {
            warn!(user_id = %skipped.user_id, error = %skipped.error, "recipient skipped");
        }

        let wire = receipt.envelope.to_bytes().and_then(|bytes| Envelope::from_bytes(&bytes));
        let envelope = match wire {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "envelope lost in transit");
                return;
            },
        };

        let sender_user = self.devices[sender].user_id;
        for (index, device) in self.devices.iter().enumerate() {
            if index == sender || !addressed_to(&envelope, device) {
                continue;
            }
            match device.router.receive(sender_user, &envelope).await {
                Received::Text(body) => {
                    debug!(user_id = %device.user_id, %body, "delivered");
                    self.summary.delivered += 1;
                },
                Received::GroupSessionKey { .. } => self.summary.keys_installed += 1,
                Received::Failed { placeholder, .. } => {
                    warn!(user_id = %device.user_id, %placeholder, "placeholder rendered");
                    self.summary.placeholders += 1;
                },
            }
        }
    }
}

/// Users are numbered from 1.
fn user_id(index: usize) -> UserId {
    UserId::from_u128(index as u128 + 1)
}

/// Group envelopes reach every device; pairwise ones only the devices of
/// users they name.
fn addressed_to(envelope: &Envelope, device: &SimDevice) -> bool {
    match envelope {
        Envelope::Pairwise(pairwise) => pairwise.recipients.contains_key(&device.user_id),
        Envelope::Group(_) => true,
    }
}

async fn publish(directory: &InMemoryDirectory, device: &SimDevice) -> Result<(), ScenarioError> {
    let Some(identity) = device.router.identity() else {
        return Err(CryptoError::NotInitialized).context("publish");
    };
    let pending = device.router.unpublished_prekeys().await.context("list prekeys")?;
    let ids: Vec<String> = pending.iter().map(|key| key.key_id.clone()).collect();

    directory.register_device(identity.clone());
    directory.publish_prekeys(
        identity.user_id,
        identity.device_id,
        pending.iter().map(OneTimePrekey::info).collect(),
    );
    device.router.mark_prekeys_published(&ids).await.context("mark published")?;
    debug!(device_id = %identity.device_id, count = ids.len(), "prekeys published");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> ScenarioConfig {
        ScenarioConfig {
            users: 3,
            devices_per_user: 2,
            direct_rounds: 2,
            group_rounds: 2,
            injected_failures: 0,
            seed: 42,
            crypto: CryptoConfig {
                initial_prekey_count: 4,
                prekey_low_water_mark: 4,
                ..CryptoConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn every_message_is_delivered() {
        let scenario = Scenario::setup(config()).await.unwrap();
        let summary = scenario.run().await.unwrap();

        // 3 users x 2 rounds direct, 3 shares, 3 users x 2 rounds group
        assert_eq!(summary.sent, 6 + 3 + 6);
        assert_eq!(summary.placeholders, 0);
        assert_eq!(summary.skipped, 0);

        // Direct: recipient's 2 devices plus the sender's other device
        // Group: the 5 other devices
        assert_eq!(summary.delivered, 6 * 3 + 6 * 5);
        assert_eq!(summary.keys_installed, 3 * 5);
        assert!(summary.replenished > 0);
    }

    #[tokio::test]
    async fn empty_population_is_rejected() {
        let config = ScenarioConfig { devices_per_user: 0, ..config() };
        assert!(matches!(Scenario::setup(config).await, Err(ScenarioError::Invalid(_))));
    }

    #[tokio::test]
    async fn a_single_injected_failure_is_absorbed() {
        let config = ScenarioConfig { injected_failures: 1, ..config() };
        let summary = Scenario::setup(config).await.unwrap().run().await.unwrap();

        assert_eq!(summary.placeholders, 0);
        assert_eq!(summary.skipped, 0);
    }
}
