//! Identity, device and prekey records exchanged with the key directory.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account identifier.
pub type UserId = Uuid;

/// Device identifier, unique per user.
pub type DeviceId = Uuid;

/// Direct or group conversation identifier.
pub type ConversationId = Uuid;

/// Public identity of one device. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Owner of the device
    pub user_id: UserId,
    /// Device id
    pub device_id: DeviceId,
    /// Ed25519 signing key (base64)
    pub identity_key_ed25519: String,
    /// Curve25519 identity key (base64). 1:1 with the device.
    pub identity_key_curve25519: String,
}

/// Public half of a one-time prekey, as handed to a claimant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrekeyInfo {
    /// Key id (base64)
    pub key_id: String,
    /// Curve25519 public key (base64)
    pub public_key: String,
}

/// A locally generated one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePrekey {
    /// Device that owns the private half
    pub device_id: DeviceId,
    /// Key id (base64)
    pub key_id: String,
    /// Curve25519 public key (base64)
    pub public_key: String,
    /// Uploaded to the directory
    pub published: bool,
}

impl OneTimePrekey {
    /// Public part for upload.
    pub fn info(&self) -> PrekeyInfo {
        PrekeyInfo { key_id: self.key_id.clone(), public_key: self.public_key.clone() }
    }
}

/// Result of a prekey claim: everything needed to open a session with one
/// device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedPrekey {
    /// Owner of the device
    pub user_id: UserId,
    /// Device id
    pub device_id: DeviceId,
    /// Ed25519 signing key (base64)
    pub identity_key_ed25519: String,
    /// Curve25519 identity key (base64)
    pub identity_key_curve25519: String,
    /// `None` when a session with the device already exists
    pub one_time_prekey: Option<PrekeyInfo>,
}

impl ClaimedPrekey {
    /// Target for a device we already hold a session with.
    pub fn existing_session(device: &DeviceIdentity) -> Self {
        Self {
            user_id: device.user_id,
            device_id: device.device_id,
            identity_key_ed25519: device.identity_key_ed25519.clone(),
            identity_key_curve25519: device.identity_key_curve25519.clone(),
            one_time_prekey: None,
        }
    }

    /// Target for a freshly claimed prekey.
    pub fn with_prekey(device: &DeviceIdentity, prekey: PrekeyInfo) -> Self {
        Self { one_time_prekey: Some(prekey), ..Self::existing_session(device) }
    }
}

/// Returned by a successful initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityBundle {
    /// This device's public identity
    pub identity: DeviceIdentity,
    /// Prekeys not yet uploaded to the directory
    pub unpublished_prekeys: Vec<OneTimePrekey>,
}

/// Snapshot of the identity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E2eeStatus {
    /// An identity is loaded
    pub initialized: bool,
    /// Device id of the loaded identity
    pub device_id: Option<DeviceId>,
    /// Identity keys are present
    pub has_identity_keys: bool,
}

/// Whether a conversation uses pairwise or group sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// 1:1 (or small fan-out) conversation, pairwise sessions per device
    Direct,
    /// Multi-party conversation, one group session per sender
    Group,
}
