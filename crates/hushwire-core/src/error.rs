//! Error types for the orchestration layer.
//!
//! One enum per layer: [`StoreError`] for the local key store,
//! [`DirectoryError`] for the key directory, and [`CryptoError`] for
//! everything the router surfaces. Decrypt-side errors additionally map to a
//! fixed [`Placeholder`] so a failed message still renders.

use std::fmt;

use hushwire_crypto::SenderKeyError;
use thiserror::Error;

use crate::types::{ConversationId, DeviceId, UserId};

/// Errors from the local key store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not read or write
    #[error("backend unavailable: {0}")]
    Backend(String),

    /// A sealed record did not open (wrong secret or corrupted data)
    #[error("sealed record could not be opened")]
    Sealed,

    /// A record did not decode
    #[error("record codec error: {0}")]
    Codec(String),

    /// Passphrase stretching failed
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Errors from the key directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// User has no registered devices
    #[error("user {0} has no devices")]
    UserHasNoDevices(UserId),

    /// Device is not registered for this user
    #[error("unknown device {device_id} for user {user_id}")]
    UnknownDevice {
        /// Owner
        user_id: UserId,
        /// Device
        device_id: DeviceId,
    },

    /// Device has no unclaimed prekeys left
    #[error("device {device_id} of user {user_id} has no prekeys left")]
    DeviceExhausted {
        /// Owner
        user_id: UserId,
        /// Device
        device_id: DeviceId,
    },

    /// Request failed in transit or timed out
    #[error("network error: {0}")]
    Network(String),
}

impl DirectoryError {
    /// Returns true if the same call may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Errors surfaced by the orchestration layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Operation requires an initialized identity
    #[error("E2EE not initialized")]
    NotInitialized,

    /// Initialization conflicts with existing identity state
    #[error("identity already initialized with different key material; wipe first")]
    AlreadyInitializedConflict,

    /// Key store could not be read, written or unsealed
    #[error("key storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Recipient has no devices
    #[error("user {0} has no devices")]
    UserHasNoDevices(UserId),

    /// Recipient device has no prekeys left
    #[error("device {device_id} of user {user_id} has no prekeys left")]
    DeviceExhausted {
        /// Owner
        user_id: UserId,
        /// Device
        device_id: DeviceId,
    },

    /// Envelope carries no sender identity key
    #[error("envelope carries no sender identity")]
    NoIdentityInfo,

    /// Envelope has no ciphertext addressed to this device
    #[error("no ciphertext for this device")]
    NoCiphertextForDevice,

    /// No session exists to decrypt this message
    #[error("no matching session")]
    NoMatchingSession,

    /// Authentication or ratchet failure
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Not a single recipient device could be encrypted for
    #[error("no usable recipients")]
    NoUsableRecipients,

    /// Group encryption requested before a session exists
    #[error("no outbound group session for conversation {0}")]
    NoOutboundSession(ConversationId),

    /// Group message index already consumed
    #[error("replayed group message")]
    ReplayRejected,

    /// Directory request failed in transit
    #[error("network error: {0}")]
    NetworkError(String),

    /// Malformed public key
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Malformed envelope, payload or session key
    #[error("codec error: {0}")]
    Codec(String),
}

impl CryptoError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Only network failures qualify. An exhausted device needs the owner to
    /// upload more prekeys first.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError(_))
    }

    /// Placeholder shown in place of a message that failed with this error.
    pub fn placeholder(&self) -> Placeholder {
        match self {
            Self::NotInitialized => Placeholder::NotInitialized,
            Self::NoIdentityInfo => Placeholder::NoIdentityInfo,
            Self::NoCiphertextForDevice => Placeholder::NoCiphertextForDevice,
            Self::NoMatchingSession => Placeholder::NoMatchingSession,
            Self::ReplayRejected => Placeholder::ReplayRejected,
            _ => Placeholder::DecryptionFailed,
        }
    }
}

impl From<StoreError> for CryptoError {
    fn from(err: StoreError) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<DirectoryError> for CryptoError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::UserHasNoDevices(user_id) => Self::UserHasNoDevices(user_id),
            DirectoryError::DeviceExhausted { user_id, device_id } => {
                Self::DeviceExhausted { user_id, device_id }
            },
            DirectoryError::UnknownDevice { user_id, .. } => Self::UserHasNoDevices(user_id),
            DirectoryError::Network(reason) => Self::NetworkError(reason),
        }
    }
}

impl From<SenderKeyError> for CryptoError {
    fn from(err: SenderKeyError) -> Self {
        match err {
            SenderKeyError::ReplayedGeneration { .. } => Self::ReplayRejected,
            SenderKeyError::SessionMismatch => Self::NoMatchingSession,
            other => Self::DecryptionFailed(other.to_string()),
        }
    }
}

/// Fixed, user-facing text for a message that could not be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// This device has no identity yet
    NotInitialized,
    /// Envelope lacked the sender key
    NoIdentityInfo,
    /// Envelope was not addressed to this device
    NoCiphertextForDevice,
    /// No session with the sender device
    NoMatchingSession,
    /// Duplicate delivery of a group message
    ReplayRejected,
    /// Any other decryption failure
    DecryptionFailed,
}

impl Placeholder {
    /// Text rendered in conversation history.
    pub fn text(self) -> &'static str {
        match self {
            Self::NotInitialized => "Encrypted message (E2EE not initialized)",
            Self::NoIdentityInfo => "Encrypted message (missing sender identity)",
            Self::NoCiphertextForDevice => "Encrypted message (not encrypted for this device)",
            Self::NoMatchingSession => "Encrypted message (no session with sender)",
            Self::ReplayRejected => "Encrypted message (duplicate delivery)",
            Self::DecryptionFailed => "Unable to decrypt message",
        }
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_transient() {
        assert!(CryptoError::NetworkError("timeout".into()).is_transient());
        assert!(!CryptoError::NoUsableRecipients.is_transient());
        assert!(
            !CryptoError::DeviceExhausted { user_id: UserId::nil(), device_id: DeviceId::nil() }
                .is_transient()
        );
    }

    #[test]
    fn replay_maps_to_replay_placeholder() {
        let err =
            CryptoError::from(SenderKeyError::ReplayedGeneration { current: 4, requested: 2 });
        assert_eq!(err, CryptoError::ReplayRejected);
        assert_eq!(err.placeholder().text(), "Encrypted message (duplicate delivery)");
    }

    #[test]
    fn tampering_maps_to_generic_placeholder() {
        let err =
            CryptoError::from(SenderKeyError::DecryptionFailed { reason: "tag".to_string() });
        assert_eq!(err.placeholder(), Placeholder::DecryptionFailed);
        assert_eq!(err.placeholder().to_string(), "Unable to decrypt message");
    }

    #[test]
    fn directory_errors_convert() {
        let user = UserId::from_u128(1);
        assert_eq!(
            CryptoError::from(DirectoryError::UserHasNoDevices(user)),
            CryptoError::UserHasNoDevices(user)
        );
        assert!(CryptoError::from(DirectoryError::Network("reset".into())).is_transient());
    }

    #[test]
    fn storage_errors_convert() {
        let err = CryptoError::from(StoreError::Sealed);
        assert!(matches!(err, CryptoError::StorageUnavailable(_)));
    }
}
