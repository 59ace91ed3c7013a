//! Error types for group ratchet operations

use thiserror::Error;

/// Errors from sender key operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SenderKeyError {
    /// Requested generation was already consumed (or is older than the
    /// imported snapshot). Duplicate delivery lands here.
    #[error("replayed generation: at generation {current}, got {requested}")]
    ReplayedGeneration {
        /// Next generation the ratchet will produce
        current: u32,
        /// Generation carried by the message
        requested: u32,
    },

    /// Requested generation is further ahead than we are willing to skip
    #[error("generation too far ahead: at generation {current}, need {requested}")]
    GenerationTooFarAhead {
        /// Next generation the ratchet will produce
        current: u32,
        /// Generation carried by the message
        requested: u32,
    },

    /// Message belongs to a different session than the ratchet
    #[error("session mismatch")]
    SessionMismatch,

    /// Decryption failed (authentication tag mismatch)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Ratchet generation would overflow
    #[error("ratchet generation overflow at {current}")]
    GenerationOverflow {
        /// Current generation when overflow was detected
        current: u32,
    },
}

impl SenderKeyError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors indicate tampering, corrupted key material or a bug.
    /// The rest can resolve once the missing key or ordering shows up.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::DecryptionFailed { .. }
            | Self::InvalidKeyLength { .. }
            | Self::GenerationOverflow { .. } => true,

            Self::ReplayedGeneration { .. }
            | Self::GenerationTooFarAhead { .. }
            | Self::SessionMismatch => false,
        }
    }
}
