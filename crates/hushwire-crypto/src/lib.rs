//! hushwire Cryptographic Primitives
//!
//! Building blocks the orchestration layer treats as an external library.
//! Pure functions with deterministic outputs. Callers provide random bytes so
//! that tests can run against a seeded environment.
//!
//! # Group Session Lifecycle
//!
//! A group session is a single forward-only symmetric ratchet owned by the
//! sender. The sender exports a snapshot of the ratchet (chain key and
//! generation) and hands it to every member device over an authenticated
//! pairwise channel. Receivers import the snapshot and advance their copy as
//! messages arrive.
//!
//! ```text
//! Random seed (per session)
//!        │
//!        ▼
//! Symmetric Ratchet ──export──▶ RatchetSnapshot ──pairwise──▶ member devices
//!        │
//!        ▼
//! Message Keys
//!        │
//!        ▼
//! AEAD Encryption (AAD = session id || generation) → Ciphertext
//! ```
//!
//! Message keys are used for exactly one encryption operation and are
//! zeroized on drop.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Ratchet advancement: old chain keys are zeroized after deriving the next
//! - A snapshot only reveals keys at or after its generation
//!
//! Replay Protection:
//! - Receivers never move a ratchet backwards; a generation at or behind the
//!   consumed position is rejected as a replay
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD with the session id and generation bound as
//!   associated data
//!
//! # At-Rest Sealing
//!
//! [`SealingKey`] encrypts persisted records (account and session pickles)
//! under a key derived from the device's store secret, and [`RecordNamer`]
//! turns lookup keys into opaque keyed hashes so the communication graph is
//! not readable from disk.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod derivation;
pub mod sealing;
pub mod sender_keys;

pub use derivation::{RecordNamer, derive_subkey};
pub use sealing::{SEAL_NONCE_SIZE, SealError, SealingKey};
pub use sender_keys::{
    EncryptedGroupMessage, GROUP_SESSION_ID_SIZE, GroupSessionId, MessageKey, NONCE_RANDOM_SIZE,
    RatchetSnapshot, SenderKeyError, SymmetricRatchet, decrypt_message, encrypt_message,
};
