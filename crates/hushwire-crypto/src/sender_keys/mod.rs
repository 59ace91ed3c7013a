//! Sender Keys: the group ratchet primitive.
//!
//! One sender owns an outbound ratchet per conversation. Every other member
//! holds an imported copy and advances it to decrypt.
//!
//! # Architecture
//!
//! ```text
//! Random seed + session id
//!        │
//!        ▼ Initialize
//! SymmetricRatchet ──snapshot()──▶ RatchetSnapshot (shared with members)
//!        │
//!        ▼ Advance
//! MessageKey[generation]
//!        │
//!        ▼ Encrypt
//! XChaCha20-Poly1305 Ciphertext
//! ```
//!
//! # Security Properties
//!
//! - Forward Secrecy: old chain keys are deleted after deriving the next one
//! - Replay Rejection: receivers never step a ratchet backwards
//! - Session Binding: ciphertext is bound to its session id and generation

pub mod encryption;
pub mod error;
pub mod ratchet;

pub use encryption::{
    EncryptedGroupMessage, GROUP_SESSION_ID_SIZE, GroupSessionId, NONCE_RANDOM_SIZE,
    decrypt_message, encrypt_message,
};
pub use error::SenderKeyError;
pub use ratchet::{MessageKey, RatchetSnapshot, SymmetricRatchet};
