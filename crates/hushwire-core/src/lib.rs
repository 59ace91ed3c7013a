//! hushwire Core
//!
//! End-to-end encryption orchestration for a chat client. Per conversation it
//! picks the session protocol (pairwise double-ratchet sessions for direct
//! conversations, sender ratchets for groups), manages the keys and sessions
//! those protocols need, and wraps message send/receive with encryption.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────┐
//!   messaging layer ───▶│ CryptoRouter │
//!                       └──────┬───────┘
//!          ┌──────────────┬────┴─────────┬───────────────┐
//!          ▼              ▼              ▼               ▼
//!   IdentityStore   DirectoryClient  PairwiseEngine  GroupEngine
//!          │                               │               │
//!          └──────────────┬────────────────┴───────────────┘
//!                         ▼
//!                  KeyStore (sealed) ──▶ StoreBackend
//! ```
//!
//! # Components
//!
//! - [`CryptoRouter`]: entry point; send, receive, lifecycle
//! - [`IdentityStore`]: device identity, idempotent initialization
//! - [`KeyDirectory`]: device lookup and one-time prekey claims
//! - [`StoreBackend`]: persistence seam for sealed records
//! - [`Environment`]: time and randomness, seeded in tests
//!
//! # Failure model
//!
//! Sends return typed errors ([`CryptoError`]). Receives never fail: every
//! error is turned into a [`Placeholder`] so the message still renders in
//! conversation history.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod directory;
mod env;
mod envelope;
mod error;
mod group;
mod identity;
mod pairwise;
mod prekeys;
mod router;
mod session_table;
mod store;
mod types;

pub use config::CryptoConfig;
pub use directory::{DirectoryClient, InMemoryDirectory, KeyDirectory};
pub use env::{Environment, MockEnv, SystemEnv};
pub use envelope::{
    DeviceCiphertext, EncryptedEnvelope, EncryptedGroupEnvelope, Envelope, MessageType,
    PairwisePayload,
};
pub use error::{CryptoError, DirectoryError, Placeholder, StoreError};
pub use identity::IdentityStore;
pub use pairwise::DeviceWarning;
pub use router::{CryptoRouter, Received, SendReceipt, SkippedRecipient};
pub use store::{MemoryBackend, StoreBackend, StoreSecret};
pub use types::{
    ClaimedPrekey, ConversationId, ConversationKind, DeviceId, DeviceIdentity, E2eeStatus,
    IdentityBundle, OneTimePrekey, PrekeyInfo, UserId,
};
