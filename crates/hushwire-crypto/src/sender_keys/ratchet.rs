//! Symmetric Ratchet for forward-secure message key derivation
//!
//! # Security Properties
//!
//! - Forward Secrecy: Old chain keys are overwritten when advancing
//! - Key Uniqueness: Each generation produces a unique message key
//! - Determinism: Same seed always produces same key sequence
//! - Monotonicity: A ratchet never moves to an earlier generation

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use super::error::SenderKeyError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"hushwire chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"hushwire message";

/// Maximum number of generations to skip when catching up.
/// Bounds the work an attacker can force with a forged generation.
pub const MAX_SKIP: u32 = 1000;

/// A message key derived from the ratchet.
///
/// Used for a single message encryption/decryption, then dropped.
#[derive(Clone)]
pub struct MessageKey {
    /// The 32-byte symmetric key for XChaCha20-Poly1305
    key: [u8; 32],
    /// The generation (ratchet step) this key was derived from
    generation: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Ratchet generation this key was derived from.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Exportable ratchet position: the chain key at `generation`.
///
/// Whoever holds a snapshot can derive every message key from `generation`
/// onwards and none before it. This is the session key material members
/// exchange over the pairwise channel.
pub struct RatchetSnapshot {
    chain_key: [u8; 32],
    generation: u32,
}

impl RatchetSnapshot {
    /// Rebuild a snapshot from raw parts (e.g. after decoding a shared key).
    pub fn from_parts(chain_key: &[u8], generation: u32) -> Result<Self, SenderKeyError> {
        let chain_key: [u8; 32] = chain_key.try_into().map_err(|_| {
            SenderKeyError::InvalidKeyLength { expected: 32, actual: chain_key.len() }
        })?;
        Ok(Self { chain_key, generation })
    }

    /// Chain key at [`Self::generation`].
    pub fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    /// First generation this snapshot can decrypt.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Drop for RatchetSnapshot {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

/// Forward-secure symmetric ratchet.
///
/// Each [`advance()`](Self::advance) call:
/// 1. Derives a message key from the current chain key
/// 2. Derives the next chain key
/// 3. Overwrites the old chain key (forward secrecy)
///
/// `Clone` exists so a receiver can advance a scratch copy, authenticate the
/// message, and only then commit the copy. A forged generation therefore
/// never moves the real ratchet.
pub struct SymmetricRatchet {
    /// Current chain key (32 bytes)
    chain_key: [u8; 32],
    /// Generation of the next message key
    generation: u32,
}

impl SymmetricRatchet {
    /// Create a new ratchet from a random seed, starting at generation 0.
    pub fn new(seed: &[u8; 32]) -> Self {
        Self { chain_key: *seed, generation: 0 }
    }

    /// Resume a ratchet from an exported snapshot.
    pub fn from_snapshot(snapshot: &RatchetSnapshot) -> Self {
        Self { chain_key: snapshot.chain_key, generation: snapshot.generation }
    }

    /// Export the current position without advancing.
    pub fn snapshot(&self) -> RatchetSnapshot {
        RatchetSnapshot { chain_key: self.chain_key, generation: self.generation }
    }

    /// Generation of the next message key this ratchet will produce.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Advance the ratchet and derive the next message key.
    pub fn advance(&mut self) -> Result<MessageKey, SenderKeyError> {
        if self.generation == u32::MAX {
            return Err(SenderKeyError::GenerationOverflow { current: self.generation });
        }

        let message_key = self.derive(MESSAGE_LABEL);
        let next_chain_key = self.derive(CHAIN_LABEL);

        self.chain_key.zeroize();
        self.chain_key = next_chain_key;

        let current_gen = self.generation;
        self.generation += 1;

        Ok(MessageKey { key: message_key, generation: current_gen })
    }

    /// Advance the ratchet to a specific generation and return its key.
    ///
    /// Keys for skipped generations are discarded, so anything behind the
    /// new position is unrecoverable afterwards.
    ///
    /// # Errors
    ///
    /// - `ReplayedGeneration` if `target` is behind the current position
    /// - `GenerationTooFarAhead` if more than [`MAX_SKIP`] steps are needed
    pub fn advance_to(&mut self, target: u32) -> Result<MessageKey, SenderKeyError> {
        if target < self.generation {
            return Err(SenderKeyError::ReplayedGeneration {
                current: self.generation,
                requested: target,
            });
        }

        if target - self.generation > MAX_SKIP {
            return Err(SenderKeyError::GenerationTooFarAhead {
                current: self.generation,
                requested: target,
            });
        }

        loop {
            let key = self.advance()?;
            if key.generation() == target {
                return Ok(key);
            }
        }
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Clone for SymmetricRatchet {
    fn clone(&self) -> Self {
        Self { chain_key: self.chain_key, generation: self.generation }
    }
}

impl Drop for SymmetricRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_seed() -> [u8; 32] {
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8;
        }
        seed
    }

    #[test]
    fn new_ratchet_starts_at_generation_zero() {
        let ratchet = SymmetricRatchet::new(&test_seed());
        assert_eq!(ratchet.generation(), 0);
    }

    #[test]
    fn advance_produces_unique_keys() {
        let mut ratchet = SymmetricRatchet::new(&test_seed());

        let key0 = ratchet.advance().unwrap();
        let key1 = ratchet.advance().unwrap();

        assert_eq!(key0.generation(), 0);
        assert_eq!(key1.generation(), 1);
        assert_ne!(key0.key(), key1.key());
        assert_eq!(ratchet.generation(), 2);
    }

    #[test]
    fn advance_to_matches_sequential_advance() {
        let mut sequential = SymmetricRatchet::new(&test_seed());
        for _ in 0..5 {
            sequential.advance().unwrap();
        }
        let key_sequential = sequential.advance().unwrap();

        let mut skipping = SymmetricRatchet::new(&test_seed());
        let key_skip = skipping.advance_to(5).unwrap();

        assert_eq!(key_sequential.key(), key_skip.key());
        assert_eq!(skipping.generation(), 6);
    }

    #[test]
    fn advance_to_rejects_consumed_generation() {
        let mut ratchet = SymmetricRatchet::new(&test_seed());
        ratchet.advance_to(5).unwrap();

        let result = ratchet.advance_to(5);
        assert_eq!(
            result.err(),
            Some(SenderKeyError::ReplayedGeneration { current: 6, requested: 5 })
        );
        assert_eq!(ratchet.generation(), 6);
    }

    #[test]
    fn advance_to_rejects_too_far_ahead() {
        let mut ratchet = SymmetricRatchet::new(&test_seed());

        let result = ratchet.advance_to(MAX_SKIP + 100);
        assert!(matches!(result, Err(SenderKeyError::GenerationTooFarAhead { .. })));
        assert_eq!(ratchet.generation(), 0);
    }

    #[test]
    fn snapshot_resumes_at_same_position() {
        let mut sender = SymmetricRatchet::new(&test_seed());
        sender.advance().unwrap();
        sender.advance().unwrap();

        let snapshot = sender.snapshot();
        assert_eq!(snapshot.generation(), 2);

        let mut receiver = SymmetricRatchet::from_snapshot(&snapshot);
        let sent = sender.advance().unwrap();
        let received = receiver.advance_to(2).unwrap();

        assert_eq!(sent.key(), received.key());
    }

    #[test]
    fn snapshot_cannot_reach_earlier_generations() {
        let mut sender = SymmetricRatchet::new(&test_seed());
        sender.advance_to(3).unwrap();

        let mut receiver = SymmetricRatchet::from_snapshot(&sender.snapshot());
        assert!(matches!(receiver.advance_to(1), Err(SenderKeyError::ReplayedGeneration { .. })));
    }

    #[test]
    fn snapshot_from_parts_validates_length() {
        let result = RatchetSnapshot::from_parts(&[0u8; 16], 0);
        assert!(matches!(
            result,
            Err(SenderKeyError::InvalidKeyLength { expected: 32, actual: 16 })
        ));
    }

    #[test]
    fn clone_advances_independently() {
        let mut original = SymmetricRatchet::new(&test_seed());
        let mut scratch = original.clone();

        let scratch_key = scratch.advance_to(4).unwrap();
        assert_eq!(original.generation(), 0);
        assert_eq!(scratch.generation(), 5);

        let original_key = original.advance_to(4).unwrap();
        assert_eq!(original_key.key(), scratch_key.key());
    }
}
