//! Property-based tests for the group ratchet
//!
//! 1. **Round-trip**: a receiver holding a snapshot decrypts every later message
//! 2. **Key uniqueness**: different generations produce different keys
//! 3. **Monotonicity**: a consumed generation is never accepted again
//! 4. **Out-of-order tolerance**: skipping ahead within the bound still works

#![allow(clippy::unwrap_used)]

use hushwire_crypto::{
    GROUP_SESSION_ID_SIZE, NONCE_RANDOM_SIZE, SealingKey, SenderKeyError, SymmetricRatchet,
    decrypt_message, encrypt_message, sealing::SEAL_NONCE_SIZE,
};
use proptest::prelude::*;

fn seed_strategy() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_snapshot_receiver_decrypts(
        seed in seed_strategy(),
        session_id in prop::array::uniform16(any::<u8>()),
        already_sent in 0u32..20,
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
        random_byte in any::<u8>(),
    ) {
        let mut sender = SymmetricRatchet::new(&seed);
        for _ in 0..already_sent {
            sender.advance().unwrap();
        }
        let mut receiver = SymmetricRatchet::from_snapshot(&sender.snapshot());

        let key = sender.advance().unwrap();
        let nonce_random = [random_byte; NONCE_RANDOM_SIZE];
        let encrypted = encrypt_message(&plaintext, &key, &session_id, nonce_random);

        let receive_key = receiver.advance_to(encrypted.generation).unwrap();
        let decrypted = decrypt_message(&encrypted, &receive_key).unwrap();

        prop_assert_eq!(decrypted, plaintext);
        prop_assert_eq!(session_id.len(), GROUP_SESSION_ID_SIZE);
    }

    #[test]
    fn prop_ratchet_keys_unique(seed in seed_strategy(), num_keys in 2usize..20) {
        let mut ratchet = SymmetricRatchet::new(&seed);
        let keys: Vec<_> = (0..num_keys).map(|_| ratchet.advance().unwrap()).collect();

        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                prop_assert_ne!(keys[i].key(), keys[j].key());
            }
        }
    }

    #[test]
    fn prop_consumed_generation_rejected(
        seed in seed_strategy(),
        consumed in 0u32..50,
        replay_offset in 0u32..50,
    ) {
        let mut ratchet = SymmetricRatchet::new(&seed);
        ratchet.advance_to(consumed).unwrap();

        let replayed = consumed.saturating_sub(replay_offset);
        let result = ratchet.advance_to(replayed);

        let is_replay = matches!(result, Err(SenderKeyError::ReplayedGeneration { .. }));
        prop_assert!(is_replay);
        prop_assert_eq!(ratchet.generation(), consumed + 1);
    }

    #[test]
    fn prop_out_of_order_within_bound(
        seed in seed_strategy(),
        first in 0u32..100,
        gap in 1u32..100,
    ) {
        let mut sender = SymmetricRatchet::new(&seed);
        let mut receiver = SymmetricRatchet::new(&seed);

        let later = first + gap;
        let expected = sender.advance_to(later).unwrap();

        // The receiver jumps straight to `later`, leaving `first` behind.
        let got = receiver.advance_to(later).unwrap();
        prop_assert_eq!(expected.key(), got.key());

        let stale = receiver.advance_to(first);
        prop_assert!(stale.is_err());
    }

    #[test]
    fn prop_seal_open_roundtrip(
        key in seed_strategy(),
        nonce_byte in any::<u8>(),
        record in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let sealing = SealingKey::new(key);
        let sealed = sealing.seal(&record, [nonce_byte; SEAL_NONCE_SIZE]);

        prop_assert_eq!(sealing.open(&sealed).unwrap(), record);
    }
}
