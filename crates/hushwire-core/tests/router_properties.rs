//! Property-based tests for the message cipher router
//!
//! 1. **Round-trip**: any text survives direct and group encryption
//! 2. **Fan-out partition**: every requested recipient is either encrypted
//!    for or reported as skipped, never both
//! 3. **Fail closed**: a send with no reachable device produces no envelope

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use hushwire_core::{
    ConversationId, ConversationKind, CryptoConfig, CryptoError, CryptoRouter, Envelope,
    InMemoryDirectory, MemoryBackend, MockEnv, OneTimePrekey, Received, StoreSecret, UserId,
};
use proptest::prelude::*;

const CONVERSATION: ConversationId = ConversationId::from_u128(0xC0);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap()
}

async fn join(directory: &InMemoryDirectory, user: u128) -> CryptoRouter<MockEnv> {
    let config = CryptoConfig { initial_prekey_count: 2, ..CryptoConfig::default() };
    let router = CryptoRouter::new(
        UserId::from_u128(user),
        Arc::new(MemoryBackend::new()),
        Arc::new(directory.clone()),
        MockEnv::with_seed(user as u64),
        config,
    );
    let bundle = router.initialize(StoreSecret::key([user as u8; 32])).await.unwrap();
    let ids: Vec<String> =
        bundle.unpublished_prekeys.iter().map(|key| key.key_id.clone()).collect();

    directory.register_device(bundle.identity.clone());
    directory.publish_prekeys(
        bundle.identity.user_id,
        bundle.identity.device_id,
        bundle.unpublished_prekeys.iter().map(OneTimePrekey::info).collect(),
    );
    router.mark_prekeys_published(&ids).await.unwrap();
    router
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_text_round_trips(body in ".{0,200}") {
        runtime().block_on(async {
            let directory = InMemoryDirectory::new();
            let alice = join(&directory, 1).await;
            let bob = join(&directory, 2).await;
            let alice_id = UserId::from_u128(1);
            let bob_id = UserId::from_u128(2);

            let direct =
                alice.send(ConversationKind::Direct, CONVERSATION, &[bob_id], &body).await.unwrap();
            let received = bob.receive(alice_id, &direct.envelope).await;
            prop_assert_eq!(received, Received::Text(body.clone()));

            let share = alice.share_group_session(CONVERSATION, &[bob_id]).await.unwrap();
            prop_assert!(!bob.receive(alice_id, &share.envelope).await.is_failure());

            let group =
                alice.send(ConversationKind::Group, CONVERSATION, &[], &body).await.unwrap();
            prop_assert_eq!(bob.receive(alice_id, &group.envelope).await, Received::Text(body));
            Ok(())
        })?;
    }

    #[test]
    fn prop_fan_out_partitions_recipients(
        registered in prop::collection::vec(any::<bool>(), 1..5),
    ) {
        runtime().block_on(async {
            let directory = InMemoryDirectory::new();
            let alice = join(&directory, 1).await;

            let mut recipients = Vec::new();
            for (index, present) in registered.iter().enumerate() {
                let user = 10 + index as u128;
                if *present {
                    join(&directory, user).await;
                }
                recipients.push(UserId::from_u128(user));
            }

            let result =
                alice.send(ConversationKind::Direct, CONVERSATION, &recipients, "hi").await;
            let reachable = registered.iter().filter(|present| **present).count();

            if reachable == 0 {
                prop_assert_eq!(result, Err(CryptoError::NoUsableRecipients));
                return Ok(());
            }

            let receipt = result.unwrap();
            let Envelope::Pairwise(envelope) = &receipt.envelope else {
                return Err(TestCaseError::fail("direct send produced a group envelope"));
            };
            prop_assert_eq!(envelope.device_count(), reachable);
            prop_assert_eq!(receipt.skipped.len(), recipients.len() - reachable);

            for (user, present) in recipients.iter().zip(&registered) {
                let addressed = envelope.recipients.contains_key(user);
                let skipped = receipt.skipped.iter().any(|skip| skip.user_id == *user);
                prop_assert_eq!(addressed, *present);
                prop_assert_ne!(addressed, skipped);
            }
            Ok(())
        })?;
    }
}
