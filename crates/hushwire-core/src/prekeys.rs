//! One-time prekey bookkeeping.
//!
//! The pairwise account owns the private halves. The [`PrekeyLedger`] tracks
//! what the account does not: which key ids were ever issued, which were
//! uploaded, which were consumed by an inbound session and which were evicted.
//!
//! Lifecycle per key: `Generated → Published → Claimed`, with `Discarded` for
//! keys the account dropped before anyone used them. A key id is issued once
//! and never reused.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;
use vodozemac::Curve25519PublicKey;

use crate::{
    identity::AccountState,
    types::{DeviceId, OneTimePrekey},
};

/// Where a prekey is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum PrekeyState {
    Generated,
    Published,
    Claimed,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerEntry {
    public_key: String,
    state: PrekeyState,
}

/// Every prekey this device ever issued, keyed by key id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PrekeyLedger {
    entries: BTreeMap<String, LedgerEntry>,
}

impl PrekeyLedger {
    /// Record freshly generated keys. Ids already in the ledger are ignored
    /// so a key is never issued twice. Returns the ids actually recorded.
    pub(crate) fn record_generated(
        &mut self,
        keys: impl IntoIterator<Item = (String, String)>,
    ) -> Vec<String> {
        let mut recorded = Vec::new();
        for (key_id, public_key) in keys {
            if self.entries.contains_key(&key_id) {
                continue;
            }
            self.entries
                .insert(key_id.clone(), LedgerEntry { public_key, state: PrekeyState::Generated });
            recorded.push(key_id);
        }
        recorded
    }

    /// Mark uploaded keys. Unknown or already consumed ids are ignored.
    pub(crate) fn mark_published<'a>(
        &mut self,
        key_ids: impl IntoIterator<Item = &'a str>,
    ) -> usize {
        let mut marked = 0;
        for key_id in key_ids {
            if let Some(entry) = self.entries.get_mut(key_id) {
                if entry.state == PrekeyState::Generated {
                    entry.state = PrekeyState::Published;
                    marked += 1;
                }
            }
        }
        marked
    }

    /// Mark the key with `public_key` as consumed by an inbound session.
    pub(crate) fn mark_claimed(&mut self, public_key: &str) -> bool {
        let entry = self.entries.values_mut().find(|entry| entry.public_key == public_key);
        match entry {
            Some(entry) if entry.state != PrekeyState::Claimed => {
                entry.state = PrekeyState::Claimed;
                true
            },
            _ => false,
        }
    }

    /// Discard generated keys the account no longer holds.
    pub(crate) fn discard_missing(&mut self, held: &HashSet<String>) -> usize {
        let mut discarded = 0;
        for (key_id, entry) in &mut self.entries {
            if entry.state == PrekeyState::Generated && !held.contains(key_id) {
                entry.state = PrekeyState::Discarded;
                discarded += 1;
            }
        }
        discarded
    }

    /// Keys still usable by a claimant (generated or published).
    pub(crate) fn unconsumed(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry.state, PrekeyState::Generated | PrekeyState::Published))
            .count()
    }

    /// Keys generated but not uploaded.
    pub(crate) fn unpublished(&self, device_id: DeviceId) -> Vec<OneTimePrekey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state == PrekeyState::Generated)
            .map(|(key_id, entry)| OneTimePrekey {
                device_id,
                key_id: key_id.clone(),
                public_key: entry.public_key.clone(),
                published: false,
            })
            .collect()
    }

    /// Keys by id, in the order given.
    pub(crate) fn prekeys(&self, device_id: DeviceId, key_ids: &[String]) -> Vec<OneTimePrekey> {
        key_ids
            .iter()
            .filter_map(|key_id| {
                self.entries.get(key_id).map(|entry| OneTimePrekey {
                    device_id,
                    key_id: key_id.clone(),
                    public_key: entry.public_key.clone(),
                    published: entry.state != PrekeyState::Generated,
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn state(&self, key_id: &str) -> Option<PrekeyState> {
        self.entries.get(key_id).map(|entry| entry.state)
    }
}

impl AccountState {
    /// Generate `count` new one-time prekeys.
    ///
    /// Keys the account evicts to make room are marked discarded.
    pub(crate) fn generate_prekeys(
        &mut self,
        device_id: DeviceId,
        count: usize,
    ) -> Vec<OneTimePrekey> {
        let before: HashSet<String> =
            self.account.one_time_keys().keys().map(|key_id| key_id.to_base64()).collect();

        self.account.generate_one_time_keys(count);

        let held = self.held_prekeys();
        let created = self.account.one_time_keys().into_iter().filter_map(|(key_id, public_key)| {
            let key_id = key_id.to_base64();
            (!before.contains(&key_id)).then(|| (key_id, public_key.to_base64()))
        });
        let recorded = self.prekeys.record_generated(created);
        let discarded = self.prekeys.discard_missing(&held);

        debug!(generated = recorded.len(), discarded, "generated one-time prekeys");
        self.prekeys.prekeys(device_id, &recorded)
    }

    /// Mark keys as uploaded to the directory.
    ///
    /// The account is told once no generated key remains unpublished.
    pub(crate) fn mark_prekeys_published(&mut self, key_ids: &[String]) -> usize {
        let marked = self.prekeys.mark_published(key_ids.iter().map(String::as_str));
        if self.prekeys.unpublished(DeviceId::nil()).is_empty() {
            self.account.mark_keys_as_published();
        }
        marked
    }

    /// Keys generated but not uploaded.
    pub(crate) fn unpublished_prekeys(&self, device_id: DeviceId) -> Vec<OneTimePrekey> {
        self.prekeys.unpublished(device_id)
    }

    /// True when fewer than `low_water_mark` usable prekeys remain.
    pub(crate) fn needs_replenishment(&self, low_water_mark: usize) -> bool {
        self.prekeys.unconsumed() < low_water_mark
    }

    /// True when generated keys are waiting for upload.
    pub(crate) fn needs_upload(&self) -> bool {
        !self.prekeys.unpublished(DeviceId::nil()).is_empty()
    }

    /// Record that an inbound session consumed `public_key`.
    pub(crate) fn consume_prekey(&mut self, public_key: &Curve25519PublicKey) {
        if !self.prekeys.mark_claimed(&public_key.to_base64()) {
            debug!("inbound session used a prekey missing from the ledger");
        }
    }

    fn held_prekeys(&self) -> HashSet<String> {
        self.account.one_time_keys().keys().map(|key_id| key_id.to_base64()).collect()
    }
}
