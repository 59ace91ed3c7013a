//! Per-session locking.
//!
//! A [`SessionTable`] maps a session identity to a slot guarded by an async
//! mutex. Slots are created under a short synchronous table lock, and the
//! session itself is created or loaded while holding the slot lock. Two tasks
//! racing on a new identity therefore agree on one slot, and only the first
//! to lock it establishes the session.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

/// Async-locked slot holding a session that may not be loaded yet.
pub(crate) type Slot<S> = Arc<tokio::sync::Mutex<Option<S>>>;

/// Table of independently locked session slots.
pub(crate) struct SessionTable<K, S> {
    slots: Mutex<HashMap<K, Slot<S>>>,
}

impl<K: Eq + Hash + Clone, S> SessionTable<K, S> {
    pub(crate) fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }

    /// Slot for `key`, created empty on first access.
    pub(crate) fn slot(&self, key: &K) -> Slot<S> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot =
            slots.entry(key.clone()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)));
        Arc::clone(slot)
    }

    /// Slot for `key` if one was ever created.
    pub(crate) fn existing(&self, key: &K) -> Option<Slot<S>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Drop every slot. Sessions held by in-flight operations are released
    /// when those operations finish.
    pub(crate) fn clear(&self) {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_shares_slot() {
        let table: SessionTable<u32, String> = SessionTable::new();

        let a = table.slot(&1);
        let b = table.slot(&1);
        *a.lock().await = Some("session".to_string());

        assert_eq!(b.lock().await.as_deref(), Some("session"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let table: SessionTable<u32, String> = SessionTable::new();

        let a = table.slot(&1);
        let _held = a.lock().await;

        // Locking another slot must not wait on the held one
        let b = table.slot(&2);
        assert!(b.try_lock().is_ok());
    }

    #[test]
    fn clear_forgets_slots() {
        let table: SessionTable<u32, String> = SessionTable::new();
        table.slot(&1);
        assert!(table.existing(&1).is_some());

        table.clear();
        assert!(table.existing(&1).is_none());
    }
}
