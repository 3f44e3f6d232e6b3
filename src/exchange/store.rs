//! Key material store: persistence boundary for signing key records.
//!
//! The [`KeyStore`] trait abstracts over storage backends. The only bundled
//! implementation is [`InMemoryKeyStore`]; durable backends (Vault, KMS,
//! database) implement the same two operations.
//!
//! # Atomicity
//!
//! Every key lifecycle transition is written as a single [`KeyChanges`]
//! batch. A backend must apply the whole batch or none of it: the
//! [`KeyManager`](super::keys::KeyManager) only swaps its in-memory snapshot
//! after `commit` returns `Ok`, so a failed commit leaves both sides unchanged.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use super::keys::SigningKey;

/// Error variants for key store backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyStoreError {
    /// The backend could not be reached or refused the operation.
    #[error("key store unavailable: {0}")]
    Unavailable(String),
}

/// A batch of key record mutations applied atomically.
#[derive(Debug, Default, Clone)]
pub struct KeyChanges {
    /// Records to insert or overwrite (keyed by `key_id`).
    pub upserts: Vec<SigningKey>,
    /// Key ids to delete (purged keys).
    pub removals: Vec<String>,
}

impl KeyChanges {
    /// `true` when the batch carries no mutation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Trait abstracting the key material backend.
///
/// Implementations must be `Send + Sync` because the store is shared between
/// the request path and the rotation tasks.
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync + 'static {
    /// Load every stored key record.
    async fn load(&self) -> Result<Vec<SigningKey>, KeyStoreError>;

    /// Apply a batch of mutations atomically.
    async fn commit(&self, changes: KeyChanges) -> Result<(), KeyStoreError>;
}

/// In-memory key store. Loses all keys on restart.
pub struct InMemoryKeyStore {
    records: Mutex<HashMap<String, SigningKey>>,
}

impl InMemoryKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored records, including revoked ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// `true` when no record is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for InMemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn load(&self) -> Result<Vec<SigningKey>, KeyStoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn commit(&self, changes: KeyChanges) -> Result<(), KeyStoreError> {
        let mut records = self.records.lock();
        for key in changes.upserts {
            debug!(kid = %key.key_id, status = ?key.status, "Stored key record");
            records.insert(key.key_id.clone(), key);
        }
        for kid in changes.removals {
            records.remove(&kid);
            debug!(kid = %kid, "Removed key record");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::keys::{KeyStatus, SigningAlgorithm};
    use chrono::Utc;

    fn make_key() -> SigningKey {
        SigningKey::generate(SigningAlgorithm::ES256, KeyStatus::Pending, Utc::now(), Utc::now())
            .unwrap()
    }

    #[tokio::test]
    async fn commit_then_load_returns_records() {
        // GIVEN: an empty store
        let store = InMemoryKeyStore::new();
        let key = make_key();
        let kid = key.key_id.clone();

        // WHEN: a batch with one upsert is committed
        store
            .commit(KeyChanges {
                upserts: vec![key],
                removals: Vec::new(),
            })
            .await
            .unwrap();

        // THEN: the record is loaded back
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key_id, kid);
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_record() {
        // GIVEN: a stored pending key
        let store = InMemoryKeyStore::new();
        let mut key = make_key();
        store
            .commit(KeyChanges {
                upserts: vec![key.clone()],
                removals: Vec::new(),
            })
            .await
            .unwrap();

        // WHEN: the same key id is stored again as active
        key.status = KeyStatus::Active;
        store
            .commit(KeyChanges {
                upserts: vec![key],
                removals: Vec::new(),
            })
            .await
            .unwrap();

        // THEN: one record, with the new status
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn removals_delete_records() {
        // GIVEN: a store with one key
        let store = InMemoryKeyStore::new();
        let key = make_key();
        let kid = key.key_id.clone();
        store
            .commit(KeyChanges {
                upserts: vec![key],
                removals: Vec::new(),
            })
            .await
            .unwrap();

        // WHEN: the key is removed
        store
            .commit(KeyChanges {
                upserts: Vec::new(),
                removals: vec![kid],
            })
            .await
            .unwrap();

        // THEN: store is empty
        assert!(store.is_empty());
    }

    #[test]
    fn empty_changes_report_empty() {
        assert!(KeyChanges::default().is_empty());
    }
}
