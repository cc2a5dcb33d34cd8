//! In-memory storage backend.
//!
//! Tables are [`DashMap`]s written in place. Each write registers an undo
//! action holding the before-image, so rollback restores the table exactly.
//! The whole store can be exported as a [`StorageSnapshot`] and written to a
//! JSON file, which is how state survives a restart.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{LockKey, LockTable, Record, RecordStore, StorageManager, Transaction};
use crate::error::StorageError;
use crate::records::{
    CreateSequenceRecord, InvokerRecord, RmdRecord, RmsRecord, SenderRecord, SequenceProperty,
    StoredPayload,
};

// =============================================================================
// Table
// =============================================================================

/// One in-memory record table.
pub struct InMemoryTable<R: Record> {
    rows: Arc<DashMap<String, R>>,
}

impl<R: Record> Default for InMemoryTable<R> {
    fn default() -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
        }
    }
}

impl<R: Record> InMemoryTable<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn load(records: Vec<R>) -> Self {
        let table = Self::new();
        for record in records {
            table.rows.insert(record.key(), record);
        }
        table
    }

    /// Current rows in key order, without locking.
    fn export(&self) -> Vec<R> {
        let mut rows: Vec<(String, R)> = self
            .rows
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, r)| r).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for InMemoryTable<R> {
    async fn insert(&self, tx: &mut Transaction, record: R) -> Result<(), StorageError> {
        let key = record.key();
        tx.enlist(LockKey::new(R::KIND, key.clone())).await?;

        match self.rows.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(StorageError::DuplicateKey { kind: R::KIND, key });
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }

        let rows = self.rows.clone();
        tx.on_rollback(move || {
            rows.remove(&key);
        });
        Ok(())
    }

    async fn retrieve(&self, tx: &mut Transaction, key: &str) -> Result<Option<R>, StorageError> {
        tx.enlist(LockKey::new(R::KIND, key)).await?;
        Ok(self.rows.get(key).map(|r| r.value().clone()))
    }

    async fn update(&self, tx: &mut Transaction, record: R) -> Result<(), StorageError> {
        let key = record.key();
        tx.enlist(LockKey::new(R::KIND, key.clone())).await?;

        let before = match self.rows.get_mut(&key) {
            Some(mut existing) => std::mem::replace(existing.value_mut(), record),
            None => return Err(StorageError::NotFound { kind: R::KIND, key }),
        };

        let rows = self.rows.clone();
        tx.on_rollback(move || {
            rows.insert(key, before);
        });
        Ok(())
    }

    async fn delete(&self, tx: &mut Transaction, key: &str) -> Result<bool, StorageError> {
        tx.enlist(LockKey::new(R::KIND, key)).await?;

        let Some((key, before)) = self.rows.remove(key) else {
            return Ok(false);
        };

        let rows = self.rows.clone();
        tx.on_rollback(move || {
            rows.insert(key, before);
        });
        Ok(true)
    }

    async fn find(&self, tx: &mut Transaction, finder: &R::Finder) -> Result<Vec<R>, StorageError> {
        let mut keys: Vec<String> = self
            .rows
            .iter()
            .filter(|e| e.value().matches(finder))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();

        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            tx.enlist(LockKey::new(R::KIND, key.clone())).await?;
            // Re-check: the record may have changed while we waited.
            let current = self.rows.get(&key).map(|r| r.value().clone());
            if let Some(record) = current {
                if record.matches(finder) {
                    found.push(record);
                }
            }
        }
        Ok(found)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Serialized contents of every table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub rms: Vec<RmsRecord>,
    pub rmd: Vec<RmdRecord>,
    pub senders: Vec<SenderRecord>,
    pub invokers: Vec<InvokerRecord>,
    pub properties: Vec<SequenceProperty>,
    pub create_sequences: Vec<CreateSequenceRecord>,
    pub payloads: Vec<StoredPayload>,
}

// =============================================================================
// Storage Manager
// =============================================================================

/// [`StorageManager`] keeping every table in memory.
pub struct InMemoryStorageManager {
    locks: Arc<LockTable>,
    lock_timeout: Option<Duration>,
    rms: InMemoryTable<RmsRecord>,
    rmd: InMemoryTable<RmdRecord>,
    senders: InMemoryTable<SenderRecord>,
    invokers: InMemoryTable<InvokerRecord>,
    properties: InMemoryTable<SequenceProperty>,
    create_sequences: InMemoryTable<CreateSequenceRecord>,
    payloads: InMemoryTable<StoredPayload>,
}

impl Default for InMemoryStorageManager {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(30)))
    }
}

impl InMemoryStorageManager {
    /// Create an empty store with the given lock wait bound.
    pub fn new(lock_timeout: Option<Duration>) -> Self {
        Self::from_snapshot(StorageSnapshot::default(), lock_timeout)
    }

    /// Rebuild a store from a snapshot.
    pub fn from_snapshot(snapshot: StorageSnapshot, lock_timeout: Option<Duration>) -> Self {
        Self {
            locks: Arc::new(LockTable::new()),
            lock_timeout,
            rms: InMemoryTable::load(snapshot.rms),
            rmd: InMemoryTable::load(snapshot.rmd),
            senders: InMemoryTable::load(snapshot.senders),
            invokers: InMemoryTable::load(snapshot.invokers),
            properties: InMemoryTable::load(snapshot.properties),
            create_sequences: InMemoryTable::load(snapshot.create_sequences),
            payloads: InMemoryTable::load(snapshot.payloads),
        }
    }

    /// Export every table.
    ///
    /// Writes of transactions still in flight are included, so take
    /// snapshots while the engine is stopped or idle.
    pub fn snapshot(&self) -> StorageSnapshot {
        StorageSnapshot {
            rms: self.rms.export(),
            rmd: self.rmd.export(),
            senders: self.senders.export(),
            invokers: self.invokers.export(),
            properties: self.properties.export(),
            create_sequences: self.create_sequences.export(),
            payloads: self.payloads.export(),
        }
    }

    /// Write a snapshot to `path` as JSON.
    pub async fn save_to(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        tokio::fs::write(path.as_ref(), json).await?;
        info!(path = %path.as_ref().display(), "storage snapshot saved");
        Ok(())
    }

    /// Rebuild a store from a JSON snapshot file.
    pub async fn load_from(
        path: impl AsRef<Path>,
        lock_timeout: Option<Duration>,
    ) -> Result<Self, StorageError> {
        let json = tokio::fs::read(path.as_ref()).await?;
        let snapshot: StorageSnapshot = serde_json::from_slice(&json)?;
        info!(
            path = %path.as_ref().display(),
            outbound = snapshot.rms.len(),
            inbound = snapshot.rmd.len(),
            "storage snapshot loaded"
        );
        Ok(Self::from_snapshot(snapshot, lock_timeout))
    }

    /// The lock table shared by this store's transactions.
    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }
}

impl StorageManager for InMemoryStorageManager {
    fn begin(&self) -> Transaction {
        Transaction::new(self.locks.clone(), self.lock_timeout)
    }

    fn rms(&self) -> &dyn RecordStore<RmsRecord> {
        &self.rms
    }

    fn rmd(&self) -> &dyn RecordStore<RmdRecord> {
        &self.rmd
    }

    fn senders(&self) -> &dyn RecordStore<SenderRecord> {
        &self.senders
    }

    fn invokers(&self) -> &dyn RecordStore<InvokerRecord> {
        &self.invokers
    }

    fn properties(&self) -> &dyn RecordStore<SequenceProperty> {
        &self.properties
    }

    fn create_sequences(&self) -> &dyn RecordStore<CreateSequenceRecord> {
        &self.create_sequences
    }

    fn payloads(&self) -> &dyn RecordStore<StoredPayload> {
        &self.payloads
    }
}

impl std::fmt::Debug for InMemoryStorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorageManager")
            .field("rms", &self.rms.len())
            .field("rmd", &self.rmd.len())
            .field("senders", &self.senders.len())
            .field("invokers", &self.invokers.len())
            .field("payloads", &self.payloads.len())
            .field("locks", &self.locks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{InvokerFinder, MessageKind, RmsFinder, SenderFinder};
    use chrono::Utc;

    fn storage() -> InMemoryStorageManager {
        InMemoryStorageManager::new(Some(Duration::from_millis(50)))
    }

    fn invoker(seq: &str, n: u64) -> InvokerRecord {
        InvokerRecord::new(format!("{seq}-{n}"), seq, n, Utc::now())
    }

    #[tokio::test]
    async fn test_crud_contract() {
        let storage = storage();
        let mut tx = storage.begin();
        let rms = RmsRecord::new("client-1", "http://peer", Utc::now());

        storage.rms().insert(&mut tx, rms.clone()).await.unwrap();
        let dup = storage.rms().insert(&mut tx, rms.clone()).await.unwrap_err();
        assert!(matches!(dup, StorageError::DuplicateKey { .. }));

        let mut loaded = storage.rms().retrieve(&mut tx, "client-1").await.unwrap().unwrap();
        assert_eq!(loaded, rms);
        loaded.timed_out = true;
        storage.rms().update(&mut tx, loaded).await.unwrap();

        let missing = RmsRecord::new("nobody", "http://peer", Utc::now());
        let err = storage.rms().update(&mut tx, missing).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));

        assert!(storage.rms().delete(&mut tx, "client-1").await.unwrap());
        assert!(!storage.rms().delete(&mut tx, "client-1").await.unwrap());
        assert!(storage.rms().retrieve(&mut tx, "client-1").await.unwrap().is_none());
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_rollback_restores_before_images() {
        let storage = storage();
        let mut tx = storage.begin();
        storage.invokers().insert(&mut tx, invoker("s", 1)).await.unwrap();
        storage.invokers().insert(&mut tx, invoker("s", 2)).await.unwrap();
        tx.commit().unwrap();

        let mut tx = storage.begin();
        let mut first = invoker("s", 1);
        first.invoked = true;
        storage.invokers().update(&mut tx, first).await.unwrap();
        storage.invokers().delete(&mut tx, "s-2").await.unwrap();
        storage.invokers().insert(&mut tx, invoker("s", 3)).await.unwrap();
        tx.rollback();

        let mut tx = storage.begin();
        let all = storage.invokers().find(&mut tx, &InvokerFinder::default()).await.unwrap();
        let numbers: Vec<(u64, bool)> = all.iter().map(|r| (r.message_number, r.invoked)).collect();
        assert_eq!(numbers, vec![(1, false), (2, false)]);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_find_with_empty_and_exact_finders() {
        let storage = storage();
        let now = Utc::now();
        let mut tx = storage.begin();
        let records = vec![
            SenderRecord::application("a", "s-a", "d", 1, "p1", now),
            SenderRecord::application("a", "s-a", "d", 2, "p2", now),
            SenderRecord::application("b", "s-b", "d", 1, "p3", now),
            SenderRecord::control(MessageKind::CreateSequence, "d", now).for_outbound("c"),
        ];
        for record in records {
            storage.senders().insert(&mut tx, record).await.unwrap();
        }

        let all = storage.senders().find(&mut tx, &SenderFinder::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let for_a = storage
            .senders()
            .find(&mut tx, &SenderFinder::for_internal_sequence("a"))
            .await
            .unwrap();
        assert_eq!(for_a.len(), 2);
        assert!(for_a.iter().all(|r| r.internal_sequence_id.as_deref() == Some("a")));

        let err = storage
            .senders()
            .find_unique(&mut tx, &SenderFinder::for_internal_sequence("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NonUniqueResult { count: 2, .. }));

        let unique = storage
            .senders()
            .find_unique(&mut tx, &SenderFinder::for_internal_sequence("b"))
            .await
            .unwrap();
        assert_eq!(unique.and_then(|r| r.message_number), Some(1));
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_find_rechecks_after_waiting() {
        let storage = Arc::new(InMemoryStorageManager::new(Some(Duration::from_secs(5))));
        let mut tx = storage.begin();
        let mut rms = RmsRecord::new("client-1", "http://peer", Utc::now());
        storage.rms().insert(&mut tx, rms.clone()).await.unwrap();
        tx.commit().unwrap();

        // Holder changes the record so it no longer matches the finder.
        let mut holder = storage.begin();
        storage.rms().retrieve(&mut holder, "client-1").await.unwrap();

        let finder_storage = storage.clone();
        let finder = tokio::spawn(async move {
            let mut tx = finder_storage.begin();
            let found = finder_storage
                .rms()
                .find(
                    &mut tx,
                    &RmsFinder {
                        timed_out: Some(false),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            tx.commit().unwrap();
            found.len()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        rms.timed_out = true;
        storage.rms().update(&mut holder, rms).await.unwrap();
        holder.commit().unwrap();

        assert_eq!(finder.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_insert_blocks_retrieve() {
        let storage = storage();
        let mut writer = storage.begin();
        storage
            .rms()
            .insert(&mut writer, RmsRecord::new("client-1", "http://peer", Utc::now()))
            .await
            .unwrap();

        let mut reader = storage.begin();
        let err = storage.rms().retrieve(&mut reader, "client-1").await.unwrap_err();
        assert!(err.is_retryable());
        drop(writer);

        assert!(storage.rms().retrieve(&mut reader, "client-1").await.unwrap().is_none());
        reader.commit().unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let storage = storage();
        let mut tx = storage.begin();
        let mut rms = RmsRecord::new("client-1", "http://peer", Utc::now());
        rms.acknowledged = "1-4,6".parse().unwrap();
        storage.rms().insert(&mut tx, rms).await.unwrap();
        storage
            .payloads()
            .insert(&mut tx, StoredPayload::new(bytes::Bytes::from_static(b"hello"), Utc::now()))
            .await
            .unwrap();
        tx.commit().unwrap();

        let path = std::env::temp_dir().join(format!("courier-snapshot-{}.json", uuid::Uuid::new_v4()));
        storage.save_to(&path).await.unwrap();
        let restored = InMemoryStorageManager::load_from(&path, None).await.unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(restored.snapshot(), storage.snapshot());
        let mut tx = restored.begin();
        let rms = restored.rms().retrieve(&mut tx, "client-1").await.unwrap().unwrap();
        assert_eq!(rms.acknowledged.to_string(), "1-4,6");
        tx.commit().unwrap();
    }
}
