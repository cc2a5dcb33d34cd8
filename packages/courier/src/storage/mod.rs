//! Transactional record storage.
//!
//! # Overview
//!
//! All protocol state lives in [`RecordStore`]s reached through a
//! [`StorageManager`]. Every read and write happens inside a
//! [`Transaction`], which takes an advisory lock on each record it touches:
//!
//! - `retrieve`, `insert`, `update` and `delete` lock the record's key, even
//!   when no record exists under it.
//! - `find` locks every match in key order, then re-reads each match and
//!   drops any that changed while it waited.
//! - A second transaction touching a locked record waits until the holder
//!   commits or rolls back, up to the configured lock timeout.
//!
//! # The Contract
//!
//! 1. **Lock keys, not records.** A transaction remembers which keys it
//!    holds. It never hands out references into the store.
//!
//! 2. **Rollback restores.** Backends undo every write of a rolled back
//!    transaction. A transaction dropped without `commit` is rolled back.
//!
//! 3. **One order.** Components enlist record kinds in this order to avoid
//!    waiting on each other in a cycle:
//!
//!    ```text
//!    CreateSequence → Rms → Rmd → Property → Sender → Invoker → Payload
//!    ```
//!
//!    Lock waits are bounded, so a violation costs a retryable
//!    [`StorageError::LockTimeout`], never a hang.
//!
//! # Example
//!
//! ```ignore
//! let mut tx = storage.begin();
//! let Some(mut rms) = storage.rms().retrieve(&mut tx, "client-1").await? else {
//!     return Ok(());
//! };
//! rms.touch(Utc::now());
//! storage.rms().update(&mut tx, rms).await?;
//! tx.commit()?;
//! ```

use std::fmt;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::StorageError;
use crate::records::{
    CreateSequenceRecord, InvokerRecord, RmdRecord, RmsRecord, SenderRecord, SequenceProperty,
    StoredPayload,
};

mod memory;
mod transaction;

pub use memory::{InMemoryStorageManager, InMemoryTable, StorageSnapshot};
pub use transaction::{LockTable, Transaction};

// =============================================================================
// Record Kinds and Lock Keys
// =============================================================================

/// The record tables a storage manager provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    CreateSequence,
    Rms,
    Rmd,
    Property,
    Sender,
    Invoker,
    Payload,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::CreateSequence => "create_sequence",
            RecordKind::Rms => "rms",
            RecordKind::Rmd => "rmd",
            RecordKind::Property => "property",
            RecordKind::Sender => "sender",
            RecordKind::Invoker => "invoker",
            RecordKind::Payload => "payload",
        };
        f.write_str(name)
    }
}

/// Identifies one lockable record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey {
    pub kind: RecordKind,
    pub key: String,
}

impl LockKey {
    pub fn new(kind: RecordKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

// =============================================================================
// Records and Stores
// =============================================================================

/// A storable record with a primary key and a finder predicate.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: RecordKind;

    /// Field-wise query. `None` fields match anything.
    type Finder: Default + Send + Sync;

    fn key(&self) -> String;

    fn matches(&self, finder: &Self::Finder) -> bool;

    fn lock_key(&self) -> LockKey {
        LockKey::new(Self::KIND, self.key())
    }
}

/// Transactional CRUD for one record kind.
#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    /// Insert a new record. Fails with [`StorageError::DuplicateKey`].
    async fn insert(&self, tx: &mut Transaction, record: R) -> Result<(), StorageError>;

    async fn retrieve(&self, tx: &mut Transaction, key: &str) -> Result<Option<R>, StorageError>;

    /// Replace an existing record. Fails with [`StorageError::NotFound`].
    async fn update(&self, tx: &mut Transaction, record: R) -> Result<(), StorageError>;

    /// Remove a record. Returns whether one existed.
    async fn delete(&self, tx: &mut Transaction, key: &str) -> Result<bool, StorageError>;

    /// All records matching `finder`, in key order.
    async fn find(&self, tx: &mut Transaction, finder: &R::Finder) -> Result<Vec<R>, StorageError>;

    /// The single record matching `finder`.
    ///
    /// Fails with [`StorageError::NonUniqueResult`] on more than one match.
    async fn find_unique(
        &self,
        tx: &mut Transaction,
        finder: &R::Finder,
    ) -> Result<Option<R>, StorageError> {
        let mut found = self.find(tx, finder).await?;
        if found.len() > 1 {
            return Err(StorageError::NonUniqueResult {
                kind: R::KIND,
                count: found.len(),
            });
        }
        Ok(found.pop())
    }
}

/// Entry point to a storage backend.
///
/// Passed explicitly to every component as `Arc<dyn StorageManager>`.
pub trait StorageManager: Send + Sync + 'static {
    /// Start a transaction.
    fn begin(&self) -> Transaction;

    fn rms(&self) -> &dyn RecordStore<RmsRecord>;

    fn rmd(&self) -> &dyn RecordStore<RmdRecord>;

    fn senders(&self) -> &dyn RecordStore<SenderRecord>;

    fn invokers(&self) -> &dyn RecordStore<InvokerRecord>;

    fn properties(&self) -> &dyn RecordStore<SequenceProperty>;

    fn create_sequences(&self) -> &dyn RecordStore<CreateSequenceRecord>;

    fn payloads(&self) -> &dyn RecordStore<StoredPayload>;
}
