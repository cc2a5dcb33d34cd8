use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::LockKey;
use crate::error::StorageError;

// =============================================================================
// Lock Table
// =============================================================================

/// Advisory per-record locks shared by all transactions of one backend.
///
/// Waiters park on a single [`Notify`] and recheck ownership after every
/// release. They register interest before checking, so a release between
/// the check and the wait is never missed.
#[derive(Default)]
pub struct LockTable {
    owners: Mutex<HashMap<LockKey, Uuid>>,
    released: Notify,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `key` for `owner`, waiting up to `timeout` (forever if `None`).
    ///
    /// Re-acquiring a key the owner already holds succeeds immediately.
    pub async fn acquire(
        &self,
        key: &LockKey,
        owner: Uuid,
        timeout: Option<Duration>,
    ) -> Result<(), StorageError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
                match owners.get(key) {
                    None => {
                        owners.insert(key.clone(), owner);
                        return Ok(());
                    }
                    Some(holder) if *holder == owner => return Ok(()),
                    Some(_) => {}
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(StorageError::LockTimeout {
                            lock: key.clone(),
                            waited: started.elapsed(),
                        });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release every key in `keys` held by `owner` and wake all waiters.
    pub fn release_all<'a>(&self, owner: Uuid, keys: impl IntoIterator<Item = &'a LockKey>) {
        {
            let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
            for key in keys {
                if owners.get(key) == Some(&owner) {
                    owners.remove(key);
                }
            }
        }
        self.released.notify_waiters();
    }

    /// The transaction currently holding `key`.
    pub fn holder(&self, key: &LockKey) -> Option<Uuid> {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Number of keys currently locked.
    pub fn locked_count(&self) -> usize {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("locked", &self.locked_count())
            .finish()
    }
}

// =============================================================================
// Transaction
// =============================================================================

type UndoAction = Box<dyn FnOnce() + Send>;

/// A unit of work over the record stores.
///
/// Holds the keys it has enlisted and, for backends that write in place, the
/// undo actions that restore their before-images. Dropping an unfinished
/// transaction rolls it back.
pub struct Transaction {
    id: Uuid,
    locks: Arc<LockTable>,
    held: BTreeSet<LockKey>,
    undo: Vec<UndoAction>,
    lock_timeout: Option<Duration>,
    finished: bool,
}

impl Transaction {
    pub fn new(locks: Arc<LockTable>, lock_timeout: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4(),
            locks,
            held: BTreeSet::new(),
            undo: Vec::new(),
            lock_timeout,
            finished: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_active(&self) -> bool {
        !self.finished
    }

    /// Whether this transaction holds the lock on `key`.
    pub fn holds(&self, key: &LockKey) -> bool {
        self.held.contains(key)
    }

    /// Lock `key` for the rest of the transaction.
    pub async fn enlist(&mut self, key: LockKey) -> Result<(), StorageError> {
        if self.finished {
            return Err(StorageError::TransactionFinished(self.id));
        }
        if self.held.contains(&key) {
            return Ok(());
        }
        self.locks.acquire(&key, self.id, self.lock_timeout).await?;
        self.held.insert(key);
        Ok(())
    }

    /// Register an action that reverts a write on rollback.
    pub fn on_rollback(&mut self, undo: impl FnOnce() + Send + 'static) {
        self.undo.push(Box::new(undo));
    }

    /// Make every write permanent and release all locks.
    pub fn commit(mut self) -> Result<(), StorageError> {
        if self.finished {
            return Err(StorageError::TransactionFinished(self.id));
        }
        self.undo.clear();
        self.finish();
        Ok(())
    }

    /// Revert every write and release all locks.
    pub fn rollback(mut self) {
        self.revert();
    }

    /// Commit on `Ok`, roll back on `Err`, and pass the result through.
    pub fn complete<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        match result {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    fn revert(&mut self) {
        if self.finished {
            return;
        }
        let count = self.undo.len();
        while let Some(undo) = self.undo.pop() {
            undo();
        }
        if count > 0 {
            debug!(tx = %self.id, writes = count, "transaction rolled back");
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.finished = true;
        let held = std::mem::take(&mut self.held);
        self.locks.release_all(self.id, held.iter());
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            if !self.undo.is_empty() {
                warn!(tx = %self.id, writes = self.undo.len(), "transaction dropped without commit, rolling back");
            }
            self.revert();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("held", &self.held.len())
            .field("pending_undo", &self.undo.len())
            .field("finished", &self.finished)
            .finish()
    }
}
