//! Transactional storage for the execution core.
//!
//! An in-memory database with the same transactional contract the durable
//! engine provides: serializable transactions, nestable savepoints named
//! `sp1`, `sp2`, ... and canonical commit-or-rollback cleanup.
//!
//! ## Design Principles
//!
//! - **Serializable isolation**: a transaction holds the single table
//!   mutex for its whole lifetime. This is the in-memory analogue of row
//!   locking with `SKIP LOCKED`; two concurrent claimers never observe
//!   the same pending row.
//! - **Savepoints as snapshots**: nested `begin` pushes a full snapshot;
//!   `rollback` restores the matching one. An outer rollback discards all
//!   inner savepoints.
//! - **Abort on drop**: a transaction dropped without commit rolls back
//!   to its starting snapshot, so a failing operation leaves no partial
//!   writes behind.

pub mod tables;

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};

pub use tables::Tables;

/// Handle to the shared table set. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Database {
    inner: Arc<Mutex<Tables>>,
}

impl Database {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction, waiting for any open transaction to finish.
    pub async fn begin(&self) -> Transaction {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        let base = guard.clone();
        Transaction {
            guard,
            savepoints: vec![base],
        }
    }
}

/// An open transaction over the table set.
///
/// Depth 0 is the transaction itself; each nested [`Transaction::begin`]
/// adds a savepoint level. [`Transaction::commit`] and
/// [`Transaction::rollback`] close the innermost open level.
#[derive(Debug)]
pub struct Transaction {
    guard: OwnedMutexGuard<Tables>,
    savepoints: Vec<Tables>,
}

impl Transaction {
    /// Opens a nested savepoint.
    pub fn begin(&mut self) {
        self.savepoints.push(self.guard.clone());
        tracing::trace!(savepoint = %self.name(), "savepoint opened");
    }

    /// Commits the innermost open level.
    ///
    /// At a savepoint level this releases the savepoint; at depth 0 it
    /// publishes the transaction's writes. Committing an already-closed
    /// transaction is a programming error and surfaces as
    /// [`Error::Transient`].
    pub fn commit(&mut self) -> Result<()> {
        let name = self.name();
        if self.savepoints.pop().is_none() {
            return Err(Error::transient("commit on a closed transaction"));
        }
        tracing::trace!(savepoint = %name, "committed");
        Ok(())
    }

    /// Rolls back the innermost open level, restoring its snapshot.
    pub fn rollback(&mut self) {
        let name = self.name();
        if let Some(snapshot) = self.savepoints.pop() {
            *self.guard = snapshot;
            tracing::trace!(savepoint = %name, "rolled back");
        }
    }

    /// Canonical cleanup: commit on `Ok`, rollback on `Err`.
    ///
    /// A commit failure replaces the success value, mirroring the
    /// deferred commit-or-rollback idiom of the durable engine.
    pub fn commit_or_rollback<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    /// Read access to the tables.
    #[must_use]
    pub fn tables(&self) -> &Tables {
        &self.guard
    }

    /// Write access to the tables.
    pub fn tables_mut(&mut self) -> &mut Tables {
        &mut self.guard
    }

    /// Name of the innermost open level: the transaction at depth 0,
    /// savepoints `sp1`, `sp2`, ... above it.
    fn name(&self) -> String {
        match self.savepoints.len() {
            0 | 1 => "tx".to_string(),
            n => format!("sp{}", n - 1),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Uncommitted levels roll back, outermost snapshot last.
        if let Some(base) = self.savepoints.first().cloned() {
            *self.guard = base;
            tracing::trace!("transaction dropped without commit, rolled back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db_with_marker() -> Database {
        let db = Database::new();
        let mut tx = db.begin().await;
        tx.tables_mut().next_async_call_id();
        tx.commit().unwrap();
        db
    }

    #[tokio::test]
    async fn commit_on_closed_transaction_fails() {
        let db = Database::new();
        let mut tx = db.begin().await;
        tx.commit().unwrap();
        assert!(tx.commit().is_err());
    }

    #[tokio::test]
    async fn commit_publishes_writes() {
        let db = Database::new();
        {
            let mut tx = db.begin().await;
            let id = tx.tables_mut().next_async_call_id();
            assert_eq!(id, 1);
            tx.commit().unwrap();
        }
        let mut tx = db.begin().await;
        assert_eq!(tx.tables_mut().next_async_call_id(), 2);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn drop_without_commit_rolls_back() {
        let db = Database::new();
        {
            let mut tx = db.begin().await;
            tx.tables_mut().next_async_call_id();
            // dropped here without commit
        }
        let mut tx = db.begin().await;
        assert_eq!(tx.tables_mut().next_async_call_id(), 1);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn savepoint_rollback_is_partial() {
        let db = db_with_marker().await;
        let mut tx = db.begin().await;
        assert_eq!(tx.tables_mut().next_async_call_id(), 2);
        tx.begin();
        assert_eq!(tx.tables_mut().next_async_call_id(), 3);
        tx.rollback();
        // The outer write survives the inner rollback.
        assert_eq!(tx.tables_mut().next_async_call_id(), 3);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn outer_rollback_discards_inner_commits() {
        let db = db_with_marker().await;
        {
            let mut tx = db.begin().await;
            tx.begin();
            tx.tables_mut().next_async_call_id();
            tx.commit().unwrap();
            tx.rollback();
        }
        let mut tx = db.begin().await;
        assert_eq!(tx.tables_mut().next_async_call_id(), 2);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn commit_or_rollback_follows_the_result() {
        let db = Database::new();
        {
            let mut tx = db.begin().await;
            tx.tables_mut().next_async_call_id();
            let err: Result<()> = Err(Error::transient("boom"));
            assert!(tx.commit_or_rollback(err).is_err());
        }
        let mut tx = db.begin().await;
        assert_eq!(tx.tables_mut().next_async_call_id(), 1);
        let ok: Result<u32> = Ok(7);
        assert_eq!(tx.commit_or_rollback(ok).unwrap(), 7);
    }
}
