//! Heartbeat-renewed exclusive leases over structured keys.
//!
//! A lease grants at-most-one holder ownership of a key until its
//! expiry. A background task renews the lease every `ttl / 2`; if a
//! renewal matches no row the lease was lost to expiry, and a
//! cancellation token derived from the handle fires so the holder can
//! abandon in-progress work.
//!
//! ## Design Principles
//!
//! - **Conditional renewal**: heartbeats update the row only when both
//!   the key and the idempotency key match, so a lease re-acquired by
//!   another holder after expiry is never extended by the old one.
//! - **Expiry is garbage collection**: [`Leaser::expire_leases`] deletes
//!   rows past expiry; nothing else ever removes a lease it does not
//!   hold.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use ftl_core::is_identifier;

use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use crate::storage::tables::LeaseRow;
use crate::storage::{Database, Transaction};

/// Minimum lease TTL accepted by [`Leaser::acquire`].
pub const MIN_LEASE_TTL: Duration = Duration::from_secs(5);

/// A structured lease key.
///
/// The first segment distinguishes the system namespace from
/// module-scoped keys; the path form is `/system/a/b` or
/// `/module/<module>/a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeaseKey {
    /// A controller-owned key, e.g. `/system/async_call/42`.
    System(Vec<String>),
    /// A module-scoped key, e.g. `/module/echo/lock`.
    Module {
        /// The owning module.
        module: String,
        /// Trailing path segments.
        path: Vec<String>,
    },
}

impl LeaseKey {
    /// Builds a system-namespace key from path segments.
    #[must_use]
    pub fn system<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::System(segments.into_iter().map(Into::into).collect())
    }

    /// Builds a module-scoped key.
    #[must_use]
    pub fn module<I, S>(module: impl Into<String>, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Module {
            module: module.into(),
            path: segments.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System(path) => {
                write!(f, "/system")?;
                for segment in path {
                    write!(f, "/{segment}")?;
                }
                Ok(())
            }
            Self::Module { module, path } => {
                write!(f, "/module/{module}")?;
                for segment in path {
                    write!(f, "/{segment}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for LeaseKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        if parts.next() != Some("") {
            return Err(Error::invalid_argument(format!(
                "lease key must start with '/': {s}"
            )));
        }
        let segments: Vec<&str> = parts.collect();
        if segments.iter().any(|p| p.is_empty()) {
            return Err(Error::invalid_argument(format!(
                "lease key has an empty segment: {s}"
            )));
        }
        match segments.split_first() {
            Some((&"system", rest)) if !rest.is_empty() => {
                Ok(Self::system(rest.iter().copied()))
            }
            Some((&"module", rest)) => match rest.split_first() {
                Some((module, path)) if is_identifier(module) && !path.is_empty() => {
                    Ok(Self::module(*module, path.iter().copied()))
                }
                _ => Err(Error::invalid_argument(format!(
                    "malformed module lease key: {s}"
                ))),
            },
            _ => Err(Error::invalid_argument(format!(
                "lease key namespace must be system or module: {s}"
            ))),
        }
    }
}

/// Grants and renews leases backed by the `leases` table.
#[derive(Debug, Clone)]
pub struct Leaser {
    db: Database,
    metrics: ControllerMetrics,
    leak: bool,
}

impl Leaser {
    /// Creates a leaser over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            metrics: ControllerMetrics::new(),
            leak: false,
        }
    }

    /// Test mode: handles from this leaser never delete their row on
    /// release, so expiry can be exercised.
    #[must_use]
    pub fn leaking(mut self) -> Self {
        self.leak = true;
        self
    }

    /// Acquires a lease in its own transaction.
    ///
    /// Fails with [`Error::InvalidArgument`] when `ttl` is below
    /// [`MIN_LEASE_TTL`], and with [`Error::LeaseHeld`] when another
    /// holder has a non-expired lease on `key`.
    pub async fn acquire(
        &self,
        key: LeaseKey,
        ttl: Duration,
        metadata: Option<serde_json::Value>,
    ) -> Result<LeaseHandle> {
        let mut tx = self.db.begin().await;
        let result = self.acquire_in(&mut tx, key, ttl, metadata);
        tx.commit_or_rollback(result)
    }

    /// Acquires a lease inside a caller-owned transaction.
    ///
    /// The heartbeat task starts immediately but renews in its own
    /// short transactions, so it only observes the row once the caller
    /// commits.
    pub fn acquire_in(
        &self,
        tx: &mut Transaction,
        key: LeaseKey,
        ttl: Duration,
        metadata: Option<serde_json::Value>,
    ) -> Result<LeaseHandle> {
        if ttl < MIN_LEASE_TTL {
            return Err(Error::invalid_argument(format!(
                "lease TTL must be at least {MIN_LEASE_TTL:?}, got {ttl:?}"
            )));
        }
        let key_text = key.to_string();
        let now = Utc::now();
        if let Some(existing) = tx.tables().leases.get(&key_text) {
            if now < existing.expires_at {
                return Err(Error::LeaseHeld { key: key_text });
            }
        }
        let idempotency_key = Ulid::new();
        tx.tables_mut().leases.insert(
            key_text.clone(),
            LeaseRow {
                key: key_text.clone(),
                idempotency_key,
                expires_at: now + ttl,
                metadata,
                created_at: now,
            },
        );
        self.metrics.record_lease_acquired();
        tracing::debug!(key = %key_text, ?ttl, "lease acquired");

        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let task = tokio::spawn(heartbeat_loop(
            self.db.clone(),
            key_text.clone(),
            idempotency_key,
            ttl,
            stop.clone(),
            lost.clone(),
        ));
        Ok(LeaseHandle {
            key,
            key_text,
            idempotency_key,
            db: self.db.clone(),
            leak: self.leak,
            stop,
            lost,
            task: Some(task),
        })
    }

    /// Deletes every lease past its expiry and logs the count.
    pub async fn expire_leases(&self) -> Result<usize> {
        let mut tx = self.db.begin().await;
        let now = Utc::now();
        let leases = &mut tx.tables_mut().leases;
        let before = leases.len();
        leases.retain(|_, row| row.expires_at >= now);
        let expired = before - leases.len();
        tx.commit()?;
        if expired > 0 {
            self.metrics.record_leases_expired(expired);
            tracing::info!(count = expired, "expired leases");
        }
        Ok(expired)
    }

    /// Returns the expiry and metadata of a held lease.
    pub async fn get_lease_info(
        &self,
        key: &LeaseKey,
    ) -> Result<(chrono::DateTime<Utc>, Option<serde_json::Value>)> {
        let tx = self.db.begin().await;
        let row = tx
            .tables()
            .leases
            .get(&key.to_string())
            .ok_or_else(|| Error::not_found("lease", key.to_string()))?;
        Ok((row.expires_at, row.metadata.clone()))
    }
}

/// Ownership of a held lease.
///
/// Dropping the handle without [`LeaseHandle::release`] stops the
/// heartbeat but leaves the row to expire on its own.
#[derive(Debug)]
pub struct LeaseHandle {
    key: LeaseKey,
    key_text: String,
    idempotency_key: Ulid,
    db: Database,
    leak: bool,
    stop: CancellationToken,
    lost: CancellationToken,
    task: Option<JoinHandle<Option<Error>>>,
}

impl LeaseHandle {
    /// The lease key.
    #[must_use]
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    /// A token cancelled when the lease is lost. Holders must treat
    /// in-progress side effects as best-effort once it fires.
    #[must_use]
    pub fn context(&self) -> CancellationToken {
        self.lost.child_token()
    }

    /// Stops the heartbeat, deletes the row, and returns any error the
    /// heartbeat loop parked.
    pub async fn release(mut self) -> Result<()> {
        self.stop.cancel();
        let parked = match self.task.take() {
            Some(task) => task
                .await
                .map_err(|err| Error::transient_with_source("lease heartbeat task panicked", err))?,
            None => None,
        };
        if !self.leak {
            let mut tx = self.db.begin().await;
            let removed = match tx.tables().leases.get(&self.key_text) {
                Some(row) if row.idempotency_key == self.idempotency_key => {
                    tx.tables_mut().leases.remove(&self.key_text);
                    true
                }
                _ => false,
            };
            tx.commit()?;
            tracing::debug!(key = %self.key_text, removed, "lease released");
        }
        match parked {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        // An unreleased handle must not keep renewing the row; the
        // lease is left to expire on its own.
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Renews the lease every `ttl / 2` until stopped or lost.
#[tracing::instrument(skip_all, fields(key = %key))]
async fn heartbeat_loop(
    db: Database,
    key: String,
    idempotency_key: Ulid,
    ttl: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
) -> Option<Error> {
    let period = ttl / 2;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            () = stop.cancelled() => return None,
            _ = ticker.tick() => {}
        }
        let mut tx = db.begin().await;
        let renewed = match tx.tables_mut().leases.get_mut(&key) {
            Some(row) if row.idempotency_key == idempotency_key => {
                row.expires_at = Utc::now() + ttl;
                true
            }
            _ => false,
        };
        if renewed {
            if let Err(err) = tx.commit() {
                lost.cancel();
                return Some(err);
            }
            tracing::trace!("lease renewed");
        } else {
            drop(tx);
            tracing::warn!("lease lost, cancelling holder context");
            lost.cancel();
            return Some(Error::conflict("lease", format!("lease lost: {key}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_round_trips() {
        for text in ["/system/async_call/42", "/module/echo/lock/a"] {
            let key: LeaseKey = text.parse().unwrap();
            assert_eq!(key.to_string(), text);
        }
    }

    #[test]
    fn key_rejects_malformed_input() {
        for text in ["system/a", "/other/a", "/system", "/module", "/module/echo", "/system//a"] {
            assert!(text.parse::<LeaseKey>().is_err(), "{text} should not parse");
        }
    }

    #[tokio::test]
    async fn short_ttl_is_rejected() {
        let leaser = Leaser::new(Database::new());
        let err = leaser
            .acquire(LeaseKey::system(["a"]), Duration::from_millis(4999), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn second_acquire_conflicts() {
        let leaser = Leaser::new(Database::new());
        let key = LeaseKey::system(["a"]);
        let handle = leaser
            .acquire(key.clone(), MIN_LEASE_TTL, None)
            .await
            .unwrap();
        let err = leaser
            .acquire(key, MIN_LEASE_TTL, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseHeld { .. }));
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_frees_the_key() {
        let leaser = Leaser::new(Database::new());
        let key = LeaseKey::system(["a"]);
        let handle = leaser
            .acquire(key.clone(), MIN_LEASE_TTL, None)
            .await
            .unwrap();
        handle.release().await.unwrap();
        let handle = leaser.acquire(key, MIN_LEASE_TTL, None).await.unwrap();
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn lease_info_returns_metadata() {
        let leaser = Leaser::new(Database::new());
        let key = LeaseKey::module("echo", ["lock"]);
        let handle = leaser
            .acquire(
                key.clone(),
                MIN_LEASE_TTL,
                Some(serde_json::json!({"holder": "worker-1"})),
            )
            .await
            .unwrap();
        let (expires_at, metadata) = leaser.get_lease_info(&key).await.unwrap();
        assert!(expires_at > Utc::now());
        assert_eq!(metadata, Some(serde_json::json!({"holder": "worker-1"})));
        handle.release().await.unwrap();
    }
}
