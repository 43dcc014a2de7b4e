//! The async-call queue: durable, schedule-ordered verb invocations
//! with retry, catch, and backoff semantics.
//!
//! Calls are created by the FSM engine, the pub/sub dispatcher, and
//! cron producers. Workers claim the oldest due call under a 5 second
//! lease, execute the verb, and report the outcome. A failure either
//! schedules a fresh retry row, hands off to the catch verb, or parks
//! the call in a terminal error state.
//!
//! ## Design Principles
//!
//! - **Retries are fresh rows**: a failed attempt is marked `error` and
//!   a new pending row carries the decremented budget. Every attempt
//!   has its own (claimed, completed) pair; a success row was acquired
//!   exactly once.
//! - **Completion is idempotent**: all completion effects are guarded
//!   by `state == executing`, so redelivering the same outcome is a
//!   no-op.
//! - **Payloads stay encrypted at rest**: requests and responses are
//!   encrypted under the async subkey; decryption happens only at the
//!   claim and load boundaries.

pub mod origin;

use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use ftl_core::{Ref, RetryPolicy};

use crate::crypto::{EncryptedColumn, Encryptor, SubKey};
use crate::error::{Error, Result};
use crate::leases::{LeaseHandle, LeaseKey, Leaser};
use crate::metrics::ControllerMetrics;
use crate::storage::tables::{AsyncCallRow, AsyncCallState};
use crate::storage::{Database, Transaction};

pub use origin::AsyncOrigin;

/// TTL of the lease guarding a claimed call.
pub const ASYNC_CALL_LEASE_TTL: Duration = Duration::from_secs(5);

/// A decrypted view of an async call.
#[derive(Debug, Clone)]
pub struct AsyncCall {
    /// Row id.
    pub id: u64,
    /// Who created the call.
    pub origin: AsyncOrigin,
    /// The verb to invoke.
    pub verb: Ref,
    /// Decrypted request payload.
    pub request: Vec<u8>,
    /// Earliest claim time.
    pub scheduled_at: DateTime<Utc>,
    /// Retries left after this attempt.
    pub remaining_attempts: u32,
    /// Backoff applied to the next retry.
    pub backoff: Duration,
    /// Upper bound on the doubled backoff.
    pub max_backoff: Duration,
    /// Verb invoked once retries are exhausted.
    pub catch_verb: Option<Ref>,
    /// True when this attempt is a catch attempt.
    pub catching: bool,
    /// The error that exhausted retries, set on catch attempts.
    pub original_error: Option<String>,
    /// Request key of the creating request, if any.
    pub parent_request_key: Option<String>,
    /// Opaque distributed-tracing context.
    pub trace_context: Option<serde_json::Value>,
}

/// Parameters for enqueueing a call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Who is creating the call.
    pub origin: AsyncOrigin,
    /// The verb to invoke.
    pub verb: Ref,
    /// Plaintext request payload; encrypted before storage.
    pub request: Vec<u8>,
    /// Earliest claim time; `None` means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Retry parameters.
    pub retry: RetryPolicy,
    /// Request key of the creating request, if any.
    pub parent_request_key: Option<String>,
    /// Opaque distributed-tracing context.
    pub trace_context: Option<serde_json::Value>,
}

impl CallRequest {
    /// A call with the given origin, verb, and payload, scheduled
    /// immediately with no retries.
    #[must_use]
    pub fn new(origin: AsyncOrigin, verb: Ref, request: Vec<u8>) -> Self {
        Self {
            origin,
            verb,
            request,
            scheduled_at: None,
            retry: RetryPolicy::none(),
            parent_request_key: None,
            trace_context: None,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of executing a call's verb.
#[derive(Debug, Clone)]
pub enum CallResult {
    /// The verb returned a response.
    Success(Vec<u8>),
    /// The verb failed with a message.
    Failure(String),
}

/// A claimed call: the decrypted call, the lease guarding it, and the
/// pending-queue depth observed at claim time.
#[derive(Debug)]
pub struct AcquiredCall {
    /// The decrypted call.
    pub call: AsyncCall,
    /// Lease on `/system/async_call/<id>`; heartbeat-renewed until
    /// released.
    pub lease: LeaseHandle,
    /// Pending calls left behind, for executor backpressure.
    pub queue_depth: usize,
}

impl AcquiredCall {
    /// Token cancelled if the call's lease is lost.
    #[must_use]
    pub fn context(&self) -> CancellationToken {
        self.lease.context()
    }
}

/// How a completion settled, for metrics and the return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionOutcome {
    Success,
    Retry,
    Catch,
    TerminalError,
    Replayed,
}

impl CompletionOutcome {
    const fn scheduled_another(self) -> bool {
        matches!(self, Self::Retry | Self::Catch)
    }

    const fn is_final(self) -> bool {
        matches!(self, Self::Success | Self::TerminalError)
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Catch => "catch",
            Self::TerminalError => "error",
            Self::Replayed => "replayed",
        }
    }
}

/// The queue service.
#[derive(Debug, Clone)]
pub struct AsyncCallQueue {
    db: Database,
    encryptor: Arc<Encryptor>,
    leaser: Leaser,
    metrics: ControllerMetrics,
}

impl AsyncCallQueue {
    /// Creates a queue over the given database and encryptor.
    #[must_use]
    pub fn new(db: Database, encryptor: Arc<Encryptor>, leaser: Leaser) -> Self {
        Self {
            db,
            encryptor,
            leaser,
            metrics: ControllerMetrics::new(),
        }
    }

    /// Enqueues a call inside a caller-owned transaction.
    pub fn create_call(&self, tx: &mut Transaction, request: CallRequest) -> Result<u64> {
        let mut encrypted = EncryptedColumn::default();
        self.encryptor
            .encrypt(SubKey::Async, &request.request, &mut encrypted)?;
        self.insert_call(tx, request, encrypted.into_bytes())
    }

    /// Enqueues a call whose payload is already async-subkey ciphertext
    /// (event fan-out copies the stored payload without decrypting).
    pub(crate) fn create_call_encrypted(
        &self,
        tx: &mut Transaction,
        mut request: CallRequest,
    ) -> Result<u64> {
        let payload = std::mem::take(&mut request.request);
        self.insert_call(tx, request, payload)
    }

    fn insert_call(
        &self,
        tx: &mut Transaction,
        request: CallRequest,
        payload: Vec<u8>,
    ) -> Result<u64> {
        let now = Utc::now();
        let id = tx.tables_mut().next_async_call_id();
        let row = AsyncCallRow {
            id,
            origin: request.origin.to_string(),
            verb: request.verb,
            request: payload,
            response: None,
            error: None,
            original_error: None,
            state: AsyncCallState::Pending,
            scheduled_at: request.scheduled_at.unwrap_or(now),
            remaining_attempts: request.retry.count,
            backoff: request.retry.min_backoff,
            max_backoff: request.retry.max_backoff,
            catch_verb: request.retry.catch,
            catching: false,
            parent_request_key: request.parent_request_key,
            trace_context: request.trace_context,
            lease_key: None,
            lease_idempotency_key: None,
            created_at: now,
        };
        tracing::debug!(id, origin = %row.origin, verb = %row.verb, "async call created");
        let tables = tx.tables_mut();
        tables.async_calls.insert(id, row);
        let depth = tables
            .async_calls
            .values()
            .filter(|row| row.state == AsyncCallState::Pending)
            .count();
        self.metrics.record_call_created(request.origin.kind());
        self.metrics.set_queue_depth(depth);
        Ok(id)
    }

    /// Claims the oldest due pending call.
    ///
    /// Creates the call's lease in the claim transaction, decrypts the
    /// request, and marks the row executing. Returns
    /// [`Error::NotFound`] when the queue is idle. A decryption failure
    /// aborts the claim and leaves the row pending for another worker.
    pub async fn acquire(&self) -> Result<AcquiredCall> {
        let mut tx = self.db.begin().await;
        let now = Utc::now();
        let id = tx
            .tables()
            .async_calls
            .values()
            .filter(|row| row.state == AsyncCallState::Pending && row.scheduled_at <= now)
            .min_by_key(|row| (row.scheduled_at, row.id))
            .map(|row| row.id)
            .ok_or_else(|| Error::not_found("async call", "no pending calls due"))?;

        let result = self.claim(&mut tx, id);
        let acquired = tx.commit_or_rollback(result)?;
        self.metrics.record_call_acquired();
        self.metrics.set_queue_depth(acquired.queue_depth);
        Ok(acquired)
    }

    fn claim(&self, tx: &mut Transaction, id: u64) -> Result<AcquiredCall> {
        let row = tx
            .tables()
            .async_calls
            .get(&id)
            .ok_or_else(|| Error::not_found("async call", id.to_string()))?;
        let call = self.call_from_row(row)?;

        let lease_key = LeaseKey::system(["async_call".to_string(), id.to_string()]);
        let metadata = serde_json::json!({
            "verb": call.verb.to_string(),
            "origin": call.origin.to_string(),
        });
        let lease = self
            .leaser
            .acquire_in(tx, lease_key.clone(), ASYNC_CALL_LEASE_TTL, Some(metadata))?;

        let idempotency_key = tx
            .tables()
            .leases
            .get(&lease_key.to_string())
            .map(|row| row.idempotency_key);
        let tables = tx.tables_mut();
        if let Some(row) = tables.async_calls.get_mut(&id) {
            row.state = AsyncCallState::Executing;
            row.lease_key = Some(lease_key.to_string());
            row.lease_idempotency_key = idempotency_key;
        }
        let queue_depth = tables
            .async_calls
            .values()
            .filter(|row| row.state == AsyncCallState::Pending)
            .count();
        tracing::debug!(id, verb = %call.verb, queue_depth, "async call acquired");
        Ok(AcquiredCall {
            call,
            lease,
            queue_depth,
        })
    }

    /// Records the outcome of an executed call.
    ///
    /// Returns whether another call was scheduled (a retry or a catch
    /// attempt). `finalise` runs inside the completion transaction with
    /// the final-result flag, so origin bookkeeping is atomic with the
    /// completion. Replaying a completion for a call that is no longer
    /// executing is a no-op returning `false`.
    pub async fn complete<F>(
        &self,
        call: &AsyncCall,
        result: CallResult,
        finalise: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut Transaction, bool) -> Result<()>,
    {
        let mut tx = self.db.begin().await;
        let outcome = self.complete_in(&mut tx, call, result, finalise);
        let outcome = tx.commit_or_rollback(outcome)?;
        self.metrics.record_call_completed(outcome.label());
        Ok(outcome.scheduled_another())
    }

    fn complete_in<F>(
        &self,
        tx: &mut Transaction,
        call: &AsyncCall,
        result: CallResult,
        finalise: F,
    ) -> Result<CompletionOutcome>
    where
        F: FnOnce(&mut Transaction, bool) -> Result<()>,
    {
        let state = tx
            .tables()
            .async_calls
            .get(&call.id)
            .ok_or_else(|| Error::not_found("async call", call.id.to_string()))?
            .state;
        if state != AsyncCallState::Executing {
            tracing::debug!(id = call.id, ?state, "completion replayed, ignoring");
            return Ok(CompletionOutcome::Replayed);
        }

        let now = Utc::now();
        let outcome = match result {
            CallResult::Success(response) => {
                let mut encrypted = EncryptedColumn::default();
                self.encryptor
                    .encrypt(SubKey::Async, &response, &mut encrypted)?;
                let tables = tx.tables_mut();
                if let Some(row) = tables.async_calls.get_mut(&call.id) {
                    row.state = AsyncCallState::Success;
                    row.response = Some(encrypted.into_bytes());
                    row.lease_key = None;
                    row.lease_idempotency_key = None;
                }
                CompletionOutcome::Success
            }
            CallResult::Failure(message) => self.fail(tx, call.id, &message, now)?,
        };

        finalise(tx, outcome.is_final())?;
        tracing::debug!(id = call.id, outcome = outcome.label(), "async call completed");
        Ok(outcome)
    }

    /// Marks the attempt failed and schedules the follow-up row, if any.
    fn fail(
        &self,
        tx: &mut Transaction,
        id: u64,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<CompletionOutcome> {
        let tables = tx.tables_mut();
        let row = tables
            .async_calls
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("async call", id.to_string()))?;
        row.state = AsyncCallState::Error;
        row.error = Some(message.to_string());
        row.lease_key = None;
        row.lease_idempotency_key = None;
        let failed = row.clone();

        let next = if !failed.catching && failed.remaining_attempts > 0 {
            // The retry waits out the current backoff; the stored
            // backoff doubles up to the cap.
            Some((
                AsyncCallRow {
                    scheduled_at: now + failed.backoff,
                    remaining_attempts: failed.remaining_attempts - 1,
                    backoff: min(failed.backoff * 2, failed.max_backoff),
                    state: AsyncCallState::Pending,
                    error: None,
                    response: None,
                    ..failed.clone()
                },
                CompletionOutcome::Retry,
            ))
        } else if failed.catch_verb.is_some() {
            let (scheduled_at, original_error) = if failed.catching {
                // The catch verb itself failed; try it again after the
                // current backoff, keeping the original error.
                (now + failed.backoff, failed.original_error.clone())
            } else {
                (now, Some(message.to_string()))
            };
            Some((
                AsyncCallRow {
                    scheduled_at,
                    remaining_attempts: 0,
                    catching: true,
                    original_error,
                    state: AsyncCallState::Pending,
                    error: None,
                    response: None,
                    ..failed.clone()
                },
                CompletionOutcome::Catch,
            ))
        } else {
            None
        };

        match next {
            Some((mut next_row, outcome)) => {
                let next_id = tables.next_async_call_id();
                next_row.id = next_id;
                next_row.created_at = now;
                tracing::debug!(
                    id,
                    next_id,
                    outcome = outcome.label(),
                    "scheduled follow-up call"
                );
                tables.async_calls.insert(next_id, next_row);
                Ok(outcome)
            }
            None => Ok(CompletionOutcome::TerminalError),
        }
    }

    /// Loads and decrypts a call by id.
    pub async fn load_call(&self, id: u64) -> Result<AsyncCall> {
        let tx = self.db.begin().await;
        let row = tx
            .tables()
            .async_calls
            .get(&id)
            .ok_or_else(|| Error::not_found("async call", id.to_string()))?;
        self.call_from_row(row)
    }

    /// Returns up to `limit` claimed calls whose lease is gone or past
    /// expiry. Callers fail them back through [`AsyncCallQueue::complete`].
    pub async fn get_zombie_calls(&self, limit: usize) -> Result<Vec<AsyncCall>> {
        let tx = self.db.begin().await;
        let tables = tx.tables();
        let now = Utc::now();
        let mut zombies = Vec::new();
        for row in tables.async_calls.values() {
            if zombies.len() >= limit {
                break;
            }
            if row.state != AsyncCallState::Executing {
                continue;
            }
            let lease_alive = row.lease_key.as_ref().is_some_and(|key| {
                tables.leases.get(key).is_some_and(|lease| {
                    now < lease.expires_at
                        && Some(lease.idempotency_key) == row.lease_idempotency_key
                })
            });
            if !lease_alive {
                zombies.push(self.call_from_row(row)?);
            }
        }
        Ok(zombies)
    }

    fn call_from_row(&self, row: &AsyncCallRow) -> Result<AsyncCall> {
        let request = self
            .encryptor
            .decrypt(SubKey::Async, &EncryptedColumn::from_bytes(row.request.clone()))?;
        Ok(AsyncCall {
            id: row.id,
            origin: row.origin.parse()?,
            verb: row.verb.clone(),
            request,
            scheduled_at: row.scheduled_at,
            remaining_attempts: row.remaining_attempts,
            backoff: row.backoff,
            max_backoff: row.max_backoff,
            catch_verb: row.catch_verb.clone(),
            catching: row.catching,
            original_error: row.original_error.clone(),
            parent_request_key: row.parent_request_key.clone(),
            trace_context: row.trace_context.clone(),
        })
    }
}
