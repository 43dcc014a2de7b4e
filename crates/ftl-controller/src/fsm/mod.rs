//! The durable finite-state-machine engine.
//!
//! An FSM schema declares start states and legal `(from, to)`
//! transitions between sink verbs. Each transition of an instance is
//! driven by exactly one async call; the unique in-flight marker on the
//! instance row enforces single-flight, so concurrent events for one
//! instance serialise into one winner and `Conflict` for the rest.
//!
//! A state verb may buffer its own successor through the one-slot
//! next-event table; the completion finaliser pops it and feeds it back
//! into [`FsmEngine::start_transition`] atomically with the completion.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use ftl_core::{Ref, RetryPolicy};

use crate::asyncqueue::{AsyncCall, AsyncCallQueue, AsyncOrigin, CallRequest};
use crate::crypto::{EncryptedColumn, Encryptor, SubKey};
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use crate::storage::tables::{FsmInstanceRow, FsmNextEventRow, FsmStatus};
use crate::storage::{Database, Transaction};

/// Fixed error message for a second inline next-event request.
const ALREADY_PENDING_EVENT: &str = "FSM instance already has a pending event";

/// Declared shape of a state machine.
#[derive(Debug, Clone)]
pub struct FsmSchema {
    /// The FSM reference.
    pub name: Ref,
    /// States a new instance may enter first.
    pub start: Vec<Ref>,
    /// Legal `(from, to)` transitions.
    pub transitions: Vec<(Ref, Ref)>,
    /// FSM-level retry policy.
    pub retry: RetryPolicy,
    /// Per-destination-state overrides of the FSM-level policy.
    pub state_retry: HashMap<Ref, RetryPolicy>,
}

impl FsmSchema {
    /// Creates a schema with no retries and no overrides.
    #[must_use]
    pub fn new(name: Ref, start: Vec<Ref>, transitions: Vec<(Ref, Ref)>) -> Self {
        Self {
            name,
            start,
            transitions,
            retry: RetryPolicy::none(),
            state_retry: HashMap::new(),
        }
    }

    /// Sets the FSM-level retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the retry policy for one destination state.
    #[must_use]
    pub fn with_state_retry(mut self, state: Ref, retry: RetryPolicy) -> Self {
        self.state_retry.insert(state, retry);
        self
    }

    /// True when `state` is a declared start state.
    #[must_use]
    pub fn is_start(&self, state: &Ref) -> bool {
        self.start.contains(state)
    }

    /// True when `(from, to)` is a declared transition.
    #[must_use]
    pub fn allows(&self, from: &Ref, to: &Ref) -> bool {
        self.transitions.iter().any(|(f, t)| f == from && t == to)
    }

    /// A terminal state has no outgoing transitions.
    #[must_use]
    pub fn is_terminal(&self, state: &Ref) -> bool {
        !self.transitions.iter().any(|(from, _)| from == state)
    }

    /// The effective retry policy for a destination state.
    #[must_use]
    pub fn policy_for(&self, state: &Ref) -> RetryPolicy {
        self.state_retry.get(state).cloned().unwrap_or_else(|| self.retry.clone())
    }
}

/// Drives FSM instances over the async-call queue.
#[derive(Debug, Clone)]
pub struct FsmEngine {
    db: Database,
    queue: AsyncCallQueue,
    encryptor: Arc<Encryptor>,
    metrics: ControllerMetrics,
    schemas: Arc<RwLock<HashMap<Ref, FsmSchema>>>,
}

impl FsmEngine {
    /// Creates an engine over the given database and queue.
    #[must_use]
    pub fn new(db: Database, queue: AsyncCallQueue, encryptor: Arc<Encryptor>) -> Self {
        Self {
            db,
            queue,
            encryptor,
            metrics: ControllerMetrics::new(),
            schemas: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers or replaces a schema.
    pub fn register(&self, schema: FsmSchema) {
        if let Ok(mut schemas) = self.schemas.write() {
            schemas.insert(schema.name.clone(), schema);
        }
    }

    /// Looks up a registered schema.
    pub fn schema_for(&self, fsm: &Ref) -> Result<FsmSchema> {
        self.schemas
            .read()
            .ok()
            .and_then(|schemas| schemas.get(fsm).cloned())
            .ok_or_else(|| Error::not_found("fsm", fsm.to_string()))
    }

    /// Sends an event to an instance, creating it on first contact.
    ///
    /// Enqueues one async call for the transition and installs the
    /// in-flight marker. Fails with [`Error::InvalidArgument`] for an
    /// illegal transition, [`Error::Terminated`] for a finished
    /// instance, and [`Error::Conflict`] when a transition is already
    /// in flight.
    pub async fn start_transition(
        &self,
        fsm: &Ref,
        instance: &str,
        destination: &Ref,
        request: &[u8],
    ) -> Result<u64> {
        let mut tx = self.db.begin().await;
        let result = self.start_transition_in(&mut tx, fsm, instance, destination, request);
        tx.commit_or_rollback(result)
    }

    /// Transaction-sharing variant of [`FsmEngine::start_transition`].
    pub fn start_transition_in(
        &self,
        tx: &mut Transaction,
        fsm: &Ref,
        instance: &str,
        destination: &Ref,
        request: &[u8],
    ) -> Result<u64> {
        let schema = self.schema_for(fsm)?;
        let key = (fsm.clone(), instance.to_string());
        let now = Utc::now();

        match tx.tables().fsm_instances.get(&key) {
            None => {
                if !schema.is_start(destination) {
                    return Err(Error::invalid_argument(format!(
                        "{destination} is not a start state of {fsm}"
                    )));
                }
                tx.tables_mut().fsm_instances.insert(
                    key.clone(),
                    FsmInstanceRow {
                        fsm: fsm.clone(),
                        key: instance.to_string(),
                        status: FsmStatus::Running,
                        current_state: None,
                        destination_state: None,
                        async_call_id: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                tracing::debug!(%fsm, instance, "fsm instance created");
            }
            Some(row) => {
                if row.status.is_terminal() {
                    return Err(Error::Terminated {
                        fsm: fsm.clone(),
                        instance: instance.to_string(),
                    });
                }
                if row.async_call_id.is_some() {
                    return Err(Error::conflict(
                        "fsm instance",
                        format!("transition already executing for {fsm}:{instance}"),
                    ));
                }
                let legal = row
                    .current_state
                    .as_ref()
                    .is_some_and(|current| schema.allows(current, destination));
                if !legal {
                    return Err(Error::invalid_argument(format!(
                        "illegal transition to {destination} for {fsm}:{instance}"
                    )));
                }
            }
        }

        let call_id = self.queue.create_call(
            tx,
            CallRequest::new(
                AsyncOrigin::Fsm {
                    fsm: fsm.clone(),
                    key: instance.to_string(),
                },
                destination.clone(),
                request.to_vec(),
            )
            .with_retry(schema.policy_for(destination)),
        )?;

        let tables = tx.tables_mut();
        if let Some(row) = tables.fsm_instances.get_mut(&key) {
            row.destination_state = Some(destination.clone());
            row.async_call_id = Some(call_id);
            row.updated_at = now;
        }
        self.metrics
            .record_fsm_transition(&fsm.to_string(), "started");
        tracing::debug!(%fsm, instance, %destination, call_id, "fsm transition started");
        Ok(call_id)
    }

    /// Marks the in-flight transition finished: the destination becomes
    /// the current state and the in-flight marker clears.
    pub fn finish_transition(&self, tx: &mut Transaction, fsm: &Ref, instance: &str) -> Result<()> {
        let key = (fsm.clone(), instance.to_string());
        let tables = tx.tables_mut();
        let row = tables
            .fsm_instances
            .get_mut(&key)
            .ok_or_else(|| Error::not_found("fsm instance", format!("{fsm}:{instance}")))?;
        row.current_state = row.destination_state.take();
        row.async_call_id = None;
        row.updated_at = Utc::now();
        self.metrics
            .record_fsm_transition(&fsm.to_string(), "finished");
        Ok(())
    }

    /// Moves the instance to the completed terminal status.
    pub fn succeed_instance(&self, tx: &mut Transaction, fsm: &Ref, instance: &str) -> Result<()> {
        self.terminate(tx, fsm, instance, FsmStatus::Completed)
    }

    /// Moves the instance to the failed terminal status.
    pub fn fail_instance(&self, tx: &mut Transaction, fsm: &Ref, instance: &str) -> Result<()> {
        self.terminate(tx, fsm, instance, FsmStatus::Failed)
    }

    fn terminate(
        &self,
        tx: &mut Transaction,
        fsm: &Ref,
        instance: &str,
        status: FsmStatus,
    ) -> Result<()> {
        let key = (fsm.clone(), instance.to_string());
        let tables = tx.tables_mut();
        let row = tables
            .fsm_instances
            .get_mut(&key)
            .ok_or_else(|| Error::not_found("fsm instance", format!("{fsm}:{instance}")))?;
        row.status = status;
        row.destination_state = None;
        row.async_call_id = None;
        row.updated_at = Utc::now();
        // A terminal instance never fires its buffered event.
        tables.fsm_next_events.remove(&key);
        let outcome = match status {
            FsmStatus::Completed => "succeeded",
            _ => "failed",
        };
        self.metrics.record_fsm_transition(&fsm.to_string(), outcome);
        tracing::debug!(%fsm, instance, outcome, "fsm instance terminated");
        Ok(())
    }

    /// The current and destination states of an instance.
    pub async fn get_states(
        &self,
        fsm: &Ref,
        instance: &str,
    ) -> Result<(Option<Ref>, Option<Ref>)> {
        let tx = self.db.begin().await;
        let row = tx
            .tables()
            .fsm_instances
            .get(&(fsm.clone(), instance.to_string()))
            .ok_or_else(|| Error::not_found("fsm instance", format!("{fsm}:{instance}")))?;
        Ok((row.current_state.clone(), row.destination_state.clone()))
    }

    /// Buffers the successor event for a running transition.
    ///
    /// The slot holds one event; a second request fails with a fixed
    /// conflict message.
    pub async fn set_next_event(
        &self,
        fsm: &Ref,
        instance: &str,
        next_state: &Ref,
        request: &[u8],
    ) -> Result<()> {
        let mut tx = self.db.begin().await;
        let result = self.set_next_event_in(&mut tx, fsm, instance, next_state, request);
        tx.commit_or_rollback(result)
    }

    /// Transaction-sharing variant of [`FsmEngine::set_next_event`].
    pub fn set_next_event_in(
        &self,
        tx: &mut Transaction,
        fsm: &Ref,
        instance: &str,
        next_state: &Ref,
        request: &[u8],
    ) -> Result<()> {
        let schema = self.schema_for(fsm)?;
        let key = (fsm.clone(), instance.to_string());
        let row = tx
            .tables()
            .fsm_instances
            .get(&key)
            .ok_or_else(|| Error::not_found("fsm instance", format!("{fsm}:{instance}")))?;
        if row.status.is_terminal() {
            return Err(Error::Terminated {
                fsm: fsm.clone(),
                instance: instance.to_string(),
            });
        }
        // The buffered event fires from the in-flight destination, so
        // it must be a legal transition from there.
        let Some(destination) = row.destination_state.as_ref() else {
            return Err(Error::invalid_argument(format!(
                "no transition in flight for {fsm}:{instance}"
            )));
        };
        if !schema.allows(destination, next_state) {
            return Err(Error::invalid_argument(format!(
                "illegal transition to {next_state} for {fsm}:{instance}"
            )));
        }
        if tx.tables().fsm_next_events.contains_key(&key) {
            return Err(Error::conflict("fsm next event", ALREADY_PENDING_EVENT));
        }
        let mut encrypted = EncryptedColumn::default();
        self.encryptor
            .encrypt(SubKey::Async, request, &mut encrypted)?;
        tx.tables_mut().fsm_next_events.insert(
            key,
            FsmNextEventRow {
                fsm: fsm.clone(),
                instance_key: instance.to_string(),
                next_state: next_state.clone(),
                request: encrypted.into_bytes(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Removes and returns the buffered next event, decrypted.
    pub fn pop_next_event(
        &self,
        tx: &mut Transaction,
        fsm: &Ref,
        instance: &str,
    ) -> Result<Option<(Ref, Vec<u8>)>> {
        let key = (fsm.clone(), instance.to_string());
        let Some(row) = tx.tables_mut().fsm_next_events.remove(&key) else {
            return Ok(None);
        };
        let request = self
            .encryptor
            .decrypt(SubKey::Async, &EncryptedColumn::from_bytes(row.request))?;
        Ok(Some((row.next_state, request)))
    }

    /// Completion finaliser for calls with an FSM origin.
    ///
    /// Runs inside the completing transaction. Intermediate results (a
    /// retry or catch is coming) leave the instance in flight. A final
    /// failure fails the instance. A final success finishes the
    /// transition, then either succeeds the instance (terminal state)
    /// or feeds the buffered next event into the next transition.
    pub fn on_call_completion(
        &self,
        tx: &mut Transaction,
        call: &AsyncCall,
        failed: bool,
        is_final: bool,
    ) -> Result<()> {
        let AsyncOrigin::Fsm { fsm, key } = &call.origin else {
            return Err(Error::invalid_argument(format!(
                "not an fsm origin: {}",
                call.origin
            )));
        };
        if !is_final {
            return Ok(());
        }
        if failed {
            return self.fail_instance(tx, fsm, key);
        }
        self.finish_transition(tx, fsm, key)?;

        let schema = self.schema_for(fsm)?;
        if schema.is_terminal(&call.verb) {
            return self.succeed_instance(tx, fsm, key);
        }
        if let Some((next_state, request)) = self.pop_next_event(tx, fsm, key)? {
            self.start_transition_in(tx, fsm, key, &next_state, &request)?;
        }
        Ok(())
    }
}
