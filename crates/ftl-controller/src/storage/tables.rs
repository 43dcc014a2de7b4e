//! Row types and the in-memory table set.
//!
//! One struct per table, mirroring the durable schema: `async_calls`,
//! `leases`, `fsm_instances`, `fsm_next_events`, `topics`, `topic_events`,
//! `topic_subscriptions`, `topic_subscribers`, `deployments`,
//! `timeline_events`, and the `encryption_keys` singleton. Ordered tables
//! use `BTreeMap` so iteration order is id order.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ulid::Ulid;

use ftl_core::Ref;

/// Execution state of an async call row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncCallState {
    /// Waiting for a worker; eligible once `scheduled_at` has passed.
    Pending,
    /// Claimed by a worker holding the call's lease.
    Executing,
    /// Completed successfully; never resurrected.
    Success,
    /// Completed with a permanent failure, or superseded by a retry row.
    Error,
}

/// A durable unit of asynchronous work.
#[derive(Debug, Clone)]
pub struct AsyncCallRow {
    /// Monotonic row id; claim order among equally-due calls.
    pub id: u64,
    /// Canonical origin text (`cron:...`, `fsm:...`, `sub:...`).
    pub origin: String,
    /// The verb to invoke.
    pub verb: Ref,
    /// Encrypted request payload.
    pub request: Vec<u8>,
    /// Encrypted response payload, set on success.
    pub response: Option<Vec<u8>>,
    /// Failure message, set on error.
    pub error: Option<String>,
    /// The error that exhausted retries, carried into catch attempts.
    pub original_error: Option<String>,
    /// Current execution state.
    pub state: AsyncCallState,
    /// Earliest time a worker may claim the call.
    pub scheduled_at: DateTime<Utc>,
    /// Retries left after this attempt.
    pub remaining_attempts: u32,
    /// Backoff applied to the next retry.
    pub backoff: Duration,
    /// Upper bound on the doubled backoff.
    pub max_backoff: Duration,
    /// Verb invoked once retries are exhausted.
    pub catch_verb: Option<Ref>,
    /// True once the call represents a catch attempt.
    pub catching: bool,
    /// Request key of the request that created the call, if any.
    pub parent_request_key: Option<String>,
    /// Opaque distributed-tracing context.
    pub trace_context: Option<serde_json::Value>,
    /// Lease key held by the claiming worker.
    pub lease_key: Option<String>,
    /// Idempotency key of the claiming lease.
    pub lease_idempotency_key: Option<Ulid>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Exclusive ownership of a structured key.
#[derive(Debug, Clone)]
pub struct LeaseRow {
    /// Path form of the lease key, e.g. `/system/async_call/3`.
    pub key: String,
    /// Generated at acquisition; heartbeats are conditional on it.
    pub idempotency_key: Ulid,
    /// The lease is valid only while `now < expires_at`.
    pub expires_at: DateTime<Utc>,
    /// Caller-supplied metadata.
    pub metadata: Option<serde_json::Value>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of an FSM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmStatus {
    /// Accepting events.
    Running,
    /// Reached a terminal state successfully.
    Completed,
    /// Failed permanently.
    Failed,
}

impl FsmStatus {
    /// Returns true for the two terminal statuses.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One execution of a named state machine.
#[derive(Debug, Clone)]
pub struct FsmInstanceRow {
    /// The state machine definition this instance runs.
    pub fsm: Ref,
    /// User-supplied instance key.
    pub key: String,
    /// Lifecycle status.
    pub status: FsmStatus,
    /// State reached by the last finished transition; `None` before the
    /// first transition finishes.
    pub current_state: Option<Ref>,
    /// Target state of the in-flight transition.
    pub destination_state: Option<Ref>,
    /// Async call driving the in-flight transition. Non-null implies
    /// in-flight; at most one per instance.
    pub async_call_id: Option<u64>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// The one-slot next-event buffer for an FSM instance.
#[derive(Debug, Clone)]
pub struct FsmNextEventRow {
    /// The state machine definition.
    pub fsm: Ref,
    /// The instance key.
    pub instance_key: String,
    /// Destination state of the buffered event.
    pub next_state: Ref,
    /// Encrypted event payload.
    pub request: Vec<u8>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// An append-only event log declared by a module.
#[derive(Debug, Clone)]
pub struct TopicRow {
    /// The topic reference.
    pub topic: Ref,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// One event in a topic's log. Never updated.
#[derive(Debug, Clone)]
pub struct TopicEventRow {
    /// Strictly increasing id within the topic.
    pub id: u64,
    /// The owning topic.
    pub topic: Ref,
    /// Encrypted event payload.
    pub payload: Vec<u8>,
    /// Optional partition key supplied by the publisher.
    pub partition_key: Option<String>,
    /// Row creation time; consumption waits out a small delay past this.
    pub created_at: DateTime<Utc>,
}

/// A named, module-scoped cursor over a topic.
#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    /// The subscription reference (`module.name`).
    pub name: Ref,
    /// The topic this subscription follows.
    pub topic: Ref,
    /// Id of the last event consumed; 0 before any consumption.
    /// Monotonically non-decreasing for the life of the row.
    pub cursor: u64,
    /// Id of the event currently being consumed, if any.
    pub in_flight_event_id: Option<u64>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// One verb registered against a subscription, owned by a deployment.
#[derive(Debug, Clone)]
pub struct SubscriberRow {
    /// Row id.
    pub id: u64,
    /// The subscription this subscriber competes on.
    pub subscription: Ref,
    /// The deployment that registered the subscriber.
    pub deployment_key: String,
    /// The sink verb events are delivered to.
    pub sink: Ref,
    /// Retry parameters applied to delivery calls.
    pub retry: ftl_core::RetryPolicy,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// An immutable versioned bundle of a module.
#[derive(Debug, Clone)]
pub struct DeploymentRow {
    /// Unique deployment key.
    pub key: String,
    /// The module the deployment serves.
    pub module: String,
    /// The module schema, stored as JSON.
    pub schema: serde_json::Value,
    /// SHA-256 over the canonical schema bytes; unique across rows.
    pub schema_hash: [u8; 32],
    /// Desired replica count; the deployment is active while positive.
    pub min_replicas: u32,
    /// Observed runner count reported by the runner collaborator.
    pub runners: u32,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// An audit record of a control-plane action.
#[derive(Debug, Clone)]
pub struct TimelineEventRow {
    /// Monotonic row id.
    pub id: u64,
    /// Event kind discriminator.
    pub kind: String,
    /// Encrypted event payload.
    pub payload: Vec<u8>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// The `encryption_keys` singleton.
#[derive(Debug, Clone)]
pub struct EncryptionKeyRow {
    /// The generated keyset, wrapped under the KMS master key.
    pub wrapped_keyset: Vec<u8>,
    /// Verification ciphertext for the timeline subkey.
    pub verify_timeline: Option<Vec<u8>>,
    /// Verification ciphertext for the async subkey.
    pub verify_async: Option<Vec<u8>>,
    /// Verification ciphertext for the identity subkey.
    pub verify_identity: Option<Vec<u8>>,
}

/// The complete table set. Cloned wholesale to implement savepoints.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    next_async_call_id: u64,
    next_topic_event_id: u64,
    next_subscriber_id: u64,
    next_timeline_event_id: u64,

    /// Async-call queue, keyed by id.
    pub async_calls: BTreeMap<u64, AsyncCallRow>,
    /// Leases, keyed by path-form key. At most one row per key.
    pub leases: HashMap<String, LeaseRow>,
    /// FSM instances, keyed by (fsm, instance key).
    pub fsm_instances: BTreeMap<(Ref, String), FsmInstanceRow>,
    /// Next-event buffers, keyed by (fsm, instance key). One slot each.
    pub fsm_next_events: HashMap<(Ref, String), FsmNextEventRow>,
    /// Topics, keyed by reference.
    pub topics: HashMap<Ref, TopicRow>,
    /// Topic events, keyed by id.
    pub topic_events: BTreeMap<u64, TopicEventRow>,
    /// Subscriptions, keyed by reference.
    pub topic_subscriptions: HashMap<Ref, SubscriptionRow>,
    /// Subscribers, keyed by id.
    pub topic_subscribers: BTreeMap<u64, SubscriberRow>,
    /// Deployments, keyed by deployment key.
    pub deployments: BTreeMap<String, DeploymentRow>,
    /// Timeline events, keyed by id.
    pub timeline_events: BTreeMap<u64, TimelineEventRow>,
    /// The encryption-key singleton, absent until bootstrap.
    pub encryption_key: Option<EncryptionKeyRow>,
}

impl Tables {
    /// Allocates the next async-call id.
    pub fn next_async_call_id(&mut self) -> u64 {
        self.next_async_call_id += 1;
        self.next_async_call_id
    }

    /// Allocates the next topic-event id.
    pub fn next_topic_event_id(&mut self) -> u64 {
        self.next_topic_event_id += 1;
        self.next_topic_event_id
    }

    /// Allocates the next subscriber id.
    pub fn next_subscriber_id(&mut self) -> u64 {
        self.next_subscriber_id += 1;
        self.next_subscriber_id
    }

    /// Allocates the next timeline-event id.
    pub fn next_timeline_event_id(&mut self) -> u64 {
        self.next_timeline_event_id += 1;
        self.next_timeline_event_id
    }
}
