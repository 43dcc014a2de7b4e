//! Observability metrics for the execution core.
//!
//! Exposed via the `metrics` crate facade; install any compatible
//! recorder (e.g. a Prometheus exporter) in the hosting binary.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `ftl_async_calls_created_total` | Counter | `origin` | Async calls enqueued |
//! | `ftl_async_calls_acquired_total` | Counter | - | Async calls claimed by workers |
//! | `ftl_async_calls_completed_total` | Counter | `outcome` | Async-call completions by outcome |
//! | `ftl_async_call_queue_depth` | Gauge | - | Pending calls observed at claim time |
//! | `ftl_leases_acquired_total` | Counter | - | Leases granted |
//! | `ftl_leases_expired_total` | Counter | - | Leases reaped past expiry |
//! | `ftl_topic_events_published_total` | Counter | `topic` | Topic events published |
//! | `ftl_topic_events_consumed_total` | Counter | `subscription` | Topic events fully consumed |
//! | `ftl_fsm_transitions_total` | Counter | `fsm`, `outcome` | FSM transition starts and finishes |
//! | `ftl_deployment_poll_duration_seconds` | Histogram | - | Deployment watcher poll time |

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Async calls enqueued.
    pub const ASYNC_CALLS_CREATED_TOTAL: &str = "ftl_async_calls_created_total";
    /// Counter: Async calls claimed by workers.
    pub const ASYNC_CALLS_ACQUIRED_TOTAL: &str = "ftl_async_calls_acquired_total";
    /// Counter: Async-call completions by outcome.
    pub const ASYNC_CALLS_COMPLETED_TOTAL: &str = "ftl_async_calls_completed_total";
    /// Gauge: Pending calls observed at claim time.
    pub const ASYNC_CALL_QUEUE_DEPTH: &str = "ftl_async_call_queue_depth";
    /// Counter: Leases granted.
    pub const LEASES_ACQUIRED_TOTAL: &str = "ftl_leases_acquired_total";
    /// Counter: Leases reaped past expiry.
    pub const LEASES_EXPIRED_TOTAL: &str = "ftl_leases_expired_total";
    /// Counter: Topic events published.
    pub const TOPIC_EVENTS_PUBLISHED_TOTAL: &str = "ftl_topic_events_published_total";
    /// Counter: Topic events fully consumed.
    pub const TOPIC_EVENTS_CONSUMED_TOTAL: &str = "ftl_topic_events_consumed_total";
    /// Counter: FSM transition starts and finishes.
    pub const FSM_TRANSITIONS_TOTAL: &str = "ftl_fsm_transitions_total";
    /// Histogram: Deployment watcher poll time in seconds.
    pub const DEPLOYMENT_POLL_DURATION_SECONDS: &str = "ftl_deployment_poll_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Origin kind of an async call (cron, fsm, sub).
    pub const ORIGIN: &str = "origin";
    /// Completion outcome (success, retry, catch, error).
    pub const OUTCOME: &str = "outcome";
    /// Topic reference.
    pub const TOPIC: &str = "topic";
    /// Subscription reference.
    pub const SUBSCRIPTION: &str = "subscription";
    /// FSM reference.
    pub const FSM: &str = "fsm";
}

/// High-level interface for recording execution-core metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct ControllerMetrics;

impl ControllerMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records an async call being enqueued.
    pub fn record_call_created(&self, origin_kind: &str) {
        counter!(
            names::ASYNC_CALLS_CREATED_TOTAL,
            labels::ORIGIN => origin_kind.to_string(),
        )
        .increment(1);
    }

    /// Records an async call being claimed.
    pub fn record_call_acquired(&self) {
        counter!(names::ASYNC_CALLS_ACQUIRED_TOTAL).increment(1);
    }

    /// Records an async-call completion outcome.
    pub fn record_call_completed(&self, outcome: &str) {
        counter!(
            names::ASYNC_CALLS_COMPLETED_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Updates the queue-depth gauge observed at claim time.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!(names::ASYNC_CALL_QUEUE_DEPTH).set(depth as f64);
    }

    /// Records a granted lease.
    pub fn record_lease_acquired(&self) {
        counter!(names::LEASES_ACQUIRED_TOTAL).increment(1);
    }

    /// Records leases reaped past expiry.
    pub fn record_leases_expired(&self, count: usize) {
        counter!(names::LEASES_EXPIRED_TOTAL).increment(count as u64);
    }

    /// Records a published topic event.
    pub fn record_event_published(&self, topic: &str) {
        counter!(
            names::TOPIC_EVENTS_PUBLISHED_TOTAL,
            labels::TOPIC => topic.to_string(),
        )
        .increment(1);
    }

    /// Records a fully consumed topic event.
    pub fn record_event_consumed(&self, subscription: &str) {
        counter!(
            names::TOPIC_EVENTS_CONSUMED_TOTAL,
            labels::SUBSCRIPTION => subscription.to_string(),
        )
        .increment(1);
    }

    /// Records an FSM transition outcome.
    pub fn record_fsm_transition(&self, fsm: &str, outcome: &str) {
        counter!(
            names::FSM_TRANSITIONS_TOTAL,
            labels::FSM => fsm.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records a deployment watcher poll duration.
    pub fn observe_deployment_poll(&self, duration: Duration) {
        histogram!(names::DEPLOYMENT_POLL_DURATION_SECONDS).record(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_does_not_panic() {
        let metrics = ControllerMetrics::new();
        metrics.record_call_created("fsm");
        metrics.record_call_acquired();
        metrics.record_call_completed("success");
        metrics.set_queue_depth(3);
        metrics.record_lease_acquired();
        metrics.record_leases_expired(2);
        metrics.record_event_published("echo.events");
        metrics.record_event_consumed("echo.sub");
        metrics.record_fsm_transition("echo.door", "started");
        metrics.observe_deployment_poll(Duration::from_millis(12));
    }
}
