//! Retry and catch parameters for asynchronous work.
//!
//! A retry policy travels with every async call: how many retries remain,
//! the initial and maximum backoff, and an optional catch verb invoked
//! after retries are exhausted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ref_key::Ref;

/// Declarative retry parameters for an async call, FSM state, or
/// subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub count: u32,
    /// Backoff before the first retry.
    pub min_backoff: Duration,
    /// Upper bound on the doubled backoff.
    pub max_backoff: Duration,
    /// Verb invoked once retries are exhausted.
    pub catch: Option<Ref>,
}

impl RetryPolicy {
    /// A policy with no retries and no catch verb.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            count: 0,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            catch: None,
        }
    }

    /// Creates a policy with the given retry count and backoff bounds.
    #[must_use]
    pub const fn new(count: u32, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            count,
            min_backoff,
            max_backoff,
            catch: None,
        }
    }

    /// Sets the catch verb.
    #[must_use]
    pub fn with_catch(mut self, catch: Ref) -> Self {
        self.catch = Some(catch);
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_retries() {
        let p = RetryPolicy::default();
        assert_eq!(p.count, 0);
        assert!(p.catch.is_none());
    }

    #[test]
    fn builder_sets_catch() {
        let p = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(8))
            .with_catch(Ref::new("echo", "onFail"));
        assert_eq!(p.count, 3);
        assert_eq!(p.catch, Some(Ref::new("echo", "onFail")));
    }

    #[test]
    fn serde_round_trips() {
        let p = RetryPolicy::new(2, Duration::from_millis(500), Duration::from_secs(4));
        let json = serde_json::to_string(&p).unwrap();
        let back: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
