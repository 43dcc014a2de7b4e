//! Controller configuration.
//!
//! Everything has a working default; deployments override via `FTL_*`
//! environment variables. The one setting without a default is
//! encryption: leaving `FTL_KMS_URI` unset runs the controller with
//! encryption disabled, which is only appropriate for local
//! development.

use std::time::Duration;

use crate::error::{Error, Result};

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// KMS master key URI, e.g. `fake-kms://<base64 key>`. `None`
    /// disables column encryption.
    pub kms_uri: Option<String>,
    /// Safety delay before a published topic event becomes consumable.
    pub event_consumption_delay: Duration,
    /// Deployment watcher poll interval.
    pub deployment_poll_interval: Duration,
    /// How many zombie calls one reap pass fails back.
    pub zombie_batch_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kms_uri: None,
            event_consumption_delay: Duration::from_millis(200),
            deployment_poll_interval: Duration::from_millis(500),
            zombie_batch_limit: 20,
        }
    }
}

impl ControllerConfig {
    /// Loads settings from `FTL_*` environment variables, defaulting
    /// anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            kms_uri: optional_env("FTL_KMS_URI"),
            event_consumption_delay: duration_ms_env(
                "FTL_EVENT_CONSUMPTION_DELAY_MS",
                defaults.event_consumption_delay,
            )?,
            deployment_poll_interval: duration_ms_env(
                "FTL_DEPLOYMENT_POLL_INTERVAL_MS",
                defaults.deployment_poll_interval,
            )?,
            zombie_batch_limit: usize_env("FTL_ZOMBIE_BATCH_LIMIT", defaults.zombie_batch_limit)?,
        })
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn duration_ms_env(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| Error::invalid_argument(format!("invalid {key}: {value}"))),
        Err(_) => Ok(default),
    }
}

fn usize_env(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<usize>()
            .map_err(|_| Error::invalid_argument(format!("invalid {key}: {value}"))),
        Err(_) => Ok(default),
    }
}
