//! The deployment catalog and change watcher.
//!
//! Deployments are immutable versioned bundles of a module; the
//! catalog tracks their desired replica counts and observed runner
//! counts. The watcher polls the catalog and broadcasts change
//! notifications so schedulers and the pub/sub dispatcher can react
//! without their own polling loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::crypto::{EncryptedColumn, Encryptor, SubKey};
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use crate::storage::tables::{DeploymentRow, TimelineEventRow};
use crate::storage::Database;

/// Default catalog poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-subscriber buffer of the notification channel. A subscriber
/// that falls further behind than this loses its oldest notifications
/// and must resynchronise from the catalog.
const NOTIFICATION_BUFFER: usize = 64;

/// A change observed by the watcher.
#[derive(Debug, Clone)]
pub enum DeploymentNotification {
    /// A deployment appeared or its (schema hash, min replicas) pair
    /// changed.
    Changed(DeploymentRow),
    /// A previously active deployment is gone or inactive.
    Deleted(String),
}

/// The catalog service.
#[derive(Debug, Clone)]
pub struct DeploymentCatalog {
    db: Database,
    encryptor: Arc<Encryptor>,
}

impl DeploymentCatalog {
    /// Creates a catalog over the given database.
    #[must_use]
    pub fn new(db: Database, encryptor: Arc<Encryptor>) -> Self {
        Self { db, encryptor }
    }

    /// Registers a deployment. The schema hash is unique across the
    /// catalog; registering the same schema twice is a conflict.
    pub async fn create_deployment(
        &self,
        key: &str,
        module: &str,
        schema: serde_json::Value,
    ) -> Result<()> {
        let schema_bytes = serde_json::to_vec(&schema)?;
        let schema_hash: [u8; 32] = Sha256::digest(&schema_bytes).into();

        let mut tx = self.db.begin().await;
        let result = (|| {
            let tables = tx.tables();
            if tables.deployments.contains_key(key) {
                return Err(Error::conflict("deployment", format!("{key} already exists")));
            }
            if let Some(existing) = tables
                .deployments
                .values()
                .find(|row| row.schema_hash == schema_hash)
            {
                return Err(Error::conflict(
                    "deployment",
                    format!("schema already deployed as {}", existing.key),
                ));
            }
            tx.tables_mut().deployments.insert(
                key.to_string(),
                DeploymentRow {
                    key: key.to_string(),
                    module: module.to_string(),
                    schema,
                    schema_hash,
                    min_replicas: 0,
                    runners: 0,
                    created_at: Utc::now(),
                },
            );
            Ok(())
        })();
        tx.commit_or_rollback(result)?;
        tracing::info!(deployment = key, module, "deployment created");
        Ok(())
    }

    /// Sets the desired replica count and records a timeline event.
    pub async fn set_min_replicas(&self, key: &str, min_replicas: u32) -> Result<()> {
        let mut tx = self.db.begin().await;
        let result = (|| {
            {
                let row = tx
                    .tables_mut()
                    .deployments
                    .get_mut(key)
                    .ok_or_else(|| Error::not_found("deployment", key))?;
                row.min_replicas = min_replicas;
            }
            let payload = serde_json::to_vec(&serde_json::json!({
                "deployment": key,
                "min_replicas": min_replicas,
            }))?;
            let mut encrypted = EncryptedColumn::default();
            self.encryptor
                .encrypt(SubKey::Timeline, &payload, &mut encrypted)?;
            let tables = tx.tables_mut();
            let id = tables.next_timeline_event_id();
            tables.timeline_events.insert(
                id,
                TimelineEventRow {
                    id,
                    kind: "deployment_updated".to_string(),
                    payload: encrypted.into_bytes(),
                    created_at: Utc::now(),
                },
            );
            Ok(())
        })();
        tx.commit_or_rollback(result)?;
        tracing::info!(deployment = key, min_replicas, "deployment replicas updated");
        Ok(())
    }

    /// Records the runner count observed by the runner collaborator.
    pub async fn set_runner_count(&self, key: &str, runners: u32) -> Result<()> {
        let mut tx = self.db.begin().await;
        let result = (|| {
            let row = tx
                .tables_mut()
                .deployments
                .get_mut(key)
                .ok_or_else(|| Error::not_found("deployment", key))?;
            row.runners = runners;
            Ok(())
        })();
        tx.commit_or_rollback(result)
    }

    /// Deployments with a positive desired replica count.
    pub async fn get_active_deployments(&self) -> Result<Vec<DeploymentRow>> {
        let tx = self.db.begin().await;
        Ok(tx
            .tables()
            .deployments
            .values()
            .filter(|row| row.min_replicas > 0)
            .cloned()
            .collect())
    }
}

/// Polls the catalog and broadcasts [`DeploymentNotification`]s.
#[derive(Debug)]
pub struct DeploymentWatcher {
    catalog: DeploymentCatalog,
    sender: broadcast::Sender<DeploymentNotification>,
    poll_interval: Duration,
    metrics: ControllerMetrics,
}

impl DeploymentWatcher {
    /// Creates a watcher over the catalog with the default interval.
    #[must_use]
    pub fn new(catalog: DeploymentCatalog) -> Self {
        let (sender, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            catalog,
            sender,
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics: ControllerMetrics::new(),
        }
    }

    /// Overrides the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Subscribes to change notifications. Receivers that lag past the
    /// channel buffer miss the oldest notifications and see a
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentNotification> {
        self.sender.subscribe()
    }

    /// Runs the poll loop until `token` is cancelled. Catalog fetch
    /// failures back off exponentially up to ten poll intervals.
    pub async fn run(&self, token: CancellationToken) {
        let mut snapshot: HashMap<String, [u8; 32]> = HashMap::new();
        let mut failures: u32 = 0;
        loop {
            let started = Instant::now();
            match self.poll(&mut snapshot).await {
                Ok(()) => failures = 0,
                Err(error) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(%error, failures, "deployment poll failed");
                }
            }
            self.metrics.observe_deployment_poll(started.elapsed());

            let backoff_factor = 2u32.saturating_pow(failures).min(10);
            let sleep = self.poll_interval * backoff_factor;
            tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!("deployment watcher stopping");
                    return;
                }
                () = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// One poll: diff active deployments against the previous snapshot
    /// and broadcast the differences.
    async fn poll(&self, snapshot: &mut HashMap<String, [u8; 32]>) -> Result<()> {
        let active = self.catalog.get_active_deployments().await?;
        let mut seen: HashMap<String, [u8; 32]> = HashMap::with_capacity(active.len());
        for deployment in active {
            let hash = content_hash(&deployment);
            if snapshot.get(&deployment.key) != Some(&hash) {
                // Send errors just mean nobody is subscribed yet.
                let _ = self
                    .sender
                    .send(DeploymentNotification::Changed(deployment.clone()));
            }
            seen.insert(deployment.key, hash);
        }
        for key in snapshot.keys() {
            if !seen.contains_key(key) {
                let _ = self.sender.send(DeploymentNotification::Deleted(key.clone()));
            }
        }
        *snapshot = seen;
        Ok(())
    }
}

/// Hash of the fields a change notification cares about.
fn content_hash(deployment: &DeploymentRow) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(deployment.schema_hash);
    hasher.update(deployment.min_replicas.to_be_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> DeploymentCatalog {
        DeploymentCatalog::new(Database::new(), Arc::new(Encryptor::derived([7u8; 32])))
    }

    #[tokio::test]
    async fn duplicate_schema_is_a_conflict() {
        let catalog = catalog();
        let schema = serde_json::json!({"module": "echo", "verbs": ["hello"]});
        catalog
            .create_deployment("dpl-echo-1", "echo", schema.clone())
            .await
            .unwrap();
        let err = catalog
            .create_deployment("dpl-echo-2", "echo", schema)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn active_means_positive_min_replicas() {
        let catalog = catalog();
        catalog
            .create_deployment("dpl-echo-1", "echo", serde_json::json!({"v": 1}))
            .await
            .unwrap();
        assert!(catalog.get_active_deployments().await.unwrap().is_empty());
        catalog.set_min_replicas("dpl-echo-1", 1).await.unwrap();
        let active = catalog.get_active_deployments().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, "dpl-echo-1");
    }

    #[tokio::test]
    async fn set_min_replicas_records_an_encrypted_timeline_event() {
        let catalog = catalog();
        catalog
            .create_deployment("dpl-echo-1", "echo", serde_json::json!({"v": 1}))
            .await
            .unwrap();
        catalog.set_min_replicas("dpl-echo-1", 2).await.unwrap();
        let tx = catalog.db.begin().await;
        let event = tx.tables().timeline_events.values().next().unwrap();
        assert_eq!(event.kind, "deployment_updated");
        // Stored ciphertext, not the JSON payload.
        assert!(!event.payload.windows(9).any(|w| w == b"dpl-echo-"));
    }

    #[tokio::test]
    async fn unknown_deployment_is_not_found() {
        let catalog = catalog();
        let err = catalog.set_runner_count("dpl-missing", 1).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_emits_changed_and_deleted() {
        let catalog = catalog();
        catalog
            .create_deployment("dpl-echo-1", "echo", serde_json::json!({"v": 1}))
            .await
            .unwrap();
        catalog.set_min_replicas("dpl-echo-1", 1).await.unwrap();

        let watcher =
            DeploymentWatcher::new(catalog.clone()).with_poll_interval(Duration::from_millis(10));
        let mut notifications = watcher.subscribe();
        let token = CancellationToken::new();
        let handle = {
            let token = token.clone();
            let watcher = Arc::new(watcher);
            let watcher_task = Arc::clone(&watcher);
            tokio::spawn(async move { watcher_task.run(token).await })
        };

        let DeploymentNotification::Changed(deployment) = notifications.recv().await.unwrap()
        else {
            panic!("expected a change notification");
        };
        assert_eq!(deployment.key, "dpl-echo-1");

        catalog.set_min_replicas("dpl-echo-1", 0).await.unwrap();
        let DeploymentNotification::Deleted(key) = notifications.recv().await.unwrap() else {
            panic!("expected a delete notification");
        };
        assert_eq!(key, "dpl-echo-1");

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_deployments_are_not_re_notified() {
        let catalog = catalog();
        catalog
            .create_deployment("dpl-echo-1", "echo", serde_json::json!({"v": 1}))
            .await
            .unwrap();
        catalog.set_min_replicas("dpl-echo-1", 1).await.unwrap();

        let watcher =
            DeploymentWatcher::new(catalog).with_poll_interval(Duration::from_millis(10));
        let mut notifications = watcher.subscribe();
        let mut snapshot = HashMap::new();
        watcher.poll(&mut snapshot).await.unwrap();
        watcher.poll(&mut snapshot).await.unwrap();
        assert!(matches!(
            notifications.recv().await.unwrap(),
            DeploymentNotification::Changed(_)
        ));
        assert!(notifications.try_recv().is_err());
    }
}
