//! The pub/sub subscription dispatcher.
//!
//! Topic events are delivered to subscribers with at-least-once
//! semantics: events are strictly ordered within a subscription, one
//! event is in flight per subscription at a time, and each event goes
//! to exactly one subscriber chosen uniformly at random from the
//! competing set.
//!
//! Consumption waits out a small delay past each event's creation time
//! so just-written events are not consumed before their publishers'
//! transactions are visible everywhere.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

use ftl_core::{Ref, RetryPolicy};

use crate::asyncqueue::{AsyncCall, AsyncCallQueue, AsyncOrigin, CallRequest};
use crate::crypto::{EncryptedColumn, Encryptor, SubKey};
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use crate::storage::tables::{SubscriberRow, SubscriptionRow, TopicEventRow, TopicRow};
use crate::storage::{Database, Transaction};

/// Default safety delay before a published event becomes consumable.
pub const DEFAULT_CONSUMPTION_DELAY: Duration = Duration::from_millis(200);

/// Where a new subscription's cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FromPolicy {
    /// Consume every retained event.
    Beginning,
    /// Consume only events published after the subscription exists.
    Latest,
}

/// An event returned for consumption. The payload stays encrypted; the
/// dispatcher copies it into the delivery call without decrypting.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    /// Event id within the topic.
    pub id: u64,
    /// Async-subkey ciphertext of the payload.
    pub payload: Vec<u8>,
    /// Publication time.
    pub created_at: DateTime<Utc>,
}

/// The dispatcher service.
#[derive(Debug, Clone)]
pub struct PubSubService {
    db: Database,
    queue: AsyncCallQueue,
    encryptor: Arc<Encryptor>,
    metrics: ControllerMetrics,
    consumption_delay: Duration,
}

impl PubSubService {
    /// Creates a dispatcher over the given database and queue.
    #[must_use]
    pub fn new(db: Database, queue: AsyncCallQueue, encryptor: Arc<Encryptor>) -> Self {
        Self {
            db,
            queue,
            encryptor,
            metrics: ControllerMetrics::new(),
            consumption_delay: DEFAULT_CONSUMPTION_DELAY,
        }
    }

    /// Overrides the consumption delay.
    #[must_use]
    pub fn with_consumption_delay(mut self, delay: Duration) -> Self {
        self.consumption_delay = delay;
        self
    }

    /// Declares a topic. Redeclaring an existing topic is a conflict.
    pub async fn create_topic(&self, topic: Ref) -> Result<()> {
        let mut tx = self.db.begin().await;
        let result = (|| {
            if tx.tables().topics.contains_key(&topic) {
                return Err(Error::conflict("topic", format!("{topic} already exists")));
            }
            tx.tables_mut().topics.insert(
                topic.clone(),
                TopicRow {
                    topic: topic.clone(),
                    created_at: Utc::now(),
                },
            );
            Ok(())
        })();
        tx.commit_or_rollback(result)
    }

    /// Creates a subscription over a topic.
    ///
    /// `from` fixes the initial cursor: the beginning of the log, or
    /// its current head.
    pub async fn create_subscription(&self, name: Ref, topic: Ref, from: FromPolicy) -> Result<()> {
        let mut tx = self.db.begin().await;
        let result = (|| {
            if !tx.tables().topics.contains_key(&topic) {
                return Err(Error::not_found("topic", topic.to_string()));
            }
            if tx.tables().topic_subscriptions.contains_key(&name) {
                return Err(Error::conflict(
                    "subscription",
                    format!("{name} already exists"),
                ));
            }
            let cursor = match from {
                FromPolicy::Beginning => 0,
                FromPolicy::Latest => tx
                    .tables()
                    .topic_events
                    .values()
                    .filter(|event| event.topic == topic)
                    .map(|event| event.id)
                    .max()
                    .unwrap_or(0),
            };
            tx.tables_mut().topic_subscriptions.insert(
                name.clone(),
                SubscriptionRow {
                    name: name.clone(),
                    topic,
                    cursor,
                    in_flight_event_id: None,
                    created_at: Utc::now(),
                },
            );
            Ok(())
        })();
        tx.commit_or_rollback(result)
    }

    /// Registers a subscriber verb against a subscription, owned by a
    /// deployment.
    pub async fn create_subscriber(
        &self,
        subscription: Ref,
        deployment_key: &str,
        sink: Ref,
        retry: RetryPolicy,
    ) -> Result<u64> {
        let mut tx = self.db.begin().await;
        let result = (|| {
            if !tx.tables().topic_subscriptions.contains_key(&subscription) {
                return Err(Error::not_found("subscription", subscription.to_string()));
            }
            if !tx.tables().deployments.contains_key(deployment_key) {
                return Err(Error::not_found("deployment", deployment_key));
            }
            let tables = tx.tables_mut();
            let id = tables.next_subscriber_id();
            tables.topic_subscribers.insert(
                id,
                SubscriberRow {
                    id,
                    subscription: subscription.clone(),
                    deployment_key: deployment_key.to_string(),
                    sink,
                    retry,
                    created_at: Utc::now(),
                },
            );
            Ok(id)
        })();
        tx.commit_or_rollback(result)
    }

    /// Removes a deactivated deployment's subscribers, and any
    /// subscription left with no subscribers at all.
    pub async fn remove_subscriptions_for_deployment(&self, deployment_key: &str) -> Result<()> {
        let mut tx = self.db.begin().await;
        let tables = tx.tables_mut();
        tables
            .topic_subscribers
            .retain(|_, row| row.deployment_key != deployment_key);
        let orphaned: Vec<Ref> = tables
            .topic_subscriptions
            .keys()
            .filter(|name| {
                !tables
                    .topic_subscribers
                    .values()
                    .any(|sub| &sub.subscription == *name)
            })
            .cloned()
            .collect();
        for name in &orphaned {
            tables.topic_subscriptions.remove(name);
        }
        tx.commit()?;
        tracing::debug!(
            deployment = deployment_key,
            removed_subscriptions = orphaned.len(),
            "removed subscriptions for deployment"
        );
        Ok(())
    }

    /// Appends an event to a topic's log.
    pub async fn publish_event(
        &self,
        module: &str,
        topic_name: &str,
        payload: &[u8],
        partition_key: Option<String>,
    ) -> Result<u64> {
        let topic = Ref::new(module, topic_name);
        let mut tx = self.db.begin().await;
        let result = (|| {
            if !tx.tables().topics.contains_key(&topic) {
                return Err(Error::not_found("topic", topic.to_string()));
            }
            let mut encrypted = EncryptedColumn::default();
            self.encryptor.encrypt(SubKey::Async, payload, &mut encrypted)?;
            let tables = tx.tables_mut();
            let id = tables.next_topic_event_id();
            tables.topic_events.insert(
                id,
                TopicEventRow {
                    id,
                    topic: topic.clone(),
                    payload: encrypted.into_bytes(),
                    partition_key,
                    created_at: Utc::now(),
                },
            );
            Ok(id)
        })();
        let id = tx.commit_or_rollback(result)?;
        self.metrics.record_event_published(&topic.to_string());
        tracing::debug!(%topic, event_id = id, "event published");
        Ok(id)
    }

    /// Subscriptions ready to consume: at least one subscriber whose
    /// deployment has a runner, a consumable event past the cursor, and
    /// no event already in flight.
    pub async fn subscriptions_needing_update(&self) -> Result<Vec<Ref>> {
        let tx = self.db.begin().await;
        let tables = tx.tables();
        let ready_cutoff = Utc::now() - self.consumption_delay;
        let mut ready = Vec::new();
        for sub in tables.topic_subscriptions.values() {
            if sub.in_flight_event_id.is_some() {
                continue;
            }
            let has_live_subscriber = tables.topic_subscribers.values().any(|row| {
                row.subscription == sub.name
                    && tables
                        .deployments
                        .get(&row.deployment_key)
                        .is_some_and(|deployment| deployment.runners >= 1)
            });
            if !has_live_subscriber {
                continue;
            }
            let has_consumable_event = tables.topic_events.values().any(|event| {
                event.topic == sub.topic && event.id > sub.cursor && event.created_at <= ready_cutoff
            });
            if has_consumable_event {
                ready.push(sub.name.clone());
            }
        }
        Ok(ready)
    }

    /// The oldest event strictly after `cursor` on the subscription's
    /// topic, regardless of the consumption delay.
    pub async fn next_event_for_subscription(
        &self,
        subscription: &Ref,
        cursor: u64,
    ) -> Result<Option<PendingEvent>> {
        let tx = self.db.begin().await;
        let topic = tx
            .tables()
            .topic_subscriptions
            .get(subscription)
            .ok_or_else(|| Error::not_found("subscription", subscription.to_string()))?
            .topic
            .clone();
        Ok(next_event(&tx, &topic, cursor))
    }

    /// Chooses a subscriber uniformly at random, enqueues the delivery
    /// call, and marks the event in flight, all inside `tx`.
    ///
    /// One event per subscription at a time; a second call while the
    /// marker is set is a conflict.
    pub fn begin_consuming_in(
        &self,
        tx: &mut Transaction,
        subscription: &Ref,
        event: &PendingEvent,
    ) -> Result<()> {
        let in_flight = tx
            .tables()
            .topic_subscriptions
            .get(subscription)
            .ok_or_else(|| Error::not_found("subscription", subscription.to_string()))?
            .in_flight_event_id;
        if in_flight.is_some() {
            return Err(Error::conflict(
                "subscription",
                format!("{subscription} already has an event in flight"),
            ));
        }
        let subscribers: Vec<SubscriberRow> = tx
            .tables()
            .topic_subscribers
            .values()
            .filter(|row| &row.subscription == subscription)
            .cloned()
            .collect();
        let chosen = subscribers
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| Error::not_found("subscriber", subscription.to_string()))?;

        self.queue.create_call_encrypted(
            tx,
            CallRequest::new(
                AsyncOrigin::Sub {
                    subscription: subscription.clone(),
                },
                chosen.sink.clone(),
                event.payload.clone(),
            )
            .with_retry(chosen.retry.clone()),
        )?;

        let tables = tx.tables_mut();
        let sub = tables
            .topic_subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::not_found("subscription", subscription.to_string()))?;
        sub.in_flight_event_id = Some(event.id);
        tracing::debug!(
            %subscription,
            event_id = event.id,
            sink = %chosen.sink,
            "began consuming event"
        );
        Ok(())
    }

    /// Advances the cursor to the in-flight event and clears the
    /// marker. The cursor never moves backwards.
    pub fn complete_event_in(&self, tx: &mut Transaction, subscription: &Ref) -> Result<()> {
        let tables = tx.tables_mut();
        let sub = tables
            .topic_subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::not_found("subscription", subscription.to_string()))?;
        if let Some(event_id) = sub.in_flight_event_id.take() {
            sub.cursor = sub.cursor.max(event_id);
        }
        self.metrics.record_event_consumed(&subscription.to_string());
        Ok(())
    }

    /// Completion finaliser for calls with a pub/sub origin.
    ///
    /// Any final result advances past the event; the queue has already
    /// recorded a permanent error, and a subscription-level catch rides
    /// the queue's catch mechanism.
    pub fn on_call_completion(
        &self,
        tx: &mut Transaction,
        call: &AsyncCall,
        _failed: bool,
        is_final: bool,
    ) -> Result<()> {
        let AsyncOrigin::Sub { subscription } = &call.origin else {
            return Err(Error::invalid_argument(format!(
                "not a pub/sub origin: {}",
                call.origin
            )));
        };
        if !is_final {
            // Wait for the call's retries before progressing.
            return Ok(());
        }
        self.complete_event_in(tx, subscription)
    }

    /// Walks every ready subscription one step: fetch the next event
    /// and hand it to a subscriber. Returns how many deliveries were
    /// scheduled.
    pub async fn progress_subscriptions(&self) -> Result<usize> {
        let ready = self.subscriptions_needing_update().await?;
        let ready_cutoff = Utc::now() - self.consumption_delay;
        let mut scheduled = 0;
        for name in ready {
            let mut tx = self.db.begin().await;
            let result = (|| {
                let sub = tx
                    .tables()
                    .topic_subscriptions
                    .get(&name)
                    .ok_or_else(|| Error::not_found("subscription", name.to_string()))?;
                if sub.in_flight_event_id.is_some() {
                    return Ok(false);
                }
                let (topic, cursor) = (sub.topic.clone(), sub.cursor);
                let Some(event) = next_event(&tx, &topic, cursor) else {
                    return Ok(false);
                };
                if event.created_at > ready_cutoff {
                    tracing::trace!(subscription = %name, "next event is too new, skipping");
                    return Ok(false);
                }
                self.begin_consuming_in(&mut tx, &name, &event)?;
                Ok(true)
            })();
            if tx.commit_or_rollback(result)? {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }
}

/// The oldest event on `topic` strictly after `cursor`.
fn next_event(tx: &Transaction, topic: &Ref, cursor: u64) -> Option<PendingEvent> {
    tx.tables()
        .topic_events
        .values()
        .filter(|event| &event.topic == topic && event.id > cursor)
        .min_by_key(|event| event.id)
        .map(|event| PendingEvent {
            id: event.id,
            payload: event.payload.clone(),
            created_at: event.created_at,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leases::Leaser;
    use crate::storage::tables::DeploymentRow;

    fn service() -> PubSubService {
        let db = Database::new();
        let encryptor = Arc::new(Encryptor::derived([9u8; 32]));
        let queue = AsyncCallQueue::new(db.clone(), Arc::clone(&encryptor), Leaser::new(db.clone()));
        PubSubService::new(db, queue, encryptor).with_consumption_delay(Duration::ZERO)
    }

    async fn seed_deployment(service: &PubSubService, key: &str, runners: u32) {
        let mut tx = service.db.begin().await;
        tx.tables_mut().deployments.insert(
            key.to_string(),
            DeploymentRow {
                key: key.to_string(),
                module: "echo".to_string(),
                schema: serde_json::json!({}),
                schema_hash: [0; 32],
                min_replicas: 1,
                runners,
                created_at: Utc::now(),
            },
        );
        tx.commit().unwrap();
    }

    async fn seed(service: &PubSubService) -> (Ref, Ref) {
        let topic = Ref::new("echo", "events");
        let sub = Ref::new("echo", "events_sub");
        service.create_topic(topic.clone()).await.unwrap();
        service
            .create_subscription(sub.clone(), topic.clone(), FromPolicy::Beginning)
            .await
            .unwrap();
        seed_deployment(service, "dpl-echo-1", 1).await;
        service
            .create_subscriber(
                sub.clone(),
                "dpl-echo-1",
                Ref::new("echo", "consume"),
                RetryPolicy::none(),
            )
            .await
            .unwrap();
        (topic, sub)
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_is_not_found() {
        let service = service();
        let err = service
            .publish_event("echo", "missing", b"x", None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn event_ids_increase_strictly() {
        let service = service();
        seed(&service).await;
        let first = service.publish_event("echo", "events", b"a", None).await.unwrap();
        let second = service.publish_event("echo", "events", b"b", None).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn latest_subscription_skips_existing_events() {
        let service = service();
        let (topic, _) = seed(&service).await;
        service.publish_event("echo", "events", b"old", None).await.unwrap();
        let late = Ref::new("echo", "late_sub");
        service
            .create_subscription(late.clone(), topic, FromPolicy::Latest)
            .await
            .unwrap();
        let next = service.next_event_for_subscription(&late, 1).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn progress_creates_one_delivery_call() {
        let service = service();
        let (_, sub) = seed(&service).await;
        service.publish_event("echo", "events", b"payload", None).await.unwrap();
        assert_eq!(service.subscriptions_needing_update().await.unwrap(), vec![sub.clone()]);

        assert_eq!(service.progress_subscriptions().await.unwrap(), 1);
        // In flight: the subscription is no longer ready.
        assert!(service.subscriptions_needing_update().await.unwrap().is_empty());
        let tx = service.db.begin().await;
        assert_eq!(tx.tables().async_calls.len(), 1);
        let call = tx.tables().async_calls.values().next().unwrap();
        assert_eq!(call.origin, "sub:echo.events_sub");
        assert_eq!(call.verb, Ref::new("echo", "consume"));
    }

    #[tokio::test]
    async fn subscription_without_runners_is_not_ready() {
        let service = service();
        seed(&service).await;
        seed_deployment(&service, "dpl-echo-1", 0).await;
        service.publish_event("echo", "events", b"x", None).await.unwrap();
        assert!(service.subscriptions_needing_update().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consuming_while_an_event_is_in_flight_conflicts() {
        let service = service();
        let (_, sub) = seed(&service).await;
        service.publish_event("echo", "events", b"one", None).await.unwrap();
        service.publish_event("echo", "events", b"two", None).await.unwrap();
        service.progress_subscriptions().await.unwrap();

        // The marker is set; a direct second dispatch must not
        // overwrite it and skip the first event.
        let second = service
            .next_event_for_subscription(&sub, 1)
            .await
            .unwrap()
            .unwrap();
        let mut tx = service.db.begin().await;
        let err = service
            .begin_consuming_in(&mut tx, &sub, &second)
            .unwrap_err();
        assert!(err.is_conflict());
        drop(tx);

        let tx = service.db.begin().await;
        assert_eq!(
            tx.tables()
                .topic_subscriptions
                .get(&sub)
                .unwrap()
                .in_flight_event_id,
            Some(1)
        );
        assert_eq!(tx.tables().async_calls.len(), 1);
    }

    #[tokio::test]
    async fn complete_event_advances_cursor_monotonically() {
        let service = service();
        let (_, sub) = seed(&service).await;
        service.publish_event("echo", "events", b"x", None).await.unwrap();
        service.progress_subscriptions().await.unwrap();

        let mut tx = service.db.begin().await;
        service.complete_event_in(&mut tx, &sub).unwrap();
        let row = tx.tables().topic_subscriptions.get(&sub).unwrap();
        assert_eq!(row.cursor, 1);
        assert_eq!(row.in_flight_event_id, None);
        // Completing again without an in-flight event leaves the cursor alone.
        service.complete_event_in(&mut tx, &sub).unwrap();
        assert_eq!(tx.tables().topic_subscriptions.get(&sub).unwrap().cursor, 1);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn subscription_survives_while_other_deployments_subscribe() {
        let service = service();
        let (_, sub) = seed(&service).await;
        seed_deployment(&service, "dpl-echo-2", 1).await;
        service
            .create_subscriber(
                sub.clone(),
                "dpl-echo-2",
                Ref::new("echo", "consume_too"),
                RetryPolicy::none(),
            )
            .await
            .unwrap();

        service
            .remove_subscriptions_for_deployment("dpl-echo-1")
            .await
            .unwrap();
        let tx = service.db.begin().await;
        assert!(tx.tables().topic_subscriptions.contains_key(&sub));
        assert_eq!(tx.tables().topic_subscribers.len(), 1);
        let survivor = tx.tables().topic_subscribers.values().next().unwrap();
        assert_eq!(survivor.deployment_key, "dpl-echo-2");
    }

    #[tokio::test]
    async fn removing_the_last_deployment_drops_the_subscription() {
        let service = service();
        let (_, sub) = seed(&service).await;
        service
            .remove_subscriptions_for_deployment("dpl-echo-1")
            .await
            .unwrap();
        let tx = service.db.begin().await;
        assert!(tx.tables().topic_subscribers.is_empty());
        assert!(!tx.tables().topic_subscriptions.contains_key(&sub));
    }
}
