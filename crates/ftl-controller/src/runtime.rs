//! The worker-facing controller runtime.
//!
//! Wires the storage, crypto, lease, queue, FSM, pub/sub, and
//! deployment services together and exposes the small surface workers
//! drive: claim a call, report its outcome, reap zombies, expire
//! leases, progress subscriptions.
//!
//! Completion dispatches the origin-specific finaliser inside the
//! completion transaction, so an FSM transition or a subscription
//! cursor never disagrees with its call's terminal state.

use std::sync::Arc;

use crate::asyncqueue::{AcquiredCall, AsyncCall, AsyncCallQueue, AsyncOrigin, CallResult};
use crate::config::ControllerConfig;
use crate::crypto::{self, Encryptor};
use crate::deployments::{DeploymentCatalog, DeploymentWatcher};
use crate::error::{Error, Result};
use crate::fsm::FsmEngine;
use crate::leases::Leaser;
use crate::pubsub::PubSubService;
use crate::storage::{Database, Transaction};

/// Message recorded on calls failed back by the zombie reaper.
const LEASE_EXPIRED_ERROR: &str = "async call lease expired";

/// The assembled execution core.
#[derive(Debug)]
pub struct Controller {
    db: Database,
    leaser: Leaser,
    queue: AsyncCallQueue,
    fsm: FsmEngine,
    pubsub: PubSubService,
    deployments: DeploymentCatalog,
    config: ControllerConfig,
}

impl Controller {
    /// Builds the controller, bootstrapping encryption from the
    /// configured KMS URI.
    ///
    /// Fails with [`Error::Crypto`] if the database was bootstrapped
    /// under a different master key.
    pub async fn new(config: ControllerConfig) -> Result<Self> {
        let db = Database::new();
        let mut tx = db.begin().await;
        let result = crypto::bootstrap(&mut tx, config.kms_uri.as_deref());
        let encryptor = Arc::new(tx.commit_or_rollback(result)?);
        Ok(Self::with_encryptor(db, encryptor, config))
    }

    /// Assembles the controller from an already-bootstrapped encryptor.
    #[must_use]
    pub fn with_encryptor(db: Database, encryptor: Arc<Encryptor>, config: ControllerConfig) -> Self {
        let leaser = Leaser::new(db.clone());
        let queue = AsyncCallQueue::new(db.clone(), Arc::clone(&encryptor), leaser.clone());
        let fsm = FsmEngine::new(db.clone(), queue.clone(), Arc::clone(&encryptor));
        let pubsub = PubSubService::new(db.clone(), queue.clone(), Arc::clone(&encryptor))
            .with_consumption_delay(config.event_consumption_delay);
        let deployments = DeploymentCatalog::new(db.clone(), encryptor);
        Self {
            db,
            leaser,
            queue,
            fsm,
            pubsub,
            deployments,
            config,
        }
    }

    /// The async-call queue.
    #[must_use]
    pub fn queue(&self) -> &AsyncCallQueue {
        &self.queue
    }

    /// The FSM engine.
    #[must_use]
    pub fn fsm(&self) -> &FsmEngine {
        &self.fsm
    }

    /// The pub/sub dispatcher.
    #[must_use]
    pub fn pubsub(&self) -> &PubSubService {
        &self.pubsub
    }

    /// The deployment catalog.
    #[must_use]
    pub fn deployments(&self) -> &DeploymentCatalog {
        &self.deployments
    }

    /// A watcher over the deployment catalog, using the configured
    /// poll interval.
    #[must_use]
    pub fn deployment_watcher(&self) -> DeploymentWatcher {
        DeploymentWatcher::new(self.deployments.clone())
            .with_poll_interval(self.config.deployment_poll_interval)
    }

    /// The lease manager.
    #[must_use]
    pub fn leaser(&self) -> &Leaser {
        &self.leaser
    }

    /// The underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Claims the oldest due async call for execution.
    ///
    /// For a call with `catching` set, workers invoke `catch_verb`
    /// with [`catch_request`] instead of `verb` with the payload.
    pub async fn acquire_async_call(&self) -> Result<AcquiredCall> {
        self.queue.acquire().await
    }

    /// Records an execution outcome, runs the origin's finaliser in
    /// the same transaction, and releases the call's lease.
    ///
    /// The lease is released whether the completion lands or not; a
    /// failed completion leaves the row executing and leaseless, so
    /// the zombie reaper can recover it.
    ///
    /// Returns whether a follow-up call (retry or catch) was
    /// scheduled.
    pub async fn complete_async_call(
        &self,
        acquired: AcquiredCall,
        result: CallResult,
    ) -> Result<bool> {
        let failed = matches!(result, CallResult::Failure(_));
        let completion = self
            .queue
            .complete(&acquired.call, result, |tx, is_final| {
                self.finalise(tx, &acquired.call, failed, is_final)
            })
            .await;
        let released = acquired.lease.release().await;
        let scheduled = completion?;
        released?;
        Ok(scheduled)
    }

    fn finalise(
        &self,
        tx: &mut Transaction,
        call: &AsyncCall,
        failed: bool,
        is_final: bool,
    ) -> Result<()> {
        match &call.origin {
            AsyncOrigin::Cron { .. } => Ok(()),
            AsyncOrigin::Fsm { .. } => self.fsm.on_call_completion(tx, call, failed, is_final),
            AsyncOrigin::Sub { .. } => self.pubsub.on_call_completion(tx, call, failed, is_final),
        }
    }

    /// Fails claimed calls whose lease is gone back through the
    /// completion pipeline, up to the configured batch limit per pass.
    /// Returns how many were reaped.
    pub async fn reap_zombie_calls(&self) -> Result<usize> {
        let zombies = self.queue.get_zombie_calls(self.config.zombie_batch_limit).await?;
        let mut reaped = 0;
        for call in zombies {
            tracing::warn!(id = call.id, verb = %call.verb, "reaping zombie async call");
            self.queue
                .complete(
                    &call,
                    CallResult::Failure(LEASE_EXPIRED_ERROR.to_string()),
                    |tx, is_final| self.finalise(tx, &call, true, is_final),
                )
                .await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Deletes leases past expiry. Returns how many were deleted.
    pub async fn expire_leases(&self) -> Result<usize> {
        self.leaser.expire_leases().await
    }

    /// Walks every ready subscription one consumption step. Returns
    /// how many deliveries were scheduled.
    pub async fn progress_subscriptions(&self) -> Result<usize> {
        self.pubsub.progress_subscriptions().await
    }
}

/// Builds the request envelope a catch verb receives: the failing
/// verb, its original request, and the error that exhausted retries.
pub fn catch_request(call: &AsyncCall) -> Result<Vec<u8>> {
    let error = call
        .original_error
        .as_deref()
        .ok_or_else(|| Error::invalid_argument("call is not a catch attempt"))?;
    let request: serde_json::Value = serde_json::from_slice(&call.request)?;
    Ok(serde_json::to_vec(&serde_json::json!({
        "verb": {
            "module": call.verb.module,
            "name": call.verb.name,
        },
        "request": request,
        "error": error,
    }))?)
}
