// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transition worker.
//!
//! Claims queued transitions from a [`Persistence`] backend and runs them
//! concurrently through a [`TransitionRunner`]. Retryable failures go back to
//! the queue until the attempt limit; fatal failures are taken out of
//! delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::persistence::{Persistence, PersistenceCommitter, QueuedTransition, StoredTransitionData};
use crate::runner::TransitionRunner;
use crate::service::ServiceRegistry;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum transitions running at once
    pub max_concurrent_transitions: usize,
    /// How long to sleep when the queue is empty
    pub poll_interval: Duration,
    /// Maximum transitions claimed per poll
    pub batch_size: usize,
    /// Deliveries of one transition before it is marked failed
    pub max_attempts: u32,
    /// Age after which an unacknowledged claim returns to the queue
    pub claim_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig::from(&Config::default())
    }
}

impl From<&Config> for WorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_transitions: config.max_concurrent_transitions,
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
            max_attempts: config.max_attempts,
            claim_timeout: config.claim_timeout,
        }
    }
}

/// What happened to one delivered transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Committed,
    Abandoned,
    Failed,
}

/// Background worker that drains the transition queue.
pub struct TransitionWorker {
    persistence: Arc<dyn Persistence>,
    runner: TransitionRunner,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl TransitionWorker {
    /// Create a worker running transitions with `runner`.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        runner: TransitionRunner,
        config: WorkerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_transitions.max(1)));
        Self {
            persistence,
            runner,
            config,
            permits,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a worker whose runner commits to `persistence` and resolves
    /// services and methods from `registry`.
    pub fn with_registry(
        persistence: Arc<dyn Persistence>,
        registry: Arc<ServiceRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let committer = Arc::new(PersistenceCommitter::new(persistence.clone()));
        let runner = TransitionRunner::new(committer, registry.clone(), registry);
        Self::new(persistence, runner, config)
    }

    /// Token that stops [`run`](Self::run) and cancels in-flight loads.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Poll the queue until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent_transitions,
            claim_timeout_secs = self.config.claim_timeout.as_secs(),
            "Transition worker started"
        );

        let mut last_reclaim: Option<Instant> = None;
        loop {
            if self.shutdown.is_cancelled() {
                info!("Transition worker shutting down");
                break;
            }

            if last_reclaim.is_none_or(|at| at.elapsed() >= self.config.claim_timeout / 2) {
                if let Err(e) = self.reclaim_stale().await {
                    error!(error = %e, "Failed to reclaim stale transitions");
                }
                last_reclaim = Some(Instant::now());
            }

            // A started batch always finishes so no transition stays claimed.
            let idle = match self.process_batch().await {
                Ok(count) => count == 0,
                Err(e) => {
                    error!(error = %e, "Failed to process transition batch");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("Transition worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    /// Claim one batch and run it to the end. Returns how many transitions
    /// were delivered.
    #[instrument(skip(self))]
    pub async fn process_batch(&self) -> Result<usize> {
        let batch = self
            .persistence
            .claim_transitions(self.config.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }

        debug!(count = batch.len(), "Claimed transitions");
        let delivered = batch.len();

        let mut tasks = JoinSet::new();
        for transition in batch {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EngineError::storage("acquire_permit", e))?;
            let persistence = self.persistence.clone();
            let runner = self.runner.clone();
            let cancel = self.shutdown.child_token();
            let max_attempts = self.config.max_attempts;

            tasks.spawn(async move {
                let outcome = deliver(&runner, persistence, transition, &cancel, max_attempts).await;
                drop(permit);
                outcome
            });
        }

        let (mut committed, mut abandoned, mut failed) = (0usize, 0usize, 0usize);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Delivery::Committed)) => committed += 1,
                Ok(Ok(Delivery::Abandoned)) => abandoned += 1,
                Ok(Ok(Delivery::Failed)) => failed += 1,
                Ok(Err(e)) => error!(error = %e, "Failed to record transition outcome"),
                Err(e) => error!(error = %e, "Transition task failed"),
            }
        }
        debug!(committed, abandoned, failed, "Batch finished");

        Ok(delivered)
    }

    /// Return transitions claimed longer than `claim_timeout` ago to the
    /// queue. Recovers claims of a worker that stopped mid-batch. Returns how
    /// many were reclaimed.
    pub async fn reclaim_stale(&self) -> Result<usize> {
        let timeout = chrono::Duration::from_std(self.config.claim_timeout)
            .map_err(|e| EngineError::storage("reclaim", format!("Invalid duration: {}", e)))?;
        let reclaimed = self
            .persistence
            .reclaim_stale_transitions(Utc::now() - timeout)
            .await?;

        if reclaimed > 0 {
            warn!(
                reclaimed,
                claim_timeout_secs = self.config.claim_timeout.as_secs(),
                "Reclaimed stale transition claims"
            );
        } else {
            debug!("No stale transition claims found");
        }
        Ok(reclaimed)
    }

    /// Process batches until nothing is left to claim. Returns how many
    /// transitions were delivered in total.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let delivered = self.process_batch().await?;
            if delivered == 0 {
                return Ok(total);
            }
            total += delivered;
        }
    }
}

async fn deliver(
    runner: &TransitionRunner,
    persistence: Arc<dyn Persistence>,
    transition: QueuedTransition,
    cancel: &CancellationToken,
    max_attempts: u32,
) -> Result<Delivery> {
    let delivery_id = transition.id.clone();
    let attempt = transition.attempt + 1;
    let data = StoredTransitionData::new(transition, persistence.clone());

    let error = match runner.run(data.transition(), &data, cancel).await {
        Ok(_) => return Ok(Delivery::Committed),
        Err(e) => e,
    };

    if error.is_fatal() || attempt >= max_attempts {
        warn!(
            delivery_id = %delivery_id,
            attempt,
            error_code = error.error_code(),
            error = %error,
            "Transition failed permanently"
        );
        persistence
            .fail_transition(&delivery_id, &error.to_string())
            .await?;
        Ok(Delivery::Failed)
    } else {
        debug!(
            delivery_id = %delivery_id,
            attempt,
            error_code = error.error_code(),
            error = %error,
            "Transition abandoned for redelivery"
        );
        persistence
            .abandon_transition(&delivery_id, &error.to_string())
            .await?;
        Ok(Delivery::Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::ServiceId;
    use crate::intents::ExecuteRoutineIntent;
    use crate::persistence::MemoryPersistence;
    use crate::values::NamedValues;

    fn worker(persistence: Arc<MemoryPersistence>, max_attempts: u32) -> TransitionWorker {
        TransitionWorker::with_registry(
            persistence,
            Arc::new(ServiceRegistry::new()),
            WorkerConfig {
                max_attempts,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_worker_config_from_config() {
        let config = Config {
            max_concurrent_transitions: 3,
            batch_size: 7,
            ..Default::default()
        };
        let worker_config = WorkerConfig::from(&config);
        assert_eq!(worker_config.max_concurrent_transitions, 3);
        assert_eq!(worker_config.batch_size, 7);
        assert_eq!(worker_config.max_attempts, config.max_attempts);
        assert_eq!(worker_config.claim_timeout, config.claim_timeout);
    }

    #[tokio::test]
    async fn test_empty_queue_processes_nothing() {
        let persistence = Arc::new(MemoryPersistence::new());
        let worker = worker(persistence, 3);
        assert_eq!(worker.process_batch().await.unwrap(), 0);
        assert_eq!(worker.run_until_idle().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_redelivered_until_attempts_run_out() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence
            .schedule(&ExecuteRoutineIntent::new(
                ServiceId::new("Unregistered"),
                "Run",
                NamedValues::new(),
            ))
            .await
            .unwrap();

        let worker = worker(persistence.clone(), 3);
        let delivered = worker.run_until_idle().await.unwrap();

        assert_eq!(delivered, 3);
        let failed = persistence.failed_transitions().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempt, 2);
        assert!(
            failed[0]
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("Unregistered"))
        );
    }

    #[tokio::test]
    async fn test_stale_claim_is_reclaimed_and_delivered() {
        let persistence = Arc::new(MemoryPersistence::new());
        let intent = ExecuteRoutineIntent::new(
            ServiceId::new(crate::intrinsic::INTRINSIC_SERVICE_NAME),
            "FromResult",
            NamedValues::new().with("value", 7),
        );
        persistence.schedule(&intent).await.unwrap();
        // A worker that crashed after claiming.
        assert_eq!(persistence.claim_transitions(1).await.unwrap().len(), 1);

        let worker = TransitionWorker::with_registry(
            persistence.clone(),
            Arc::new(ServiceRegistry::new()),
            WorkerConfig {
                claim_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        );
        assert_eq!(worker.reclaim_stale().await.unwrap(), 0);
        assert_eq!(worker.run_until_idle().await.unwrap(), 0);

        let worker = TransitionWorker::with_registry(
            persistence.clone(),
            Arc::new(ServiceRegistry::new()),
            WorkerConfig {
                claim_timeout: Duration::ZERO,
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(worker.reclaim_stale().await.unwrap(), 1);
        assert_eq!(worker.run_until_idle().await.unwrap(), 1);

        let record = persistence.get_routine(intent.intent_id).await.unwrap().unwrap();
        assert_eq!(
            record.result,
            Some(crate::descriptors::RoutineResult::Succeeded(serde_json::json!(7)))
        );
        assert_eq!(persistence.pending_transitions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let persistence = Arc::new(MemoryPersistence::new());
        let worker = Arc::new(worker(persistence, 3));
        let shutdown = worker.shutdown_token();

        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
