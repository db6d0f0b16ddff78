//! The per-queue dispatch loop: abandoned-lease recovery, leasing, delivery,
//! and resolution, run once per tick.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{LeasedDelivery, Queue, Worker};
use crate::rate_limit::RateLimiter;
use crate::store::{AttemptOutcome, Resolution, Store};

/// A single HTTP attempt against a worker endpoint.
///
/// `broker-http` provides the production implementation on top of
/// `reqwest`; tests use an in-memory double.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// POST `body` to `endpoint` as `application/json`. Transport errors,
    /// connect failures, and timeouts must be normalized to a synthetic
    /// status of 500 rather than returned as an `Err` — the HTTP client
    /// always resolves to a status code.
    async fn deliver(&self, endpoint: &str, body: &Value) -> u16;
}

/// Tunables for the dispatch loop.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Wall-clock duration (T) a lease may be held before it is considered
    /// abandoned.
    pub lease_timeout: chrono::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lease_timeout: chrono::Duration::seconds(crate::DEFAULT_LEASE_TIMEOUT_SECS),
        }
    }
}

impl DispatcherConfig {
    pub fn with_lease_timeout(lease_timeout: StdDuration) -> Self {
        Self {
            lease_timeout: chrono::Duration::from_std(lease_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(crate::DEFAULT_LEASE_TIMEOUT_SECS)),
        }
    }
}

/// What happened during one call to [`Dispatcher::tick`].
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub recovered: u64,
    pub leased: usize,
    pub acknowledged: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Drives one queue's lease → deliver → resolve cycle. One instance is
/// shared across every tick invocation for every queue; `tick` takes the
/// queue id to operate on plus the queue/worker rows to read `rps` and
/// `max_retries` from (the caller — typically the scheduler — is expected to
/// have these cached or to have just read them from the store).
pub struct Dispatcher<S, C> {
    store: Arc<S>,
    client: Arc<C>,
    config: DispatcherConfig,
}

impl<S, C> Dispatcher<S, C>
where
    S: Store,
    C: WorkerClient,
{
    pub fn new(store: Arc<S>, client: Arc<C>, config: DispatcherConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// Run one tick for `queue` against `worker`, in order: abandoned-lease
    /// recovery, lease phase, deliver phase, resolve phase.
    ///
    /// A store error while resolving one row is logged and skipped rather
    /// than aborting the tick: the row stays locked until its lease expires
    /// and the next tick's abandonment sweep reclaims it.
    pub async fn tick(&self, queue: &Queue, worker: &Worker) -> anyhow::Result<TickReport> {
        let now = Utc::now();
        let mut report = TickReport::default();

        report.recovered = self.store.sweep_abandoned(queue.id, now).await?;
        if report.recovered > 0 {
            warn!(
                queue_id = %queue.id,
                recovered = report.recovered,
                "recovered abandoned leases"
            );
        }

        let limiter = RateLimiter::new(worker.rps);
        let leased = self
            .store
            .lease_ready(queue.id, limiter.batch_size(), self.config.lease_timeout, now)
            .await?;
        report.leased = leased.len();

        if leased.is_empty() {
            return Ok(report);
        }

        let deliveries = join_all(leased.into_iter().map(|leased| {
            let client = Arc::clone(&self.client);
            let endpoint = worker.endpoint.clone();
            async move {
                let status = client.deliver(&endpoint, &leased.body).await;
                (leased, status)
            }
        }))
        .await;

        for (leased, status) in deliveries {
            let outcome = if (200..300).contains(&status) {
                AttemptOutcome::Success
            } else {
                AttemptOutcome::Failure
            };

            let resolution = match self
                .store
                .resolve(queue.id, leased.delivery.id, outcome, Utc::now())
                .await
            {
                Ok(resolution) => resolution,
                Err(err) => {
                    tracing::error!(
                        queue_id = %queue.id,
                        delivery_id = leased.delivery.id,
                        error = %err,
                        "failed to resolve delivery, skipping"
                    );
                    continue;
                }
            };

            match resolution {
                Resolution::Acknowledged => report.acknowledged += 1,
                Resolution::Retried { retries } => {
                    report.retried += 1;
                    info!(
                        queue_id = %queue.id,
                        delivery_id = leased.delivery.id,
                        status,
                        retries,
                        "delivery attempt failed, scheduled for retry"
                    );
                }
                Resolution::DeadLettered { retries } => {
                    report.dead_lettered += 1;
                    warn!(
                        queue_id = %queue.id,
                        delivery_id = leased.delivery.id,
                        status,
                        retries,
                        "delivery exhausted retry budget, moved to dead letter"
                    );
                }
                Resolution::AlreadyResolved => {}
            }
        }

        Ok(report)
    }
}

/// Convenience used by tests and the daemon to identify which worker/queue a
/// dispatcher cycle concerns without repeating the pair everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueWorkerKey {
    pub queue_id: Uuid,
    pub worker_id: Uuid,
}
