//! The storage contract the Dispatcher, Router, and Admin Surface are built
//! against. `broker-postgres` and `broker-memory` provide concrete
//! implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    DeadLetterRow, DeliveryRow, LeasedDelivery, Message, NewMessage, NewQueue, NewWorker, Queue,
    Worker,
};

/// Outcome of one delivery attempt, as reported by the Dispatcher after an
/// HTTP round-trip (or an abandoned-lease sweep standing in for one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// What happened when a leased row was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Acknowledged,
    Retried { retries: i32 },
    DeadLettered { retries: i32 },
    /// The row was no longer in a resolvable state (already acknowledged or
    /// already dead-lettered) — resolving it again is a no-op.
    AlreadyResolved,
}

/// Transactional persistence primitives required by the delivery engine.
///
/// Implementations must guarantee:
/// - `publish` is atomic: the message and every matching delivery row are
///   persisted together or not at all.
/// - `lease_ready` combines selection, lock-skip, and update in one atomic
///   step (e.g. `SELECT ... FOR UPDATE SKIP LOCKED` followed by an `UPDATE`
///   in the same transaction) so that no two concurrent callers can observe
///   and lease the same row.
/// - `resolve` is a single atomic read-modify-write keyed on the row's
///   current lock/ack state, so re-resolving an already-terminal row is a
///   guarded no-op rather than a double transition.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_worker(&self, new: NewWorker) -> anyhow::Result<Worker>;
    async fn get_worker(&self, id: Uuid) -> anyhow::Result<Option<Worker>>;
    async fn delete_worker(&self, id: Uuid) -> anyhow::Result<bool>;

    async fn create_queue(&self, new: NewQueue) -> anyhow::Result<Queue>;
    async fn get_queue(&self, id: Uuid) -> anyhow::Result<Option<Queue>>;
    async fn get_queue_by_name(&self, name: &str) -> anyhow::Result<Option<Queue>>;
    async fn list_queues(&self) -> anyhow::Result<Vec<Queue>>;
    async fn delete_queue(&self, id: Uuid) -> anyhow::Result<bool>;

    /// Persist `message` and, in the same transaction, create one pending
    /// delivery row for every queue in `matching_queues` whose binding
    /// pattern matches `message.routing_key` at the time of the call.
    async fn publish(&self, new: NewMessage, matching_queues: &[Queue]) -> anyhow::Result<Message>;

    async fn get_message(&self, id: Uuid) -> anyhow::Result<Option<Message>>;

    /// Recover leases abandoned by a crashed dispatcher: any row in `queue_id`
    /// with `locked = true` and an elapsed `lease_expires_at` is resolved as
    /// a failure (retry or dead-letter, per the queue's `max_retries`), then
    /// unlocked. Returns the number of rows recovered.
    async fn sweep_abandoned(&self, queue_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Atomically lease up to `limit` pending, visible delivery rows for
    /// `queue_id`, ordered by `enqueued_at` then local id, skipping rows
    /// already locked by another caller.
    async fn lease_ready(
        &self,
        queue_id: Uuid,
        limit: i64,
        lease_timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<LeasedDelivery>>;

    /// Resolve a leased row per `outcome`, consulting the queue's
    /// `max_retries` to decide between retry and dead-letter on failure.
    async fn resolve(
        &self,
        queue_id: Uuid,
        delivery_id: i64,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Resolution>;

    async fn get_delivery(&self, queue_id: Uuid, delivery_id: i64) -> anyhow::Result<Option<DeliveryRow>>;
    async fn list_deliveries(&self, queue_id: Uuid) -> anyhow::Result<Vec<DeliveryRow>>;
    async fn list_dead_letters(&self, queue_id: Uuid) -> anyhow::Result<Vec<DeadLetterRow>>;
}
