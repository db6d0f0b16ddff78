//! Core domain types: workers, queues, messages, and delivery rows.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// A registered HTTP endpoint that receives delivered messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub endpoint: String,
    /// Requests per second this worker accepts; bounds the lease batch size
    /// for every queue that routes to it.
    pub rps: i32,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Fields required to create a [`Worker`]; `id`/`created_at` are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub name: String,
    pub endpoint: String,
    pub rps: i32,
}

/// A named binding between a routing pattern and a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Queue {
    pub id: Uuid,
    pub name: String,
    pub binding_pattern: String,
    pub worker_id: Uuid,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

/// Fields required to create a [`Queue`].
#[derive(Debug, Clone)]
pub struct NewQueue {
    pub name: String,
    pub binding_pattern: String,
    pub worker_id: Uuid,
    pub max_retries: i32,
}

impl Default for NewQueue {
    fn default() -> Self {
        Self {
            name: String::new(),
            binding_pattern: String::new(),
            worker_id: Uuid::nil(),
            max_retries: 5,
        }
    }
}

/// An immutable published message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub routing_key: String,
    pub body: Value,
    pub headers: Option<Value>,
    /// Earliest time any queue may lease a delivery for this message.
    pub visible_at: DateTime<Utc>,
    /// Publisher wall-clock time at submission.
    pub occurred_at: DateTime<Utc>,
}

/// Fields required to publish a [`Message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub routing_key: String,
    pub body: Value,
    pub headers: Option<Value>,
    pub visibility: Option<Visibility>,
}

/// How long to delay a message's visibility to dispatchers.
#[derive(Debug, Clone, Copy)]
pub enum Visibility {
    At(DateTime<Utc>),
    DelaySeconds(i64),
}

impl Visibility {
    /// Resolve to an absolute timestamp relative to `now`.
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Visibility::At(at) => at,
            Visibility::DelaySeconds(secs) => now + chrono::Duration::seconds(secs.max(0)),
        }
    }
}

/// The observable lifecycle state of a delivery row. Not persisted
/// directly — derived from `locked`/`acknowledged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Leased,
    Acknowledged,
}

/// A per-queue, per-message unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRow {
    pub id: i64,
    pub queue_id: Uuid,
    pub message_id: Uuid,
    pub acknowledged: bool,
    pub retries: i32,
    pub locked: bool,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl DeliveryRow {
    pub fn state(&self) -> DeliveryState {
        if self.acknowledged {
            DeliveryState::Acknowledged
        } else if self.locked {
            DeliveryState::Leased
        } else {
            DeliveryState::Pending
        }
    }
}

/// A terminal, quarantined delivery whose retry budget was exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRow {
    pub id: i64,
    pub queue_id: Uuid,
    pub message_id: Uuid,
    pub retries: i32,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A leased delivery, joined with the message body the dispatcher needs to
/// make the HTTP call, as returned by [`crate::Store::lease_ready`].
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedDelivery {
    pub delivery: DeliveryRow,
    pub body: Value,
}
