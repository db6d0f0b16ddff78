//! # Broker Core
//!
//! A persistent, topic-routed message broker's delivery engine: the part that
//! fans a published message onto matching queues, leases pending deliveries
//! under concurrency, invokes workers over HTTP, and resolves each lease into
//! acknowledgement, retry, or dead-letter placement.
//!
//! ## Architecture
//!
//! ```text
//! publish()
//!     │
//!     ▼
//! Store::publish (message insert + router fan-out, one transaction)
//!     │
//!     ▼
//! deliveries (pending, per matching queue)
//!     │
//!     ▼ tick(queue_id)                      [Scheduler, once per second]
//! Dispatcher::tick
//!     ├─► sweep_abandoned  (reclaim stranded leases)
//!     ├─► Store::lease_ready (atomic SKIP LOCKED batch, size = worker.rps)
//!     ├─► WorkerClient::deliver (HTTP POST, concurrent up to rps)
//!     └─► Store::resolve (ack / retry / dead-letter, per row)
//! ```
//!
//! ## Key Invariants
//!
//! 1. A delivery row is leased by at most one dispatcher at a time.
//! 2. `retries` only ever increases, and dead-lettering happens exactly once
//!    the retry budget (`max_retries`) is exhausted.
//! 3. `publish` is all-or-nothing: the message and every matching delivery
//!    row are persisted together, or none of them are.
//! 4. A lease that is never resolved becomes reclaimable after its timeout
//!    elapses; reclaiming it counts as one failed attempt.
//!
//! This crate defines the domain types and the [`Store`] / [`WorkerClient`]
//! contracts plus the [`Dispatcher`] that drives them. Concrete storage
//! (`broker-postgres`, `broker-memory`) and HTTP (`broker-http`)
//! implementations live in sibling crates.

mod admin;
mod dispatch;
mod domain;
mod error;
mod pattern;
mod rate_limit;
mod store;


pub use admin::{BrokerAdmin, TickRegistrar};
pub use dispatch::{Dispatcher, DispatcherConfig, TickReport, WorkerClient};
pub use domain::{
    DeadLetterRow, DeliveryRow, DeliveryState, LeasedDelivery, Message, NewMessage, NewQueue,
    NewWorker, Queue, Visibility, Worker,
};
pub use error::BrokerError;
pub use pattern::matches;
pub use rate_limit::RateLimiter;
pub use store::{AttemptOutcome, Resolution, Store};

/// Default lease timeout, in seconds: how long a dispatcher may hold a
/// delivery row locked before another tick considers it abandoned.
pub const DEFAULT_LEASE_TIMEOUT_SECS: i64 = 60;

/// Default per-attempt HTTP timeout, in seconds. Always kept below
/// [`DEFAULT_LEASE_TIMEOUT_SECS`] so a single slow attempt cannot outlive its
/// own lease.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Validate a queue name as an identifier: non-empty, starts with a letter
/// or underscore, and contains only alphanumerics and underscores
/// thereafter.
///
/// Queue names are not substituted into SQL in this implementation (delivery
/// and dead-letter storage is unified, keyed by `queue_id`), but the rule is
/// still enforced: the name is a stable external handle appearing in logs and
/// metrics, and keeping it identifier-safe avoids re-deriving this invariant
/// if per-queue storage partitioning is added later.
pub fn validate_queue_name(name: &str) -> Result<(), BrokerError> {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(BrokerError::InvalidIdentifier {
                name: name.to_string(),
            })
        }
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BrokerError::InvalidIdentifier {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod validate_name_tests {
    use super::*;

    #[test]
    fn accepts_valid_identifiers() {
        assert!(validate_queue_name("order_created").is_ok());
        assert!(validate_queue_name("_private").is_ok());
        assert!(validate_queue_name("a").is_ok());
    }

    #[test]
    fn rejects_empty_and_unsafe_names() {
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("1queue").is_err());
        assert!(validate_queue_name("order-created").is_err());
        assert!(validate_queue_name("order;drop table").is_err());
        assert!(validate_queue_name("order created").is_err());
    }
}
