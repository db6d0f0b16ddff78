//! The admin surface: worker/queue lifecycle and `publish`.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Message, NewMessage, NewQueue, NewWorker, Queue, Worker};
use crate::error::BrokerError;
use crate::pattern;
use crate::store::Store;
use crate::validate_queue_name;

/// Registers and deregisters the periodic dispatch tick for a queue with
/// whatever scheduler is in use. This trait is the seam `BrokerAdmin`
/// calls into so queue creation/destruction can (de)register a tick
/// without depending on a concrete scheduler implementation.
/// `broker-daemon` supplies the concrete `tokio::time::interval`-backed
/// implementation.
#[async_trait]
pub trait TickRegistrar: Send + Sync {
    async fn register(&self, queue_id: Uuid);
    async fn deregister(&self, queue_id: Uuid);
}

/// A registrar that does nothing — useful for tests and for admin-only
/// tooling that doesn't run a dispatch loop in-process.
pub struct NoOpTickRegistrar;

#[async_trait]
impl TickRegistrar for NoOpTickRegistrar {
    async fn register(&self, _queue_id: Uuid) {}
    async fn deregister(&self, _queue_id: Uuid) {}
}

/// Worker/queue registration and the `publish` entry point.
pub struct BrokerAdmin<S> {
    store: Arc<S>,
    registrar: Arc<dyn TickRegistrar>,
}

impl<S: Store> BrokerAdmin<S> {
    pub fn new(store: Arc<S>, registrar: Arc<dyn TickRegistrar>) -> Self {
        Self { store, registrar }
    }

    pub async fn create_worker(&self, new: NewWorker) -> Result<Worker, BrokerError> {
        if new.rps <= 0 {
            return Err(BrokerError::InvalidArgument {
                message: format!("rps must be positive, got {}", new.rps),
            });
        }
        self.store.create_worker(new).await.map_err(BrokerError::Store)
    }

    pub async fn delete_worker(&self, worker_id: Uuid) -> Result<bool, BrokerError> {
        // Deregister ticks for every queue this worker owns before the
        // cascade deletes them, so the scheduler never fires against a queue
        // whose storage just disappeared underneath it.
        for queue in self.store.list_queues().await.map_err(BrokerError::Store)? {
            if queue.worker_id == worker_id {
                self.registrar.deregister(queue.id).await;
            }
        }
        self.store
            .delete_worker(worker_id)
            .await
            .map_err(BrokerError::Store)
    }

    pub async fn create_queue(&self, new: NewQueue) -> Result<Queue, BrokerError> {
        validate_queue_name(&new.name)?;

        if new.max_retries < 0 {
            return Err(BrokerError::InvalidArgument {
                message: format!("max_retries must not be negative, got {}", new.max_retries),
            });
        }

        if self
            .store
            .get_queue_by_name(&new.name)
            .await
            .map_err(BrokerError::Store)?
            .is_some()
        {
            return Err(BrokerError::DuplicateQueueName { name: new.name });
        }

        if self
            .store
            .get_worker(new.worker_id)
            .await
            .map_err(BrokerError::Store)?
            .is_none()
        {
            return Err(BrokerError::UnknownWorker {
                worker_id: new.worker_id,
            });
        }

        let queue = self.store.create_queue(new).await.map_err(BrokerError::Store)?;
        self.registrar.register(queue.id).await;
        Ok(queue)
    }

    pub async fn delete_queue(&self, queue_id: Uuid) -> Result<bool, BrokerError> {
        self.registrar.deregister(queue_id).await;
        self.store.delete_queue(queue_id).await.map_err(BrokerError::Store)
    }

    /// Persist a message and fan it out to every queue whose binding pattern
    /// matches its routing key, evaluated against the queue snapshot at the
    /// moment of this call — queues created afterward are not retroactively
    /// notified.
    pub async fn publish(&self, new: NewMessage) -> Result<Message, BrokerError> {
        if self
            .store
            .get_message(new.id)
            .await
            .map_err(BrokerError::Store)?
            .is_some()
        {
            return Err(BrokerError::DuplicateMessageId { message_id: new.id });
        }

        let queues = self.store.list_queues().await.map_err(BrokerError::Store)?;
        let matching: Vec<Queue> = queues
            .into_iter()
            .filter(|q| pattern::matches(&new.routing_key, &q.binding_pattern))
            .collect();

        self.store
            .publish(new, &matching)
            .await
            .map_err(BrokerError::Store)
    }

    pub async fn get_queue(&self, queue_id: Uuid) -> Result<Option<Queue>, BrokerError> {
        self.store.get_queue(queue_id).await.map_err(BrokerError::Store)
    }

    pub async fn list_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        self.store.list_queues().await.map_err(BrokerError::Store)
    }
}
