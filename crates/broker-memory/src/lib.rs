//! An in-memory [`Store`] implementation for tests and local development.
//!
//! Mirrors the locking semantics `broker-postgres` gets from
//! `FOR UPDATE SKIP LOCKED` by serializing every operation behind a single
//! mutex — correct, not concurrent, which is exactly the tradeoff wanted for
//! a test double.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use broker_core::{
    AttemptOutcome, DeadLetterRow, DeliveryRow, LeasedDelivery, Message, NewMessage, NewQueue,
    NewWorker, Queue, Resolution, Store, Worker,
};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    workers: HashMap<Uuid, Worker>,
    queues: HashMap<Uuid, Queue>,
    messages: HashMap<Uuid, Message>,
    deliveries: HashMap<Uuid, Vec<DeliveryRow>>,
    dead_letters: HashMap<Uuid, Vec<DeadLetterRow>>,
}

/// In-memory [`Store`]. Cheap to construct; one instance per test, or share
/// via `Arc` across "multiple dispatcher" concurrency tests.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    next_delivery_id: AtomicI64,
    next_dead_letter_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            next_delivery_id: AtomicI64::new(1),
            next_dead_letter_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_worker(&self, new: NewWorker) -> anyhow::Result<Worker> {
        let worker = Worker {
            id: Uuid::new_v4(),
            name: new.name,
            endpoint: new.endpoint,
            rps: new.rps,
            created_at: Utc::now(),
            last_heartbeat_at: None,
        };
        let mut state = self.state.lock().unwrap();
        state.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn get_worker(&self, id: Uuid) -> anyhow::Result<Option<Worker>> {
        Ok(self.state.lock().unwrap().workers.get(&id).cloned())
    }

    async fn delete_worker(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        let existed = state.workers.remove(&id).is_some();
        if existed {
            let dependent: Vec<Uuid> = state
                .queues
                .values()
                .filter(|q| q.worker_id == id)
                .map(|q| q.id)
                .collect();
            for queue_id in dependent {
                state.queues.remove(&queue_id);
                state.deliveries.remove(&queue_id);
                state.dead_letters.remove(&queue_id);
            }
        }
        Ok(existed)
    }

    async fn create_queue(&self, new: NewQueue) -> anyhow::Result<Queue> {
        let queue = Queue {
            id: Uuid::new_v4(),
            name: new.name,
            binding_pattern: new.binding_pattern,
            worker_id: new.worker_id,
            max_retries: new.max_retries,
            created_at: Utc::now(),
        };
        let mut state = self.state.lock().unwrap();
        state.deliveries.insert(queue.id, Vec::new());
        state.dead_letters.insert(queue.id, Vec::new());
        state.queues.insert(queue.id, queue.clone());
        Ok(queue)
    }

    async fn get_queue(&self, id: Uuid) -> anyhow::Result<Option<Queue>> {
        Ok(self.state.lock().unwrap().queues.get(&id).cloned())
    }

    async fn get_queue_by_name(&self, name: &str) -> anyhow::Result<Option<Queue>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .queues
            .values()
            .find(|q| q.name == name)
            .cloned())
    }

    async fn list_queues(&self) -> anyhow::Result<Vec<Queue>> {
        Ok(self.state.lock().unwrap().queues.values().cloned().collect())
    }

    async fn delete_queue(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        let existed = state.queues.remove(&id).is_some();
        state.deliveries.remove(&id);
        state.dead_letters.remove(&id);
        Ok(existed)
    }

    async fn publish(&self, new: NewMessage, matching_queues: &[Queue]) -> anyhow::Result<Message> {
        let mut state = self.state.lock().unwrap();

        if state.messages.contains_key(&new.id) {
            anyhow::bail!("message id {} already exists", new.id);
        }

        let now = Utc::now();
        let visible_at = new.visibility.map(|v| v.resolve(now)).unwrap_or(now);

        let message = Message {
            id: new.id,
            routing_key: new.routing_key,
            body: new.body,
            headers: new.headers,
            visible_at,
            occurred_at: now,
        };

        for queue in matching_queues {
            let rows = state
                .deliveries
                .entry(queue.id)
                .or_insert_with(Vec::new);
            rows.push(DeliveryRow {
                id: self.next_delivery_id.fetch_add(1, Ordering::SeqCst),
                queue_id: queue.id,
                message_id: message.id,
                acknowledged: false,
                retries: 0,
                locked: false,
                lease_expires_at: None,
                enqueued_at: visible_at,
                acknowledged_at: None,
            });
        }

        state.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: Uuid) -> anyhow::Result<Option<Message>> {
        Ok(self.state.lock().unwrap().messages.get(&id).cloned())
    }

    async fn sweep_abandoned(&self, queue_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        let max_retries = match state.queues.get(&queue_id) {
            Some(q) => q.max_retries,
            None => return Ok(0),
        };

        let mut recovered = 0u64;
        let mut new_dead_letters = Vec::new();

        if let Some(rows) = state.deliveries.get_mut(&queue_id) {
            for row in rows.iter_mut() {
                let abandoned = row.locked
                    && row
                        .lease_expires_at
                        .map(|expires| expires < now)
                        .unwrap_or(false);
                if !abandoned {
                    continue;
                }
                recovered += 1;
                if row.retries >= max_retries {
                    new_dead_letters.push((row.id, row.message_id, row.retries, row.enqueued_at));
                } else {
                    row.locked = false;
                    row.lease_expires_at = None;
                    row.retries += 1;
                }
            }
            if !new_dead_letters.is_empty() {
                let dlq_ids: std::collections::HashSet<i64> =
                    new_dead_letters.iter().map(|(id, ..)| *id).collect();
                rows.retain(|row| !dlq_ids.contains(&row.id));
            }
        }

        if !new_dead_letters.is_empty() {
            let dlq = state.dead_letters.entry(queue_id).or_insert_with(Vec::new);
            for (_, message_id, retries, enqueued_at) in new_dead_letters {
                dlq.push(DeadLetterRow {
                    id: self.next_dead_letter_id.fetch_add(1, Ordering::SeqCst),
                    queue_id,
                    message_id,
                    retries,
                    enqueued_at,
                    dead_lettered_at: now,
                });
            }
        }

        Ok(recovered)
    }

    async fn lease_ready(
        &self,
        queue_id: Uuid,
        limit: i64,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<LeasedDelivery>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().unwrap();
        let limit = limit as usize;

        let mut candidate_ids: Vec<i64> = match state.deliveries.get(&queue_id) {
            Some(rows) => rows
                .iter()
                .filter(|r| !r.acknowledged && !r.locked && r.enqueued_at <= now)
                .map(|r| r.id)
                .collect(),
            None => return Ok(Vec::new()),
        };

        // Ordering: enqueued_at ascending, ties by id ascending.
        {
            let rows = state.deliveries.get(&queue_id).unwrap();
            let by_id: HashMap<i64, DateTime<Utc>> =
                rows.iter().map(|r| (r.id, r.enqueued_at)).collect();
            candidate_ids.sort_by(|a, b| by_id[a].cmp(&by_id[b]).then(a.cmp(b)));
        }
        candidate_ids.truncate(limit);

        let lease_expires_at = now + lease_timeout;
        let mut leased = Vec::with_capacity(candidate_ids.len());

        let rows = state.deliveries.get_mut(&queue_id).unwrap();
        for row in rows.iter_mut() {
            if candidate_ids.contains(&row.id) {
                row.locked = true;
                row.lease_expires_at = Some(lease_expires_at);
                leased.push(row.clone());
            }
        }

        let messages = &state.messages;
        Ok(leased
            .into_iter()
            .filter_map(|delivery| {
                messages.get(&delivery.message_id).map(|m| LeasedDelivery {
                    delivery,
                    body: m.body.clone(),
                })
            })
            .collect())
    }

    async fn resolve(
        &self,
        queue_id: Uuid,
        delivery_id: i64,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Resolution> {
        let mut state = self.state.lock().unwrap();
        let max_retries = match state.queues.get(&queue_id) {
            Some(q) => q.max_retries,
            None => anyhow::bail!("queue {queue_id} does not exist"),
        };

        let rows = state
            .deliveries
            .get_mut(&queue_id)
            .ok_or_else(|| anyhow::anyhow!("queue {queue_id} has no delivery storage"))?;

        let Some(pos) = rows.iter().position(|r| r.id == delivery_id) else {
            return Ok(Resolution::AlreadyResolved);
        };

        if rows[pos].acknowledged || !rows[pos].locked {
            return Ok(Resolution::AlreadyResolved);
        }

        match outcome {
            AttemptOutcome::Success => {
                rows[pos].acknowledged = true;
                rows[pos].locked = false;
                rows[pos].lease_expires_at = None;
                rows[pos].acknowledged_at = Some(now);
                Ok(Resolution::Acknowledged)
            }
            AttemptOutcome::Failure => {
                if rows[pos].retries >= max_retries {
                    let row = rows.remove(pos);
                    let retries = row.retries;
                    state
                        .dead_letters
                        .entry(queue_id)
                        .or_insert_with(Vec::new)
                        .push(DeadLetterRow {
                            id: self.next_dead_letter_id.fetch_add(1, Ordering::SeqCst),
                            queue_id,
                            message_id: row.message_id,
                            retries,
                            enqueued_at: row.enqueued_at,
                            dead_lettered_at: now,
                        });
                    Ok(Resolution::DeadLettered { retries })
                } else {
                    rows[pos].retries += 1;
                    rows[pos].locked = false;
                    rows[pos].lease_expires_at = None;
                    Ok(Resolution::Retried {
                        retries: rows[pos].retries,
                    })
                }
            }
        }
    }

    async fn get_delivery(&self, queue_id: Uuid, delivery_id: i64) -> anyhow::Result<Option<DeliveryRow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .deliveries
            .get(&queue_id)
            .and_then(|rows| rows.iter().find(|r| r.id == delivery_id).cloned()))
    }

    async fn list_deliveries(&self, queue_id: Uuid) -> anyhow::Result<Vec<DeliveryRow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .deliveries
            .get(&queue_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_dead_letters(&self, queue_id: Uuid) -> anyhow::Result<Vec<DeadLetterRow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .dead_letters
            .get(&queue_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::{NewQueue, NewWorker, Visibility};

    async fn setup() -> (MemoryStore, Worker, Queue) {
        let store = MemoryStore::new();
        let worker = store
            .create_worker(NewWorker {
                name: "w".into(),
                endpoint: "http://example.invalid/hook".into(),
                rps: 10,
            })
            .await
            .unwrap();
        let queue = store
            .create_queue(NewQueue {
                name: "orders".into(),
                binding_pattern: "order.*".into(),
                worker_id: worker.id,
                max_retries: 3,
            })
            .await
            .unwrap();
        (store, worker, queue)
    }

    #[tokio::test]
    async fn lease_then_ack_roundtrip() {
        let (store, _worker, queue) = setup().await;
        let msg = store
            .publish(
                NewMessage {
                    id: Uuid::new_v4(),
                    routing_key: "order.created".into(),
                    body: serde_json::json!({"n": 1}),
                    headers: None,
                    visibility: None,
                },
                std::slice::from_ref(&queue),
            )
            .await
            .unwrap();

        let leased = store
            .lease_ready(queue.id, 10, Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].delivery.message_id, msg.id);

        let resolution = store
            .resolve(
                queue.id,
                leased[0].delivery.id,
                AttemptOutcome::Success,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Acknowledged);

        let leased_again = store
            .lease_ready(queue.id, 10, Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        assert!(leased_again.is_empty());
    }

    #[tokio::test]
    async fn retry_then_dead_letter() {
        let (store, _worker, queue) = setup().await;
        store
            .publish(
                NewMessage {
                    id: Uuid::new_v4(),
                    routing_key: "order.created".into(),
                    body: serde_json::json!({}),
                    headers: None,
                    visibility: None,
                },
                std::slice::from_ref(&queue),
            )
            .await
            .unwrap();

        for expected_retries in 0..=queue.max_retries {
            let leased = store
                .lease_ready(queue.id, 10, Duration::seconds(60), Utc::now())
                .await
                .unwrap();
            assert_eq!(leased.len(), 1, "attempt at retries={expected_retries}");
            let resolution = store
                .resolve(
                    queue.id,
                    leased[0].delivery.id,
                    AttemptOutcome::Failure,
                    Utc::now(),
                )
                .await
                .unwrap();
            if expected_retries < queue.max_retries {
                assert_eq!(
                    resolution,
                    Resolution::Retried {
                        retries: expected_retries + 1
                    }
                );
            } else {
                assert_eq!(
                    resolution,
                    Resolution::DeadLettered {
                        retries: expected_retries
                    }
                );
            }
        }

        let dlq = store.list_dead_letters(queue.id).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].retries, queue.max_retries);
        assert!(store.list_deliveries(queue.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delayed_visibility_is_respected() {
        let (store, _worker, queue) = setup().await;
        store
            .publish(
                NewMessage {
                    id: Uuid::new_v4(),
                    routing_key: "order.created".into(),
                    body: serde_json::json!({}),
                    headers: None,
                    visibility: Some(Visibility::DelaySeconds(10)),
                },
                std::slice::from_ref(&queue),
            )
            .await
            .unwrap();

        let leased_now = store
            .lease_ready(queue.id, 10, Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        assert!(leased_now.is_empty());

        let leased_later = store
            .lease_ready(
                queue.id,
                10,
                Duration::seconds(60),
                Utc::now() + Duration::seconds(11),
            )
            .await
            .unwrap();
        assert_eq!(leased_later.len(), 1);
    }

    #[tokio::test]
    async fn abandoned_lease_is_recovered() {
        let (store, _worker, queue) = setup().await;
        store
            .publish(
                NewMessage {
                    id: Uuid::new_v4(),
                    routing_key: "order.created".into(),
                    body: serde_json::json!({}),
                    headers: None,
                    visibility: None,
                },
                std::slice::from_ref(&queue),
            )
            .await
            .unwrap();

        let leased = store
            .lease_ready(queue.id, 10, Duration::seconds(0), Utc::now())
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        // Lease timeout was zero, so it's already "expired" relative to now.
        let recovered = store.sweep_abandoned(queue.id, Utc::now()).await.unwrap();
        assert_eq!(recovered, 1);

        let rows = store.list_deliveries(queue.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].locked);
        assert_eq!(rows[0].retries, 1);
    }
}
