//! PostgreSQL implementation of the broker's [`Store`] trait.
//!
//! # Database Schema
//!
//! See `migrations/0001_init.sql`. Delivery and dead-letter rows live in two
//! shared tables (`deliveries`, `dead_letters`) keyed by `queue_id`, rather
//! than one pair of tables provisioned per queue — see `DESIGN.md` at the
//! workspace root for the tradeoff this implementation picked.
//!
//! # Concurrency
//!
//! Leasing uses `FOR UPDATE SKIP LOCKED` inside a `WITH ... UPDATE ... FROM`
//! statement so that selection, lock-skip, and the lock-taking update happen
//! as one atomic step — never a separate select-then-update, which would let
//! a second dispatcher observe a row as unlocked mid-transition.
//!
//! # Usage
//!
//! ```rust,ignore
//! use broker_postgres::PgStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/broker").await?;
//! sqlx::migrate!().run(&pool).await?;
//! let store = PgStore::new(pool);
//! ```

use async_trait::async_trait;
use broker_core::{
    AttemptOutcome, DeadLetterRow, DeliveryRow, LeasedDelivery, Message, NewMessage, NewQueue,
    NewWorker, Queue, Resolution, Store, Worker,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn worker_from_row(row: &sqlx::postgres::PgRow) -> Worker {
    Worker {
        id: row.get("id"),
        name: row.get("name"),
        endpoint: row.get("endpoint"),
        rps: row.get("rps"),
        created_at: row.get("created_at"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
    }
}

fn queue_from_row(row: &sqlx::postgres::PgRow) -> Queue {
    Queue {
        id: row.get("id"),
        name: row.get("name"),
        binding_pattern: row.get("binding_pattern"),
        worker_id: row.get("worker_id"),
        max_retries: row.get("max_retries"),
        created_at: row.get("created_at"),
    }
}

fn message_from_row(row: &sqlx::postgres::PgRow) -> Message {
    Message {
        id: row.get("id"),
        routing_key: row.get("routing_key"),
        body: row.get("body"),
        headers: row.get("headers"),
        visible_at: row.get("visible_at"),
        occurred_at: row.get("occurred_at"),
    }
}

fn delivery_from_row(row: &sqlx::postgres::PgRow) -> DeliveryRow {
    DeliveryRow {
        id: row.get("id"),
        queue_id: row.get("queue_id"),
        message_id: row.get("message_id"),
        acknowledged: row.get("acknowledged"),
        retries: row.get("retries"),
        locked: row.get("locked"),
        lease_expires_at: row.get("lease_expires_at"),
        enqueued_at: row.get("enqueued_at"),
        acknowledged_at: row.get("acknowledged_at"),
    }
}

fn dead_letter_from_row(row: &sqlx::postgres::PgRow) -> DeadLetterRow {
    DeadLetterRow {
        id: row.get("id"),
        queue_id: row.get("queue_id"),
        message_id: row.get("message_id"),
        retries: row.get("retries"),
        enqueued_at: row.get("enqueued_at"),
        dead_lettered_at: row.get("dead_lettered_at"),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_worker(&self, new: NewWorker) -> anyhow::Result<Worker> {
        let row = sqlx::query(
            r#"
            INSERT INTO workers (id, name, endpoint, rps)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, endpoint, rps, created_at, last_heartbeat_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.endpoint)
        .bind(new.rps)
        .fetch_one(&self.pool)
        .await?;

        Ok(worker_from_row(&row))
    }

    async fn get_worker(&self, id: Uuid) -> anyhow::Result<Option<Worker>> {
        let row = sqlx::query(
            "SELECT id, name, endpoint, rps, created_at, last_heartbeat_at FROM workers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(worker_from_row))
    }

    async fn delete_worker(&self, id: Uuid) -> anyhow::Result<bool> {
        // Queues referencing this worker cascade via FK; deliveries and
        // dead_letters on those queues cascade a second time from `queues`.
        let result = sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_queue(&self, new: NewQueue) -> anyhow::Result<Queue> {
        let row = sqlx::query(
            r#"
            INSERT INTO queues (id, name, binding_pattern, worker_id, max_retries)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, binding_pattern, worker_id, max_retries, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.binding_pattern)
        .bind(new.worker_id)
        .bind(new.max_retries)
        .fetch_one(&self.pool)
        .await?;

        Ok(queue_from_row(&row))
    }

    async fn get_queue(&self, id: Uuid) -> anyhow::Result<Option<Queue>> {
        let row = sqlx::query(
            "SELECT id, name, binding_pattern, worker_id, max_retries, created_at FROM queues WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(queue_from_row))
    }

    async fn get_queue_by_name(&self, name: &str) -> anyhow::Result<Option<Queue>> {
        let row = sqlx::query(
            "SELECT id, name, binding_pattern, worker_id, max_retries, created_at FROM queues WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(queue_from_row))
    }

    async fn list_queues(&self) -> anyhow::Result<Vec<Queue>> {
        let rows = sqlx::query("SELECT id, name, binding_pattern, worker_id, max_retries, created_at FROM queues")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(queue_from_row).collect())
    }

    async fn delete_queue(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM queues WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn publish(&self, new: NewMessage, matching_queues: &[Queue]) -> anyhow::Result<Message> {
        let mut tx = self.pool.begin().await?;

        let now = Utc::now();
        let visible_at = new.visibility.map(|v| v.resolve(now)).unwrap_or(now);

        let row = sqlx::query(
            r#"
            INSERT INTO messages (id, routing_key, body, headers, visible_at, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, routing_key, body, headers, visible_at, occurred_at
            "#,
        )
        .bind(new.id)
        .bind(&new.routing_key)
        .bind(&new.body)
        .bind(&new.headers)
        .bind(visible_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let message = message_from_row(&row);

        for queue in matching_queues {
            sqlx::query(
                r#"
                INSERT INTO deliveries (queue_id, message_id, enqueued_at)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(queue.id)
            .bind(message.id)
            .bind(visible_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(message)
    }

    async fn get_message(&self, id: Uuid) -> anyhow::Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, routing_key, body, headers, visible_at, occurred_at FROM messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(message_from_row))
    }

    async fn sweep_abandoned(&self, queue_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;

        let Some(max_retries) = sqlx::query_scalar::<_, i32>(
            "SELECT max_retries FROM queues WHERE id = $1 FOR SHARE",
        )
        .bind(queue_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.commit().await?;
            return Ok(0);
        };

        let abandoned = sqlx::query("SELECT id, retries FROM deliveries WHERE queue_id = $1 AND locked = true AND lease_expires_at < $2 FOR UPDATE SKIP LOCKED")
            .bind(queue_id)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

        let count = abandoned.len() as u64;

        for row in abandoned {
            let id: i64 = row.get("id");
            let retries: i32 = row.get("retries");

            if retries >= max_retries {
                sqlx::query(
                    r#"
                    INSERT INTO dead_letters (queue_id, message_id, retries, enqueued_at, dead_lettered_at)
                    SELECT queue_id, message_id, retries, enqueued_at, $2
                    FROM deliveries WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM deliveries WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query(
                    "UPDATE deliveries SET retries = retries + 1, locked = false, lease_expires_at = NULL WHERE id = $1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        if count > 0 {
            debug!(queue_id = %queue_id, recovered = count, "swept abandoned leases");
        }
        Ok(count)
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

        let mut tx = self.pool.begin().await?;
        let lease_expires_at = now + lease_timeout;

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM deliveries
                WHERE queue_id = $1
                  AND acknowledged = false
                  AND locked = false
                  AND enqueued_at <= $2
                ORDER BY enqueued_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE deliveries d
            SET locked = true, lease_expires_at = $4
            FROM claimable
            WHERE d.id = claimable.id
            RETURNING d.id, d.queue_id, d.message_id, d.acknowledged, d.retries,
                      d.locked, d.lease_expires_at, d.enqueued_at, d.acknowledged_at
            "#,
        )
        .bind(queue_id)
        .bind(now)
        .bind(limit)
        .bind(lease_expires_at)
        .fetch_all(&mut *tx)
        .await?;

        let deliveries: Vec<DeliveryRow> = rows.iter().map(delivery_from_row).collect();

        if deliveries.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let message_ids: Vec<Uuid> = deliveries.iter().map(|d| d.message_id).collect();
        let body_rows = sqlx::query("SELECT id, body FROM messages WHERE id = ANY($1)")
            .bind(&message_ids)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        let bodies: std::collections::HashMap<Uuid, serde_json::Value> = body_rows
            .into_iter()
            .map(|r| (r.get::<Uuid, _>("id"), r.get::<serde_json::Value, _>("body")))
            .collect();

        Ok(deliveries
            .into_iter()
            .filter_map(|delivery| {
                bodies.get(&delivery.message_id).cloned().map(|body| LeasedDelivery { delivery, body })
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
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT retries, locked, acknowledged, message_id, enqueued_at FROM deliveries WHERE id = $1 AND queue_id = $2 FOR UPDATE",
        )
        .bind(delivery_id)
        .bind(queue_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(Resolution::AlreadyResolved);
        };

        let locked: bool = row.get("locked");
        let acknowledged: bool = row.get("acknowledged");
        if acknowledged || !locked {
            tx.commit().await?;
            return Ok(Resolution::AlreadyResolved);
        }

        let retries: i32 = row.get("retries");

        match outcome {
            AttemptOutcome::Success => {
                sqlx::query(
                    "UPDATE deliveries SET acknowledged = true, locked = false, lease_expires_at = NULL, acknowledged_at = $2 WHERE id = $1",
                )
                .bind(delivery_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(Resolution::Acknowledged)
            }
            AttemptOutcome::Failure => {
                let max_retries: i32 =
                    sqlx::query_scalar("SELECT max_retries FROM queues WHERE id = $1")
                        .bind(queue_id)
                        .fetch_one(&mut *tx)
                        .await?;

                if retries >= max_retries {
                    let message_id: Uuid = row.get("message_id");
                    let enqueued_at: DateTime<Utc> = row.get("enqueued_at");

                    sqlx::query(
                        r#"
                        INSERT INTO dead_letters (queue_id, message_id, retries, enqueued_at, dead_lettered_at)
                        VALUES ($1, $2, $3, $4, $5)
                        "#,
                    )
                    .bind(queue_id)
                    .bind(message_id)
                    .bind(retries)
                    .bind(enqueued_at)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query("DELETE FROM deliveries WHERE id = $1")
                        .bind(delivery_id)
                        .execute(&mut *tx)
                        .await?;

                    tx.commit().await?;
                    Ok(Resolution::DeadLettered { retries })
                } else {
                    let new_retries = retries + 1;
                    sqlx::query(
                        "UPDATE deliveries SET retries = $2, locked = false, lease_expires_at = NULL WHERE id = $1",
                    )
                    .bind(delivery_id)
                    .bind(new_retries)
                    .execute(&mut *tx)
                    .await?;

                    tx.commit().await?;
                    Ok(Resolution::Retried {
                        retries: new_retries,
                    })
                }
            }
        }
    }

    async fn get_delivery(&self, queue_id: Uuid, delivery_id: i64) -> anyhow::Result<Option<DeliveryRow>> {
        let row = sqlx::query(
            "SELECT id, queue_id, message_id, acknowledged, retries, locked, lease_expires_at, enqueued_at, acknowledged_at FROM deliveries WHERE id = $1 AND queue_id = $2",
        )
        .bind(delivery_id)
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(delivery_from_row))
    }

    async fn list_deliveries(&self, queue_id: Uuid) -> anyhow::Result<Vec<DeliveryRow>> {
        let rows = sqlx::query(
            "SELECT id, queue_id, message_id, acknowledged, retries, locked, lease_expires_at, enqueued_at, acknowledged_at FROM deliveries WHERE queue_id = $1 ORDER BY enqueued_at, id",
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(delivery_from_row).collect())
    }

    async fn list_dead_letters(&self, queue_id: Uuid) -> anyhow::Result<Vec<DeadLetterRow>> {
        let rows = sqlx::query(
            "SELECT id, queue_id, message_id, retries, enqueued_at, dead_lettered_at FROM dead_letters WHERE queue_id = $1 ORDER BY dead_lettered_at, id",
        )
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(dead_letter_from_row).collect())
    }
}
