//! Integration tests against a real PostgreSQL instance, covering the
//! at-least-once, retry-budget, and lease-concurrency behaviors the store
//! is required to provide.
//!
//! Spins up Postgres via `testcontainers`; requires a working Docker/Podman
//! daemon. Run with `cargo test -p broker-postgres -- --ignored` if your
//! environment doesn't run containers by default.

use std::sync::Arc;

use broker_core::{
    AttemptOutcome, NewMessage, NewQueue, NewWorker, Resolution, Store, Visibility,
};
use broker_postgres::PgStore;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

async fn test_store() -> (PgStore, ContainerAsync<Postgres>) {
    let container = Postgres::default().start().await.expect("start postgres container");
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("container port");
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPool::connect(&url).await.expect("connect to postgres");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");

    (PgStore::new(pool), container)
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn happy_path_acks_single_delivery() {
    let (store, _container) = test_store().await;

    let worker = store
        .create_worker(NewWorker {
            name: "w".into(),
            endpoint: "http://worker.invalid/hook".into(),
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
    assert_eq!(leased[0].body, serde_json::json!({"n": 1}));

    let resolution = store
        .resolve(queue.id, leased[0].delivery.id, AttemptOutcome::Success, Utc::now())
        .await
        .unwrap();
    assert_eq!(resolution, Resolution::Acknowledged);

    assert!(store
        .lease_ready(queue.id, 10, Duration::seconds(60), Utc::now())
        .await
        .unwrap()
        .is_empty());
    assert!(store.list_dead_letters(queue.id).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn retry_exhaustion_moves_to_dead_letter_with_exact_retry_count() {
    let (store, _container) = test_store().await;

    let worker = store
        .create_worker(NewWorker {
            name: "w".into(),
            endpoint: "http://worker.invalid/hook".into(),
            rps: 10,
        })
        .await
        .unwrap();
    let queue = store
        .create_queue(NewQueue {
            name: "orders".into(),
            binding_pattern: "order.*".into(),
            worker_id: worker.id,
            max_retries: 2,
        })
        .await
        .unwrap();

    let msg_id = Uuid::new_v4();
    store
        .publish(
            NewMessage {
                id: msg_id,
                routing_key: "order.created".into(),
                body: serde_json::json!({}),
                headers: None,
                visibility: None,
            },
            std::slice::from_ref(&queue),
        )
        .await
        .unwrap();

    for _ in 0..=queue.max_retries {
        let leased = store
            .lease_ready(queue.id, 10, Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        store
            .resolve(queue.id, leased[0].delivery.id, AttemptOutcome::Failure, Utc::now())
            .await
            .unwrap();
    }

    let dlq = store.list_dead_letters(queue.id).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].message_id, msg_id);
    assert_eq!(dlq[0].retries, queue.max_retries);
    assert!(store.list_deliveries(queue.id).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn abandoned_lease_is_swept_and_counts_as_a_failed_attempt() {
    let (store, _container) = test_store().await;

    let worker = store
        .create_worker(NewWorker {
            name: "w".into(),
            endpoint: "http://worker.invalid/hook".into(),
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

    // Lease with a zero-second timeout so it's immediately "abandoned".
    let leased = store
        .lease_ready(queue.id, 10, Duration::seconds(0), Utc::now())
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);

    let recovered = store.sweep_abandoned(queue.id, Utc::now()).await.unwrap();
    assert_eq!(recovered, 1);

    let rows = store.list_deliveries(queue.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].locked);
    assert_eq!(rows[0].retries, 1);
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn concurrent_lease_attempts_never_double_claim_a_row() {
    let (store, _container) = test_store().await;
    let store = Arc::new(store);

    let worker = store
        .create_worker(NewWorker {
            name: "w".into(),
            endpoint: "http://worker.invalid/hook".into(),
            rps: 50,
        })
        .await
        .unwrap();
    let queue = store
        .create_queue(NewQueue {
            name: "orders".into(),
            binding_pattern: "order.*".into(),
            worker_id: worker.id,
            max_retries: 1,
        })
        .await
        .unwrap();

    for _ in 0..100 {
        store
            .publish(
                NewMessage {
                    id: Uuid::new_v4(),
                    routing_key: "order.created".into(),
                    body: serde_json::json!({}),
                    headers: None,
                    visibility: Some(Visibility::DelaySeconds(0)),
                },
                std::slice::from_ref(&queue),
            )
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..2 {
        let store = Arc::clone(&store);
        let queue_id = queue.id;
        handles.push(tokio::spawn(async move {
            store
                .lease_ready(queue_id, 50, Duration::seconds(60), Utc::now())
                .await
                .unwrap()
        }));
    }

    let mut all_ids = std::collections::HashSet::new();
    let mut total = 0usize;
    for handle in handles {
        let leased = handle.await.unwrap();
        total += leased.len();
        for item in leased {
            assert!(all_ids.insert(item.delivery.id), "delivery leased twice");
        }
    }

    assert_eq!(total, 100);
}
