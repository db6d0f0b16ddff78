//! Operational entry point. Thin by design: loads configuration, wires the
//! Postgres store, HTTP worker client, and in-process scheduler together,
//! and exposes the admin surface as CLI subcommands.

mod config;
mod scheduler;

use std::sync::Arc;

use anyhow::Context;
use broker_core::{BrokerAdmin, Dispatcher, DispatcherConfig, NewMessage, NewQueue, NewWorker, Visibility};
use broker_http::ReqwestWorkerClient;
use broker_postgres::PgStore;
use clap::{Parser, Subcommand};
use config::Config;
use scheduler::TickScheduler;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "broker-daemon", about = "Topic-routed message broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch scheduler for every registered queue until interrupted.
    Serve,
    /// Register a new worker endpoint.
    CreateWorker {
        #[arg(long)]
        name: String,
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value_t = 10)]
        rps: i32,
    },
    /// Bind a routing pattern to a worker, creating a queue.
    CreateQueue {
        #[arg(long)]
        name: String,
        #[arg(long)]
        pattern: String,
        #[arg(long)]
        worker_id: Uuid,
        #[arg(long, default_value_t = 5)]
        max_retries: i32,
    },
    /// Publish a message body (as a JSON string) under a routing key.
    Publish {
        #[arg(long)]
        routing_key: String,
        #[arg(long)]
        body: String,
        #[arg(long)]
        delay_seconds: Option<i64>,
    },
    /// List every registered queue.
    ListQueues,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the database")?;
    sqlx::migrate!("../broker-postgres/migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let store = Arc::new(PgStore::new(pool));
    let client = Arc::new(ReqwestWorkerClient::new(config.http_timeout)?);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        client,
        DispatcherConfig::with_lease_timeout(config.lease_timeout),
    ));
    let scheduler = Arc::new(TickScheduler::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        config.tick_interval,
    ));
    let admin = BrokerAdmin::new(Arc::clone(&store), Arc::clone(&scheduler));

    let cli = Cli::parse();
    match cli.command {
        Command::Serve => {
            scheduler.start_existing_queues().await?;
            info!("broker-daemon scheduler running");
            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            info!("shutting down");
        }
        Command::CreateWorker { name, endpoint, rps } => {
            let worker = admin.create_worker(NewWorker { name, endpoint, rps }).await?;
            println!("{} {}", worker.id, worker.name);
        }
        Command::CreateQueue {
            name,
            pattern,
            worker_id,
            max_retries,
        } => {
            let queue = admin
                .create_queue(NewQueue {
                    name,
                    binding_pattern: pattern,
                    worker_id,
                    max_retries,
                })
                .await?;
            println!("{} {}", queue.id, queue.name);
        }
        Command::Publish {
            routing_key,
            body,
            delay_seconds,
        } => {
            let body = serde_json::from_str(&body).context("body must be valid JSON")?;
            let message = admin
                .publish(NewMessage {
                    id: Uuid::new_v4(),
                    routing_key,
                    body,
                    headers: None,
                    visibility: delay_seconds.map(Visibility::DelaySeconds),
                })
                .await?;
            println!("{}", message.id);
        }
        Command::ListQueues => {
            for queue in admin.list_queues().await? {
                println!("{} {} -> {}", queue.id, queue.name, queue.binding_pattern);
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
