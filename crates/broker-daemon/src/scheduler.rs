//! The concrete scheduler: one `tokio::time::interval`-driven task per
//! queue, calling `Dispatcher::tick` on each firing, in-process rather
//! than via external cron.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker_core::{Dispatcher, Store, TickRegistrar, WorkerClient};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

pub struct TickScheduler<S, C> {
    store: Arc<S>,
    dispatcher: Arc<Dispatcher<S, C>>,
    tick_interval: Duration,
    handles: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl<S, C> TickScheduler<S, C>
where
    S: Store + 'static,
    C: WorkerClient + 'static,
{
    pub fn new(store: Arc<S>, dispatcher: Arc<Dispatcher<S, C>>, tick_interval: Duration) -> Self {
        Self {
            store,
            dispatcher,
            tick_interval,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Start a tick task for every queue already present in the store.
    /// Called once at daemon startup, after any queues left registered
    /// from a previous process have resumed their normal lifecycle.
    pub async fn start_existing_queues(&self) -> anyhow::Result<()> {
        for queue in self.store.list_queues().await? {
            self.register(queue.id).await;
        }
        Ok(())
    }

    fn spawn_tick_loop(&self, queue_id: Uuid) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let tick_interval = self.tick_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            loop {
                interval.tick().await;

                let queue = match store.get_queue(queue_id).await {
                    Ok(Some(queue)) => queue,
                    Ok(None) => {
                        warn!(%queue_id, "queue no longer exists, stopping tick loop");
                        return;
                    }
                    Err(err) => {
                        error!(%queue_id, error = %err, "failed to load queue for tick");
                        continue;
                    }
                };

                let worker = match store.get_worker(queue.worker_id).await {
                    Ok(Some(worker)) => worker,
                    Ok(None) => {
                        warn!(%queue_id, worker_id = %queue.worker_id, "worker no longer exists, stopping tick loop");
                        return;
                    }
                    Err(err) => {
                        error!(%queue_id, error = %err, "failed to load worker for tick");
                        continue;
                    }
                };

                if let Err(err) = dispatcher.tick(&queue, &worker).await {
                    error!(%queue_id, error = %err, "dispatcher tick failed");
                }
            }
        })
    }
}

#[async_trait]
impl<S, C> TickRegistrar for TickScheduler<S, C>
where
    S: Store + 'static,
    C: WorkerClient + 'static,
{
    async fn register(&self, queue_id: Uuid) {
        let handle = self.spawn_tick_loop(queue_id);
        let mut handles = self.handles.lock().await;
        if let Some(previous) = handles.insert(queue_id, handle) {
            previous.abort();
        }
    }

    async fn deregister(&self, queue_id: Uuid) {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.remove(&queue_id) {
            handle.abort();
        }
    }
}
