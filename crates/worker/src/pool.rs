//! Fixed-size pool of allocation workers.

use std::sync::Arc;
use std::time::Duration;

use allocation::Allocator;
use stock_store::StockStore;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::handler::handle_payload;
use crate::reply::Reply;

/// Worker pool sizing and deadlines.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Jobs buffered before [`WorkerPool::submit`] starts waiting.
    pub queue_capacity: usize,
    pub allocation_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            allocation_timeout: Duration::from_secs(5),
        }
    }
}

struct Job {
    payload: String,
    reply: oneshot::Sender<Reply>,
}

/// Runs allocation requests on a fixed number of tokio tasks.
///
/// Workers pull from one shared bounded queue, so a slow allocation only
/// occupies its own worker. Each job is answered exactly once through its
/// reply channel.
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.workers` workers sharing `allocator`.
    pub fn spawn<S: StockStore + 'static>(
        allocator: Arc<Allocator<S>>,
        config: PoolConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    allocator.clone(),
                    receiver.clone(),
                    config.allocation_timeout,
                ))
            })
            .collect();

        tracing::info!(
            workers = config.workers.max(1),
            queue_capacity = config.queue_capacity.max(1),
            "worker pool started"
        );
        Self { sender, workers }
    }

    /// Queues a raw JSON payload and waits for its reply.
    pub async fn submit(&self, payload: String) -> Reply {
        let (reply, answer) = oneshot::channel();
        if self.sender.send(Job { payload, reply }).await.is_err() {
            return Reply::unavailable();
        }
        answer.await.unwrap_or_else(|_| Reply::unavailable())
    }

    /// Stops accepting jobs, lets queued jobs finish and waits for every
    /// worker to exit.
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "worker task failed");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn run_worker<S: StockStore>(
    worker_id: usize,
    allocator: Arc<Allocator<S>>,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    allocation_timeout: Duration,
) {
    loop {
        // The queue lock is released as soon as a job is taken.
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        metrics::gauge!("allocation_workers_busy").increment(1.0);
        let reply = handle_payload(&allocator, &job.payload, allocation_timeout).await;
        metrics::gauge!("allocation_workers_busy").decrement(1.0);

        if job.reply.send(reply).is_err() {
            tracing::debug!(worker_id, "requester went away before the reply was ready");
        }
    }
    tracing::debug!(worker_id, "worker exiting");
}
