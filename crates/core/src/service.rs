//! Worker pool.
//!
//! Each worker is a blocking task that owns one [`WorkerContext`] for its
//! whole life and takes batches from a shared queue, one at a time.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{Engine, WorkerContext};
use crate::errors::{DatabaseError, ServiceError};
use crate::models::{MappingRequest, MappingResult};

/// A unit of work for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    SidsToIds(Vec<MappingRequest>),
    IdsToSids(Vec<MappingRequest>),
}

impl Batch {
    pub fn len(&self) -> usize {
        match self {
            Batch::SidsToIds(r) | Batch::IdsToSids(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Job {
    batch: Batch,
    reply: oneshot::Sender<Vec<MappingResult>>,
}

type Queue = Arc<Mutex<mpsc::Receiver<Job>>>;

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Open `workers` contexts and start one worker on each. Store open
    /// failures are reported here, before any worker runs.
    pub fn start(engine: Arc<Engine>, workers: usize) -> Result<Self, DatabaseError> {
        let workers = workers.max(1);
        let contexts = (0..workers)
            .map(|_| WorkerContext::open(engine.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let (tx, rx) = mpsc::channel(workers * 4);
        let queue: Queue = Arc::new(Mutex::new(rx));
        let handles = contexts
            .into_iter()
            .enumerate()
            .map(|(n, ctx)| {
                let queue = queue.clone();
                tokio::task::spawn_blocking(move || run_worker(n, ctx, queue))
            })
            .collect();

        info!(workers, "worker pool started");
        Ok(Self {
            tx,
            workers: handles,
        })
    }

    /// Run `batch` on the next free worker and wait for its results.
    pub async fn submit(&self, batch: Batch) -> Result<Vec<MappingResult>, ServiceError> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(Job { batch, reply })
            .await
            .map_err(|_| ServiceError::ShutDown)?;
        answer.await.map_err(|_| ServiceError::WorkerLost)
    }

    /// Stop taking batches, let the workers finish what is queued, and wait
    /// for them to close their stores.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task failed");
            }
        }
        info!("worker pool stopped");
    }
}

fn run_worker(n: usize, ctx: WorkerContext, queue: Queue) {
    debug!(worker = n, "worker started");
    loop {
        let job = {
            let mut rx = queue.lock().unwrap_or_else(|poisoned| {
                warn!("worker queue mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            rx.blocking_recv()
        };
        let Some(job) = job else {
            break;
        };

        debug!(worker = n, items = job.batch.len(), "processing batch");
        let results = match &job.batch {
            Batch::SidsToIds(requests) => ctx.map_sids_to_ids(requests),
            Batch::IdsToSids(requests) => ctx.map_ids_to_sids(requests),
        };
        if job.reply.send(results).is_err() {
            debug!(worker = n, "caller stopped waiting for batch");
        }
    }
    // Dropping the context closes this worker's store connections.
    drop(ctx);
    debug!(worker = n, "worker stopped");
}
