//! Bounded worker pool.
//!
//! A fixed number of workers pull from one task queue and push results into one result
//! channel. Workers share nothing but the queue; the caller consumes results as they land.
//! Cancelling the token stops workers from taking new tasks; tasks already taken finish.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker count must be at least 1")]
    NoWorkers,

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// What the pool did with the submitted items.
#[derive(Debug)]
pub struct PoolReport<R> {
    /// One entry per processed item, in completion order.
    pub results: Vec<R>,
    /// Items never handed to a worker because of cancellation.
    pub not_started: usize,
}

/// A fixed-size pool that maps a work function over a list of items.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    workers: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize, cancel: CancellationToken) -> PoolResult<Self> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        Ok(Self {
            name,
            workers,
            cancel,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `work` over every item with at most `workers` in flight.
    ///
    /// `on_result` is called on the caller's task, once per finished item, in completion order.
    pub async fn run<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        work: F,
        mut on_result: impl FnMut(&R),
    ) -> PoolResult<PoolReport<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let total = items.len();
        let (task_tx, task_rx) = mpsc::channel::<T>(total.max(1));
        for item in items {
            // Capacity covers every item, so this never waits.
            if task_tx.send(item).await.is_err() {
                break;
            }
        }
        drop(task_tx);

        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<R>(self.workers);
        let work = Arc::new(work);
        let mut join_set = JoinSet::new();

        for worker_id in 0..self.workers.min(total.max(1)) {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let work = work.clone();
            let cancel = self.cancel.clone();
            let span = info_span!("worker", pool = self.name, worker_id);

            join_set.spawn(
                async move {
                    loop {
                        if cancel.is_cancelled() {
                            debug!("Worker stopping on shutdown");
                            break;
                        }
                        let next = {
                            let mut guard = task_rx.lock().await;
                            guard.recv().await
                        };
                        let Some(item) = next else { break };
                        let result = work(item).await;
                        if result_tx.send(result).await.is_err() {
                            break;
                        }
                    }
                }
                .instrument(span),
            );
        }
        drop(result_tx);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = result_rx.recv().await {
            on_result(&result);
            results.push(result);
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!(pool = self.name, "Worker task failed: {}", e);
                return Err(PoolError::TaskJoin(e.to_string()));
            }
        }

        let not_started = total - results.len();
        Ok(PoolReport {
            results,
            not_started,
        })
    }
}
