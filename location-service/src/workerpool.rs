//! Bounded queue of location reports drained by a fixed set of workers.
//!
//! Producers get backpressure from the queue while the pool is open. Once the
//! pool's token is cancelled `add_task` returns at once with
//! [`PoolError::Closed`], the queue stops accepting, and workers finish what
//! is buffered until it is empty or the drain timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::models::CourierLocation;
use crate::service::LocationSaver;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,
}

#[derive(Debug, Clone, Args)]
pub struct PoolArgs {
    #[arg(long, env = "LOCATION_POOL_WORKERS", default_value_t = 10)]
    pub workers: usize,

    #[arg(long, env = "LOCATION_POOL_QUEUE_SIZE", default_value_t = 10_000)]
    pub queue_size: usize,

    /// Upper bound on draining buffered reports at shutdown.
    #[arg(long, env = "LOCATION_POOL_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,
}

impl PoolArgs {
    pub fn config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            queue_size: self.queue_size,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Reports still queued when the workers stopped.
    pub residual: usize,
    pub timed_out: bool,
}

type Queue = Arc<Mutex<mpsc::Receiver<CourierLocation>>>;

/// Submission side; cheap to clone into request handlers.
#[derive(Clone)]
pub struct LocationPool {
    sender: mpsc::Sender<CourierLocation>,
    closing: CancellationToken,
}

/// Owns the worker tasks; consumed by [`PoolWorkers::shutdown`].
pub struct PoolWorkers {
    workers: Vec<JoinHandle<()>>,
    queue: Queue,
    closing: CancellationToken,
    drain_timeout: Duration,
}

impl LocationPool {
    /// Starts the workers. Cancelling `shutdown` (or calling
    /// [`PoolWorkers::shutdown`]) closes the pool.
    pub fn start(
        saver: Arc<dyn LocationSaver>,
        config: PoolConfig,
        shutdown: &CancellationToken,
    ) -> (Self, PoolWorkers) {
        let workers = config.workers.max(1);
        let queue_size = config.queue_size.max(1);
        let (sender, receiver) = mpsc::channel(queue_size);
        let queue: Queue = Arc::new(Mutex::new(receiver));
        let closing = shutdown.child_token();

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    queue.clone(),
                    saver.clone(),
                    closing.clone(),
                ))
            })
            .collect();

        info!(workers, queue_size, "Location worker pool started");

        (
            Self {
                sender,
                closing: closing.clone(),
            },
            PoolWorkers {
                workers: handles,
                queue,
                closing,
                drain_timeout: config.drain_timeout,
            },
        )
    }

    /// Waits for queue space while open; never waits once closing.
    pub async fn add_task(&self, location: CourierLocation) -> Result<(), PoolError> {
        if self.closing.is_cancelled() {
            return Err(PoolError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(PoolError::Closed),
            sent = self.sender.send(location) => sent.map_err(|_| PoolError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }
}

impl PoolWorkers {
    pub async fn shutdown(self) -> ShutdownReport {
        self.closing.cancel();
        self.queue.lock().await.close();

        let aborts: Vec<_> = self.workers.iter().map(JoinHandle::abort_handle).collect();
        let mut joined = Box::pin(join_all(self.workers));

        let (results, timed_out) =
            match tokio::time::timeout(self.drain_timeout, &mut joined).await {
                Ok(results) => (results, false),
                Err(_) => {
                    warn!(timeout = ?self.drain_timeout, "Location pool drain timed out, aborting workers");
                    aborts.iter().for_each(|abort| abort.abort());
                    (joined.await, true)
                }
            };

        for result in results {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Location worker panicked");
                }
            }
        }

        let mut residual = 0;
        let mut queue = self.queue.lock().await;
        while queue.try_recv().is_ok() {
            residual += 1;
        }

        info!(residual, timed_out, "Location worker pool stopped");
        ShutdownReport {
            residual,
            timed_out,
        }
    }
}

async fn run_worker(
    id: usize,
    queue: Queue,
    saver: Arc<dyn LocationSaver>,
    closing: CancellationToken,
) {
    loop {
        let next = {
            let mut receiver = queue.lock().await;
            tokio::select! {
                biased;
                _ = closing.cancelled() => None,
                location = receiver.recv() => location,
            }
        };
        match next {
            Some(location) => save(id, saver.as_ref(), location).await,
            None => break,
        }
    }

    loop {
        let next = queue.lock().await.try_recv();
        match next {
            Ok(location) => save(id, saver.as_ref(), location).await,
            Err(_) => break,
        }
    }
}

async fn save(worker: usize, saver: &dyn LocationSaver, location: CourierLocation) {
    if let Err(e) = saver.save_latest_location(&location).await {
        error!(
            worker,
            courier_id = %location.courier_id,
            error = %e,
            "Failed to save courier location"
        );
    }
}
