//! Bounded worker pool

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Dispatcher, RejectReason, Rejected, WorkItem};
use crate::config::DispatchConfig;

type Queue = Arc<Mutex<mpsc::Receiver<Box<dyn WorkItem>>>>;

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
}

/// Snapshot of pool activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub panicked: u64,
}

/// Fixed set of worker tasks over one bounded queue
///
/// At most `concurrency` items execute at once and at most `queue_capacity`
/// wait. A panicking item is logged and counted; its worker keeps going.
/// Shutdown stops intake, lets workers drain what is queued, and aborts
/// whatever is still running after the timeout.
pub struct WorkerPool {
    queue: mpsc::Sender<Box<dyn WorkItem>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    closed: AtomicBool,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Start the workers
    pub fn new(config: &DispatchConfig) -> Self {
        let worker_count = config.concurrency.max(1);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue: Queue = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let workers = (0..worker_count)
            .map(|n| {
                tokio::spawn(work(
                    n,
                    queue.clone(),
                    shutdown.clone(),
                    counters.clone(),
                ))
            })
            .collect();

        tracing::debug!(
            workers = worker_count,
            queue_capacity = config.queue_capacity,
            "Worker pool started"
        );

        Self {
            queue: tx,
            workers: Mutex::new(workers),
            worker_count,
            closed: AtomicBool::new(false),
            shutdown,
            shutdown_timeout: config.shutdown_timeout(),
            counters,
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.worker_count,
            queued: self.queue.max_capacity() - self.queue.capacity(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, reason: RejectReason, item: Box<dyn WorkItem>) -> Rejected {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        Rejected::new(reason, item)
    }
}

#[async_trait]
impl Dispatcher for WorkerPool {
    fn submit(&self, item: Box<dyn WorkItem>) -> Result<(), Rejected> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.reject(RejectReason::ShutDown, item));
        }

        match self.queue.try_send(item) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(item)) => {
                Err(self.reject(RejectReason::QueueFull, item))
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                Err(self.reject(RejectReason::ShutDown, item))
            }
        }
    }

    fn stats(&self) -> Option<PoolStats> {
        Some(WorkerPool::stats(self))
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        let count = handles.len();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        let joined = tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(handles)).await;
        if joined.is_err() {
            tracing::warn!(
                workers = count,
                timeout = ?self.shutdown_timeout,
                "Worker pool did not drain in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        tracing::debug!(workers = count, "Worker pool stopped");
    }
}

async fn work(n: usize, queue: Queue, shutdown: CancellationToken, counters: Arc<Counters>) {
    loop {
        let item = {
            let mut rx = queue.lock().await;
            // queued items win over cancellation so shutdown drains the queue
            tokio::select! {
                biased;
                item = rx.recv() => item,
                _ = shutdown.cancelled() => None,
            }
        };

        let Some(item) = item else { break };

        let id = item.id();
        match AssertUnwindSafe(item.execute()).catch_unwind().await {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(worker = n, work_item = %id, "Work item completed");
            }
            Err(_) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker = n, work_item = %id, "Work item panicked");
            }
        }
    }
}
