//! Work dispatch
//!
//! Anything with unpredictable latency (user hooks, encoding, socket writes
//! for replies) leaves the connection's read loop as a [`WorkItem`] submitted
//! to a [`Dispatcher`]. Submission never blocks: a saturated dispatcher
//! rejects the item and hands it back inside [`Rejected`].
//!
//! [`WorkerPool`] is the bundled dispatcher: a fixed number of tokio tasks
//! draining one bounded queue.

mod pool;
mod work;

pub use pool::{PoolStats, WorkerPool};
pub use work::{
    ClientAuthenticatedWork, ClientConnectedWork, ClientDisconnectedWork, MessageReceivedWork,
    ReplyWork,
};

use async_trait::async_trait;

/// A deferred unit of execution
#[async_trait]
pub trait WorkItem: Send + Sync + 'static {
    /// Label used in logs
    fn id(&self) -> String;

    async fn execute(&self);
}

/// Why a dispatcher refused an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The pending queue is at capacity
    QueueFull,
    /// The dispatcher no longer accepts work
    ShutDown,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::ShutDown => write!(f, "shut down"),
        }
    }
}

/// A refused work item, returned to the submitter
pub struct Rejected {
    reason: RejectReason,
    item: Box<dyn WorkItem>,
}

impl Rejected {
    #[must_use]
    pub fn new(reason: RejectReason, item: Box<dyn WorkItem>) -> Self {
        Self { reason, item }
    }

    #[must_use]
    pub fn reason(&self) -> RejectReason {
        self.reason
    }

    /// Label of the refused item
    #[must_use]
    pub fn item_id(&self) -> String {
        self.item.id()
    }

    /// Take the item back
    #[must_use]
    pub fn into_item(self) -> Box<dyn WorkItem> {
        self.item
    }
}

impl std::fmt::Debug for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .field("item", &self.item.id())
            .finish()
    }
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "work item {} rejected: {}", self.item.id(), self.reason)
    }
}

impl std::error::Error for Rejected {}

/// Bounded executor for work items
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Queue an item without waiting
    fn submit(&self, item: Box<dyn WorkItem>) -> Result<(), Rejected>;

    /// Stop accepting work and wait for running items
    async fn shutdown(&self) {}

    /// Activity counters, if the dispatcher keeps any
    fn stats(&self) -> Option<PoolStats> {
        None
    }
}

/// Submit an item, logging and dropping it on rejection
pub fn submit_or_log(dispatcher: &dyn Dispatcher, item: Box<dyn WorkItem>) {
    if let Err(rejected) = dispatcher.submit(item) {
        tracing::warn!(work_item = %rejected.item_id(), reason = %rejected.reason(), "Work item dropped");
    }
}

/// Submit an item that must run, falling back to a detached task
///
/// Used for lifecycle events whose hooks fire exactly once even when the
/// dispatcher is saturated or stopping.
pub fn submit_or_spawn(dispatcher: &dyn Dispatcher, item: Box<dyn WorkItem>) {
    if let Err(rejected) = dispatcher.submit(item) {
        tracing::debug!(work_item = %rejected.item_id(), reason = %rejected.reason(), "Running rejected work item detached");
        let item = rejected.into_item();
        tokio::spawn(async move { item.execute().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl WorkItem for Count {
        fn id(&self) -> String {
            "count".into()
        }

        async fn execute(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Refuse;

    impl Dispatcher for Refuse {
        fn submit(&self, item: Box<dyn WorkItem>) -> Result<(), Rejected> {
            Err(Rejected::new(RejectReason::QueueFull, item))
        }
    }

    #[tokio::test]
    async fn test_submit_or_spawn_runs_rejected_item() {
        let count = Arc::new(AtomicUsize::new(0));
        submit_or_spawn(&Refuse, Box::new(Count(count.clone())));

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_submit_or_log_drops_rejected_item() {
        let count = Arc::new(AtomicUsize::new(0));
        submit_or_log(&Refuse, Box::new(Count(count.clone())));
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rejected_display() {
        let rejected = Rejected::new(RejectReason::ShutDown, Box::new(Count(Arc::default())));
        assert_eq!(rejected.to_string(), "work item count rejected: shut down");
        assert_eq!(rejected.item_id(), "count");
    }
}
