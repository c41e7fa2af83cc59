//! Request document store contract.
//!
//! The store is the single source of truth: it assigns ids, arbitrates write
//! ordering, applies each `RequestPatch` atomically, and pushes the full
//! collection to subscribers whenever anything changes.

pub mod etcd;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    core::{status::SnapshotSource, ReliefResult},
    request::{NewRequest, Request, RequestPatch},
};

pub use etcd::EtcdRequestStore;
pub use memory::MemoryRequestStore;

/// Full, immutable view of the collection at one point in time.
pub type Snapshot = Arc<Vec<Request>>;

/// Receives every pushed snapshot.
pub type SnapshotCallback = Arc<dyn Fn(Snapshot) + Send + Sync>;

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new pending request and return its generated id.
    async fn create(&self, fields: NewRequest) -> ReliefResult<String>;

    /// Fetch one request; `NotFound` when the id does not exist.
    async fn read(&self, id: &str) -> ReliefResult<Request>;

    /// Apply a patch in a single write and return the stored result.
    async fn update(&self, id: &str, patch: RequestPatch) -> ReliefResult<Request>;

    /// Remove a request permanently.
    async fn delete(&self, id: &str) -> ReliefResult<()>;

    /// Current contents of the collection.
    async fn list(&self) -> ReliefResult<Vec<Request>>;

    /// Push the current snapshot now and after every change until the
    /// returned handle is dropped or unsubscribed.
    async fn subscribe(&self, on_change: SnapshotCallback) -> ReliefResult<Subscription>;

    fn source(&self) -> SnapshotSource;
}

/// Handle to a live snapshot subscription.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop receiving snapshots.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

/// Stable ordering for snapshots: oldest first, id as tie-breaker.
pub(crate) fn sort_snapshot(requests: &mut [Request]) {
    requests.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_subscription_cancels_once() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = calls.clone();
        {
            let _sub = Subscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
