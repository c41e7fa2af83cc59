use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, Weak,
};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::{
    core::{status::SnapshotSource, ReliefError, ReliefResult},
    request::{NewRequest, Request, RequestPatch},
    transport_error,
};

use super::{sort_snapshot, RequestStore, Snapshot, SnapshotCallback, Subscription};

/// In-process request store.
///
/// Patches are applied under the entry lock, so a reader never sees a
/// half-applied approval. Subscribers are notified synchronously after each
/// mutation; collecting a snapshot and delivering it happen under one lock, so
/// subscribers always receive snapshots in the order they were taken.
#[derive(Clone, Default)]
pub struct MemoryRequestStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    docs: DashMap<String, Request>,
    subscribers: DashMap<u64, SnapshotCallback>,
    next_subscriber: AtomicU64,
    offline: AtomicBool,
    delivery: Mutex<()>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a lost backend: every operation fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.docs.is_empty()
    }

    fn ensure_online(&self) -> ReliefResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            Err(transport_error!("memory store is offline"))
        } else {
            Ok(())
        }
    }

    fn snapshot(&self) -> Snapshot {
        Arc::new(collect_sorted(&self.inner.docs))
    }

    fn delivery_guard(&self) -> MutexGuard<'_, ()> {
        // a panicking subscriber must not stop later deliveries
        self.inner
            .delivery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        let _delivery = self.delivery_guard();
        let callbacks: Vec<SnapshotCallback> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if callbacks.is_empty() {
            return;
        }

        let snapshot = self.snapshot();
        for callback in callbacks {
            callback(snapshot.clone());
        }
    }
}

fn collect_sorted(docs: &DashMap<String, Request>) -> Vec<Request> {
    let mut requests: Vec<Request> = docs.iter().map(|entry| entry.value().clone()).collect();
    sort_snapshot(&mut requests);
    requests
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn create(&self, fields: NewRequest) -> ReliefResult<String> {
        self.ensure_online()?;

        let id = loop {
            let candidate = Uuid::new_v4().simple().to_string();
            if !self.inner.docs.contains_key(&candidate) {
                break candidate;
            }
        };
        self.inner
            .docs
            .insert(id.clone(), Request::from_new(id.clone(), fields));

        self.notify();
        Ok(id)
    }

    async fn read(&self, id: &str) -> ReliefResult<Request> {
        self.ensure_online()?;
        self.inner
            .docs
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ReliefError::NotFound(id.to_string()))
    }

    async fn update(&self, id: &str, patch: RequestPatch) -> ReliefResult<Request> {
        self.ensure_online()?;

        let updated = {
            let mut entry = self
                .inner
                .docs
                .get_mut(id)
                .ok_or_else(|| ReliefError::NotFound(id.to_string()))?;
            let updated = patch.apply(entry.value())?;
            *entry.value_mut() = updated.clone();
            updated
        };

        self.notify();
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> ReliefResult<()> {
        self.ensure_online()?;
        if self.inner.docs.remove(id).is_none() {
            return Err(ReliefError::NotFound(id.to_string()));
        }

        self.notify();
        Ok(())
    }

    async fn list(&self) -> ReliefResult<Vec<Request>> {
        self.ensure_online()?;
        Ok(collect_sorted(&self.inner.docs))
    }

    async fn subscribe(&self, on_change: SnapshotCallback) -> ReliefResult<Subscription> {
        self.ensure_online()?;

        let key = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        {
            let _delivery = self.delivery_guard();
            self.inner.subscribers.insert(key, on_change.clone());
            on_change(self.snapshot());
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.remove(&key);
            }
        }))
    }

    fn source(&self) -> SnapshotSource {
        SnapshotSource::Memory
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::request::{Coordinates, Status, Urgency};

    fn new_request(district: &str) -> NewRequest {
        NewRequest {
            district: district.to_string(),
            item: "Rice".to_string(),
            phone: None,
            urgency: Urgency::High,
            gps: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let store = MemoryRequestStore::new();
        let id = store.create(new_request("Kandy")).await.unwrap();

        let req = store.read(&id).await.unwrap();
        assert_eq!(req.id, id);
        assert_eq!(req.status, Status::Pending);
        assert_eq!(req.location(), None);

        store.delete(&id).await.unwrap();
        assert!(store.read(&id).await.unwrap_err().is_not_found());
        assert!(store.delete(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let store = MemoryRequestStore::new();
        let a = store.create(new_request("Kandy")).await.unwrap();
        let b = store.create(new_request("Kandy")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_update_precondition() {
        let store = MemoryRequestStore::new();
        let id = store.create(new_request("Galle")).await.unwrap();

        let patch = RequestPatch::approve(Coordinates::new(6.0, 80.2));
        let approved = store.update(&id, patch.clone()).await.unwrap();
        assert_eq!(approved.status, Status::Approved);

        let err = store.update(&id, patch).await.unwrap_err();
        assert!(matches!(err, ReliefError::Conflict(_)));
        assert_eq!(store.read(&id).await.unwrap(), approved);

        let err = store
            .update("missing", RequestPatch::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_offline_fails_without_writing() {
        let store = MemoryRequestStore::new();
        let id = store.create(new_request("Galle")).await.unwrap();

        store.set_offline(true);
        let err = store
            .update(&id, RequestPatch::approve(Coordinates::new(6.0, 80.2)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.read(&id).await.unwrap_err().is_retryable());

        store.set_offline(false);
        assert_eq!(store.read(&id).await.unwrap().status, Status::Pending);
    }

    #[tokio::test]
    async fn test_subscribe_pushes_full_snapshots() {
        let store = MemoryRequestStore::new();
        store.create(new_request("Kandy")).await.unwrap();

        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = store
            .subscribe(Arc::new(move |snapshot: Snapshot| {
                sink.lock().unwrap().push(snapshot.len());
            }))
            .await
            .unwrap();

        let id = store.create(new_request("Galle")).await.unwrap();
        store.delete(&id).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 1]);

        sub.unsubscribe();
        store.create(new_request("Matara")).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_subscriber_sees_latest_snapshot_last() {
        let store = MemoryRequestStore::new();

        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = store
            .subscribe(Arc::new(move |snapshot: Snapshot| {
                if snapshot.len() == 1 {
                    std::thread::sleep(Duration::from_millis(50));
                }
                sink.lock().unwrap().push(snapshot.len());
            }))
            .await
            .unwrap();

        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.create(new_request("Galle")).await })
        };
        let second = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                store.create(new_request("Kandy")).await
            })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&2), "deliveries: {seen:?}");
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{seen:?}");
    }
}
