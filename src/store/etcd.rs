use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, KeyValue, Txn, TxnOp, WatchOptions,
};
use tokio::time::sleep;
use uuid::Uuid;

use crate::{
    config::{etcd::EtcdClientWrapper, Etcd},
    core::{status::SnapshotSource, ReliefError, ReliefResult},
    request::{NewRequest, Request, RequestPatch, COLLECTION},
};

use super::{sort_snapshot, RequestStore, Snapshot, SnapshotCallback, Subscription};

/// Optimistic write attempts before giving up with `Conflict`.
const MAX_CAS_ATTEMPTS: usize = 5;

/// Request store backed by etcd.
///
/// Each request is one JSON document under `{prefix}/requests/{id}`. Creates
/// are guarded by `version == 0`, updates by the `mod_revision` that was read,
/// so concurrent writers never overwrite each other.
#[derive(Clone)]
pub struct EtcdRequestStore {
    etcd: Arc<EtcdClientWrapper>,
    collection: String,
}

impl EtcdRequestStore {
    pub fn new(config: Etcd) -> Self {
        let collection = collection_prefix(&config.prefix);
        Self {
            etcd: Arc::new(EtcdClientWrapper::new(config)),
            collection,
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.collection, id)
    }

    async fn client(&self) -> ReliefResult<Client> {
        self.etcd.client().await
    }

    /// Convert an etcd result, dropping the connection on failure.
    async fn check<T>(&self, result: Result<T, etcd_client::Error>) -> ReliefResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.etcd.reset().await;
                Err(err.into())
            }
        }
    }

    async fn read_kv(&self, id: &str) -> ReliefResult<(Request, i64)> {
        let mut client = self.client().await?;
        let response = self.check(client.get(self.key(id), None).await).await?;
        let kv = response
            .kvs()
            .first()
            .ok_or_else(|| ReliefError::NotFound(id.to_string()))?;
        Ok((decode(&self.collection, kv)?, kv.mod_revision()))
    }

    async fn list_with_revision(&self) -> ReliefResult<(BTreeMap<String, Request>, i64)> {
        let mut client = self.client().await?;
        let options = GetOptions::new().with_prefix();
        let response = self
            .check(client.get(self.collection.as_str(), Some(options)).await)
            .await?;
        let revision = response.header().map(|h| h.revision()).unwrap_or_default();

        let mut docs = BTreeMap::new();
        for kv in response.kvs() {
            match decode(&self.collection, kv) {
                Ok(request) => {
                    docs.insert(request.id.clone(), request);
                }
                Err(err) => log::warn!("Skipping unreadable request document: {err}"),
            }
        }
        Ok((docs, revision))
    }

    /// Apply watch events to `docs` until the stream ends or fails.
    async fn watch(
        &self,
        docs: &mut BTreeMap<String, Request>,
        revision: &mut i64,
        on_change: &SnapshotCallback,
    ) -> ReliefResult<()> {
        let options = WatchOptions::new()
            .with_start_revision(*revision + 1)
            .with_prefix();

        let mut client = self.client().await?;
        let (mut watcher, mut stream) = self
            .check(client.watch(self.collection.as_str(), Some(options)).await)
            .await?;
        self.check(watcher.request_progress().await).await?;

        while let Some(response) = self.check(stream.message().await).await? {
            if response.canceled() {
                break;
            }

            let mut changed = false;
            for event in response.events() {
                let Some(kv) = event.kv() else {
                    continue;
                };
                *revision = (*revision).max(kv.mod_revision());

                match event.event_type() {
                    EventType::Put => match decode(&self.collection, kv) {
                        Ok(request) => {
                            docs.insert(request.id.clone(), request);
                            changed = true;
                        }
                        Err(err) => log::warn!("Skipping unreadable request document: {err}"),
                    },
                    EventType::Delete => {
                        if let Some(id) = id_from_key(&self.collection, kv.key()) {
                            changed |= docs.remove(&id).is_some();
                        }
                    }
                }
            }

            if changed {
                on_change(snapshot(docs));
            }
        }
        Ok(())
    }

    async fn sync_loop(
        &self,
        mut docs: BTreeMap<String, Request>,
        mut revision: i64,
        on_change: SnapshotCallback,
    ) {
        loop {
            log::info!("Executing etcd watch operation...");
            if let Err(err) = self.watch(&mut docs, &mut revision, &on_change).await {
                log::error!("Watch operation failed: {err}");
                sleep(Duration::from_secs(1)).await;
            }

            // resynchronize from scratch, events may have been missed
            loop {
                log::info!("Executing etcd list operation...");
                match self.list_with_revision().await {
                    Ok((fresh, rev)) => {
                        docs = fresh;
                        revision = rev;
                        on_change(snapshot(&docs));
                        break;
                    }
                    Err(err) => {
                        log::error!("List operation failed: {err}");
                        sleep(Duration::from_secs(3)).await;
                    }
                }
            }
        }
    }
}

fn collection_prefix(prefix: &str) -> String {
    format!("{}/{}/", prefix.trim_end_matches('/'), COLLECTION)
}

fn id_from_key(collection: &str, key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    let id = key.strip_prefix(collection)?;
    if id.is_empty() || id.contains('/') {
        None
    } else {
        Some(id.to_string())
    }
}

fn decode(collection: &str, kv: &KeyValue) -> ReliefResult<Request> {
    let id = id_from_key(collection, kv.key()).ok_or_else(|| {
        ReliefError::Internal(format!(
            "unexpected key {}",
            String::from_utf8_lossy(kv.key())
        ))
    })?;
    let mut request: Request = serde_json::from_slice(kv.value())?;
    request.id = id;
    Ok(request)
}

fn snapshot(docs: &BTreeMap<String, Request>) -> Snapshot {
    let mut requests: Vec<Request> = docs.values().cloned().collect();
    sort_snapshot(&mut requests);
    Arc::new(requests)
}

#[async_trait]
impl RequestStore for EtcdRequestStore {
    async fn create(&self, fields: NewRequest) -> ReliefResult<String> {
        let mut client = self.client().await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let id = Uuid::new_v4().simple().to_string();
            let key = self.key(&id);
            let value = serde_json::to_vec(&Request::from_new(id.clone(), fields.clone()))?;

            let txn = Txn::new()
                .when(vec![Compare::version(key.clone(), CompareOp::Equal, 0)])
                .and_then(vec![TxnOp::put(key, value, None)]);
            let response = self.check(client.txn(txn).await).await?;
            if response.succeeded() {
                return Ok(id);
            }
        }

        Err(ReliefError::Conflict(
            "could not allocate a unique request id".to_string(),
        ))
    }

    async fn read(&self, id: &str) -> ReliefResult<Request> {
        self.read_kv(id).await.map(|(request, _)| request)
    }

    async fn update(&self, id: &str, patch: RequestPatch) -> ReliefResult<Request> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (current, mod_revision) = self.read_kv(id).await?;
            let updated = patch.apply(&current)?;

            let key = self.key(id);
            let value = serde_json::to_vec(&updated)?;
            let txn = Txn::new()
                .when(vec![Compare::mod_revision(
                    key.clone(),
                    CompareOp::Equal,
                    mod_revision,
                )])
                .and_then(vec![TxnOp::put(key, value, None)]);

            let mut client = self.client().await?;
            let response = self.check(client.txn(txn).await).await?;
            if response.succeeded() {
                return Ok(updated);
            }
            log::debug!("Request {id} changed during update, retrying (attempt {attempt})");
        }

        Err(ReliefError::Conflict(format!(
            "request {id} kept changing during update"
        )))
    }

    async fn delete(&self, id: &str) -> ReliefResult<()> {
        let mut client = self.client().await?;
        let response = self.check(client.delete(self.key(id), None).await).await?;
        if response.deleted() == 0 {
            return Err(ReliefError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list(&self) -> ReliefResult<Vec<Request>> {
        let (docs, _) = self.list_with_revision().await?;
        Ok(snapshot(&docs).as_ref().clone())
    }

    async fn subscribe(&self, on_change: SnapshotCallback) -> ReliefResult<Subscription> {
        let (docs, revision) = self.list_with_revision().await?;
        on_change(snapshot(&docs));

        let store = self.clone();
        let handle = tokio::spawn(async move {
            store.sync_loop(docs, revision, on_change).await;
        });
        Ok(Subscription::new(move || handle.abort()))
    }

    fn source(&self) -> SnapshotSource {
        SnapshotSource::Etcd
    }
}
