use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use tokio::time::sleep;

use crate::{
    core::status,
    store::{RequestStore, Snapshot},
};

use super::Dashboard;

/// Keeps the dashboard fed from the store subscription for the lifetime of
/// the server.
pub struct DashboardSync {
    store: Arc<dyn RequestStore>,
    dashboard: Arc<Dashboard>,
}

impl DashboardSync {
    pub fn new(store: Arc<dyn RequestStore>, dashboard: Arc<Dashboard>) -> Self {
        Self { store, dashboard }
    }
}

#[async_trait]
impl BackgroundService for DashboardSync {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let source = self.store.source();

        loop {
            if *shutdown.borrow() {
                return;
            }

            log::info!("Subscribing to {} request snapshots...", source.as_str());
            let dashboard = self.dashboard.clone();
            let subscription = self
                .store
                .subscribe(Arc::new(move |snapshot: Snapshot| {
                    dashboard.update(snapshot);
                    status::mark_ready(source);
                }))
                .await;

            match subscription {
                Ok(subscription) => {
                    let _ = shutdown.changed().await;
                    log::info!("Shutdown signal received, stopping dashboard sync");
                    subscription.unsubscribe();
                    return;
                }
                Err(err) => {
                    log::error!("Snapshot subscription failed: {err}");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = sleep(Duration::from_secs(3)) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio::sync::watch;

    use super::*;
    use crate::{
        request::{NewRequest, Urgency},
        store::MemoryRequestStore,
    };

    #[tokio::test]
    async fn test_sync_feeds_dashboard_until_shutdown() {
        let store = MemoryRequestStore::new();
        let dashboard = Arc::new(Dashboard::new());
        let sync = Arc::new(DashboardSync::new(
            Arc::new(store.clone()),
            dashboard.clone(),
        ));

        let (tx, rx) = watch::channel(false);
        let task = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.start(rx).await })
        };

        store
            .create(NewRequest {
                district: "Colombo".to_string(),
                item: "Water".to_string(),
                phone: None,
                urgency: Urgency::High,
                gps: None,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        for _ in 0..50 {
            if dashboard.metrics().pending_count == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dashboard.metrics().pending_count, 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
