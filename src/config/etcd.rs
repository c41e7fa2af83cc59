use std::{sync::Arc, time::Duration};

use etcd_client::{Client, ConnectOptions};
use tokio::sync::Mutex;

use crate::core::ReliefResult;

use super::Etcd;

/// Lazily connected, shareable etcd client.
///
/// The connection is created on first use and dropped by `reset` after a
/// transport failure, so the next call reconnects.
pub struct EtcdClientWrapper {
    config: Etcd,
    client: Arc<Mutex<Option<Client>>>,
}

impl EtcdClientWrapper {
    pub fn new(config: Etcd) -> Self {
        Self {
            config,
            client: Arc::new(Mutex::new(None)),
        }
    }

    async fn create_client(&self) -> Result<Client, etcd_client::Error> {
        let mut options = ConnectOptions::default();
        if let Some(timeout) = self.config.timeout {
            options = options.with_timeout(Duration::from_secs(timeout as u64));
        };
        if let Some(connect_timeout) = self.config.connect_timeout {
            options = options.with_connect_timeout(Duration::from_secs(connect_timeout as u64));
        };
        if let (Some(user), Some(password)) = (&self.config.user, &self.config.password) {
            options = options.with_user(user.clone(), password.clone());
        };

        Client::connect(self.config.host.clone(), Some(options)).await
    }

    /// Connected client handle, creating the connection if needed.
    pub async fn client(&self) -> ReliefResult<Client> {
        let mut client_guard = self.client.lock().await;

        if client_guard.is_none() {
            log::info!("Creating new etcd client...");
            *client_guard = Some(self.create_client().await?);
        }

        match client_guard.as_ref() {
            Some(client) => Ok(client.clone()),
            None => Err(crate::transport_error!("etcd client is not initialized")),
        }
    }

    /// Forget the current connection.
    pub async fn reset(&self) {
        *self.client.lock().await = None;
    }

    #[cfg(test)]
    pub(crate) async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }
}
