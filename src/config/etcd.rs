use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, Event, EventType, GetResponse, WatchOptions};
use pingora_core::services::background::BackgroundService;
use tokio::{sync::Mutex, time::sleep};

use super::{ConfigBundle, Etcd};
use crate::{
    core::status::{self, ConfigSource},
    gateway::Gateway,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Keeps the active bundle in sync with the `<prefix>/bundle` key.
///
/// The key is read once on start, then watched from the next revision on. Any failure drops
/// the client and starts over with a fresh list.
pub struct EtcdConfigSync {
    config: Etcd,
    client: Arc<Mutex<Option<Client>>>,
    revision: Arc<Mutex<i64>>,

    handler: Box<dyn EtcdEventHandler + Send + Sync>,
}

impl EtcdConfigSync {
    pub fn new(config: Etcd, handler: Box<dyn EtcdEventHandler + Send + Sync>) -> Self {
        Self {
            config,
            client: Arc::new(Mutex::new(None)),
            revision: Arc::new(Mutex::new(0)),
            handler,
        }
    }

    async fn create_client(&self) -> Result<Client, BoxError> {
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

        let client = Client::connect(self.config.host.clone(), Some(options)).await?;
        Ok(client)
    }

    async fn list(&self) -> Result<(), BoxError> {
        let mut client_guard = self.client.lock().await;
        let client = client_guard
            .as_mut()
            .ok_or("Etcd client is not initialized")?;

        let response = client.get(self.config.bundle_key(), None).await?;
        let revision = response
            .header()
            .ok_or("Etcd response carries no header")?
            .revision();
        *self.revision.lock().await = revision;

        self.handler.handle_list_response(&response);

        Ok(())
    }

    async fn watch(&self) -> Result<(), BoxError> {
        let start_revision = *self.revision.lock().await + 1;
        let options = WatchOptions::new().with_start_revision(start_revision);

        let mut client_guard = self.client.lock().await;
        let client = client_guard
            .as_mut()
            .ok_or("Etcd client is not initialized")?;

        let (mut watcher, mut stream) = client
            .watch(self.config.bundle_key(), Some(options))
            .await?;

        watcher.request_progress().await?;

        while let Some(response) = stream.message().await? {
            if response.canceled() {
                break;
            }

            for event in response.events() {
                self.handler.handle_event(event);
            }
        }
        Ok(())
    }

    async fn ensure_client(&self) -> Result<(), BoxError> {
        let mut client_guard = self.client.lock().await;

        if client_guard.is_none() {
            log::info!("Creating new etcd client...");
            *client_guard = Some(self.create_client().await?);
        }
        Ok(())
    }
}

#[async_trait]
impl BackgroundService for EtcdConfigSync {
    async fn start(&self, shutdown: pingora_core::server::ShutdownWatch) -> () {
        loop {
            if *shutdown.borrow() {
                return;
            }

            log::info!("Ensuring etcd client...");
            if let Err(err) = self.ensure_client().await {
                log::error!("Failed to create etcd client: {:?}", err);
                sleep(Duration::from_secs(3)).await;
                continue;
            }

            log::info!("Loading bundle from etcd key {}", self.config.bundle_key());
            if let Err(err) = self.list().await {
                log::error!("List operation failed: {:?}", err);
                // reset the client so the next round reconnects
                *self.client.lock().await = None;
                sleep(Duration::from_secs(3)).await;
                continue;
            }

            log::info!("Watching etcd for bundle updates...");
            if let Err(err) = self.watch().await {
                log::error!("Watch operation failed: {:?}", err);
                *self.client.lock().await = None;
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

pub trait EtcdEventHandler {
    fn handle_event(&self, event: &Event);
    fn handle_list_response(&self, response: &GetResponse);
}

/// Applies every bundle seen in etcd to the gateway.
pub struct BundleApplier {
    gateway: Arc<Gateway>,
}

impl BundleApplier {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    fn apply(&self, value: &[u8]) -> bool {
        let result =
            ConfigBundle::from_json(value).and_then(|bundle| self.gateway.apply_bundle(bundle));
        match result {
            Ok(_) => true,
            Err(e) => {
                log::error!("Ignoring bundle from etcd: {e}");
                false
            }
        }
    }

    fn apply_and_mark(&self, value: &[u8]) {
        if self.apply(value) {
            status::mark_ready(ConfigSource::Etcd);
        }
    }
}

impl EtcdEventHandler for BundleApplier {
    fn handle_event(&self, event: &Event) {
        match (event.event_type(), event.kv()) {
            (EventType::Put, Some(kv)) => self.apply_and_mark(kv.value()),
            (EventType::Delete, _) => {
                log::warn!("Bundle key deleted from etcd, keeping the active bundle")
            }
            _ => {}
        }
    }

    fn handle_list_response(&self, response: &GetResponse) {
        match response.kvs().first() {
            Some(kv) => self.apply_and_mark(kv.value()),
            None => log::warn!("No bundle stored in etcd yet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::GatewaySettings, connector::ConnectorRegistry};

    #[test]
    fn test_applier_keeps_last_good_bundle() {
        let gateway = Arc::new(Gateway::new(
            GatewaySettings::default(),
            ConnectorRegistry::with_builtin(),
        ));
        let applier = BundleApplier::new(gateway.clone());

        assert!(applier.apply(br#"{"version": 3, "routes": []}"#));
        assert_eq!(gateway.version(), 3);

        assert!(!applier.apply(b"garbage"));
        assert!(!applier.apply(br#"{"version": 2}"#));
        assert_eq!(gateway.version(), 3);
    }
}
