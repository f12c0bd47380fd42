use std::sync::Arc;

use async_trait::async_trait;
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};

use crate::gateway::Gateway;

/// Exits the process once an operator restart has drained the gateway.
///
/// The supervisor (systemd, Kubernetes, ...) is expected to start a fresh instance.
pub struct RestartService {
    gateway: Arc<Gateway>,
}

impl RestartService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl BackgroundService for RestartService {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = self.gateway.restart_requested() => {
                log::warn!(
                    "Restart requested, exiting with {} requests in flight",
                    self.gateway.admission().in_flight()
                );
                log::logger().flush();
                std::process::exit(0);
            }
        }
    }
}
