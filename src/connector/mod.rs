//! Backend connectors and their registry
//!
//! A connector turns one pipeline step (or one plain-proxy call) into a backend request.
//! Connectors are registered once at startup; per-step configuration is validated when a
//! bundle is loaded and handed back to [`Connector::execute`] on every request.

pub mod fixed;
pub mod http;
pub mod rpc;
pub mod sql;
pub mod template;

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use serde_json::{Map, Value as JsonValue};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config_error,
    core::{Connector, ConnectorError, GatewayResult},
};

/// What a connector may see of the request while executing one step.
#[derive(Clone)]
pub struct StepContext {
    pub pipeline: String,
    pub step: String,
    pub request_id: String,
    pub client_id: Option<String>,
    /// Bindings accumulated so far (input plus completed steps)
    pub bindings: Arc<Map<String, JsonValue>>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl StepContext {
    pub fn new(pipeline: &str, step: &str, bindings: Arc<Map<String, JsonValue>>) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            step: step.to_string(),
            request_id: String::new(),
            client_id: None,
            bindings,
            cancel: CancellationToken::new(),
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    pub fn render(&self, value: &JsonValue) -> GatewayResult<JsonValue> {
        template::render_value(value, &self.bindings)
    }

    pub fn render_str(&self, text: &str) -> GatewayResult<String> {
        template::render_text(text, &self.bindings)
    }

    /// Time left before this step's deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run `fut` until it finishes or the step is cancelled, whichever comes first.
    ///
    /// Dropping `fut` on cancellation abandons any outstanding I/O it owns.
    pub async fn cancellable<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectorError::cancelled().into()),
            result = fut => result,
        }
    }
}

/// Connector implementations keyed by type name.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every connector shipped with the gateway.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let builtin: Vec<Arc<dyn Connector>> = vec![
            Arc::new(http::HttpConnector::new()),
            Arc::new(rpc::RpcConnector::new()),
            Arc::new(sql::SqlConnector::new()),
            Arc::new(fixed::StaticConnector),
        ];
        for connector in builtin {
            if let Err(e) = registry.register(connector) {
                log::error!("Failed to register builtin connector: {e}");
            }
        }
        registry
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) -> GatewayResult<()> {
        let name = connector.type_name().to_string();
        if self.connectors.contains_key(&name) {
            return Err(config_error!("Connector type {} registered twice", name));
        }
        self.connectors.insert(name, connector);
        Ok(())
    }

    pub fn lookup(&self, type_name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(type_name).cloned()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.connectors.keys().map(String::as_str)
    }
}
