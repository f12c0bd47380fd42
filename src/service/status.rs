use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;
use serde_json::json;

use crate::{
    config::Status,
    core::status,
    gateway::Gateway,
    metrics,
    utils::response::ResponseBuilder,
};

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// HTTP application for the status endpoints.
///
/// - `/status/ready`: readiness check, 200 once a bundle is active and the gateway is not draining
/// - `/status/flow-control`: admission counters per scope
/// - `/status/config`: active bundle version and sizes
/// - `/status/metrics`: prometheus text exposition
///
/// Kept apart from the admin API so health checkers and scrapers need no credentials.
pub struct StatusHttpApp {
    config: Status,
    gateway: Arc<Gateway>,
}

impl StatusHttpApp {
    pub fn new(cfg: &Status, gateway: Arc<Gateway>) -> Self {
        Self {
            config: cfg.clone(),
            gateway,
        }
    }

    pub fn status_http_service(cfg: &Status, gateway: Arc<Gateway>) -> Service<Self> {
        let app = Self::new(cfg, gateway);
        let addr = &app.config.address.to_string();
        let mut service = Service::new("Status HTTP".to_string(), app);
        service.add_tcp(addr);
        service
    }

    fn route(&self, path: &str) -> Response<Bytes> {
        match path {
            "/status/ready" => self.ready(),
            "/status/flow-control" => ResponseBuilder::success_json(&self.gateway.admission().snapshot()),
            "/status/config" => {
                let snapshot = self.gateway.snapshot();
                ResponseBuilder::success_json(&json!({
                    "version": snapshot.version,
                    "routes": snapshot.routes.len(),
                    "pipelines": snapshot.pipelines.len(),
                    "plugins": snapshot.chain.names(),
                    "draining": self.gateway.is_draining(),
                }))
            }
            "/status/metrics" => ResponseBuilder::with_body(
                StatusCode::OK,
                metrics::gather_text().into(),
                Some("text/plain; version=0.0.4"),
            ),
            _ => ResponseBuilder::text(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    fn ready(&self) -> Response<Bytes> {
        let error = if !status::is_ready() {
            Some("Configuration not loaded yet")
        } else if self.gateway.is_draining() {
            Some("Gateway is draining")
        } else {
            None
        };

        match error {
            None => ResponseBuilder::success_json(&StatusResponse {
                status: "ok".to_string(),
                error: None,
            }),
            Some(error) => ResponseBuilder::json(
                StatusCode::SERVICE_UNAVAILABLE,
                &StatusResponse {
                    status: "error".to_string(),
                    error: Some(error.to_string()),
                },
            ),
        }
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        let path = http_session.req_header().uri.path().to_string();
        self.route(&path).map(|body| body.to_vec())
    }
}
