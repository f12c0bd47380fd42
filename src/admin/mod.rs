use std::{
    collections::{BTreeMap, HashMap},
    error::Error,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Response, StatusCode};
use matchit::{Match, Router};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde_json::json;

use crate::{
    config::{Admin, ConfigBundle},
    core::status::{self, ConfigSource},
    gateway::Gateway,
    utils::response::ResponseBuilder,
};

#[async_trait]
trait Handler {
    async fn handle(
        &self,
        gateway: &Gateway,
        session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> Result<Response<Bytes>, Box<dyn Error>>;
}

/// Operator API: push a bundle, read the active one, trigger a drained restart.
///
/// Every call must carry the configured key in `x-api-key`.
pub struct AdminHttpApp {
    gateway: Arc<Gateway>,
    router: Router<HashMap<Method, Box<dyn Handler + Send + Sync>>>,

    config: Admin,
}

impl AdminHttpApp {
    pub fn new(cfg: &Admin, gateway: Arc<Gateway>) -> Self {
        let mut this = Self {
            gateway,
            router: Router::new(),
            config: cfg.clone(),
        };

        this.route("/admin/config", Method::PUT, Box::new(ConfigPutHandler))
            .route("/admin/config", Method::GET, Box::new(ConfigGetHandler))
            .route("/admin/restart", Method::POST, Box::new(RestartHandler));

        this
    }

    fn route(
        &mut self,
        path: &str,
        method: Method,
        handler: Box<dyn Handler + Send + Sync>,
    ) -> &mut Self {
        match self.router.at_mut(path) {
            Ok(routes) => {
                routes.value.insert(method, handler);
            }
            Err(_) => {
                let mut handlers = HashMap::new();
                handlers.insert(method, handler);
                if let Err(e) = self.router.insert(path, handlers) {
                    log::error!("Failed to register admin route {path}: {e}");
                }
            }
        }
        self
    }

    pub fn admin_http_service(cfg: &Admin, gateway: Arc<Gateway>) -> Service<Self> {
        let app = Self::new(cfg, gateway);
        let addr = &app.config.address.to_string();
        let mut service = Service::new("Admin HTTP".to_string(), app);
        service.add_tcp(addr);
        service
    }
}

#[async_trait]
impl ServeHttp for AdminHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        if validate_api_key(http_session, &self.config.api_key).is_err() {
            return ResponseBuilder::text(StatusCode::FORBIDDEN, "Must provide api key")
                .map(|b| b.to_vec());
        }

        let (path, method) = {
            let req_header = http_session.req_header();
            (req_header.uri.path().to_string(), req_header.method.clone())
        };

        let resp = match self.router.at(&path) {
            Ok(Match { value, params }) => match value.get(&method) {
                Some(handler) => {
                    let params: BTreeMap<String, String> = params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    match handler.handle(&self.gateway, http_session, params).await {
                        Ok(resp) => resp,
                        Err(e) => ResponseBuilder::text(StatusCode::BAD_REQUEST, &e.to_string()),
                    }
                }
                None => ResponseBuilder::with_body(StatusCode::METHOD_NOT_ALLOWED, Bytes::new(), None),
            },
            Err(_) => ResponseBuilder::text(StatusCode::NOT_FOUND, "Not Found"),
        };
        resp.map(|b| b.to_vec())
    }
}

struct ConfigPutHandler;

#[async_trait]
impl Handler for ConfigPutHandler {
    async fn handle(
        &self,
        gateway: &Gateway,
        http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> Result<Response<Bytes>, Box<dyn Error>> {
        validate_content_type(http_session)?;
        let body_data = read_request_body(http_session).await?;
        let resp = put_config(gateway, &body_data);
        if resp.status().is_success() {
            status::mark_ready(ConfigSource::Admin);
        }
        Ok(resp)
    }
}

struct ConfigGetHandler;

#[async_trait]
impl Handler for ConfigGetHandler {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> Result<Response<Bytes>, Box<dyn Error>> {
        Ok(ResponseBuilder::success_json(&json!({
            "value": gateway.snapshot().bundle,
        })))
    }
}

struct RestartHandler;

#[async_trait]
impl Handler for RestartHandler {
    async fn handle(
        &self,
        gateway: &Gateway,
        _http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> Result<Response<Bytes>, Box<dyn Error>> {
        status::mark_unready("restart requested");
        Ok(restart(gateway).await)
    }
}

/// Apply a JSON bundle; a rejected bundle leaves the active one in place.
fn put_config(gateway: &Gateway, body: &[u8]) -> Response<Bytes> {
    let result = ConfigBundle::from_json(body).and_then(|bundle| gateway.apply_bundle(bundle));
    match result {
        Ok(applied) => ResponseBuilder::success_json(&json!({
            "applied": applied,
            "version": gateway.version(),
        })),
        Err(e) => {
            let mut resp = ResponseBuilder::error(&e);
            *resp.status_mut() = StatusCode::BAD_REQUEST;
            resp
        }
    }
}

/// Drain, then hand over to the restart service.
async fn restart(gateway: &Gateway) -> Response<Bytes> {
    let timeout = Duration::from_millis(gateway.settings().drain_timeout_ms);
    let report = gateway.drain(timeout).await;
    gateway.request_restart();
    ResponseBuilder::success_json(&report)
}

fn validate_api_key(http_session: &ServerSession, api_key: &str) -> Result<(), Box<dyn Error>> {
    match http_session.get_header("x-api-key") {
        Some(key) if key.to_str()? == api_key => Ok(()),
        _ => Err("Must provide api key".into()),
    }
}

fn validate_content_type(http_session: &ServerSession) -> Result<(), Box<dyn Error>> {
    match http_session.get_header(header::CONTENT_TYPE) {
        Some(content_type) if content_type.to_str()?.starts_with("application/json") => Ok(()),
        _ => Err("Content-Type must be application/json".into()),
    }
}

async fn read_request_body(http_session: &mut ServerSession) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut body_data = Vec::new();
    while let Some(bytes) = http_session.read_request_body().await? {
        body_data.extend_from_slice(&bytes);
    }
    Ok(body_data)
}

#[cfg(test)]
mod tests {
    use serde_json::Value as JsonValue;

    use super::*;
    use crate::{config::GatewaySettings, connector::ConnectorRegistry};

    fn gateway() -> Gateway {
        Gateway::new(GatewaySettings::default(), ConnectorRegistry::with_builtin())
    }

    fn body(resp: &Response<Bytes>) -> JsonValue {
        serde_json::from_slice(resp.body()).unwrap()
    }

    #[test]
    fn test_put_config_applies_and_rejects() {
        let gw = gateway();
        let bundle = json!({
            "version": 2,
            "routes": [{
                "id": "ping",
                "uri": "/ping",
                "target": {"type": "proxy", "connector": "static", "config": {"value": "pong"}}
            }]
        });

        let resp = put_config(&gw, bundle.to_string().as_bytes());
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(&resp), json!({"applied": true, "version": 2}));

        let resp = put_config(&gw, b"{not json");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&resp)["error"], "config_error");

        let stale = json!({"version": 1});
        let resp = put_config(&gw, stale.to_string().as_bytes());
        assert_eq!(body(&resp)["error"], "config_error");
        assert_eq!(gw.version(), 2);
    }

    #[tokio::test]
    async fn test_restart_drains_and_signals() {
        let gw = gateway();
        let resp = restart(&gw).await;
        assert_eq!(body(&resp), json!({"drained": true, "in_flight": 0}));
        assert!(gw.is_draining());

        // the notification is stored until the restart service picks it up
        tokio::time::timeout(Duration::from_secs(1), gw.restart_requested())
            .await
            .unwrap();
    }
}
