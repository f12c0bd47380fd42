//! The request path and the active configuration snapshot.
//!
//! [`Gateway`] owns every long-lived component (admission, connectors, pipeline engine) and
//! one swappable [`GatewaySnapshot`]. A request loads the snapshot once and runs entirely
//! against it, so a concurrent bundle swap is never observed halfway.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderName, HeaderValue, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::{
    admission::{route_scope, AdmissionController, AdmissionPermit, GLOBAL_SCOPE},
    config::{ConfigBundle, GatewaySettings},
    config_error,
    connector::{ConnectorRegistry, StepContext},
    core::{
        ConnectorError, Endpoint, ErrorOrigin, ExpressionEvaluator, GatewayError, GatewayResult,
        RequestContext,
    },
    metrics,
    pipeline::{CompiledPipeline, DefaultEvaluator, PipelineEngine, RunContext},
    plugin::FilterChain,
    route::{GatewayRoute, RouteAction, RouteTable},
    utils::{
        request,
        response::{content_type, ResponseBuilder},
    },
};

/// Everything one bundle compiles into.
#[derive(Default)]
pub struct GatewaySnapshot {
    pub version: u64,
    pub bundle: ConfigBundle,
    pub routes: RouteTable,
    /// Global plugin chain
    pub chain: FilterChain,
    pub pipelines: HashMap<String, Arc<CompiledPipeline>>,
}

impl GatewaySnapshot {
    /// Compile `bundle`, failing on the first problem found.
    pub fn compile(
        bundle: ConfigBundle,
        connectors: &ConnectorRegistry,
        evaluator: &dyn ExpressionEvaluator,
    ) -> GatewayResult<Self> {
        bundle.validate()?;

        let mut pipelines = HashMap::with_capacity(bundle.pipelines.len());
        for spec in &bundle.pipelines {
            let compiled = CompiledPipeline::compile(spec, connectors, evaluator)?;
            pipelines.insert(spec.id.clone(), Arc::new(compiled));
        }

        let routes = bundle
            .routes
            .iter()
            .map(|route| GatewayRoute::new(route.clone(), connectors, &pipelines).map(Arc::new))
            .collect::<GatewayResult<Vec<_>>>()?;
        let routes = RouteTable::build(routes)?;

        let chain = FilterChain::build(&bundle.plugins)?;

        Ok(Self {
            version: bundle.version,
            bundle,
            routes,
            chain,
            pipelines,
        })
    }
}

/// Outcome of a drain, as reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub drained: bool,
    pub in_flight: u64,
}

pub struct Gateway {
    settings: GatewaySettings,
    snapshot: ArcSwap<GatewaySnapshot>,
    connectors: ConnectorRegistry,
    admission: AdmissionController,
    engine: PipelineEngine,
    draining: AtomicBool,
    // serializes bundle applies so version checks and swaps do not interleave
    apply_lock: Mutex<()>,
    restart: Notify,
}

impl Gateway {
    pub fn new(settings: GatewaySettings, connectors: ConnectorRegistry) -> Self {
        Self::with_evaluator(settings, connectors, Arc::new(DefaultEvaluator::new()))
    }

    pub fn with_evaluator(
        settings: GatewaySettings,
        connectors: ConnectorRegistry,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            engine: PipelineEngine::new(&settings, evaluator),
            settings,
            snapshot: ArcSwap::from_pointee(GatewaySnapshot::default()),
            connectors,
            admission: AdmissionController::new(),
            draining: AtomicBool::new(false),
            apply_lock: Mutex::new(()),
            restart: Notify::new(),
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn snapshot(&self) -> Arc<GatewaySnapshot> {
        self.snapshot.load_full()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Validate, compile and activate `bundle`.
    ///
    /// Returns `Ok(false)` when the bundle is identical to the active one. On any error the
    /// active snapshot is left untouched.
    pub fn apply_bundle(&self, bundle: ConfigBundle) -> GatewayResult<bool> {
        let _guard = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot.load();
        if bundle.version < current.version {
            return Err(config_error!(
                "Stale bundle version {} (active version is {})",
                bundle.version,
                current.version
            ));
        }
        if bundle.version == current.version && bundle == current.bundle {
            log::debug!("Bundle version {} is already active", bundle.version);
            return Ok(false);
        }

        let next = GatewaySnapshot::compile(
            bundle,
            &self.connectors,
            self.engine.evaluator().as_ref(),
        )
        .map_err(|e| {
            log::error!("Rejected bundle, keeping version {}: {}", current.version, e);
            e
        })?;

        self.admission.update_policies(
            &next.bundle.admission,
            next.bundle.routes.iter().map(|r| r.id.as_str()),
        );

        log::info!(
            "Activating bundle version {} ({} routes, {} pipelines)",
            next.version,
            next.routes.len(),
            next.pipelines.len()
        );
        self.snapshot.store(Arc::new(next));
        Ok(true)
    }

    /// Serve one request end to end. Failures become structured error responses.
    ///
    /// `cancel` should be cancelled when the client goes away.
    pub async fn handle(
        &self,
        req: Request<Bytes>,
        client_addr: Option<IpAddr>,
        cancel: CancellationToken,
    ) -> Response<Bytes> {
        match self.admit() {
            Ok(permit) => self.serve(req, client_addr, cancel, permit).await,
            Err(e) => self.reject(&e),
        }
    }

    /// Admit a request into the global scope.
    ///
    /// Callers that still have to read the request body do this first, so a saturated
    /// gateway turns requests away before buffering anything.
    pub fn admit(&self) -> GatewayResult<AdmissionPermit> {
        if self.is_draining() {
            return Err(GatewayError::Unavailable("gateway is draining".to_string()));
        }
        self.admission.try_admit(&[GLOBAL_SCOPE])
    }

    /// Serve a request that already holds its global permit.
    pub async fn serve(
        &self,
        mut req: Request<Bytes>,
        client_addr: Option<IpAddr>,
        cancel: CancellationToken,
        permit: AdmissionPermit,
    ) -> Response<Bytes> {
        let snapshot = self.snapshot.load_full();

        let mut ctx = RequestContext::new(uuid::Uuid::new_v4().to_string(), cancel);
        ctx.client_addr = client_addr;
        ctx.client_id = request::get_req_header_value(&req, &self.settings.client_id_header)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        ctx.hold_permit(permit);

        let result = self.process(&snapshot, &mut req, &mut ctx).await;
        if let Some(success) = outcome(&result) {
            ctx.record_outcome(success);
        }

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                if e.status_code().is_server_error() {
                    log::warn!("request {} failed: {}", ctx.request_id, e);
                } else {
                    log::debug!("request {} rejected: {}", ctx.request_id, e);
                }
                ResponseBuilder::error(&e)
            }
        };

        let route = ctx.route.as_ref().map_or("", |r| r.id());
        metrics::REQUESTS
            .with_label_values(&[route, resp.status().as_str()])
            .inc();

        resp
    }

    /// Answer a request that never got as far as [`Gateway::serve`].
    pub fn reject(&self, err: &GatewayError) -> Response<Bytes> {
        log::debug!("request rejected: {err}");
        let resp = ResponseBuilder::error(err);
        metrics::REQUESTS
            .with_label_values(&["", resp.status().as_str()])
            .inc();
        resp
    }

    async fn process(
        &self,
        snapshot: &GatewaySnapshot,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
    ) -> GatewayResult<Response<Bytes>> {
        let endpoint = RouteEndpoint {
            gateway: self,
            snapshot,
        };
        snapshot.chain.dispatch(req, ctx, &endpoint).await
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Stop taking new requests and wait for admitted ones to finish.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        self.draining.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;

        loop {
            let in_flight = self.admission.in_flight();
            if in_flight == 0 {
                log::info!("Drain complete");
                return DrainReport {
                    drained: true,
                    in_flight,
                };
            }
            if Instant::now() >= deadline {
                log::warn!("Drain timed out with {in_flight} requests in flight");
                return DrainReport {
                    drained: false,
                    in_flight,
                };
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn request_restart(&self) {
        self.restart.notify_one();
    }

    /// Resolves once a restart was requested.
    pub async fn restart_requested(&self) {
        self.restart.notified().await
    }
}

/// Whether a finished request counts as a success for the circuit breakers.
///
/// Requests turned away before reaching a backend carry no verdict.
fn outcome(result: &GatewayResult<Response<Bytes>>) -> Option<bool> {
    match result {
        Ok(resp) => Some(!resp.status().is_server_error()),
        Err(
            GatewayError::AdmissionRejected { .. }
            | GatewayError::NotFound(_)
            | GatewayError::Unavailable(_),
        ) => None,
        Err(e) => Some(!e.status_code().is_server_error()),
    }
}

/// End of the global chain: resolves the route and runs the route's own chain.
struct RouteEndpoint<'a> {
    gateway: &'a Gateway,
    snapshot: &'a GatewaySnapshot,
}

#[async_trait]
impl Endpoint for RouteEndpoint<'_> {
    async fn call(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
    ) -> GatewayResult<Response<Bytes>> {
        let (route, params) = self
            .snapshot
            .routes
            .resolve(req.method(), req.uri().path(), ctx.client_id.as_deref())
            .ok_or_else(|| {
                GatewayError::NotFound(format!("no route for {} {}", req.method(), req.uri().path()))
            })?;

        let scope = route_scope(route.id());
        let permit = self.gateway.admission.try_admit(&[scope.as_str()])?;
        ctx.hold_permit(permit);

        if let Some(timeout) = route.timeout() {
            ctx.set_timeout(timeout);
        }
        ctx.route = Some(route.clone());
        ctx.route_params = params;

        let target = TargetEndpoint {
            gateway: self.gateway,
            route: &route,
        };
        route.plugins.dispatch(req, ctx, &target).await
    }
}

/// End of a route chain: the proxy call or the pipeline.
struct TargetEndpoint<'a> {
    gateway: &'a Gateway,
    route: &'a GatewayRoute,
}

#[async_trait]
impl Endpoint for TargetEndpoint<'_> {
    async fn call(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
    ) -> GatewayResult<Response<Bytes>> {
        match &self.route.action {
            RouteAction::Pipeline(pipeline) => {
                let run = RunContext {
                    request_id: ctx.request_id.clone(),
                    client_id: ctx.client_id.clone(),
                    cancel: ctx.cancel.clone(),
                    deadline: ctx.deadline,
                };
                let output = self
                    .gateway
                    .engine
                    .run(pipeline, request::input_bindings(req, ctx), run)
                    .await?;
                Ok(ResponseBuilder::success_json(&output))
            }
            RouteAction::Proxy { connector, config } => {
                let deadline = ctx.deadline.unwrap_or_else(|| {
                    Instant::now() + Duration::from_millis(self.gateway.settings.request_timeout_ms)
                });
                let step = StepContext {
                    pipeline: self.route.id().to_string(),
                    step: connector.type_name().to_string(),
                    request_id: ctx.request_id.clone(),
                    client_id: ctx.client_id.clone(),
                    bindings: Arc::new(request::input_bindings(req, ctx)),
                    cancel: ctx.cancel.child_token(),
                    deadline,
                };

                let call = step.cancellable(connector.execute(&step, config));
                let result = match tokio::time::timeout_at(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectorError::timeout("route deadline exceeded").into()),
                };

                match result {
                    Ok(value) => Ok(proxy_response(connector.type_name(), value)),
                    Err(GatewayError::Connector(e)) => upstream_error_response(e),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

fn body_bytes(body: &JsonValue) -> (Bytes, Option<&'static str>) {
    match body {
        JsonValue::Null => (Bytes::new(), None),
        JsonValue::String(text) => (Bytes::from(text.clone()), None),
        other => (
            Bytes::from(other.to_string()),
            Some(content_type::APPLICATION_JSON),
        ),
    }
}

// headers that describe the upstream encoding rather than the re-encoded body
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "keep-alive",
];

/// Turn a proxy connector result into the client response.
///
/// An HTTP connector result keeps the upstream status and headers; any other result is
/// returned as a JSON document.
fn proxy_response(connector: &str, value: JsonValue) -> Response<Bytes> {
    if connector != crate::connector::http::CONNECTOR_TYPE {
        return ResponseBuilder::success_json(&value);
    }

    let status = value["status"]
        .as_u64()
        .and_then(|s| u16::try_from(s).ok())
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK);
    let (body, json_type) = body_bytes(&value["body"]);
    let mut resp = ResponseBuilder::with_body(status, body, None);

    if let Some(headers) = value["headers"].as_object() {
        for (name, value) in headers {
            if SKIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            let (Ok(name), Some(Ok(value))) = (
                HeaderName::from_bytes(name.as_bytes()),
                value.as_str().map(HeaderValue::from_str),
            ) else {
                continue;
            };
            resp.headers_mut().insert(name, value);
        }
    }
    if let Some(ct) = json_type {
        resp.headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(ct));
    }
    resp
}

/// Pass a backend's own error status through; everything else stays a gateway error.
fn upstream_error_response(err: ConnectorError) -> GatewayResult<Response<Bytes>> {
    let status = match (err.origin, err.status) {
        (ErrorOrigin::Client | ErrorOrigin::Server, Some(status)) => StatusCode::from_u16(status).ok(),
        _ => None,
    };
    let Some(status) = status else {
        return Err(GatewayError::Connector(err));
    };

    let (body, json_type) = body_bytes(err.body.as_ref().unwrap_or(&JsonValue::Null));
    Ok(ResponseBuilder::with_body(
        status,
        body,
        json_type.or(Some(content_type::TEXT_PLAIN)),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::core::{Connector, ParsedConfig};

    fn gateway() -> Gateway {
        Gateway::new(GatewaySettings::default(), ConnectorRegistry::with_builtin())
    }

    fn bundle(yaml: &str) -> ConfigBundle {
        ConfigBundle::from_yaml(yaml).unwrap()
    }

    fn get(uri: &str) -> Request<Bytes> {
        Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    async fn body_json(resp: Response<Bytes>) -> JsonValue {
        serde_json::from_slice(resp.body()).unwrap()
    }

    const ORDERS: &str = r#"
version: 1
plugins:
  - name: response-headers
    config: {set: {x-gateway: pinggate}}
routes:
  - id: order-detail
    uri: /orders/{id}
    methods: [GET]
    target: {type: pipeline, pipeline: order-detail}
pipelines:
  - id: order-detail
    output: [order, items]
    steps:
      - name: order
        connector: static
        config: {value: {id: "${input.request.params.id}", code: 0}}
      - name: items
        connector: static
        depends_on: [order]
        condition: "order.code == 0"
        config: {value: ["${order.id}-a", "${order.id}-b"]}
      - name: audit
        connector: static
        config: {value: true}
"#;

    #[tokio::test]
    async fn test_pipeline_route_end_to_end() {
        let gw = gateway();
        assert!(gw.apply_bundle(bundle(ORDERS)).unwrap());

        let resp = gw
            .handle(get("/orders/42"), None, CancellationToken::new())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-gateway"], "pinggate");
        assert_eq!(
            body_json(resp).await,
            json!({"order": {"id": "42", "code": 0}, "items": ["42-a", "42-b"]})
        );

        let resp = gw.handle(get("/nope"), None, CancellationToken::new()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "not_found");

        let post = Request::builder()
            .method("POST")
            .uri("/orders/42")
            .body(Bytes::new())
            .unwrap();
        let resp = gw.handle(post, None, CancellationToken::new()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cyclic_bundle_keeps_previous_version() {
        let gw = gateway();
        gw.apply_bundle(bundle(ORDERS)).unwrap();

        let cyclic = bundle(
            r#"
version: 2
routes:
  - id: loop
    uri: /loop
    target: {type: pipeline, pipeline: loop}
pipelines:
  - id: loop
    steps:
      - {name: a, connector: static, depends_on: [b]}
      - {name: b, connector: static, depends_on: [a]}
"#,
        );
        let err = gw.apply_bundle(cyclic).unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert_eq!(gw.version(), 1);

        // the old bundle keeps serving concurrent requests
        let mut requests = Vec::new();
        for id in 0..8 {
            let uri = format!("/orders/{id}");
            requests.push(gw.handle(get(&uri), None, CancellationToken::new()));
        }
        for resp in futures::future::join_all(requests).await {
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = gw.handle(get("/loop"), None, CancellationToken::new()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stale_and_identical_bundles() {
        let gw = gateway();
        gw.apply_bundle(bundle(ORDERS)).unwrap();
        assert!(!gw.apply_bundle(bundle(ORDERS)).unwrap());

        let stale = bundle("version: 0\nroutes: []");
        assert!(matches!(gw.apply_bundle(stale), Err(GatewayError::Config(_))));
        assert_eq!(gw.version(), 1);
        assert_eq!(gw.snapshot().routes.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_bundles_rejected_whole() {
        let gw = gateway();
        gw.apply_bundle(bundle(ORDERS)).unwrap();

        let unknown_plugin = r#"
version: 2
plugins: [{name: teleport}]
"#;
        let unknown_connector = r#"
version: 2
pipelines:
  - id: p
    steps: [{name: a, connector: carrier-pigeon}]
"#;
        let bad_pattern = r#"
version: 2
routes:
  - id: a
    uri: /users/{id}
    target: {type: proxy, connector: static}
  - id: b
    uri: /users/{name}
    target: {type: proxy, connector: static}
"#;
        for yaml in [unknown_plugin, unknown_connector, bad_pattern] {
            assert!(gw.apply_bundle(bundle(yaml)).is_err(), "{yaml}");
            assert_eq!(gw.version(), 1);
        }
    }

    /// Holds every call until released, to keep requests in flight.
    struct GateConnector {
        release: Arc<Notify>,
        entered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for GateConnector {
        fn type_name(&self) -> &str {
            "gate"
        }

        fn validate_config(&self, _raw: &JsonValue) -> GatewayResult<ParsedConfig> {
            Ok(Arc::new(()))
        }

        async fn execute(
            &self,
            _ctx: &StepContext,
            _config: &ParsedConfig,
        ) -> GatewayResult<JsonValue> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(json!({"ok": true}))
        }
    }

    fn gated_gateway_with(yaml: &str) -> (Arc<Gateway>, Arc<Notify>, Arc<AtomicUsize>) {
        let release = Arc::new(Notify::new());
        let entered = Arc::new(AtomicUsize::new(0));
        let mut connectors = ConnectorRegistry::with_builtin();
        connectors
            .register(Arc::new(GateConnector {
                release: release.clone(),
                entered: entered.clone(),
            }))
            .unwrap();
        let gw = Arc::new(Gateway::new(GatewaySettings::default(), connectors));
        gw.apply_bundle(bundle(yaml)).unwrap();
        (gw, release, entered)
    }

    fn gated_gateway() -> (Arc<Gateway>, Arc<Notify>, Arc<AtomicUsize>) {
        gated_gateway_with(
            r#"
version: 1
routes:
  - id: r
    uri: /slow
    target: {type: proxy, connector: gate}
admission:
  routes:
    r: {max_concurrents: 2}
"#,
        )
    }

    async fn wait_entered(entered: &AtomicUsize, n: usize) {
        while entered.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_route_concurrency_ceiling() {
        let (gw, release, entered) = gated_gateway();

        let spawn = |gw: Arc<Gateway>| {
            tokio::spawn(async move {
                gw.handle(get("/slow"), None, CancellationToken::new())
                    .await
                    .status()
            })
        };
        let first = spawn(gw.clone());
        let second = spawn(gw.clone());
        wait_entered(&entered, 2).await;

        let third = gw.handle(get("/slow"), None, CancellationToken::new()).await;
        assert_eq!(third.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(third).await["error"], "admission_rejected");

        release.notify_one();
        let done = tokio::select! {
            s = first => s.unwrap(),
            s = second => s.unwrap(),
        };
        assert_eq!(done, StatusCode::OK);

        let fourth = spawn(gw.clone());
        wait_entered(&entered, 3).await;
        assert_eq!(gw.admission().in_flight(), 2);
        release.notify_waiters();
        release.notify_one();
        assert_eq!(fourth.await.unwrap(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_requests() {
        let (gw, release, entered) = gated_gateway();
        let pending = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.handle(get("/slow"), None, CancellationToken::new()).await })
        };
        wait_entered(&entered, 1).await;

        let report = gw.drain(Duration::from_millis(50)).await;
        assert_eq!(
            report,
            DrainReport {
                drained: false,
                in_flight: 1
            }
        );

        let resp = gw.handle(get("/slow"), None, CancellationToken::new()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["error"], "unavailable");

        release.notify_one();
        assert_eq!(pending.await.unwrap().status(), StatusCode::OK);
        assert!(gw.drain(Duration::from_secs(1)).await.drained);
    }

    #[tokio::test]
    async fn test_proxy_route_passes_upstream_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/7"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-upstream", "yes")
                    .set_body_json(json!({"name": "ann"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/8"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such user"))
            .mount(&server)
            .await;

        let gw = gateway();
        let yaml = format!(
            r#"
version: 1
routes:
  - id: users
    uri: /users/{{id}}
    target:
      type: proxy
      connector: http
      config: {{url: "{}/users/${{input.request.params.id}}"}}
"#,
            server.uri()
        );
        gw.apply_bundle(bundle(&yaml)).unwrap();

        let resp = gw.handle(get("/users/7"), None, CancellationToken::new()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-upstream"], "yes");
        assert_eq!(body_json(resp).await, json!({"name": "ann"}));

        let resp = gw.handle(get("/users/8"), None, CancellationToken::new()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.body().as_ref(), b"no such user");
    }

    #[tokio::test]
    async fn test_client_identity_selects_dedicated_route() {
        let gw = gateway();
        gw.apply_bundle(bundle(
            r#"
version: 1
routes:
  - id: general
    uri: /quote
    target: {type: proxy, connector: static, config: {value: general}}
  - id: acme
    uri: /quote
    client_id: acme
    target: {type: proxy, connector: static, config: {value: "${input.client}"}}
"#,
        ))
        .unwrap();

        let req = Request::builder()
            .uri("/quote")
            .header("X-Client-Id", "acme")
            .body(Bytes::new())
            .unwrap();
        let resp = gw.handle(req, None, CancellationToken::new()).await;
        assert_eq!(body_json(resp).await, json!("acme"));

        let resp = gw.handle(get("/quote"), None, CancellationToken::new()).await;
        assert_eq!(body_json(resp).await, json!("general"));
    }

    #[tokio::test]
    async fn test_in_flight_request_keeps_its_snapshot() {
        let (gw, release, entered) = gated_gateway_with(
            r#"
version: 1
plugins:
  - name: response-headers
    config: {set: {x-chain: v1}}
routes:
  - id: r
    uri: /slow
    target: {type: proxy, connector: gate}
"#,
        );
        let pending = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.handle(get("/slow"), None, CancellationToken::new()).await })
        };
        wait_entered(&entered, 1).await;

        // swap both the global chain and the route target while the request is held
        gw.apply_bundle(bundle(
            r#"
version: 2
plugins:
  - name: response-headers
    config: {set: {x-chain: v2}}
routes:
  - id: r
    uri: /slow
    target: {type: proxy, connector: static, config: {value: new}}
"#,
        ))
        .unwrap();
        release.notify_one();

        let old = pending.await.unwrap();
        assert_eq!(old.status(), StatusCode::OK);
        assert_eq!(old.headers()["x-chain"], "v1");
        assert_eq!(body_json(old).await, json!({"ok": true}));

        let new = gw.handle(get("/slow"), None, CancellationToken::new()).await;
        assert_eq!(new.headers()["x-chain"], "v2");
        assert_eq!(body_json(new).await, json!("new"));
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_route_breaker_opens_on_upstream_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(2)
            .mount(&server)
            .await;

        let gw = gateway();
        let yaml = format!(
            r#"
version: 1
routes:
  - id: flaky
    uri: /flaky
    target:
      type: proxy
      connector: http
      config: {{url: "{}/flaky"}}
admission:
  routes:
    flaky:
      breaker: {{min_requests: 2, error_ratio_percent: 50, break_secs: 60}}
"#,
            server.uri()
        );
        gw.apply_bundle(bundle(&yaml)).unwrap();

        for _ in 0..2 {
            let resp = gw.handle(get("/flaky"), None, CancellationToken::new()).await;
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }

        let resp = gw.handle(get("/flaky"), None, CancellationToken::new()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "admission_rejected");
        assert!(body["message"].as_str().unwrap().contains("degraded"));
        assert_eq!(gw.admission().snapshot()["route:flaky"].breaker, Some("open"));
        assert_eq!(gw.admission().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_admit_then_serve() {
        let gw = gateway();
        gw.apply_bundle(bundle(ORDERS)).unwrap();

        let permit = gw.admit().unwrap();
        assert_eq!(gw.admission().in_flight(), 1);
        let resp = gw
            .serve(get("/orders/1"), None, CancellationToken::new(), permit)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(gw.admission().in_flight(), 0);

        gw.drain(Duration::from_millis(10)).await;
        let err = gw.admit().unwrap_err();
        assert_eq!(gw.reject(&err).status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_out_of_range_upstream_status() {
        // truncated to u16 this would read as 404
        let resp = proxy_response("http", json!({"status": 65940, "body": "x"}));
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = proxy_response("http", json!({"status": 65999, "body": "x"}));
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = proxy_response("http", json!({"status": 418, "body": "x"}));
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
    }
}
