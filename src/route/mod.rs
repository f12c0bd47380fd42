//! Route resolution
//!
//! Routes are grouped by path pattern into `matchit` routers: one general router plus one
//! router per dedicated client. A dedicated router is consulted first for the requesting
//! client, so a dedicated route shadows a general route with the same pattern.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use http::Method;
use matchit::Router as MatchRouter;
use serde_json::Value as JsonValue;

use crate::{
    config::{self, RouteTarget},
    config_error,
    connector::ConnectorRegistry,
    core::{Connector, GatewayResult, ParsedConfig},
    pipeline::CompiledPipeline,
    plugin::FilterChain,
};

/// What a resolved route runs once its plugins let the request through.
pub enum RouteAction {
    /// One connector call whose result becomes the response
    Proxy {
        connector: Arc<dyn Connector>,
        config: ParsedConfig,
    },
    Pipeline(Arc<CompiledPipeline>),
}

/// A route with its plugin chain built and its target resolved.
pub struct GatewayRoute {
    pub inner: config::Route,
    methods: Vec<Method>,
    pub plugins: FilterChain,
    pub action: RouteAction,
}

impl GatewayRoute {
    pub fn new(
        route: config::Route,
        connectors: &ConnectorRegistry,
        pipelines: &HashMap<String, Arc<CompiledPipeline>>,
    ) -> GatewayResult<Self> {
        let plugins = FilterChain::build(&route.plugins)
            .map_err(|e| config_error!("Route {}: {}", route.id, e))?;

        let action = match &route.target {
            RouteTarget::Proxy { connector, config } => {
                let connector = connectors.lookup(connector).ok_or_else(|| {
                    config_error!("Route {} uses unknown connector type {}", route.id, connector)
                })?;
                let raw = match config {
                    JsonValue::Null => JsonValue::Object(Default::default()),
                    other => other.clone(),
                };
                let config = connector
                    .validate_config(&raw)
                    .map_err(|e| config_error!("Route {}: {}", route.id, e))?;
                RouteAction::Proxy { connector, config }
            }
            RouteTarget::Pipeline { pipeline } => {
                let compiled = pipelines.get(pipeline).ok_or_else(|| {
                    config_error!("Route {} references unknown pipeline {}", route.id, pipeline)
                })?;
                RouteAction::Pipeline(compiled.clone())
            }
        };

        Ok(Self {
            methods: route.methods.iter().map(Method::from).collect(),
            inner: route,
            plugins,
            action,
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout_ms.map(Duration::from_millis)
    }

    fn accepts(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}

type Candidates = Vec<Arc<GatewayRoute>>;

/// Immutable route index built from one bundle.
#[derive(Default)]
pub struct RouteTable {
    general: MatchRouter<Candidates>,
    dedicated: HashMap<String, MatchRouter<Candidates>>,
    len: usize,
}

impl RouteTable {
    /// Index `routes`; disabled routes are left out.
    pub fn build(routes: Vec<Arc<GatewayRoute>>) -> GatewayResult<Self> {
        let mut general: BTreeMap<String, Candidates> = BTreeMap::new();
        let mut dedicated: HashMap<String, BTreeMap<String, Candidates>> = HashMap::new();
        let mut len = 0;

        for route in routes.into_iter().filter(|r| r.inner.enabled) {
            let patterns = match &route.inner.client_id {
                Some(client) => dedicated.entry(client.clone()).or_default(),
                None => &mut general,
            };
            for uri in route.inner.get_uris() {
                patterns.entry(uri).or_default().push(route.clone());
            }
            len += 1;
        }

        let mut table = RouteTable {
            general: Self::router(general)?,
            dedicated: HashMap::with_capacity(dedicated.len()),
            len,
        };
        for (client, patterns) in dedicated {
            table.dedicated.insert(client, Self::router(patterns)?);
        }
        Ok(table)
    }

    fn router(patterns: BTreeMap<String, Candidates>) -> GatewayResult<MatchRouter<Candidates>> {
        let mut router = MatchRouter::new();
        for (uri, mut candidates) in patterns {
            // higher priority first, stable for equal priorities
            candidates.sort_by(|a, b| b.inner.priority.cmp(&a.inner.priority));
            router
                .insert(uri.as_str(), candidates)
                .map_err(|e| config_error!("Invalid route pattern {}: {}", uri, e))?;
        }
        Ok(router)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Find the route for a request.
    ///
    /// Returns the route together with the parameters captured from its pattern.
    pub fn resolve(
        &self,
        method: &Method,
        path: &str,
        client_id: Option<&str>,
    ) -> Option<(Arc<GatewayRoute>, BTreeMap<String, String>)> {
        log::debug!("resolve route: method={method}, path={path:?}, client={client_id:?}");

        client_id
            .and_then(|client| self.dedicated.get(client))
            .and_then(|router| Self::match_path(router, method, path))
            .or_else(|| Self::match_path(&self.general, method, path))
    }

    fn match_path(
        router: &MatchRouter<Candidates>,
        method: &Method,
        path: &str,
    ) -> Option<(Arc<GatewayRoute>, BTreeMap<String, String>)> {
        let matched = router.at(path).ok()?;
        let route = matched.value.iter().find(|r| r.accepts(method))?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some((route.clone(), params))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::ConfigBundle;

    fn table(yaml: &str) -> GatewayResult<RouteTable> {
        let bundle = ConfigBundle::from_yaml(yaml)?;
        let connectors = ConnectorRegistry::with_builtin();
        let routes = bundle
            .routes
            .into_iter()
            .map(|r| GatewayRoute::new(r, &connectors, &HashMap::new()).map(Arc::new))
            .collect::<GatewayResult<Vec<_>>>()?;
        RouteTable::build(routes)
    }

    fn static_value(route: &GatewayRoute) -> JsonValue {
        match &route.inner.target {
            RouteTarget::Proxy { config, .. } => config["value"].clone(),
            RouteTarget::Pipeline { .. } => JsonValue::Null,
        }
    }

    const ROUTES: &str = r#"
routes:
  - id: general-orders
    uri: /orders/{id}
    target: {type: proxy, connector: static, config: {value: general}}
  - id: acme-orders
    uri: /orders/{id}
    client_id: acme
    target: {type: proxy, connector: static, config: {value: dedicated}}
  - id: order-items
    uri: /orders/{id}/items
    methods: [GET]
    target: {type: proxy, connector: static, config: {value: items}}
  - id: catch-all
    uri: /{*rest}
    target: {type: proxy, connector: static, config: {value: fallback}}
  - id: disabled
    uri: /off
    enabled: false
    target: {type: proxy, connector: static, config: {value: off}}
"#;

    #[test]
    fn test_dedicated_route_wins_for_its_client() {
        let table = table(ROUTES).unwrap();
        assert_eq!(table.len(), 4);

        let (route, params) = table.resolve(&Method::GET, "/orders/7", Some("acme")).unwrap();
        assert_eq!(route.id(), "acme-orders");
        assert_eq!(params.get("id").map(String::as_str), Some("7"));

        let (route, _) = table.resolve(&Method::GET, "/orders/7", Some("globex")).unwrap();
        assert_eq!(route.id(), "general-orders");
        assert_eq!(static_value(&route), json!("general"));

        let (route, _) = table.resolve(&Method::GET, "/orders/7", None).unwrap();
        assert_eq!(route.id(), "general-orders");
    }

    #[test]
    fn test_most_specific_pattern_and_method() {
        let table = table(ROUTES).unwrap();

        let (route, _) = table.resolve(&Method::GET, "/orders/7/items", None).unwrap();
        assert_eq!(route.id(), "order-items");

        // dedicated client falls back to the general table for patterns it does not own
        let (route, _) = table
            .resolve(&Method::GET, "/orders/7/items", Some("acme"))
            .unwrap();
        assert_eq!(route.id(), "order-items");

        assert!(table.resolve(&Method::POST, "/orders/7/items", None).is_none());

        let (route, params) = table.resolve(&Method::GET, "/off", None).unwrap();
        assert_eq!(route.id(), "catch-all");
        assert_eq!(params.get("rest").map(String::as_str), Some("off"));
    }

    #[test]
    fn test_priority_orders_same_pattern() {
        let table = table(
            r#"
routes:
  - id: low
    uri: /ping
    target: {type: proxy, connector: static, config: {value: low}}
  - id: high
    uri: /ping
    priority: 10
    target: {type: proxy, connector: static, config: {value: high}}
"#,
        )
        .unwrap();
        let (route, _) = table.resolve(&Method::GET, "/ping", None).unwrap();
        assert_eq!(route.id(), "high");
    }

    #[test]
    fn test_rejects_bad_routes() {
        let conflicting = r#"
routes:
  - id: a
    uri: /users/{id}
    target: {type: proxy, connector: static, config: {value: 1}}
  - id: b
    uri: /users/{name}
    target: {type: proxy, connector: static, config: {value: 2}}
"#;
        assert!(table(conflicting).is_err());

        let unknown_connector = r#"
routes:
  - id: a
    uri: /a
    target: {type: proxy, connector: carrier-pigeon}
"#;
        assert!(table(unknown_connector).is_err());

        let unknown_pipeline = r#"
routes:
  - id: a
    uri: /a
    target: {type: pipeline, pipeline: nope}
"#;
        assert!(table(unknown_pipeline).is_err());
    }
}
