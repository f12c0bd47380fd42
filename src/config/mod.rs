pub mod etcd;

use std::fs;
use std::net::SocketAddr;
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::{Validate, ValidationError};

use crate::{
    config_error,
    core::{GatewayError, GatewayResult},
};

/// Bootstrap configuration read from the YAML file given with `-c`.
///
/// The initial [`ConfigBundle`] is inlined at the top level; later bundles arrive through
/// etcd or the admin API and replace it wholesale.
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[serde(default)]
    #[validate(nested)]
    pub gateway: GatewaySettings,

    #[validate(nested)]
    pub admin: Option<Admin>,
    pub status: Option<Status>,
    #[validate(nested)]
    pub etcd: Option<Etcd>,
    pub log: Option<Log>,

    #[serde(flatten)]
    #[validate(nested)]
    pub bundle: ConfigBundle,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

/// Knobs for the request path that are not part of a bundle.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct GatewaySettings {
    #[serde(default = "GatewaySettings::default_client_id_header")]
    #[validate(length(min = 1))]
    pub client_id_header: String,
    #[serde(default = "GatewaySettings::default_request_timeout_ms")]
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
    #[serde(default = "GatewaySettings::default_step_timeout_ms")]
    #[validate(range(min = 1))]
    pub default_step_timeout_ms: u64,
    #[serde(default = "GatewaySettings::default_max_step_timeout_ms")]
    #[validate(range(min = 1))]
    pub max_step_timeout_ms: u64,
    #[serde(default = "GatewaySettings::default_max_inflight_steps")]
    #[validate(range(min = 1))]
    pub max_inflight_steps: usize,
    #[serde(default = "GatewaySettings::default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Larger request bodies are refused with 413 before they are buffered
    #[serde(default = "GatewaySettings::default_max_body_bytes")]
    #[validate(range(min = 1))]
    pub max_body_bytes: usize,
}

impl GatewaySettings {
    fn default_client_id_header() -> String {
        "X-Client-Id".to_string()
    }

    fn default_request_timeout_ms() -> u64 {
        10_000
    }

    fn default_step_timeout_ms() -> u64 {
        3_000
    }

    fn default_max_step_timeout_ms() -> u64 {
        10_000
    }

    fn default_max_inflight_steps() -> usize {
        1024
    }

    fn default_drain_timeout_ms() -> u64 {
        30_000
    }

    fn default_max_body_bytes() -> usize {
        10 * 1024 * 1024
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            client_id_header: Self::default_client_id_header(),
            request_timeout_ms: Self::default_request_timeout_ms(),
            default_step_timeout_ms: Self::default_step_timeout_ms(),
            max_step_timeout_ms: Self::default_max_step_timeout_ms(),
            max_inflight_steps: Self::default_max_inflight_steps(),
            drain_timeout_ms: Self::default_drain_timeout_ms(),
            max_body_bytes: Self::default_max_body_bytes(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Admin {
    pub address: SocketAddr,
    #[validate(length(min = 1))]
    pub api_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Etcd {
    #[validate(length(min = 1))]
    pub host: Vec<String>,
    #[serde(default = "Etcd::default_prefix")]
    pub prefix: String,
    pub timeout: Option<u32>,
    pub connect_timeout: Option<u32>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Etcd {
    fn default_prefix() -> String {
        "/pinggate".to_string()
    }

    /// Key holding the JSON-encoded [`ConfigBundle`].
    pub fn bundle_key(&self) -> String {
        format!("{}/bundle", self.prefix.trim_end_matches('/'))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

/// A versioned set of routes, plugin chain, pipelines and admission policies.
///
/// Bundles are applied whole: every part is validated before any of it becomes active.
#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "ConfigBundle::validate_unique_ids"))]
pub struct ConfigBundle {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    #[validate(nested)]
    pub routes: Vec<Route>,
    /// Global plugin chain, run in order for every request
    #[serde(default)]
    #[validate(nested)]
    pub plugins: Vec<PluginSpec>,
    #[serde(default)]
    #[validate(nested)]
    pub pipelines: Vec<PipelineSpec>,
    #[serde(default)]
    pub admission: AdmissionPolicies,
}

impl ConfigBundle {
    pub fn from_json(data: &[u8]) -> GatewayResult<Self> {
        let bundle: ConfigBundle = serde_json::from_slice(data)
            .map_err(|e| config_error!("Unable to parse bundle: {}", e))?;
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn from_yaml(data: &str) -> GatewayResult<Self> {
        let bundle: ConfigBundle = serde_yaml::from_str(data)
            .map_err(|e| config_error!("Unable to parse bundle: {}", e))?;
        bundle.validate()?;
        Ok(bundle)
    }

    fn validate_unique_ids(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.id.as_str()) {
                let mut err = ValidationError::new("duplicate_route_id");
                err.add_param("id".into(), &route.id);
                return Err(err);
            }
        }

        let mut seen = HashSet::new();
        for pipeline in &self.pipelines {
            if !seen.insert(pipeline.id.as_str()) {
                let mut err = ValidationError::new("duplicate_pipeline_id");
                err.add_param("id".into(), &pipeline.id);
                return Err(err);
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Route::validate"))]
pub struct Route {
    #[validate(length(min = 1))]
    pub id: String,

    pub uri: Option<String>,
    #[serde(default)]
    pub uris: Vec<String>,
    /// Empty means any method
    #[serde(default)]
    pub methods: Vec<HttpMethod>,
    #[serde(default)]
    pub priority: u32,

    /// Dedicated line: only requests carrying this client identity match the route
    pub client_id: Option<String>,

    #[serde(default = "Route::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub version: u64,

    /// Route-level plugins, run after the global chain once this route is resolved
    #[serde(default)]
    #[validate(nested)]
    pub plugins: Vec<PluginSpec>,

    pub target: RouteTarget,

    pub timeout_ms: Option<u64>,
}

impl Route {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.uri.is_none() && self.uris.is_empty() {
            return Err(ValidationError::new("uri_or_uris_required"));
        }

        if matches!(self.client_id.as_deref(), Some("")) {
            return Err(ValidationError::new("client_id_must_not_be_empty"));
        }

        Ok(())
    }

    pub fn get_uris(&self) -> Vec<String> {
        if let Some(uri) = &self.uri {
            vec![uri.to_string()]
        } else {
            self.uris.clone()
        }
    }

    fn default_enabled() -> bool {
        true
    }
}

/// What a resolved route does with the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteTarget {
    /// A single connector call whose result becomes the response
    Proxy {
        connector: String,
        #[serde(default)]
        config: JsonValue,
    },
    /// An aggregation pipeline
    Pipeline { pipeline: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
    CONNECT,
    TRACE,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let method = match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::OPTIONS => "OPTIONS",
            HttpMethod::CONNECT => "CONNECT",
            HttpMethod::TRACE => "TRACE",
        };
        write!(f, "{}", method)
    }
}

impl From<&HttpMethod> for http::Method {
    fn from(method: &HttpMethod) -> Self {
        match method {
            HttpMethod::GET => http::Method::GET,
            HttpMethod::POST => http::Method::POST,
            HttpMethod::PUT => http::Method::PUT,
            HttpMethod::DELETE => http::Method::DELETE,
            HttpMethod::PATCH => http::Method::PATCH,
            HttpMethod::HEAD => http::Method::HEAD,
            HttpMethod::OPTIONS => http::Method::OPTIONS,
            HttpMethod::CONNECT => http::Method::CONNECT,
            HttpMethod::TRACE => http::Method::TRACE,
        }
    }
}

/// One entry of a plugin chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct PluginSpec {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub config: JsonValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "PipelineSpec::validate_names"))]
pub struct PipelineSpec {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub steps: Vec<StepSpec>,
    /// Bindings returned to the client; empty returns all of them
    #[serde(default)]
    pub output: Vec<String>,
    pub timeout_ms: Option<u64>,
    #[validate(range(min = 1))]
    pub max_concurrency: Option<usize>,
}

impl PipelineSpec {
    fn validate_names(&self) -> Result<(), ValidationError> {
        let mut names = HashSet::new();
        let mut bindings = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                let mut err = ValidationError::new("duplicate_step_name");
                err.add_param("step".into(), &step.name);
                return Err(err);
            }
            if !bindings.insert(step.binding()) {
                let mut err = ValidationError::new("duplicate_binding_name");
                err.add_param("binding".into(), &step.binding());
                return Err(err);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct StepSpec {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub connector: String,
    #[serde(default)]
    pub config: JsonValue,
    pub condition: Option<String>,
    /// Ordering only; a skipped dependency is seen as an absent binding
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Ordering plus presence: a missing binding fails the step
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    pub bind: Option<String>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

impl StepSpec {
    /// Name under which the step's result is bound
    pub fn binding(&self) -> &str {
        self.bind.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Fatal,
    Tolerated {
        #[serde(default)]
        default: JsonValue,
    },
}

#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdmissionPolicies {
    pub global: Option<AdmissionLimits>,
    /// Applied to routes without an entry in `routes`
    pub route_default: Option<AdmissionLimits>,
    #[serde(default)]
    pub routes: HashMap<String, AdmissionLimits>,
}

impl AdmissionPolicies {
    pub fn for_route(&self, route_id: &str) -> AdmissionLimits {
        self.routes
            .get(route_id)
            .copied()
            .or(self.route_default)
            .unwrap_or_default()
    }
}

/// Ceilings for one admission scope; zero means unlimited.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionLimits {
    #[serde(default)]
    pub max_concurrents: u64,
    #[serde(default)]
    pub max_rps: u64,
    /// Error-ratio circuit breaker; absent means never degraded
    #[serde(default)]
    pub breaker: Option<BreakerPolicy>,
}

/// When a scope stops taking traffic because too much of it fails.
///
/// Outcomes are tallied over `monitor_secs`. Once `min_requests` have finished in the
/// window and at least `error_ratio_percent` of them failed, the scope rejects everything
/// for `break_secs`, then lets a single trial request through to decide whether to recover.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerPolicy {
    #[serde(default = "BreakerPolicy::default_error_ratio_percent")]
    pub error_ratio_percent: u64,
    #[serde(default = "BreakerPolicy::default_min_requests")]
    pub min_requests: u64,
    #[serde(default = "BreakerPolicy::default_monitor_secs")]
    pub monitor_secs: u64,
    #[serde(default = "BreakerPolicy::default_break_secs")]
    pub break_secs: u64,
}

impl BreakerPolicy {
    fn default_error_ratio_percent() -> u64 {
        50
    }

    fn default_min_requests() -> u64 {
        20
    }

    fn default_monitor_secs() -> u64 {
        10
    }

    fn default_break_secs() -> u64 {
        5
    }
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            error_ratio_percent: Self::default_error_ratio_percent(),
            min_requests: Self::default_min_requests(),
            monitor_secs: Self::default_monitor_secs(),
            break_secs: Self::default_break_secs(),
        }
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(err: validator::ValidationErrors) -> Self {
        config_error!("{}", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
pingora:
  version: 1
  client_bind_to_ipv4:
      - 1.2.3.4
      - 5.6.7.8
  client_bind_to_ipv6: []

listeners:
  - address: 0.0.0.0:8080
  - address: "[::1]:8080"
    tls:
      cert_path: /etc/ssl/server.crt
      key_path: /etc/ssl/server.key
    offer_h2: true

gateway:
  client_id_header: X-App-Id

status:
  address: 127.0.0.1:7085

version: 3

plugins:
  - name: request-id

routes:
  - id: orders
    uri: /api/orders/{id}
    methods: [GET]
    target:
      type: pipeline
      pipeline: order-detail
  - id: legacy
    uri: /legacy/{*rest}
    client_id: tenant-a
    target:
      type: proxy
      connector: http
      config:
        url: "http://127.0.0.1:1980/${input.request.params.rest}"

pipelines:
  - id: order-detail
    timeout_ms: 2000
    steps:
      - name: order
        connector: http
        config:
          url: "http://127.0.0.1:1980/orders/${input.request.params.id}"
      - name: user
        connector: http
        depends_on: [order]
        condition: "order.status == 200"
        on_failure:
          mode: tolerated
          default: {}
        config:
          url: "http://127.0.0.1:1981/users"

admission:
  global:
    max_concurrents: 1000
  routes:
    orders:
      max_rps: 50
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(2, conf.pingora.client_bind_to_ipv4.len());
        assert_eq!(2, conf.listeners.len());
        assert_eq!("X-App-Id", conf.gateway.client_id_header);
        assert_eq!(3_000, conf.gateway.default_step_timeout_ms);
        assert_eq!(3, conf.bundle.version);
        assert_eq!(2, conf.bundle.routes.len());
        assert_eq!(Some("tenant-a"), conf.bundle.routes[1].client_id.as_deref());
        assert_eq!(1, conf.bundle.pipelines.len());

        let user = &conf.bundle.pipelines[0].steps[1];
        assert_eq!(
            user.on_failure,
            FailurePolicy::Tolerated {
                default: serde_json::json!({})
            }
        );
        assert_eq!(user.binding(), "user");
        assert_eq!(
            conf.bundle.admission.for_route("orders"),
            AdmissionLimits {
                max_concurrents: 0,
                max_rps: 50,
                breaker: None,
            }
        );
        assert_eq!(
            conf.bundle.admission.for_route("legacy"),
            AdmissionLimits::default()
        );
    }

    #[test]
    fn test_breaker_policy_defaults() {
        let bundle = ConfigBundle::from_yaml(
            r#"
version: 1
admission:
  routes:
    orders: {max_rps: 10, breaker: {min_requests: 5}}
"#,
        )
        .unwrap();
        let breaker = bundle.admission.for_route("orders").breaker.unwrap();
        assert_eq!(
            breaker,
            BreakerPolicy {
                min_requests: 5,
                ..Default::default()
            }
        );
        assert_eq!(breaker.error_ratio_percent, 50);
        assert_eq!(GatewaySettings::default().max_body_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_valid_listeners_length() {
        init_log();
        let conf_str = r#"
---
listeners: []
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_listeners_tls_for_offer_h2() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"
    offer_h2: true
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_route_uri_required() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"

routes:
  - id: r1
    target:
      type: pipeline
      pipeline: p1
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_duplicate_route_ids_rejected() {
        let bundle = r#"
routes:
  - id: r1
    uri: /a
    target: {type: pipeline, pipeline: p1}
  - id: r1
    uri: /b
    target: {type: pipeline, pipeline: p1}
        "#;
        let err = ConfigBundle::from_yaml(bundle).unwrap_err();
        assert!(err.to_string().contains("duplicate_route_id"));
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let bundle = r#"
pipelines:
  - id: p1
    steps:
      - {name: a, connector: static}
      - {name: a, connector: static}
        "#;
        let err = ConfigBundle::from_yaml(bundle).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(err.to_string().contains("duplicate_step_name"));
    }

    #[test]
    fn test_bundle_from_json() {
        let data = br#"{
            "version": 7,
            "routes": [
                {"id": "r1", "uri": "/ping", "target": {"type": "proxy", "connector": "static", "config": {"value": "pong"}}}
            ]
        }"#;
        let bundle = ConfigBundle::from_json(data).unwrap();
        assert_eq!(bundle.version, 7);
        assert!(bundle.routes[0].enabled);
        assert!(bundle.routes[0].methods.is_empty());
        assert!(matches!(bundle.routes[0].target, RouteTarget::Proxy { .. }));

        assert!(ConfigBundle::from_json(b"{not json").is_err());
    }

    #[test]
    fn test_etcd_bundle_key() {
        let etcd = Etcd {
            host: vec!["http://127.0.0.1:2379".into()],
            prefix: "/pinggate/".into(),
            timeout: None,
            connect_timeout: None,
            user: None,
            password: None,
        };
        assert_eq!(etcd.bundle_key(), "/pinggate/bundle");
    }
}
