use std::{collections::BTreeMap, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, Method};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use validator::{Validate, ValidationError};

use crate::{
    config_error,
    core::{Connector, ConnectorError, GatewayResult, ParsedConfig},
    internal_error,
};

use super::{template::has_template, StepContext};

pub const CONNECTOR_TYPE: &str = "http";

/// Calls an HTTP backend and returns `{status, headers, body}`.
pub struct HttpConnector {
    client: Client,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[validate(schema(function = "HttpCallConfig::validate_literals"))]
pub struct HttpCallConfig {
    #[validate(length(min = 1))]
    pub url: String,
    #[serde(default = "HttpCallConfig::default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub body: Option<JsonValue>,
    pub timeout_ms: Option<u64>,
}

impl HttpCallConfig {
    fn default_method() -> String {
        "GET".to_string()
    }

    // templated values can only be checked once rendered
    fn validate_literals(&self) -> Result<(), ValidationError> {
        if !has_template(&self.url) && reqwest::Url::parse(&self.url).is_err() {
            return Err(ValidationError::new("invalid_url"));
        }
        if !has_template(&self.method) && Method::from_str(&self.method.to_uppercase()).is_err() {
            return Err(ValidationError::new("invalid_method"));
        }
        Ok(())
    }
}

/// Build a connector error from an upstream answer with a failing status.
pub(super) fn status_error(status: u16, body: JsonValue) -> ConnectorError {
    let err = if status >= 500 {
        ConnectorError::server(format!("upstream answered {status}"))
    } else {
        ConnectorError::client(format!("upstream answered {status}"))
    };
    err.with_status(status, Some(body))
}

/// Classify a transport failure.
pub(super) fn transport_error(err: reqwest::Error) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::timeout(err.to_string())
    } else if err.is_builder() {
        ConnectorError::bad_config(err.to_string())
    } else {
        ConnectorError::network(err.to_string())
    }
}

/// Decode a body as JSON, falling back to text (or null when empty).
pub(super) fn decode_body(bytes: &[u8]) -> JsonValue {
    if bytes.is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn headers_to_json(headers: &HeaderMap) -> JsonValue {
    let mut map = Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), JsonValue::String(value.to_string()));
        }
    }
    JsonValue::Object(map)
}

fn query_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Per-call timeout: the configured one, never beyond what the step has left.
pub(super) fn call_timeout(configured: Option<u64>, ctx: &StepContext) -> Duration {
    let remaining = ctx.remaining();
    configured
        .map(Duration::from_millis)
        .map_or(remaining, |t| t.min(remaining))
}

impl HttpConnector {
    async fn call(&self, ctx: &StepContext, config: &HttpCallConfig) -> GatewayResult<JsonValue> {
        let url = ctx.render_str(&config.url)?;
        let method = ctx.render_str(&config.method)?;
        let method = Method::from_str(&method.to_uppercase())
            .map_err(|_| ConnectorError::bad_config(format!("invalid method {method}")))?;

        let mut builder = self
            .client
            .request(method, &url)
            .timeout(call_timeout(config.timeout_ms, ctx))
            .header("x-request-id", &ctx.request_id);

        for (name, value) in &config.headers {
            builder = builder.header(name, ctx.render_str(value)?);
        }

        if !config.query.is_empty() {
            let mut pairs = Vec::with_capacity(config.query.len());
            for (name, value) in &config.query {
                pairs.push((name.clone(), query_value(&ctx.render(value)?)));
            }
            builder = builder.query(&pairs);
        }

        if let Some(body) = &config.body {
            builder = builder.json(&ctx.render(body)?);
        }

        log::debug!(
            "pipeline {} step {} calling {}",
            ctx.pipeline,
            ctx.step,
            url
        );

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let headers = headers_to_json(response.headers());
        let bytes = response.bytes().await.map_err(transport_error)?;
        let body = decode_body(&bytes);

        if status >= 400 {
            return Err(status_error(status, body).into());
        }

        Ok(json!({
            "status": status,
            "headers": headers,
            "body": body,
        }))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn type_name(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn validate_config(&self, raw: &JsonValue) -> GatewayResult<ParsedConfig> {
        let config: HttpCallConfig = serde_json::from_value(raw.clone())
            .map_err(|e| config_error!("Invalid http connector config: {}", e))?;
        config.validate()?;
        Ok(Arc::new(config))
    }

    async fn execute(&self, ctx: &StepContext, config: &ParsedConfig) -> GatewayResult<JsonValue> {
        let config = config
            .downcast_ref::<HttpCallConfig>()
            .ok_or_else(|| internal_error!("http connector received a foreign config"))?;
        ctx.cancellable(self.call(ctx, config)).await
    }
}
