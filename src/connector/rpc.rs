use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use validator::{Validate, ValidationError};

use crate::{
    config_error,
    core::{Connector, ConnectorError, GatewayResult, ParsedConfig},
    internal_error,
};

use super::{
    http::{call_timeout, decode_body, status_error, transport_error},
    template::has_template,
    StepContext,
};

pub const CONNECTOR_TYPE: &str = "rpc";

/// JSON-RPC 2.0 over HTTP.
pub struct RpcConnector {
    client: Client,
    next_id: AtomicU64,
}

impl RpcConnector {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for RpcConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[validate(schema(function = "RpcCallConfig::validate_endpoint"))]
pub struct RpcCallConfig {
    #[validate(length(min = 1))]
    pub endpoint: String,
    #[validate(length(min = 1))]
    pub method: String,
    #[serde(default)]
    pub params: JsonValue,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
}

impl RpcCallConfig {
    fn validate_endpoint(&self) -> Result<(), ValidationError> {
        if !has_template(&self.endpoint) && reqwest::Url::parse(&self.endpoint).is_err() {
            return Err(ValidationError::new("invalid_endpoint"));
        }
        Ok(())
    }
}

/// Map a JSON-RPC error object to a connector error.
///
/// Malformed requests (parse error, invalid request/method/params) are the caller's fault;
/// everything else is reported as a server failure.
fn rpc_error(error: &JsonValue) -> ConnectorError {
    let code = error.get("code").and_then(JsonValue::as_i64).unwrap_or(0);
    let message = error
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("rpc call failed");
    let message = format!("rpc error {code}: {message}");
    match code {
        -32700 | -32602..=-32600 => ConnectorError::client(message),
        _ => ConnectorError::server(message),
    }
}

impl RpcConnector {
    async fn call(&self, ctx: &StepContext, config: &RpcCallConfig) -> GatewayResult<JsonValue> {
        let endpoint = ctx.render_str(&config.endpoint)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": ctx.render_str(&config.method)?,
            "params": ctx.render(&config.params)?,
        });

        let mut builder = self
            .client
            .post(&endpoint)
            .timeout(call_timeout(config.timeout_ms, ctx))
            .header("x-request-id", &ctx.request_id)
            .json(&payload);
        for (name, value) in &config.headers {
            builder = builder.header(name, ctx.render_str(value)?);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(transport_error)?;
        let body = decode_body(&bytes);

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(rpc_error(error).with_status(status, Some(body.clone())).into());
        }
        if status >= 400 {
            return Err(status_error(status, body).into());
        }

        match body {
            JsonValue::Object(mut map) => Ok(map.remove("result").unwrap_or(JsonValue::Null)),
            other => Err(ConnectorError::server(format!("malformed rpc response: {other}")).into()),
        }
    }
}

#[async_trait]
impl Connector for RpcConnector {
    fn type_name(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn validate_config(&self, raw: &JsonValue) -> GatewayResult<ParsedConfig> {
        let config: RpcCallConfig = serde_json::from_value(raw.clone())
            .map_err(|e| config_error!("Invalid rpc connector config: {}", e))?;
        config.validate()?;
        Ok(Arc::new(config))
    }

    async fn execute(&self, ctx: &StepContext, config: &ParsedConfig) -> GatewayResult<JsonValue> {
        let config = config
            .downcast_ref::<RpcCallConfig>()
            .ok_or_else(|| internal_error!("rpc connector received a foreign config"))?;
        ctx.cancellable(self.call(ctx, config)).await
    }
}
