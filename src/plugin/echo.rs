use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    core::{GatewayPlugin, GatewayResult, RequestContext},
    utils::response::ResponseBuilder,
};

use super::Next;

pub const PLUGIN_NAME: &str = "echo";

/// Creates an Echo plugin instance with the given configuration.
pub fn create_echo_plugin(cfg: JsonValue) -> Result<Arc<dyn GatewayPlugin>> {
    let config: PluginConfig =
        serde_json::from_value(cfg).or_err_with(ReadError, || "Invalid echo plugin config")?;

    let status = StatusCode::from_u16(config.status).or_err(ReadError, "Invalid echo status")?;
    let headers = config
        .headers
        .iter()
        .map(|(k, v)| {
            let name = HeaderName::from_bytes(k.as_bytes())
                .or_err_with(ReadError, || format!("Invalid echo header name {k}"))?;
            let value = HeaderValue::from_str(v)
                .or_err_with(ReadError, || format!("Invalid echo header value for {k}"))?;
            Ok((name, value))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Arc::new(PluginEcho {
        body: Bytes::from(config.body),
        status,
        headers,
    }))
}

/// Configuration for the Echo plugin.
/// Specifies the response body and optional headers.
#[derive(Default, Debug, Serialize, Deserialize)]
struct PluginConfig {
    /// The response body that will be echoed.
    body: String,

    #[serde(default = "PluginConfig::default_status")]
    status: u16,

    /// Additional response headers to include in the echoed response.
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl PluginConfig {
    fn default_status() -> u16 {
        200
    }
}

/// Echo plugin implementation; answers without ever reaching the route target.
pub struct PluginEcho {
    body: Bytes,
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
}

#[async_trait]
impl GatewayPlugin for PluginEcho {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn handle(
        &self,
        _req: &mut Request<Bytes>,
        _ctx: &mut RequestContext,
        _next: Next<'_>,
    ) -> GatewayResult<Response<Bytes>> {
        let mut resp = ResponseBuilder::with_body(self.status, self.body.clone(), None);
        for (name, value) in &self.headers {
            resp.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(resp)
    }
}
