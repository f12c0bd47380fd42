use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Request, Response};
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::core::{GatewayPlugin, GatewayResult, RequestContext};

use super::Next;

pub const PLUGIN_NAME: &str = "response-headers";

/// Creates a plugin that decorates responses on their way back to the client.
pub fn create_response_headers_plugin(cfg: JsonValue) -> Result<Arc<dyn GatewayPlugin>> {
    let config: PluginConfig = serde_json::from_value(cfg)
        .or_err_with(ReadError, || "Invalid response headers plugin config")?;

    let mut set = Vec::with_capacity(config.set.len());
    for (k, v) in &config.set {
        let name = HeaderName::from_bytes(k.as_bytes())
            .or_err_with(ReadError, || format!("Invalid header name {k}"))?;
        let value = HeaderValue::from_str(v)
            .or_err_with(ReadError, || format!("Invalid header value for {k}"))?;
        set.push((name, value));
    }

    let remove = config
        .remove
        .iter()
        .map(|k| {
            HeaderName::from_bytes(k.as_bytes())
                .or_err_with(ReadError, || format!("Invalid header name {k}"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Arc::new(PluginResponseHeaders { set, remove }))
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct PluginConfig {
    /// Headers set (overwritten) on every response
    #[serde(default)]
    set: HashMap<String, String>,
    /// Headers stripped from every response
    #[serde(default)]
    remove: Vec<String>,
}

pub struct PluginResponseHeaders {
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

#[async_trait]
impl GatewayPlugin for PluginResponseHeaders {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn handle(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Bytes>> {
        let mut resp = next.run(req, ctx).await?;
        let headers = resp.headers_mut();
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::{core::Endpoint, plugin::FilterChain, utils::response::ResponseBuilder};

    struct Upstream;

    #[async_trait]
    impl Endpoint for Upstream {
        async fn call(
            &self,
            _req: &mut Request<Bytes>,
            _ctx: &mut RequestContext,
        ) -> GatewayResult<Response<Bytes>> {
            let mut resp = ResponseBuilder::text(StatusCode::OK, "ok");
            resp.headers_mut()
                .insert("server", HeaderValue::from_static("backend/1.0"));
            Ok(resp)
        }
    }

    #[tokio::test]
    async fn test_decorates_response() {
        let plugin = create_response_headers_plugin(json!({
            "set": {"x-gateway": "pinggate"},
            "remove": ["server"]
        }))
        .unwrap();
        let chain = FilterChain::from_plugins(vec![plugin]);
        let mut req = Request::new(Bytes::new());
        let mut ctx = RequestContext::default();

        let resp = chain.dispatch(&mut req, &mut ctx, &Upstream).await.unwrap();
        assert_eq!(resp.headers()["x-gateway"], "pinggate");
        assert!(!resp.headers().contains_key("server"));
    }
}
