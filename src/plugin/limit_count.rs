use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use pingora_limits::rate::Rate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::{Validate, ValidationError};

use crate::{
    core::{GatewayPlugin, GatewayResult, RequestContext},
    utils::{request, response::ResponseBuilder},
};

use super::Next;

pub const PLUGIN_NAME: &str = "limit-count";

/// Creates a rate limiting plugin instance with the given configuration.
pub fn create_limit_count_plugin(cfg: JsonValue) -> Result<Arc<dyn GatewayPlugin>> {
    let config: PluginConfig = serde_json::from_value(cfg)
        .or_err_with(ReadError, || "Invalid limit count plugin config")?;

    config
        .validate()
        .or_err_with(ReadError, || "Invalid limit count plugin config")?;

    let rate = Rate::new(Duration::from_secs(config.time_window as _));

    Ok(Arc::new(PluginRateLimit { config, rate }))
}

/// What requests are counted by.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum KeyType {
    #[default]
    ClientId,
    RemoteAddr,
    Header,
}

/// Configuration for the rate limiting plugin.
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "PluginConfig::validate_key"))]
struct PluginConfig {
    #[serde(default)]
    key_type: KeyType,
    /// Header name when `key_type` is `header`
    #[serde(default)]
    key: String,
    #[validate(range(min = 1))]
    time_window: u32,
    #[validate(range(min = 1))]
    count: u32,

    #[serde(default = "PluginConfig::default_rejected_code")]
    #[validate(range(min = 200, max = 599))]
    rejected_code: u16,
    #[serde(default)]
    rejected_msg: Option<String>,
    #[serde(default = "PluginConfig::default_show_limit_quota_header")]
    show_limit_quota_header: bool,
}

impl PluginConfig {
    fn default_rejected_code() -> u16 {
        503
    }

    fn default_show_limit_quota_header() -> bool {
        true
    }

    fn validate_key(&self) -> std::result::Result<(), ValidationError> {
        if self.key_type == KeyType::Header && self.key.is_empty() {
            return Err(ValidationError::new("header_key_required"));
        }
        Ok(())
    }
}

/// Fixed-window request counter.
pub struct PluginRateLimit {
    config: PluginConfig,
    rate: Rate,
}

impl PluginRateLimit {
    fn key(&self, req: &Request<Bytes>, ctx: &RequestContext) -> String {
        match self.config.key_type {
            KeyType::ClientId => ctx.client_id.clone().unwrap_or_default(),
            KeyType::RemoteAddr => ctx.client_addr.map(|a| a.to_string()).unwrap_or_default(),
            KeyType::Header => request::get_req_header_value(req, &self.config.key)
                .unwrap_or_default()
                .to_string(),
        }
    }

    fn set_quota_headers(&self, resp: &mut Response<Bytes>, remaining: isize) {
        let headers = resp.headers_mut();
        headers.insert("X-Rate-Limit-Limit", HeaderValue::from(self.config.count));
        headers.insert(
            "X-Rate-Limit-Remaining",
            HeaderValue::from(remaining.max(0) as u64),
        );
        headers.insert("X-Rate-Limit-Reset", HeaderValue::from(self.config.time_window));
    }

    fn rejected(&self) -> Response<Bytes> {
        let status = StatusCode::from_u16(self.config.rejected_code)
            .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        let mut resp = match &self.config.rejected_msg {
            Some(msg) => ResponseBuilder::text(status, msg),
            None => ResponseBuilder::with_body(status, Bytes::new(), None),
        };
        if self.config.show_limit_quota_header {
            self.set_quota_headers(&mut resp, 0);
        }
        resp
    }
}

#[async_trait]
impl GatewayPlugin for PluginRateLimit {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn handle(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Bytes>> {
        let key = self.key(req, ctx);
        let current = self.rate.observe(&key, 1);
        let limit = self.config.count as isize;

        if current > limit {
            log::debug!("limit-count rejected key {:?}", key);
            return Ok(self.rejected());
        }

        let mut resp = next.run(req, ctx).await?;
        if self.config.show_limit_quota_header {
            self.set_quota_headers(&mut resp, limit - current);
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{core::Endpoint, plugin::FilterChain};

    struct Pass;

    #[async_trait]
    impl Endpoint for Pass {
        async fn call(
            &self,
            _req: &mut Request<Bytes>,
            _ctx: &mut RequestContext,
        ) -> GatewayResult<Response<Bytes>> {
            Ok(ResponseBuilder::text(StatusCode::OK, "ok"))
        }
    }

    #[tokio::test]
    async fn test_limits_per_client() {
        let plugin = create_limit_count_plugin(json!({
            "time_window": 60,
            "count": 2,
            "rejected_code": 429,
            "rejected_msg": "slow down"
        }))
        .unwrap();
        let chain = FilterChain::from_plugins(vec![plugin]);

        let call = |client: &'static str| {
            let chain = chain.clone();
            async move {
                let mut req = Request::new(Bytes::new());
                let mut ctx = RequestContext::default();
                ctx.client_id = Some(client.to_string());
                chain.dispatch(&mut req, &mut ctx, &Pass).await.unwrap()
            }
        };

        let first = call("acme").await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["X-Rate-Limit-Remaining"], "1");
        assert_eq!(call("acme").await.status(), StatusCode::OK);

        let rejected = call("acme").await;
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejected.body().as_ref(), b"slow down");

        // other clients have their own window
        assert_eq!(call("globex").await.status(), StatusCode::OK);
    }

    #[test]
    fn test_header_key_requires_name() {
        assert!(create_limit_count_plugin(json!({
            "key_type": "header",
            "time_window": 1,
            "count": 1
        }))
        .is_err());
    }
}
