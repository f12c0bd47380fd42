use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use ipnetwork::IpNetwork;
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    core::{GatewayPlugin, GatewayResult, RequestContext},
    utils::response::ResponseBuilder,
};

use super::Next;

pub const PLUGIN_NAME: &str = "ip-restriction";

/// Creates an IP restriction plugin instance with the given configuration.
pub fn create_ip_restriction_plugin(cfg: JsonValue) -> Result<Arc<dyn GatewayPlugin>> {
    // Raw structure to parse CIDR strings first
    #[derive(Deserialize)]
    struct RawConfig {
        #[serde(default)]
        whitelist: Vec<String>,
        #[serde(default)]
        blacklist: Vec<String>,
        message: Option<String>,
    }

    let raw_config: RawConfig = serde_json::from_value(cfg).or_err_with(ReadError, || {
        "Invalid IP restriction plugin config (structure)"
    })?;

    let parse = |list: Vec<String>, kind: &'static str| {
        list.into_iter()
            .map(|s| {
                s.parse::<IpNetwork>()
                    .or_err_with(ReadError, || format!("Invalid {kind} IP network {s}"))
            })
            .collect::<Result<Vec<_>>>()
    };

    let config = PluginConfig {
        whitelist: parse(raw_config.whitelist, "whitelist")?,
        blacklist: parse(raw_config.blacklist, "blacklist")?,
        message: raw_config.message,
    };

    Ok(Arc::new(PluginIPRestriction { config }))
}

#[derive(Default, Debug)]
struct PluginConfig {
    whitelist: Vec<IpNetwork>,
    blacklist: Vec<IpNetwork>,
    message: Option<String>,
}

/// IP restriction plugin implementation.
///
/// A non-empty whitelist admits only the listed networks; the blacklist is checked after it.
/// Requests without a known peer address are rejected once any list is configured.
pub struct PluginIPRestriction {
    config: PluginConfig,
}

impl PluginIPRestriction {
    fn allowed(&self, ctx: &RequestContext) -> bool {
        if self.config.whitelist.is_empty() && self.config.blacklist.is_empty() {
            return true;
        }
        let Some(client_ip) = ctx.client_addr else {
            return false;
        };

        if !self.config.whitelist.is_empty()
            && !self
                .config
                .whitelist
                .iter()
                .any(|network| network.contains(client_ip))
        {
            return false;
        }

        !self
            .config
            .blacklist
            .iter()
            .any(|network| network.contains(client_ip))
    }
}

#[async_trait]
impl GatewayPlugin for PluginIPRestriction {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn handle(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Bytes>> {
        if !self.allowed(ctx) {
            let message = self.config.message.as_deref().unwrap_or("Forbidden");
            return Ok(ResponseBuilder::text(StatusCode::FORBIDDEN, message));
        }
        next.run(req, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

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

    async fn status_for(cfg: JsonValue, addr: Option<&str>) -> StatusCode {
        let chain = FilterChain::from_plugins(vec![create_ip_restriction_plugin(cfg).unwrap()]);
        let mut req = Request::new(Bytes::new());
        let mut ctx = RequestContext::default();
        ctx.client_addr = addr.map(|a| a.parse::<IpAddr>().unwrap());
        chain.dispatch(&mut req, &mut ctx, &Pass).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_whitelist_and_blacklist() {
        let cfg = json!({"whitelist": ["10.0.0.0/8"], "blacklist": ["10.1.0.0/16"]});
        assert_eq!(status_for(cfg.clone(), Some("10.2.3.4")).await, StatusCode::OK);
        assert_eq!(status_for(cfg.clone(), Some("10.1.3.4")).await, StatusCode::FORBIDDEN);
        assert_eq!(status_for(cfg.clone(), Some("192.168.1.1")).await, StatusCode::FORBIDDEN);
        assert_eq!(status_for(cfg, None).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_empty_lists_allow_everything() {
        assert_eq!(status_for(json!({}), None).await, StatusCode::OK);
    }

    #[test]
    fn test_rejects_bad_cidr() {
        assert!(create_ip_restriction_plugin(json!({"blacklist": ["10.0.0.0/99"]})).is_err());
    }
}
