use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header::HeaderValue, Request, Response, StatusCode};
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use crate::{
    core::{GatewayPlugin, GatewayResult, RequestContext},
    utils::{request, response::ResponseBuilder},
};

use super::Next;

pub const PLUGIN_NAME: &str = "key-auth";

/// Creates a Key Auth plugin instance with the given configuration.
pub fn create_key_auth_plugin(cfg: JsonValue) -> Result<Arc<dyn GatewayPlugin>> {
    let config: PluginConfig =
        serde_json::from_value(cfg).or_err_with(ReadError, || "Invalid key auth plugin config")?;

    config
        .validate()
        .or_err_with(ReadError, || "Invalid key auth plugin config")?;

    Ok(Arc::new(PluginKeyAuth { config }))
}

/// Configuration for the Key Auth plugin.
///
/// `consumers` maps each accepted key to the client identity it authenticates.
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
struct PluginConfig {
    #[serde(default = "PluginConfig::default_header")]
    header: String,
    #[serde(default = "PluginConfig::default_query")]
    query: String,
    #[validate(length(min = 1))]
    consumers: HashMap<String, String>,
    #[serde(default = "PluginConfig::default_hide_credentials")]
    hide_credentials: bool,
}

impl PluginConfig {
    fn default_header() -> String {
        "apikey".to_string()
    }

    fn default_query() -> String {
        "apikey".to_string()
    }

    fn default_hide_credentials() -> bool {
        false
    }
}

/// Key Auth plugin implementation.
pub struct PluginKeyAuth {
    config: PluginConfig,
}

impl PluginKeyAuth {
    fn unauthorized() -> Response<Bytes> {
        let mut resp = ResponseBuilder::text(StatusCode::UNAUTHORIZED, "Invalid user authorization");
        resp.headers_mut().insert(
            "WWW-Authenticate",
            HeaderValue::from_static("ApiKey error=\"invalid_key\""),
        );
        resp
    }
}

#[async_trait]
impl GatewayPlugin for PluginKeyAuth {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn handle(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Bytes>> {
        let (key, from_header) = match request::get_req_header_value(req, &self.config.header) {
            Some(value) => (value.to_string(), true),
            None => (
                request::get_query_value(req, &self.config.query)
                    .unwrap_or_default()
                    .to_string(),
                false,
            ),
        };

        let Some(client_id) = self.config.consumers.get(&key).filter(|_| !key.is_empty()) else {
            log::debug!("key-auth rejected request {}", ctx.request_id);
            return Ok(Self::unauthorized());
        };
        ctx.client_id = Some(client_id.clone());

        // hide key
        if self.config.hide_credentials {
            if from_header {
                req.headers_mut().remove(self.config.header.as_str());
            } else {
                let _ = request::remove_query_param(req, &self.config.query);
            }
        }

        next.run(req, ctx).await
    }
}
