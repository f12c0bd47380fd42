use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Request, Response};
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    core::{GatewayPlugin, GatewayResult, RequestContext},
    utils::request,
};

use super::Next;

pub const PLUGIN_NAME: &str = "request-id";

const DEFAULT_HEADER_NAME: &str = "X-Request-Id";
const ALGORITHM_UUID: &str = "uuid";
const ALGORITHM_RANGE_ID: &str = "range_id";
const DEFAULT_CHAR_SET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Creates a Request ID plugin instance with the given configuration.
pub fn create_request_id_plugin(cfg: JsonValue) -> Result<Arc<dyn GatewayPlugin>> {
    let config: PluginConfig =
        serde_json::from_value(cfg).or_err(ReadError, "Invalid request id plugin config")?;

    config
        .validate()
        .or_err(ReadError, "Invalid request id plugin config")?;

    let header = HeaderName::from_bytes(config.header_name.as_bytes())
        .or_err(ReadError, "Invalid request id header name")?;

    Ok(Arc::new(PluginRequestID { config, header }))
}

/// Configuration for the Request ID plugin.
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
struct PluginConfig {
    #[serde(default = "PluginConfig::default_header_name")]
    header_name: String,
    #[serde(default = "PluginConfig::default_include_in_response")]
    include_in_response: bool,
    #[serde(default = "PluginConfig::default_algorithm")]
    #[validate(custom(function = "PluginConfig::validate_algorithm"))]
    algorithm: String,
    #[serde(default)]
    range_id: RangeID,
}

impl PluginConfig {
    fn default_header_name() -> String {
        DEFAULT_HEADER_NAME.to_string()
    }

    fn default_include_in_response() -> bool {
        true
    }

    fn default_algorithm() -> String {
        ALGORITHM_UUID.to_string()
    }

    #[allow(clippy::ptr_arg)]
    fn validate_algorithm(algorithm: &String) -> std::result::Result<(), ValidationError> {
        if algorithm == ALGORITHM_UUID || algorithm == ALGORITHM_RANGE_ID {
            Ok(())
        } else {
            Err(ValidationError::new(
                "algorithm must be either 'uuid' or 'range_id'",
            ))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RangeID {
    #[serde(default = "RangeID::default_char_set")]
    char_set: String,
    #[serde(default = "RangeID::default_length")]
    length: u32,
}

impl Default for RangeID {
    fn default() -> Self {
        Self {
            char_set: Self::default_char_set(),
            length: Self::default_length(),
        }
    }
}

impl RangeID {
    fn default_char_set() -> String {
        DEFAULT_CHAR_SET.to_string()
    }

    fn default_length() -> u32 {
        16
    }
}

/// Request ID plugin implementation.
///
/// Reuses the caller's id when present, otherwise generates one. The id becomes the
/// request context's `request_id` and is echoed back on the response.
pub struct PluginRequestID {
    config: PluginConfig,
    header: HeaderName,
}

impl PluginRequestID {
    fn generate(&self) -> String {
        match self.config.algorithm.as_str() {
            ALGORITHM_RANGE_ID => self.range_id(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    fn range_id(&self) -> String {
        let char_set = if self.config.range_id.char_set.is_empty() {
            DEFAULT_CHAR_SET
        } else {
            &self.config.range_id.char_set
        };
        let chars: Vec<char> = char_set.chars().collect();
        let mut rng = rand::thread_rng();
        (0..self.config.range_id.length)
            .filter_map(|_| chars.choose(&mut rng).copied())
            .collect()
    }
}

#[async_trait]
impl GatewayPlugin for PluginRequestID {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn handle(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Bytes>> {
        let request_id = match request::get_req_header_value(req, &self.config.header_name) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => {
                let id = self.generate();
                if let Ok(value) = HeaderValue::from_str(&id) {
                    req.headers_mut().insert(self.header.clone(), value);
                }
                id
            }
        };
        ctx.request_id = request_id.clone();

        let mut resp = next.run(req, ctx).await?;

        if self.config.include_in_response {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                resp.headers_mut().insert(self.header.clone(), value);
            }
        }

        Ok(resp)
    }
}
