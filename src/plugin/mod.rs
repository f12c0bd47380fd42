pub mod chain;
pub mod echo;
pub mod ip_restriction;
pub mod key_auth;
pub mod limit_count;
pub mod request_id;
pub mod response_headers;

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;
use pingora::OkOrErr;
use pingora_error::{ErrorType::ReadError, Result};
use serde_json::Value as JsonValue;

use crate::core::GatewayPlugin;

pub use chain::{FilterChain, Next};

/// Factory building a plugin instance from its JSON configuration.
pub type PluginCreateFn = fn(JsonValue) -> Result<Arc<dyn GatewayPlugin>>;

/// Global registry mapping plugin names to their factory functions.
///
/// Chains run plugins in the order they are configured, not in registry order.
static PLUGIN_BUILDER_REGISTRY: Lazy<HashMap<&'static str, PluginCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, PluginCreateFn)> = vec![
        (echo::PLUGIN_NAME, echo::create_echo_plugin),
        (
            ip_restriction::PLUGIN_NAME,
            ip_restriction::create_ip_restriction_plugin,
        ),
        (key_auth::PLUGIN_NAME, key_auth::create_key_auth_plugin),
        (
            limit_count::PLUGIN_NAME,
            limit_count::create_limit_count_plugin,
        ),
        (
            request_id::PLUGIN_NAME,
            request_id::create_request_id_plugin,
        ),
        (
            response_headers::PLUGIN_NAME,
            response_headers::create_response_headers_plugin,
        ),
    ];
    arr.into_iter().collect()
});

/// Creates plugin instances from configuration using a factory pattern.
///
/// Looks up the plugin builder function in the global registry and invokes it
/// with the provided configuration. Fails fast for unknown plugin types; a null
/// configuration is treated as an empty object.
///
/// # Errors
/// Returns `ReadError` for unknown plugin names or configuration parsing failures
pub fn build_plugin(name: &str, cfg: JsonValue) -> Result<Arc<dyn GatewayPlugin>> {
    let builder = PLUGIN_BUILDER_REGISTRY
        .get(name)
        .or_err(ReadError, "Unknown plugin type")?;
    let cfg = match cfg {
        JsonValue::Null => JsonValue::Object(Default::default()),
        other => other,
    };
    builder(cfg)
}

pub fn plugin_names() -> Vec<&'static str> {
    let mut names: Vec<_> = PLUGIN_BUILDER_REGISTRY.keys().copied().collect();
    names.sort_unstable();
    names
}
