use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    config_error,
    core::{Connector, GatewayResult, ParsedConfig},
    internal_error,
};

use super::StepContext;

pub const CONNECTOR_TYPE: &str = "static";

/// Answers with a fixed (optionally templated) value without calling any backend.
pub struct StaticConnector;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub value: JsonValue,
}

#[async_trait]
impl Connector for StaticConnector {
    fn type_name(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn validate_config(&self, raw: &JsonValue) -> GatewayResult<ParsedConfig> {
        let config: StaticConfig = serde_json::from_value(raw.clone())
            .map_err(|e| config_error!("Invalid static connector config: {}", e))?;
        Ok(Arc::new(config))
    }

    async fn execute(&self, ctx: &StepContext, config: &ParsedConfig) -> GatewayResult<JsonValue> {
        let config = config
            .downcast_ref::<StaticConfig>()
            .ok_or_else(|| internal_error!("static connector received a foreign config"))?;
        ctx.render(&config.value)
    }
}
