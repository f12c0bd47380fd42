use std::{str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use sqlx::{
    mysql::{MySqlArguments, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow},
    query::Query,
    Column, MySql, Row,
};
use validator::Validate;

use crate::{
    config_error,
    core::{Connector, ConnectorError, GatewayResult, ParsedConfig},
    internal_error,
};

use super::{http::call_timeout, template::has_template, StepContext};

pub const CONNECTOR_TYPE: &str = "sql";

/// Runs a parameterised MySQL query and returns `{rows, count}`.
///
/// Pools are created lazily, one per distinct connection URL, and shared by every step
/// that targets the same database.
pub struct SqlConnector {
    pools: DashMap<String, MySqlPool>,
}

impl SqlConnector {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }
}

impl Default for SqlConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct SqlQueryConfig {
    #[validate(length(min = 1))]
    pub url: String,
    /// Literal statement; values are passed through `params` only
    #[validate(length(min = 1))]
    pub query: String,
    #[serde(default)]
    pub params: Vec<JsonValue>,
    #[serde(default = "SqlQueryConfig::default_max_connections")]
    #[validate(range(min = 1))]
    pub max_connections: u32,
    pub timeout_ms: Option<u64>,
}

impl SqlQueryConfig {
    fn default_max_connections() -> u32 {
        10
    }
}

fn classify(err: sqlx::Error) -> ConnectorError {
    match err {
        sqlx::Error::Database(e) => ConnectorError::client(e.to_string()),
        sqlx::Error::Configuration(e) => ConnectorError::bad_config(e.to_string()),
        sqlx::Error::PoolTimedOut => ConnectorError::timeout("timed out acquiring a connection"),
        e @ (sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed) => {
            ConnectorError::network(e.to_string())
        }
        e => ConnectorError::server(e.to_string()),
    }
}

fn bind_param<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: JsonValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        JsonValue::Null => query.bind(None::<String>),
        JsonValue::Bool(b) => query.bind(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => query.bind(s),
        other => query.bind(other.to_string()),
    }
}

fn column_value(row: &MySqlRow, index: usize) -> JsonValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(JsonValue::Null, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
        return v.map_or(JsonValue::Null, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(JsonValue::Null, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(JsonValue::Null, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(JsonValue::Null, JsonValue::from);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(JsonValue::Null, |bytes| {
            JsonValue::String(String::from_utf8_lossy(&bytes).into_owned())
        });
    }
    JsonValue::Null
}

fn row_to_json(row: &MySqlRow) -> JsonValue {
    let mut map = Map::new();
    for column in row.columns() {
        map.insert(column.name().to_string(), column_value(row, column.ordinal()));
    }
    JsonValue::Object(map)
}

impl SqlConnector {
    fn pool(&self, config: &SqlQueryConfig, url: &str) -> Result<MySqlPool, ConnectorError> {
        if let Some(pool) = self.pools.get(url) {
            return Ok(pool.clone());
        }
        let options = MySqlConnectOptions::from_str(url).map_err(classify)?;
        let pool = self
            .pools
            .entry(url.to_string())
            .or_insert_with(|| {
                log::info!(
                    "Creating sql pool with up to {} connections",
                    config.max_connections
                );
                MySqlPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(Duration::from_secs(3))
                    .connect_lazy_with(options)
            })
            .clone();
        Ok(pool)
    }

    async fn run(&self, ctx: &StepContext, config: &SqlQueryConfig) -> GatewayResult<JsonValue> {
        let url = ctx.render_str(&config.url)?;
        let pool = self.pool(config, &url)?;

        let mut params = Vec::with_capacity(config.params.len());
        for param in &config.params {
            params.push(ctx.render(param)?);
        }

        let mut query = sqlx::query(&config.query);
        for param in params {
            query = bind_param(query, param);
        }

        let rows = tokio::time::timeout(call_timeout(config.timeout_ms, ctx), query.fetch_all(&pool))
            .await
            .map_err(|_| ConnectorError::timeout("sql query timed out"))?
            .map_err(classify)?;

        let rows: Vec<JsonValue> = rows.iter().map(row_to_json).collect();
        Ok(json!({
            "count": rows.len(),
            "rows": rows,
        }))
    }
}

#[async_trait]
impl Connector for SqlConnector {
    fn type_name(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn validate_config(&self, raw: &JsonValue) -> GatewayResult<ParsedConfig> {
        let config: SqlQueryConfig = serde_json::from_value(raw.clone())
            .map_err(|e| config_error!("Invalid sql connector config: {}", e))?;
        config.validate()?;

        if has_template(&config.query) {
            return Err(config_error!(
                "sql query must not contain templates, pass values through params"
            ));
        }
        if !has_template(&config.url) {
            MySqlConnectOptions::from_str(&config.url)
                .map_err(|e| config_error!("Invalid sql url: {}", e))?;
        }
        Ok(Arc::new(config))
    }

    async fn execute(&self, ctx: &StepContext, config: &ParsedConfig) -> GatewayResult<JsonValue> {
        let config = config
            .downcast_ref::<SqlQueryConfig>()
            .ok_or_else(|| internal_error!("sql connector received a foreign config"))?;
        ctx.cancellable(self.run(ctx, config)).await
    }
}
