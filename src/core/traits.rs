//! Core traits for gateway components
//!
//! These are the seams between the request path and everything pluggable: filter-chain
//! plugins, chain endpoints, backend connectors and the expression language.

use std::{any::Any, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use serde_json::{Map, Value as JsonValue};

use super::{
    context::RequestContext,
    error::{EvalError, GatewayResult},
};
use crate::{connector::StepContext, plugin::chain::Next};

/// A filter-chain plugin.
///
/// A plugin either calls `next.run(..)` to continue the chain (and may inspect or rewrite the
/// response it gets back), or returns a response of its own to short-circuit. Returning an
/// error terminates the chain with an error response.
#[async_trait]
pub trait GatewayPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Bytes>>;
}

/// Whatever sits behind a filter chain.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut RequestContext,
    ) -> GatewayResult<Response<Bytes>>;
}

/// Connector configuration after validation; each connector downcasts to its own type.
pub type ParsedConfig = Arc<dyn Any + Send + Sync>;

/// A backend integration (HTTP, RPC, SQL, ...).
///
/// Configuration is validated once when a pipeline is loaded. `execute` is the only
/// per-request entry point, and implementations keep no per-request state.
#[async_trait]
pub trait Connector: Send + Sync {
    fn type_name(&self) -> &str;

    fn validate_config(&self, raw: &JsonValue) -> GatewayResult<ParsedConfig>;

    async fn execute(&self, ctx: &StepContext, config: &ParsedConfig) -> GatewayResult<JsonValue>;
}

/// Evaluates expressions against a read-only view of the accumulated bindings.
pub trait ExpressionEvaluator: Send + Sync {
    /// Parse without evaluating; used to reject malformed expressions at load time.
    fn check(&self, expr: &str) -> Result<(), EvalError>;

    fn evaluate(&self, expr: &str, bindings: &Map<String, JsonValue>)
        -> Result<JsonValue, EvalError>;

    fn evaluate_condition(
        &self,
        expr: &str,
        bindings: &Map<String, JsonValue>,
    ) -> Result<bool, EvalError> {
        match self.evaluate(expr, bindings)? {
            JsonValue::Bool(b) => Ok(b),
            other => Err(EvalError::TypeMismatch(format!(
                "condition `{expr}` produced {other} instead of a boolean"
            ))),
        }
    }
}
