//! Unified error handling for the gateway
//!
//! Every stage of the request path reports failures through [`GatewayError`], so the
//! transport layer can turn any of them into one structured client response.

use std::fmt;

use http::StatusCode;
use serde_json::Value as JsonValue;

/// Why the admission controller turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Concurrency,
    Rate,
    /// The scope's circuit breaker is open
    Degraded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Concurrency => "concurrent_request",
            RejectReason::Rate => "qps",
            RejectReason::Degraded => "degraded",
        }
    }
}

/// Where a failed backend call went wrong. Only server-side and transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    Client,
    Server,
    Network,
    Timeout,
    Cancelled,
    Config,
}

impl ErrorOrigin {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorOrigin::Server | ErrorOrigin::Network | ErrorOrigin::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorOrigin::Client => "client",
            ErrorOrigin::Server => "server",
            ErrorOrigin::Network => "network",
            ErrorOrigin::Timeout => "timeout",
            ErrorOrigin::Cancelled => "cancelled",
            ErrorOrigin::Config => "config",
        }
    }
}

/// A failed connector call, optionally carrying what the backend answered.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorError {
    pub origin: ErrorOrigin,
    pub message: String,
    pub status: Option<u16>,
    pub body: Option<JsonValue>,
}

impl ConnectorError {
    pub fn new(origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self {
            origin,
            message: message.into(),
            status: None,
            body: None,
        }
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorOrigin::Client, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorOrigin::Server, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorOrigin::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorOrigin::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorOrigin::Cancelled, "call cancelled")
    }

    pub fn bad_config(message: impl Into<String>) -> Self {
        Self::new(ErrorOrigin::Config, message)
    }

    /// Attach the upstream status (and body, if any) that produced this error.
    pub fn with_status(mut self, status: u16, body: Option<JsonValue>) -> Self {
        self.status = Some(status);
        self.body = body;
        self
    }
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "{} error (status {status}): {}",
                self.origin.as_str(),
                self.message
            ),
            None => write!(f, "{} error: {}", self.origin.as_str(), self.message),
        }
    }
}

/// Failures raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    Syntax(String),
    TypeMismatch(String),
    UnknownFunction(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Syntax(msg) => write!(f, "syntax error: {msg}"),
            EvalError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            EvalError::UnknownFunction(name) => write!(f, "unknown function: {name}"),
        }
    }
}

/// Unified error types for the gateway
#[derive(Debug)]
pub enum GatewayError {
    /// Concurrency or rate ceiling exceeded for a scope
    AdmissionRejected { scope: String, reason: RejectReason },

    /// Malformed or inconsistent configuration bundle
    Config(String),

    /// A backend call failed
    Connector(ConnectorError),

    /// A condition or binding expression failed to evaluate
    Expression(EvalError),

    /// A step or template referenced a binding that does not exist
    BindingNotFound(String),

    /// The pipeline deadline, or a fatal step's own deadline, expired
    PipelineTimeout {
        pipeline: String,
        step: Option<String>,
    },

    /// A `fatal` step failed and aborted the pipeline
    FatalStep {
        pipeline: String,
        step: String,
        source: Box<GatewayError>,
    },

    /// No route matched
    NotFound(String),

    /// A plugin terminated the chain with an error
    Plugin { plugin: String, message: String },

    /// The gateway is draining and accepts no new work
    Unavailable(String),

    /// The request body exceeds the configured limit (in bytes)
    PayloadTooLarge(usize),

    /// Internal system errors
    Internal(String),

    /// Pingora framework errors
    Pingora(Box<pingora_error::Error>),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::AdmissionRejected { scope, reason } => {
                write!(f, "Admission rejected for {scope}: {}", reason.as_str())
            }
            GatewayError::Config(msg) => write!(f, "Configuration error: {msg}"),
            GatewayError::Connector(err) => write!(f, "Connector execution failed: {err}"),
            GatewayError::Expression(err) => write!(f, "Expression evaluation failed: {err}"),
            GatewayError::BindingNotFound(name) => write!(f, "Binding not found: {name}"),
            GatewayError::PipelineTimeout { pipeline, step } => match step {
                Some(step) => write!(f, "Pipeline {pipeline} timed out in step {step}"),
                None => write!(f, "Pipeline {pipeline} timed out"),
            },
            GatewayError::FatalStep {
                pipeline,
                step,
                source,
            } => write!(f, "Pipeline {pipeline} aborted by step {step}: {source}"),
            GatewayError::NotFound(msg) => write!(f, "Resource not found: {msg}"),
            GatewayError::Plugin { plugin, message } => {
                write!(f, "Plugin {plugin} failed: {message}")
            }
            GatewayError::Unavailable(msg) => write!(f, "Service unavailable: {msg}"),
            GatewayError::PayloadTooLarge(limit) => {
                write!(f, "Request body exceeds {limit} bytes")
            }
            GatewayError::Internal(msg) => write!(f, "Internal error: {msg}"),
            GatewayError::Pingora(err) => write!(f, "Pingora error: {err}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::FatalStep { source, .. } => Some(source.as_ref()),
            GatewayError::Pingora(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl GatewayError {
    /// Stable machine-readable category used in error responses and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::AdmissionRejected { .. } => "admission_rejected",
            GatewayError::Config(_) => "config_error",
            GatewayError::Connector(_) => "connector_error",
            GatewayError::Expression(_) => "expression_error",
            GatewayError::BindingNotFound(_) => "binding_not_found",
            GatewayError::PipelineTimeout { .. } => "pipeline_timeout",
            GatewayError::FatalStep { .. } => "pipeline_fatal_step_failure",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Plugin { .. } => "plugin_error",
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
            GatewayError::Internal(_) | GatewayError::Pingora(_) => "internal_error",
        }
    }

    /// The named step responsible for a pipeline failure, if any.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            GatewayError::FatalStep { step, .. } => Some(step),
            GatewayError::PipelineTimeout { step, .. } => step.as_deref(),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AdmissionRejected { .. } | GatewayError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::PipelineTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::FatalStep { .. } | GatewayError::Connector(_) => {
                match source_origin(self) {
                    Some(ErrorOrigin::Client) => StatusCode::BAD_REQUEST,
                    Some(ErrorOrigin::Timeout) => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                }
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn source_origin(err: &GatewayError) -> Option<ErrorOrigin> {
    match err {
        GatewayError::Connector(e) => Some(e.origin),
        GatewayError::FatalStep { source, .. } => source_origin(source),
        _ => None,
    }
}

impl From<ConnectorError> for GatewayError {
    fn from(err: ConnectorError) -> Self {
        GatewayError::Connector(err)
    }
}

impl From<EvalError> for GatewayError {
    fn from(err: EvalError) -> Self {
        GatewayError::Expression(err)
    }
}

impl From<Box<pingora_error::Error>> for GatewayError {
    fn from(err: Box<pingora_error::Error>) -> Self {
        GatewayError::Pingora(err)
    }
}

impl From<GatewayError> for Box<pingora_error::Error> {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Pingora(pingora_err) => pingora_err,
            _ => pingora_error::Error::explain(pingora_error::ErrorType::InternalError, err.to_string()),
        }
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> GatewayResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> GatewayResult<T> {
        self.map_err(|e| GatewayError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::GatewayError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::GatewayError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::core::GatewayError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::GatewayError::Internal(format!($fmt, $($arg)*))
    };
}
