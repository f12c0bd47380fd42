//! Core abstractions shared by every gateway component

pub mod context;
pub mod error;
pub mod status;
pub mod traits;

pub use context::RequestContext;
pub use error::{
    ConnectorError, ErrorContext, ErrorOrigin, EvalError, GatewayError, GatewayResult,
    RejectReason,
};
pub use traits::*;
