//! Response helpers shared by the gateway, the plugins, and the admin/status services.

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use serde::Serialize;
use serde_json::json;

use crate::core::GatewayError;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
}

/// Unified response builder for different response types
pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn with_body(status: StatusCode, body: Bytes, content_type: Option<&str>) -> Response<Bytes> {
        let mut resp = Response::new(body);
        *resp.status_mut() = status;

        if let Some(ct) = content_type {
            match HeaderValue::from_str(ct) {
                Ok(value) => {
                    resp.headers_mut().insert(header::CONTENT_TYPE, value);
                }
                Err(e) => log::error!("Invalid content type '{}': {}", ct, e),
            }
        }

        resp
    }

    pub fn text(status: StatusCode, message: &str) -> Response<Bytes> {
        Self::with_body(
            status,
            Bytes::copy_from_slice(message.as_bytes()),
            Some(content_type::TEXT_PLAIN),
        )
    }

    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Bytes> {
        match serde_json::to_vec(data) {
            Ok(body) => Self::with_body(status, body.into(), Some(content_type::APPLICATION_JSON)),
            Err(e) => {
                log::error!("Failed to serialize JSON response: {}", e);
                Self::text(StatusCode::INTERNAL_SERVER_ERROR, "JSON serialization failed")
            }
        }
    }

    pub fn success_json<T: Serialize>(data: &T) -> Response<Bytes> {
        Self::json(StatusCode::OK, data)
    }

    /// The structured body every gateway failure is reported with.
    pub fn error(err: &GatewayError) -> Response<Bytes> {
        let mut body = json!({
            "error": err.category(),
            "message": err.to_string(),
        });
        if let Some(step) = err.failed_step() {
            body["step"] = json!(step);
        }
        Self::json(err.status_code(), &body)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value as JsonValue;

    use super::*;
    use crate::core::ConnectorError;

    #[test]
    fn test_text_response() {
        let response = ResponseBuilder::text(StatusCode::BAD_REQUEST, "Invalid input");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body().as_ref(), b"Invalid input");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            content_type::TEXT_PLAIN
        );
    }

    #[test]
    fn test_json_response() {
        let response = ResponseBuilder::success_json(&json!({"message": "success", "code": 200}));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.body().as_ref(),
            br#"{"code":200,"message":"success"}"#
        );
    }

    #[test]
    fn test_error_names_failed_step() {
        let err = GatewayError::FatalStep {
            pipeline: "orders".into(),
            step: "inventory".into(),
            source: Box::new(ConnectorError::server("down").into()),
        };
        let response = ResponseBuilder::error(&err);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body: JsonValue = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], json!("pipeline_fatal_step_failure"));
        assert_eq!(body["step"], json!("inventory"));

        let response = ResponseBuilder::error(&GatewayError::NotFound("/nope".into()));
        let body: JsonValue = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body.get("step").is_none());
    }
}
