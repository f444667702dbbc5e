//! Error handling and JSON error responses for the front door

use crate::sandbox::ProcessLogs;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No registry record for the tenant
    UnknownTenant,
    /// The hosting layer refused to start the gateway
    GatewayStartFailed,
    /// The gateway did not become ready before the deadline
    GatewayStartTimeout,
    /// The gateway stopped answering after it was ready
    BackendUnreachable,
    /// Request timed out waiting for the gateway
    RequestTimeout,
    /// The gateway answered with something that is not HTTP
    BadGateway,
    /// Internal front door error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownTenant => StatusCode::NOT_FOUND,
            ProxyErrorCode::GatewayStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::GatewayStartTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownTenant => "UNKNOWN_TENANT",
            ProxyErrorCode::GatewayStartFailed => "GATEWAY_START_FAILED",
            ProxyErrorCode::GatewayStartTimeout => "GATEWAY_START_TIMEOUT",
            ProxyErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::BadGateway => "BAD_GATEWAY",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable summary
    pub error: String,
    /// Diagnostic detail, such as captured gateway output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// The error code
    pub code: ProxyErrorCode,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
            status: code.status_code().as_u16(),
            code,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":"{}","status":{}}}"#,
                self.error.replace('\"', "\\\""),
                self.code.as_header_value(),
                self.status
            )
        })
    }

    /// Render as an HTTP response with the X-Proxy-Error header
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let status = self.code.status_code();
        let header = self.code.as_header_value();
        let body = self.to_json();

        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("X-Proxy-Error", header)
            .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    error: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    ErrorResponse::new(code, error).into_response()
}

/// Why a tenant gateway could not be made ready
#[derive(Debug, Clone, thiserror::Error)]
pub enum StartupError {
    /// The hosting layer rejected the process start
    #[error("failed to launch gateway: {message}")]
    Launch { message: String },

    /// The gateway never answered the readiness probe
    #[error("gateway did not become ready within {}s", .waited.as_secs())]
    ReadinessTimeout {
        waited: Duration,
        last_probe: String,
        logs: Option<ProcessLogs>,
    },

    /// The startup task ended without producing an outcome
    #[error("gateway startup aborted: {message}")]
    Aborted { message: String },

    /// The bot was deleted while its gateway was wanted
    #[error("bot {tenant_id} has been removed")]
    Removed { tenant_id: String },
}

impl StartupError {
    pub fn launch(err: impl std::fmt::Display) -> Self {
        StartupError::Launch {
            message: err.to_string(),
        }
    }

    pub fn code(&self) -> ProxyErrorCode {
        match self {
            StartupError::Launch { .. } => ProxyErrorCode::GatewayStartFailed,
            StartupError::ReadinessTimeout { .. } => ProxyErrorCode::GatewayStartTimeout,
            StartupError::Aborted { .. } => ProxyErrorCode::InternalError,
            StartupError::Removed { .. } => ProxyErrorCode::UnknownTenant,
        }
    }

    /// Diagnostic text for the `details` field
    pub fn details(&self) -> String {
        match self {
            StartupError::Launch { message } => message.clone(),
            StartupError::Aborted { message } => message.clone(),
            StartupError::Removed { tenant_id } => format!("Bot {} was deleted", tenant_id),
            StartupError::ReadinessTimeout {
                waited,
                last_probe,
                logs,
            } => {
                let mut details = format!(
                    "Gateway startup timed out after {}s (last probe: {})",
                    waited.as_secs(),
                    last_probe
                );
                if let Some(logs) = logs {
                    if !logs.stderr.is_empty() {
                        details.push_str("\nstderr:\n");
                        details.push_str(&logs.stderr);
                    }
                    if !logs.stdout.is_empty() {
                        details.push_str("\nstdout:\n");
                        details.push_str(&logs.stdout);
                    }
                }
                details
            }
        }
    }

    /// Structured `{error, details}` response for the caller
    pub fn to_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let summary = match self {
            StartupError::Launch { .. } => "Failed to start bot gateway",
            StartupError::ReadinessTimeout { .. } => "Bot gateway startup timed out",
            StartupError::Aborted { .. } => "Bot gateway startup aborted",
            StartupError::Removed { .. } => "Bot not found",
        };
        ErrorResponse::new(self.code(), summary)
            .with_details(self.details())
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::UnknownTenant.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::GatewayStartFailed.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::GatewayStartTimeout.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::BackendUnreachable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyErrorCode::RequestTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownTenant, "Bot not found");
        let json = error.to_json();

        assert!(json.contains("\"error\":\"Bot not found\""));
        assert!(json.contains("\"code\":\"UNKNOWN_TENANT\""));
        assert!(json.contains("\"status\":404"));
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "REQUEST_TIMEOUT");
    }

    #[test]
    fn test_launch_failure_details() {
        let err = StartupError::launch("quota exceeded: 10 processes");
        assert_eq!(err.code(), ProxyErrorCode::GatewayStartFailed);
        assert_eq!(err.details(), "quota exceeded: 10 processes");

        let response = err.to_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "GATEWAY_START_FAILED");
    }

    #[test]
    fn test_removed_bot_is_not_found() {
        let err = StartupError::Removed {
            tenant_id: "V1StGXR8_Z5jdHi6".to_string(),
        };
        assert_eq!(err.code(), ProxyErrorCode::UnknownTenant);
        assert_eq!(err.to_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_timeout_details_include_logs() {
        let err = StartupError::ReadinessTimeout {
            waited: Duration::from_secs(180),
            last_probe: "connection refused".to_string(),
            logs: Some(ProcessLogs {
                stdout: "booting".to_string(),
                stderr: "Error: missing OPENAI_API_KEY".to_string(),
            }),
        };

        let details = err.details();
        assert!(details.contains("180s"));
        assert!(details.contains("connection refused"));
        assert!(details.contains("stderr:\nError: missing OPENAI_API_KEY"));
        assert!(details.contains("stdout:\nbooting"));
        assert_eq!(err.to_string(), "gateway did not become ready within 180s");
    }

    #[test]
    fn test_timeout_details_without_logs() {
        let err = StartupError::ReadinessTimeout {
            waited: Duration::from_secs(5),
            last_probe: "status 500".to_string(),
            logs: None,
        };

        let details = err.details();
        assert!(details.contains("timed out after 5s"));
        assert!(!details.contains("stderr"));
    }
}
