//! Request front-end: JSON request body in, status code and JSON body out.
//!
//! This is the HTTP-shaped contract of the execution subsystem without an
//! HTTP server attached. An embedding server hands the raw body to
//! [`handle_request`] and writes back the returned status and body.
//!
//! ```text
//! POST {"code": "console.log(1)", "timeout_ms": 1000}
//!   200 {"output": "1"}
//!   200 {"error": "ReferenceError: x is not defined"}
//!   400 {"error": "Invalid code provided"}
//!   503 {"error": "Too many concurrent executions (limit 8)"}
//!   500 {"error": "Failed to execute code"}
//! ```
//!
//! Execution errors (syntax, runtime, timeout) are still `200`: the request
//! was handled and the error is the program's result.

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::result::{ExecutionResult, INTERNAL_FAILURE_MESSAGE};
use crate::sandbox::engine::{ExecutionEngine, ExecutionRequest};
use crate::sandbox::outcome::ErrorClass;

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_INTERNAL_ERROR: u16 = 500;
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Error message for a missing, empty or non-string `code` field.
pub const INVALID_CODE_MESSAGE: &str = "Invalid code provided";

/// Parsed request body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiRequest {
    pub code: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ApiRequest {
    /// Parses and checks a raw request body.
    ///
    /// Anything other than a JSON object with a non-empty string `code` is
    /// rejected with the invalid-code message.
    pub fn parse(body: &[u8]) -> Result<Self, String> {
        let value: Value =
            serde_json::from_slice(body).map_err(|_| INVALID_CODE_MESSAGE.to_string())?;

        match value.get("code") {
            Some(Value::String(code)) if !code.is_empty() => {}
            _ => return Err(INVALID_CODE_MESSAGE.to_string()),
        }

        serde_json::from_value(value).map_err(|e| format!("Invalid request: {}", e))
    }

    pub fn into_execution_request(self) -> ExecutionRequest {
        let request = ExecutionRequest::new(self.code);
        match self.timeout_ms {
            Some(ms) => request.with_deadline(Duration::from_millis(ms)),
            None => request,
        }
    }
}

/// Status code and JSON body to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: ExecutionResult,
}

impl ApiResponse {
    fn new(status: u16, body: ExecutionResult) -> Self {
        Self { status, body }
    }

    /// A response for a request that never ran.
    fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            status,
            ExecutionResult {
                output: String::new(),
                error: Some(message.into()),
                error_class: None,
            },
        )
    }

    /// Body as a JSON string.
    pub fn body_json(&self) -> String {
        // ExecutionResult holds only strings; encoding cannot fail.
        serde_json::to_string(&self.body).unwrap_or_else(|_| {
            format!(r#"{{"error":"{}"}}"#, INTERNAL_FAILURE_MESSAGE)
        })
    }
}

/// Handles one request body end to end.
///
/// The execution itself runs on its own task so that a host-side panic
/// while handling one request becomes a `500` for that request only.
pub async fn handle_request(engine: &ExecutionEngine, body: &[u8]) -> ApiResponse {
    let request = match ApiRequest::parse(body) {
        Ok(request) => request.into_execution_request(),
        Err(message) => {
            tracing::debug!("Rejecting malformed request: {}", message);
            return ApiResponse::rejected(STATUS_BAD_REQUEST, message);
        }
    };

    let engine = engine.clone();
    let handle = tokio::spawn(async move { engine.execute(request).await });

    match handle.await {
        Ok(Ok(result)) => ApiResponse::new(STATUS_OK, result),
        Ok(Err(e)) => {
            let status = if e.is_client_error() {
                STATUS_BAD_REQUEST
            } else {
                STATUS_UNAVAILABLE
            };
            ApiResponse::rejected(status, e.to_string())
        }
        Err(e) => {
            tracing::error!("Execution task failed: {}", e);
            ApiResponse::new(
                STATUS_INTERNAL_ERROR,
                ExecutionResult::failure("", INTERNAL_FAILURE_MESSAGE, ErrorClass::Internal),
            )
        }
    }
}
