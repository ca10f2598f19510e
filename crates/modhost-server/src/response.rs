//! Response bodies and the mapping from host errors to HTTP statuses.

use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

use modhost_common::HostError;
use modhost_core::CallResult;

/// Body of a successful `POST /run`.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub stdout: String,
    pub stderr: String,
    /// Wall time, e.g. `"12ms"`.
    pub cost: String,
    pub trace_id: String,
}

/// Body of a successful `POST /wasm`.
#[derive(Debug, Serialize)]
pub struct WasmResponse {
    /// Captured output if any, otherwise the return values.
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub duration: String,
}

impl WasmResponse {
    pub fn from_result(result: &CallResult) -> Self {
        Self {
            output: combined_output(result),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            duration: format!("{:?}", result.duration),
        }
    }
}

/// Stdout followed by stderr; the return values when both are empty.
fn combined_output(result: &CallResult) -> String {
    let captured = match (result.stdout.is_empty(), result.stderr.is_empty()) {
        (_, true) => result.stdout.clone(),
        (true, false) => result.stderr.clone(),
        (false, false) => format!("{}\n{}", result.stdout, result.stderr),
    };
    if !captured.is_empty() {
        return captured;
    }

    result
        .results
        .iter()
        .flatten()
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Body of `POST /modules/:name/functions/:function`, success or failure.
#[derive(Debug, Serialize)]
pub struct CallResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Value>>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub fuel_consumed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<CallResult> for CallResponse {
    fn from(result: CallResult) -> Self {
        Self {
            success: result.success,
            error: result.error_message(),
            results: result.results,
            stdout: result.stdout,
            stderr: result.stderr,
            duration_ms: millis(result.duration),
            fuel_consumed: result.fuel_consumed,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
pub fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// HTTP status for a host error.
pub fn status_for(error: &HostError) -> StatusCode {
    match error {
        HostError::Disabled | HostError::EmptyPool { .. } => StatusCode::SERVICE_UNAVAILABLE,
        HostError::InvalidConfig { .. }
        | HostError::InvalidModuleName { .. }
        | HostError::InvalidArguments { .. } => StatusCode::BAD_REQUEST,
        HostError::PathNotAllowed { .. } => StatusCode::FORBIDDEN,
        HostError::ModuleFileMissing { .. }
        | HostError::ModuleNotFound { .. }
        | HostError::FunctionNotFound { .. } => StatusCode::NOT_FOUND,
        HostError::CompilationFailed { .. } | HostError::InstantiationFailed { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        HostError::FuelExhausted => StatusCode::TOO_MANY_REQUESTS,
        HostError::Abi { .. } | HostError::Trap { .. } | HostError::Watcher { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// JSON error body: `{ "error": ..., "trace_id"?: ..., "exports"?: [...] }`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Functions the module does export, to help fix a bad call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exports: Option<Vec<String>>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error: message.into(),
            trace_id: None,
            exports: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Attach the module's exports and mention them in the message.
    pub fn with_exports(mut self, exports: Vec<String>) -> Self {
        if !exports.is_empty() {
            self.error = format!(
                "{}. Available functions: {}",
                self.error,
                exports.join(", ")
            );
            self.exports = Some(exports);
        }
        self
    }
}

impl From<&HostError> for ApiError {
    fn from(error: &HostError) -> Self {
        Self::new(status_for(error), error.to_string())
    }
}

impl From<HostError> for ApiError {
    fn from(error: HostError) -> Self {
        Self::from(&error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_result(stdout: &str, stderr: &str, results: Option<Vec<Value>>) -> CallResult {
        CallResult {
            success: true,
            results,
            duration: Duration::from_millis(3),
            error: None,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            fuel_consumed: 10,
        }
    }

    #[test]
    fn test_status_for() {
        assert_eq!(
            status_for(&HostError::module_not_found("m")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&HostError::function_not_found("m", "f")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&HostError::FuelExhausted),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&HostError::Disabled),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&HostError::trap("unreachable")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_combined_output() {
        let result = call_result("out", "err", Some(vec![json!(1)]));
        assert_eq!(WasmResponse::from_result(&result).output, "out\nerr");

        let result = call_result("", "err", None);
        assert_eq!(WasmResponse::from_result(&result).output, "err");

        let result = call_result("", "", Some(vec![json!(5), json!("text"), json!(1.5)]));
        assert_eq!(WasmResponse::from_result(&result).output, "5 text 1.5");
    }

    #[test]
    fn test_api_error_with_exports() {
        let err = ApiError::from(HostError::function_not_found("m", "f"))
            .with_exports(vec!["add".to_string(), "_start".to_string()]);
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert!(err.error.ends_with("Available functions: add, _start"));

        let body = serde_json::to_value(&err).unwrap();
        assert_eq!(body["exports"], json!(["add", "_start"]));
        assert!(body.get("trace_id").is_none());
    }

    #[test]
    fn test_call_response_from_failure() {
        let result = CallResult {
            success: false,
            results: None,
            duration: Duration::from_millis(1),
            error: Some(HostError::FuelExhausted),
            stdout: String::new(),
            stderr: String::new(),
            fuel_consumed: 0,
        };
        let body = serde_json::to_value(CallResponse::from(result)).unwrap();
        assert_eq!(body["success"], json!(false));
        assert!(body.get("results").is_none());
        assert!(body["error"].as_str().unwrap().contains("Fuel exhausted"));
    }
}
