//! Request handlers for running guest modules.
//!
//! Every handler goes through the [`ModuleHost`](modhost_core::ModuleHost)
//! held in [`AppState`]; nothing here touches Wasmtime directly.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use modhost_common::HostError;
use modhost_core::CallResult;

use crate::request::{
    CallRequest, RunRequest, WasmRequest, args_from_params, function_from_options,
    module_name_from,
};
use crate::response::{ApiError, CallResponse, RunResponse, WasmResponse, millis, status_for};
use crate::state::AppState;

/// Environment variable carrying the caller-supplied name into the guest.
pub const NAME_ENV: &str = "NAME";

/// Error of a failed call.
fn call_error(result: CallResult) -> HostError {
    result
        .error
        .unwrap_or_else(|| HostError::trap("call failed without an error"))
}

/// Run a module's entry point.
///
/// `POST /run` with `{ "name": "...", "module"?: "..." }`. Without a module
/// the active module runs.
#[instrument(skip(state, request), fields(trace_id))]
pub async fn run_module(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let trace_id = Uuid::new_v4().simple().to_string();
    tracing::Span::current().record("trace_id", trace_id.as_str());

    let start = Instant::now();
    let env = vec![(NAME_ENV.to_string(), request.name)];
    let host = state.host();

    let result = match request.module.as_deref() {
        Some(module) => host.run(module, env).await,
        None => host.run_active(env).await,
    };
    let cost = start.elapsed();

    if !result.success {
        let err = call_error(result);
        warn!(error = %err, "Run failed");
        return Err(ApiError::from(err).with_trace_id(trace_id));
    }

    info!(cost_ms = millis(cost), "Run completed");
    Ok(Json(RunResponse {
        stdout: result.stdout,
        stderr: result.stderr,
        cost: format!("{}ms", millis(cost)),
        trace_id,
    }))
}

/// Call a function named by command-line style options.
///
/// `POST /wasm` with `{ "wasm": "...", "options"?: "...", "params"?: "..." }`.
/// The module is loaded on first use.
#[instrument(skip_all)]
pub async fn run_wasm(
    State(state): State<AppState>,
    Json(request): Json<WasmRequest>,
) -> Result<Json<WasmResponse>, ApiError> {
    let module = module_name_from(&request.wasm, state.module_extension());
    if module.is_empty() {
        return Err(ApiError::bad_request("Missing module name in 'wasm'"));
    }

    let host = state.host();
    if let Err(e) = host.ensure_loaded(&module).await {
        warn!(module = %module, error = %e, "Module could not be loaded");
        return Err(ApiError::from(e));
    }

    let function = function_from_options(request.options.as_deref());
    let args = args_from_params(request.params.as_deref());

    let result = host.call(&module, &function, args).await;
    if result.success {
        return Ok(Json(WasmResponse::from_result(&result)));
    }

    let err = call_error(result);
    error!(module = %module, function = %function, error = %err, "Call failed");
    let exports = host
        .module_info(&module)
        .await
        .map(|info| info.exports)
        .unwrap_or_default();
    Err(ApiError::from(err).with_exports(exports))
}

/// Call a named export with JSON arguments.
///
/// `POST /modules/:name/functions/:function` with `{ "args": [...] }`.
/// Failures still carry the full call result in the body.
#[instrument(skip(state, request))]
pub async fn call_function(
    State(state): State<AppState>,
    Path((name, function)): Path<(String, String)>,
    request: Option<Json<CallRequest>>,
) -> Response {
    let args = request.map(|Json(r)| r.args).unwrap_or_default();
    let result = state.host().call(&name, &function, args).await;

    let status = result.error.as_ref().map_or(StatusCode::OK, status_for);
    (status, Json(CallResponse::from(result))).into_response()
}

/// List loaded modules.
pub async fn list_modules(State(state): State<AppState>) -> impl IntoResponse {
    let modules = state.host().list_modules().await;
    Json(serde_json::json!({
        "count": modules.len(),
        "modules": modules,
    }))
}

/// Describe one loaded module.
pub async fn get_module(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .host()
        .module_info(&name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Module not loaded: {name}")))
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// 503 once the host has been shut down.
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    let host = state.host();
    if host.is_shut_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "shutting_down" })),
        )
            .into_response();
    }

    Json(serde_json::json!({
        "status": "ready",
        "modules_loaded": host.list_modules().await.len(),
        "active_module": host.active_module(),
    }))
    .into_response()
}
