//! Admin API handlers for host management.
//!
//! # Authentication
//!
//! All Admin API endpoints require the `X-Admin-Token` header
//! to match the configured admin token.
//!
//! # Endpoints
//!
//! - `POST /admin/modules/:name/load` - Load or reload a module from the watch location
//! - `DELETE /admin/modules/:name` - Unload a module
//! - `GET /admin/stats` - Host-wide counters

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use crate::response::ApiError;
use crate::state::AppState;

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

/// Admin API state containing app state and auth token.
#[derive(Clone)]
pub struct AdminState {
    pub app_state: AppState,
    /// Expected admin token for authentication.
    pub admin_token: String,
}

/// Build the Admin API router.
///
/// Returns a router that uses Extension to pass the admin state,
/// allowing it to be nested into routers with different state types.
pub fn build_admin_router(admin_state: AdminState) -> Router<AppState> {
    Router::new()
        .route("/modules/:name/load", post(load_module))
        .route("/modules/:name", delete(unload_module))
        .route("/stats", get(stats))
        .layer(Extension(admin_state))
}

/// Verify the admin token from request headers.
fn verify_token(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let Some(token) = headers.get(ADMIN_TOKEN_HEADER) else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Missing X-Admin-Token header",
        ));
    };

    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::new(StatusCode::UNAUTHORIZED, "Invalid admin token"))
    }
}

/// Load or reload a module.
///
/// # Response
///
/// The module's info after loading:
///
/// ```json
/// { "name": "hello", "exports": ["_start"], "instances": 5, ... }
/// ```
#[instrument(skip(admin_state, headers))]
pub async fn load_module(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let host = admin_state.app_state.host();
    if let Err(e) = host.load(&name).await {
        warn!(module = %name, error = %e, "Admin load failed");
        return ApiError::from(e).into_response();
    }

    info!(module = %name, "Module loaded via admin API");
    match host.module_info(&name).await {
        Some(info) => Json(info).into_response(),
        // Torn down between load and lookup.
        None => ApiError::not_found(format!("Module not loaded: {name}")).into_response(),
    }
}

/// Unload a module.
///
/// # Response
///
/// ```json
/// { "name": "hello", "message": "Module unloaded" }
/// ```
#[instrument(skip(admin_state, headers))]
pub async fn unload_module(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let host = admin_state.app_state.host();
    if !host.is_loaded(&name) {
        return ApiError::not_found(format!("Module not loaded: {name}")).into_response();
    }

    host.unload(&name).await;
    info!(module = %name, "Module unloaded via admin API");
    Json(serde_json::json!({
        "name": name,
        "message": "Module unloaded"
    }))
    .into_response()
}

/// Host-wide load and call counters.
#[instrument(skip_all)]
pub async fn stats(Extension(admin_state): Extension<AdminState>, headers: HeaderMap) -> Response {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let host = admin_state.app_state.host();
    Json(serde_json::json!({
        "stats": host.stats(),
        "modules_loaded": host.list_modules().await.len(),
        "active_module": host.active_module(),
    }))
    .into_response()
}
