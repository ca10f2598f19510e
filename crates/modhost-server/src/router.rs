//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with all
//! necessary routes and middleware.

use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admin::{AdminState, build_admin_router};
use crate::handler::{
    call_function, get_module, health_check, list_modules, readiness_check, run_module, run_wasm,
};
use crate::state::AppState;

/// Admin API configuration for router.
#[derive(Debug, Clone)]
pub struct AdminRouterConfig {
    /// Admin API prefix (e.g., "/admin").
    pub prefix: String,
    /// Admin authentication token.
    pub token: String,
}

/// Build the main application router.
///
/// Routes:
/// - `POST /run` - Run a module's entry point
/// - `POST /wasm` - Call a function named by command-line style options
/// - `POST /modules/:name/functions/:function` - Call a function with JSON arguments
/// - `GET /modules` - List loaded modules
/// - `GET /modules/:name` - Describe one module
/// - `GET /health` - Health check
/// - `GET /ready` - Readiness check
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    build_router_with_admin(state, request_timeout, None)
}

/// Build the main application router with optional Admin API.
pub fn build_router_with_admin(
    state: AppState,
    request_timeout: Duration,
    admin_config: Option<AdminRouterConfig>,
) -> Router {
    let execution_routes = Router::new()
        .route("/run", post(run_module))
        .route("/wasm", post(run_wasm))
        .route("/modules/:name/functions/:function", post(call_function));

    let module_routes = Router::new()
        .route("/modules", get(list_modules))
        .route("/modules/:name", get(get_module));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check));

    let mut router = Router::new()
        .merge(execution_routes)
        .merge(module_routes)
        .merge(health_routes);

    if let Some(config) = admin_config {
        let admin_state = AdminState {
            app_state: state.clone(),
            admin_token: config.token,
        };
        router = router.nest(&config.prefix, build_admin_router(admin_state));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
