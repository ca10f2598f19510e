//! HTTP server for modhost.
//!
//! Exposes a [`ModuleHost`](modhost_core::ModuleHost) over HTTP:
//!
//! - Running a module's entry point and calling named functions
//! - Listing and inspecting loaded modules
//! - Health and readiness checks
//! - Token-protected admin endpoints for loading and unloading modules
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use modhost_common::RuntimeConfig;
//! use modhost_core::{ModuleHost, WasmEngine, create_linker};
//! use modhost_server::{ModuleServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::default();
//!     let engine = WasmEngine::new(&config.engine)?;
//!     let linker = create_linker(&engine)?;
//!
//!     let host = ModuleHost::new(&config, engine, linker);
//!     host.start().await?;
//!
//!     ModuleServer::new(Arc::clone(&host), ServerConfig::default())
//!         .run()
//!         .await?;
//!     host.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use router::{AdminRouterConfig, build_router, build_router_with_admin};
pub use server::{ModuleServer, ServerConfig};
pub use state::AppState;
