//! HTTP server implementation.
//!
//! This module provides the main [`ModuleServer`] struct for serving a
//! [`ModuleHost`] over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use modhost_common::{AdminConfig, HostError, ServerConfigFile};
use modhost_core::ModuleHost;

use crate::router::{AdminRouterConfig, build_router_with_admin};
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
    /// Admin API, if enabled.
    pub admin: Option<AdminRouterConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
            admin: None,
        }
    }
}

impl ServerConfig {
    /// Build from the `[server]` and `[admin]` sections of the config file.
    pub fn from_file(server: &ServerConfigFile, admin: &AdminConfig) -> Result<Self, HostError> {
        let bind_addr = server.bind_addr.parse().map_err(|e| {
            HostError::invalid_config(format!("Invalid bind_addr '{}': {e}", server.bind_addr))
        })?;

        let admin = match &admin.token {
            Some(token) if admin.is_configured() => Some(AdminRouterConfig {
                prefix: admin.prefix.clone(),
                token: token.clone(),
            }),
            _ => {
                if admin.enabled {
                    warn!("Admin API enabled without a token; leaving it disabled");
                }
                None
            }
        };

        Ok(Self {
            bind_addr,
            request_timeout_secs: server.request_timeout_secs,
            graceful_shutdown: server.graceful_shutdown,
            admin,
        })
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// HTTP front end of a [`ModuleHost`].
///
/// # Example
///
/// ```ignore
/// let host = ModuleHost::new(&runtime_config, engine, linker);
/// host.start().await?;
///
/// ModuleServer::new(Arc::clone(&host), ServerConfig::default())
///     .run()
///     .await?;
/// host.shutdown().await;
/// ```
pub struct ModuleServer {
    state: AppState,
    config: ServerConfig,
}

impl ModuleServer {
    pub fn new(host: Arc<ModuleHost>, config: ServerConfig) -> Self {
        Self {
            state: AppState::new(host),
            config,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// With graceful shutdown enabled this returns after SIGTERM/SIGINT once
    /// in-flight requests have finished. The host itself is left running.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), HostError> {
        let app = build_router_with_admin(
            self.state,
            self.config.request_timeout(),
            self.config.admin.clone(),
        );

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| HostError::invalid_config(format!("Failed to bind: {e}")))?;

        info!(
            addr = %self.config.bind_addr,
            admin = self.config.admin.is_some(),
            "Starting HTTP server"
        );

        if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(|e| HostError::invalid_config(format!("Server error: {e}")))?;
        } else {
            axum::serve(listener, app)
                .await
                .map_err(|e| HostError::invalid_config(format!("Server error: {e}")))?;
        }

        info!("Server shutdown complete");
        Ok(())
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// A signal that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.graceful_shutdown);
        assert!(config.admin.is_none());
    }

    #[test]
    fn test_server_config_builder() {
        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        let config = ServerConfig::default()
            .with_bind_addr(addr)
            .with_timeout(60);

        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_server_config_from_file() {
        let server = ServerConfigFile {
            bind_addr: "127.0.0.1:9000".to_string(),
            request_timeout_secs: 5,
            graceful_shutdown: false,
        };
        let admin = AdminConfig {
            enabled: true,
            token: Some("secret".to_string()),
            prefix: "/ops".to_string(),
        };

        let config = ServerConfig::from_file(&server, &admin).unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert!(!config.graceful_shutdown);
        assert_eq!(config.admin.unwrap().prefix, "/ops");

        // Enabled without a token stays off.
        let admin = AdminConfig {
            enabled: true,
            ..Default::default()
        };
        let config = ServerConfig::from_file(&server, &admin).unwrap();
        assert!(config.admin.is_none());
    }

    #[test]
    fn test_server_config_invalid_bind_addr() {
        let server = ServerConfigFile {
            bind_addr: "not-an-address".to_string(),
            ..Default::default()
        };
        let result = ServerConfig::from_file(&server, &AdminConfig::default());
        assert!(matches!(result, Err(HostError::InvalidConfig { .. })));
    }
}
