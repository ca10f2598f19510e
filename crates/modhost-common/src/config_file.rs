//! TOML configuration file for the modhost binary.
//!
//! - [`ConfigFile`]: the whole file
//! - [`ServerConfigFile`]: HTTP listener settings
//! - [`AdminConfig`]: token-protected management endpoints

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.host]
/// watch_path = "./functions"
/// max_instances = 5
/// health_check_secs = 300
/// allowed_paths = ["./functions"]
///
/// [runtime.execution]
/// max_fuel = 10_000_000
///
/// [runtime.bridges.kv]
/// url = "redis://127.0.0.1:6379"
/// max_connections = 32
///
/// [runtime.bridges.sql]
/// url = "postgres://postgres@localhost/app"
/// max_connections = 16
///
/// [server]
/// bind_addr = "0.0.0.0:8080"
/// request_timeout_secs = 30
///
/// [admin]
/// enabled = true
/// token = "your-secret-token"
/// prefix = "/admin"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Module host configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Admin API configuration.
    #[serde(default)]
    pub admin: AdminConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Wait for in-flight requests on shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Enable Admin API.
    #[serde(default)]
    pub enabled: bool,

    /// Authentication token, sent by clients in the `X-Admin-Token` header.
    pub token: Option<String>,

    /// URL prefix for Admin API endpoints.
    #[serde(default = "defaults::admin_prefix")]
    pub prefix: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: None,
            prefix: defaults::admin_prefix(),
        }
    }
}

impl AdminConfig {
    /// Returns `true` if enabled and a non-empty token is set.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }

    pub fn admin_prefix() -> String {
        "/admin".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert!(config.server.graceful_shutdown);
        assert!(!config.admin.enabled);
        assert_eq!(config.admin.prefix, "/admin");
        assert_eq!(config.runtime.host.max_instances, 5);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.engine]
            instance_slots = 200

            [runtime.execution]
            max_fuel = 5_000_000

            [runtime.host]
            watch_path = "/srv/functions/app.wasm"
            max_instances = 3
            health_check_secs = 0
            allowed_paths = ["/srv/functions"]
            auto_reload = false

            [runtime.bridges.kv]
            url = "redis://cache:6379"
            max_connections = 8

            [runtime.bridges.sql]
            url = "postgres://db/app"

            [server]
            bind_addr = "127.0.0.1:9000"
            request_timeout_secs = 60
            graceful_shutdown = false

            [admin]
            enabled = true
            token = "secret-token"
            prefix = "/ops"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();
        let host = &config.runtime.host;

        assert_eq!(config.runtime.engine.instance_slots, 200);
        assert_eq!(config.runtime.execution.max_fuel, 5_000_000);
        assert_eq!(host.watch_path, PathBuf::from("/srv/functions/app.wasm"));
        assert_eq!(host.max_instances, 3);
        assert!(host.health_check_interval().is_none());
        assert!(!host.auto_reload);
        assert!(!host.is_unrestricted());

        assert!(config.runtime.bridges.kv.is_enabled());
        assert_eq!(config.runtime.bridges.kv.max_connections, 8);
        assert!(config.runtime.bridges.sql.is_enabled());
        // max_connections falls back to the sql default
        assert_eq!(config.runtime.bridges.sql.max_connections, 16);

        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert!(!config.server.graceful_shutdown);
        assert!(config.admin.is_configured());
        assert_eq!(config.admin.prefix, "/ops");
    }

    #[test]
    fn test_admin_config_is_configured() {
        let mut admin = AdminConfig::default();
        assert!(!admin.is_configured());

        admin.enabled = true;
        assert!(!admin.is_configured());

        admin.token = Some(String::new());
        assert!(!admin.is_configured());

        admin.token = Some("token".to_string());
        assert!(admin.is_configured());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[runtime.host]\nmax_instances = 7").unwrap();

        let config = ConfigFile::from_file(file.path()).unwrap();
        assert_eq!(config.runtime.host.max_instances, 7);

        let missing = ConfigFile::from_file("/nonexistent/modhost.toml");
        assert!(matches!(missing, Err(ConfigFileError::Io { .. })));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = ConfigFile::from_toml("this is not valid toml [");
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }
}
