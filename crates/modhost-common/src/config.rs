//! Configuration structures for modhost.
//!
//! This module defines configuration options for the host subsystems:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling allocator)
//! - [`ExecutionConfig`]: Per-call execution limits (fuel, captured output)
//! - [`HostConfig`]: Module host settings (watch location, pool size, health checks)
//! - [`BridgesConfig`]: Backing services reachable from guest code

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the module host.
/// It can be loaded from files (TOML, JSON) or assembled from CLI flags.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Module host configuration.
    #[serde(default)]
    pub host: HostConfig,

    /// Host-function bridge backends.
    #[serde(default)]
    pub bridges: BridgesConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior shared by
/// every module and every pooled instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for instance creation.
    ///
    /// When enabled, memory is pre-allocated for a fixed number of instance
    /// slots. Pools of every loaded module draw from the same slots, and a
    /// reload briefly holds both the old and the new pool.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Total instance slots available to the pooling allocator.
    #[serde(default = "defaults::instance_slots")]
    pub instance_slots: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            instance_slots: defaults::instance_slots(),
            instance_memory_mb: defaults::instance_memory_mb(),
        }
    }
}

/// Per-call execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Enable fuel metering.
    ///
    /// When disabled, each call still runs with a fuel tank, but it is
    /// effectively unlimited.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Maximum fuel (CPU instructions) per call.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Fuel consumed between cooperative yields to the async executor.
    ///
    /// Yielding is what lets a caller-side deadline interrupt a guest that
    /// never calls back into the host.
    #[serde(default = "defaults::fuel_yield_interval")]
    pub fuel_yield_interval: u64,

    /// Capacity of each captured stdout/stderr stream in bytes.
    #[serde(default = "defaults::max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fuel_metering: defaults::fuel_metering(),
            max_fuel: defaults::max_fuel(),
            fuel_yield_interval: defaults::fuel_yield_interval(),
            max_output_bytes: defaults::max_output_bytes(),
        }
    }
}

impl ExecutionConfig {
    /// Fuel to put in the tank before each call.
    pub fn fuel_per_call(&self) -> u64 {
        if self.fuel_metering {
            self.max_fuel
        } else {
            u64::MAX
        }
    }
}

/// Module host configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Master switch. A disabled host refuses to start.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Watch location: a directory of modules or a single module file.
    #[serde(default = "defaults::watch_path")]
    pub watch_path: PathBuf,

    /// Number of execution contexts per module.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: usize,

    /// Health check interval in seconds. `0` disables the monitor.
    #[serde(default = "defaults::health_check_secs")]
    pub health_check_secs: u64,

    /// Path prefixes module files must live under.
    ///
    /// An empty list allows every path. This is a permissive default; the
    /// host logs a warning when it starts without restrictions.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,

    /// Reload modules when their files change.
    #[serde(default = "defaults::auto_reload")]
    pub auto_reload: bool,

    /// Window in milliseconds for coalescing file events.
    #[serde(default = "defaults::debounce_ms")]
    pub debounce_ms: u64,

    /// File extension of module files (without the dot).
    #[serde(default = "defaults::module_extension")]
    pub module_extension: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            watch_path: defaults::watch_path(),
            max_instances: defaults::max_instances(),
            health_check_secs: defaults::health_check_secs(),
            allowed_paths: Vec::new(),
            auto_reload: defaults::auto_reload(),
            debounce_ms: defaults::debounce_ms(),
            module_extension: defaults::module_extension(),
        }
    }
}

impl HostConfig {
    /// Get the health check interval, or `None` when the monitor is disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_secs > 0).then(|| Duration::from_secs(self.health_check_secs))
    }

    /// Get the debounce window as a `Duration`.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Returns `true` if no path restrictions are configured.
    pub fn is_unrestricted(&self) -> bool {
        self.allowed_paths.is_empty()
    }
}

/// Backends for the host-function bridges.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgesConfig {
    /// Key-value cache (redis).
    #[serde(default = "defaults::kv_backend")]
    pub kv: BackendConfig,

    /// Relational store (postgres).
    #[serde(default = "defaults::sql_backend")]
    pub sql: BackendConfig,
}

impl Default for BridgesConfig {
    fn default() -> Self {
        Self {
            kv: defaults::kv_backend(),
            sql: defaults::sql_backend(),
        }
    }
}

/// Address and pool size of one backing service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Connection address. The bridge is disabled when absent.
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum pooled connections.
    pub max_connections: u32,
}

impl BackendConfig {
    /// Returns `true` if an address is configured.
    pub fn is_enabled(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Default value functions for serde.
mod defaults {
    use std::path::PathBuf;

    use super::BackendConfig;

    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn instance_slots() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn fuel_yield_interval() -> u64 {
        10_000
    }

    pub const fn max_output_bytes() -> usize {
        1 << 20
    }

    pub const fn enabled() -> bool {
        true
    }

    pub fn watch_path() -> PathBuf {
        PathBuf::from("./functions")
    }

    pub const fn max_instances() -> usize {
        5
    }

    pub const fn health_check_secs() -> u64 {
        300
    }

    pub const fn auto_reload() -> bool {
        true
    }

    pub const fn debounce_ms() -> u64 {
        500
    }

    pub fn module_extension() -> String {
        "wasm".to_string()
    }

    pub fn kv_backend() -> BackendConfig {
        BackendConfig {
            url: None,
            max_connections: 32,
        }
    }

    pub fn sql_backend() -> BackendConfig {
        BackendConfig {
            url: None,
            max_connections: 16,
        }
    }
}
