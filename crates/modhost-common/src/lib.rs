//! Common types, errors, and configuration for modhost.
//!
//! This crate provides shared functionality used across the modhost workspace:
//! - Error types using `thiserror`
//! - Configuration structures for the module host and its bridges
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    BackendConfig, BridgesConfig, EngineConfig, ExecutionConfig, HostConfig, RuntimeConfig,
};
pub use config_file::{AdminConfig, ConfigFile, ConfigFileError, ServerConfigFile};
pub use error::{BridgeError, ErrorKind, HostError};
