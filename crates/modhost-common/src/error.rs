//! Error types for modhost.
//!
//! - [`HostError`]: failures of the module host (configuration, load, call, watcher)
//! - [`BridgeError`]: failures of the backing services behind host functions

use thiserror::Error;

/// Guidance attached to a missing-export error.
const FUNCTION_NOT_FOUND_HINT: &str = "rebuild the module for the wasm32-wasip1 target, \
export the function with #[no_mangle] pub extern \"C\", \
and confirm the module file is in the watched location";

/// Broad category of a [`HostError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Disabled feature or bad configuration. Loaded modules are unaffected.
    Config,
    /// The module could not be loaded. A previous pool keeps serving.
    Load,
    /// A single call failed. The instance is marked unhealthy.
    Call,
    /// The reload watcher failed. It keeps running.
    Watcher,
}

/// Module host errors.
///
/// Cloneable so the same error can be returned inside a call result and
/// handed to the error callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The module host is disabled in configuration.
    #[error("Module host is disabled")]
    Disabled,

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// The module name is not a single plain file name.
    #[error("Invalid module name: {name:?}")]
    InvalidModuleName { name: String },

    /// The module path is outside every allowed prefix.
    #[error("Path not allowed: {path}")]
    PathNotAllowed { path: String },

    /// The module file does not exist.
    #[error("Module file missing: {path}")]
    ModuleFileMissing { path: String },

    /// WebAssembly compilation or validation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed { reason: String },

    /// Creating an execution context failed.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed { reason: String },

    /// The module is not loaded.
    #[error("Module not found: {module}")]
    ModuleNotFound { module: String },

    /// The module is registered but has no instances to run on.
    #[error("Module {module} has no instances")]
    EmptyPool { module: String },

    /// The module does not export the requested function.
    #[error("Function {function} not found in module {module}: {FUNCTION_NOT_FOUND_HINT}")]
    FunctionNotFound { module: String, function: String },

    /// Arguments do not match the export's signature.
    #[error("Invalid arguments for {function}: {reason}")]
    InvalidArguments { function: String, reason: String },

    /// The guest broke the buffer calling convention.
    #[error("Calling convention violation: {reason}")]
    Abi { reason: String },

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap { message: String },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// The file watcher failed.
    #[error("Watcher error: {reason}")]
    Watcher { reason: String },
}

impl HostError {
    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `ModuleNotFound` error.
    pub fn module_not_found(module: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module: module.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `FunctionNotFound` error.
    pub fn function_not_found(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self::FunctionNotFound {
            module: module.into(),
            function: function.into(),
        }
    }

    /// Create a new `InvalidArguments` error.
    pub fn invalid_arguments(function: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            function: function.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `Abi` error.
    pub fn abi(reason: impl Into<String>) -> Self {
        Self::Abi {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `Watcher` error.
    pub fn watcher(reason: impl Into<String>) -> Self {
        Self::Watcher {
            reason: reason.into(),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Disabled
            | Self::InvalidConfig { .. }
            | Self::InvalidModuleName { .. }
            | Self::PathNotAllowed { .. } => ErrorKind::Config,
            Self::ModuleFileMissing { .. }
            | Self::CompilationFailed { .. }
            | Self::InstantiationFailed { .. } => ErrorKind::Load,
            Self::ModuleNotFound { .. }
            | Self::EmptyPool { .. }
            | Self::FunctionNotFound { .. }
            | Self::InvalidArguments { .. }
            | Self::Abi { .. }
            | Self::Trap { .. }
            | Self::FuelExhausted => ErrorKind::Call,
            Self::Watcher { .. } => ErrorKind::Watcher,
        }
    }

    /// Returns `true` if this error indicates the module was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ModuleNotFound { .. })
    }

    /// Returns `true` if the guest itself failed while running.
    pub fn is_guest_fault(&self) -> bool {
        matches!(self, Self::Trap { .. } | Self::FuelExhausted | Self::Abi { .. })
    }
}

/// Errors from the services behind the host-function bridges.
///
/// The guest only ever sees these as negative status codes.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// No backend is configured for this bridge.
    #[error("{bridge} bridge is disabled")]
    Disabled { bridge: &'static str },

    /// The backend rejected the request or could not be reached.
    #[error("{bridge} backend error: {message}")]
    Backend {
        bridge: &'static str,
        message: String,
    },

    /// The request itself was malformed.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

impl BridgeError {
    /// Create a new `Backend` error.
    pub fn backend(bridge: &'static str, message: impl ToString) -> Self {
        Self::Backend {
            bridge,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HostError::module_not_found("hello");
        assert_eq!(err.to_string(), "Module not found: hello");

        let err = HostError::FuelExhausted;
        assert_eq!(err.to_string(), "Fuel exhausted: CPU limit exceeded");
    }

    #[test]
    fn test_function_not_found_carries_guidance() {
        let message = HostError::function_not_found("hello", "greet").to_string();

        assert!(message.contains("greet"));
        assert!(message.contains("wasm32-wasip1"));
        assert!(message.contains("#[no_mangle]"));
        assert!(message.contains("watched location"));
    }

    #[test]
    fn test_kind() {
        assert_eq!(HostError::Disabled.kind(), ErrorKind::Config);
        assert_eq!(
            HostError::PathNotAllowed { path: "/etc".into() }.kind(),
            ErrorKind::Config
        );
        assert_eq!(
            HostError::ModuleFileMissing { path: "a.wasm".into() }.kind(),
            ErrorKind::Load
        );
        assert_eq!(HostError::compilation_failed("bad").kind(), ErrorKind::Load);
        assert_eq!(HostError::trap("unreachable").kind(), ErrorKind::Call);
        assert_eq!(
            HostError::EmptyPool { module: "m".into() }.kind(),
            ErrorKind::Call
        );
        assert_eq!(HostError::watcher("inotify").kind(), ErrorKind::Watcher);
    }

    #[test]
    fn test_predicates() {
        assert!(HostError::module_not_found("m").is_not_found());
        assert!(!HostError::FuelExhausted.is_not_found());

        assert!(HostError::FuelExhausted.is_guest_fault());
        assert!(HostError::abi("bad pointer").is_guest_fault());
        assert!(!HostError::function_not_found("m", "f").is_guest_fault());
    }

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::Disabled { bridge: "kv" };
        assert_eq!(err.to_string(), "kv bridge is disabled");

        let err = BridgeError::backend("sql", "connection refused");
        assert_eq!(err.to_string(), "sql backend error: connection refused");
    }
}
