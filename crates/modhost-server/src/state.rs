//! Shared application state.

use std::sync::Arc;

use modhost_core::ModuleHost;

/// Shared state across all request handlers.
///
/// Cloned for each request; the host itself is shared.
#[derive(Clone)]
pub struct AppState {
    host: Arc<ModuleHost>,
}

impl AppState {
    pub fn new(host: Arc<ModuleHost>) -> Self {
        Self { host }
    }

    /// The module host serving every request.
    pub fn host(&self) -> &Arc<ModuleHost> {
        &self.host
    }

    /// File extension of module files, without the dot.
    pub fn module_extension(&self) -> &str {
        &self.host.config().module_extension
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("host", &self.host)
            .finish()
    }
}
