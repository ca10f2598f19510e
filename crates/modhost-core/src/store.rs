//! Guest store state and per-call preparation.
//!
//! Every execution context owns one long-lived [`Store`]. Before each call
//! the host swaps in a fresh WASI context with empty output pipes and refills
//! the fuel tank, so calls on the same instance never see each other's
//! captured output.

use std::sync::Arc;

use wasmtime::Store;
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use modhost_common::{ExecutionConfig, HostError};

/// Data attached to every guest store.
///
/// Host functions reach it through [`wasmtime::Caller::data`].
pub struct GuestContext {
    /// WASI preview1 context (stdio, environment).
    pub wasi: WasiP1Ctx,

    /// Name of the module this store belongs to.
    module: Arc<str>,

    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
    max_output_bytes: usize,
}

impl GuestContext {
    /// Create a context with empty output pipes and no environment.
    pub fn new(module: Arc<str>, max_output_bytes: usize) -> Self {
        let (wasi, stdout, stderr) = build_wasi(max_output_bytes, &[]);
        Self {
            wasi,
            module,
            stdout,
            stderr,
            max_output_bytes,
        }
    }

    /// Replace the WASI context, discarding captured output.
    pub fn reset_io(&mut self, env: &[(String, String)]) {
        let (wasi, stdout, stderr) = build_wasi(self.max_output_bytes, env);
        self.wasi = wasi;
        self.stdout = stdout;
        self.stderr = stderr;
    }

    /// Module name this store belongs to.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Output captured since the last [`reset_io`](Self::reset_io).
    pub fn take_output(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: String::from_utf8_lossy(&self.stdout.contents()).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr.contents()).into_owned(),
        }
    }
}

/// Captured guest stdout/stderr of one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

fn build_wasi(
    capacity: usize,
    env: &[(String, String)],
) -> (WasiP1Ctx, MemoryOutputPipe, MemoryOutputPipe) {
    let stdout = MemoryOutputPipe::new(capacity);
    let stderr = MemoryOutputPipe::new(capacity);

    let mut builder = WasiCtxBuilder::new();
    builder.stdout(stdout.clone()).stderr(stderr.clone());
    for (key, value) in env {
        builder.env(key, value);
    }

    (builder.build_p1(), stdout, stderr)
}

/// Create a store for one execution context of `module`.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    module: Arc<str>,
) -> Result<Store<GuestContext>, HostError> {
    let mut store = Store::new(
        engine.inner(),
        GuestContext::new(module, config.max_output_bytes),
    );
    refuel(&mut store, config)?;
    Ok(store)
}

/// Refill the fuel tank and set the async yield interval.
pub fn refuel(store: &mut Store<GuestContext>, config: &ExecutionConfig) -> Result<(), HostError> {
    store
        .set_fuel(config.fuel_per_call())
        .map_err(|e| HostError::invalid_config(format!("Failed to set fuel: {e}")))?;

    if config.fuel_yield_interval > 0 {
        store
            .fuel_async_yield_interval(Some(config.fuel_yield_interval))
            .map_err(|e| HostError::invalid_config(format!("Failed to set yield interval: {e}")))?;
    }

    Ok(())
}

/// Fuel consumed since the tank was filled with `initial_fuel`.
pub fn fuel_consumed(initial_fuel: u64, store: &Store<GuestContext>) -> u64 {
    let remaining = store.get_fuel().unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
