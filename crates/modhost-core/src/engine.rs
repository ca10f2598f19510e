//! Wasmtime engine configuration and creation.
//!
//! One [`WasmEngine`] is shared by every module, pool and instance the host
//! creates. It carries no per-module state.

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use modhost_common::{EngineConfig, HostError};

/// Thread-safe WebAssembly engine wrapper.
///
/// The engine is configured with:
/// - **Async support**: host functions (kv/sql bridges) await their backends
/// - **Fuel metering**: bounds each call and lets long guests yield
/// - **Pooling allocator** (optional): instance slots shared by all pools
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    pub fn new(config: &EngineConfig) -> Result<Self, HostError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);
        wasmtime_config.consume_fuel(true);
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                instance_slots = config.instance_slots,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            HostError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        // Entry-point runs instantiate into a fresh store while the old one
        // is still alive, so every slot kind gets the same budget.
        pooling.total_core_instances(config.instance_slots);
        pooling.total_memories(config.instance_slots);
        pooling.total_tables(config.instance_slots);
        pooling.total_stacks(config.instance_slots);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("instance_slots", &self.config.instance_slots)
            .field("instance_memory_mb", &self.config.instance_memory_mb)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation_default() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        assert!(engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_creation_no_pooling() {
        let config = EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        };
        let engine = WasmEngine::new(&config).unwrap();

        assert!(!engine.is_pooling_enabled());
        assert_eq!(engine.config().instance_slots, 1000);
    }

    #[test]
    fn test_engine_debug() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();

        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("WasmEngine"));
        assert!(debug_str.contains("instance_slots"));
    }
}
