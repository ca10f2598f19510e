//! Fixed-size instance pools with round-robin selection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tracing::{debug, instrument};

use crate::instance::{GuestInstance, Health, InstanceRunner};
use crate::module::CompiledModule;
use modhost_common::HostError;

/// Every execution context of one loaded module version.
///
/// A pool is built completely or not at all: if any instance fails to
/// instantiate, the ones created so far are dropped with the error.
#[derive(Debug)]
pub struct InstancePool {
    instances: Vec<Arc<GuestInstance>>,
    exports: Vec<String>,
}

impl InstancePool {
    /// Instantiate `size` execution contexts of `module`, one after another.
    ///
    /// Export names are captured from the first instance; later instances
    /// come from the same bytes and are assumed to match.
    #[instrument(skip(runner, module), fields(module = %name))]
    pub async fn build(
        runner: &InstanceRunner,
        module: &CompiledModule,
        name: Arc<str>,
        size: usize,
    ) -> Result<Self, HostError> {
        if size == 0 {
            return Err(HostError::invalid_config("max_instances must be at least 1"));
        }

        let mut instances = Vec::with_capacity(size);
        let mut exports = Vec::new();

        for id in 0..size {
            let instance = runner.instantiate(module, Arc::clone(&name), id).await?;
            if id == 0 {
                exports = module.function_exports();
            }
            instances.push(Arc::new(instance));
        }

        debug!(instances = size, "Instance pool built");

        Ok(Self { instances, exports })
    }

    /// Pick an instance using the shared call counter.
    pub fn select(&self, counter: &AtomicU64) -> Option<Arc<GuestInstance>> {
        if self.instances.is_empty() {
            return None;
        }
        let ticket = counter.fetch_add(1, Ordering::Relaxed);
        let len = self.instances.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let index = (ticket % len) as usize;
        self.instances.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[Arc<GuestInstance>] {
        &self.instances
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    /// Sum of usage counters across the pool.
    pub fn total_usage(&self) -> u64 {
        self.instances.iter().map(|i| i.usage()).sum()
    }

    pub fn healthy_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.health() == Health::Healthy)
            .count()
    }

    /// Instances that are healthy and were used within `window`.
    pub fn fresh_count(&self, now: SystemTime, window: Duration) -> usize {
        self.instances
            .iter()
            .filter(|i| i.is_fresh(now, window))
            .count()
    }

    /// Mark every instance retired.
    ///
    /// Calls already holding an instance finish normally; the store is
    /// freed when the last reference to the instance goes away.
    pub fn release(&self) {
        for instance in &self.instances {
            instance.retire();
        }
    }
}
