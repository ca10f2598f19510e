//! The module host: registry, lifecycle and call dispatch.
//!
//! [`ModuleHost`] owns one [`InstancePool`] per loaded module and composes the
//! reload watcher and health monitor around it.
//!
//! # Locking
//!
//! A module name gets a [`ModuleSlot`] when a load starts. The slot is dropped
//! again once it holds no pool and no other task has a handle to it, so names
//! that never load leave nothing behind. While a task holds the slot:
//!
//! - `reload` serializes load/unload of one module (watcher, health monitor
//!   and API callers may race on the same name).
//! - `pool` is a reader/writer lock over the pool itself. Calls take it for
//!   reading only long enough to pick an instance; swapping in a new pool
//!   takes it for writing.
//!
//! The instance's own execution lock is taken after the pool lock has been
//! released, so a slow call never blocks a reload.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use wasmtime::Linker;

use crate::instance::{GuestInstance, InstanceRunner};
use crate::module::{CompiledModule, ENTRY_POINT};
use crate::pool::InstancePool;
use crate::store::GuestContext;
use crate::watcher::{self, WatchTarget};
use crate::{WasmEngine, health};
use modhost_common::{HostConfig, HostError, RuntimeConfig};

/// Synthetic module name for preload failures.
pub const PRELOAD_SOURCE: &str = "preload";
/// Synthetic module name for reload watcher failures.
pub const WATCHER_SOURCE: &str = "watcher";
/// Synthetic module name for health-triggered reload failures.
pub const HEALTH_CHECK_SOURCE: &str = "health_check";

/// Called with the module name after a successful load or reload.
pub type ModuleCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Called with `(module, function, error)` when a call or background task fails.
pub type ErrorCallback = Arc<dyn Fn(&str, &str, &HostError) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    loaded: RwLock<Option<ModuleCallback>>,
    unloaded: RwLock<Option<ModuleCallback>>,
    error: RwLock<Option<ErrorCallback>>,
}

#[derive(Default)]
struct ModuleSlot {
    reload: tokio::sync::Mutex<()>,
    pool: tokio::sync::RwLock<Option<InstancePool>>,
}

struct ModuleRecord {
    path: PathBuf,
    loaded_at: SystemTime,
    /// Modification time of the file when it was loaded.
    modified: SystemTime,
    exports: Vec<String>,
    calls: AtomicU64,
}

#[derive(Default)]
struct Counters {
    total_loads: AtomicU64,
    failed_loads: AtomicU64,
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
}

#[derive(Default)]
struct Background {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Result of one call. Never persisted.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub success: bool,
    /// Return values; `None` for entry-point runs and failed calls.
    pub results: Option<Vec<Value>>,
    pub duration: Duration,
    pub error: Option<HostError>,
    pub stdout: String,
    pub stderr: String,
    pub fuel_consumed: u64,
}

impl CallResult {
    fn failure(error: HostError, duration: Duration) -> Self {
        Self {
            success: false,
            results: None,
            duration,
            error: Some(error),
            stdout: String::new(),
            stderr: String::new(),
            fuel_consumed: 0,
        }
    }

    /// Error text, if the call failed.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// Snapshot of one loaded module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub path: PathBuf,
    /// Seconds since the Unix epoch.
    pub loaded_at: u64,
    pub exports: Vec<String>,
    pub instances: usize,
    pub healthy_instances: usize,
    /// Invocations summed across the current pool.
    pub usage: u64,
    /// Calls routed to this module since it was loaded.
    pub calls: u64,
    pub active: bool,
}

/// Host-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub total_loads: u64,
    pub failed_loads: u64,
    pub total_calls: u64,
    pub failed_calls: u64,
}

/// Sandboxed module host.
pub struct ModuleHost {
    config: HostConfig,
    target: WatchTarget,
    runner: InstanceRunner,
    slots: DashMap<String, Arc<ModuleSlot>>,
    modules: DashMap<String, ModuleRecord>,
    /// Shared round-robin counter for every pool.
    call_counter: AtomicU64,
    counters: Counters,
    active: RwLock<Option<String>>,
    callbacks: Callbacks,
    background: Mutex<Background>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ModuleHost {
    /// Create a host. Nothing is loaded until [`start`](Self::start) or
    /// [`load`](Self::load).
    ///
    /// `linker` must have been created for `engine` and carry every import
    /// guest modules may use.
    pub fn new(
        config: &RuntimeConfig,
        engine: WasmEngine,
        linker: Linker<GuestContext>,
    ) -> Arc<Self> {
        let host = &config.host;
        let target = WatchTarget::resolve(&host.watch_path, &host.module_extension);

        Arc::new(Self {
            config: host.clone(),
            target,
            runner: InstanceRunner::new(engine, Arc::new(linker), config.execution.clone()),
            slots: DashMap::new(),
            modules: DashMap::new(),
            call_counter: AtomicU64::new(0),
            counters: Counters::default(),
            active: RwLock::new(None),
            callbacks: Callbacks::default(),
            background: Mutex::new(Background::default()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Preload every module in the watch location and start the reload
    /// watcher and health monitor.
    pub async fn start(self: &Arc<Self>) -> Result<(), HostError> {
        self.ensure_running()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if self.config.is_unrestricted() {
            warn!("No allowed_paths configured; modules may be loaded from any path");
        }

        self.target.prepare()?;
        self.preload().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if self.config.auto_reload {
            match watcher::spawn(
                Arc::downgrade(self),
                self.target.clone(),
                self.config.debounce(),
                shutdown_rx.clone(),
            ) {
                Ok(task) => tasks.push(task),
                Err(e) => self.report_error(WATCHER_SOURCE, "start", &e),
            }
        }

        if let Some(interval) = self.config.health_check_interval() {
            tasks.push(health::spawn(Arc::downgrade(self), interval, shutdown_rx));
        }

        let mut background = self.background.lock();
        background.shutdown = Some(shutdown_tx);
        background.tasks = tasks;

        info!(
            watch_path = %self.config.watch_path.display(),
            modules = self.modules.len(),
            max_instances = self.config.max_instances,
            auto_reload = self.config.auto_reload,
            "Module host started"
        );
        Ok(())
    }

    async fn preload(&self) {
        let files = match self.target.module_files(&self.config.module_extension) {
            Ok(files) => files,
            Err(e) => {
                self.report_error(PRELOAD_SOURCE, "read_dir", &e);
                return;
            }
        };

        for file in files {
            let Some(name) = module_name(&file) else {
                continue;
            };
            if let Err(e) = self.load(&name).await {
                self.report_error(PRELOAD_SOURCE, &name, &e);
            }
        }
    }

    /// Load or reload a module from the watch location.
    ///
    /// The new pool is built before the old one is touched; on failure the
    /// previous pool keeps serving. A missing file tears down the module.
    #[instrument(skip(self))]
    pub async fn load(&self, name: &str) -> Result<(), HostError> {
        self.ensure_running()?;
        validate_module_name(name)?;
        let path = self.module_path(name);
        self.check_allowed(&path)?;

        let result = self.load_from(name, &path).await;
        match &result {
            Ok(()) => {
                self.counters.total_loads.fetch_add(1, Ordering::Relaxed);
                self.refresh_active();
                self.fire_loaded(name);
            }
            Err(e) => {
                self.counters.failed_loads.fetch_add(1, Ordering::Relaxed);
                warn!(module = name, error = %e, "Module load failed");
            }
        }
        result
    }

    async fn load_from(&self, name: &str, path: &Path) -> Result<(), HostError> {
        let slot = self.slot(name);
        let _reload = slot.reload.lock().await;
        let result = self.load_locked(name, path, &slot).await;
        if result.is_err() {
            self.forget_slot(name, &slot);
        }
        result
    }

    async fn load_locked(
        &self,
        name: &str,
        path: &Path,
        slot: &ModuleSlot,
    ) -> Result<(), HostError> {
        let start = Instant::now();

        let engine = self.runner.engine().clone();
        let file = path.to_path_buf();
        let compiled =
            tokio::task::spawn_blocking(move || CompiledModule::from_file(engine.inner(), &file))
                .await
                .map_err(|e| HostError::compilation_failed(e.to_string()))?;

        let module = match compiled {
            Ok(module) => module,
            Err(e @ HostError::ModuleFileMissing { .. }) => {
                self.remove_locked(name, slot).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());

        let pool = InstancePool::build(
            &self.runner,
            &module,
            Arc::from(name),
            self.config.max_instances,
        )
        .await?;
        let exports = pool.exports().to_vec();
        let instances = pool.len();

        let previous = slot.pool.write().await.replace(pool);
        self.modules.insert(
            name.to_string(),
            ModuleRecord {
                path: path.to_path_buf(),
                loaded_at: SystemTime::now(),
                modified,
                exports,
                calls: AtomicU64::new(0),
            },
        );

        if let Some(previous) = previous {
            previous.release();
        }

        info!(
            module = name,
            instances,
            duration_ms = start.elapsed().as_millis(),
            "Module loaded"
        );
        Ok(())
    }

    /// Returns `true` if `name` has a live pool.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Load `name` unless it is already loaded.
    pub async fn ensure_loaded(&self, name: &str) -> Result<(), HostError> {
        if self.is_loaded(name) {
            return Ok(());
        }
        self.load(name).await
    }

    /// Release every instance of `name` and forget it. No-op if not loaded.
    #[instrument(skip(self))]
    pub async fn unload(&self, name: &str) {
        let Some(slot) = self.slots.get(name).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let _reload = slot.reload.lock().await;
        self.remove_locked(name, &slot).await;
        self.forget_slot(name, &slot);
    }

    async fn remove_locked(&self, name: &str, slot: &ModuleSlot) {
        let previous = slot.pool.write().await.take();
        let removed = self.modules.remove(name).is_some();

        if let Some(previous) = previous {
            previous.release();
        }

        if removed {
            self.refresh_active();
            info!(module = name, "Module unloaded");
            self.fire_unloaded(name);
        }
    }

    /// Call an exported function of `name`.
    ///
    /// `_start` and `main` run the entry point instead.
    pub async fn call(&self, name: &str, function: &str, args: Vec<Value>) -> CallResult {
        self.dispatch(name, function, &args, &[]).await
    }

    /// Run the entry point of `name` with `env` as its environment.
    pub async fn run(&self, name: &str, env: Vec<(String, String)>) -> CallResult {
        self.dispatch(name, ENTRY_POINT, &[], &env).await
    }

    /// Run the entry point of the active module.
    pub async fn run_active(&self, env: Vec<(String, String)>) -> CallResult {
        match self.active_module() {
            Some(name) => self.run(&name, env).await,
            None => {
                let error = HostError::module_not_found("no active module");
                self.record_failure("active", ENTRY_POINT, &error);
                CallResult::failure(error, Duration::ZERO)
            }
        }
    }

    #[instrument(skip(self, args, env))]
    async fn dispatch(
        &self,
        name: &str,
        function: &str,
        args: &[Value],
        env: &[(String, String)],
    ) -> CallResult {
        let start = Instant::now();

        let instance = match self.ensure_running() {
            Ok(()) => self.pick(name).await,
            Err(e) => Err(e),
        };
        let instance = match instance {
            Ok(instance) => instance,
            Err(e) => {
                self.record_failure(name, function, &e);
                return CallResult::failure(e, start.elapsed());
            }
        };

        let invocation = self.runner.invoke(&instance, function, args, env).await;
        if let Some(record) = self.modules.get(name) {
            record.calls.fetch_add(1, Ordering::Relaxed);
        }

        let duration = start.elapsed();
        match invocation.result {
            Ok(results) => {
                self.counters.total_calls.fetch_add(1, Ordering::Relaxed);
                CallResult {
                    success: true,
                    results,
                    duration,
                    error: None,
                    stdout: invocation.output.stdout,
                    stderr: invocation.output.stderr,
                    fuel_consumed: invocation.fuel_consumed,
                }
            }
            Err(error) => {
                self.record_failure(name, function, &error);
                CallResult {
                    success: false,
                    results: None,
                    duration,
                    error: Some(error),
                    stdout: invocation.output.stdout,
                    stderr: invocation.output.stderr,
                    fuel_consumed: invocation.fuel_consumed,
                }
            }
        }
    }

    async fn pick(&self, name: &str) -> Result<Arc<GuestInstance>, HostError> {
        let slot = self
            .slots
            .get(name)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| HostError::module_not_found(name))?;

        let pool = slot.pool.read().await;
        let pool = pool
            .as_ref()
            .ok_or_else(|| HostError::module_not_found(name))?;
        pool.select(&self.call_counter)
            .ok_or_else(|| HostError::EmptyPool {
                module: name.to_string(),
            })
    }

    fn record_failure(&self, name: &str, function: &str, error: &HostError) {
        self.counters.total_calls.fetch_add(1, Ordering::Relaxed);
        self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
        debug!(module = name, function, error = %error, "Call failed");
        self.report_error(name, function, error);
    }

    /// Snapshot of one module, or `None` if it is not loaded.
    pub async fn module_info(&self, name: &str) -> Option<ModuleInfo> {
        let slot = self.slots.get(name).map(|s| Arc::clone(s.value()))?;
        let pool = slot.pool.read().await;
        let pool = pool.as_ref()?;

        let record = self.modules.get(name)?;
        let active = self.active.read().as_deref() == Some(name);

        Some(ModuleInfo {
            name: name.to_string(),
            path: record.path.clone(),
            loaded_at: record
                .loaded_at
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            exports: record.exports.clone(),
            instances: pool.len(),
            healthy_instances: pool.healthy_count(),
            usage: pool.total_usage(),
            calls: record.calls.load(Ordering::Relaxed),
            active,
        })
    }

    /// Snapshots of every loaded module, sorted by name.
    pub async fn list_modules(&self) -> Vec<ModuleInfo> {
        let mut names: Vec<String> = self.modules.iter().map(|e| e.key().clone()).collect();
        names.sort();

        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            if let Some(info) = self.module_info(&name).await {
                infos.push(info);
            }
        }
        infos
    }

    /// Instances of the current pool of `name`.
    pub async fn instances(&self, name: &str) -> Vec<Arc<GuestInstance>> {
        let Some(slot) = self.slots.get(name).map(|s| Arc::clone(s.value())) else {
            return Vec::new();
        };
        let pool = slot.pool.read().await;
        pool.as_ref()
            .map(|p| p.instances().to_vec())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            total_loads: self.counters.total_loads.load(Ordering::Relaxed),
            failed_loads: self.counters.failed_loads.load(Ordering::Relaxed),
            total_calls: self.counters.total_calls.load(Ordering::Relaxed),
            failed_calls: self.counters.failed_calls.load(Ordering::Relaxed),
        }
    }

    /// Most recently modified module among the loaded ones.
    pub fn active_module(&self) -> Option<String> {
        self.active.read().clone()
    }

    fn refresh_active(&self) {
        let newest = self
            .modules
            .iter()
            .max_by(|a, b| {
                a.modified
                    .cmp(&b.modified)
                    .then_with(|| b.key().cmp(a.key()))
            })
            .map(|e| e.key().clone());

        let mut active = self.active.write();
        if *active != newest {
            debug!(active = ?newest, "Active module changed");
            *active = newest;
        }
    }

    /// Reload every module whose pool has lost its healthy majority.
    ///
    /// An instance counts as healthy when its flag is healthy and it was used
    /// within two intervals. Reloads run in the background; their failures
    /// are reported under [`HEALTH_CHECK_SOURCE`]. Returns the modules for
    /// which a reload was triggered.
    pub async fn check_health(self: &Arc<Self>, interval: Duration) -> Vec<String> {
        let now = SystemTime::now();
        let window = interval * 2;
        let slots: Vec<(String, Arc<ModuleSlot>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut triggered = Vec::new();
        for (name, slot) in slots {
            let degraded = {
                let pool = slot.pool.read().await;
                pool.as_ref()
                    .is_some_and(|p| p.fresh_count(now, window) * 2 < p.len())
            };
            if !degraded {
                continue;
            }

            warn!(module = %name, "Instance pool degraded, reloading");
            let host = Arc::clone(self);
            let module = name.clone();
            tokio::spawn(async move {
                if let Err(e) = host.load(&module).await {
                    host.report_error(HEALTH_CHECK_SOURCE, &module, &e);
                }
            });
            triggered.push(name);
        }
        triggered
    }

    /// Stop background tasks and unload every module. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let (shutdown, tasks) = {
            let mut background = self.background.lock();
            (
                background.shutdown.take(),
                std::mem::take(&mut background.tasks),
            )
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        for task in tasks {
            let _ = task.await;
        }

        let names: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.unload(&name).await;
        }

        info!("Module host shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn on_module_loaded(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.callbacks.loaded.write() = Some(Arc::new(callback));
    }

    pub fn on_module_unloaded(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.callbacks.unloaded.write() = Some(Arc::new(callback));
    }

    pub fn on_call_error(
        &self,
        callback: impl Fn(&str, &str, &HostError) + Send + Sync + 'static,
    ) {
        *self.callbacks.error.write() = Some(Arc::new(callback));
    }

    fn fire_loaded(&self, name: &str) {
        let callback = self.callbacks.loaded.read().clone();
        if let Some(callback) = callback {
            callback(name);
        }
    }

    fn fire_unloaded(&self, name: &str) {
        let callback = self.callbacks.unloaded.read().clone();
        if let Some(callback) = callback {
            callback(name);
        }
    }

    pub(crate) fn report_error(&self, module: &str, function: &str, error: &HostError) {
        let callback = self.callbacks.error.read().clone();
        if let Some(callback) = callback {
            callback(module, function, error);
        }
    }

    fn ensure_running(&self) -> Result<(), HostError> {
        if !self.config.enabled || self.is_shut_down() {
            return Err(HostError::Disabled);
        }
        Ok(())
    }

    fn slot(&self, name: &str) -> Arc<ModuleSlot> {
        Arc::clone(self.slots.entry(name.to_string()).or_default().value())
    }

    /// Drop `name`'s slot if it has no pool and `slot` is the only handle
    /// outside the map. The caller holds the slot's reload lock.
    fn forget_slot(&self, name: &str, slot: &Arc<ModuleSlot>) {
        self.slots.remove_if(name, |_, current| {
            Arc::ptr_eq(current, slot)
                && Arc::strong_count(current) == 2
                && current.pool.try_read().is_ok_and(|pool| pool.is_none())
        });
    }

    /// File a module name resolves to.
    pub fn module_path(&self, name: &str) -> PathBuf {
        self.target.module_path(name, &self.config.module_extension)
    }

    fn check_allowed(&self, path: &Path) -> Result<(), HostError> {
        if self.config.is_unrestricted() {
            return Ok(());
        }

        let candidate = normalize(path);
        let allowed = self
            .config
            .allowed_paths
            .iter()
            .any(|prefix| candidate.starts_with(normalize(prefix)));

        if allowed {
            Ok(())
        } else {
            Err(HostError::PathNotAllowed {
                path: path.display().to_string(),
            })
        }
    }
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("target", &self.target)
            .field("modules", &self.modules.len())
            .field("stopped", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Module name for a module file: its stem.
pub fn module_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(ToString::to_string)
}

/// Reject names that are not a single plain path component.
pub fn validate_module_name(name: &str) -> Result<(), HostError> {
    let mut components = Path::new(name).components();
    let valid = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    );

    if valid && !name.contains(['/', '\\']) {
        Ok(())
    } else {
        Err(HostError::InvalidModuleName {
            name: name.to_string(),
        })
    }
}

/// Absolute, lexically normalized form of `path` for prefix checks.
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_module_name() {
        assert!(validate_module_name("hello").is_ok());
        assert!(validate_module_name("hello-world_2").is_ok());

        for bad in ["", ".", "..", "a/b", "../etc", "/abs", "a\\b"] {
            assert!(
                matches!(
                    validate_module_name(bad),
                    Err(HostError::InvalidModuleName { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_module_name() {
        assert_eq!(module_name(Path::new("/srv/f/hello.wasm")).as_deref(), Some("hello"));
        assert_eq!(module_name(Path::new("plain")).as_deref(), Some("plain"));
    }

    fn test_host(dir: &Path) -> Arc<ModuleHost> {
        let config = RuntimeConfig {
            engine: modhost_common::EngineConfig {
                pooling_allocator: false,
                ..Default::default()
            },
            host: HostConfig {
                watch_path: dir.to_path_buf(),
                max_instances: 1,
                health_check_secs: 0,
                auto_reload: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = WasmEngine::new(&config.engine).unwrap();
        let linker = crate::create_linker(&engine).unwrap();
        ModuleHost::new(&config, engine, linker)
    }

    #[tokio::test]
    async fn test_failed_loads_leave_no_slots() {
        let dir = tempfile::tempdir().unwrap();
        let host = test_host(dir.path());

        for i in 0..1000 {
            let err = host.ensure_loaded(&format!("ghost{i}")).await.unwrap_err();
            assert!(matches!(err, HostError::ModuleFileMissing { .. }));
        }
        assert!(host.slots.is_empty());

        std::fs::write(dir.path().join("junk.wasm"), b"\0asm junk").unwrap();
        assert!(host.load("junk").await.is_err());
        assert!(host.slots.is_empty());

        let bytes = wat::parse_str(r#"(module (func (export "ping")))"#).unwrap();
        std::fs::write(dir.path().join("ok.wasm"), bytes).unwrap();
        host.load("ok").await.unwrap();
        assert_eq!(host.slots.len(), 1);

        // A failed reload keeps the slot of a module that is still serving.
        std::fs::write(dir.path().join("ok.wasm"), b"\0asm junk").unwrap();
        assert!(host.load("ok").await.is_err());
        assert!(host.is_loaded("ok"));
        assert_eq!(host.slots.len(), 1);

        host.unload("ok").await;
        assert!(host.slots.is_empty());

        let stats = host.stats();
        assert_eq!(stats.total_loads, 1);
        assert_eq!(stats.failed_loads, 1002);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/srv/functions/../secret/./x.wasm")),
            PathBuf::from("/srv/secret/x.wasm")
        );
        assert!(normalize(Path::new("relative.wasm")).is_absolute());
    }
}
