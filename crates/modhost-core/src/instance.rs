//! Execution contexts and the calling convention.
//!
//! A [`GuestInstance`] is one instantiated copy of a guest module. Its
//! Wasmtime store is not reentrant, so it lives behind an async mutex and
//! every invocation holds that lock for its whole duration. Usage counters
//! and the health flag are atomics so the health monitor and info snapshots
//! can read them without waiting for a running call.
//!
//! [`InstanceRunner`] creates instances and drives both invocation modes:
//!
//! 1. **Entry point** (`_start`, alias `main`): the compiled module is
//!    instantiated again into a fresh store that replaces the old one, and
//!    the WASI command entry point runs with a caller-supplied environment.
//! 2. **Named function**: buffer-convention exports receive their arguments
//!    as JSON staged in guest memory; plain numeric exports are called
//!    directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use wasmtime::{Func, Instance, Linker, Store, Trap, Val};

use crate::CompiledModule;
use crate::WasmEngine;
use crate::abi::{self, ALLOCATE_EXPORT, DEALLOCATE_EXPORT, MEMORY_EXPORT};
use crate::module::ENTRY_POINT;
use crate::store::{CapturedOutput, GuestContext, create_store, fuel_consumed, refuel};
use modhost_common::{ExecutionConfig, HostError};

/// Alias accepted for the entry point.
pub const MAIN_ALIAS: &str = "main";

/// Returns `true` if `function` names the entry point.
pub fn is_entry_point(function: &str) -> bool {
    function == ENTRY_POINT || function == MAIN_ALIAS
}

/// Health of one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Health {
    /// Last call succeeded, or no call has failed yet.
    Healthy = 0,
    /// Last call failed or was abandoned mid-flight.
    Unhealthy = 1,
    /// The owning pool was released. Terminal.
    Retired = 2,
}

impl Health {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Healthy,
            1 => Self::Unhealthy,
            _ => Self::Retired,
        }
    }
}

struct ExecutionContext {
    store: Store<GuestContext>,
    instance: Instance,
    module: CompiledModule,
}

/// One instantiated copy of a guest module.
pub struct GuestInstance {
    id: usize,
    created_at: SystemTime,
    usage: AtomicU64,
    /// Milliseconds since the Unix epoch.
    last_used: AtomicU64,
    health: AtomicU8,
    exec: Mutex<ExecutionContext>,
}

impl GuestInstance {
    /// Position of this instance in its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Number of invocations started on this instance.
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    /// When the last invocation started.
    pub fn last_used(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.last_used.load(Ordering::Relaxed))
    }

    pub fn health(&self) -> Health {
        Health::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Returns `true` if healthy and used within `window` of `now`.
    pub fn is_fresh(&self, now: SystemTime, window: Duration) -> bool {
        self.health() == Health::Healthy
            && now
                .duration_since(self.last_used())
                .map_or(true, |idle| idle <= window)
    }

    /// Set the health flag. A retired instance stays retired.
    pub fn set_health(&self, health: Health) {
        let _ = self
            .health
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != Health::Retired as u8).then_some(health as u8)
            });
    }

    pub(crate) fn retire(&self) {
        self.health.store(Health::Retired as u8, Ordering::Release);
    }

    /// Returns `true` if an invocation currently holds the execution lock.
    pub fn is_busy(&self) -> bool {
        self.exec.try_lock().is_err()
    }

    fn touch(&self) {
        self.usage.fetch_add(1, Ordering::Relaxed);
        self.last_used.store(unix_millis(SystemTime::now()), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("id", &self.id)
            .field("usage", &self.usage())
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Marks the instance unhealthy if the invocation future is dropped early.
struct InFlight<'a> {
    instance: &'a GuestInstance,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(instance = self.instance.id, "Invocation abandoned, marking instance unhealthy");
            self.instance.set_health(Health::Unhealthy);
        }
    }
}

/// Outcome of one invocation.
#[derive(Debug)]
pub struct Invocation {
    /// Return values, or `None` for entry-point runs.
    pub result: Result<Option<Vec<Value>>, HostError>,
    pub output: CapturedOutput,
    pub fuel_consumed: u64,
    pub duration: Duration,
}

/// Create a linker for `engine` with WASI preview1 registered.
///
/// Host-function bridges are added on top of this before it is handed to
/// the host.
pub fn create_linker(engine: &WasmEngine) -> Result<Linker<GuestContext>, HostError> {
    let mut linker: Linker<GuestContext> = Linker::new(engine.inner());
    wasmtime_wasi::preview1::add_to_linker_async(&mut linker, |cx| &mut cx.wasi)
        .map_err(|e| HostError::invalid_config(format!("Failed to register WASI: {e}")))?;
    Ok(linker)
}

/// Creates execution contexts and runs invocations on them.
pub struct InstanceRunner {
    engine: WasmEngine,
    linker: Arc<Linker<GuestContext>>,
    execution: ExecutionConfig,
}

impl InstanceRunner {
    pub fn new(
        engine: WasmEngine,
        linker: Arc<Linker<GuestContext>>,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            engine,
            linker,
            execution,
        }
    }

    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Instantiate `module` into a new execution context.
    pub async fn instantiate(
        &self,
        module: &CompiledModule,
        name: Arc<str>,
        id: usize,
    ) -> Result<GuestInstance, HostError> {
        let mut store = create_store(&self.engine, &self.execution, name)?;
        let instance = self
            .linker
            .instantiate_async(&mut store, module.inner())
            .await
            .map_err(|e| HostError::instantiation_failed(format!("{e:#}")))?;

        let now = SystemTime::now();
        Ok(GuestInstance {
            id,
            created_at: now,
            usage: AtomicU64::new(0),
            last_used: AtomicU64::new(unix_millis(now)),
            health: AtomicU8::new(Health::Healthy as u8),
            exec: Mutex::new(ExecutionContext {
                store,
                instance,
                module: module.clone(),
            }),
        })
    }

    /// Run `function` on `instance` under its execution lock.
    ///
    /// Entry-point names re-instantiate the module with `env` as its WASI
    /// environment; any other name is a named-function call with `args`.
    #[instrument(skip(self, instance, args, env), fields(instance = instance.id))]
    pub async fn invoke(
        &self,
        instance: &GuestInstance,
        function: &str,
        args: &[Value],
        env: &[(String, String)],
    ) -> Invocation {
        let mut exec = instance.exec.lock().await;
        let mut guard = InFlight {
            instance,
            finished: false,
        };

        instance.touch();
        let start = Instant::now();
        let initial_fuel = self.execution.fuel_per_call();

        let (result, output, consumed) = if is_entry_point(function) {
            match self.run_entry_point(&mut exec, env).await {
                Ok((result, output, consumed)) => (result.map(|()| None), output, consumed),
                Err(e) => (Err(e), CapturedOutput::default(), 0),
            }
        } else {
            let result = match refuel(&mut exec.store, &self.execution) {
                Ok(()) => {
                    exec.store.data_mut().reset_io(env);
                    call_named(&mut exec, function, args).await.map(Some)
                }
                Err(e) => Err(e),
            };
            let output = exec.store.data().take_output();
            (result, output, fuel_consumed(initial_fuel, &exec.store))
        };

        guard.finished = true;
        instance.set_health(if result.is_ok() {
            Health::Healthy
        } else {
            Health::Unhealthy
        });

        let duration = start.elapsed();
        debug!(
            function,
            duration_ms = duration.as_millis(),
            fuel_consumed = consumed,
            success = result.is_ok(),
            "Invocation finished"
        );

        Invocation {
            result,
            output,
            fuel_consumed: consumed,
            duration,
        }
    }

    /// Re-instantiate into a fresh store and run the command entry point.
    ///
    /// The new store replaces the old one even when the guest fails, since
    /// the guest already observed the new environment.
    async fn run_entry_point(
        &self,
        exec: &mut ExecutionContext,
        env: &[(String, String)],
    ) -> Result<(Result<(), HostError>, CapturedOutput, u64), HostError> {
        let name: Arc<str> = exec.store.data().module().into();
        let mut store = create_store(&self.engine, &self.execution, name)?;
        store.data_mut().reset_io(env);

        let initial_fuel = self.execution.fuel_per_call();
        let instance = match self.linker.instantiate_async(&mut store, exec.module.inner()).await {
            Ok(instance) => instance,
            Err(e) => {
                let output = store.data().take_output();
                let consumed = fuel_consumed(initial_fuel, &store);
                return Ok((Err(classify_error(&e)), output, consumed));
            }
        };

        let result = match instance.get_typed_func::<(), ()>(&mut store, ENTRY_POINT) {
            Ok(start) => start
                .call_async(&mut store, ())
                .await
                .or_else(|e| exit_status(&e).map_or_else(|| Err(classify_error(&e)), Ok)),
            // Instantiation already ran the start section.
            Err(_) => Ok(()),
        };

        let output = store.data().take_output();
        let consumed = fuel_consumed(initial_fuel, &store);

        exec.store = store;
        exec.instance = instance;

        Ok((result, output, consumed))
    }
}

impl std::fmt::Debug for InstanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRunner")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

async fn call_named(
    exec: &mut ExecutionContext,
    function: &str,
    args: &[Value],
) -> Result<Vec<Value>, HostError> {
    let ExecutionContext {
        store, instance, ..
    } = exec;

    let module_name = store.data().module().to_string();
    let func = instance
        .get_func(&mut *store, function)
        .ok_or_else(|| HostError::function_not_found(&module_name, function))?;
    let ty = func.ty(&*store);

    if abi::is_buffer_signature(&ty) {
        return call_buffered(store, instance, func, function, args).await;
    }

    let params: Vec<_> = ty.params().collect();
    if params.len() != args.len() {
        return Err(HostError::invalid_arguments(
            function,
            format!("expected {} arguments, got {}", params.len(), args.len()),
        ));
    }

    let params = args
        .iter()
        .zip(&params)
        .enumerate()
        .map(|(i, (arg, ty))| {
            abi::json_to_val(arg, ty).ok_or_else(|| {
                HostError::invalid_arguments(function, format!("argument {i} is not a valid {ty}"))
            })
        })
        .collect::<Result<Vec<Val>, _>>()?;

    let mut results = vec![Val::I32(0); ty.results().len()];
    func.call_async(&mut *store, &params, &mut results)
        .await
        .map_err(|e| classify_error(&e))?;

    Ok(results.iter().map(abi::val_to_json).collect())
}

async fn call_buffered(
    store: &mut Store<GuestContext>,
    instance: &Instance,
    func: Func,
    function: &str,
    args: &[Value],
) -> Result<Vec<Value>, HostError> {
    let memory = instance
        .get_memory(&mut *store, MEMORY_EXPORT)
        .ok_or_else(|| HostError::abi("module does not export linear memory"))?;
    let allocate = instance
        .get_typed_func::<i32, i32>(&mut *store, ALLOCATE_EXPORT)
        .map_err(|_| HostError::abi("module does not export allocate(i32) -> i32"))?;
    let deallocate = instance
        .get_typed_func::<(i32, i32), ()>(&mut *store, DEALLOCATE_EXPORT)
        .map_err(|_| HostError::abi("module does not export deallocate(i32, i32)"))?;
    let typed = func
        .typed::<(i32, i32), i64>(&*store)
        .map_err(|e| HostError::abi(e.to_string()))?;

    let payload = serde_json::to_vec(args)
        .map_err(|e| HostError::invalid_arguments(function, e.to_string()))?;
    let in_len = i32::try_from(payload.len())
        .map_err(|_| HostError::invalid_arguments(function, "arguments too large"))?;

    let in_ptr = allocate
        .call_async(&mut *store, in_len)
        .await
        .map_err(|e| classify_error(&e))?;
    abi::write_bytes(&mut *store, &memory, in_ptr, &payload)
        .map_err(|e| HostError::abi(format!("staging arguments: {e}")))?;

    let packed = typed
        .call_async(&mut *store, (in_ptr, in_len))
        .await
        .map_err(|e| classify_error(&e))?;
    deallocate
        .call_async(&mut *store, (in_ptr, in_len))
        .await
        .map_err(|e| classify_error(&e))?;

    let (out_ptr, out_len) = abi::unpack(packed);
    if out_len == 0 {
        return Ok(Vec::new());
    }
    let (Ok(out_ptr), Ok(out_len)) = (i32::try_from(out_ptr), i32::try_from(out_len)) else {
        return Err(HostError::abi(format!("result buffer {packed:#x} out of range")));
    };

    let bytes = abi::read_bytes(&*store, &memory, out_ptr, out_len)
        .map_err(|e| HostError::abi(format!("reading result: {e}")))?;
    deallocate
        .call_async(&mut *store, (out_ptr, out_len))
        .await
        .map_err(|e| classify_error(&e))?;

    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| HostError::abi(format!("result is not JSON: {e}")))?;
    Ok(abi::into_result_list(value))
}

/// `Some(())` if the guest called `proc_exit(0)`.
fn exit_status(error: &wasmtime::Error) -> Option<()> {
    error
        .downcast_ref::<wasmtime_wasi::I32Exit>()
        .and_then(|exit| (exit.0 == 0).then_some(()))
}

/// Map a Wasmtime execution error onto the host taxonomy.
fn classify_error(error: &wasmtime::Error) -> HostError {
    if error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
    {
        return HostError::FuelExhausted;
    }

    if let Some(exit) = error.downcast_ref::<wasmtime_wasi::I32Exit>() {
        return HostError::trap(format!("guest exited with status {}", exit.0));
    }

    HostError::trap(format!("{error:#}"))
}
