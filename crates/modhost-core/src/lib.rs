//! Sandboxed module execution host.
//!
//! This crate loads guest WebAssembly modules into pools of pre-instantiated
//! execution contexts and keeps them current:
//! - [`WasmEngine`]: Wasmtime engine shared by every module
//! - [`CompiledModule`]: a module file compiled once per load
//! - [`InstanceRunner`] / [`GuestInstance`]: execution contexts and the calling convention
//! - [`InstancePool`]: fixed-size pool with round-robin selection
//! - [`ModuleHost`]: registry, lifecycle, reload watcher and health monitor
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      ModuleHost                         │
//! │  - per-module slot: reload mutex + pool RwLock          │
//! │  - module records, stats, callbacks                     │
//! │  - reload watcher task, health monitor task             │
//! └─────────────────────────────────────────────────────────┘
//!                            │ load / call
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    InstancePool                         │
//! │  (one per loaded module version)                        │
//! │  - max_instances GuestInstances, round-robin            │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │      GuestInstance: Mutex<Store<GuestContext>>          │
//! │  - fuel metering, captured stdout/stderr                │
//! │  - usage / last-used / health atomics                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod abi;
pub mod engine;
mod health;
pub mod host;
pub mod instance;
pub mod module;
pub mod pool;
pub mod store;
pub mod watcher;

pub use engine::WasmEngine;
pub use host::{CallResult, HostStats, ModuleHost, ModuleInfo};
pub use instance::{GuestInstance, Health, InstanceRunner, create_linker};
pub use module::CompiledModule;
pub use pool::InstancePool;
pub use store::{CapturedOutput, GuestContext};
pub use watcher::WatchTarget;
