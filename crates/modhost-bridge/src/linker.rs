//! Host function registration for guest linkers.
//!
//! Two import modules are exposed to guests:
//!
//! | import            | signature                                   | returns                 |
//! |-------------------|---------------------------------------------|-------------------------|
//! | `kv::get`         | `(key_ptr, key_len, out_ptr, out_cap)`      | bytes written           |
//! | `kv::set`         | `(key_ptr, key_len, val_ptr, val_len)`      | `0`                     |
//! | `kv::set_ex`      | `(key_ptr, key_len, val_ptr, val_len, ttl: i64)` | `0`                |
//! | `kv::exists`      | `(key_ptr, key_len)`                        | `1` or `0`              |
//! | `kv::del`         | `(key_ptr, key_len)`                        | keys removed            |
//! | `sql::execute`    | `(sql_ptr, sql_len)`                        | rows affected           |
//! | `sql::query`      | `(sql_ptr, sql_len, out_ptr, out_cap)`      | JSON bytes written      |
//!
//! All arguments are `i32` except the TTL. Every function returns an `i32`
//! which is a [`Status`] code when negative. Functions are registered even
//! when their backend is disabled, so guests link and get `Unavailable`.

use modhost_common::{BridgeError, BridgesConfig, HostError};
use modhost_core::GuestContext;
use modhost_core::abi::{caller_memory, read_bytes, write_bytes};
use tracing::{debug, warn};
use wasmtime::{Caller, Linker};

use crate::kv::KvBridge;
use crate::sql::SqlBridge;
use crate::status::{Status, count};

/// Import module name of the key-value bridge.
pub const KV_MODULE: &str = "kv";
/// Import module name of the SQL bridge.
pub const SQL_MODULE: &str = "sql";

/// Every bridge a host exposes to its guests.
#[derive(Debug, Clone, Default)]
pub struct Bridges {
    pub kv: KvBridge,
    pub sql: SqlBridge,
}

impl Bridges {
    /// Connect each configured backend. Unconfigured or unreachable
    /// backends stay disabled.
    pub async fn connect(config: &BridgesConfig) -> Self {
        Self {
            kv: KvBridge::connect(&config.kv).await,
            sql: SqlBridge::connect(&config.sql).await,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }
}

/// Register all bridge host functions on `linker`.
///
/// # Errors
///
/// Returns an error if a name is already defined on the linker.
pub fn register_all(linker: &mut Linker<GuestContext>, bridges: &Bridges) -> Result<(), HostError> {
    register_kv(linker, &bridges.kv)?;
    register_sql(linker, &bridges.sql)?;
    Ok(())
}

fn registration_error(module: &'static str, name: &'static str) -> impl Fn(wasmtime::Error) -> HostError {
    move |e| HostError::invalid_config(format!("Failed to register {module}::{name}: {e}"))
}

/// Register the `kv` import module.
pub fn register_kv(linker: &mut Linker<GuestContext>, kv: &KvBridge) -> Result<(), HostError> {
    let bridge = kv.clone();
    linker
        .func_wrap_async(
            KV_MODULE,
            "get",
            move |mut caller: Caller<'_, GuestContext>,
                  (key_ptr, key_len, out_ptr, out_cap): (i32, i32, i32, i32)| {
                let bridge = bridge.clone();
                Box::new(async move {
                    let code = kv_get(&mut caller, &bridge, key_ptr, key_len, out_ptr, out_cap).await;
                    Ok::<i32, wasmtime::Error>(status(code))
                })
            },
        )
        .map_err(registration_error(KV_MODULE, "get"))?;

    let bridge = kv.clone();
    linker
        .func_wrap_async(
            KV_MODULE,
            "set",
            move |mut caller: Caller<'_, GuestContext>,
                  (key_ptr, key_len, val_ptr, val_len): (i32, i32, i32, i32)| {
                let bridge = bridge.clone();
                Box::new(async move {
                    let code =
                        kv_set(&mut caller, &bridge, key_ptr, key_len, val_ptr, val_len, None).await;
                    Ok::<i32, wasmtime::Error>(status(code))
                })
            },
        )
        .map_err(registration_error(KV_MODULE, "set"))?;

    let bridge = kv.clone();
    linker
        .func_wrap_async(
            KV_MODULE,
            "set_ex",
            move |mut caller: Caller<'_, GuestContext>,
                  (key_ptr, key_len, val_ptr, val_len, ttl): (i32, i32, i32, i32, i64)| {
                let bridge = bridge.clone();
                Box::new(async move {
                    let code = kv_set(
                        &mut caller,
                        &bridge,
                        key_ptr,
                        key_len,
                        val_ptr,
                        val_len,
                        Some(ttl),
                    )
                    .await;
                    Ok::<i32, wasmtime::Error>(status(code))
                })
            },
        )
        .map_err(registration_error(KV_MODULE, "set_ex"))?;

    let bridge = kv.clone();
    linker
        .func_wrap_async(
            KV_MODULE,
            "exists",
            move |mut caller: Caller<'_, GuestContext>, (key_ptr, key_len): (i32, i32)| {
                let bridge = bridge.clone();
                Box::new(async move {
                    let code = kv_exists(&mut caller, &bridge, key_ptr, key_len).await;
                    Ok::<i32, wasmtime::Error>(status(code))
                })
            },
        )
        .map_err(registration_error(KV_MODULE, "exists"))?;

    let bridge = kv.clone();
    linker
        .func_wrap_async(
            KV_MODULE,
            "del",
            move |mut caller: Caller<'_, GuestContext>, (key_ptr, key_len): (i32, i32)| {
                let bridge = bridge.clone();
                Box::new(async move {
                    let code = kv_del(&mut caller, &bridge, key_ptr, key_len).await;
                    Ok::<i32, wasmtime::Error>(status(code))
                })
            },
        )
        .map_err(registration_error(KV_MODULE, "del"))?;

    Ok(())
}

/// Register the `sql` import module.
pub fn register_sql(linker: &mut Linker<GuestContext>, sql: &SqlBridge) -> Result<(), HostError> {
    let bridge = sql.clone();
    linker
        .func_wrap_async(
            SQL_MODULE,
            "execute",
            move |mut caller: Caller<'_, GuestContext>, (sql_ptr, sql_len): (i32, i32)| {
                let bridge = bridge.clone();
                Box::new(async move {
                    let code = sql_execute(&mut caller, &bridge, sql_ptr, sql_len).await;
                    Ok::<i32, wasmtime::Error>(status(code))
                })
            },
        )
        .map_err(registration_error(SQL_MODULE, "execute"))?;

    let bridge = sql.clone();
    linker
        .func_wrap_async(
            SQL_MODULE,
            "query",
            move |mut caller: Caller<'_, GuestContext>,
                  (sql_ptr, sql_len, out_ptr, out_cap): (i32, i32, i32, i32)| {
                let bridge = bridge.clone();
                Box::new(async move {
                    let code =
                        sql_query(&mut caller, &bridge, sql_ptr, sql_len, out_ptr, out_cap).await;
                    Ok::<i32, wasmtime::Error>(status(code))
                })
            },
        )
        .map_err(registration_error(SQL_MODULE, "query"))?;

    Ok(())
}

fn status(result: Result<i32, Status>) -> i32 {
    result.unwrap_or_else(Status::code)
}

/// Log a failed backend request and map it to a guest status.
fn backend_failure(op: &'static str, module: &str, error: &BridgeError) -> Status {
    match error {
        BridgeError::InvalidArgument { .. } => {
            debug!(op, module, error = %error, "Bridge rejected input");
            Status::InvalidInput
        }
        BridgeError::Disabled { .. } => Status::Unavailable,
        BridgeError::Backend { .. } => {
            warn!(op, module, error = %error, "Bridge backend failed");
            Status::Unavailable
        }
    }
}

fn read_guest(caller: &mut Caller<'_, GuestContext>, ptr: i32, len: i32) -> Result<Vec<u8>, Status> {
    let memory = caller_memory(caller).map_err(|_| Status::InvalidInput)?;
    read_bytes(&*caller, &memory, ptr, len).map_err(|_| Status::InvalidInput)
}

fn read_guest_str(
    caller: &mut Caller<'_, GuestContext>,
    ptr: i32,
    len: i32,
) -> Result<String, Status> {
    String::from_utf8(read_guest(caller, ptr, len)?).map_err(|_| Status::InvalidInput)
}

/// Copy `data` into the guest's output buffer, returning its length.
fn write_guest(
    caller: &mut Caller<'_, GuestContext>,
    out_ptr: i32,
    out_cap: i32,
    data: &[u8],
) -> Result<i32, Status> {
    let cap = usize::try_from(out_cap).map_err(|_| Status::InvalidInput)?;
    if data.len() > cap {
        return Err(Status::BufferTooSmall);
    }
    let memory = caller_memory(caller).map_err(|_| Status::InvalidInput)?;
    write_bytes(&mut *caller, &memory, out_ptr, data).map_err(|_| Status::InvalidInput)?;
    Ok(count(data.len() as u64))
}

async fn kv_get(
    caller: &mut Caller<'_, GuestContext>,
    bridge: &KvBridge,
    key_ptr: i32,
    key_len: i32,
    out_ptr: i32,
    out_cap: i32,
) -> Result<i32, Status> {
    let backend = bridge.backend().map_err(|_| Status::Unavailable)?.clone();
    if out_cap < 0 {
        return Err(Status::InvalidInput);
    }
    let key = read_guest_str(caller, key_ptr, key_len)?;

    let value = backend
        .get(&key)
        .await
        .map_err(|e| backend_failure("kv.get", caller.data().module(), &e))?
        .ok_or(Status::NotFound)?;

    write_guest(caller, out_ptr, out_cap, &value)
}

async fn kv_set(
    caller: &mut Caller<'_, GuestContext>,
    bridge: &KvBridge,
    key_ptr: i32,
    key_len: i32,
    val_ptr: i32,
    val_len: i32,
    ttl: Option<i64>,
) -> Result<i32, Status> {
    let backend = bridge.backend().map_err(|_| Status::Unavailable)?.clone();
    let key = read_guest_str(caller, key_ptr, key_len)?;
    let value = read_guest(caller, val_ptr, val_len)?;

    let result = match ttl {
        None => backend.set(&key, value).await,
        Some(ttl) => {
            let ttl = u64::try_from(ttl)
                .ok()
                .filter(|t| *t > 0)
                .ok_or(Status::InvalidInput)?;
            backend.set_ex(&key, value, ttl).await
        }
    };

    result.map_err(|e| backend_failure("kv.set", caller.data().module(), &e))?;
    Ok(0)
}

async fn kv_exists(
    caller: &mut Caller<'_, GuestContext>,
    bridge: &KvBridge,
    key_ptr: i32,
    key_len: i32,
) -> Result<i32, Status> {
    let backend = bridge.backend().map_err(|_| Status::Unavailable)?.clone();
    let key = read_guest_str(caller, key_ptr, key_len)?;

    let exists = backend
        .exists(&key)
        .await
        .map_err(|e| backend_failure("kv.exists", caller.data().module(), &e))?;
    Ok(i32::from(exists))
}

async fn kv_del(
    caller: &mut Caller<'_, GuestContext>,
    bridge: &KvBridge,
    key_ptr: i32,
    key_len: i32,
) -> Result<i32, Status> {
    let backend = bridge.backend().map_err(|_| Status::Unavailable)?.clone();
    let key = read_guest_str(caller, key_ptr, key_len)?;

    let removed = backend
        .del(&key)
        .await
        .map_err(|e| backend_failure("kv.del", caller.data().module(), &e))?;
    Ok(count(removed))
}

async fn sql_execute(
    caller: &mut Caller<'_, GuestContext>,
    bridge: &SqlBridge,
    sql_ptr: i32,
    sql_len: i32,
) -> Result<i32, Status> {
    let backend = bridge.backend().map_err(|_| Status::Unavailable)?.clone();
    let statement = read_guest_str(caller, sql_ptr, sql_len)?;

    let affected = backend
        .execute(&statement)
        .await
        .map_err(|e| backend_failure("sql.execute", caller.data().module(), &e))?;
    Ok(count(affected))
}

async fn sql_query(
    caller: &mut Caller<'_, GuestContext>,
    bridge: &SqlBridge,
    sql_ptr: i32,
    sql_len: i32,
    out_ptr: i32,
    out_cap: i32,
) -> Result<i32, Status> {
    let backend = bridge.backend().map_err(|_| Status::Unavailable)?.clone();
    if out_cap < 0 {
        return Err(Status::InvalidInput);
    }
    let statement = read_guest_str(caller, sql_ptr, sql_len)?;

    let rows = backend
        .query(&statement)
        .await
        .map_err(|e| backend_failure("sql.query", caller.data().module(), &e))?;
    let json = serde_json::to_vec(&rows).map_err(|_| Status::Unavailable)?;

    write_guest(caller, out_ptr, out_cap, &json)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use modhost_common::{EngineConfig, ExecutionConfig};
    use modhost_core::{CompiledModule, GuestInstance, InstanceRunner, WasmEngine, create_linker};
    use serde_json::{Value, json};
    use tokio::sync::Mutex;

    use super::*;
    use crate::kv::KvBackend;
    use crate::sql::SqlBackend;

    #[derive(Default)]
    struct MemoryKv {
        entries: Mutex<HashMap<String, (Vec<u8>, Option<u64>)>>,
    }

    #[async_trait]
    impl KvBackend for MemoryKv {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BridgeError> {
            Ok(self.entries.lock().await.get(key).map(|(v, _)| v.clone()))
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BridgeError> {
            self.entries.lock().await.insert(key.to_string(), (value, None));
            Ok(())
        }

        async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: u64) -> Result<(), BridgeError> {
            self.entries
                .lock()
                .await
                .insert(key.to_string(), (value, Some(ttl)));
            Ok(())
        }

        async fn exists(&self, key: &str) -> Result<bool, BridgeError> {
            Ok(self.entries.lock().await.contains_key(key))
        }

        async fn del(&self, key: &str) -> Result<u64, BridgeError> {
            Ok(u64::from(self.entries.lock().await.remove(key).is_some()))
        }
    }

    struct FakeSql {
        fail: bool,
    }

    #[async_trait]
    impl SqlBackend for FakeSql {
        async fn execute(&self, statement: &str) -> Result<u64, BridgeError> {
            if self.fail {
                return Err(BridgeError::backend("sql", "connection refused"));
            }
            assert_eq!(statement, "DELETE FROM t");
            Ok(3)
        }

        async fn query(&self, statement: &str) -> Result<Value, BridgeError> {
            if self.fail {
                return Err(BridgeError::backend("sql", "connection refused"));
            }
            match statement {
                "SELECT 1" => Ok(json!([{"n": 1}])),
                "SELECT * FROM empty" => Ok(json!([])),
                other => panic!("unexpected query {other:?}"),
            }
        }
    }

    const KV_GUEST: &str = r#"
        (module
          (import "kv" "get" (func $get (param i32 i32 i32 i32) (result i32)))
          (import "kv" "set" (func $set (param i32 i32 i32 i32) (result i32)))
          (import "kv" "set_ex" (func $set_ex (param i32 i32 i32 i32 i64) (result i32)))
          (import "kv" "exists" (func $exists (param i32 i32) (result i32)))
          (import "kv" "del" (func $del (param i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "greeting")
          (data (i32.const 16) "hello")
          (data (i32.const 32) "\ff\fe")
          (func (export "set") (result i32)
            (call $set (i32.const 0) (i32.const 8) (i32.const 16) (i32.const 5)))
          (func (export "set_ex") (param i64) (result i32)
            (call $set_ex (i32.const 0) (i32.const 8) (i32.const 16) (i32.const 5) (local.get 0)))
          (func (export "get") (param i32) (result i32)
            (call $get (i32.const 0) (i32.const 8) (i32.const 64) (local.get 0)))
          (func (export "exists") (result i32)
            (call $exists (i32.const 0) (i32.const 8)))
          (func (export "del") (result i32)
            (call $del (i32.const 0) (i32.const 8)))
          (func (export "exists_non_utf8") (result i32)
            (call $exists (i32.const 32) (i32.const 2)))
          (func (export "exists_out_of_bounds") (result i32)
            (call $exists (i32.const 65530) (i32.const 100)))
          (func (export "exists_negative") (result i32)
            (call $exists (i32.const -1) (i32.const 8)))
          (func (export "byte_at") (param i32) (result i32)
            (i32.load8_u (local.get 0))))
    "#;

    const SQL_GUEST: &str = r#"
        (module
          (import "sql" "execute" (func $execute (param i32 i32) (result i32)))
          (import "sql" "query" (func $query (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "DELETE FROM t")
          (data (i32.const 32) "SELECT 1")
          (data (i32.const 64) "SELECT * FROM empty")
          (func (export "execute") (result i32)
            (call $execute (i32.const 0) (i32.const 13)))
          (func (export "query") (param i32) (result i32)
            (call $query (i32.const 32) (i32.const 8) (i32.const 256) (local.get 0)))
          (func (export "query_empty") (param i32) (result i32)
            (call $query (i32.const 64) (i32.const 19) (i32.const 256) (local.get 0)))
          (func (export "byte_at") (param i32) (result i32)
            (i32.load8_u (local.get 0))))
    "#;

    async fn guest(wat: &str, bridges: &Bridges) -> (InstanceRunner, GuestInstance) {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..EngineConfig::default()
        })
        .unwrap();
        let mut linker = create_linker(&engine).unwrap();
        register_all(&mut linker, bridges).unwrap();

        let bytes = wat::parse_str(wat).unwrap();
        let module = CompiledModule::from_bytes(engine.inner(), &bytes).unwrap();
        let runner = InstanceRunner::new(engine, Arc::new(linker), ExecutionConfig::default());
        let instance = runner.instantiate(&module, "guest".into(), 0).await.unwrap();
        (runner, instance)
    }

    async fn call(runner: &InstanceRunner, instance: &GuestInstance, function: &str, args: &[Value]) -> Value {
        let invocation = runner.invoke(instance, function, args, &[]).await;
        let mut results = invocation.result.unwrap().unwrap();
        assert_eq!(results.len(), 1);
        results.remove(0)
    }

    async fn read(runner: &InstanceRunner, instance: &GuestInstance, at: usize, len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(len);
        for addr in at..at + len {
            let byte = call(runner, instance, "byte_at", &[json!(addr)]).await;
            bytes.push(u8::try_from(byte.as_u64().unwrap()).unwrap());
        }
        bytes
    }

    #[test]
    fn test_register_all_disabled() {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..EngineConfig::default()
        })
        .unwrap();
        let mut linker = create_linker(&engine).unwrap();

        assert!(register_all(&mut linker, &Bridges::disabled()).is_ok());
        // A second registration collides with the first.
        assert!(register_kv(&mut linker, &KvBridge::disabled()).is_err());
    }

    #[tokio::test]
    async fn test_kv_round_trip() {
        let backend = Arc::new(MemoryKv::default());
        let bridges = Bridges {
            kv: KvBridge::new(backend.clone()),
            sql: SqlBridge::disabled(),
        };
        let (runner, instance) = guest(KV_GUEST, &bridges).await;

        assert_eq!(call(&runner, &instance, "get", &[json!(64)]).await, json!(-1));
        assert_eq!(call(&runner, &instance, "exists", &[]).await, json!(0));

        assert_eq!(call(&runner, &instance, "set", &[]).await, json!(0));
        assert_eq!(call(&runner, &instance, "exists", &[]).await, json!(1));
        assert_eq!(call(&runner, &instance, "get", &[json!(64)]).await, json!(5));
        assert_eq!(read(&runner, &instance, 64, 5).await, b"hello");

        // Exactly fitting buffer succeeds, one byte short does not.
        assert_eq!(call(&runner, &instance, "get", &[json!(5)]).await, json!(5));
        assert_eq!(call(&runner, &instance, "get", &[json!(4)]).await, json!(-2));
        assert_eq!(call(&runner, &instance, "get", &[json!(-1)]).await, json!(-3));

        assert_eq!(call(&runner, &instance, "del", &[]).await, json!(1));
        assert_eq!(call(&runner, &instance, "del", &[]).await, json!(0));
    }

    #[tokio::test]
    async fn test_kv_set_ex_ttl() {
        let backend = Arc::new(MemoryKv::default());
        let bridges = Bridges {
            kv: KvBridge::new(backend.clone()),
            sql: SqlBridge::disabled(),
        };
        let (runner, instance) = guest(KV_GUEST, &bridges).await;

        assert_eq!(call(&runner, &instance, "set_ex", &[json!(30)]).await, json!(0));
        assert_eq!(
            backend.entries.lock().await.get("greeting").cloned(),
            Some((b"hello".to_vec(), Some(30)))
        );

        assert_eq!(call(&runner, &instance, "set_ex", &[json!(0)]).await, json!(-3));
        assert_eq!(call(&runner, &instance, "set_ex", &[json!(-5)]).await, json!(-3));
    }

    #[tokio::test]
    async fn test_kv_invalid_input() {
        let bridges = Bridges {
            kv: KvBridge::new(Arc::new(MemoryKv::default())),
            sql: SqlBridge::disabled(),
        };
        let (runner, instance) = guest(KV_GUEST, &bridges).await;

        assert_eq!(call(&runner, &instance, "exists_non_utf8", &[]).await, json!(-3));
        assert_eq!(call(&runner, &instance, "exists_out_of_bounds", &[]).await, json!(-3));
        assert_eq!(call(&runner, &instance, "exists_negative", &[]).await, json!(-3));
    }

    #[tokio::test]
    async fn test_disabled_bridges_report_unavailable() {
        let (runner, instance) = guest(KV_GUEST, &Bridges::disabled()).await;
        assert_eq!(call(&runner, &instance, "get", &[json!(64)]).await, json!(-4));
        assert_eq!(call(&runner, &instance, "set", &[]).await, json!(-4));
        // Disabled wins over malformed input.
        assert_eq!(call(&runner, &instance, "exists_negative", &[]).await, json!(-4));

        let (runner, instance) = guest(SQL_GUEST, &Bridges::disabled()).await;
        assert_eq!(call(&runner, &instance, "execute", &[]).await, json!(-4));
        assert_eq!(call(&runner, &instance, "query", &[json!(64)]).await, json!(-4));
    }

    #[tokio::test]
    async fn test_sql_execute_and_query() {
        let bridges = Bridges {
            kv: KvBridge::disabled(),
            sql: SqlBridge::new(Arc::new(FakeSql { fail: false })),
        };
        let (runner, instance) = guest(SQL_GUEST, &bridges).await;

        assert_eq!(call(&runner, &instance, "execute", &[]).await, json!(3));

        let expected = br#"[{"n":1}]"#;
        assert_eq!(
            call(&runner, &instance, "query", &[json!(64)]).await,
            json!(expected.len())
        );
        assert_eq!(read(&runner, &instance, 256, expected.len()).await, expected);

        assert_eq!(call(&runner, &instance, "query", &[json!(4)]).await, json!(-2));
    }

    #[tokio::test]
    async fn test_sql_query_no_rows() {
        let bridges = Bridges {
            kv: KvBridge::disabled(),
            sql: SqlBridge::new(Arc::new(FakeSql { fail: false })),
        };
        let (runner, instance) = guest(SQL_GUEST, &bridges).await;

        // No rows is still a result: the two bytes of `[]`.
        assert_eq!(
            call(&runner, &instance, "query_empty", &[json!(64)]).await,
            json!(2)
        );
        assert_eq!(read(&runner, &instance, 256, 2).await, b"[]");
    }

    #[tokio::test]
    async fn test_sql_backend_failure() {
        let bridges = Bridges {
            kv: KvBridge::disabled(),
            sql: SqlBridge::new(Arc::new(FakeSql { fail: true })),
        };
        let (runner, instance) = guest(SQL_GUEST, &bridges).await;

        assert_eq!(call(&runner, &instance, "execute", &[]).await, json!(-4));
        assert_eq!(call(&runner, &instance, "query", &[json!(64)]).await, json!(-4));
        // A failing backend is a guest-visible status, not a trap.
        assert_eq!(instance.health(), modhost_core::Health::Healthy);
    }
}
