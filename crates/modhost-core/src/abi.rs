//! Pointer/length calling convention between host and guest.
//!
//! Guests exchange data with the host through their own exported linear
//! memory named `memory`. Every buffer is described by an `(i32 ptr, i32 len)`
//! pair. Buffer-convention exports return both halves packed into one `i64`
//! as `(ptr << 32) | len`.
//!
//! This module also converts JSON call arguments to and from Wasm values for
//! exports that take plain numbers.

use serde_json::{Number, Value};
use thiserror::Error;
use wasmtime::{AsContext, AsContextMut, Caller, Extern, Memory, Val, ValType};

/// Name of the guest's exported linear memory.
pub const MEMORY_EXPORT: &str = "memory";
/// Guest export that reserves a buffer: `(len: i32) -> i32`.
pub const ALLOCATE_EXPORT: &str = "allocate";
/// Guest export that releases a buffer: `(ptr: i32, len: i32)`.
pub const DEALLOCATE_EXPORT: &str = "deallocate";

/// A guest buffer that could not be accessed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("guest does not export linear memory")]
    MissingMemory,

    #[error("negative pointer or length ({ptr}, {len})")]
    Negative { ptr: i64, len: i64 },

    #[error("buffer {ptr}+{len} exceeds guest memory of {size} bytes")]
    OutOfBounds { ptr: usize, len: usize, size: usize },
}

/// Look up the calling guest's exported memory.
pub fn caller_memory<T>(caller: &mut Caller<'_, T>) -> Result<Memory, AbiError> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or(AbiError::MissingMemory)
}

fn checked_range(
    ctx: impl AsContext,
    memory: &Memory,
    ptr: i32,
    len: i32,
) -> Result<(usize, usize), AbiError> {
    let (Ok(start), Ok(len_u)) = (usize::try_from(ptr), usize::try_from(len)) else {
        return Err(AbiError::Negative {
            ptr: ptr.into(),
            len: len.into(),
        });
    };

    let size = memory.data_size(&ctx);
    match start.checked_add(len_u) {
        Some(end) if end <= size => Ok((start, len_u)),
        _ => Err(AbiError::OutOfBounds {
            ptr: start,
            len: len_u,
            size,
        }),
    }
}

/// Copy `len` bytes out of guest memory starting at `ptr`.
pub fn read_bytes(
    ctx: impl AsContext,
    memory: &Memory,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, AbiError> {
    let (start, len) = checked_range(&ctx, memory, ptr, len)?;
    Ok(memory.data(&ctx)[start..start + len].to_vec())
}

/// Copy `data` into guest memory starting at `ptr`.
pub fn write_bytes(
    mut ctx: impl AsContextMut,
    memory: &Memory,
    ptr: i32,
    data: &[u8],
) -> Result<(), AbiError> {
    let len = i32::try_from(data.len()).map_err(|_| AbiError::OutOfBounds {
        ptr: usize::try_from(ptr).unwrap_or_default(),
        len: data.len(),
        size: memory.data_size(&ctx),
    })?;
    let (start, len) = checked_range(&ctx, memory, ptr, len)?;
    memory.data_mut(&mut ctx)[start..start + len].copy_from_slice(data);
    Ok(())
}

/// Pack a guest buffer into the `i64` return value of a buffer-convention export.
#[allow(clippy::cast_possible_wrap)]
pub fn pack(ptr: u32, len: u32) -> i64 {
    ((u64::from(ptr) << 32) | u64::from(len)) as i64
}

/// Split a packed `i64` into `(ptr, len)`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn unpack(packed: i64) -> (u32, u32) {
    let bits = packed as u64;
    ((bits >> 32) as u32, bits as u32)
}

/// Returns `true` if a function type follows the buffer convention:
/// `(ptr: i32, len: i32) -> i64`.
pub fn is_buffer_signature(ty: &wasmtime::FuncType) -> bool {
    let params: Vec<ValType> = ty.params().collect();
    let results: Vec<ValType> = ty.results().collect();
    matches!(params.as_slice(), [ValType::I32, ValType::I32])
        && matches!(results.as_slice(), [ValType::I64])
}

/// Convert a JSON argument into a Wasm value of type `ty`.
///
/// Only numeric types are supported. Integers accept JSON integers in range,
/// floats accept any JSON number. Booleans map to `0`/`1`.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn json_to_val(value: &Value, ty: &ValType) -> Option<Val> {
    let as_i64 = || match value {
        Value::Bool(b) => Some(i64::from(*b)),
        other => other.as_i64().or_else(|| other.as_u64().map(|n| n as i64)),
    };

    match ty {
        ValType::I32 => as_i64()
            .and_then(|n| i32::try_from(n).ok().or_else(|| u32::try_from(n).ok().map(|u| u as i32)))
            .map(Val::I32),
        ValType::I64 => as_i64().map(Val::I64),
        ValType::F32 => value.as_f64().map(|f| Val::F32((f as f32).to_bits())),
        ValType::F64 => value.as_f64().map(|f| Val::F64(f.to_bits())),
        _ => None,
    }
}

/// Convert a Wasm result value into JSON. Non-numeric values become `null`.
pub fn val_to_json(val: &Val) -> Value {
    match val {
        Val::I32(n) => Value::from(*n),
        Val::I64(n) => Value::from(*n),
        Val::F32(bits) => Number::from_f64(f64::from(f32::from_bits(*bits)))
            .map_or(Value::Null, Value::Number),
        Val::F64(bits) => Number::from_f64(f64::from_bits(*bits)).map_or(Value::Null, Value::Number),
        _ => Value::Null,
    }
}

/// Turn a decoded JSON result into a result list.
pub fn into_result_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pack_unpack() {
        assert_eq!(unpack(pack(1024, 17)), (1024, 17));
        assert_eq!(unpack(pack(u32::MAX, u32::MAX)), (u32::MAX, u32::MAX));
        assert_eq!(pack(1, 2), (1_i64 << 32) | 2);
    }

    #[test]
    fn test_json_to_val_integers() {
        assert!(matches!(json_to_val(&json!(7), &ValType::I32), Some(Val::I32(7))));
        assert!(matches!(json_to_val(&json!(-7), &ValType::I64), Some(Val::I64(-7))));
        assert!(matches!(json_to_val(&json!(true), &ValType::I32), Some(Val::I32(1))));
        // Out of range for i32
        assert!(json_to_val(&json!(1_i64 << 40), &ValType::I32).is_none());
        // Floats are not truncated into integers
        assert!(json_to_val(&json!(1.5), &ValType::I32).is_none());
        assert!(json_to_val(&json!("7"), &ValType::I32).is_none());
    }

    #[test]
    fn test_json_to_val_floats() {
        let Some(Val::F64(bits)) = json_to_val(&json!(2.5), &ValType::F64) else {
            panic!("expected f64");
        };
        assert!((f64::from_bits(bits) - 2.5).abs() < f64::EPSILON);

        let Some(Val::F32(bits)) = json_to_val(&json!(3), &ValType::F32) else {
            panic!("expected f32");
        };
        assert!((f32::from_bits(bits) - 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_val_to_json() {
        assert_eq!(val_to_json(&Val::I32(-3)), json!(-3));
        assert_eq!(val_to_json(&Val::I64(1 << 40)), json!(1_i64 << 40));
        assert_eq!(val_to_json(&Val::F64(0.5_f64.to_bits())), json!(0.5));
        assert_eq!(val_to_json(&Val::F64(f64::NAN.to_bits())), Value::Null);
    }

    #[test]
    fn test_into_result_list() {
        assert_eq!(into_result_list(json!([1, 2])), vec![json!(1), json!(2)]);
        assert_eq!(into_result_list(json!({"ok": true})), vec![json!({"ok": true})]);
    }

    #[test]
    fn test_guest_memory_bounds() {
        let engine = wasmtime::Engine::default();
        let mut store = wasmtime::Store::new(&engine, ());
        let memory =
            Memory::new(&mut store, wasmtime::MemoryType::new(1, None)).unwrap();

        write_bytes(&mut store, &memory, 100, b"hello").unwrap();
        assert_eq!(read_bytes(&store, &memory, 100, 5).unwrap(), b"hello");

        assert!(matches!(
            read_bytes(&store, &memory, -1, 5),
            Err(AbiError::Negative { .. })
        ));
        assert!(matches!(
            read_bytes(&store, &memory, 65_530, 10),
            Err(AbiError::OutOfBounds { .. })
        ));
        assert!(matches!(
            write_bytes(&mut store, &memory, 65_535, b"xy"),
            Err(AbiError::OutOfBounds { .. })
        ));
    }
}
