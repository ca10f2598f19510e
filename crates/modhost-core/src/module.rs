//! Guest module compilation.
//!
//! [`CompiledModule`] wraps a Wasmtime [`Module`] compiled from a module file
//! on disk. Every instance in a pool is created from the same compiled module,
//! so all of them share one version of the guest code.

use std::path::Path;
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, Module};

use modhost_common::HostError;

/// Export name of the WASI command entry point.
pub const ENTRY_POINT: &str = "_start";

/// A compiled guest module.
///
/// Cheap to clone: the underlying Wasmtime module is reference counted.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,
}

impl CompiledModule {
    /// Read and compile a module file.
    #[instrument(skip(engine), fields(path = %path.display()))]
    pub fn from_file(engine: &Engine, path: &Path) -> Result<Self, HostError> {
        let bytes = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HostError::ModuleFileMissing {
                    path: path.display().to_string(),
                }
            } else {
                HostError::compilation_failed(format!("Failed to read {}: {e}", path.display()))
            }
        })?;

        Self::from_bytes(engine, &bytes)
    }

    /// Compile a module from WebAssembly bytes.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, HostError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes)
            .map_err(|e| HostError::compilation_failed(format!("{e:#}")))?;

        info!(
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(Self { inner: module })
    }

    /// Names of every exported function, in export order.
    pub fn function_exports(&self) -> Vec<String> {
        self.inner
            .exports()
            .filter(|export| matches!(export.ty(), ExternType::Func(_)))
            .map(|export| export.name().to_string())
            .collect()
    }

    /// Returns `true` if the module has a WASI command entry point.
    pub fn has_entry_point(&self) -> bool {
        self.inner.get_export(ENTRY_POINT).is_some()
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }

    fn validate_wasm_header(bytes: &[u8]) -> Result<(), HostError> {
        if bytes.len() < 8 {
            return Err(HostError::compilation_failed("Invalid Wasm: file too small"));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(HostError::compilation_failed("Invalid Wasm: bad magic number"));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("exports", &self.function_exports())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use modhost_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_validate_wasm_header() {
        assert!(CompiledModule::validate_wasm_header(MINIMAL_WASM).is_ok());
        assert!(CompiledModule::validate_wasm_header(&[0x00, 0x61]).is_err());

        let bad_magic = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        assert!(CompiledModule::validate_wasm_header(bad_magic).is_err());
    }

    #[test]
    fn test_function_exports() {
        let bytes = wat::parse_str(
            r#"(module
                (memory (export "memory") 1)
                (func (export "_start"))
                (func (export "add") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.add))"#,
        )
        .unwrap();

        let module = CompiledModule::from_bytes(engine().inner(), &bytes).unwrap();

        assert_eq!(module.function_exports(), vec!["_start", "add"]);
        assert!(module.has_entry_point());
    }

    #[test]
    fn test_from_file_missing() {
        let err = CompiledModule::from_file(engine().inner(), Path::new("/nonexistent/m.wasm"))
            .unwrap_err();
        assert!(matches!(err, HostError::ModuleFileMissing { .. }));
    }

    #[test]
    fn test_from_file_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wasm");
        std::fs::write(&path, b"not a wasm module").unwrap();

        let err = CompiledModule::from_file(engine().inner(), &path).unwrap_err();
        assert!(matches!(err, HostError::CompilationFailed { .. }));
    }

    #[test]
    fn test_module_debug() {
        let module = CompiledModule::from_bytes(engine().inner(), MINIMAL_WASM).unwrap();

        let debug_str = format!("{module:?}");
        assert!(debug_str.contains("CompiledModule"));
        assert!(debug_str.contains("exports: []"));
        assert!(!module.has_entry_point());
    }
}
