//! WebAssembly module compilation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that handles compilation, serialization, and deserialization of guest modules.
//!
//! # Compilation Strategies
//!
//! - **JIT**: Compile from Wasm bytes at runtime (slower cold start)
//! - **AOT**: Pre-compile and serialize to disk (fast cold start)

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::{Engine, Module};

use worker_bridge_common::LoadError;

/// A compiled guest module.
///
/// Immutable once built and cheap to clone: clones share the same compiled
/// code, so one `CompiledModule` backs every instance the bridge starts.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// Hash of the original Wasm bytes (or artifact file stem).
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a core module or fail to compile.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, LoadError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes)
            .map_err(|e| LoadError::invalid(format!("Core module compilation failed: {e}")))?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Core module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Load a pre-compiled module from disk.
    ///
    /// Only load artifacts that were compiled by the same version of Wasmtime
    /// with the same engine settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be loaded or is incompatible.
    #[allow(unsafe_code)]
    #[instrument(skip(engine, path))]
    pub fn from_precompiled(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let start = Instant::now();

        // SAFETY: artifacts are produced by `serialize` with a matching engine
        let module = unsafe { Module::deserialize_file(engine, path) }.map_err(|e| {
            LoadError::Unsupported {
                reason: format!(
                    "Failed to load precompiled module from {}: {e}",
                    path.display()
                ),
            }
        })?;

        // Extract hash from filename convention: {hash}.cwasm
        let content_hash = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        debug!(
            path = %path.display(),
            content_hash = %content_hash,
            duration_us = start.elapsed().as_micros(),
            "Precompiled module loaded"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, LoadError> {
        let module = Module::new(engine, wat)
            .map_err(|e| LoadError::invalid(format!("WAT compilation failed: {e}")))?;

        Ok(Self {
            inner: module,
            content_hash: compute_hash(wat.as_bytes()),
            compiled_at: Instant::now(),
        })
    }

    /// Serialize the compiled module for AOT caching.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn serialize(&self) -> Result<Vec<u8>, LoadError> {
        self.inner
            .serialize()
            .map_err(|e| LoadError::invalid(format!("Module serialization failed: {e}")))
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Get the inner core module.
    pub fn as_core_module(&self) -> &Module {
        &self.inner
    }

    /// Validate WebAssembly header (magic number and core module version).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), LoadError> {
        if bytes.len() < 8 {
            return Err(LoadError::invalid("Invalid Wasm: file too small"));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(LoadError::invalid("Invalid Wasm: bad magic number"));
        }

        // Components share the magic number but carry a non-zero layer field
        if bytes[6..8] != [0x00, 0x00] {
            return Err(LoadError::Unsupported {
                reason: "components are not supported, expected a core module".to_string(),
            });
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use worker_bridge_common::EngineConfig;

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
    fn test_validate_wasm_header_valid() {
        assert!(CompiledModule::validate_wasm_header(MINIMAL_WASM).is_ok());
    }

    #[test]
    fn test_validate_wasm_header_too_small() {
        let result = CompiledModule::validate_wasm_header(&[0x00, 0x61]);
        assert!(matches!(result, Err(LoadError::Invalid { .. })));
    }

    #[test]
    fn test_validate_wasm_header_bad_magic() {
        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let result = CompiledModule::validate_wasm_header(bad_wasm);
        assert!(matches!(result, Err(LoadError::Invalid { .. })));
    }

    #[test]
    fn test_validate_wasm_header_component() {
        let component = &[0x00, 0x61, 0x73, 0x6d, 0x0d, 0x00, 0x01, 0x00];
        let result = CompiledModule::validate_wasm_header(component);
        assert!(matches!(result, Err(LoadError::Unsupported { .. })));
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_module_compilation() {
        let engine = engine();
        let module = CompiledModule::from_bytes(engine.inner(), MINIMAL_WASM).unwrap();
        assert!(!module.content_hash().is_empty());
    }

    #[test]
    fn test_malformed_bytecode() {
        let engine = engine();
        // Valid header followed by a truncated section
        let bytes = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0x01, 0x05];
        let result = CompiledModule::from_bytes(engine.inner(), &bytes);
        assert!(matches!(result, Err(LoadError::Invalid { .. })));
    }

    #[test]
    fn test_serialize_roundtrip_through_file() {
        let engine = engine();
        let module = CompiledModule::from_wat(engine.inner(), "(module)").unwrap();
        let artifact = module.serialize().unwrap();

        let path = std::env::temp_dir().join(format!("{}.cwasm", module.content_hash()));
        std::fs::write(&path, artifact).unwrap();

        let loaded = CompiledModule::from_precompiled(engine.inner(), &path).unwrap();
        assert_eq!(loaded.content_hash(), module.content_hash());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_module_debug() {
        let engine = engine();
        let module = CompiledModule::from_bytes(engine.inner(), MINIMAL_WASM).unwrap();

        let debug_str = format!("{module:?}");
        assert!(debug_str.contains("CompiledModule"));
        assert!(debug_str.contains("content_hash"));
    }
}
