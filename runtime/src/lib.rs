//! WAJS host runtime
//!
//! This crate hosts a single sandboxed WebAssembly module on top of wasmtime.
//! It discovers the module's static memory layout before instantiation, owns
//! the module's linear memory, and emulates the small WASI Preview 1 surface
//! that the WAJS toolchain links against (argv, clock, read-only fetch-backed
//! files, stdout/stderr).
//!
//! # Architecture
//!
//! - `parser`: Section pre-flight scan (heap base + end of static data)
//! - `memory`: Linear memory sizing, `sbrk`-style growth, bounds-checked guest views
//! - `strings`: UTF-8 string transfer between host and guest memory
//! - `handles`: Opaque integer handle tables for host-side objects
//! - `wasi`: WASI Preview 1 syscall layer + descriptor table
//! - `backing`: File-backing collaborators (memory, directory, HTTP)
//! - `session`: Per-module session state, abort latch and output sink
//! - `host`: Import namespace bindings (env intrinsics, WASI, loop hooks)
//! - `host_gl`: GL-style graphics bindings over a pluggable raster context
//! - `engine`: `ModuleHost` orchestration (load → start → frames → shutdown)

pub mod backing;
pub mod engine;
pub mod handles;
pub mod host;
pub mod host_gl;
pub mod memory;
pub mod parser;
pub mod session;
pub mod strings;
pub mod wasi;

use std::collections::BTreeMap;

use serde::Deserialize;

pub use engine::{ModuleHost, ModuleHostBuilder};
pub use memory::MemoryLayout;
pub use session::{FaultCategory, HostFault, HostSession, HostSink};

/// Runtime error types.
#[derive(thiserror::Error, Debug, Clone)]
pub enum RuntimeError {
    /// The pre-flight scan produced an unusable memory layout.
    #[error("Invalid memory layout ({data_end}/{stack_top}/{heap_base})")]
    InvalidLayout {
        data_end: u32,
        stack_top: u32,
        heap_base: u32,
    },
    /// Not a WASM binary at all.
    #[error("Invalid binary: {0}")]
    InvalidBinary(String),
    /// Failed to compile or instantiate the module.
    #[error("Instantiation error: {0}")]
    InstantiationError(String),
    /// Failed to execute an exported function.
    #[error("Execution error: {0}")]
    ExecutionError(String),
    /// Linear memory could not be created or accessed.
    #[error("Memory error: {0}")]
    MemoryError(String),
    /// Bad runtime configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// A fatal fault ended the session.
    #[error("{0}")]
    Fault(HostFault),
    /// The session was already aborted by an earlier fault.
    #[error("Session aborted")]
    Aborted,
}

/// Runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Argument vector handed to the module; `args[0]` is the program name.
    pub args: Vec<String>,
    /// Environment variables exposed through `environ_get`.
    pub env: BTreeMap<String, String>,
    /// Name of the single preopened root directory (fd 3).
    pub root_dir: String,
    /// Upper bound for the heap break, in bytes.
    pub heap_limit: u32,
    /// Heap space allocated past the heap base at boot, in bytes.
    pub heap_slack: u32,
    /// Exported entry point invoked after global constructors.
    pub entry_point: String,
    /// Timeout for blocking file-backing requests, in milliseconds.
    pub open_timeout_ms: u64,
    /// Cadence of the per-frame callback, in milliseconds.
    pub frame_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            args: vec![String::from("wasm.exe")],
            env: BTreeMap::new(),
            root_dir: String::from("/"),
            heap_limit: 256 * 1024 * 1024, // 256 MB
            heap_slack: 256 * 1024,        // 256 KB
            entry_point: String::from("_start"),
            open_timeout_ms: 5_000,
            frame_interval_ms: 16,
        }
    }
}

impl RuntimeConfig {
    /// Check the configuration before a session is built from it.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.args.is_empty() {
            return Err(RuntimeError::ConfigError(
                "args must contain at least the program name".into(),
            ));
        }
        if self.root_dir.is_empty() {
            return Err(RuntimeError::ConfigError("root_dir must not be empty".into()));
        }
        if self.heap_limit as usize % memory::PAGE_SIZE != 0 {
            return Err(RuntimeError::ConfigError(format!(
                "heap_limit must be a multiple of {} bytes",
                memory::PAGE_SIZE
            )));
        }
        Ok(())
    }
}

/// Load a module with default collaborators and run it to the end of its entry point.
pub fn execute(wasm_bytes: &[u8], config: RuntimeConfig) -> Result<ModuleHost, RuntimeError> {
    let mut host = ModuleHost::builder(config).load(wasm_bytes)?;
    host.start()?;
    Ok(host)
}

/// Run only the pre-flight scan over a module.
pub fn validate(wasm_bytes: &[u8]) -> Result<MemoryLayout, RuntimeError> {
    parser::scan_layout(wasm_bytes)
}
