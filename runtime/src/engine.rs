//! Module host: loads one module and drives it through its lifecycle.
//!
//! `load` scans the module, builds its memory and imports, and instantiates
//! it; `start` runs global constructors and the entry point; after that the
//! embedder pumps `run_frame` (or `run_loop`) and finally calls `shutdown`.
//! The first fatal fault trips the session's abort latch, after which no
//! further guest code runs.

use std::thread;
use std::time::{Duration, Instant};

use wasmtime::{Engine, Instance, Linker, Module, Store, Trap, Val};

use crate::backing::{FileBacking, MemoryBacking};
use crate::host::{self, ImportExtension, ENV_MODULE};
use crate::host_gl::{GlBindings, GraphicsLayer, RasterContext};
use crate::memory::{LinearMemory, MemoryLayout};
use crate::parser;
use crate::session::{ConsoleSink, FaultCategory, HostFault, HostSession, HostSink};
use crate::wasi::SyscallLayer;
use crate::{RuntimeConfig, RuntimeError};

/// Global constructors export.
pub const CTORS_EXPORT: &str = "__wasm_call_ctors";
/// Indirect function table export used to resolve callbacks.
pub const TABLE_EXPORT: &str = "__indirect_function_table";
/// Per-frame time update export, called when the graphics layer drives frames.
pub const FRAME_TIME_EXPORT: &str = "__wajsUpdateFrameTime";

/// Collects the collaborators of a [`ModuleHost`].
pub struct ModuleHostBuilder {
    config: RuntimeConfig,
    sink: Option<Box<dyn HostSink>>,
    backing: Option<Box<dyn FileBacking>>,
    graphics: Option<Box<dyn RasterContext>>,
    extensions: Vec<Box<dyn ImportExtension>>,
}

impl ModuleHostBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        ModuleHostBuilder {
            config,
            sink: None,
            backing: None,
            graphics: None,
            extensions: Vec::new(),
        }
    }

    /// Output sink (defaults to [`ConsoleSink`]).
    pub fn sink(mut self, sink: impl HostSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// File backing (defaults to an empty [`MemoryBacking`]).
    pub fn backing(mut self, backing: impl FileBacking + 'static) -> Self {
        self.backing = Some(Box::new(backing));
        self
    }

    /// Enable the GL imports on top of `context`.
    pub fn graphics(mut self, context: impl RasterContext + 'static) -> Self {
        self.graphics = Some(Box::new(context));
        self
    }

    /// Add caller-defined imports.
    pub fn extension(mut self, extension: impl ImportExtension + 'static) -> Self {
        self.extensions.push(Box::new(extension));
        self
    }

    /// Scan, link and instantiate a module.
    ///
    /// Any failure here is a BOOT fault: it is reported to the sink and
    /// returned as [`RuntimeError::Fault`].
    pub fn load(self, wasm_bytes: &[u8]) -> Result<ModuleHost, RuntimeError> {
        self.config.validate()?;

        let backing = self
            .backing
            .unwrap_or_else(|| Box::new(MemoryBacking::new()));
        let sink = self.sink.unwrap_or_else(|| Box::new(ConsoleSink));
        let mut session = HostSession::new(SyscallLayer::new(&self.config, backing), sink);
        if let Some(context) = self.graphics {
            session.graphics = Some(GraphicsLayer::new(context));
        }

        let layout = match parser::scan_layout(wasm_bytes) {
            Ok(layout) => layout,
            Err(e) => return Err(boot_failure(&mut session, e.to_string())),
        };
        log::info!(
            "[wajs] layout: data end {}, stack top {}, heap base {}",
            layout.data_end,
            layout.stack_top,
            layout.heap_base
        );

        let engine = Engine::default();
        let mut store = Store::new(&engine, session);

        let memory = match LinearMemory::new(
            &mut store,
            &layout,
            self.config.heap_limit,
            self.config.heap_slack,
        ) {
            Ok(memory) => memory,
            Err(e) => return Err(boot_failure(store.data_mut(), e.to_string())),
        };
        store.data_mut().memory = Some(memory);

        let mut linker: Linker<HostSession> = Linker::new(&engine);
        let linked = link_imports(&mut linker, &store, memory, &self.extensions);
        if let Err(e) = linked {
            return Err(boot_failure(store.data_mut(), format!("Import binding failed: {:#}", e)));
        }

        let module = match Module::from_binary(&engine, wasm_bytes) {
            Ok(module) => module,
            Err(e) => {
                return Err(boot_failure(
                    store.data_mut(),
                    format!("WASM compile error: {:#}", e),
                ))
            }
        };

        let instance = match linker.instantiate(&mut store, &module) {
            Ok(instance) => instance,
            Err(e) => {
                if let Some(fault) = store.data().fault() {
                    return Err(RuntimeError::Fault(fault.clone()));
                }
                return Err(boot_failure(
                    store.data_mut(),
                    format!("WASM instantiate error: {:#}", e),
                ));
            }
        };

        if let Some(exported) = instance.get_memory(&mut store, "memory") {
            if let Some(memory) = store.data_mut().memory.as_mut() {
                memory.rebind(exported);
            }
        }
        log::info!("[wajs] compile finish");

        Ok(ModuleHost {
            store,
            instance,
            layout,
            entry_point: self.config.entry_point,
            started: false,
            shut_down: false,
        })
    }
}

fn link_imports(
    linker: &mut Linker<HostSession>,
    store: &Store<HostSession>,
    memory: LinearMemory,
    extensions: &[Box<dyn ImportExtension>],
) -> wasmtime::Result<()> {
    linker.define(store, ENV_MODULE, "memory", memory.handle())?;
    host::register_all(linker)?;
    if store.data().graphics.is_some() {
        GlBindings.register(linker)?;
    }
    for extension in extensions {
        extension.register(linker)?;
    }
    Ok(())
}

fn boot_failure(session: &mut HostSession, message: String) -> RuntimeError {
    let fault = HostFault::new(FaultCategory::Boot, message);
    session.trip(&fault);
    RuntimeError::Fault(fault)
}

/// A loaded module and its session.
pub struct ModuleHost {
    store: Store<HostSession>,
    instance: Instance,
    layout: MemoryLayout,
    entry_point: String,
    started: bool,
    shut_down: bool,
}

impl ModuleHost {
    /// Start building a host with `config`.
    pub fn builder(config: RuntimeConfig) -> ModuleHostBuilder {
        ModuleHostBuilder::new(config)
    }

    /// Layout found by the pre-flight scan.
    pub fn layout(&self) -> MemoryLayout {
        self.layout
    }

    /// Run global constructors, then the entry point. Both are optional.
    ///
    /// A `proc_exit(0)` from either ends the session without an error.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        if self.started {
            return Err(RuntimeError::ExecutionError("module already started".into()));
        }
        self.started = true;

        let result = self.call(CTORS_EXPORT).and_then(|_| {
            let entry_point = self.entry_point.clone();
            log::info!("[wajs] wasm main start");
            self.call(&entry_point)
        });
        match result {
            Ok(_) => {
                log::info!("[wajs] wasm main exit");
                Ok(())
            }
            Err(RuntimeError::Fault(fault)) if fault.is_clean_exit() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Call a `() -> ()` export. Returns `false` if the module does not export it.
    pub fn call(&mut self, name: &str) -> Result<bool, RuntimeError> {
        if self.is_aborted() {
            return Err(RuntimeError::Aborted);
        }
        let Some(func) = self.instance.get_func(&mut self.store, name) else {
            return Ok(false);
        };
        let func = func
            .typed::<(), ()>(&self.store)
            .map_err(|e| RuntimeError::ExecutionError(format!("{}: {}", name, e)))?;
        func.call(&mut self.store, ()).map_err(|e| self.fault_from(e))?;
        Ok(true)
    }

    /// Call the function at `index` of the indirect function table.
    fn call_indirect(&mut self, index: u32) -> Result<(), RuntimeError> {
        let table = self
            .instance
            .get_table(&mut self.store, TABLE_EXPORT)
            .ok_or_else(|| RuntimeError::ExecutionError(format!("{} is not exported", TABLE_EXPORT)))?;
        let func = match table.get(&mut self.store, index) {
            Some(Val::FuncRef(Some(func))) => func,
            _ => {
                return Err(RuntimeError::ExecutionError(format!(
                    "table[{}] is not a function",
                    index
                )))
            }
        };
        let func = func
            .typed::<(), ()>(&self.store)
            .map_err(|e| RuntimeError::ExecutionError(format!("table[{}]: {}", index, e)))?;
        func.call(&mut self.store, ()).map_err(|e| self.fault_from(e))
    }

    /// Turn an engine error from a guest call into a session fault.
    fn fault_from(&mut self, err: wasmtime::Error) -> RuntimeError {
        if let Some(fault) = self.store.data().fault() {
            return RuntimeError::Fault(fault.clone());
        }
        let message = match err.downcast_ref::<Trap>() {
            Some(trap) => format!("wasm trap: {}", trap),
            None => format!("{:#}", err),
        };
        let fault = HostFault::new(FaultCategory::Crash, message);
        self.store.data_mut().trip(&fault);
        RuntimeError::Fault(fault)
    }

    /// Run one frame: the frame-time update (if enabled), then the frame
    /// callback. Returns `false` if no callback is set or the session has
    /// ended, including a `proc_exit(0)` from inside the frame.
    pub fn run_frame(&mut self) -> Result<bool, RuntimeError> {
        if self.is_aborted() {
            return Ok(false);
        }
        let hooks = *self.store.data().hooks();
        let Some(callback) = hooks.main_loop else {
            return Ok(false);
        };
        let frame = if hooks.update_frame_time {
            self.call(FRAME_TIME_EXPORT).map(|_| ())
        } else {
            Ok(())
        };
        match frame.and_then(|()| self.call_indirect(callback)) {
            Ok(()) => Ok(true),
            Err(RuntimeError::Fault(fault)) if fault.is_clean_exit() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run frames every `interval` until the callback goes away, the
    /// session ends, or `max_frames` have run. Returns the frames run.
    pub fn run_loop(&mut self, max_frames: Option<u64>, interval: Duration) -> Result<u64, RuntimeError> {
        let mut frames = 0;
        while max_frames.map_or(true, |max| frames < max) {
            let frame_start = Instant::now();
            if !self.run_frame()? {
                break;
            }
            frames += 1;
            if let Some(rest) = interval.checked_sub(frame_start.elapsed()) {
                thread::sleep(rest);
            }
        }
        log::debug!("[wajs] frame loop ran {} frames", frames);
        Ok(frames)
    }

    /// Run the shutdown callback (at most once) and close open files.
    /// Returns whether a callback ran.
    ///
    /// Open files are closed even when the callback faults.
    pub fn shutdown(&mut self) -> Result<bool, RuntimeError> {
        if self.shut_down {
            return Ok(false);
        }
        self.shut_down = true;

        let callback = self.store.data().hooks().shutdown;
        let result = match callback {
            Some(index) if !self.is_aborted() => self.call_indirect(index).map(|()| true),
            _ => Ok(false),
        };
        self.store.data_mut().syscalls.close_all();
        match result {
            Err(RuntimeError::Fault(fault)) if fault.is_clean_exit() => Ok(true),
            other => other,
        }
    }

    /// Whether a fatal fault has ended the session.
    pub fn is_aborted(&self) -> bool {
        self.store.data().is_aborted()
    }

    /// The fault that ended the session.
    pub fn fault(&self) -> Option<&HostFault> {
        self.store.data().fault()
    }

    /// Exit code passed to `proc_exit`, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.store.data().exit_code()
    }

    pub fn session(&self) -> &HostSession {
        self.store.data()
    }

    pub fn session_mut(&mut self) -> &mut HostSession {
        self.store.data_mut()
    }

    /// Current contents of linear memory.
    pub fn memory_data(&self) -> &[u8] {
        match self.store.data().memory() {
            Some(memory) => memory.handle().data(&self.store),
            None => &[],
        }
    }

    /// Current size of linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory_data().len()
    }
}
