//! Per-module session state.
//!
//! A [`HostSession`] is the `T` of the `wasmtime::Store<T>` that runs the
//! module. It owns everything the import bindings touch: the linear memory
//! descriptor, the syscall layer, the output sink, the frame hooks, the
//! optional graphics layer, and the abort latch that ends the session on
//! the first fatal fault.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use spin::Mutex;

use crate::host_gl::GraphicsLayer;
use crate::memory::LinearMemory;
use crate::wasi::SyscallLayer;

/// Category of a fatal fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCategory {
    /// Module could not be loaded or instantiated.
    Boot,
    /// Guest code hit an assertion, abort hook or trap.
    Crash,
    /// Heap exhausted.
    Mem,
    /// Guest called `proc_exit` with this code.
    Exit(i32),
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCategory::Boot => f.write_str("BOOT"),
            FaultCategory::Crash => f.write_str("CRASH"),
            FaultCategory::Mem => f.write_str("MEM"),
            FaultCategory::Exit(code) => write!(f, "{}", code),
        }
    }
}

/// A fatal, session-ending fault.
///
/// Raised from host functions as a `wasmtime::Error` so the current guest
/// call unwinds; the engine recovers it by downcasting.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("[{category}] {message}")]
pub struct HostFault {
    pub category: FaultCategory,
    pub message: String,
}

impl HostFault {
    pub fn new(category: FaultCategory, message: impl Into<String>) -> Self {
        HostFault {
            category,
            message: message.into(),
        }
    }

    /// Whether this fault is a clean `proc_exit(0)`.
    pub fn is_clean_exit(&self) -> bool {
        self.category == FaultCategory::Exit(0)
    }
}

/// One-way latch set by the first fatal fault.
#[derive(Debug, Default)]
pub struct AbortLatch {
    fault: Option<HostFault>,
}

impl AbortLatch {
    /// Trip the latch. Returns `false` if it was already tripped, in which
    /// case the first fault is kept.
    pub fn trip(&mut self, fault: HostFault) -> bool {
        if self.fault.is_some() {
            return false;
        }
        self.fault = Some(fault);
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.fault.is_some()
    }

    /// The fault that tripped the latch.
    pub fn fault(&self) -> Option<&HostFault> {
        self.fault.as_ref()
    }
}

/// Destination for guest output and fatal diagnostics.
pub trait HostSink {
    /// Text written to fd 1.
    fn print(&mut self, text: &str);
    /// Text written to fd 2.
    fn print_err(&mut self, text: &str);
    /// Diagnostic for a fatal fault.
    fn error(&mut self, category: FaultCategory, text: &str);
}

/// Sink writing to the process's stdout and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl HostSink for ConsoleSink {
    fn print(&mut self, text: &str) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = write_flushed(&mut out, text) {
            log::warn!("[wajs] stdout write failed: {}", e);
        }
    }

    fn print_err(&mut self, text: &str) {
        let mut err = std::io::stderr().lock();
        if let Err(e) = write_flushed(&mut err, text) {
            log::warn!("[wajs] stderr write failed: {}", e);
        }
    }

    fn error(&mut self, category: FaultCategory, text: &str) {
        eprintln!("[{}] {}", category, text);
    }
}

fn write_flushed(out: &mut impl Write, text: &str) -> std::io::Result<()> {
    out.write_all(text.as_bytes())?;
    out.flush()
}

/// Everything a [`CaptureSink`] has received.
#[derive(Debug, Default, Clone)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    pub errors: Vec<(FaultCategory, String)>,
}

/// Sink recording output in memory.
///
/// Clones share the same record, so a test keeps one clone and hands the
/// other to the session.
#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    inner: Arc<Mutex<Captured>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything captured so far.
    pub fn snapshot(&self) -> Captured {
        self.inner.lock().clone()
    }

    pub fn stdout(&self) -> String {
        self.inner.lock().stdout.clone()
    }

    pub fn stderr(&self) -> String {
        self.inner.lock().stderr.clone()
    }

    pub fn errors(&self) -> Vec<(FaultCategory, String)> {
        self.inner.lock().errors.clone()
    }
}

impl HostSink for CaptureSink {
    fn print(&mut self, text: &str) {
        self.inner.lock().stdout.push_str(text);
    }

    fn print_err(&mut self, text: &str) {
        self.inner.lock().stderr.push_str(text);
    }

    fn error(&mut self, category: FaultCategory, text: &str) {
        self.inner.lock().errors.push((category, text.to_string()));
    }
}

/// Guest callbacks registered through the loop imports.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameHooks {
    /// Table index of the per-frame callback.
    pub main_loop: Option<u32>,
    /// Table index of the shutdown callback.
    pub shutdown: Option<u32>,
    /// Call the `__wajsUpdateFrameTime` export before each frame.
    pub update_frame_time: bool,
}

/// Store data for a running module.
pub struct HostSession {
    pub(crate) memory: Option<LinearMemory>,
    pub(crate) syscalls: SyscallLayer,
    pub(crate) hooks: FrameHooks,
    pub(crate) graphics: Option<GraphicsLayer>,
    sink: Box<dyn HostSink>,
    latch: AbortLatch,
    exit_code: Option<i32>,
}

impl HostSession {
    pub fn new(syscalls: SyscallLayer, sink: Box<dyn HostSink>) -> Self {
        HostSession {
            memory: None,
            syscalls,
            hooks: FrameHooks::default(),
            graphics: None,
            sink,
            latch: AbortLatch::default(),
            exit_code: None,
        }
    }

    /// Trip the abort latch with `fault`.
    ///
    /// Only the first fault reaches the sink; `proc_exit(0)` is silent.
    pub fn trip(&mut self, fault: &HostFault) {
        if let FaultCategory::Exit(code) = fault.category {
            self.exit_code.get_or_insert(code);
        }
        if self.latch.trip(fault.clone()) {
            if fault.is_clean_exit() {
                log::info!("[wajs] module exited");
            } else {
                log::error!("[wajs] {}", fault);
                self.sink.error(fault.category, &fault.message);
            }
        }
    }

    /// Trip the abort latch and return the error that unwinds the current
    /// guest call.
    pub fn raise(&mut self, fault: HostFault) -> wasmtime::Error {
        self.trip(&fault);
        wasmtime::Error::new(fault)
    }

    /// Whether a fatal fault has ended the session.
    pub fn is_aborted(&self) -> bool {
        self.latch.is_tripped()
    }

    /// The fault that ended the session.
    pub fn fault(&self) -> Option<&HostFault> {
        self.latch.fault()
    }

    /// Exit code passed to `proc_exit`, if the module called it.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// The module's linear memory.
    pub fn memory(&self) -> Option<&LinearMemory> {
        self.memory.as_ref()
    }

    pub fn syscalls(&self) -> &SyscallLayer {
        &self.syscalls
    }

    pub fn hooks(&self) -> &FrameHooks {
        &self.hooks
    }

    pub fn graphics(&self) -> Option<&GraphicsLayer> {
        self.graphics.as_ref()
    }

    pub fn graphics_mut(&mut self) -> Option<&mut GraphicsLayer> {
        self.graphics.as_mut()
    }

    pub fn sink_mut(&mut self) -> &mut dyn HostSink {
        self.sink.as_mut()
    }

    /// Borrow the syscall layer and the sink at the same time.
    pub(crate) fn split(&mut self) -> (&mut SyscallLayer, &mut dyn HostSink) {
        (&mut self.syscalls, self.sink.as_mut())
    }
}
