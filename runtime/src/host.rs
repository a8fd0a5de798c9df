//! Host function bindings.
//!
//! This module wires the session's state into the module's import
//! namespaces: `env` intrinsics (heap growth, abort hooks, math, loop hooks)
//! and the WASI Preview 1 surface, which is registered under every
//! namespace name the toolchain has used for it.

use wasmtime::{Caller, Linker};

use crate::memory::GuestMemory;
use crate::session::{FaultCategory, HostFault, HostSession};
use crate::strings;
use crate::wasi::{CallContext, Errno, SyscallLayer, WasiPreview1};

/// Namespace of the C runtime intrinsics.
pub const ENV_MODULE: &str = "env";

/// Namespaces the syscall layer is registered under.
pub const WASI_MODULES: [&str; 3] = ["wasi_snapshot_preview1", "wasi_unstable", "wasi"];

/// Caller-supplied import bindings (e.g. graphics).
///
/// Extensions are registered after the built-in namespaces, into the same
/// linker, and see the same session state.
pub trait ImportExtension {
    fn register(&self, linker: &mut Linker<HostSession>) -> wasmtime::Result<()>;
}

/// Register all built-in host functions.
pub fn register_all(linker: &mut Linker<HostSession>) -> wasmtime::Result<()> {
    register_env_functions(linker)?;
    register_math_functions(linker)?;
    for module in WASI_MODULES {
        register_wasi_functions(linker, module)?;
    }
    register_loop_functions(linker)?;
    Ok(())
}

/// Borrow guest memory and the session for one host call.
pub(crate) fn guest_view<'a>(
    caller: &'a mut Caller<'_, HostSession>,
) -> wasmtime::Result<(GuestMemory<'a>, &'a mut HostSession)> {
    let memory = match caller.data().memory {
        Some(memory) => memory.handle(),
        None => return Err(wasmtime::Error::msg("linear memory not initialized")),
    };
    let (bytes, session) = memory.data_and_store_mut(caller);
    Ok((GuestMemory::new(bytes), session))
}

/// Raise a CRASH fault from a host call.
pub(crate) fn crash(caller: &mut Caller<'_, HostSession>, message: impl Into<String>) -> wasmtime::Error {
    caller
        .data_mut()
        .raise(HostFault::new(FaultCategory::Crash, message))
}

/// Register heap growth and the C runtime abort hooks.
fn register_env_functions(linker: &mut Linker<HostSession>) -> wasmtime::Result<()> {
    linker.func_wrap(ENV_MODULE, "sbrk", host_sbrk)?;

    linker.func_wrap(
        ENV_MODULE,
        "__assert_fail",
        |mut caller: Caller<'_, HostSession>, condition: i32, file: i32, line: i32, func: i32| -> wasmtime::Result<()> {
            let message = {
                let (memory, _) = guest_view(&mut caller)?;
                let mem = memory.as_slice();
                let condition = strings::decode(mem, condition as u32, None);
                let file = match file {
                    0 => String::from("unknown filename"),
                    ptr => strings::decode(mem, ptr as u32, None),
                };
                let func = match func {
                    0 => String::from("unknown function"),
                    ptr => strings::decode(mem, ptr as u32, None),
                };
                format!("Assert {}, at: {}:{} ({})", condition, file, line, func)
            };
            Err(crash(&mut caller, message))
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "__cxa_uncaught_exception",
        |mut caller: Caller<'_, HostSession>| -> wasmtime::Result<i32> {
            Err(crash(&mut caller, "Uncaught exception!"))
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "__cxa_pure_virtual",
        |mut caller: Caller<'_, HostSession>| -> wasmtime::Result<()> {
            Err(crash(&mut caller, "pure virtual"))
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "abort",
        |mut caller: Caller<'_, HostSession>| -> wasmtime::Result<()> {
            Err(crash(&mut caller, "Abort called"))
        },
    )?;

    linker.func_wrap(
        ENV_MODULE,
        "longjmp",
        |mut caller: Caller<'_, HostSession>, _env: i32, _value: i32| -> wasmtime::Result<()> {
            Err(crash(&mut caller, "Unsupported longjmp called"))
        },
    )?;

    Ok(())
}

/// `sbrk(increment)`: move the heap break, returning the old one.
fn host_sbrk(mut caller: Caller<'_, HostSession>, increment: i32) -> wasmtime::Result<i32> {
    if increment < 0 {
        log::warn!("[wajs] sbrk({}) refused: the heap never shrinks", increment);
        return Ok(-1);
    }
    let Some(mut memory) = caller.data().memory else {
        return Err(wasmtime::Error::msg("linear memory not initialized"));
    };
    match memory.grow(&mut caller, increment as u32) {
        Ok(previous) => {
            caller.data_mut().memory = Some(memory);
            Ok(previous as i32)
        }
        Err(fault) => Err(caller.data_mut().raise(fault)),
    }
}

/// Register libm functions the toolchain leaves as imports.
fn register_math_functions(linker: &mut Linker<HostSession>) -> wasmtime::Result<()> {
    let unary: [(&str, fn(f64) -> f64); 11] = [
        ("sin", f64::sin),
        ("cos", f64::cos),
        ("tan", f64::tan),
        ("asin", f64::asin),
        ("acos", f64::acos),
        ("atan", f64::atan),
        ("exp", f64::exp),
        ("log", f64::ln),
        ("sqrt", f64::sqrt),
        ("floor", f64::floor),
        ("ceil", f64::ceil),
    ];
    for (name, op) in unary {
        linker.func_wrap(ENV_MODULE, name, move |x: f64| -> f64 { op(x) })?;
    }
    linker.func_wrap(ENV_MODULE, "fabs", |x: f64| -> f64 { x.abs() })?;
    linker.func_wrap(ENV_MODULE, "atan2", |y: f64, x: f64| -> f64 { y.atan2(x) })?;
    linker.func_wrap(ENV_MODULE, "pow", |x: f64, y: f64| -> f64 { x.powf(y) })?;
    linker.func_wrap(ENV_MODULE, "fmod", |x: f64, y: f64| -> f64 { x % y })?;

    let unary_f32: [(&str, fn(f32) -> f32); 6] = [
        ("sinf", f32::sin),
        ("cosf", f32::cos),
        ("tanf", f32::tan),
        ("expf", f32::exp),
        ("logf", f32::ln),
        ("sqrtf", f32::sqrt),
    ];
    for (name, op) in unary_f32 {
        linker.func_wrap(ENV_MODULE, name, move |x: f32| -> f32 { op(x) })?;
    }
    linker.func_wrap(ENV_MODULE, "powf", |x: f32, y: f32| -> f32 { x.powf(y) })?;
    linker.func_wrap(ENV_MODULE, "atan2f", |y: f32, x: f32| -> f32 { y.atan2(x) })?;
    linker.func_wrap(ENV_MODULE, "fmodf", |x: f32, y: f32| -> f32 { x % y })?;

    Ok(())
}

/// Run one syscall with a fresh memory view.
fn with_wasi(
    caller: &mut Caller<'_, HostSession>,
    call: impl FnOnce(&mut SyscallLayer, &mut CallContext<'_>) -> Result<(), Errno>,
) -> wasmtime::Result<i32> {
    let (memory, session) = guest_view(caller)?;
    let (syscalls, sink) = session.split();
    let mut cx = CallContext::new(memory, sink);
    Ok(Errno::from_result(call(syscalls, &mut cx)))
}

/// Register the WASI Preview 1 functions under `module`.
fn register_wasi_functions(linker: &mut Linker<HostSession>, module: &str) -> wasmtime::Result<()> {
    linker.func_wrap(
        module,
        "args_sizes_get",
        |mut caller: Caller<'_, HostSession>, argc: i32, size: i32| {
            with_wasi(&mut caller, |sys, cx| sys.args_sizes_get(cx, argc as u32, size as u32))
        },
    )?;
    linker.func_wrap(
        module,
        "args_get",
        |mut caller: Caller<'_, HostSession>, argv: i32, buf: i32| {
            with_wasi(&mut caller, |sys, cx| sys.args_get(cx, argv as u32, buf as u32))
        },
    )?;
    linker.func_wrap(
        module,
        "environ_sizes_get",
        |mut caller: Caller<'_, HostSession>, count: i32, size: i32| {
            with_wasi(&mut caller, |sys, cx| sys.environ_sizes_get(cx, count as u32, size as u32))
        },
    )?;
    linker.func_wrap(
        module,
        "environ_get",
        |mut caller: Caller<'_, HostSession>, environ: i32, buf: i32| {
            with_wasi(&mut caller, |sys, cx| sys.environ_get(cx, environ as u32, buf as u32))
        },
    )?;
    linker.func_wrap(
        module,
        "clock_time_get",
        |mut caller: Caller<'_, HostSession>, id: i32, precision: i64, time: i32| {
            with_wasi(&mut caller, |sys, cx| {
                sys.clock_time_get(cx, id as u32, precision as u64, time as u32)
            })
        },
    )?;
    linker.func_wrap(
        module,
        "fd_prestat_get",
        |mut caller: Caller<'_, HostSession>, fd: i32, prestat: i32| {
            with_wasi(&mut caller, |sys, cx| sys.fd_prestat_get(cx, fd as u32, prestat as u32))
        },
    )?;
    linker.func_wrap(
        module,
        "fd_prestat_dir_name",
        |mut caller: Caller<'_, HostSession>, fd: i32, path: i32, len: i32| {
            with_wasi(&mut caller, |sys, cx| {
                sys.fd_prestat_dir_name(cx, fd as u32, path as u32, len as u32)
            })
        },
    )?;
    linker.func_wrap(
        module,
        "fd_fdstat_get",
        |mut caller: Caller<'_, HostSession>, fd: i32, stat: i32| {
            with_wasi(&mut caller, |sys, cx| sys.fd_fdstat_get(cx, fd as u32, stat as u32))
        },
    )?;
    linker.func_wrap(
        module,
        "fd_fdstat_set_flags",
        |mut caller: Caller<'_, HostSession>, fd: i32, flags: i32| {
            with_wasi(&mut caller, |sys, cx| sys.fd_fdstat_set_flags(cx, fd as u32, flags as u32))
        },
    )?;
    linker.func_wrap(
        module,
        "path_open",
        |mut caller: Caller<'_, HostSession>,
         dirfd: i32,
         dirflags: i32,
         path: i32,
         path_len: i32,
         oflags: i32,
         rights_base: i64,
         rights_inheriting: i64,
         fdflags: i32,
         opened_fd: i32| {
            with_wasi(&mut caller, |sys, cx| {
                sys.path_open(
                    cx,
                    dirfd as u32,
                    dirflags as u32,
                    path as u32,
                    path_len as u32,
                    oflags as u32,
                    rights_base as u64,
                    rights_inheriting as u64,
                    fdflags as u32,
                    opened_fd as u32,
                )
            })
        },
    )?;
    linker.func_wrap(
        module,
        "fd_read",
        |mut caller: Caller<'_, HostSession>, fd: i32, iovs: i32, iovs_len: i32, nread: i32| {
            with_wasi(&mut caller, |sys, cx| {
                sys.fd_read(cx, fd as u32, iovs as u32, iovs_len as u32, nread as u32)
            })
        },
    )?;
    linker.func_wrap(
        module,
        "fd_seek",
        |mut caller: Caller<'_, HostSession>, fd: i32, offset: i64, whence: i32, newoffset: i32| {
            with_wasi(&mut caller, |sys, cx| {
                sys.fd_seek(cx, fd as u32, offset, whence as u32, newoffset as u32)
            })
        },
    )?;
    linker.func_wrap(
        module,
        "fd_write",
        |mut caller: Caller<'_, HostSession>, fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| {
            with_wasi(&mut caller, |sys, cx| {
                sys.fd_write(cx, fd as u32, iovs as u32, iovs_len as u32, nwritten as u32)
            })
        },
    )?;
    linker.func_wrap(
        module,
        "fd_close",
        |mut caller: Caller<'_, HostSession>, fd: i32| {
            with_wasi(&mut caller, |sys, cx| sys.fd_close(cx, fd as u32))
        },
    )?;
    linker.func_wrap(
        module,
        "proc_exit",
        |mut caller: Caller<'_, HostSession>, code: i32| -> wasmtime::Result<()> {
            let session = caller.data_mut();
            let fault = session.syscalls.proc_exit(code);
            Err(session.raise(fault))
        },
    )?;
    Ok(())
}

/// Register the frame and shutdown hook setters.
fn register_loop_functions(linker: &mut Linker<HostSession>) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        "wajs_set_main_loop",
        |mut caller: Caller<'_, HostSession>, callback: i32| {
            log::debug!("[wajs] main loop callback = table[{}]", callback);
            caller.data_mut().hooks.main_loop = Some(callback as u32);
        },
    )?;
    linker.func_wrap(
        ENV_MODULE,
        "wajs_set_shutdown",
        |mut caller: Caller<'_, HostSession>, callback: i32| {
            log::debug!("[wajs] shutdown callback = table[{}]", callback);
            caller.data_mut().hooks.shutdown = Some(callback as u32);
        },
    )?;
    Ok(())
}
