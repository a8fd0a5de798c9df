use std::path::PathBuf;
use std::process::ExitCode;

use wajs_runtime::{FaultCategory, HostFault, RuntimeError};

/// Errors that end a `wajs-run` invocation.
///
/// Setup errors (exit code 2) happen before the module gets to run; faults
/// come from the module itself.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("bad config {path}: {source}")]
    Config {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl RunError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            RunError::Runtime(RuntimeError::Fault(fault)) => fault_exit_code(fault),
            RunError::Runtime(RuntimeError::Aborted) => ExitCode::from(1),
            _ => ExitCode::from(2),
        }
    }
}

/// A guest `proc_exit(n)` exits the runner with `n`; any other fault with 1.
pub fn fault_exit_code(fault: &HostFault) -> ExitCode {
    match fault.category {
        FaultCategory::Exit(code) => ExitCode::from((code & 0xff) as u8),
        _ => ExitCode::from(1),
    }
}
