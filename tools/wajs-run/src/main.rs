mod cli;
mod config;
mod error;
mod logger;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use wajs_runtime::backing::{DirBacking, HttpBacking};
use wajs_runtime::{ModuleHost, RuntimeError};

use crate::cli::Cli;
use crate::config::RunnerConfig;
use crate::error::{fault_exit_code, RunError};

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init(cli.log_level());

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            // Faults were already reported through the session's sink.
            if !matches!(e, RunError::Runtime(RuntimeError::Fault(_))) {
                eprintln!("wajs-run: {}", e);
            }
            e.exit_code()
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, RunError> {
    let mut config = match &cli.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    };
    if !cli.args.is_empty() {
        config.runtime.args = std::iter::once(program_name(&cli.module))
            .chain(cli.args.iter().cloned())
            .collect();
    }
    let frames = cli.frames.or(config.frames);
    let interval = Duration::from_millis(config.runtime.frame_interval_ms);
    let timeout = Duration::from_millis(config.runtime.open_timeout_ms);

    let bytes = std::fs::read(&cli.module).map_err(|source| RunError::Read {
        path: cli.module.clone(),
        source,
    })?;

    let builder = ModuleHost::builder(config.runtime);
    // Flags beat the config file; a directory beats a URL from the same source.
    let source = match (cli.files, cli.url) {
        (None, None) => (config.files, config.url),
        flags => flags,
    };
    let builder = match source {
        (Some(dir), _) => builder.backing(DirBacking::new(dir)),
        (None, Some(url)) => builder.backing(HttpBacking::new(&url, timeout)),
        (None, None) => builder.backing(DirBacking::new(module_dir(&cli.module))),
    };

    let mut host = builder.load(&bytes)?;
    host.start()?;
    let ran = host.run_loop(frames, interval)?;
    log::info!("[wajs] {} frames", ran);
    host.shutdown()?;

    Ok(match host.fault() {
        Some(fault) => fault_exit_code(fault),
        None => ExitCode::SUCCESS,
    })
}

/// `args[0]` for the module: its file stem.
fn program_name(module: &Path) -> String {
    module
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("wasm.exe"))
}

fn module_dir(module: &Path) -> PathBuf {
    match module.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
