use std::io::IsTerminal;

use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive for the verbosity picked on the command line.
fn directive(level: log::LevelFilter) -> String {
    level.as_str().to_ascii_lowercase()
}

/// Install the stderr subscriber. `RUST_LOG` wins over `-v`; later calls
/// are ignored.
///
/// The runtime logs through `log`; the subscriber's `tracing-log` bridge
/// picks those records up.
pub fn init(level: log::LevelFilter) {
    let use_ansi = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive(level)));
    let installed = fmt()
        .with_env_filter(filter)
        .with_ansi(use_ansi)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
    if installed.is_err() {
        log::debug!("[wajs] logger already installed");
    }
}
