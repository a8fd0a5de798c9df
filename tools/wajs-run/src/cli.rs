use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Run a WAJS module on the host runtime.
#[derive(Parser, Debug)]
#[command(name = "wajs-run", version, about)]
pub struct Cli {
    /// Module to run.
    pub module: PathBuf,

    /// TOML runtime configuration.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Serve file opens from this directory (defaults to the module's directory).
    #[arg(long, conflicts_with = "url")]
    pub files: Option<PathBuf>,

    /// Serve file opens from an HTTP file server at this base URL.
    #[arg(long)]
    pub url: Option<String>,

    /// Stop after this many frames.
    #[arg(long)]
    pub frames: Option<u64>,

    /// More log output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Arguments passed to the module after its program name.
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl Cli {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_command_line() {
        let cli = Cli::try_parse_from([
            "wajs-run", "game.wasm", "--files", "assets", "--frames", "10", "-vv", "--", "--level", "3",
        ])
        .unwrap();
        assert_eq!(cli.module, PathBuf::from("game.wasm"));
        assert_eq!(cli.files, Some(PathBuf::from("assets")));
        assert_eq!(cli.frames, Some(10));
        assert_eq!(cli.log_level(), log::LevelFilter::Debug);
        assert_eq!(cli.args, vec!["--level", "3"]);
    }

    #[test]
    fn test_files_and_url_conflict() {
        let result = Cli::try_parse_from([
            "wajs-run", "game.wasm", "--files", "assets", "--url", "http://localhost:8080",
        ]);
        assert!(result.is_err());
    }
}
