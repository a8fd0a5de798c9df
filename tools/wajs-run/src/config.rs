use std::path::{Path, PathBuf};

use serde::Deserialize;
use wajs_runtime::RuntimeConfig;

use crate::error::RunError;

/// Contents of a `--config` file: the runtime settings plus runner defaults
/// that command line flags override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
    /// Frame limit.
    pub frames: Option<u64>,
    /// Directory file opens are served from.
    pub files: Option<PathBuf>,
    /// Base URL of an HTTP file server.
    pub url: Option<String>,
}

impl RunnerConfig {
    pub fn parse(text: &str, path: &Path) -> Result<Self, RunError> {
        toml::from_str(text).map_err(|source| RunError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, RunError> {
        let text = std::fs::read_to_string(path).map_err(|source| RunError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_runner_config() {
        let config = RunnerConfig::parse(
            r#"
            args = ["demo", "--fast"]
            heap_limit = 16777216
            frames = 120
            url = "http://127.0.0.1:8080"

            [env]
            LANG = "C"
            "#,
            Path::new("wajs.toml"),
        )
        .unwrap();
        assert_eq!(config.runtime.args, vec!["demo", "--fast"]);
        assert_eq!(config.runtime.heap_limit, 16_777_216);
        assert_eq!(config.runtime.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(config.runtime.entry_point, "_start");
        assert_eq!(config.frames, Some(120));
        assert_eq!(config.url.as_deref(), Some("http://127.0.0.1:8080"));
    }

    #[test]
    fn test_bad_config_is_reported() {
        let err = RunnerConfig::parse("heap_limit = \"lots\"", Path::new("wajs.toml")).unwrap_err();
        assert!(matches!(err, RunError::Config { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wajs.toml");
        std::fs::write(&path, "frames = 3\n").unwrap();
        assert_eq!(RunnerConfig::load(&path).unwrap().frames, Some(3));

        let missing = RunnerConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, RunError::Read { .. }));
    }
}
