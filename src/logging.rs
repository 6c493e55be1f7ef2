//! Tracing setup for the binary.
//!
//! Logs go to stderr (stdout is reserved for command output) or, when
//! `[logging] file` is set, to that file through a non-blocking writer.
//! `RUST_LOG` wins over the configured level.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// The `[logging]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit one JSON object per line.
    #[serde(default)]
    pub json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
        }
    }
}

/// Held for the life of the process so the file writer flushes on exit.
static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Level names `EnvFilter` accepts; anything else falls back to `warn`.
pub fn normalize_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" => "error",
        "off" => "off",
        _ => "warn",
    }
}

fn make_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(normalize_level(level)))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Split `path` into the directory and file name `tracing-appender` wants.
fn file_target(path: &Path) -> Option<(PathBuf, PathBuf)> {
    let name = path.file_name()?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Some((dir, PathBuf::from(name)))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    LOG_GUARD.get_or_init(|| {
        let file = config.file.as_deref().and_then(file_target).and_then(|(dir, name)| {
            std::fs::create_dir_all(&dir).ok()?;
            Some(tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name)))
        });

        let builder = tracing_subscriber::fmt()
            .with_env_filter(make_filter(&config.level))
            .with_target(true);
        let guard = match (config.json, file) {
            (true, Some((writer, guard))) => {
                let _ = builder.json().with_ansi(false).with_writer(writer).try_init();
                Some(guard)
            }
            (false, Some((writer, guard))) => {
                let _ = builder.with_ansi(false).with_writer(writer).try_init();
                Some(guard)
            }
            (true, None) => {
                let _ = builder.json().with_writer(std::io::stderr).try_init();
                None
            }
            (false, None) => {
                let _ = builder.with_writer(std::io::stderr).try_init();
                None
            }
        };

        tracing::debug!(
            level = normalize_level(&config.level),
            json = config.json,
            file = config.file.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "(stderr)".into()),
            "Logging initialized"
        );
        guard
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("DEBUG"), "debug");
        assert_eq!(normalize_level(" warning "), "warn");
        assert_eq!(normalize_level("verbose"), "warn");
    }

    #[test]
    fn test_file_target() {
        assert_eq!(
            file_target(Path::new("logs/planwright.log")),
            Some((PathBuf::from("logs"), PathBuf::from("planwright.log")))
        );
        assert_eq!(
            file_target(Path::new("planwright.log")),
            Some((PathBuf::from("."), PathBuf::from("planwright.log")))
        );
        assert_eq!(file_target(Path::new("/")), None);
    }

    #[test]
    fn test_init_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: "debug".into(),
            json: true,
            file: Some(dir.path().join("nested").join("run.log")),
        };
        init(&config);
        init(&LoggingConfig::default());
        assert!(LOG_GUARD.get().is_some());
    }

    #[test]
    fn test_config_defaults_from_toml() {
        let config: LoggingConfig = toml::from_str("json = true").unwrap();
        assert_eq!(config.level, "warn");
        assert!(config.json);
        assert!(config.file.is_none());
    }
}
