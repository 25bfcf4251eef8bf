//! Logging setup for the lodestar CLI
//!
//! Console output always; a daily-rolling `lodestar.log` when a log directory
//! is configured and file logging is enabled. `RUST_LOG` takes precedence over
//! the configured level on every layer.
//!
//! Environment overrides: `LODESTAR_LOG_DIR`, `LODESTAR_LOG_LEVEL`,
//! `LODESTAR_LOG_FILE`.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::LoggingSection;

const LOG_FILE_NAME: &str = "lodestar.log";

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: Level,
    /// File logging is skipped without a directory
    pub log_dir: Option<PathBuf>,
    pub file_logging: bool,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_dir: None,
            file_logging: false,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Create from the `[logging]` config section. Unknown levels fall back to INFO.
    pub fn from_section(section: &LoggingSection) -> Self {
        Self {
            level: section.level.parse().unwrap_or(Level::INFO),
            log_dir: section.dir.as_ref().map(PathBuf::from),
            file_logging: section.file,
            rotation: LogRotation::Daily,
        }
    }

    /// Apply `LODESTAR_LOG_*` environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("LODESTAR_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = lookup("LODESTAR_LOG_LEVEL").and_then(|v| v.parse().ok()) {
            self.level = level;
        }
        if let Some(file) = lookup("LODESTAR_LOG_FILE") {
            self.file_logging = file.to_lowercase() == "true" || file == "1";
        }
        self
    }

    fn file_dir(&self) -> Option<&PathBuf> {
        self.log_dir.as_ref().filter(|_| self.file_logging)
    }
}

/// Keeps the non-blocking file writer alive; dropping it flushes buffered output.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(env_filter(config.level));
    layers.push(Box::new(console_layer));

    let mut file_guard = None;
    if let Some(dir) = config.file_dir() {
        std::fs::create_dir_all(dir)?;
        let appender = RollingFileAppender::new(config.rotation.into(), dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_filter(env_filter(config.level));
        layers.push(Box::new(file_layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if let Some(dir) = config.file_dir() {
        tracing::debug!(log_dir = %dir.display(), "File logging initialized");
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_from_section() {
        let section = LoggingSection {
            level: "debug".to_string(),
            dir: Some("/var/log/lodestar".to_string()),
            file: true,
        };

        let config = LoggingConfig::from_section(&section);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.file_dir(), Some(&PathBuf::from("/var/log/lodestar")));
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let section = LoggingSection {
            level: "chatty".to_string(),
            ..LoggingSection::default()
        };
        assert_eq!(LoggingConfig::from_section(&section).level, Level::INFO);
    }

    #[test]
    fn test_file_logging_needs_dir_and_flag() {
        let mut config = LoggingConfig::default();
        assert!(config.file_dir().is_none());

        config.file_logging = true;
        assert!(config.file_dir().is_none());

        config.log_dir = Some(PathBuf::from("/tmp/lodestar"));
        assert!(config.file_dir().is_some());
    }

    #[test]
    fn test_env_overrides() {
        let config = LoggingConfig::default().with_overrides(lookup(&[
            ("LODESTAR_LOG_DIR", "/srv/logs"),
            ("LODESTAR_LOG_LEVEL", "warn"),
            ("LODESTAR_LOG_FILE", "TRUE"),
        ]));

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.file_dir(), Some(&PathBuf::from("/srv/logs")));
    }

    #[test]
    fn test_bad_env_level_is_ignored() {
        let config = LoggingConfig {
            level: Level::DEBUG,
            ..LoggingConfig::default()
        }
        .with_overrides(lookup(&[("LODESTAR_LOG_LEVEL", "loud"), ("LODESTAR_LOG_FILE", "0")]));

        assert_eq!(config.level, Level::DEBUG);
        assert!(!config.file_logging);
    }

    #[test]
    fn test_rotation_conversion() {
        assert_eq!(Rotation::from(LogRotation::Daily), Rotation::DAILY);
        assert_eq!(Rotation::from(LogRotation::Hourly), Rotation::HOURLY);
        assert_eq!(Rotation::from(LogRotation::Never), Rotation::NEVER);
    }
}
