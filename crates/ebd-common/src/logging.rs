//! Tracing subscriber setup shared by the pipeline binaries
//!
//! Events go to stderr, and additionally to a file when `LOG_FILE` is set so
//! a multi-hour aggregation leaves a record behind. stdout stays reserved for
//! command output such as run summaries.
//!
//! ```no_run
//! use ebd_common::logging::{init_logging, LogConfig};
//!
//! let config = LogConfig::from_env().unwrap_or_default();
//! init_logging(&config).ok();
//! tracing::info!(stage = "aggregate", "stage started");
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

// sqlx logs every statement at info; batch inserts would drown the run log
const DEFAULT_DIRECTIVES: &str = "sqlx=warn";

/// Minimum level of emitted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append events here as well as to stderr
    pub log_file: Option<PathBuf>,
    /// Per-target directives such as "sqlx=warn,aws_smithy_runtime=info"
    pub filter_directives: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_file: None,
            filter_directives: DEFAULT_DIRECTIVES.to_string(),
        }
    }
}

impl LogConfig {
    /// Read `LOG_LEVEL`, `LOG_FILE` and `LOG_FILTER`
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(level) = var("LOG_LEVEL") {
            config.level = level.parse()?;
        }
        config.log_file = var("LOG_FILE")
            .filter(|f| !f.trim().is_empty())
            .map(PathBuf::from);
        if let Some(filter) = var("LOG_FILTER") {
            config.filter_directives = filter;
        }
        Ok(config)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::builder()
            .with_default_directive(Level::from(self.level).into())
            .from_env_lossy();

        for directive in self.filter_directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Failed to parse filter directive '{}'", directive))?,
            );
        }
        Ok(filter)
    }
}

fn file_layer(path: &Path) -> Result<BoxedLayer> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    // The writer thread stops when the guard drops; it has to live as long as the process.
    std::mem::forget(guard);

    Ok(fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .boxed())
}

/// Install the global tracing subscriber
///
/// Fails if a subscriber is already installed or the filter directives are
/// malformed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let mut layers: Vec<BoxedLayer> = vec![fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE)
        .boxed()];

    if let Some(path) = &config.log_file {
        layers.push(file_layer(path)?);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("TRACE".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" error ".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_defaults_quiet_sqlx() {
        let config = LogConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config, LogConfig::default());
        assert_eq!(config.filter_directives, "sqlx=warn");
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_vars_override_defaults() {
        let config = LogConfig::from_vars(vars(&[
            ("LOG_LEVEL", "debug"),
            ("LOG_FILE", "/var/log/ebd/run.log"),
            ("LOG_FILTER", "reqwest=info"),
        ]))
        .unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/ebd/run.log")));
        assert_eq!(config.filter_directives, "reqwest=info");

        let blank = LogConfig::from_vars(vars(&[("LOG_FILE", " ")])).unwrap();
        assert_eq!(blank.log_file, None);
        assert!(LogConfig::from_vars(vars(&[("LOG_LEVEL", "loud")])).is_err());
    }

    #[test]
    fn test_bad_directive_is_rejected() {
        let config = LogConfig {
            filter_directives: "sqlx=notalevel".to_string(),
            ..Default::default()
        };
        assert!(config.env_filter().is_err());
    }

    #[test]
    fn test_file_layer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/run.log");
        file_layer(&path).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}
