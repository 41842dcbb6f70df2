// 📝 Logging - console plus one plain-text log file per run
//
// The file is named after the run id so the consolidation archive can ship
// exactly this run's log. RUST_LOG overrides the configured level.

use crate::error::{ConsolidationError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    pub log_dir: PathBuf,
    pub run_id: String,
    /// Also log to stderr
    pub console: bool,
}

impl LogConfig {
    pub fn new(log_dir: impl Into<PathBuf>, run_id: &str) -> Self {
        LogConfig {
            level: "info".to_string(),
            log_dir: log_dir.into(),
            run_id: run_id.to_string(),
            console: true,
        }
    }

    pub fn file_name(&self) -> String {
        format!("run-{}.log", self.run_id)
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(self.file_name())
    }
}

/// Install the global subscriber. Returns the run's log file path.
pub fn init_logging(config: &LogConfig) -> Result<PathBuf> {
    std::fs::create_dir_all(&config.log_dir)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ConsolidationError::Config(format!("invalid log filter '{}': {}", config.level, e)))?;

    // Written synchronously so the file is complete when it is archived
    let file_appender = tracing_appender::rolling::never(&config.log_dir, config.file_name());
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_ansi(false);

    let console_layer = config.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| ConsolidationError::Config(format!("logging already initialized: {}", e)))?;

    Ok(config.log_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_uses_run_id() {
        let config = LogConfig::new("/tmp/logs", "abc-123");
        assert_eq!(config.log_path(), PathBuf::from("/tmp/logs/run-abc-123.log"));
        assert_eq!(config.level, "info");
    }
}
