//! Process-wide tracing setup.
//!
//! The binary calls [`init_logging`] once. `log` records from the storage
//! layer are forwarded into the same subscriber.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Console,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `bulkrun=debug,r2d2=warn`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Console,
        }
    }
}

impl LoggingConfig {
    /// Reads `RUST_LOG` (default `info`) and `BULKRUN_LOG_FORMAT`
    /// (`json` or anything else for console output).
    pub fn from_env() -> Self {
        let filter = std::env::var("RUST_LOG")
            .ok()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());

        let format = std::env::var("BULKRUN_LOG_FORMAT").map_or(LogFormat::Console, |f| {
            match f.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Console,
            }
        });

        Self { filter, format }
    }
}

/// Installs the global subscriber and the `log` bridge.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match config.format {
        LogFormat::Console => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    tracing_log::LogTracer::init()?;
    tracing::subscriber::set_global_default(subscriber)?;

    tracing::debug!(filter = %config.filter, format = ?config.format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.filter, "info");
        assert_eq!(config.format, LogFormat::Console);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("RUST_LOG", "bulkrun=debug");
        std::env::set_var("BULKRUN_LOG_FORMAT", "JSON");
        let config = LoggingConfig::from_env();
        std::env::remove_var("RUST_LOG");
        std::env::remove_var("BULKRUN_LOG_FORMAT");

        assert_eq!(config.filter, "bulkrun=debug");
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        std::env::remove_var("RUST_LOG");
        std::env::set_var("BULKRUN_LOG_FORMAT", "pretty");
        let config = LoggingConfig::from_env();
        std::env::remove_var("BULKRUN_LOG_FORMAT");

        assert_eq!(config.filter, "info");
        assert_eq!(config.format, LogFormat::Console);
    }
}
