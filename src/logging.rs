//! Structured logging setup
//!
//! Provides JSON-formatted and human-readable logging with optional file
//! output. `RUST_LOG` takes precedence over the configured level.

use crate::config::LoggingConfig;
use anyhow::Result;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging based on configuration.
///
/// Sets up structured logging with support for both JSON and human-readable
/// formats, with optional file output in addition to STDOUT.
///
/// # Arguments
///
/// * `config` - Logging configuration
///
/// # Errors
///
/// Returns an error if the level is invalid, the log file cannot be opened
/// or a global subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use changeprop::config::LoggingConfig;
/// use changeprop::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     json_format: true,
///     file_path: None,
/// };
///
/// init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(&config.level)?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let file = match &config.file_path {
        Some(path) => Some(Arc::new(
            OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => None,
    };

    if config.json_format {
        let stdout_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true);
        let file_layer = file.map(|file| {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(file)
        });
        registry.with(stdout_layer).with(file_layer).try_init()?;
    } else {
        let stdout_layer = fmt::layer().with_target(true).with_level(true);
        let file_layer = file.map(|file| {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(file)
        });
        registry.with(stdout_layer).with(file_layer).try_init()?;
    }

    Ok(())
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.json_format);
        assert_eq!(config.file_path, None);
    }

    #[test]
    fn test_build_filter_accepts_directives() {
        assert!(build_filter("debug").is_ok());
        assert!(build_filter("changeprop=trace,rdkafka=warn").is_ok());
    }

    #[test]
    fn test_unwritable_log_file_is_error() {
        let config = LoggingConfig {
            level: "info".to_string(),
            json_format: false,
            file_path: Some("/nonexistent-dir/changeprop.log".into()),
        };
        assert!(init_logging(&config).is_err());
    }
}
