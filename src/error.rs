//! Error types for changeprop
//!
//! This module defines the crate-level error taxonomy using `thiserror`.
//! Narrow subsystems (rule compilation, the broker layer, execution)
//! carry their own enums and convert into [`ChangepropError`] at the
//! boundary.

use thiserror::Error;

/// Main error type for changeprop operations
///
/// Covers configuration loading, payload decoding, downstream HTTP
/// failures, broker failures and internal pipeline faults.
#[derive(Error, Debug)]
pub enum ChangepropError {
    /// Configuration-related errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be decoded as structured data
    #[error("Parse error: {0}")]
    Parse(String),

    /// A derived HTTP request failed
    #[error("Downstream error ({status}): {message}")]
    Downstream {
        /// HTTP status returned by the downstream service
        status: u16,
        /// Short description of the failure
        message: String,
        /// Raw response body, if it could be decoded
        body: Option<String>,
    },

    /// Anything that did not originate from a downstream call
    #[error("Internal error: {0}")]
    Internal(String),

    /// Broker-level failure
    #[error("Broker error: {0}")]
    Broker(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for changeprop operations
///
/// Uses `anyhow::Error` so callers can attach context while propagating.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = ChangepropError::Config("missing topic".to_string());
        assert_eq!(error.to_string(), "Configuration error: missing topic");
    }

    #[test]
    fn test_downstream_error_display() {
        let error = ChangepropError::Downstream {
            status: 503,
            message: "service unavailable".to_string(),
            body: None,
        };
        assert_eq!(
            error.to_string(),
            "Downstream error (503): service unavailable"
        );
    }

    #[test]
    fn test_internal_error_display() {
        let error = ChangepropError::Internal("bad state".to_string());
        assert_eq!(error.to_string(), "Internal error: bad state");
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let error: ChangepropError = json_error.into();
        assert!(matches!(error, ChangepropError::Serialization(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: : yaml").unwrap_err();
        let error: ChangepropError = yaml_error.into();
        assert!(matches!(error, ChangepropError::Yaml(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ChangepropError>();
    }
}
