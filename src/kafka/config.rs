//! Kafka client configuration.
//!
//! This module turns the `kafka` section of the configuration file into
//! librdkafka key-value settings for consumers, the producer and the
//! metadata client, with support for SASL/SCRAM and TLS.
//!
//! # Example
//!
//! ```rust
//! use changeprop::kafka::KafkaClientConfig;
//!
//! let config = KafkaClientConfig::new("localhost:9092", "change-prop")
//!     .with_sasl_scram_sha512("username", "password");
//! let settings = config.consumer_settings("change-prop-purge");
//! assert!(settings.contains(&("group.id".to_string(), "change-prop-purge".to_string())));
//! ```

use std::time::Duration;
use thiserror::Error;

use crate::config::KafkaConfig;

/// Errors that can occur while building client settings.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Missing required configuration value.
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    /// Invalid security protocol specified.
    #[error("Invalid security protocol: {0}")]
    InvalidSecurityProtocol(String),

    /// Invalid SASL mechanism specified.
    #[error("Invalid SASL mechanism: {0}")]
    InvalidSaslMechanism(String),
}

/// Security protocol for Kafka connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SecurityProtocol {
    /// No encryption or authentication.
    #[default]
    Plaintext,
    /// TLS encryption without SASL.
    Ssl,
    /// SASL authentication without TLS.
    SaslPlaintext,
    /// SASL authentication with TLS encryption.
    SaslSsl,
}

impl SecurityProtocol {
    /// Returns the Kafka configuration string for this protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }

    /// Parses a protocol name (case insensitive).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSecurityProtocol` for unknown names.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.to_uppercase().as_str() {
            "PLAINTEXT" => Ok(Self::Plaintext),
            "SSL" => Ok(Self::Ssl),
            "SASL_PLAINTEXT" => Ok(Self::SaslPlaintext),
            "SASL_SSL" => Ok(Self::SaslSsl),
            _ => Err(ConfigError::InvalidSecurityProtocol(name.to_string())),
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SaslMechanism {
    /// PLAIN mechanism (username/password in clear text).
    Plain,
    /// SCRAM-SHA-256 mechanism.
    #[default]
    ScramSha256,
    /// SCRAM-SHA-512 mechanism.
    ScramSha512,
}

impl SaslMechanism {
    /// Returns the Kafka configuration string for this mechanism.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }

    /// Parses a mechanism name (case insensitive).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSaslMechanism` for unknown names.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.to_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            "SCRAM-SHA-512" => Ok(Self::ScramSha512),
            _ => Err(ConfigError::InvalidSaslMechanism(name.to_string())),
        }
    }
}

/// SASL authentication configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslConfig {
    /// Authentication mechanism to use.
    pub mechanism: SaslMechanism,
    /// SASL username.
    pub username: String,
    /// SASL password.
    pub password: String,
}

/// SSL/TLS configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslConfig {
    /// Path to CA certificate file.
    pub ca_location: Option<String>,
    /// Path to client certificate file (for mTLS).
    pub certificate_location: Option<String>,
    /// Path to client key file (for mTLS).
    pub key_location: Option<String>,
}

/// Connection settings shared by every client of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaClientConfig {
    /// Kafka broker addresses (comma-separated).
    pub brokers: String,

    /// Client id prefix.
    pub client_id: String,

    /// Security protocol for the connection.
    pub security_protocol: SecurityProtocol,

    /// SASL configuration (required for SASL protocols).
    pub sasl_config: Option<SaslConfig>,

    /// SSL configuration.
    pub ssl_config: Option<SslConfig>,

    /// Consumer session timeout.
    pub session_timeout: Duration,
}

impl KafkaClientConfig {
    /// Creates plaintext settings for `brokers`.
    ///
    /// # Arguments
    ///
    /// * `brokers` - Comma-separated list of Kafka broker addresses
    /// * `client_id` - Prefix used for librdkafka `client.id`
    pub fn new(brokers: &str, client_id: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            client_id: client_id.to_string(),
            security_protocol: SecurityProtocol::default(),
            sasl_config: None,
            ssl_config: None,
            session_timeout: Duration::from_secs(30),
        }
    }

    /// Configures SASL/SCRAM-SHA-256 authentication over TLS.
    pub fn with_sasl_scram_sha256(mut self, username: &str, password: &str) -> Self {
        self.security_protocol = SecurityProtocol::SaslSsl;
        self.sasl_config = Some(SaslConfig {
            mechanism: SaslMechanism::ScramSha256,
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Configures SASL/SCRAM-SHA-512 authentication over TLS.
    pub fn with_sasl_scram_sha512(mut self, username: &str, password: &str) -> Self {
        self.security_protocol = SecurityProtocol::SaslSsl;
        self.sasl_config = Some(SaslConfig {
            mechanism: SaslMechanism::ScramSha512,
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Configures TLS with a CA certificate.
    pub fn with_ssl(mut self, ca_location: &str) -> Self {
        self.ssl_config = Some(SslConfig {
            ca_location: Some(ca_location.to_string()),
            certificate_location: None,
            key_location: None,
        });
        self
    }

    /// Builds client settings from the `kafka` configuration section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSecurityProtocol` or
    /// `ConfigError::InvalidSaslMechanism` for unknown names, and
    /// `ConfigError::MissingConfig` when a SASL protocol lacks credentials.
    pub fn from_settings(kafka: &KafkaConfig) -> Result<Self, ConfigError> {
        let mut config = Self::new(&kafka.brokers, &kafka.group_prefix);
        config.session_timeout = Duration::from_millis(kafka.session_timeout_ms);

        let Some(security) = &kafka.security else {
            return Ok(config);
        };
        config.security_protocol = SecurityProtocol::parse(&security.protocol)?;

        if config.security_protocol.uses_sasl() {
            let username = security
                .sasl_username
                .clone()
                .ok_or_else(|| ConfigError::MissingConfig("kafka.security.sasl_username".into()))?;
            let password = security
                .sasl_password
                .clone()
                .ok_or_else(|| ConfigError::MissingConfig("kafka.security.sasl_password".into()))?;
            let mechanism = security
                .sasl_mechanism
                .as_deref()
                .map(SaslMechanism::parse)
                .transpose()?
                .unwrap_or_default();
            config.sasl_config = Some(SaslConfig {
                mechanism,
                username,
                password,
            });
        }

        if security.ssl_ca_location.is_some()
            || security.ssl_certificate_location.is_some()
            || security.ssl_key_location.is_some()
        {
            config.ssl_config = Some(SslConfig {
                ca_location: security.ssl_ca_location.clone(),
                certificate_location: security.ssl_certificate_location.clone(),
                key_location: security.ssl_key_location.clone(),
            });
        }

        Ok(config)
    }

    /// Settings shared by consumers, the producer and the metadata client.
    pub fn base_settings(&self) -> Vec<(String, String)> {
        let mut settings = vec![
            ("bootstrap.servers".to_string(), self.brokers.clone()),
            (
                "security.protocol".to_string(),
                self.security_protocol.as_str().to_string(),
            ),
        ];

        if let Some(sasl) = &self.sasl_config {
            settings.push((
                "sasl.mechanism".to_string(),
                sasl.mechanism.as_str().to_string(),
            ));
            settings.push(("sasl.username".to_string(), sasl.username.clone()));
            settings.push(("sasl.password".to_string(), sasl.password.clone()));
        }

        if let Some(ssl) = &self.ssl_config {
            if let Some(ca) = &ssl.ca_location {
                settings.push(("ssl.ca.location".to_string(), ca.clone()));
            }
            if let Some(cert) = &ssl.certificate_location {
                settings.push(("ssl.certificate.location".to_string(), cert.clone()));
            }
            if let Some(key) = &ssl.key_location {
                settings.push(("ssl.key.location".to_string(), key.clone()));
            }
        }

        settings
    }

    /// Settings for a consumer in `group_id`.
    ///
    /// Offsets are committed manually and new groups start at the latest
    /// offset.
    pub fn consumer_settings(&self, group_id: &str) -> Vec<(String, String)> {
        let mut settings = self.base_settings();
        settings.extend([
            ("group.id".to_string(), group_id.to_string()),
            ("client.id".to_string(), format!("{}-{}", self.client_id, group_id)),
            ("enable.auto.commit".to_string(), "false".to_string()),
            ("auto.offset.reset".to_string(), "latest".to_string()),
            ("enable.partition.eof".to_string(), "false".to_string()),
            (
                "session.timeout.ms".to_string(),
                self.session_timeout.as_millis().to_string(),
            ),
        ]);
        settings
    }

    /// Settings for the shared producer.
    pub fn producer_settings(&self) -> Vec<(String, String)> {
        let mut settings = self.base_settings();
        settings.extend([
            ("client.id".to_string(), format!("{}-producer", self.client_id)),
            ("acks".to_string(), "all".to_string()),
        ]);
        settings
    }

    /// Settings for the metadata client used by topic discovery.
    pub fn metadata_settings(&self) -> Vec<(String, String)> {
        let mut settings = self.base_settings();
        settings.push((
            "client.id".to_string(),
            format!("{}-metadata", self.client_id),
        ));
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaSecurityConfig;

    fn lookup<'a>(settings: &'a [(String, String)], key: &str) -> Option<&'a str> {
        settings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_new_config_defaults() {
        let config = KafkaClientConfig::new("localhost:9092", "change-prop");

        assert_eq!(config.brokers, "localhost:9092");
        assert_eq!(config.security_protocol, SecurityProtocol::Plaintext);
        assert!(config.sasl_config.is_none());
        assert!(config.ssl_config.is_none());
        assert_eq!(config.session_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_consumer_settings_manual_commit_latest() {
        let settings = KafkaClientConfig::new("k:9092", "cp").consumer_settings("cp-rule");

        assert_eq!(lookup(&settings, "group.id"), Some("cp-rule"));
        assert_eq!(lookup(&settings, "enable.auto.commit"), Some("false"));
        assert_eq!(lookup(&settings, "auto.offset.reset"), Some("latest"));
        assert_eq!(lookup(&settings, "bootstrap.servers"), Some("k:9092"));
    }

    #[test]
    fn test_producer_waits_for_all_replicas() {
        let settings = KafkaClientConfig::new("k:9092", "cp").producer_settings();
        assert_eq!(lookup(&settings, "acks"), Some("all"));
        assert_eq!(lookup(&settings, "group.id"), None);
    }

    #[test]
    fn test_sasl_settings_included() {
        let settings = KafkaClientConfig::new("k:9093", "cp")
            .with_sasl_scram_sha512("user", "pass")
            .with_ssl("/ca.pem")
            .base_settings();

        assert_eq!(lookup(&settings, "security.protocol"), Some("SASL_SSL"));
        assert_eq!(lookup(&settings, "sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(lookup(&settings, "sasl.username"), Some("user"));
        assert_eq!(lookup(&settings, "ssl.ca.location"), Some("/ca.pem"));
    }

    #[test]
    fn test_from_settings_with_security() {
        let kafka = KafkaConfig {
            security: Some(KafkaSecurityConfig {
                protocol: "sasl_ssl".to_string(),
                sasl_mechanism: Some("SCRAM-SHA-512".to_string()),
                sasl_username: Some("u".to_string()),
                sasl_password: Some("p".to_string()),
                ssl_ca_location: None,
                ssl_certificate_location: None,
                ssl_key_location: None,
            }),
            ..KafkaConfig::default()
        };
        let config = KafkaClientConfig::from_settings(&kafka).unwrap();
        assert_eq!(config.security_protocol, SecurityProtocol::SaslSsl);
        let sasl = config.sasl_config.unwrap();
        assert_eq!(sasl.mechanism, SaslMechanism::ScramSha512);
        assert_eq!(sasl.username, "u");
    }

    #[test]
    fn test_from_settings_missing_password() {
        let kafka = KafkaConfig {
            security: Some(KafkaSecurityConfig {
                protocol: "SASL_PLAINTEXT".to_string(),
                sasl_mechanism: None,
                sasl_username: Some("u".to_string()),
                sasl_password: None,
                ssl_ca_location: None,
                ssl_certificate_location: None,
                ssl_key_location: None,
            }),
            ..KafkaConfig::default()
        };
        assert!(matches!(
            KafkaClientConfig::from_settings(&kafka),
            Err(ConfigError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_invalid_names() {
        assert!(matches!(
            SecurityProtocol::parse("bogus"),
            Err(ConfigError::InvalidSecurityProtocol(_))
        ));
        assert!(matches!(
            SaslMechanism::parse("GSSAPI"),
            Err(ConfigError::InvalidSaslMechanism(_))
        ));
    }
}
