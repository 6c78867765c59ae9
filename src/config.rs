//! Configuration management for changeprop
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::cli::{Cli, Commands};
use crate::error::{ChangepropError, Result};
use crate::ratelimit::{RateLimitKind, WindowLimit};
use crate::rule::{Rule, RuleDefinition, RuleOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
///
/// Holds the broker settings, engine tuning, shared template globals,
/// logging, rate limits and the rule definitions keyed by rule name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Kafka connection and topic naming
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Engine tuning shared by every rule
    #[serde(default)]
    pub engine: EngineConfig,

    /// Values available to templates as `{globals.*}`
    #[serde(default = "default_globals")]
    pub globals: JsonValue,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// In-process rate limits
    #[serde(default)]
    pub ratelimiter: RateLimiterConfig,

    /// Rule definitions keyed by rule name
    #[serde(default)]
    pub rules: BTreeMap<String, RuleDefinition>,
}

fn default_globals() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap servers (comma-separated)
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Consumer group prefix; groups are `{prefix}-{rule}` and
    /// `{prefix}-{rule}-retry`
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,

    /// Prefix prepended to a topic name to form its retry topic
    #[serde(default = "default_retry_topic_prefix")]
    pub retry_topic_prefix: String,

    /// Topic receiving unrecoverable failures
    #[serde(default = "default_error_topic")]
    pub error_topic: String,

    /// Consumer session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Security settings (SASL/SSL)
    #[serde(default)]
    pub security: Option<KafkaSecurityConfig>,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_prefix() -> String {
    "change-prop".to_string()
}

fn default_retry_topic_prefix() -> String {
    "change-prop.retry.".to_string()
}

fn default_error_topic() -> String {
    "change-prop.error".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_prefix: default_group_prefix(),
            retry_topic_prefix: default_retry_topic_prefix(),
            error_topic: default_error_topic(),
            session_timeout_ms: default_session_timeout_ms(),
            security: None,
        }
    }
}

/// Kafka security configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL)
    pub protocol: String,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    #[serde(default)]
    pub sasl_mechanism: Option<String>,

    /// SASL username
    #[serde(default)]
    pub sasl_username: Option<String>,

    /// SASL password
    #[serde(default, skip_serializing)]
    pub sasl_password: Option<String>,

    /// CA certificate file
    #[serde(default)]
    pub ssl_ca_location: Option<String>,

    /// Client certificate file
    #[serde(default)]
    pub ssl_certificate_location: Option<String>,

    /// Client key file
    #[serde(default)]
    pub ssl_key_location: Option<String>,
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Offset flush period in milliseconds
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,

    /// Pause after an empty pull in milliseconds
    #[serde(default = "default_empty_poll_backoff_ms")]
    pub empty_poll_backoff_ms: u64,

    /// Pause after a broker disconnect in milliseconds
    #[serde(default = "default_disconnect_backoff_ms")]
    pub disconnect_backoff_ms: u64,

    /// Age after which in-flight entries are reported, in seconds
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,

    /// Chance that a record matching nothing is settled for commit
    #[serde(default = "default_unmatched_commit_probability")]
    pub unmatched_commit_probability: f64,

    /// Delays longer than this are re-enqueued instead of slept, in seconds
    #[serde(default = "default_min_reenqueue_delay_secs")]
    pub min_reenqueue_delay_secs: u64,

    /// Topic discovery period in seconds
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,

    /// Timeout of each derived request in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Service name used in emitter ids
    #[serde(default = "default_emitter_name")]
    pub emitter_name: String,

    /// Events from this domain never match
    #[serde(default)]
    pub canary_domain: Option<String>,

    /// `user-agent` header of derived requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Events remembered per rule for deduplication
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

fn default_commit_interval_ms() -> u64 {
    500
}

fn default_empty_poll_backoff_ms() -> u64 {
    100
}

fn default_disconnect_backoff_ms() -> u64 {
    5_000
}

fn default_stale_threshold_secs() -> u64 {
    60
}

fn default_unmatched_commit_probability() -> f64 {
    0.01
}

fn default_min_reenqueue_delay_secs() -> u64 {
    20
}

fn default_discovery_interval_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_emitter_name() -> String {
    "change-prop".to_string()
}

fn default_user_agent() -> String {
    "ChangePropagation".to_string()
}

fn default_dedup_window() -> usize {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commit_interval_ms: default_commit_interval_ms(),
            empty_poll_backoff_ms: default_empty_poll_backoff_ms(),
            disconnect_backoff_ms: default_disconnect_backoff_ms(),
            stale_threshold_secs: default_stale_threshold_secs(),
            unmatched_commit_probability: default_unmatched_commit_probability(),
            min_reenqueue_delay_secs: default_min_reenqueue_delay_secs(),
            discovery_interval_secs: default_discovery_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            emitter_name: default_emitter_name(),
            canary_domain: None,
            user_agent: default_user_agent(),
            dedup_window: default_dedup_window(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON-formatted logs
    #[serde(default = "default_json_logs")]
    pub json_format: bool,

    /// Log file path (if None, STDOUT only)
    #[serde(default)]
    pub file_path: Option<std::path::PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json_logs() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: default_json_logs(),
            file_path: None,
        }
    }
}

/// Fixed-window limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowLimitConfig {
    /// Occurrences allowed per window
    pub limit: u64,

    /// Window length in seconds
    pub interval_secs: u64,
}

/// In-process rate limits keyed by `{rule}:{meta.uri}`
///
/// Kinds left unset are unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimiterConfig {
    /// Limit on executions
    #[serde(default)]
    pub exec: Option<WindowLimitConfig>,

    /// Limit on 5xx failures
    #[serde(default)]
    pub failure: Option<WindowLimitConfig>,
}

impl RateLimiterConfig {
    /// Returns true when no limit is configured.
    pub fn is_empty(&self) -> bool {
        self.exec.is_none() && self.failure.is_none()
    }

    /// Configured limits by kind.
    pub fn limits(&self) -> Vec<(RateLimitKind, WindowLimit)> {
        [
            (RateLimitKind::Exec, self.exec),
            (RateLimitKind::Failure, self.failure),
        ]
        .into_iter()
        .filter_map(|(kind, limit)| {
            limit.map(|l| {
                (
                    kind,
                    WindowLimit {
                        limit: l.limit,
                        interval: Duration::from_secs(l.interval_secs),
                    },
                )
            })
        })
        .collect()
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    /// Parse configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns `ChangepropError::Config` if the file cannot be read or parsed
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ChangepropError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ChangepropError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(brokers) = std::env::var("CHANGEPROP_KAFKA_BROKERS") {
            tracing::debug!(brokers = %brokers, "Env override: CHANGEPROP_KAFKA_BROKERS");
            self.kafka.brokers = brokers;
        }

        if let Ok(password) = std::env::var("CHANGEPROP_KAFKA_SASL_PASSWORD") {
            match self.kafka.security.as_mut() {
                Some(security) => security.sasl_password = Some(password),
                None => tracing::warn!(
                    "CHANGEPROP_KAFKA_SASL_PASSWORD set but kafka.security is not configured"
                ),
            }
        }

        if let Ok(level) = std::env::var("CHANGEPROP_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(concurrency) = std::env::var("CHANGEPROP_CONCURRENCY") {
            match concurrency.parse::<usize>() {
                Ok(v) => {
                    for rule in self.rules.values_mut() {
                        rule.concurrency = v;
                    }
                    tracing::debug!(concurrency = v, "Env override: CHANGEPROP_CONCURRENCY");
                }
                Err(_) => {
                    tracing::warn!("Invalid value for CHANGEPROP_CONCURRENCY: {}", concurrency);
                }
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }

        if let Commands::Run { brokers, rules } = &cli.command {
            if let Some(brokers) = brokers {
                self.kafka.brokers = brokers.clone();
            }
            if !rules.is_empty() {
                for name in rules {
                    if !self.rules.contains_key(name) {
                        tracing::warn!(rule = %name, "Requested rule is not configured");
                    }
                }
                self.rules.retain(|name, _| rules.contains(name));
            }
        }
    }

    /// Options shared by every compiled rule
    pub fn rule_options(&self) -> RuleOptions {
        RuleOptions {
            canary_domain: self.engine.canary_domain.clone(),
        }
    }

    /// Validate the configuration
    ///
    /// Checks value ranges and compiles every rule against its configured
    /// topic specifications.
    ///
    /// # Errors
    ///
    /// Returns `ChangepropError::Config` naming the first failing check
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.trim().is_empty() {
            return Err(ChangepropError::Config("kafka.brokers cannot be empty".to_string()).into());
        }

        if self.kafka.group_prefix.is_empty() {
            return Err(
                ChangepropError::Config("kafka.group_prefix cannot be empty".to_string()).into(),
            );
        }

        if self.kafka.error_topic.is_empty() {
            return Err(
                ChangepropError::Config("kafka.error_topic cannot be empty".to_string()).into(),
            );
        }

        let engine = &self.engine;
        let positive = [
            ("engine.commit_interval_ms", engine.commit_interval_ms),
            ("engine.stale_threshold_secs", engine.stale_threshold_secs),
            ("engine.discovery_interval_secs", engine.discovery_interval_secs),
            ("engine.request_timeout_secs", engine.request_timeout_secs),
            ("engine.dedup_window", engine.dedup_window as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ChangepropError::Config(format!("{} must be greater than 0", name)).into());
            }
        }

        if !(0.0..=1.0).contains(&engine.unmatched_commit_probability) {
            return Err(ChangepropError::Config(
                "engine.unmatched_commit_probability must be between 0.0 and 1.0".to_string(),
            )
            .into());
        }

        for (name, limit) in [
            ("ratelimiter.exec", self.ratelimiter.exec),
            ("ratelimiter.failure", self.ratelimiter.failure),
        ] {
            if limit.is_some_and(|l| l.interval_secs == 0) {
                return Err(ChangepropError::Config(format!(
                    "{}.interval_secs must be greater than 0",
                    name
                ))
                .into());
            }
        }

        let options = self.rule_options();
        for (name, def) in &self.rules {
            Rule::compile(name, def, def.topic_specs(), &options).map_err(|e| {
                ChangepropError::Config(format!("Invalid rule '{}': {}", name, e))
            })?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig::default(),
            engine: EngineConfig::default(),
            globals: default_globals(),
            logging: LoggingConfig::default(),
            ratelimiter: RateLimiterConfig::default(),
            rules: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serial_test::serial;
    use std::io::Write;

    const SAMPLE: &str = r#"
kafka:
  brokers: kafka1:9092,kafka2:9092
  group_prefix: cp
  security:
    protocol: SASL_SSL
    sasl_mechanism: SCRAM-SHA-512
    sasl_username: svc
engine:
  commit_interval_ms: 250
  canary_domain: canary
globals:
  site: https://example.org
logging:
  level: warn
  json_format: false
ratelimiter:
  failure:
    limit: 10
    interval_secs: 60
rules:
  purge:
    topic: resource_change
    match:
      meta:
        domain: "/\\.wikipedia\\.org$/"
    exec:
      method: post
      uri: "http://purge/{message.meta.domain}"
  summary:
    topics: [page_edit, "/^page_[a-z]+$/"]
    retry_limit: 0
    exec:
      uri: "http://summary/"
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.kafka.brokers, "localhost:9092");
        assert_eq!(config.kafka.retry_topic_prefix, "change-prop.retry.");
        assert_eq!(config.engine.commit_interval_ms, 500);
        assert_eq!(config.engine.min_reenqueue_delay_secs, 20);
        assert_eq!(config.engine.dedup_window, 10_000);
        assert!(config.rules.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.kafka.group_prefix, "cp");
        assert_eq!(config.kafka.error_topic, "change-prop.error");
        assert_eq!(config.engine.commit_interval_ms, 250);
        assert_eq!(config.engine.empty_poll_backoff_ms, 100);
        assert_eq!(config.rule_options().canary_domain.as_deref(), Some("canary"));
        assert_eq!(config.globals["site"], "https://example.org");
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules["summary"].retry_limit, 0);
        assert_eq!(config.ratelimiter.limits().len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.kafka.group_prefix, "change-prop");
        assert!(config.globals.is_object());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.kafka.brokers = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.unmatched_commit_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.commit_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ratelimiter.exec = Some(WindowLimitConfig {
            limit: 1,
            interval_secs: 0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_reports_rule_errors() {
        let mut config = Config::default();
        config.rules.insert(
            "broken".to_string(),
            serde_yaml::from_str("exec:\n  uri: http://x/\n").unwrap(),
        );
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("broken"), "{}", err);
    }

    #[test]
    #[serial]
    fn test_from_file_and_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::try_parse_from([
            "changeprop",
            "-v",
            "run",
            "--brokers",
            "override:9092",
            "--rule",
            "purge",
        ])
        .unwrap();
        let config = Config::load(&path, &cli).unwrap();
        assert_eq!(config.kafka.brokers, "override:9092");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.rules.keys().collect::<Vec<_>>(), vec!["purge"]);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let cli = Cli::try_parse_from(["changeprop", "check"]).unwrap();
        let config = Config::load("/nonexistent/changeprop.yaml", &cli).unwrap();
        assert_eq!(config.kafka.group_prefix, "change-prop");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"kafka: [unclosed").unwrap();
        let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChangepropError>(),
            Some(ChangepropError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("CHANGEPROP_KAFKA_BROKERS", "env:9092");
        std::env::set_var("CHANGEPROP_KAFKA_SASL_PASSWORD", "secret");
        std::env::set_var("CHANGEPROP_LOG_LEVEL", "trace");
        std::env::set_var("CHANGEPROP_CONCURRENCY", "7");

        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.apply_env_vars();

        std::env::remove_var("CHANGEPROP_KAFKA_BROKERS");
        std::env::remove_var("CHANGEPROP_KAFKA_SASL_PASSWORD");
        std::env::remove_var("CHANGEPROP_LOG_LEVEL");
        std::env::remove_var("CHANGEPROP_CONCURRENCY");

        assert_eq!(config.kafka.brokers, "env:9092");
        assert_eq!(
            config.kafka.security.as_ref().and_then(|s| s.sasl_password.as_deref()),
            Some("secret")
        );
        assert_eq!(config.logging.level, "trace");
        assert!(config.rules.values().all(|r| r.concurrency == 7));
    }

    #[test]
    #[serial]
    fn test_invalid_concurrency_env_ignored() {
        std::env::set_var("CHANGEPROP_CONCURRENCY", "lots");
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.apply_env_vars();
        std::env::remove_var("CHANGEPROP_CONCURRENCY");
        assert!(config.rules.values().all(|r| r.concurrency == 30));
    }
}
