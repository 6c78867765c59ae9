//! Execution engine
//!
//! The engine is split into a generic consume-dispatch-commit loop
//! ([`Consumer`]) and a [`MessageProcessor`] that decides what a record
//! means and how it is executed. [`RuleProcessor`] handles records from
//! a rule's source topics; [`RetryProcessor`] handles the rule's retry
//! topic.

pub mod consumer;
pub mod http;
pub mod offsets;
pub mod pipeline;
pub mod retry_executor;
pub mod rule_executor;

pub use consumer::{Consumer, ConsumerHandle, ConsumerSettings};
pub use http::HttpDispatcher;
pub use offsets::{CommitRequest, OffsetTracker, StaleEntry};
pub use pipeline::{ExecOptions, Outcome, Pipeline};
pub use retry_executor::RetryProcessor;
pub use rule_executor::RuleProcessor;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::error::ChangepropError;
use crate::kafka::{BrokerProducer, Record};
use crate::ratelimit::RateLimiter;

/// Failure of an execution pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// A derived HTTP request failed.
    #[error("downstream request failed with status {status}")]
    Downstream {
        status: u16,
        body: Option<String>,
        headers: BTreeMap<String, String>,
    },

    /// Anything not caused by a downstream response.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// HTTP status of a downstream failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            ExecError::Downstream { status, .. } => Some(*status),
            ExecError::Internal(_) => None,
        }
    }

    /// Response body of a downstream failure.
    pub fn body(&self) -> Option<&str> {
        match self {
            ExecError::Downstream { body, .. } => body.as_deref(),
            ExecError::Internal(_) => None,
        }
    }

    /// Diagnostic trace carried as the `stack` of error reports.
    pub fn trace(&self) -> String {
        format!("{:?}", self)
    }

    /// Returns true for a 503 whose body mentions maintenance.
    pub fn is_maintenance(&self) -> bool {
        self.status() == Some(503)
            && self
                .body()
                .is_some_and(|b| b.to_ascii_lowercase().contains("maintenance"))
    }
}

impl From<ExecError> for ChangepropError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Downstream { status, body, .. } => ChangepropError::Downstream {
                status,
                message: format!("downstream request failed with status {}", status),
                body,
            },
            ExecError::Internal(msg) => ChangepropError::Internal(msg),
        }
    }
}

/// Engine-wide settings derived from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub commit_interval: Duration,
    pub empty_poll_backoff: Duration,
    pub disconnect_backoff: Duration,
    pub stale_threshold: Duration,
    pub unmatched_commit_probability: f64,
    pub min_reenqueue_delay: Duration,
    pub request_timeout: Duration,
    pub emitter_name: String,
    pub user_agent: String,
    pub retry_topic_prefix: String,
    pub error_topic: String,
}

impl EngineSettings {
    /// Extracts engine settings from the full configuration.
    pub fn from_config(config: &Config) -> Self {
        let engine = &config.engine;
        Self {
            commit_interval: Duration::from_millis(engine.commit_interval_ms),
            empty_poll_backoff: Duration::from_millis(engine.empty_poll_backoff_ms),
            disconnect_backoff: Duration::from_millis(engine.disconnect_backoff_ms),
            stale_threshold: Duration::from_secs(engine.stale_threshold_secs),
            unmatched_commit_probability: engine.unmatched_commit_probability,
            min_reenqueue_delay: Duration::from_secs(engine.min_reenqueue_delay_secs),
            request_timeout: Duration::from_secs(engine.request_timeout_secs),
            emitter_name: engine.emitter_name.clone(),
            user_agent: engine.user_agent.clone(),
            retry_topic_prefix: config.kafka.retry_topic_prefix.clone(),
            error_topic: config.kafka.error_topic.clone(),
        }
    }

    /// Retry topic carrying failed executions from `topic`.
    pub fn retry_topic(&self, topic: &str) -> String {
        format!("{}{}", self.retry_topic_prefix, topic)
    }

    /// Identity stamped on retry and error messages of `rule`.
    pub fn emitter_id(&self, rule: &str) -> String {
        format!("{}#{}", self.emitter_name, rule)
    }

    /// Loop settings for a consumer with the given limits.
    pub fn consumer_settings(&self, concurrency: usize, batch_size: usize) -> ConsumerSettings {
        ConsumerSettings {
            concurrency,
            batch_size,
            commit_interval: self.commit_interval,
            empty_poll_backoff: self.empty_poll_backoff,
            disconnect_backoff: self.disconnect_backoff,
            stale_threshold: self.stale_threshold,
            unmatched_commit_probability: self.unmatched_commit_probability,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Shared collaborators of every engine in a process.
#[derive(Clone)]
pub struct EngineContext {
    pub settings: EngineSettings,
    pub producer: Arc<dyn BrokerProducer>,
    pub http: Arc<HttpDispatcher>,
    pub dedup: Arc<dyn Deduplicator>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub globals: Arc<JsonValue>,
}

/// How the consume loop should treat a pulled record.
#[derive(Debug)]
pub enum Classification<J> {
    /// The payload could not be decoded.
    Invalid(ChangepropError),
    /// Nothing to do for this record.
    Unmatched,
    /// The record must be executed.
    Matched(J),
}

/// Decides what records mean and executes matched ones.
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    /// Work item produced for a matched record.
    type Job: Send + 'static;

    /// Label used in logs and metrics.
    fn name(&self) -> &str;

    /// Decodes and matches a record without blocking.
    fn classify(&self, record: &Record) -> Classification<Self::Job>;

    /// Reports a record that could not be decoded.
    async fn report_invalid(&self, record: &Record, error: ChangepropError);

    /// Reports a record whose processing panicked with `message`.
    async fn report_internal(&self, record: &Record, message: String);

    /// Executes a matched record to settlement.
    async fn process(&self, job: Self::Job, record: &Record);
}
