use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use changeprop::engine::{EngineSettings, HttpDispatcher};
use changeprop::kafka::MemoryBroker;
use changeprop::ratelimit::NoopRateLimiter;
use changeprop::rule::{RuleDefinition, RuleOptions};
use changeprop::subscription::ManagerDependencies;
use serde_json::{json, Value as JsonValue};
use wiremock::MockServer;

/// Engine settings with short timers so tests settle quickly.
#[allow(dead_code)]
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        commit_interval: Duration::from_millis(20),
        empty_poll_backoff: Duration::from_millis(5),
        disconnect_backoff: Duration::from_millis(50),
        unmatched_commit_probability: 0.0,
        ..EngineSettings::default()
    }
}

/// Manager dependencies wired to an in-memory broker.
#[allow(dead_code)]
pub fn dependencies(broker: &MemoryBroker, settings: EngineSettings) -> ManagerDependencies {
    ManagerDependencies {
        consumers: Arc::new(broker.clone()),
        metadata: Arc::new(broker.clone()),
        producer: Arc::new(broker.clone()),
        http: Arc::new(HttpDispatcher::new(Duration::from_secs(5)).expect("http client")),
        rate_limiter: Arc::new(NoopRateLimiter),
        settings,
        globals: Arc::new(json!({})),
        rule_options: RuleOptions::default(),
        group_prefix: "change-prop".to_string(),
        discovery_interval: Duration::from_secs(60),
        dedup_window: 100,
    }
}

#[allow(dead_code)]
pub fn rule(yaml: &str) -> RuleDefinition {
    serde_yaml::from_str(yaml).expect("valid rule yaml")
}

#[allow(dead_code)]
pub fn payload(value: JsonValue) -> Vec<u8> {
    serde_json::to_vec(&value).expect("serializable payload")
}

#[allow(dead_code)]
pub async fn request_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map(|r| r.len())
        .unwrap_or_default()
}

/// Polls `check` until it holds or five seconds pass.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
