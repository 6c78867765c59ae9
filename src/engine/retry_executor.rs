//! Processor for a rule's retry topic
//!
//! Retry envelopes are only honoured when this rule instance emitted them
//! and budget remains. Each attempt waits until the original event time
//! plus the backoff for its remaining budget, so restarts do not compound
//! delays. Retries are never deduplicated and never delayed again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::engine::pipeline::{remaining_until, ExecOptions, Pipeline};
use crate::engine::{Classification, EngineContext, ExecError, MessageProcessor};
use crate::error::ChangepropError;
use crate::event::{ErrorEvent, Event, RetryEvent};
use crate::kafka::Record;
use crate::metrics::ExecutionMetrics;
use crate::rule::Rule;

/// A decoded retry envelope ready to run.
#[derive(Debug)]
pub struct RetryJob {
    pub retry: RetryEvent,
    pub original: Event,
    pub index: usize,
}

/// Re-executes failed events from the retry topic.
pub struct RetryProcessor {
    name: String,
    emitter_id: String,
    pipeline: Pipeline,
}

impl RetryProcessor {
    pub fn new(rule: Arc<Rule>, ctx: EngineContext) -> Self {
        Self {
            name: format!("{}-retry", rule.name()),
            emitter_id: ctx.settings.emitter_id(rule.name()),
            pipeline: Pipeline::new(rule, ctx),
        }
    }

    fn ctx(&self) -> &EngineContext {
        self.pipeline.context()
    }

    /// Time to wait before attempting `job`.
    ///
    /// A due time past the representable range waits the full backoff.
    fn wait_for(&self, job: &RetryJob) -> Duration {
        let backoff = self.pipeline.rule().retry().backoff(job.retry.retries_left);
        let Some(dt) = job.original.dt() else {
            return backoff;
        };
        match chrono::Duration::from_std(backoff)
            .ok()
            .and_then(|b| dt.checked_add_signed(b))
        {
            Some(due) => remaining_until(due).unwrap_or_default(),
            None => backoff,
        }
    }

    async fn produce_json<T: serde::Serialize>(&self, topic: &str, message: &T) {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(rule = %self.name, topic = %topic, error = %e, "Failed to encode message");
                return;
            }
        };
        if let Err(e) = self.ctx().producer.produce(topic, None, payload).await {
            error!(rule = %self.name, topic = %topic, error = %e, "Failed to produce message");
        }
    }

    async fn handle_failure(&self, job: &RetryJob, record: &Record, err: ExecError) -> &'static str {
        let policy = self.pipeline.rule().retry();
        let mut retries_left = job.retry.retries_left.saturating_sub(1);
        let mut extra = Duration::ZERO;
        if err.is_maintenance() {
            retries_left += 1;
            let max_ms = policy.delay().as_millis() as u64;
            extra = Duration::from_millis(rand::rng().random_range(0..=max_ms));
            info!(
                rule = %self.name,
                event_id = %job.original.meta().id,
                extra_ms = extra.as_millis() as u64,
                "Downstream in maintenance, retry budget kept"
            );
        }

        if retries_left > 0 && policy.should_retry(err.status()) {
            tokio::time::sleep(extra).await;
            warn!(
                rule = %self.name,
                event_id = %job.original.meta().id,
                status = ?err.status(),
                retries_left,
                "Retry failed, scheduling another attempt"
            );
            let retry = RetryEvent::new(
                &record.topic,
                &job.original,
                &self.emitter_id,
                retries_left,
                err.status(),
                &err.to_string(),
            );
            self.produce_json(&record.topic, &retry).await;
            return "retry";
        }

        error!(
            rule = %self.name,
            event_id = %job.original.meta().id,
            status = ?err.status(),
            error = %err,
            "Retries exhausted"
        );
        let error_topic = &self.ctx().settings.error_topic;
        let mut report =
            ErrorEvent::for_event(error_topic, &self.emitter_id, &job.original, &err.to_string());
        report.stack = Some(err.trace());
        report.error_status = err.status();
        report.error_body = err.body().map(str::to_string);
        report.retries_left = Some(retries_left);
        self.produce_json(error_topic, &report).await;
        "error"
    }
}

#[async_trait]
impl MessageProcessor for RetryProcessor {
    type Job = RetryJob;

    fn name(&self) -> &str {
        &self.name
    }

    fn classify(&self, record: &Record) -> Classification<RetryJob> {
        let Some(payload) = record.value.as_deref() else {
            return Classification::Invalid(ChangepropError::Parse("empty payload".to_string()));
        };
        let retry: RetryEvent = match serde_json::from_slice(payload) {
            Ok(retry) => retry,
            Err(e) => {
                return Classification::Invalid(ChangepropError::Parse(format!(
                    "invalid retry message: {}",
                    e
                )))
            }
        };
        if retry.emitter_id != self.emitter_id {
            debug!(rule = %self.name, emitter_id = %retry.emitter_id, "Retry from another emitter dropped");
            return Classification::Unmatched;
        }
        if retry.retries_left == 0 {
            warn!(rule = %self.name, event_id = %retry.meta.id, "Retry without budget dropped");
            return Classification::Unmatched;
        }
        let original = match retry.original() {
            Ok(original) => original,
            Err(e) => return Classification::Invalid(e),
        };
        match self.pipeline.rule().test(&original) {
            Some(index) => Classification::Matched(RetryJob {
                retry,
                original,
                index,
            }),
            None => Classification::Unmatched,
        }
    }

    async fn report_invalid(&self, record: &Record, error: ChangepropError) {
        let error_topic = &self.ctx().settings.error_topic;
        let report = ErrorEvent::unparseable(
            error_topic,
            &self.emitter_id,
            record.value.as_deref().unwrap_or_default(),
            &error.to_string(),
        );
        self.produce_json(error_topic, &report).await;
    }

    async fn report_internal(&self, record: &Record, message: String) {
        let error_topic = &self.ctx().settings.error_topic;
        let raw = record.value.as_deref().unwrap_or_default();
        let original = serde_json::from_slice::<RetryEvent>(raw)
            .ok()
            .and_then(|retry| retry.original().ok());
        let report =
            ErrorEvent::internal(error_topic, &self.emitter_id, raw, original.as_ref(), message);
        self.produce_json(error_topic, &report).await;
    }

    async fn process(&self, job: RetryJob, record: &Record) {
        let wait = self.wait_for(&job);
        if !wait.is_zero() {
            debug!(rule = %self.name, wait_ms = wait.as_millis() as u64, retries_left = job.retry.retries_left, "Waiting before retry");
            tokio::time::sleep(wait).await;
        }

        let metrics = ExecutionMetrics::new(&self.name);
        let opts = ExecOptions {
            dedup: false,
            delay: false,
            source_topic: record.topic.clone(),
        };
        let status = match self.pipeline.run(job.index, &job.original, &opts).await {
            Ok(outcome) => outcome.as_str(),
            Err(err) => self.handle_failure(&job, record, err).await,
        };
        metrics.record(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::NoopDeduplicator;
    use crate::engine::{EngineSettings, HttpDispatcher};
    use crate::kafka::MemoryBroker;
    use crate::ratelimit::NoopRateLimiter;
    use crate::rule::{RuleDefinition, RuleOptions};
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RETRY_TOPIC: &str = "change-prop.retry.t";

    fn processor(yaml: &str, broker: &MemoryBroker) -> RetryProcessor {
        let def: RuleDefinition = serde_yaml::from_str(yaml).unwrap();
        let rule =
            Rule::compile("purge", &def, vec!["t".to_string()], &RuleOptions::default()).unwrap();
        RetryProcessor::new(
            Arc::new(rule),
            EngineContext {
                settings: EngineSettings::default(),
                producer: Arc::new(broker.clone()),
                http: Arc::new(HttpDispatcher::new(Duration::from_secs(5)).unwrap()),
                dedup: Arc::new(NoopDeduplicator),
                rate_limiter: Arc::new(NoopRateLimiter),
                globals: Arc::new(json!({})),
            },
        )
    }

    fn retry_record(original: serde_json::Value, emitter: &str, retries_left: u32) -> Record {
        let event = Event::from_value(original).unwrap();
        let retry = RetryEvent::new(RETRY_TOPIC, &event, emitter, retries_left, Some(500), "failed");
        Record {
            topic: RETRY_TOPIC.to_string(),
            partition: 0,
            offset: 0,
            value: Some(serde_json::to_vec(&retry).unwrap()),
            timestamp: None,
        }
    }

    fn rule_yaml(uri: &str) -> String {
        format!("topic: t\nretry_delay: 10\nexec:\n  uri: '{}/x'\n", uri)
    }

    #[test]
    fn test_foreign_and_exhausted_retries_dropped() {
        let broker = MemoryBroker::new();
        let p = processor(&rule_yaml("http://127.0.0.1:1"), &broker);

        let foreign = retry_record(json!({}), "other#purge", 2);
        assert!(matches!(p.classify(&foreign), Classification::Unmatched));

        let exhausted = retry_record(json!({}), "change-prop#purge", 0);
        assert!(matches!(p.classify(&exhausted), Classification::Unmatched));

        let ok = retry_record(json!({}), "change-prop#purge", 1);
        assert!(matches!(p.classify(&ok), Classification::Matched(_)));

        let garbage = Record {
            value: Some(b"{".to_vec()),
            ..ok
        };
        assert!(matches!(p.classify(&garbage), Classification::Invalid(_)));
    }

    #[test]
    fn test_wait_uses_original_event_time() {
        let broker = MemoryBroker::new();
        let p = processor(
            "topic: t\nretry_delay: 1000\nretry_factor: 2\nretry_limit: 3\nexec:\n  uri: 'http://127.0.0.1:1/'\n",
            &broker,
        );

        // No usable timestamp: full backoff for the second attempt (1000 * 2).
        let rec = retry_record(json!({}), "change-prop#purge", 2);
        let Classification::Matched(job) = p.classify(&rec) else {
            panic!("expected match");
        };
        assert_eq!(p.wait_for(&job), Duration::from_millis(2000));

        // An old event has already waited long enough.
        let old = (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
        let rec = retry_record(json!({"meta": {"dt": old}}), "change-prop#purge", 2);
        let Classification::Matched(job) = p.classify(&rec) else {
            panic!("expected match");
        };
        assert_eq!(p.wait_for(&job), Duration::ZERO);

        // A fresh event waits roughly the remainder.
        let fresh = Utc::now().to_rfc3339();
        let rec = retry_record(json!({"meta": {"dt": fresh}}), "change-prop#purge", 1);
        let Classification::Matched(job) = p.classify(&rec) else {
            panic!("expected match");
        };
        let wait = p.wait_for(&job);
        assert!(wait > Duration::from_millis(3000) && wait <= Duration::from_millis(4000));
    }

    #[test]
    fn test_overflowing_backoff_waits_instead_of_retrying_now() {
        let broker = MemoryBroker::new();
        let p = processor(
            "topic: t\nretry_delay: 1000\nretry_factor: 1.0e300\nretry_limit: 3\nexec:\n  uri: 'http://127.0.0.1:1/'\n",
            &broker,
        );
        let fresh = Utc::now().to_rfc3339();
        let rec = retry_record(json!({"meta": {"dt": fresh}}), "change-prop#purge", 1);
        let Classification::Matched(job) = p.classify(&rec) else {
            panic!("expected match");
        };
        let wait = p.wait_for(&job);
        assert_eq!(wait, p.pipeline.rule().retry().backoff(1));
        assert!(wait > Duration::from_secs(365 * 24 * 3600));
    }

    #[tokio::test]
    async fn test_failure_decrements_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let broker = MemoryBroker::new();
        let p = processor(&rule_yaml(&server.uri()), &broker);

        let rec = retry_record(json!({"meta": {"id": "r1"}}), "change-prop#purge", 2);
        let Classification::Matched(job) = p.classify(&rec) else {
            panic!("expected match");
        };
        p.process(job, &rec).await;

        let produced = broker.produced(RETRY_TOPIC).await;
        assert_eq!(produced.len(), 1);
        let next: RetryEvent = serde_json::from_slice(&produced[0]).unwrap();
        assert_eq!(next.retries_left, 1);
        assert!(broker.produced("change-prop.error").await.is_empty());
    }

    #[tokio::test]
    async fn test_last_failure_goes_to_error_topic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let broker = MemoryBroker::new();
        let p = processor(&rule_yaml(&server.uri()), &broker);

        let rec = retry_record(json!({"meta": {"id": "r2"}}), "change-prop#purge", 1);
        let Classification::Matched(job) = p.classify(&rec) else {
            panic!("expected match");
        };
        p.process(job, &rec).await;

        assert!(broker.produced(RETRY_TOPIC).await.is_empty());
        let errors = broker.produced("change-prop.error").await;
        assert_eq!(errors.len(), 1);
        let report: serde_json::Value = serde_json::from_slice(&errors[0]).unwrap();
        assert_eq!(report["retries_left"], 0);
        assert_eq!(report["error_body"], "boom");
        let stack = report["stack"].as_str().unwrap();
        assert!(stack.contains("500") && stack.contains("boom"));
    }

    #[tokio::test]
    async fn test_internal_failure_reports_original_event() {
        let broker = MemoryBroker::new();
        let p = processor(&rule_yaml("http://127.0.0.1:1"), &broker);

        let rec = retry_record(json!({"meta": {"id": "r4"}}), "change-prop#purge", 1);
        p.report_internal(&rec, "processor crashed".to_string()).await;

        let errors = broker.produced("change-prop.error").await;
        assert_eq!(errors.len(), 1);
        let report: serde_json::Value = serde_json::from_slice(&errors[0]).unwrap();
        assert_eq!(report["stack"], "processor crashed");
        assert_eq!(report["original_event"]["meta"]["id"], "r4");
        assert_eq!(report["emitter_id"], "change-prop#purge");
    }

    #[tokio::test]
    async fn test_maintenance_keeps_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Maintenance window"))
            .mount(&server)
            .await;
        let broker = MemoryBroker::new();
        let p = processor(&rule_yaml(&server.uri()), &broker);

        let rec = retry_record(json!({}), "change-prop#purge", 1);
        let Classification::Matched(job) = p.classify(&rec) else {
            panic!("expected match");
        };
        p.process(job, &rec).await;

        let produced = broker.produced(RETRY_TOPIC).await;
        assert_eq!(produced.len(), 1);
        let next: RetryEvent = serde_json::from_slice(&produced[0]).unwrap();
        assert_eq!(next.retries_left, 1);
    }

    #[tokio::test]
    async fn test_success_produces_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let broker = MemoryBroker::new();
        let p = processor(&rule_yaml(&server.uri()), &broker);

        let rec = retry_record(json!({"meta": {"id": "r3"}}), "change-prop#purge", 2);
        let Classification::Matched(job) = p.classify(&rec) else {
            panic!("expected match");
        };
        p.process(job, &rec).await;
        assert!(broker.produced(RETRY_TOPIC).await.is_empty());
        assert!(broker.produced("change-prop.error").await.is_empty());
    }
}
