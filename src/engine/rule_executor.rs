//! Processor for a rule's source topics

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::engine::pipeline::{ExecOptions, Pipeline};
use crate::engine::{Classification, EngineContext, ExecError, MessageProcessor};
use crate::error::ChangepropError;
use crate::event::{ErrorEvent, Event, RetryEvent};
use crate::kafka::Record;
use crate::metrics::ExecutionMetrics;
use crate::rule::Rule;

/// A matched event and the alternative that accepted it.
#[derive(Debug)]
pub struct RuleJob {
    pub event: Event,
    pub index: usize,
}

/// Executes a rule for records of its source topics.
///
/// Failures accepted by the retry policy are wrapped in a [`RetryEvent`]
/// and produced to the retry topic of the source topic; everything else
/// is reported to the error topic.
pub struct RuleProcessor {
    name: String,
    pipeline: Pipeline,
}

impl RuleProcessor {
    pub fn new(rule: Arc<Rule>, ctx: EngineContext) -> Self {
        Self {
            name: rule.name().to_string(),
            pipeline: Pipeline::new(rule, ctx),
        }
    }

    fn ctx(&self) -> &EngineContext {
        self.pipeline.context()
    }

    fn emitter_id(&self) -> String {
        self.ctx().settings.emitter_id(&self.name)
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

    async fn handle_failure(&self, event: &Event, record: &Record, err: ExecError) -> &'static str {
        let rule = self.pipeline.rule();
        let limit = rule.retry().limit();
        if limit > 0 && rule.retry().should_retry(err.status()) {
            let retry_topic = self.ctx().settings.retry_topic(&record.topic);
            warn!(
                rule = %self.name,
                event_id = %event.meta().id,
                status = ?err.status(),
                retry_topic = %retry_topic,
                "Execution failed, scheduling retry"
            );
            let retry = RetryEvent::new(
                &retry_topic,
                event,
                &self.emitter_id(),
                limit,
                err.status(),
                &err.to_string(),
            );
            self.produce_json(&retry_topic, &retry).await;
            return "retry";
        }

        match &err {
            ExecError::Internal(msg) => {
                error!(rule = %self.name, event_id = %event.meta().id, error = %msg, "Internal execution error")
            }
            ExecError::Downstream { status, .. } => {
                error!(rule = %self.name, event_id = %event.meta().id, status = *status, "Execution failed terminally")
            }
        }
        let settings = &self.ctx().settings;
        let mut report = ErrorEvent::for_event(
            &settings.error_topic,
            &self.emitter_id(),
            event,
            &err.to_string(),
        );
        report.stack = Some(err.trace());
        report.error_status = err.status();
        report.error_body = err.body().map(str::to_string);
        report.retries_left = Some(limit);
        self.produce_json(&settings.error_topic, &report).await;
        "error"
    }
}

#[async_trait]
impl MessageProcessor for RuleProcessor {
    type Job = RuleJob;

    fn name(&self) -> &str {
        &self.name
    }

    fn classify(&self, record: &Record) -> Classification<RuleJob> {
        let Some(payload) = record.value.as_deref() else {
            return Classification::Invalid(ChangepropError::Parse("empty payload".to_string()));
        };
        let event = match Event::from_slice(payload) {
            Ok(event) => event,
            Err(e) => return Classification::Invalid(e),
        };
        match self.pipeline.rule().test(&event) {
            Some(index) => Classification::Matched(RuleJob { event, index }),
            None => Classification::Unmatched,
        }
    }

    async fn report_invalid(&self, record: &Record, error: ChangepropError) {
        let report = ErrorEvent::unparseable(
            &self.ctx().settings.error_topic,
            &self.emitter_id(),
            record.value.as_deref().unwrap_or_default(),
            &error.to_string(),
        );
        self.produce_json(&self.ctx().settings.error_topic, &report).await;
    }

    async fn report_internal(&self, record: &Record, message: String) {
        let raw = record.value.as_deref().unwrap_or_default();
        let original = Event::from_slice(raw).ok();
        let report = ErrorEvent::internal(
            &self.ctx().settings.error_topic,
            &self.emitter_id(),
            raw,
            original.as_ref(),
            message,
        );
        self.produce_json(&self.ctx().settings.error_topic, &report).await;
    }

    async fn process(&self, job: RuleJob, record: &Record) {
        let metrics = ExecutionMetrics::new(&self.name);
        let opts = ExecOptions {
            dedup: true,
            delay: true,
            source_topic: record.topic.clone(),
        };
        let status = match self.pipeline.run(job.index, &job.event, &opts).await {
            Ok(outcome) => {
                debug!(
                    rule = %self.name,
                    event_id = %job.event.meta().id,
                    outcome = outcome.as_str(),
                    "Execution settled"
                );
                outcome.as_str()
            }
            Err(err) => self.handle_failure(&job.event, record, err).await,
        };
        metrics.record(status);
    }
}
