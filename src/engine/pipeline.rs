//! Execution pipeline for one matched event
//!
//! Stages run in order and any of them may settle the event early:
//! blacklist, delayed execution, sampling, rate limiting, deduplication,
//! loop detection, and finally the derived HTTP requests. Early exits are
//! successful outcomes, not errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::engine::{EngineContext, ExecError};
use crate::event::Event;
use crate::ratelimit::{rate_limit_key, RateLimitDecision, RateLimitKind};
use crate::rule::Rule;

/// Occurrences of one `stream:uri` pair tolerated in a trigger chain.
const MAX_CHAIN_REPEATS: usize = 10;

/// Per-invocation switches.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Consult the deduplicator.
    pub dedup: bool,
    /// Honour `delay_until`.
    pub delay: bool,
    /// Topic the event was consumed from; target of re-enqueued events.
    pub source_topic: String,
}

/// How a pipeline run settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Executed,
    Blacklisted,
    SampledOut,
    RateLimited,
    Duplicate,
    Reenqueued,
}

impl Outcome {
    /// Status label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Executed => "success",
            Outcome::Blacklisted => "blacklisted",
            Outcome::SampledOut => "sampled_out",
            Outcome::RateLimited => "rate_limited",
            Outcome::Duplicate => "duplicate",
            Outcome::Reenqueued => "delayed",
        }
    }
}

/// Runs a compiled rule against matched events.
#[derive(Clone)]
pub struct Pipeline {
    rule: Arc<Rule>,
    ctx: EngineContext,
}

impl Pipeline {
    pub fn new(rule: Arc<Rule>, ctx: EngineContext) -> Self {
        Self { rule, ctx }
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Executes alternative `index` of the rule for `event`.
    ///
    /// # Errors
    ///
    /// Returns the first request failure not accepted by the rule's ignore
    /// filter, or `ExecError::Internal` for a trigger loop or a failed
    /// re-enqueue.
    pub async fn run(
        &self,
        index: usize,
        event: &Event,
        opts: &ExecOptions,
    ) -> Result<Outcome, ExecError> {
        let rule = &self.rule;
        let flags = rule.flags();
        let meta = event.meta();

        if rule.is_blacklisted(event) {
            debug!(rule = %rule.name(), uri = %meta.uri, "Event blacklisted");
            return Ok(Outcome::Blacklisted);
        }

        if opts.delay && !flags.disable_delayed_execution {
            if let Some(outcome) = self.apply_delay(event, &opts.source_topic).await? {
                return Ok(outcome);
            }
        }

        if !rule.sample(index, event, &self.ctx.globals) {
            debug!(rule = %rule.name(), event_id = %meta.id, "Event sampled out");
            return Ok(Outcome::SampledOut);
        }

        let limit_key = rate_limit_key(rule.name(), event);
        if !flags.disable_ratelimit {
            for kind in [RateLimitKind::Exec, RateLimitKind::Failure] {
                if let RateLimitDecision::Limited { message, key } =
                    self.ctx.rate_limiter.check(kind, &limit_key).await
                {
                    debug!(rule = %rule.name(), key = %key, kind = %kind, "Rate limited: {}", message);
                    return Ok(Outcome::RateLimited);
                }
            }
        }

        let dedup = opts.dedup && !flags.disable_dedup;
        if dedup && self.ctx.dedup.check(rule.name(), event).await.is_duplicate() {
            debug!(rule = %rule.name(), event_id = %meta.id, "Duplicate event skipped");
            return Ok(Outcome::Duplicate);
        }

        self.check_loop(event)?;

        let result = self.execute(index, event).await;
        if dedup {
            self.ctx.dedup.complete(rule.name(), event).await;
        }

        if !flags.disable_ratelimit {
            self.ctx
                .rate_limiter
                .increment(RateLimitKind::Exec, &limit_key)
                .await;
            if result
                .as_ref()
                .err()
                .and_then(ExecError::status)
                .is_some_and(|s| s >= 500)
            {
                self.ctx
                    .rate_limiter
                    .increment(RateLimitKind::Failure, &limit_key)
                    .await;
            }
        }

        result.map(|_| Outcome::Executed)
    }

    /// Sleeps until `delay_until`, or re-enqueues the event when the wait is
    /// longer than the re-enqueue threshold.
    async fn apply_delay(&self, event: &Event, source_topic: &str) -> Result<Option<Outcome>, ExecError> {
        let Some(until) = event.delay_until() else {
            return Ok(None);
        };
        let Some(remaining) = remaining_until(until) else {
            return Ok(None);
        };
        let threshold = self.ctx.settings.min_reenqueue_delay;
        if remaining > threshold {
            tokio::time::sleep(threshold).await;
            self.ctx
                .producer
                .produce(source_topic, None, event.to_bytes())
                .await
                .map_err(|e| ExecError::Internal(format!("Failed to re-enqueue delayed event: {}", e)))?;
            info!(
                rule = %self.rule.name(),
                topic = %source_topic,
                event_id = %event.meta().id,
                remaining_secs = remaining.as_secs(),
                "Delayed event re-enqueued"
            );
            return Ok(Some(Outcome::Reenqueued));
        }
        debug!(rule = %self.rule.name(), wait_ms = remaining.as_millis() as u64, "Delaying execution");
        tokio::time::sleep(remaining).await;
        Ok(None)
    }

    fn check_loop(&self, event: &Event) -> Result<(), ExecError> {
        let Some(chain) = event.triggered_by() else {
            return Ok(());
        };
        let meta = event.meta();
        let link = format!("{}:{}", meta.stream, meta.uri);
        let repeats = chain.split(',').filter(|l| *l == link).count();
        if repeats > MAX_CHAIN_REPEATS {
            return Err(ExecError::Internal(format!(
                "Trigger loop detected for {} ({} repeats)",
                link, repeats
            )));
        }
        Ok(())
    }

    async fn execute(&self, index: usize, event: &Event) -> Result<(), ExecError> {
        let requests = self.rule.render(
            index,
            event,
            &self.ctx.globals,
            &self.ctx.settings.user_agent,
        );
        let results = join_all(requests.iter().map(|r| self.ctx.http.execute(r))).await;
        for (request, result) in requests.iter().zip(results) {
            match result {
                Ok(_) => {}
                Err(err) if err.status().is_some_and(|s| self.rule.should_ignore(s)) => {
                    debug!(
                        rule = %self.rule.name(),
                        uri = %request.uri,
                        status = err.status().unwrap_or_default(),
                        "Ignored request failure"
                    );
                }
                Err(err) => {
                    warn!(rule = %self.rule.name(), uri = %request.uri, error = %err, "Request failed");
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

/// Time left until `at`, if it lies in the future.
pub(crate) fn remaining_until(at: chrono::DateTime<Utc>) -> Option<Duration> {
    (at - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
}
