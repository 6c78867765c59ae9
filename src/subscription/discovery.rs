//! Topic discovery
//!
//! A rule names its topics either literally or as `/regex/` literals.
//! [`TopicSelector`] resolves those specifications against the live topic
//! list, and [`TopicDiscovery`] polls the cluster so pattern-based rules
//! pick up topics created after startup.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kafka::{BrokerError, TopicMetadata};
use crate::rule::{is_regex_literal, PatternLeaf, RuleError};

/// Prefix of broker-internal topics, which patterns never select.
const INTERNAL_TOPIC_PREFIX: &str = "__";

/// Literal and pattern testers for one rule's topics.
#[derive(Debug, Clone)]
pub struct TopicSelector {
    literals: Vec<String>,
    patterns: Vec<PatternLeaf>,
}

impl TopicSelector {
    /// Compiles topic specifications.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::MissingTopic` for an empty list and
    /// `RuleError::InvalidRegex` for a malformed pattern.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeprop::subscription::TopicSelector;
    ///
    /// let selector = TopicSelector::compile(&[
    ///     "resource_change".to_string(),
    ///     "/^mediawiki\\.job\\..+$/".to_string(),
    /// ]).unwrap();
    ///
    /// let live = vec![
    ///     "mediawiki.job.purge".to_string(),
    ///     "other".to_string(),
    /// ];
    /// assert_eq!(
    ///     selector.resolve(&live),
    ///     vec!["mediawiki.job.purge".to_string(), "resource_change".to_string()]
    /// );
    /// ```
    pub fn compile(specs: &[String]) -> Result<Self, RuleError> {
        if specs.is_empty() {
            return Err(RuleError::MissingTopic);
        }
        let mut literals = Vec::new();
        let mut patterns = Vec::new();
        for spec in specs {
            if is_regex_literal(spec) {
                patterns.push(PatternLeaf::compile(spec)?);
            } else {
                literals.push(spec.clone());
            }
        }
        Ok(Self { literals, patterns })
    }

    /// Returns true if any specification is a pattern.
    pub fn is_dynamic(&self) -> bool {
        !self.patterns.is_empty()
    }

    /// Tests one topic name.
    pub fn matches(&self, topic: &str) -> bool {
        self.literals.iter().any(|l| l == topic)
            || (!topic.starts_with(INTERNAL_TOPIC_PREFIX)
                && self.patterns.iter().any(|p| p.is_match(topic)))
    }

    /// Resolves the selected topics against `available`.
    ///
    /// Literal topics are always selected, whether or not they exist yet.
    /// The result is sorted and free of duplicates.
    pub fn resolve(&self, available: &[String]) -> Vec<String> {
        let mut selected: BTreeSet<String> = self.literals.iter().cloned().collect();
        selected.extend(available.iter().filter(|t| self.matches(t)).cloned());
        selected.into_iter().collect()
    }
}

/// Periodic poller of the cluster topic list.
#[derive(Clone)]
pub struct TopicDiscovery {
    metadata: Arc<dyn TopicMetadata>,
    interval: Duration,
}

impl TopicDiscovery {
    /// Creates a poller querying `metadata` every `interval`.
    pub fn new(metadata: Arc<dyn TopicMetadata>, interval: Duration) -> Self {
        Self { metadata, interval }
    }

    /// Resolves `selector` against the current topic list.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the topic list cannot be fetched.
    pub async fn resolve(&self, selector: &TopicSelector) -> Result<Vec<String>, BrokerError> {
        let available = self.metadata.topic_names().await?;
        Ok(selector.resolve(&available))
    }

    /// Spawns a poll loop publishing the resolved topic set.
    ///
    /// The channel starts at `initial` and is updated only when a newly
    /// appeared topic matches. Poll failures are logged and the next poll
    /// proceeds normally. The loop ends when `cancel` fires or every
    /// receiver is dropped.
    pub fn watch(
        &self,
        rule: &str,
        selector: TopicSelector,
        initial: Vec<String>,
        cancel: CancellationToken,
    ) -> (watch::Receiver<Vec<String>>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(initial.clone());
        let metadata = self.metadata.clone();
        let period = self.interval;
        let rule = rule.to_string();

        let handle = tokio::spawn(async move {
            let mut current: BTreeSet<String> = initial.into_iter().collect();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                let available = match metadata.topic_names().await {
                    Ok(names) => names,
                    Err(e) => {
                        warn!(rule = %rule, error = %e, "Topic discovery poll failed");
                        continue;
                    }
                };
                let resolved = selector.resolve(&available);
                let added: Vec<&String> =
                    resolved.iter().filter(|t| !current.contains(*t)).collect();
                if added.is_empty() {
                    debug!(rule = %rule, topics = resolved.len(), "Topic set unchanged");
                    continue;
                }
                info!(rule = %rule, added = ?added, "New topics discovered");
                current.extend(resolved.iter().cloned());
                if tx.send(current.iter().cloned().collect()).is_err() {
                    break;
                }
            }
        });

        (rx, handle)
    }
}
