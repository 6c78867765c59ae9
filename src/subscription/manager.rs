//! Subscription manager
//!
//! Owns one supervisor per rule. A supervisor runs the rule's engine pair
//! (a [`RuleProcessor`] consumer on the source topics and a
//! [`RetryProcessor`] consumer on their retry topics) and rebuilds both
//! whenever topic discovery reports new matching topics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dedup::{DedupWindow, Deduplicator};
use crate::engine::{
    Consumer, ConsumerHandle, EngineContext, EngineSettings, HttpDispatcher, RetryProcessor,
    RuleProcessor,
};
use crate::error::{ChangepropError, Result};
use crate::kafka::{BrokerProducer, ConsumerFactory, TopicMetadata};
use crate::ratelimit::RateLimiter;
use crate::rule::{Rule, RuleDefinition, RuleOptions};
use crate::subscription::discovery::{TopicDiscovery, TopicSelector};

/// Everything the manager needs to build engines.
#[derive(Clone)]
pub struct ManagerDependencies {
    pub consumers: Arc<dyn ConsumerFactory>,
    pub metadata: Arc<dyn TopicMetadata>,
    pub producer: Arc<dyn BrokerProducer>,
    pub http: Arc<HttpDispatcher>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub settings: EngineSettings,
    pub globals: Arc<JsonValue>,
    pub rule_options: RuleOptions,
    pub group_prefix: String,
    pub discovery_interval: Duration,
    pub dedup_window: usize,
}

/// The two consumers serving one compiled rule.
struct EnginePair {
    main: ConsumerHandle,
    retry: ConsumerHandle,
}

impl EnginePair {
    async fn close(self) {
        tokio::join!(self.main.close(), self.retry.close());
    }
}

/// Builds engine pairs for one rule definition.
struct RuleSubscription {
    name: String,
    def: RuleDefinition,
    deps: Arc<ManagerDependencies>,
    dedup: Arc<dyn Deduplicator>,
}

impl RuleSubscription {
    fn group_id(&self) -> String {
        format!("{}-{}", self.deps.group_prefix, self.name)
    }

    fn retry_group_id(&self) -> String {
        format!("{}-{}-retry", self.deps.group_prefix, self.name)
    }

    fn context(&self) -> EngineContext {
        EngineContext {
            settings: self.deps.settings.clone(),
            producer: self.deps.producer.clone(),
            http: self.deps.http.clone(),
            dedup: self.dedup.clone(),
            rate_limiter: self.deps.rate_limiter.clone(),
            globals: self.deps.globals.clone(),
        }
    }

    /// Compiles the rule for `topics` and starts both consumers.
    async fn start(&self, topics: Vec<String>) -> Result<EnginePair> {
        let rule = Arc::new(
            Rule::compile(&self.name, &self.def, topics.clone(), &self.deps.rule_options)
                .map_err(ChangepropError::from)?,
        );
        let ctx = self.context();
        let consumer_settings = ctx
            .settings
            .consumer_settings(rule.concurrency(), rule.batch_size());
        let retry_topics: Vec<String> = topics
            .iter()
            .map(|t| ctx.settings.retry_topic(t))
            .collect();

        let main_broker = self
            .deps
            .consumers
            .create_consumer(&self.group_id())
            .await
            .map_err(ChangepropError::from)?;
        let main = Consumer::new(
            Arc::new(RuleProcessor::new(rule.clone(), ctx.clone())),
            main_broker,
            topics.clone(),
            consumer_settings.clone(),
        )
        .start()
        .await?;

        let retry_broker = match self
            .deps
            .consumers
            .create_consumer(&self.retry_group_id())
            .await
        {
            Ok(broker) => broker,
            Err(e) => {
                main.close().await;
                return Err(ChangepropError::from(e).into());
            }
        };
        let retry = match Consumer::new(
            Arc::new(RetryProcessor::new(rule.clone(), ctx)),
            retry_broker,
            retry_topics,
            consumer_settings,
        )
        .start()
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                main.close().await;
                return Err(e);
            }
        };

        info!(rule = %self.name, topics = ?topics, "Rule subscribed");
        Ok(EnginePair { main, retry })
    }

    /// Runs the rule until `cancel` fires, rebuilding on topic changes.
    async fn supervise(
        self,
        mut pair: Option<EnginePair>,
        mut changes: Option<watch::Receiver<Vec<String>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let topics = tokio::select! {
                _ = cancel.cancelled() => break,
                topics = next_change(&mut changes) => topics,
            };
            let Some(topics) = topics else {
                // Discovery stopped; keep the current pair until shutdown.
                changes = None;
                continue;
            };

            info!(rule = %self.name, topics = ?topics, "Topic set changed, rebuilding rule");
            if let Some(old) = pair.take() {
                old.close().await;
            }
            match self.start(topics).await {
                Ok(new) => pair = Some(new),
                Err(e) => error!(rule = %self.name, error = %e, "Failed to rebuild rule"),
            }
        }

        if let Some(pair) = pair {
            pair.close().await;
        }
        info!(rule = %self.name, "Rule unsubscribed");
    }
}

/// Waits for the next topic set; `None` once the channel is closed.
async fn next_change(changes: &mut Option<watch::Receiver<Vec<String>>>) -> Option<Vec<String>> {
    match changes {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// Runs every configured rule and keeps their subscriptions current.
///
/// # Examples
///
/// ```no_run
/// use changeprop::subscription::{ManagerDependencies, SubscriptionManager};
///
/// # async fn example(deps: ManagerDependencies, rules: std::collections::BTreeMap<String, changeprop::rule::RuleDefinition>) -> anyhow::Result<()> {
/// let mut manager = SubscriptionManager::new(deps);
/// manager.subscribe_all(&rules).await?;
/// tokio::signal::ctrl_c().await?;
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SubscriptionManager {
    deps: Arc<ManagerDependencies>,
    discovery: TopicDiscovery,
    cancel: CancellationToken,
    supervisors: BTreeMap<String, JoinHandle<()>>,
    pollers: Vec<JoinHandle<()>>,
}

impl SubscriptionManager {
    /// Creates a manager with no rules.
    pub fn new(deps: ManagerDependencies) -> Self {
        let discovery = TopicDiscovery::new(deps.metadata.clone(), deps.discovery_interval);
        Self {
            deps: Arc::new(deps),
            discovery,
            cancel: CancellationToken::new(),
            supervisors: BTreeMap::new(),
            pollers: Vec::new(),
        }
    }

    /// Starts every rule in `rules`.
    ///
    /// # Errors
    ///
    /// Returns the first rule that fails to start; rules started before it
    /// keep running until [`SubscriptionManager::shutdown`].
    pub async fn subscribe_all(&mut self, rules: &BTreeMap<String, RuleDefinition>) -> Result<()> {
        for (name, def) in rules {
            self.subscribe(name, def.clone()).await?;
        }
        Ok(())
    }

    /// Starts one rule.
    ///
    /// Pattern topics are resolved against the cluster before the engines
    /// start, and a discovery poller keeps them current afterwards. A rule
    /// whose patterns match nothing yet waits for discovery without
    /// consuming.
    ///
    /// # Errors
    ///
    /// Returns `ChangepropError::Config` for a duplicate rule name or an
    /// invalid definition, and the broker error if the engines cannot be
    /// started.
    pub async fn subscribe(&mut self, name: &str, def: RuleDefinition) -> Result<()> {
        if self.supervisors.contains_key(name) {
            return Err(
                ChangepropError::Config(format!("Rule '{}' is already subscribed", name)).into(),
            );
        }
        let selector = TopicSelector::compile(&def.topic_specs())
            .map_err(|e| ChangepropError::Config(format!("Invalid rule '{}': {}", name, e)))?;

        let topics = if selector.is_dynamic() {
            match self.discovery.resolve(&selector).await {
                Ok(topics) => topics,
                Err(e) => {
                    warn!(rule = %name, error = %e, "Initial topic discovery failed");
                    selector.resolve(&[])
                }
            }
        } else {
            selector.resolve(&[])
        };

        let subscription = RuleSubscription {
            name: name.to_string(),
            def,
            dedup: Arc::new(DedupWindow::new(self.deps.dedup_window)),
            deps: self.deps.clone(),
        };

        let pair = if topics.is_empty() {
            info!(rule = %name, "No topics match yet, waiting for discovery");
            None
        } else {
            Some(subscription.start(topics.clone()).await?)
        };

        let changes = if selector.is_dynamic() {
            let (rx, poller) =
                self.discovery
                    .watch(name, selector, topics, self.cancel.child_token());
            self.pollers.push(poller);
            Some(rx)
        } else {
            None
        };

        let supervisor =
            tokio::spawn(subscription.supervise(pair, changes, self.cancel.child_token()));
        self.supervisors.insert(name.to_string(), supervisor);
        Ok(())
    }

    /// Names of the subscribed rules.
    pub fn rule_names(&self) -> Vec<String> {
        self.supervisors.keys().cloned().collect()
    }

    /// Stops discovery and drains every engine.
    pub async fn shutdown(self) {
        info!(rules = self.supervisors.len(), "Shutting down subscriptions");
        self.cancel.cancel();
        for poller in self.pollers {
            let _ = poller.await;
        }
        for (name, supervisor) in self.supervisors {
            if let Err(e) = supervisor.await {
                error!(rule = %name, error = %e, "Rule supervisor failed");
            }
        }
    }
}
