//! Rule compiler
//!
//! A [`Rule`] is compiled once from a [`RuleDefinition`] and is immutable
//! afterwards. It owns the matcher tree for each alternative, the request
//! templates, the retry and ignore policies, and the optional blacklist and
//! sampler.

pub mod blacklist;
pub mod definition;
pub mod matcher;
pub mod policy;
pub mod sampler;
pub mod template;

pub use blacklist::Blacklist;
pub use definition::{
    CaseDefinition, ExecDefinition, OneOrMany, RuleDefinition, SampleDefinition, StatusDefinition,
};
pub use matcher::{is_regex_literal, Matcher, PatternLeaf};
pub use policy::{RetryPolicy, StatusFilter};
pub use sampler::Sampler;
pub use template::{ExpandedRequest, RequestTemplate, StringTemplate, TemplateContext, ValueTemplate};

use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

use crate::error::ChangepropError;
use crate::event::Event;

/// Errors raised while compiling a rule
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("rule has no topic")]
    MissingTopic,

    #[error("invalid match specification: {0}")]
    InvalidMatch(String),

    #[error("invalid regular expression {0}")]
    InvalidRegex(String),

    #[error("named and unnamed capture groups mixed in {0}")]
    MixedCaptureGroups(String),

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),
}

impl From<RuleError> for ChangepropError {
    fn from(err: RuleError) -> Self {
        ChangepropError::Config(err.to_string())
    }
}

/// Settings shared by every rule of a process.
#[derive(Debug, Clone, Default)]
pub struct RuleOptions {
    /// Events from this domain never match.
    pub canary_domain: Option<String>,
}

/// Per-rule switches for pipeline stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleFlags {
    pub disable_ratelimit: bool,
    pub disable_blacklist: bool,
    pub disable_dedup: bool,
    pub disable_delayed_execution: bool,
}

#[derive(Debug, Clone)]
struct Alternative {
    matcher: Matcher,
    match_not: Vec<Matcher>,
    requests: Vec<RequestTemplate>,
}

impl Alternative {
    fn compile(case: &CaseDefinition) -> Result<Self, RuleError> {
        let matcher = match &case.match_spec {
            Some(spec) => Matcher::compile(spec)?,
            None => Matcher::Object(Vec::new()),
        };
        let match_not = case
            .match_not
            .as_ref()
            .map(OneOrMany::to_vec)
            .unwrap_or_default()
            .iter()
            .map(Matcher::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let exec = case.exec.to_vec();
        if exec.is_empty() {
            return Err(RuleError::InvalidOption("exec must not be empty".to_string()));
        }
        let requests = exec
            .iter()
            .map(RequestTemplate::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            matcher,
            match_not,
            requests,
        })
    }

    fn accepts(&self, body: &JsonValue) -> bool {
        self.matcher.matches(body) && !self.match_not.iter().any(|m| m.matches(body))
    }
}

/// A compiled rule bound to a resolved topic list.
#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    topics: Vec<String>,
    alternatives: Vec<Alternative>,
    retry: RetryPolicy,
    ignore: StatusFilter,
    concurrency: usize,
    batch_size: usize,
    blacklist: Blacklist,
    sampler: Option<Sampler>,
    flags: RuleFlags,
    canary_domain: Option<String>,
}

impl Rule {
    /// Compiles a rule definition.
    ///
    /// `topics` is the resolved topic list the rule consumes; pattern topics
    /// in the definition are resolved by topic discovery beforehand.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] describing the first problem found.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeprop::rule::{Rule, RuleDefinition, RuleOptions};
    /// use changeprop::event::Event;
    /// use serde_json::json;
    ///
    /// let def: RuleDefinition = serde_json::from_value(json!({
    ///     "topic": "t",
    ///     "exec": {"uri": "a/b/c"},
    ///     "match": {"number": 1, "string": "oolala"}
    /// })).unwrap();
    /// let rule = Rule::compile("r", &def, vec!["t".into()], &RuleOptions::default()).unwrap();
    ///
    /// let hit = Event::from_value(json!({"number": 1, "string": "oolala"})).unwrap();
    /// let miss = Event::from_value(json!({"number": 2, "string": "oolala"})).unwrap();
    /// assert_eq!(rule.test(&hit), Some(0));
    /// assert_eq!(rule.test(&miss), None);
    /// ```
    pub fn compile(
        name: &str,
        def: &RuleDefinition,
        topics: Vec<String>,
        options: &RuleOptions,
    ) -> Result<Self, RuleError> {
        let specs = def.topic_specs();
        if specs.is_empty() {
            return Err(RuleError::MissingTopic);
        }
        for spec in specs.iter().filter(|s| is_regex_literal(s)) {
            PatternLeaf::compile(spec)?;
        }
        if def.concurrency == 0 {
            return Err(RuleError::InvalidOption("concurrency must be > 0".to_string()));
        }
        if def.consumer_batch_size == 0 {
            return Err(RuleError::InvalidOption(
                "consumer_batch_size must be > 0".to_string(),
            ));
        }

        let alternatives = def
            .alternatives()
            .iter()
            .map(Alternative::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let retry = RetryPolicy::new(
            def.retry_delay,
            def.retry_factor,
            def.retry_limit,
            StatusFilter::compile(&def.retry_on)?,
        )?;
        let ignore = StatusFilter::compile(&def.ignore)?;
        let blacklist = Blacklist::compile(&def.blacklist)?;
        let sampler = def.sample.as_ref().map(Sampler::compile).transpose()?;

        Ok(Self {
            name: name.to_string(),
            topics,
            alternatives,
            retry,
            ignore,
            concurrency: def.concurrency,
            batch_size: def.consumer_batch_size,
            blacklist,
            sampler,
            flags: RuleFlags {
                disable_ratelimit: def.disable_ratelimit,
                disable_blacklist: def.disable_blacklist,
                disable_dedup: def.disable_dedup,
                disable_delayed_execution: def.disable_delayed_execution,
            },
            canary_domain: options.canary_domain.clone().filter(|d| !d.is_empty()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn flags(&self) -> RuleFlags {
        self.flags
    }

    pub fn sampler(&self) -> Option<&Sampler> {
        self.sampler.as_ref()
    }

    /// Index of the first alternative that accepts the event.
    ///
    /// Canary events never match.
    pub fn test(&self, event: &Event) -> Option<usize> {
        if let Some(canary) = &self.canary_domain {
            if &event.meta().domain == canary {
                return None;
            }
        }
        self.alternatives
            .iter()
            .position(|alt| alt.accepts(event.body()))
    }

    /// Capture context of alternative `index` for a matched event.
    pub fn expand(&self, index: usize, event: &Event) -> JsonValue {
        self.alternatives
            .get(index)
            .map(|alt| alt.matcher.captures(event.body()))
            .unwrap_or_else(|| JsonValue::Object(Map::new()))
    }

    /// Request templates of alternative `index`.
    pub fn requests(&self, index: usize) -> &[RequestTemplate] {
        self.alternatives
            .get(index)
            .map(|alt| alt.requests.as_slice())
            .unwrap_or_default()
    }

    /// Returns true if the blacklist excludes the event.
    pub fn is_blacklisted(&self, event: &Event) -> bool {
        !self.flags.disable_blacklist && self.blacklist.is_blacklisted(event)
    }

    /// Returns true if a failed request with this status counts as success.
    pub fn should_ignore(&self, status: u16) -> bool {
        self.ignore.matches(status)
    }

    /// Expands every request of alternative `index` for a matched event.
    ///
    /// Each request carries `x-request-id`, `x-triggered-by` and
    /// `user-agent` unless its template sets them.
    pub fn render(
        &self,
        index: usize,
        event: &Event,
        globals: &JsonValue,
        user_agent: &str,
    ) -> Vec<ExpandedRequest> {
        let request_id = event
            .meta()
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let defaults = [
            ("x-request-id", request_id),
            ("x-triggered-by", event.extend_chain(event.triggered_by())),
            ("user-agent", user_agent.to_string()),
        ];
        let request = json!({
            "headers": defaults.iter().map(|(k, v)| (k.to_string(), JsonValue::String(v.clone()))).collect::<Map<_, _>>()
        });
        let matched = self.expand(index, event);
        let ctx = TemplateContext {
            message: event.body(),
            matched: &matched,
            globals,
            request: &request,
        };
        self.requests(index)
            .iter()
            .map(|template| {
                let mut expanded = template.expand(&ctx);
                for (name, value) in &defaults {
                    expanded
                        .headers
                        .entry(name.to_string())
                        .or_insert_with(|| value.clone());
                }
                expanded
            })
            .collect()
    }

    /// Runs the sampler, if any, against a matched event.
    pub fn sample(&self, index: usize, event: &Event, globals: &JsonValue) -> bool {
        let Some(sampler) = &self.sampler else {
            return true;
        };
        let matched = self.expand(index, event);
        let empty = JsonValue::Object(Map::new());
        sampler.accept(&TemplateContext {
            message: event.body(),
            matched: &matched,
            globals,
            request: &empty,
        })
    }
}
