//! Declarative rule definitions as they appear in configuration

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Either a single value or a list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A list of values.
    Many(Vec<T>),
    /// A single value.
    One(T),
}

impl<T> OneOrMany<T> {
    /// Flattens into a vector.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

impl<T: Clone> OneOrMany<T> {
    /// Clones the contents into a vector.
    pub fn to_vec(&self) -> Vec<T> {
        self.clone().into_vec()
    }
}

/// One request to issue when a rule matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecDefinition {
    /// HTTP method (case insensitive).
    #[serde(default = "default_method")]
    pub method: String,

    /// URI template.
    pub uri: String,

    /// Header templates.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Body template.
    #[serde(default)]
    pub body: Option<JsonValue>,
}

fn default_method() -> String {
    "get".to_string()
}

/// One ordered alternative of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDefinition {
    /// Match specification; an absent match accepts every event.
    #[serde(default, rename = "match")]
    pub match_spec: Option<JsonValue>,

    /// Exclusion specification(s).
    #[serde(default)]
    pub match_not: Option<OneOrMany<JsonValue>>,

    /// Requests to issue.
    pub exec: OneOrMany<ExecDefinition>,
}

/// Status list used by `retry_on` and `ignore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDefinition {
    /// Exact codes (`412`) or wildcards (`"5xx"`, `"50x"`).
    #[serde(default)]
    pub status: Vec<JsonValue>,
}

/// Deterministic sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleDefinition {
    /// Fraction of events accepted, in `[0, 1]`.
    pub rate: f64,

    /// Template whose expansion is hashed.
    pub hash_template: String,
}

/// A rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Single topic name or `/regex/`.
    #[serde(default)]
    pub topic: Option<String>,

    /// Topic names or `/regex/` patterns.
    #[serde(default)]
    pub topics: Vec<String>,

    /// Top-level match specification.
    #[serde(default, rename = "match")]
    pub match_spec: Option<JsonValue>,

    /// Top-level exclusion specification(s).
    #[serde(default)]
    pub match_not: Option<OneOrMany<JsonValue>>,

    /// Top-level requests.
    #[serde(default)]
    pub exec: Option<OneOrMany<ExecDefinition>>,

    /// Ordered alternatives; replaces the top-level match/exec when present.
    #[serde(default)]
    pub cases: Vec<CaseDefinition>,

    /// Statuses that are retried.
    #[serde(default = "default_retry_on")]
    pub retry_on: StatusDefinition,

    /// Statuses treated as success.
    #[serde(default = "default_ignore")]
    pub ignore: StatusDefinition,

    /// Base retry delay in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// Exponential backoff factor.
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,

    /// Maximum number of retries.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Maximum in-flight messages.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Records pulled per batch.
    #[serde(default = "default_batch_size")]
    pub consumer_batch_size: usize,

    /// Per-domain title exclusions.
    #[serde(default)]
    pub blacklist: BTreeMap<String, Vec<String>>,

    /// Optional sampling.
    #[serde(default)]
    pub sample: Option<SampleDefinition>,

    #[serde(default)]
    pub disable_ratelimit: bool,

    #[serde(default)]
    pub disable_blacklist: bool,

    #[serde(default)]
    pub disable_dedup: bool,

    #[serde(default)]
    pub disable_delayed_execution: bool,
}

fn default_retry_on() -> StatusDefinition {
    StatusDefinition {
        status: vec![JsonValue::String("5xx".to_string())],
    }
}

fn default_ignore() -> StatusDefinition {
    StatusDefinition {
        status: vec![JsonValue::from(412)],
    }
}

fn default_retry_delay() -> u64 {
    500
}

fn default_retry_factor() -> f64 {
    6.0
}

fn default_retry_limit() -> u32 {
    2
}

fn default_concurrency() -> usize {
    30
}

fn default_batch_size() -> usize {
    1
}

impl RuleDefinition {
    /// All topic specifications, `topic` first.
    pub fn topic_specs(&self) -> Vec<String> {
        self.topic
            .iter()
            .chain(self.topics.iter())
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .collect()
    }

    /// The ordered alternatives of this rule.
    ///
    /// Without `cases`, the top-level `match`/`match_not`/`exec` form the
    /// only alternative.
    pub fn alternatives(&self) -> Vec<CaseDefinition> {
        if !self.cases.is_empty() {
            return self.cases.clone();
        }
        vec![CaseDefinition {
            match_spec: self.match_spec.clone(),
            match_not: self.match_not.clone(),
            exec: self
                .exec
                .clone()
                .unwrap_or_else(|| OneOrMany::Many(Vec::new())),
        }]
    }
}

impl Default for RuleDefinition {
    fn default() -> Self {
        Self {
            topic: None,
            topics: Vec::new(),
            match_spec: None,
            match_not: None,
            exec: None,
            cases: Vec::new(),
            retry_on: default_retry_on(),
            ignore: default_ignore(),
            retry_delay: default_retry_delay(),
            retry_factor: default_retry_factor(),
            retry_limit: default_retry_limit(),
            concurrency: default_concurrency(),
            consumer_batch_size: default_batch_size(),
            blacklist: BTreeMap::new(),
            sample: None,
            disable_ratelimit: false,
            disable_blacklist: false,
            disable_dedup: false,
            disable_delayed_execution: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let def: RuleDefinition = serde_yaml::from_str(
            r#"
topic: resource_change
exec:
  uri: http://svc/{message.meta.uri}
"#,
        )
        .unwrap();
        assert_eq!(def.topic_specs(), vec!["resource_change".to_string()]);
        assert_eq!(def.retry_delay, 500);
        assert_eq!(def.retry_factor, 6.0);
        assert_eq!(def.retry_limit, 2);
        assert_eq!(def.concurrency, 30);
        assert_eq!(def.consumer_batch_size, 1);
        let alternatives = def.alternatives();
        assert_eq!(alternatives.len(), 1);
        let exec = alternatives[0].exec.to_vec();
        assert_eq!(exec[0].method, "get");
    }

    #[test]
    fn test_exec_list_and_match_not_list() {
        let def: RuleDefinition = serde_yaml::from_str(
            r#"
topics: [a, "/^b\\..+$/"]
match:
  meta:
    domain: en.wikipedia.org
match_not:
  - meta: { domain: x }
  - meta: { domain: y }
exec:
  - method: post
    uri: http://one
  - uri: http://two
"#,
        )
        .unwrap();
        assert_eq!(def.topic_specs().len(), 2);
        assert_eq!(def.match_not.as_ref().map(|m| m.to_vec().len()), Some(2));
        assert_eq!(def.alternatives()[0].exec.to_vec().len(), 2);
    }

    #[test]
    fn test_cases_replace_top_level() {
        let def: RuleDefinition = serde_yaml::from_str(
            r#"
topic: t
cases:
  - match: { a: 1 }
    exec: { uri: http://one }
  - match: { a: 2 }
    exec: { uri: http://two }
"#,
        )
        .unwrap();
        let alternatives = def.alternatives();
        assert_eq!(alternatives.len(), 2);
        assert_eq!(alternatives[1].exec.to_vec()[0].uri, "http://two");
    }
}
