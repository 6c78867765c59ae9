//! Match specifications compiled into a tagged matcher tree
//!
//! A match specification is a nested mapping. Each leaf is one of:
//!
//! - a literal (exact equality),
//! - the string `"undefined"` (the field must be absent),
//! - a delimited regular expression `/pattern/flags`,
//! - an array, where every item must be satisfied by some element of the
//!   target array (order independent).
//!
//! Specifications are interpreted, never turned into code. Regex leaves may
//! capture values, which [`Matcher::captures`] collects into the `match`
//! template context.

use regex::Regex;
use serde_json::{Map, Value as JsonValue};

use super::RuleError;

/// Literal string meaning "field must be absent".
const UNDEFINED: &str = "undefined";

/// Flags recognised after the closing delimiter of a regex literal.
const REGEX_FLAGS: &str = "gimsuxy";

/// How a regex leaf exposes its capture groups.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CaptureMode {
    /// Only named groups; captures become an object keyed by group name.
    Named(Vec<String>),
    /// Only unnamed groups (or none); captures become a positional array
    /// whose index 0 is the whole match.
    Positional,
}

/// A compiled regular expression leaf.
#[derive(Debug, Clone)]
pub struct PatternLeaf {
    regex: Regex,
    mode: CaptureMode,
}

impl PatternLeaf {
    /// Compiles a `/pattern/flags` literal.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidRegex` for an unparseable pattern or
    /// unsupported flag, and `RuleError::MixedCaptureGroups` when named and
    /// unnamed groups are combined in one expression.
    pub fn compile(literal: &str) -> Result<Self, RuleError> {
        let (pattern, flags) = split_regex_literal(literal)
            .ok_or_else(|| RuleError::InvalidRegex(format!("{}: not a /regex/", literal)))?;

        let mut inline = String::new();
        for flag in flags.chars() {
            match flag {
                'i' | 'm' | 's' | 'x' | 'u' => inline.push(flag),
                // Global and sticky flags have no meaning for a single test.
                'g' | 'y' => {}
                other => {
                    return Err(RuleError::InvalidRegex(format!(
                        "{}: unsupported flag '{}'",
                        literal, other
                    )))
                }
            }
        }
        let source = if inline.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{}){}", inline, pattern)
        };

        let regex =
            Regex::new(&source).map_err(|e| RuleError::InvalidRegex(format!("{}: {}", literal, e)))?;

        let mut named = Vec::new();
        let mut unnamed = 0usize;
        for name in regex.capture_names().skip(1) {
            match name {
                Some(n) => named.push(n.to_string()),
                None => unnamed += 1,
            }
        }
        if !named.is_empty() && unnamed > 0 {
            return Err(RuleError::MixedCaptureGroups(literal.to_string()));
        }
        let mode = if named.is_empty() {
            CaptureMode::Positional
        } else {
            CaptureMode::Named(named)
        };

        Ok(Self { regex, mode })
    }

    /// Tests a string against the expression.
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// The compiled expression.
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    fn captures(&self, text: &str) -> JsonValue {
        let Some(caps) = self.regex.captures(text) else {
            return JsonValue::Null;
        };
        match &self.mode {
            CaptureMode::Named(names) => {
                let mut out = Map::new();
                for name in names {
                    let value = caps
                        .name(name)
                        .map(|m| JsonValue::String(m.as_str().to_string()))
                        .unwrap_or(JsonValue::Null);
                    out.insert(name.clone(), value);
                }
                JsonValue::Object(out)
            }
            CaptureMode::Positional => JsonValue::Array(
                caps.iter()
                    .map(|m| {
                        m.map(|m| JsonValue::String(m.as_str().to_string()))
                            .unwrap_or(JsonValue::Null)
                    })
                    .collect(),
            ),
        }
    }
}

/// Splits `/pattern/flags` into its parts.
fn split_regex_literal(literal: &str) -> Option<(&str, &str)> {
    let rest = literal.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let (pattern, flags) = (&rest[..end], &rest[end + 1..]);
    if pattern.is_empty() || !flags.chars().all(|c| REGEX_FLAGS.contains(c)) {
        return None;
    }
    Some((pattern, flags))
}

/// Returns true if the string is written as a `/regex/` literal.
pub fn is_regex_literal(value: &str) -> bool {
    split_regex_literal(value).is_some()
}

/// A node of the compiled matcher tree.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Exact equality with a literal value.
    Exact(JsonValue),
    /// The field must be absent.
    Absent,
    /// The field must be a scalar matching the expression.
    Pattern(PatternLeaf),
    /// Every listed field must satisfy its matcher.
    Object(Vec<(String, Matcher)>),
    /// Every item must be satisfied by some element of the target array.
    Array(Vec<Matcher>),
}

impl Matcher {
    /// Compiles a top-level match specification.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidMatch` if the specification is not a
    /// mapping, and regex errors from nested leaves.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeprop::rule::Matcher;
    /// use serde_json::json;
    ///
    /// let matcher = Matcher::compile(&json!({"number": 1, "string": "oolala"})).unwrap();
    /// assert!(matcher.matches(&json!({"number": 1, "string": "oolala"})));
    /// assert!(!matcher.matches(&json!({"number": 2, "string": "oolala"})));
    /// ```
    pub fn compile(spec: &JsonValue) -> Result<Self, RuleError> {
        if !spec.is_object() {
            return Err(RuleError::InvalidMatch(format!(
                "match must be a mapping, got {}",
                spec
            )));
        }
        Self::compile_node(spec)
    }

    fn compile_node(spec: &JsonValue) -> Result<Self, RuleError> {
        Ok(match spec {
            JsonValue::Object(fields) => Matcher::Object(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Self::compile_node(v)?)))
                    .collect::<Result<Vec<_>, RuleError>>()?,
            ),
            JsonValue::Array(items) => Matcher::Array(
                items
                    .iter()
                    .map(Self::compile_node)
                    .collect::<Result<Vec<_>, RuleError>>()?,
            ),
            JsonValue::String(s) if s == UNDEFINED => Matcher::Absent,
            JsonValue::String(s) if is_regex_literal(s) => Matcher::Pattern(PatternLeaf::compile(s)?),
            other => Matcher::Exact(other.clone()),
        })
    }

    /// Tests a whole event body.
    pub fn matches(&self, value: &JsonValue) -> bool {
        self.test(Some(value))
    }

    fn test(&self, value: Option<&JsonValue>) -> bool {
        match self {
            Matcher::Absent => value.is_none(),
            Matcher::Exact(expected) => value == Some(expected),
            Matcher::Pattern(leaf) => value
                .and_then(scalar_text)
                .map(|text| leaf.is_match(&text))
                .unwrap_or(false),
            Matcher::Object(fields) => match value {
                Some(JsonValue::Object(target)) => {
                    fields.iter().all(|(key, m)| m.test(target.get(key)))
                }
                _ => false,
            },
            Matcher::Array(items) => match value {
                Some(JsonValue::Array(elements)) => items
                    .iter()
                    .all(|m| elements.iter().any(|e| m.test(Some(e)))),
                _ => false,
            },
        }
    }

    /// Extracts the capture context of a value this matcher accepted.
    ///
    /// Regex leaves contribute their captures at the path of the leaf;
    /// subtrees without regex leaves contribute nothing.
    pub fn captures(&self, value: &JsonValue) -> JsonValue {
        self.capture(Some(value)).unwrap_or_else(|| JsonValue::Object(Map::new()))
    }

    fn capture(&self, value: Option<&JsonValue>) -> Option<JsonValue> {
        match self {
            Matcher::Absent | Matcher::Exact(_) => None,
            Matcher::Pattern(leaf) => value
                .and_then(scalar_text)
                .map(|text| leaf.captures(&text)),
            Matcher::Object(fields) => {
                let target = value.and_then(JsonValue::as_object);
                let mut out = Map::new();
                for (key, m) in fields {
                    if let Some(c) = m.capture(target.and_then(|t| t.get(key))) {
                        out.insert(key.clone(), c);
                    }
                }
                (!out.is_empty()).then_some(JsonValue::Object(out))
            }
            Matcher::Array(items) => {
                let elements = value.and_then(JsonValue::as_array)?;
                let captured: Vec<JsonValue> = items
                    .iter()
                    .map(|m| {
                        elements
                            .iter()
                            .find(|e| m.test(Some(e)))
                            .and_then(|e| m.capture(Some(e)))
                            .unwrap_or(JsonValue::Null)
                    })
                    .collect();
                captured
                    .iter()
                    .any(|c| !c.is_null())
                    .then_some(JsonValue::Array(captured))
            }
        }
    }
}

/// Text form of a scalar used for regex tests.
fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
