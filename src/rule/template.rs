//! Request templates with placeholder substitution
//!
//! Placeholders have the form `{root.path.to.value}` where `root` is one of
//! `message`, `match`, `globals` or `request`. In URI templates the expanded
//! value is percent-encoded as a path segment unless the placeholder is
//! written `{+root.path}`. In header and body templates a string consisting
//! of exactly one placeholder is replaced by the referenced JSON value.

use std::collections::BTreeMap;

use reqwest::Method;
use serde_json::{Map, Value as JsonValue};

use super::definition::ExecDefinition;
use super::RuleError;

/// Values available to placeholders.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// The event body.
    pub message: &'a JsonValue,
    /// Captures extracted by the matcher.
    pub matched: &'a JsonValue,
    /// Globals from configuration.
    pub globals: &'a JsonValue,
    /// Request metadata (`request.headers.*`).
    pub request: &'a JsonValue,
}

impl<'a> TemplateContext<'a> {
    fn resolve(&self, root: Root, path: &[String]) -> Option<&'a JsonValue> {
        let mut current = match root {
            Root::Message => self.message,
            Root::Match => self.matched,
            Root::Globals => self.globals,
            Root::Request => self.request,
        };
        for segment in path {
            current = match current {
                JsonValue::Object(map) => map.get(segment)?,
                JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Message,
    Match,
    Globals,
    Request,
}

impl Root {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "message" => Some(Self::Message),
            "match" => Some(Self::Match),
            "globals" => Some(Self::Globals),
            "request" => Some(Self::Request),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Expr {
        root: Root,
        path: Vec<String>,
        reserved: bool,
    },
}

/// A compiled string template.
#[derive(Debug, Clone, PartialEq)]
pub struct StringTemplate {
    parts: Vec<Part>,
}

impl StringTemplate {
    /// Compiles a template string.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidTemplate` for unbalanced braces, empty
    /// placeholders or an unknown root.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeprop::rule::{StringTemplate, TemplateContext};
    /// use serde_json::json;
    ///
    /// let template = StringTemplate::compile("http://svc/{message.meta.domain}/purge").unwrap();
    /// let message = json!({"meta": {"domain": "en.wikipedia.org"}});
    /// let empty = json!({});
    /// let ctx = TemplateContext { message: &message, matched: &empty, globals: &empty, request: &empty };
    /// assert_eq!(template.expand_uri(&ctx), "http://svc/en.wikipedia.org/purge");
    /// ```
    pub fn compile(source: &str) -> Result<Self, RuleError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices();

        while let Some((start, c)) = chars.next() {
            match c {
                '{' => {
                    let close = source[start + 1..].find('}').ok_or_else(|| {
                        RuleError::InvalidTemplate(format!("unclosed placeholder in '{}'", source))
                    })?;
                    let inner = &source[start + 1..start + 1 + close];
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Self::compile_expr(inner, source)?);
                    // Skip past the closing brace.
                    for _ in 0..inner.chars().count() + 1 {
                        chars.next();
                    }
                }
                '}' => {
                    return Err(RuleError::InvalidTemplate(format!(
                        "unbalanced '}}' in '{}'",
                        source
                    )))
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self { parts })
    }

    fn compile_expr(inner: &str, source: &str) -> Result<Part, RuleError> {
        let (reserved, expr) = match inner.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, inner),
        };
        let mut segments = expr.trim().split('.');
        let root_name = segments.next().unwrap_or_default();
        let root = Root::parse(root_name).ok_or_else(|| {
            RuleError::InvalidTemplate(format!(
                "unknown placeholder root '{}' in '{}'",
                root_name, source
            ))
        })?;
        let path: Vec<String> = segments.map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return Err(RuleError::InvalidTemplate(format!(
                "empty path segment in '{}'",
                source
            )));
        }
        Ok(Part::Expr {
            root,
            path,
            reserved,
        })
    }

    /// Returns true if the template contains no placeholders.
    pub fn is_static(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    /// Expands the template as a URI, encoding placeholder values.
    pub fn expand_uri(&self, ctx: &TemplateContext<'_>) -> String {
        self.render(ctx, true)
    }

    /// Expands the template as plain text.
    pub fn expand_string(&self, ctx: &TemplateContext<'_>) -> String {
        self.render(ctx, false)
    }

    /// Expands the template as a JSON value.
    ///
    /// A template that is exactly one placeholder yields the referenced
    /// value itself (or `null` when missing); anything else yields a string.
    pub fn expand_value(&self, ctx: &TemplateContext<'_>) -> JsonValue {
        if let [Part::Expr { root, path, .. }] = self.parts.as_slice() {
            return ctx.resolve(*root, path).cloned().unwrap_or(JsonValue::Null);
        }
        JsonValue::String(self.render(ctx, false))
    }

    fn render(&self, ctx: &TemplateContext<'_>, encode: bool) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expr {
                    root,
                    path,
                    reserved,
                } => {
                    let text = ctx.resolve(*root, path).map(stringify).unwrap_or_default();
                    if encode && !reserved {
                        out.push_str(&encode_segment(&text));
                    } else {
                        out.push_str(&text);
                    }
                }
            }
        }
        out
    }
}

fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Percent-encodes everything outside the RFC 3986 `pchar` set.
fn encode_segment(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'.'
            | b'_'
            | b'~'
            | b'!'
            | b'$'
            | b'&'
            | b'\''
            | b'('
            | b')'
            | b'*'
            | b'+'
            | b','
            | b';'
            | b'='
            | b':'
            | b'@' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// A JSON body template.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueTemplate {
    /// A string that may contain placeholders.
    Text(StringTemplate),
    /// An array of templates.
    Array(Vec<ValueTemplate>),
    /// An object whose values are templates (keys are literal).
    Object(Vec<(String, ValueTemplate)>),
    /// Any other literal value.
    Literal(JsonValue),
}

impl ValueTemplate {
    /// Compiles a JSON value into a template.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidTemplate` if any nested string is invalid.
    pub fn compile(value: &JsonValue) -> Result<Self, RuleError> {
        Ok(match value {
            JsonValue::String(s) => ValueTemplate::Text(StringTemplate::compile(s)?),
            JsonValue::Array(items) => ValueTemplate::Array(
                items
                    .iter()
                    .map(Self::compile)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            JsonValue::Object(map) => ValueTemplate::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::compile(v)?)))
                    .collect::<Result<Vec<_>, RuleError>>()?,
            ),
            other => ValueTemplate::Literal(other.clone()),
        })
    }

    /// Expands the template against a context.
    pub fn expand(&self, ctx: &TemplateContext<'_>) -> JsonValue {
        match self {
            ValueTemplate::Text(t) => t.expand_value(ctx),
            ValueTemplate::Array(items) => {
                JsonValue::Array(items.iter().map(|i| i.expand(ctx)).collect())
            }
            ValueTemplate::Object(fields) => JsonValue::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.expand(ctx)))
                    .collect::<Map<_, _>>(),
            ),
            ValueTemplate::Literal(v) => v.clone(),
        }
    }
}

/// A fully expanded HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URI.
    pub uri: String,
    /// Header name/value pairs.
    pub headers: BTreeMap<String, String>,
    /// JSON body, if any.
    pub body: Option<JsonValue>,
}

/// A compiled request template from one `exec` entry.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    method: Method,
    uri: StringTemplate,
    headers: Vec<(String, StringTemplate)>,
    body: Option<ValueTemplate>,
}

impl RequestTemplate {
    /// Compiles an `exec` definition.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidTemplate` for an invalid method, URI,
    /// header or body template.
    pub fn compile(def: &ExecDefinition) -> Result<Self, RuleError> {
        let method = Method::from_bytes(def.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| RuleError::InvalidTemplate(format!("invalid method '{}'", def.method)))?;
        if def.uri.trim().is_empty() {
            return Err(RuleError::InvalidTemplate("exec uri is empty".to_string()));
        }
        let uri = StringTemplate::compile(&def.uri)?;
        let headers = def
            .headers
            .iter()
            .map(|(k, v)| Ok((k.to_ascii_lowercase(), StringTemplate::compile(v)?)))
            .collect::<Result<Vec<_>, RuleError>>()?;
        let body = def.body.as_ref().map(ValueTemplate::compile).transpose()?;
        Ok(Self {
            method,
            uri,
            headers,
            body,
        })
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Expands the template into a concrete request.
    pub fn expand(&self, ctx: &TemplateContext<'_>) -> ExpandedRequest {
        ExpandedRequest {
            method: self.method.clone(),
            uri: self.uri.expand_uri(ctx),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.expand_string(ctx)))
                .collect(),
            body: self.body.as_ref().map(|b| b.expand(ctx)),
        }
    }
}
