//! Event message types
//!
//! This module provides the structured messages that flow through the
//! engine: the externally produced [`Event`], the [`RetryEvent`] envelope
//! carried on retry topics, and the [`ErrorEvent`] produced on terminal
//! failure.
//!
//! # Example
//!
//! ```rust
//! use changeprop::event::Event;
//!
//! let payload = br#"{
//!   "meta": {
//!     "stream": "resource_change",
//!     "uri": "https://en.wikipedia.org/wiki/Main_Page",
//!     "domain": "en.wikipedia.org",
//!     "id": "b0caf18d-6c7f-4403-947d-2712bbe28610",
//!     "dt": "2024-01-01T00:00:00Z"
//!   },
//!   "tags": ["purge"]
//! }"#;
//!
//! let event = Event::from_slice(payload).unwrap();
//! assert_eq!(event.meta().domain, "en.wikipedia.org");
//! assert!(event.dt().is_some());
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::ChangepropError;

/// Metadata block shared by every event.
///
/// All fields are lenient: a missing field deserializes to its default so
/// that rules can match events that carry no metadata at all. Events
/// decode each field on its own, so a mistyped field only loses itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Stream (topic) the event was originally produced to.
    #[serde(default)]
    pub stream: String,

    /// URI of the resource the event describes.
    #[serde(default)]
    pub uri: String,

    /// Domain the resource belongs to.
    #[serde(default)]
    pub domain: String,

    /// Unique event identifier.
    #[serde(default)]
    pub id: String,

    /// Identifier of the request that caused the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Event timestamp (ISO-8601 string or epoch number).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dt: Option<JsonValue>,
}

impl EventMeta {
    /// Decodes the `meta` block of an event field by field.
    fn from_json(meta: &JsonValue) -> Self {
        let text = |field: &str| -> Option<String> {
            let value = meta.get(field).filter(|v| !v.is_null())?;
            let text = value.as_str().map(str::to_string);
            if text.is_none() {
                debug!(field, value = %value, "Ignoring mistyped event meta field");
            }
            text
        };
        Self {
            stream: text("stream").unwrap_or_default(),
            uri: text("uri").unwrap_or_default(),
            domain: text("domain").unwrap_or_default(),
            id: text("id").unwrap_or_default(),
            request_id: text("request_id"),
            dt: meta.get("dt").filter(|v| !v.is_null()).cloned(),
        }
    }

    /// Builds metadata for an event emitted by this service.
    ///
    /// The new metadata inherits `uri`, `domain` and `request_id` from the
    /// event it is derived from and receives a fresh id and timestamp.
    pub fn derived(stream: &str, from: &EventMeta) -> Self {
        Self {
            stream: stream.to_string(),
            uri: from.uri.clone(),
            domain: from.domain.clone(),
            id: uuid::Uuid::new_v4().to_string(),
            request_id: from.request_id.clone(),
            dt: Some(JsonValue::String(Utc::now().to_rfc3339())),
        }
    }
}

/// Root event reference used to discard stale derived events.
#[derive(Debug, Clone, PartialEq)]
pub struct RootEvent {
    /// Signature identifying the root change.
    pub signature: String,
    /// Time of the root change.
    pub dt: DateTime<Utc>,
}

/// An externally produced structured message.
///
/// The full JSON body is kept as received (rules match against arbitrary
/// fields); the metadata block is decoded once for convenient access.
/// Events are immutable once received.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    body: JsonValue,
    meta: EventMeta,
}

impl Event {
    /// Decodes an event from a raw payload.
    ///
    /// # Errors
    ///
    /// Returns `ChangepropError::Parse` if the payload is not a JSON object.
    pub fn from_slice(payload: &[u8]) -> Result<Self, ChangepropError> {
        let body: JsonValue = serde_json::from_slice(payload)
            .map_err(|e| ChangepropError::Parse(format!("invalid JSON payload: {}", e)))?;
        Self::from_value(body)
    }

    /// Wraps an already decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns `ChangepropError::Parse` if the value is not a JSON object.
    pub fn from_value(body: JsonValue) -> Result<Self, ChangepropError> {
        if !body.is_object() {
            return Err(ChangepropError::Parse(
                "event payload must be a JSON object".to_string(),
            ));
        }
        let meta = body
            .get("meta")
            .map(EventMeta::from_json)
            .unwrap_or_default();
        Ok(Self { body, meta })
    }

    /// Full JSON body of the event.
    pub fn body(&self) -> &JsonValue {
        &self.body
    }

    /// Decoded metadata block.
    pub fn meta(&self) -> &EventMeta {
        &self.meta
    }

    /// Consumes the event, returning its JSON body.
    pub fn into_value(self) -> JsonValue {
        self.body
    }

    /// Event timestamp, if present and parseable.
    pub fn dt(&self) -> Option<DateTime<Utc>> {
        self.meta.dt.as_ref().and_then(parse_timestamp)
    }

    /// Requested execution time, if the event asks for delayed execution.
    pub fn delay_until(&self) -> Option<DateTime<Utc>> {
        self.body.get("delay_until").and_then(parse_timestamp)
    }

    /// Root event reference, if present and complete.
    pub fn root_event(&self) -> Option<RootEvent> {
        let root = self.body.get("root_event")?;
        let signature = root.get("signature")?.as_str()?.to_string();
        let dt = root.get("dt").and_then(parse_timestamp)?;
        Some(RootEvent { signature, dt })
    }

    /// Content hash of the event, if present.
    pub fn sha1(&self) -> Option<&str> {
        self.body.get("sha1").and_then(JsonValue::as_str)
    }

    /// Chain of `stream:uri` pairs that led to this event.
    pub fn triggered_by(&self) -> Option<&str> {
        self.body.get("triggered_by").and_then(JsonValue::as_str)
    }

    /// Extends an existing triggered-by chain with this event's `stream:uri`.
    pub fn extend_chain(&self, chain: Option<&str>) -> String {
        let link = format!("{}:{}", self.meta.stream, self.meta.uri);
        match chain.filter(|c| !c.is_empty()) {
            Some(c) => format!("{},{}", c, link),
            None => link,
        }
    }

    /// Serializes the event back to JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.body).unwrap_or_default()
    }
}

/// Parses an ISO-8601 string or a numeric epoch (seconds or milliseconds).
pub fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok(),
        JsonValue::Number(n) => {
            let raw = n.as_f64()?;
            // Epoch values above 1e12 are milliseconds.
            let millis = if raw.abs() >= 1e12 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}

/// Envelope carried on a retry topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEvent {
    /// Metadata of the envelope itself.
    pub meta: EventMeta,

    /// Identity of the rule instance that emitted the envelope.
    pub emitter_id: String,

    /// Remaining retry budget.
    pub retries_left: u32,

    /// The event whose execution failed.
    pub original_event: JsonValue,

    /// Chain of `stream:uri` pairs that led to this retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,

    /// HTTP status of the failure, when it came from a downstream call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_status: Option<u16>,

    /// Human readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RetryEvent {
    /// Wraps a failed event for delivery on `retry_stream`.
    pub fn new(
        retry_stream: &str,
        original: &Event,
        emitter_id: &str,
        retries_left: u32,
        error_status: Option<u16>,
        reason: &str,
    ) -> Self {
        Self {
            meta: EventMeta::derived(retry_stream, original.meta()),
            emitter_id: emitter_id.to_string(),
            retries_left,
            original_event: original.body().clone(),
            triggered_by: Some(original.extend_chain(original.triggered_by())),
            error_status,
            reason: Some(reason.to_string()),
        }
    }

    /// Decodes the wrapped original event.
    ///
    /// # Errors
    ///
    /// Returns `ChangepropError::Parse` if the original event is not an object.
    pub fn original(&self) -> Result<Event, ChangepropError> {
        Event::from_value(self.original_event.clone())
    }
}

/// Message produced to the error topic on unrecoverable failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Metadata of the error message.
    pub meta: EventMeta,

    /// Identity of the rule instance that emitted the error.
    pub emitter_id: String,

    /// Raw original payload (lossy UTF-8 if it could not be parsed).
    pub raw_event: String,

    /// Error description.
    pub message: String,

    /// Error chain or trace, if available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// HTTP status of the failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_status: Option<u16>,

    /// Response body of the failure, if decodable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_body: Option<String>,

    /// Retry budget left when the failure became terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries_left: Option<u32>,

    /// Original event, when it was structured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_event: Option<JsonValue>,
}

impl ErrorEvent {
    /// Builds an error message for a payload that could not be parsed.
    pub fn unparseable(error_stream: &str, emitter_id: &str, raw: &[u8], message: &str) -> Self {
        Self {
            meta: EventMeta {
                stream: error_stream.to_string(),
                id: uuid::Uuid::new_v4().to_string(),
                dt: Some(JsonValue::String(Utc::now().to_rfc3339())),
                ..EventMeta::default()
            },
            emitter_id: emitter_id.to_string(),
            raw_event: String::from_utf8_lossy(raw).into_owned(),
            message: message.to_string(),
            stack: None,
            error_status: None,
            error_body: None,
            retries_left: None,
            original_event: None,
        }
    }

    /// Builds an error message for an event whose execution failed terminally.
    pub fn for_event(error_stream: &str, emitter_id: &str, event: &Event, message: &str) -> Self {
        Self {
            meta: EventMeta::derived(error_stream, event.meta()),
            emitter_id: emitter_id.to_string(),
            raw_event: serde_json::to_string(event.body()).unwrap_or_default(),
            message: message.to_string(),
            stack: None,
            error_status: None,
            error_body: None,
            retries_left: None,
            original_event: Some(event.body().clone()),
        }
    }

    /// Builds an error message for a record whose processing crashed.
    ///
    /// The report describes `original` when the record could be decoded
    /// and falls back to the raw payload otherwise.
    pub fn internal(
        error_stream: &str,
        emitter_id: &str,
        raw: &[u8],
        original: Option<&Event>,
        stack: String,
    ) -> Self {
        let message = "internal error while processing event";
        let mut report = match original {
            Some(event) => Self::for_event(error_stream, emitter_id, event, message),
            None => Self::unparseable(error_stream, emitter_id, raw, message),
        };
        report.stack = Some(stack);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_without_meta_is_accepted() {
        let event = Event::from_value(json!({"number": 1, "string": "oolala"})).unwrap();
        assert_eq!(event.meta(), &EventMeta::default());
        assert!(event.dt().is_none());
    }

    #[test]
    fn test_mistyped_meta_field_keeps_the_others() {
        let event = Event::from_value(json!({
            "meta": {
                "id": "abc",
                "uri": "https://en.wikipedia.org/wiki/Foo",
                "domain": 42,
                "request_id": ["x"],
                "dt": "2024-01-01T00:00:00Z"
            }
        }))
        .unwrap();
        assert_eq!(event.meta().id, "abc");
        assert_eq!(event.meta().uri, "https://en.wikipedia.org/wiki/Foo");
        assert_eq!(event.meta().domain, "");
        assert_eq!(event.meta().request_id, None);
        assert!(event.dt().is_some());
    }

    #[test]
    fn test_non_object_payload_is_parse_error() {
        assert!(matches!(
            Event::from_slice(b"[1, 2, 3]"),
            Err(ChangepropError::Parse(_))
        ));
        assert!(matches!(
            Event::from_slice(b"not json"),
            Err(ChangepropError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let iso = parse_timestamp(&json!("2024-01-01T00:00:10Z")).unwrap();
        let secs = parse_timestamp(&json!(1704067210)).unwrap();
        let millis = parse_timestamp(&json!(1704067210000i64)).unwrap();
        assert_eq!(iso, secs);
        assert_eq!(iso, millis);
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }

    #[test]
    fn test_root_event_requires_signature_and_dt() {
        let event = Event::from_value(json!({
            "root_event": {"signature": "abc", "dt": "2024-01-01T00:00:00Z"}
        }))
        .unwrap();
        assert_eq!(event.root_event().unwrap().signature, "abc");

        let partial = Event::from_value(json!({"root_event": {"signature": "abc"}})).unwrap();
        assert!(partial.root_event().is_none());
    }

    #[test]
    fn test_extend_chain() {
        let event = Event::from_value(json!({
            "meta": {"stream": "s", "uri": "u"},
            "triggered_by": "a:b"
        }))
        .unwrap();
        assert_eq!(event.extend_chain(event.triggered_by()), "a:b,s:u");
        assert_eq!(event.extend_chain(None), "s:u");
    }

    #[test]
    fn test_retry_event_wraps_original() {
        let event = Event::from_value(json!({
            "meta": {"stream": "s", "uri": "u", "domain": "d", "request_id": "r"}
        }))
        .unwrap();
        let retry = RetryEvent::new("change-prop.retry.s", &event, "cp#rule", 2, Some(500), "boom");
        assert_eq!(retry.meta.stream, "change-prop.retry.s");
        assert_eq!(retry.meta.request_id.as_deref(), Some("r"));
        assert_eq!(retry.retries_left, 2);
        assert_eq!(retry.triggered_by.as_deref(), Some("s:u"));
        assert_eq!(retry.original().unwrap(), event);

        let encoded = serde_json::to_string(&retry).unwrap();
        let decoded: RetryEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, retry);
    }

    #[test]
    fn test_error_event_keeps_raw_payload() {
        let error = ErrorEvent::unparseable("change-prop.error", "cp#rule", b"\xffnot json", "bad");
        assert!(error.raw_event.contains("not json"));
        assert!(error.original_event.is_none());
    }
}
