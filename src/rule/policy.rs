//! Retry and ignore policies

use std::time::Duration;

use serde_json::Value as JsonValue;

use super::definition::StatusDefinition;
use super::RuleError;

/// One status pattern: three characters, each a digit or `x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatusPattern([Option<u8>; 3]);

impl StatusPattern {
    fn parse(value: &JsonValue) -> Result<Self, RuleError> {
        let text = match value {
            JsonValue::Number(n) => n.to_string(),
            JsonValue::String(s) => s.trim().to_ascii_lowercase(),
            other => {
                return Err(RuleError::InvalidOption(format!(
                    "invalid status pattern {}",
                    other
                )))
            }
        };
        let bytes = text.as_bytes();
        if bytes.len() != 3 {
            return Err(RuleError::InvalidOption(format!(
                "invalid status pattern '{}'",
                text
            )));
        }
        let mut digits = [None; 3];
        for (slot, byte) in digits.iter_mut().zip(bytes) {
            *slot = match byte {
                b'0'..=b'9' => Some(byte - b'0'),
                b'x' => None,
                _ => {
                    return Err(RuleError::InvalidOption(format!(
                        "invalid status pattern '{}'",
                        text
                    )))
                }
            };
        }
        Ok(Self(digits))
    }

    fn matches(&self, status: u16) -> bool {
        if !(100..=999).contains(&status) {
            return false;
        }
        let actual = [
            (status / 100) as u8,
            ((status / 10) % 10) as u8,
            (status % 10) as u8,
        ];
        self.0
            .iter()
            .zip(actual)
            .all(|(want, got)| want.map_or(true, |w| w == got))
    }
}

/// A set of status patterns such as `[412, "5xx"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFilter {
    patterns: Vec<StatusPattern>,
}

impl StatusFilter {
    /// Compiles a status list.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidOption` for an entry that is neither a code
    /// nor a three-character wildcard.
    pub fn compile(def: &StatusDefinition) -> Result<Self, RuleError> {
        let patterns = def
            .status
            .iter()
            .map(StatusPattern::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Returns true if any pattern accepts the status.
    pub fn matches(&self, status: u16) -> bool {
        self.patterns.iter().any(|p| p.matches(status))
    }
}

/// Retry behaviour of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    delay: Duration,
    factor: f64,
    limit: u32,
    retry_on: StatusFilter,
}

impl RetryPolicy {
    /// Creates a policy.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidOption` when the factor is below 1 or not
    /// finite.
    pub fn new(
        delay_ms: u64,
        factor: f64,
        limit: u32,
        retry_on: StatusFilter,
    ) -> Result<Self, RuleError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(RuleError::InvalidOption(format!(
                "retry_factor must be >= 1, got {}",
                factor
            )));
        }
        Ok(Self {
            delay: Duration::from_millis(delay_ms),
            factor,
            limit,
            retry_on,
        })
    }

    /// Base delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Maximum number of retries.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Delay before the attempt made with `retries_left` budget remaining:
    /// `delay * factor^(limit - retries_left)`.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeprop::rule::{RetryPolicy, StatusFilter};
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(500, 6.0, 2, StatusFilter::default()).unwrap();
    /// assert_eq!(policy.backoff(2), Duration::from_millis(500));
    /// assert_eq!(policy.backoff(1), Duration::from_millis(3000));
    /// ```
    pub fn backoff(&self, retries_left: u32) -> Duration {
        let attempt = self.limit.saturating_sub(retries_left);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.delay.as_millis() as f64 * self.factor.powi(exponent);
        if millis.is_finite() {
            Duration::from_millis(millis.min(u64::MAX as f64) as u64)
        } else {
            Duration::from_millis(u64::MAX)
        }
    }

    /// Returns true if a downstream failure with this status may be retried.
    ///
    /// Failures without a status (internal errors) are never retried.
    pub fn should_retry(&self, status: Option<u16>) -> bool {
        status.is_some_and(|s| self.retry_on.matches(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(values: JsonValue) -> StatusFilter {
        let status = values.as_array().cloned().unwrap_or_default();
        StatusFilter::compile(&StatusDefinition { status }).unwrap()
    }

    #[test]
    fn test_wildcards() {
        let f = filter(json!(["5xx", 412, "40x"]));
        assert!(f.matches(500));
        assert!(f.matches(503));
        assert!(f.matches(412));
        assert!(f.matches(404));
        assert!(!f.matches(410));
        assert!(!f.matches(200));
    }

    #[test]
    fn test_invalid_patterns() {
        for bad in [json!(["5x"]), json!(["abc"]), json!([true]), json!([5000])] {
            let status = bad.as_array().cloned().unwrap();
            assert!(StatusFilter::compile(&StatusDefinition { status }).is_err());
        }
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy::new(100, 2.0, 3, StatusFilter::default()).unwrap();
        assert_eq!(policy.backoff(3), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(1), Duration::from_millis(400));
        assert_eq!(policy.backoff(0), Duration::from_millis(800));
    }

    #[test]
    fn test_should_retry_requires_status() {
        let policy = RetryPolicy::new(100, 2.0, 3, filter(json!(["5xx"]))).unwrap();
        assert!(policy.should_retry(Some(502)));
        assert!(!policy.should_retry(Some(404)));
        assert!(!policy.should_retry(None));
    }

    #[test]
    fn test_factor_below_one_rejected() {
        assert!(RetryPolicy::new(100, 0.5, 3, StatusFilter::default()).is_err());
    }
}
