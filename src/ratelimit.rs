//! Rate limiting
//!
//! The engine consults a [`RateLimiter`] before executing a matched event
//! and feeds the outcome back afterwards. Two kinds are tracked: every
//! execution (`Exec`) and every 5xx failure (`Failure`). Kinds without a
//! configured limit are always allowed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::event::Event;

/// Entries kept before expired windows are swept.
const SWEEP_THRESHOLD: usize = 10_000;

/// What is being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitKind {
    /// Every execution of a rule for a resource.
    Exec,
    /// Every server-side failure of a rule for a resource.
    Failure,
}

impl RateLimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { message: String, key: String },
}

impl RateLimitDecision {
    pub fn is_limited(&self) -> bool {
        matches!(self, RateLimitDecision::Limited { .. })
    }
}

/// Rate-limit collaborator.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Checks whether `key` is currently over its limit.
    async fn check(&self, kind: RateLimitKind, key: &str) -> RateLimitDecision;

    /// Counts one occurrence for `key`.
    async fn increment(&self, kind: RateLimitKind, key: &str) -> RateLimitDecision;
}

/// Builds the rate-limit key of a rule for an event: `{rule}:{meta.uri}`.
pub fn rate_limit_key(rule: &str, event: &Event) -> String {
    format!("{}:{}", rule, event.meta().uri)
}

/// Limiter that never limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn check(&self, _kind: RateLimitKind, _key: &str) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }

    async fn increment(&self, _kind: RateLimitKind, _key: &str) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

/// A fixed-window limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    /// Occurrences allowed per window. Once `limit` occurrences are
    /// counted, checks report the key as limited until the window ends.
    pub limit: u64,
    /// Window length.
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    window_start: Instant,
    count: u64,
}

/// In-process fixed-window rate limiter.
#[derive(Debug)]
pub struct WindowRateLimiter {
    limits: HashMap<RateLimitKind, WindowLimit>,
    counters: Mutex<HashMap<(RateLimitKind, String), Counter>>,
}

impl WindowRateLimiter {
    /// Creates a limiter; kinds missing from `limits` are unlimited.
    pub fn new(limits: impl IntoIterator<Item = (RateLimitKind, WindowLimit)>) -> Self {
        Self {
            limits: limits.into_iter().collect(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn decide(kind: RateLimitKind, key: &str, limit: &WindowLimit, count: u64) -> RateLimitDecision {
        if count >= limit.limit {
            RateLimitDecision::Limited {
                message: format!(
                    "{} limit of {} per {:?} exceeded",
                    kind, limit.limit, limit.interval
                ),
                key: key.to_string(),
            }
        } else {
            RateLimitDecision::Allowed
        }
    }

    fn current(counter: Option<&Counter>, limit: &WindowLimit, now: Instant) -> u64 {
        counter
            .filter(|c| now.duration_since(c.window_start) < limit.interval)
            .map_or(0, |c| c.count)
    }
}

#[async_trait]
impl RateLimiter for WindowRateLimiter {
    async fn check(&self, kind: RateLimitKind, key: &str) -> RateLimitDecision {
        let Some(limit) = self.limits.get(&kind) else {
            return RateLimitDecision::Allowed;
        };
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let count = Self::current(
            counters.get(&(kind, key.to_string())),
            limit,
            Instant::now(),
        );
        Self::decide(kind, key, limit, count)
    }

    async fn increment(&self, kind: RateLimitKind, key: &str) -> RateLimitDecision {
        let Some(limit) = self.limits.get(&kind) else {
            return RateLimitDecision::Allowed;
        };
        let now = Instant::now();
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if counters.len() >= SWEEP_THRESHOLD {
            counters.retain(|(k, _), c| {
                self.limits
                    .get(k)
                    .is_some_and(|l| now.duration_since(c.window_start) < l.interval)
            });
        }
        let entry = counters
            .entry((kind, key.to_string()))
            .or_insert(Counter {
                window_start: now,
                count: 0,
            });
        if now.duration_since(entry.window_start) >= limit.interval {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.count += 1;
        Self::decide(kind, key, limit, entry.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u64) -> WindowRateLimiter {
        WindowRateLimiter::new([(
            RateLimitKind::Failure,
            WindowLimit {
                limit,
                interval: Duration::from_secs(60),
            },
        )])
    }

    #[tokio::test]
    async fn test_unconfigured_kind_allowed() {
        let limiter = limiter(1);
        for _ in 0..5 {
            limiter.increment(RateLimitKind::Exec, "k").await;
        }
        assert_eq!(
            limiter.check(RateLimitKind::Exec, "k").await,
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_limited_once_limit_reached() {
        let limiter = limiter(2);
        assert!(!limiter.check(RateLimitKind::Failure, "k").await.is_limited());
        assert!(!limiter.increment(RateLimitKind::Failure, "k").await.is_limited());
        assert!(!limiter.check(RateLimitKind::Failure, "k").await.is_limited());
        assert!(limiter.increment(RateLimitKind::Failure, "k").await.is_limited());
        match limiter.check(RateLimitKind::Failure, "k").await {
            RateLimitDecision::Limited { key, .. } => assert_eq!(key, "k"),
            other => panic!("expected limited, got {:?}", other),
        }
        assert!(!limiter.check(RateLimitKind::Failure, "other").await.is_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = limiter(1);
        limiter.increment(RateLimitKind::Failure, "k").await;
        limiter.increment(RateLimitKind::Failure, "k").await;
        assert!(limiter.check(RateLimitKind::Failure, "k").await.is_limited());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!limiter.check(RateLimitKind::Failure, "k").await.is_limited());
        limiter.increment(RateLimitKind::Failure, "k").await;
        assert!(limiter.check(RateLimitKind::Failure, "k").await.is_limited());
    }

    #[tokio::test]
    async fn test_limit_allows_exactly_limit_occurrences() {
        let limiter = WindowRateLimiter::new([(
            RateLimitKind::Exec,
            WindowLimit {
                limit: 2,
                interval: Duration::from_secs(60),
            },
        )]);
        let mut allowed = 0;
        for _ in 0..10 {
            if !limiter.check(RateLimitKind::Exec, "k").await.is_limited() {
                limiter.increment(RateLimitKind::Exec, "k").await;
                allowed += 1;
            }
        }
        assert_eq!(allowed, 2);
    }

    #[tokio::test]
    async fn test_noop_always_allows() {
        assert!(!NoopRateLimiter
            .increment(RateLimitKind::Failure, "k")
            .await
            .is_limited());
    }

    #[test]
    fn test_key_format() {
        let event = Event::from_value(serde_json::json!({"meta": {"uri": "https://d.org/wiki/X"}}))
            .unwrap();
        assert_eq!(rate_limit_key("purge", &event), "purge:https://d.org/wiki/X");
    }
}
