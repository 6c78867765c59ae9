//! Event deduplication
//!
//! The engine asks a [`Deduplicator`] whether an event was already handled
//! for a rule. [`DedupWindow`] answers from a bounded ring of recently seen
//! events owned by one rule instance; the oldest entry is evicted once the
//! ring is full.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::event::Event;

/// Answer of a deduplication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// The event was already handled.
    Duplicate,
    /// First sighting; the event has been recorded.
    Unique,
    /// No deduplication store is configured.
    NotConfigured,
}

impl DedupOutcome {
    /// Returns true only for [`DedupOutcome::Duplicate`].
    pub fn is_duplicate(self) -> bool {
        matches!(self, DedupOutcome::Duplicate)
    }
}

/// Deduplication collaborator.
#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// Checks and records `event` under `rule_key`.
    async fn check(&self, rule_key: &str, event: &Event) -> DedupOutcome;

    /// Marks the execution of a recorded event as finished.
    async fn complete(&self, _rule_key: &str, _event: &Event) {}
}

/// Deduplicator that is never configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDeduplicator;

#[async_trait]
impl Deduplicator for NoopDeduplicator {
    async fn check(&self, _rule_key: &str, _event: &Event) -> DedupOutcome {
        DedupOutcome::NotConfigured
    }
}

/// Tolerance applied when comparing an event's `dt` with a recorded sha1.
const SHA1_TOLERANCE_SECS: i64 = 1;

#[derive(Debug, Clone)]
struct Slot {
    id: Option<String>,
    sha1: Option<String>,
    /// Check time until the execution completes, then completion time.
    recorded_at: DateTime<Utc>,
    root: Option<(String, DateTime<Utc>)>,
}

/// Bounded ring of recently seen events.
#[derive(Debug)]
pub struct RecentEvents {
    slots: Vec<Option<Slot>>,
    next: usize,
    ids: HashMap<String, usize>,
    sha1s: HashMap<String, usize>,
    roots: HashMap<String, usize>,
}

fn scoped(rule_key: &str, value: &str) -> String {
    format!("{}\0{}", rule_key, value)
}

impl RecentEvents {
    /// Creates a ring holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            next: 0,
            ids: HashMap::new(),
            sha1s: HashMap::new(),
            roots: HashMap::new(),
        }
    }

    /// Maximum number of events remembered.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of events currently remembered.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks `event` against the ring as of `now`, recording it if unique.
    ///
    /// A sha1 entry is stamped with `now` until [`RecentEvents::complete_at`]
    /// replaces it with the completion time of the execution.
    pub fn check_at(&mut self, rule_key: &str, event: &Event, now: DateTime<Utc>) -> DedupOutcome {
        let meta = event.meta();
        let id = (!meta.id.is_empty()).then(|| scoped(rule_key, &meta.id));
        let sha1 = event.sha1().map(|s| scoped(rule_key, s));
        let root = event
            .root_event()
            .map(|r| (scoped(rule_key, &r.signature), r.dt));

        if let Some(key) = &id {
            if self.ids.contains_key(key) {
                return DedupOutcome::Duplicate;
            }
        }

        if let (Some(key), Some(dt)) = (&sha1, event.dt()) {
            if let Some(slot) = self.slot_for(&self.sha1s, key) {
                if dt < slot.recorded_at - ChronoDuration::seconds(SHA1_TOLERANCE_SECS) {
                    return DedupOutcome::Duplicate;
                }
            }
        }

        if let Some((key, dt)) = &root {
            let newer_seen = self
                .slot_for(&self.roots, key)
                .and_then(|slot| slot.root.as_ref())
                .is_some_and(|(_, seen)| seen > dt);
            if newer_seen {
                return DedupOutcome::Duplicate;
            }
        }

        self.record(Slot {
            id,
            sha1,
            recorded_at: now,
            root,
        });
        DedupOutcome::Unique
    }

    /// Stamps the sha1 entry recorded for `event` with its completion time.
    pub fn complete_at(&mut self, rule_key: &str, event: &Event, now: DateTime<Utc>) {
        let Some(key) = event.sha1().map(|s| scoped(rule_key, s)) else {
            return;
        };
        let Some(&index) = self.sha1s.get(&key) else {
            return;
        };
        if let Some(slot) = self.slots.get_mut(index).and_then(Option::as_mut) {
            slot.recorded_at = now;
        }
    }

    fn slot_for(&self, index: &HashMap<String, usize>, key: &str) -> Option<&Slot> {
        index
            .get(key)
            .and_then(|&i| self.slots.get(i))
            .and_then(Option::as_ref)
    }

    fn record(&mut self, slot: Slot) {
        let index = self.next;
        if let Some(old) = self.slots[index].take() {
            let keys = [
                (old.id, &mut self.ids),
                (old.sha1, &mut self.sha1s),
                (old.root.map(|(k, _)| k), &mut self.roots),
            ];
            for (key, map) in keys {
                if let Some(key) = key {
                    if map.get(&key) == Some(&index) {
                        map.remove(&key);
                    }
                }
            }
        }
        if let Some(key) = &slot.id {
            self.ids.insert(key.clone(), index);
        }
        if let Some(key) = &slot.sha1 {
            self.sha1s.insert(key.clone(), index);
        }
        if let Some((key, _)) = &slot.root {
            self.roots.insert(key.clone(), index);
        }
        self.slots[index] = Some(slot);
        self.next = (index + 1) % self.slots.len();
    }
}

/// In-process deduplicator backed by a [`RecentEvents`] ring.
#[derive(Debug)]
pub struct DedupWindow {
    recent: Mutex<RecentEvents>,
}

impl DedupWindow {
    /// Creates a window remembering `capacity` events.
    ///
    /// # Examples
    ///
    /// ```
    /// use changeprop::dedup::{DedupWindow, DedupOutcome, Deduplicator};
    /// use changeprop::event::Event;
    /// use serde_json::json;
    ///
    /// # tokio_test::block_on(async {
    /// let window = DedupWindow::new(100);
    /// let event = Event::from_value(json!({"meta": {"id": "abc"}})).unwrap();
    /// assert_eq!(window.check("rule", &event).await, DedupOutcome::Unique);
    /// assert_eq!(window.check("rule", &event).await, DedupOutcome::Duplicate);
    /// # });
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(RecentEvents::new(capacity)),
        }
    }
}

#[async_trait]
impl Deduplicator for DedupWindow {
    async fn check(&self, rule_key: &str, event: &Event) -> DedupOutcome {
        let outcome = self
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_at(rule_key, event, Utc::now());
        if outcome.is_duplicate() {
            debug!(rule = %rule_key, event_id = %event.meta().id, "Duplicate event");
        }
        outcome
    }

    async fn complete(&self, rule_key: &str, event: &Event) {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .complete_at(rule_key, event, Utc::now());
    }
}
