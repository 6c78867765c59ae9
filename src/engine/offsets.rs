//! Offset bookkeeping for safe commits
//!
//! Records complete out of order, but a partition may only be committed up
//! to the highest offset below which nothing is still executing. The
//! tracker keeps, per partition, the offsets in flight, the settled offsets
//! waiting for the next flush, and the last committed offset.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

type PartitionKey = (String, i32);

/// One commit to issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Where a stale entry is stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleKind {
    InFlight,
    PendingCommit,
}

/// An entry older than the staleness threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleEntry {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub age: Duration,
    pub kind: StaleKind,
}

#[derive(Debug, Default)]
struct PartitionState {
    in_flight: BTreeMap<i64, Instant>,
    pending: BTreeMap<i64, Instant>,
    committed: Option<i64>,
}

impl PartitionState {
    fn lowest_in_flight(&self) -> Option<i64> {
        self.in_flight.keys().next().copied()
    }

    fn is_committed(&self, offset: i64) -> bool {
        self.committed.is_some_and(|c| offset <= c)
    }
}

/// Per-engine offset tracker.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<PartitionKey, PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&mut self, topic: &str, partition: i32) -> &mut PartitionState {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
    }

    /// Marks a record as in flight.
    pub fn register(&mut self, topic: &str, partition: i32, offset: i64, now: Instant) {
        self.partition(topic, partition).in_flight.insert(offset, now);
    }

    /// Settles a record and queues the safe offset for the next flush.
    ///
    /// When a lower offset of the same partition is still in flight the
    /// candidate is lowered to just below it. Returns the queued offset.
    pub fn settle(&mut self, topic: &str, partition: i32, offset: i64, now: Instant) -> Option<i64> {
        let state = self.partition(topic, partition);
        state.in_flight.remove(&offset);
        let candidate = match state.lowest_in_flight() {
            Some(lowest) if lowest <= offset => lowest - 1,
            _ => offset,
        };
        if candidate < 0 || state.is_committed(candidate) {
            return None;
        }
        state.pending.entry(candidate).or_insert(now);
        Some(candidate)
    }

    /// Settles a record that was never registered with probability `p`.
    ///
    /// Used for records that matched nothing so that rarely matching rules
    /// still advance their offsets on busy topics.
    pub fn settle_sampled<R: Rng + ?Sized>(
        &mut self,
        topic: &str,
        partition: i32,
        offset: i64,
        p: f64,
        rng: &mut R,
        now: Instant,
    ) -> Option<i64> {
        if rng.random::<f64>() < p {
            self.settle(topic, partition, offset, now)
        } else {
            None
        }
    }

    /// Removes and returns the highest committable offset per partition.
    ///
    /// Pending offsets at or above the lowest in-flight offset stay queued.
    pub fn take_committable(&mut self) -> Vec<CommitRequest> {
        let mut commits = Vec::new();
        for ((topic, partition), state) in self.partitions.iter_mut() {
            let limit = state.lowest_in_flight().unwrap_or(i64::MAX);
            let Some((&highest, _)) = state.pending.range(..limit).next_back() else {
                continue;
            };
            state.pending = state.pending.split_off(&(highest + 1));
            if state.is_committed(highest) {
                continue;
            }
            commits.push(CommitRequest {
                topic: topic.clone(),
                partition: *partition,
                offset: highest,
            });
        }
        commits.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        commits
    }

    /// Records a successful commit.
    pub fn mark_committed(&mut self, commit: &CommitRequest) {
        let state = self.partition(&commit.topic, commit.partition);
        state.committed = Some(state.committed.map_or(commit.offset, |c| c.max(commit.offset)));
        state.pending = state.pending.split_off(&(commit.offset + 1));
    }

    /// Puts a failed commit back for the next flush.
    pub fn requeue(&mut self, commit: &CommitRequest, now: Instant) {
        let state = self.partition(&commit.topic, commit.partition);
        if !state.is_committed(commit.offset) {
            state.pending.entry(commit.offset).or_insert(now);
        }
    }

    /// Last committed offset of a partition.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .get(&(topic.to_string(), partition))
            .and_then(|s| s.committed)
    }

    /// Number of records in flight.
    pub fn in_flight_count(&self) -> usize {
        self.partitions.values().map(|s| s.in_flight.len()).sum()
    }

    /// Number of offsets waiting for a flush.
    pub fn pending_count(&self) -> usize {
        self.partitions.values().map(|s| s.pending.len()).sum()
    }

    /// Entries older than `threshold`.
    pub fn stale(&self, now: Instant, threshold: Duration) -> Vec<StaleEntry> {
        let mut stale = Vec::new();
        for ((topic, partition), state) in &self.partitions {
            let sets = [
                (&state.in_flight, StaleKind::InFlight),
                (&state.pending, StaleKind::PendingCommit),
            ];
            for (set, kind) in sets {
                for (&offset, &since) in set {
                    let age = now.saturating_duration_since(since);
                    if age > threshold {
                        stale.push(StaleEntry {
                            topic: topic.clone(),
                            partition: *partition,
                            offset,
                            age,
                            kind,
                        });
                    }
                }
            }
        }
        stale
    }
}
