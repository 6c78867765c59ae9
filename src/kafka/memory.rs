//! In-process broker
//!
//! [`MemoryBroker`] keeps every topic partition as an append-only log in
//! memory. Consumers track one read position per group and partition, new
//! groups start at the end of the log, and commits and produced messages
//! are recorded so tests can inspect them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    BrokerConsumer, BrokerError, BrokerProducer, ConsumerFactory, Record, TopicMetadata,
};

/// A recorded commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A recorded produce call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedMessage {
    pub topic: String,
    pub partition: i32,
    pub payload: Vec<u8>,
}

type PartitionKey = (String, i32);

#[derive(Default)]
struct BrokerState {
    logs: BTreeMap<PartitionKey, Vec<Vec<u8>>>,
    positions: HashMap<(String, PartitionKey), i64>,
    commits: Vec<CommitRecord>,
    produced: Vec<ProducedMessage>,
    pull_errors: VecDeque<BrokerError>,
    commit_failures: usize,
}

impl BrokerState {
    fn append(&mut self, topic: &str, partition: i32, payload: Vec<u8>) -> i64 {
        let log = self.logs.entry((topic.to_string(), partition)).or_default();
        log.push(payload);
        log.len() as i64 - 1
    }
}

/// In-process broker implementing every broker trait.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty topic with `partitions` partitions.
    pub async fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.state.lock().await;
        for partition in 0..partitions.max(1) {
            state
                .logs
                .entry((topic.to_string(), partition))
                .or_default();
        }
    }

    /// Appends a payload to partition 0 of `topic` and returns its offset.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> i64 {
        self.publish_to(topic, 0, payload).await
    }

    /// Appends a payload to a specific partition and returns its offset.
    pub async fn publish_to(&self, topic: &str, partition: i32, payload: Vec<u8>) -> i64 {
        self.state.lock().await.append(topic, partition, payload)
    }

    /// Messages produced through [`BrokerProducer`] to `topic`.
    pub async fn produced(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .produced
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Every recorded commit, oldest first.
    pub async fn commits(&self) -> Vec<CommitRecord> {
        self.state.lock().await.commits.clone()
    }

    /// Highest offset committed by `group` on a partition.
    pub async fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .await
            .commits
            .iter()
            .filter(|c| c.group == group && c.topic == topic && c.partition == partition)
            .map(|c| c.offset)
            .max()
    }

    /// Makes the next pull of any consumer fail with `error`.
    pub async fn inject_pull_error(&self, error: BrokerError) {
        self.state.lock().await.pull_errors.push_back(error);
    }

    /// Makes the next `count` commits fail.
    pub async fn fail_commits(&self, count: usize) {
        self.state.lock().await.commit_failures = count;
    }
}

#[async_trait]
impl BrokerProducer for MemoryBroker {
    async fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let partition = partition.unwrap_or(0);
        let mut state = self.state.lock().await;
        state.append(topic, partition, payload.clone());
        state.produced.push(ProducedMessage {
            topic: topic.to_string(),
            partition,
            payload,
        });
        Ok(())
    }
}

#[async_trait]
impl TopicMetadata for MemoryBroker {
    async fn topic_names(&self) -> Result<Vec<String>, BrokerError> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.logs.keys().map(|(t, _)| t.clone()).collect();
        names.dedup();
        Ok(names)
    }
}

#[async_trait]
impl ConsumerFactory for MemoryBroker {
    async fn create_consumer(
        &self,
        group_id: &str,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        Ok(Arc::new(MemoryConsumer {
            broker: self.clone(),
            group: group_id.to_string(),
            topics: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }))
    }
}

/// A consumer-group member of a [`MemoryBroker`].
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group: String,
    topics: Mutex<Vec<String>>,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().await;
        let existing: Vec<(PartitionKey, i64)> = state
            .logs
            .iter()
            .filter(|((topic, _), _)| topics.contains(topic))
            .map(|(key, log)| (key.clone(), log.len() as i64))
            .collect();
        for (key, end) in existing {
            state
                .positions
                .entry((self.group.clone(), key))
                .or_insert(end);
        }
        drop(state);
        *self.topics.lock().await = topics.to_vec();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn pull(&self, max: usize) -> Result<Vec<Record>, BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected("consumer closed".to_string()));
        }
        let topics = self.topics.lock().await.clone();
        let mut state = self.broker.state.lock().await;
        if let Some(error) = state.pull_errors.pop_front() {
            return Err(error);
        }

        let keys: Vec<PartitionKey> = state
            .logs
            .keys()
            .filter(|(topic, _)| topics.contains(topic))
            .cloned()
            .collect();
        let mut records = Vec::new();
        for key in keys {
            let position_key = (self.group.clone(), key.clone());
            // Partitions created after subscribing are read from the start.
            let mut position = state.positions.get(&position_key).copied().unwrap_or(0);
            let log_len = state.logs.get(&key).map_or(0, Vec::len) as i64;
            while position < log_len && records.len() < max {
                let value = state
                    .logs
                    .get(&key)
                    .and_then(|log| log.get(position as usize))
                    .cloned();
                records.push(Record {
                    topic: key.0.clone(),
                    partition: key.1,
                    offset: position,
                    value,
                    timestamp: None,
                });
                position += 1;
            }
            state.positions.insert(position_key, position);
            if records.len() >= max {
                break;
            }
        }
        Ok(records)
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock().await;
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(BrokerError::Other("commit rejected".to_string()));
        }
        state.commits.push(CommitRecord {
            group: self.group.clone(),
            topic: topic.to_string(),
            partition,
            offset,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
