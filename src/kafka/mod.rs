//! Broker layer
//!
//! The engine talks to the message bus only through the traits defined
//! here:
//!
//! - [`BrokerConsumer`] for one consumer-group subscription,
//! - [`BrokerProducer`] for retry, error and re-enqueue messages,
//! - [`TopicMetadata`] for topic discovery,
//! - [`ConsumerFactory`] to create consumers per group.
//!
//! [`client::KafkaClientFactory`] implements them on top of `rdkafka`;
//! [`memory::MemoryBroker`] implements them in process.

pub mod client;
pub mod config;
pub mod memory;

pub use client::KafkaClientFactory;
pub use config::{KafkaClientConfig, SaslConfig, SaslMechanism, SecurityProtocol, SslConfig};
pub use memory::MemoryBroker;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ChangepropError;

/// One record pulled from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Raw payload, if any.
    pub value: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds, if any.
    pub timestamp: Option<i64>,
}

/// Errors surfaced by broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Reached the end of a partition.
    #[error("end of partition")]
    PartitionEof,

    /// Read timed out.
    #[error("operation timed out")]
    Timeout,

    /// The connection to the brokers is broken.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Any other broker failure.
    #[error("{0}")]
    Other(String),
}

impl From<BrokerError> for ChangepropError {
    fn from(err: BrokerError) -> Self {
        ChangepropError::Broker(err.to_string())
    }
}

/// A consumer-group subscription.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Subscribes to a set of topics, replacing any previous subscription.
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Pulls up to `max` records; an empty result means no data right now.
    async fn pull(&self, max: usize) -> Result<Vec<Record>, BrokerError>;

    /// Acknowledges everything up to and including `offset`.
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError>;

    /// Leaves the group.
    async fn disconnect(&self);
}

/// Message producer.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Produces a payload and resolves once the broker acknowledged it.
    async fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;
}

/// Topic listing used by discovery.
#[async_trait]
pub trait TopicMetadata: Send + Sync {
    /// All topic names known to the cluster.
    async fn topic_names(&self) -> Result<Vec<String>, BrokerError>;
}

/// Creates consumers bound to a consumer group.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    /// Creates a consumer in `group_id`; new groups start at the latest offset.
    async fn create_consumer(&self, group_id: &str)
        -> Result<Arc<dyn BrokerConsumer>, BrokerError>;
}
