//! rdkafka-backed broker clients

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use super::config::KafkaClientConfig;
use super::{BrokerConsumer, BrokerError, BrokerProducer, ConsumerFactory, Record, TopicMetadata};

/// How long a pull waits for the first record.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long a produce waits in the local queue.
const PRODUCE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a metadata request may take.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

fn client_config(settings: &[(String, String)]) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in settings {
        config.set(key, value);
    }
    config
}

/// Maps rdkafka errors onto the broker error taxonomy.
pub fn map_kafka_error(err: KafkaError) -> BrokerError {
    match err {
        KafkaError::PartitionEOF(_) => BrokerError::PartitionEof,
        KafkaError::MessageConsumption(code) | KafkaError::Global(code) => match code {
            RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut => {
                BrokerError::Timeout
            }
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure => {
                BrokerError::Disconnected(code.to_string())
            }
            other => BrokerError::Other(other.to_string()),
        },
        other => BrokerError::Other(other.to_string()),
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        value: message.payload().map(<[u8]>::to_vec),
        timestamp: message.timestamp().to_millis(),
    }
}

/// Creates rdkafka consumers, the shared producer and the metadata client.
pub struct KafkaClientFactory {
    config: KafkaClientConfig,
}

impl KafkaClientFactory {
    /// Creates a factory.
    pub fn new(config: KafkaClientConfig) -> Self {
        info!(
            brokers = %config.brokers,
            security_protocol = %config.security_protocol.as_str(),
            "Creating Kafka client factory"
        );
        Self { config }
    }

    /// Creates the producer used for retry, error and re-enqueue messages.
    ///
    /// # Errors
    ///
    /// Returns a `BrokerError` if librdkafka rejects the settings.
    pub fn create_producer(&self) -> Result<KafkaProducer, BrokerError> {
        let producer: FutureProducer = client_config(&self.config.producer_settings())
            .create()
            .map_err(map_kafka_error)?;
        Ok(KafkaProducer { producer })
    }

    /// Creates the metadata client used by topic discovery.
    ///
    /// # Errors
    ///
    /// Returns a `BrokerError` if librdkafka rejects the settings.
    pub fn create_metadata(&self) -> Result<KafkaMetadata, BrokerError> {
        let client: BaseConsumer = client_config(&self.config.metadata_settings())
            .create()
            .map_err(map_kafka_error)?;
        Ok(KafkaMetadata {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl ConsumerFactory for KafkaClientFactory {
    async fn create_consumer(
        &self,
        group_id: &str,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        let consumer: StreamConsumer = client_config(&self.config.consumer_settings(group_id))
            .create()
            .map_err(map_kafka_error)?;
        debug!(group_id = %group_id, "Created Kafka consumer");
        Ok(Arc::new(KafkaConsumer {
            consumer,
            group_id: group_id.to_string(),
        }))
    }
}

/// A consumer-group subscription backed by a `StreamConsumer`.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    group_id: String,
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names).map_err(map_kafka_error)?;
        info!(group_id = %self.group_id, topics = ?topics, "Subscribed");
        Ok(())
    }

    async fn pull(&self, max: usize) -> Result<Vec<Record>, BrokerError> {
        let first = match tokio::time::timeout(POLL_TIMEOUT, self.consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(result) => result.map_err(map_kafka_error)?,
        };
        let mut records = vec![to_record(&first)];
        drop(first);

        // Take whatever else is already buffered without waiting.
        while records.len() < max {
            match self.consumer.recv().now_or_never() {
                Some(Ok(message)) => records.push(to_record(&message)),
                Some(Err(err)) => {
                    debug!(group_id = %self.group_id, error = %err, "Stopping batch early");
                    break;
                }
                None => break,
            }
        }
        Ok(records)
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(map_kafka_error)?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(map_kafka_error)
    }

    async fn disconnect(&self) {
        self.consumer.unsubscribe();
        info!(group_id = %self.group_id, "Unsubscribed");
    }
}

/// Producer backed by a `FutureProducer`.
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut record = FutureRecord::<(), Vec<u8>>::to(topic).payload(&payload);
        if let Some(p) = partition {
            record = record.partition(p);
        }
        self.producer
            .send(record, Timeout::After(PRODUCE_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(err, _)| map_kafka_error(err))
    }
}

/// Metadata client backed by a `BaseConsumer`.
#[derive(Clone)]
pub struct KafkaMetadata {
    client: Arc<BaseConsumer>,
}

#[async_trait]
impl TopicMetadata for KafkaMetadata {
    async fn topic_names(&self) -> Result<Vec<String>, BrokerError> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, BrokerError> {
            let metadata = client
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map_err(map_kafka_error)?;
            Ok(metadata
                .topics()
                .iter()
                .map(|t| t.name().to_string())
                .collect())
        })
        .await
        .map_err(|e| BrokerError::Other(format!("metadata task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            map_kafka_error(KafkaError::PartitionEOF(3)),
            BrokerError::PartitionEof
        );
        assert_eq!(
            map_kafka_error(KafkaError::MessageConsumption(
                RDKafkaErrorCode::OperationTimedOut
            )),
            BrokerError::Timeout
        );
        assert!(matches!(
            map_kafka_error(KafkaError::MessageConsumption(
                RDKafkaErrorCode::AllBrokersDown
            )),
            BrokerError::Disconnected(_)
        ));
        assert!(matches!(
            map_kafka_error(KafkaError::MessageConsumption(
                RDKafkaErrorCode::UnknownTopicOrPartition
            )),
            BrokerError::Other(_)
        ));
    }

    #[test]
    fn test_client_config_applies_settings() {
        let config = client_config(&[("bootstrap.servers".to_string(), "k:9092".to_string())]);
        assert_eq!(config.get("bootstrap.servers"), Some("k:9092"));
    }
}
