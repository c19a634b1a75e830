//! Kafka consumer for notification records.
//!
//! Messages are read one at a time, decoded as JSON and handed to the
//! [`NotificationService`]. Messages that fail to decode or persist are
//! logged and skipped; their offsets are stored anyway, so they are not
//! redelivered.

use crate::config::KafkaConfig;
use crate::model::Notification;
use crate::service::NotificationService;
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::error::KafkaResult;
use rdkafka::message::Message as KafkaMessage;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    Creation(#[source] KafkaError),

    #[error("Failed to subscribe to topic: {0}")]
    Subscription(#[source] KafkaError),

    #[error("Kafka transport error: {0}")]
    Transport(#[source] KafkaError),

    #[error("Failed to deserialize message: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("Failed to store offset: {0}")]
    Commit(#[source] KafkaError),

    #[error("Consumer cancelled")]
    Cancelled,
}

impl ConsumerError {
    /// Whether the run loop ended because shutdown was requested
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConsumerError::Cancelled)
    }
}

/// Metadata about a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Timestamp of the message in milliseconds
    pub timestamp: Option<i64>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Copy a Kafka message out of the consumer's buffer
    pub fn from_kafka<M: KafkaMessage>(msg: &M) -> Self {
        Self {
            payload: msg.payload().unwrap_or(&[]).to_vec(),
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(|k| k.to_vec()),
                timestamp: msg.timestamp().to_millis(),
            },
        }
    }

    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Source of messages for the consume loop.
#[async_trait]
pub trait MessageReader: Send + Sync {
    /// Wait for the next message.
    ///
    /// Must be cancel safe: dropping the future before it resolves must not
    /// lose a message.
    async fn read_message(&self) -> Result<IncomingMessage, ConsumerError>;

    /// Record that the message has been handled so its position is committed
    fn mark_processed(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError>;

    /// Release the underlying connection
    fn close(&self);
}

/// [`MessageReader`] backed by an rdkafka [`StreamConsumer`]
pub struct KafkaReader {
    consumer: StreamConsumer,
}

impl KafkaReader {
    /// Create the consumer and subscribe to the configured topic
    pub fn new(config: &KafkaConfig) -> Result<Self, ConsumerError> {
        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(ConsumerError::Creation)?;

        consumer
            .subscribe(&[&config.topic])
            .map_err(ConsumerError::Subscription)?;

        info!(
            brokers = %config.bootstrap_servers(),
            topic = %config.topic,
            group = %config.group_id,
            "Subscribed to Kafka topic"
        );

        Ok(Self { consumer })
    }
}

/// Position the group resumes from once `metadata` has been handled.
///
/// `store_offsets` commits the listed offsets as given, so this is the
/// offset of the next message in the partition.
fn resume_position(metadata: &MessageMetadata) -> KafkaResult<TopicPartitionList> {
    let mut position = TopicPartitionList::with_capacity(1);
    position.add_partition_offset(
        &metadata.topic,
        metadata.partition,
        Offset::Offset(metadata.offset + 1),
    )?;
    Ok(position)
}

#[async_trait]
impl MessageReader for KafkaReader {
    async fn read_message(&self) -> Result<IncomingMessage, ConsumerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(ConsumerError::Transport)?;

        Ok(IncomingMessage::from_kafka(&message))
    }

    fn mark_processed(&self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        let position = resume_position(metadata).map_err(ConsumerError::Commit)?;
        self.consumer
            .store_offsets(&position)
            .map_err(ConsumerError::Commit)
    }

    fn close(&self) {
        self.consumer.unsubscribe();
    }
}

/// Consumes notification records and persists them
pub struct NotificationConsumer<R = KafkaReader> {
    reader: R,
    service: Arc<NotificationService>,
}

impl NotificationConsumer<KafkaReader> {
    /// Create a consumer bound to the configured brokers, topic and group
    pub fn from_config(
        config: &KafkaConfig,
        service: Arc<NotificationService>,
    ) -> Result<Self, ConsumerError> {
        Ok(Self::new(KafkaReader::new(config)?, service))
    }
}

impl<R: MessageReader> NotificationConsumer<R> {
    pub fn new(reader: R, service: Arc<NotificationService>) -> Self {
        Self { reader, service }
    }

    /// Consume until `shutdown` is cancelled or the transport fails.
    ///
    /// Returns [`ConsumerError::Cancelled`] on shutdown. Cancellation is only
    /// observed while waiting for the next message, so a message that has
    /// been read is always processed to completion.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        info!("Starting notification consumer");

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Received shutdown signal");
                    return Err(ConsumerError::Cancelled);
                }
                result = self.reader.read_message() => match result {
                    Ok(message) => message,
                    Err(e) => {
                        error!(error = %e, "Kafka consumer error");
                        metrics::counter!("notification.kafka.errors").increment(1);
                        return Err(e);
                    }
                },
            };

            self.process_message(&message).await;

            if let Err(e) = self.reader.mark_processed(&message.metadata) {
                warn!(
                    error = %e,
                    partition = message.metadata.partition,
                    offset = message.metadata.offset,
                    "Failed to store offset"
                );
            }
        }
    }

    /// Decode and persist one message. Failures are logged, never returned.
    #[instrument(skip_all, fields(partition = message.metadata.partition, offset = message.metadata.offset))]
    async fn process_message(&self, message: &IncomingMessage) {
        let notification: Notification = match message.decode_json() {
            Ok(notification) => notification,
            Err(e) => {
                warn!(
                    error = %e,
                    size_bytes = message.payload.len(),
                    "Skipping undecodable message"
                );
                metrics::counter!("notification.messages.malformed").increment(1);
                return;
            }
        };

        debug!(
            id = %notification.id,
            key = ?message.metadata.key.as_deref().map(String::from_utf8_lossy),
            timestamp_ms = ?message.metadata.timestamp,
            "Received notification"
        );

        match self.service.save_notification(notification).await {
            Ok(saved) => {
                debug!(id = %saved.id, "Notification processed");
                metrics::counter!("notification.messages.processed").increment(1);
            }
            Err(e) => {
                error!(error = %e, "Failed to persist notification, skipping");
                metrics::counter!("notification.messages.failed").increment(1);
            }
        }
    }

    /// Release the reader. Call once after [`run`](Self::run) returns.
    pub fn close(self) {
        self.reader.close();
        info!("Notification consumer closed");
    }
}
