use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};

use crate::config::{DeliverySemantics, KafkaConfig};
use super::{MessageSource, StreamError, StreamMessage};

// ============================================================================
// Kafka Message Source
// ============================================================================
//
// Offset handling follows the delivery semantics:
// - AtMostOnce:  librdkafka stores the offset as soon as a message is handed
//                to us and auto-commits it; `commit` is a no-op.
// - AtLeastOnce: offset storing is disabled; `commit` stores and commits
//                offset + 1 once the pipeline's batch is durable.
//
// Reads start from the earliest offset when the group has no committed one.
//
// ============================================================================

pub struct KafkaSource {
    consumer: StreamConsumer,
    semantics: DeliverySemantics,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig, semantics: DeliverySemantics) -> Result<Self, StreamError> {
        let store_on_read = match semantics {
            DeliverySemantics::AtMostOnce => "true",
            DeliverySemantics::AtLeastOnce => "false",
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", store_on_read)
            .set("fetch.min.bytes", "10000")
            .set("fetch.max.bytes", "10000000")
            .set("session.timeout.ms", "10000")
            .create()
            .map_err(StreamError::Setup)?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(StreamError::Setup)?;

        tracing::info!(
            topic = %config.topic,
            group_id = %config.group_id,
            semantics = ?semantics,
            "Kafka consumer created"
        );

        Ok(Self { consumer, semantics })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn recv(&mut self) -> Result<StreamMessage, StreamError> {
        let message = self.consumer.recv().await.map_err(StreamError::Read)?;

        Ok(StreamMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    async fn commit(&mut self, message: &StreamMessage) -> Result<(), StreamError> {
        if self.semantics == DeliverySemantics::AtMostOnce {
            return Ok(());
        }

        let commit_error = |source| StreamError::Commit {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            source,
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))
            .map_err(commit_error)?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(commit_error)?;

        tracing::debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Committed offset after persistence"
        );

        Ok(())
    }
}
