// ============================================================================
// Messaging - Ordered Inbound Stream
// ============================================================================
//
// `MessageSource` is the seam between the ingestion pipeline and the broker.
// The pipeline only needs two things: block for the next message, and (in
// at-least-once mode) acknowledge everything up to a given message.
//
// ============================================================================

mod kafka;

#[cfg(test)]
pub(crate) mod channel;

use async_trait::async_trait;

use crate::utils::IsTransient;

pub use kafka::KafkaSource;

/// One inbound unit, detached from the broker's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to create consumer: {0}")]
    Setup(#[source] rdkafka::error::KafkaError),

    #[error("failed to read message: {0}")]
    Read(#[source] rdkafka::error::KafkaError),

    #[error("failed to commit offset {offset} on {topic}/{partition}: {source}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: rdkafka::error::KafkaError,
    },

    #[error("stream closed")]
    Closed,
}

impl IsTransient for StreamError {
    fn is_transient(&self) -> bool {
        matches!(self, StreamError::Read(_) | StreamError::Commit { .. })
    }
}

#[async_trait]
pub trait MessageSource: Send {
    /// Block until the next message. The pipeline's only normal suspension point.
    async fn recv(&mut self) -> Result<StreamMessage, StreamError>;

    /// Mark `message` (and everything before it on its partition) as processed.
    async fn commit(&mut self, message: &StreamMessage) -> Result<(), StreamError>;
}
