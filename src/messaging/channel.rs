use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{MessageSource, StreamError, StreamMessage};

// ============================================================================
// Channel Message Source (tests only)
// ============================================================================
//
// Messages are pushed through an mpsc sender. Dropping every sender closes
// the stream, which the pipeline treats as a fatal read failure. Commits are
// recorded so tests can assert what was acknowledged.
//
// ============================================================================

pub(crate) struct ChannelSource {
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    committed: Arc<Mutex<Vec<i64>>>,
}

#[derive(Clone)]
pub(crate) struct ChannelSender {
    tx: mpsc::UnboundedSender<StreamMessage>,
    next_offset: Arc<Mutex<i64>>,
}

impl ChannelSender {
    pub fn send(&self, payload: impl Into<Vec<u8>>) {
        let mut next = self.next_offset.lock();
        let message = StreamMessage {
            topic: "orders".to_string(),
            partition: 0,
            offset: *next,
            key: None,
            payload: payload.into(),
        };
        *next += 1;
        // A closed receiver just means the pipeline already stopped.
        let _ = self.tx.send(message);
    }
}

/// Create a connected source/sender pair plus a view of committed offsets.
pub(crate) fn channel_source() -> (ChannelSource, ChannelSender, Arc<Mutex<Vec<i64>>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let committed = Arc::new(Mutex::new(Vec::new()));
    (
        ChannelSource { rx, committed: committed.clone() },
        ChannelSender { tx, next_offset: Arc::new(Mutex::new(0)) },
        committed,
    )
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Result<StreamMessage, StreamError> {
        self.rx.recv().await.ok_or(StreamError::Closed)
    }

    async fn commit(&mut self, message: &StreamMessage) -> Result<(), StreamError> {
        self.committed.lock().push(message.offset);
        Ok(())
    }
}
