use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::OrderCache;
use crate::config::DeliverySemantics;
use crate::domain::order::ValidationError;
use crate::messaging::{MessageSource, StreamError, StreamMessage};
use crate::metrics::{ErrorStage, Metrics};
use crate::models::Order;
use crate::store::{OrderStore, StoreError};

// ============================================================================
// Ingestion Pipeline
// ============================================================================
//
// One long-lived loop:
//
//   Idle -> Reading -> Decoding -> Validating -> Persisting -> Caching -> Idle
//                                                      \-> Stopped
//
// - Reading:    blocks on the stream. A read failure ends the loop.
// - Decoding:   bad JSON is logged and the message skipped.
// - Validating: rejected candidates never reach the store or the cache.
// - Persisting: accepted candidates accumulate until `batch_size`, then go
//               to the store as one transaction. A failed batch is dropped.
// - Caching:    only orders committed by that transaction are mirrored.
//
// Cancellation is checked while reading and while a batch is in flight.
// Either way the loop exits without flushing what is buffered, and an
// interrupted transaction is rolled back by the store.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Reading,
    Decoding,
    Validating,
    Persisting,
    Caching,
    Stopped,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Reading => "reading",
            PipelineState::Decoding => "decoding",
            PipelineState::Validating => "validating",
            PipelineState::Persisting => "persisting",
            PipelineState::Caching => "caching",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub semantics: DeliverySemantics,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            semantics: DeliverySemantics::AtMostOnce,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub messages_read: u64,
    pub decode_rejects: u64,
    pub validation_rejects: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub orders_cached: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Read(StreamError),

    #[error("failed to acknowledge processed messages: {0}")]
    Commit(#[source] StreamError),

    /// Only in at-least-once mode, where a failed batch must be redelivered.
    #[error("failed to persist batch {order_uids:?}: {source}")]
    Persist {
        order_uids: Vec<String>,
        #[source]
        source: StoreError,
    },
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct IngestionPipeline<S: MessageSource> {
    source: S,
    store: Arc<dyn OrderStore>,
    cache: Arc<OrderCache>,
    metrics: Arc<Metrics>,
    config: PipelineConfig,
    state: watch::Sender<PipelineState>,
    stats: PipelineStats,
    /// Last message per (topic, partition) not yet acknowledged.
    pending_acks: HashMap<(String, i32), StreamMessage>,
}

impl<S: MessageSource> IngestionPipeline<S> {
    pub fn new(
        source: S,
        store: Arc<dyn OrderStore>,
        cache: Arc<OrderCache>,
        metrics: Arc<Metrics>,
        config: PipelineConfig,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            source,
            store,
            cache,
            metrics,
            config: PipelineConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
            state,
            stats: PipelineStats::default(),
            pending_acks: HashMap::new(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Consume until `shutdown` is cancelled (`Ok`) or the stream fails (`Err`).
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        tracing::info!(
            batch_size = self.config.batch_size,
            semantics = ?self.config.semantics,
            "Ingestion pipeline started"
        );

        let result = self.consume(&shutdown).await;
        self.set_state(PipelineState::Stopped);

        match &result {
            Ok(()) => tracing::info!(stats = ?self.stats, "Ingestion pipeline stopped"),
            Err(e) => tracing::error!(error = %e, stats = ?self.stats, "Ingestion pipeline failed"),
        }
        result
    }

    async fn consume(&mut self, shutdown: &CancellationToken) -> Result<(), PipelineError> {
        let mut batch: Vec<Order> = Vec::with_capacity(self.config.batch_size);

        loop {
            self.set_state(PipelineState::Reading);
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    log_discarded(&batch, "shutdown");
                    return Ok(());
                }
                received = self.source.recv() => received,
            };

            let mut message = match received {
                Ok(message) => message,
                Err(e) => {
                    self.metrics.record_error(ErrorStage::Read);
                    log_discarded(&batch, "read failure");
                    return Err(PipelineError::Read(e));
                }
            };
            let started = Instant::now();
            self.stats.messages_read += 1;

            self.set_state(PipelineState::Decoding);
            let payload = std::mem::take(&mut message.payload);
            self.track_ack(message);

            let candidate = match serde_json::from_slice::<Option<Order>>(&payload) {
                Ok(candidate) => candidate,
                Err(e) => {
                    self.metrics.record_error(ErrorStage::Decode);
                    self.stats.decode_rejects += 1;
                    tracing::warn!(
                        message = %String::from_utf8_lossy(&payload),
                        error = %e,
                        "Failed to decode order"
                    );
                    self.ack_if_idle(&batch).await?;
                    continue;
                }
            };

            self.set_state(PipelineState::Validating);
            let mut order = match admit(candidate) {
                Ok(order) => order,
                Err((uid, e)) => {
                    self.metrics.record_error(ErrorStage::Validate);
                    self.stats.validation_rejects += 1;
                    tracing::warn!(order_uid = %uid, error = %e, "Rejected invalid order");
                    self.ack_if_idle(&batch).await?;
                    continue;
                }
            };
            order.normalize(Utc::now());
            tracing::debug!(order_uid = %order.order_uid, buffered = batch.len() + 1, "Order accepted into batch");
            batch.push(order);

            if batch.len() >= self.config.batch_size {
                let orders = std::mem::take(&mut batch);
                if let Flow::Shutdown = self.flush(orders, shutdown).await? {
                    return Ok(());
                }
            }

            self.metrics
                .processing_duration
                .observe(started.elapsed().as_secs_f64());
            self.set_state(PipelineState::Idle);
        }
    }

    async fn flush(&mut self, orders: Vec<Order>, shutdown: &CancellationToken) -> Result<Flow, PipelineError> {
        self.set_state(PipelineState::Persisting);

        let persisted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                log_discarded(&orders, "shutdown during persist");
                return Ok(Flow::Shutdown);
            }
            persisted = self.store.persist(&orders) => persisted,
        };

        let outcome = match persisted {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_error(ErrorStage::Persist);
                self.stats.batches_failed += 1;
                let order_uids: Vec<String> = orders.iter().map(|o| o.order_uid.clone()).collect();
                tracing::error!(
                    error = %e,
                    order_uids = ?order_uids,
                    "Failed to save batch, dropping it"
                );

                return match self.config.semantics {
                    DeliverySemantics::AtMostOnce => {
                        self.pending_acks.clear();
                        Ok(Flow::Continue)
                    }
                    DeliverySemantics::AtLeastOnce => Err(PipelineError::Persist { order_uids, source: e }),
                };
            }
        };

        self.stats.batches_committed += 1;
        self.stats.validation_rejects += outcome.rejected.len() as u64;
        self.metrics.record_batch(orders.len(), outcome.persisted.len());

        self.set_state(PipelineState::Caching);
        let mut committed: HashSet<String> = outcome.persisted.into_iter().collect();
        for order in orders {
            // A uid repeated within one batch was only written once.
            if committed.remove(&order.order_uid) {
                tracing::info!(order_uid = %order.order_uid, "Order processed successfully");
                self.cache.put(order);
                self.stats.orders_cached += 1;
            }
        }
        self.metrics.orders_cached.set(self.cache.len() as i64);

        self.commit_pending().await?;
        Ok(Flow::Continue)
    }

    fn track_ack(&mut self, message: StreamMessage) {
        if self.config.semantics == DeliverySemantics::AtLeastOnce {
            self.pending_acks
                .insert((message.topic.clone(), message.partition), message);
        }
    }

    /// A skipped message with nothing buffered before it can be acknowledged at once.
    async fn ack_if_idle(&mut self, batch: &[Order]) -> Result<(), PipelineError> {
        if batch.is_empty() {
            self.commit_pending().await?;
        }
        Ok(())
    }

    async fn commit_pending(&mut self) -> Result<(), PipelineError> {
        let acks: Vec<StreamMessage> = self.pending_acks.drain().map(|(_, m)| m).collect();
        for message in &acks {
            self.source.commit(message).await.map_err(PipelineError::Commit)?;
        }
        Ok(())
    }

    fn set_state(&self, state: PipelineState) {
        self.state.send_replace(state);
    }
}

/// Validate a decoded candidate, handing back the uid (if any) on rejection.
fn admit(candidate: Option<Order>) -> Result<Order, (String, ValidationError)> {
    let order = candidate.ok_or_else(|| (String::new(), ValidationError::Absent))?;
    match order.validate() {
        Ok(()) => Ok(order),
        Err(e) => Err((order.order_uid, e)),
    }
}

fn log_discarded(batch: &[Order], reason: &str) {
    if batch.is_empty() {
        return;
    }
    let order_uids: Vec<&str> = batch.iter().map(|o| o.order_uid.as_str()).collect();
    tracing::warn!(reason, order_uids = ?order_uids, "Discarding unflushed batch");
}
