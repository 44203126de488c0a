// ============================================================================
// Durable Store - Transactional Order Persistence
// ============================================================================
//
// Four relational tables (orders, deliveries, payments, items) keyed by
// order_uid. Writes are batch-atomic: one transaction per `persist` call,
// and any insert failure rolls back every order of the batch.
//
// Structure:
// - postgres.rs - PgOrderStore, the sqlx implementation
// - schema.rs   - idempotent DDL bootstrap
// - memory.rs   - in-memory transactional store for tests (fault injection)
//
// ============================================================================

mod postgres;
pub mod schema;

#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;

use crate::domain::order::ValidationError;
use crate::models::Order;
use crate::utils::IsTransient;

pub use postgres::PgOrderStore;

/// What to do when a header insert hits an `order_uid` that is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Abort and roll back the whole batch.
    #[default]
    Reject,
    /// Leave the stored aggregate untouched and continue with the batch.
    /// Required when the stream may redeliver already-committed messages.
    Skip,
}

/// Result of a committed `persist` call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PersistOutcome {
    /// Orders written by this transaction, in arrival order.
    pub persisted: Vec<String>,
    /// Orders dropped by validation before any insert.
    pub rejected: Vec<(String, ValidationError)>,
    /// Orders already present (only with `DuplicatePolicy::Skip`).
    pub duplicates: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("failed to apply schema: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] sqlx::Error),

    #[error("order {order_uid} already exists")]
    Duplicate { order_uid: String },

    #[error("insert into {table} failed for order {order_uid}: {source}")]
    Insert {
        table: &'static str,
        order_uid: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("query on {table} failed: {source}")]
    Query {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("order {order_uid} is incomplete: no {missing} row")]
    Incomplete {
        order_uid: String,
        missing: &'static str,
    },
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Connect(e)
            | StoreError::Begin(e)
            | StoreError::Commit(e)
            | StoreError::Schema(e) => is_transient_sqlx(e),
            StoreError::Query { source, .. } | StoreError::Insert { source, .. } => {
                is_transient_sqlx(source)
            }
            StoreError::Duplicate { .. } | StoreError::Incomplete { .. } => false,
        }
    }
}

fn is_transient_sqlx(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

/// The persistence contract the cache and the pipeline depend on.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Write a batch in a single transaction.
    ///
    /// Invalid orders are skipped and reported in the outcome; they do not
    /// abort the batch. Any insert failure rolls back the entire batch.
    async fn persist(&self, orders: &[Order]) -> Result<PersistOutcome, StoreError>;

    /// Load a full aggregate. `Ok(None)` when no header row exists.
    async fn fetch_by_id(&self, order_uid: &str) -> Result<Option<Order>, StoreError>;

    async fn list_all_ids(&self) -> Result<Vec<String>, StoreError>;
}

/// Split a batch into admissible orders and validation rejects, logging the latter.
pub(crate) fn screen_batch(orders: &[Order]) -> (Vec<&Order>, Vec<(String, ValidationError)>) {
    let mut accepted = Vec::with_capacity(orders.len());
    let mut rejected = Vec::new();

    for order in orders {
        match order.validate() {
            Ok(()) => accepted.push(order),
            Err(e) => {
                tracing::warn!(
                    order_uid = %order.order_uid,
                    error = %e,
                    "Skipping invalid order in batch"
                );
                rejected.push((order.order_uid.clone(), e));
            }
        }
    }

    (accepted, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::sample_order;

    #[test]
    fn test_screen_batch_keeps_arrival_order_and_reports_rejects() {
        let mut bad = sample_order("bad");
        bad.items.clear();
        let batch = vec![sample_order("a"), bad, sample_order("b")];

        let (accepted, rejected) = screen_batch(&batch);

        let uids: Vec<&str> = accepted.iter().map(|o| o.order_uid.as_str()).collect();
        assert_eq!(uids, vec!["a", "b"]);
        assert_eq!(rejected, vec![("bad".to_string(), ValidationError::NoItems)]);
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Connect(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::Duplicate { order_uid: "x".into() }.is_transient());
        assert!(!StoreError::Query {
            table: "orders",
            source: sqlx::Error::RowNotFound,
        }
        .is_transient());
    }
}
