use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use crate::models::{Delivery, Item, Order, Payment};
use super::{screen_batch, DuplicatePolicy, OrderStore, PersistOutcome, StoreError};

// ============================================================================
// In-Memory Order Store (tests only)
// ============================================================================
//
// Mirrors the relational layout (one map per table) and the transactional
// contract of PgOrderStore: a batch is applied to a staged copy of the
// tables, which replaces the committed copy only when every insert succeeds.
//
// Fault injection:
// - fail_item_insert_at(n): the n-th item insert of the next batch fails
// - fail_fetch(uid): fetch_by_id(uid) returns a query error
// - persist_delay(d): sleep before commit, to exercise cancellation
//
// ============================================================================

#[derive(Clone, Default)]
struct Tables {
    orders: BTreeMap<String, Order>,
    deliveries: HashMap<String, Delivery>,
    payments: HashMap<String, Payment>,
    items: HashMap<String, Vec<Item>>,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    tables: Mutex<Tables>,
    duplicate_policy: DuplicatePolicy,
    fail_item_insert_at: Mutex<Option<usize>>,
    failing_fetches: Mutex<HashSet<String>>,
    persist_delay: Mutex<Option<Duration>>,
    persist_calls: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Make the `n`-th (1-based) item insert of the next `persist` fail.
    pub fn fail_item_insert_at(&self, n: usize) {
        *self.fail_item_insert_at.lock() = Some(n);
    }

    pub fn fail_fetch(&self, order_uid: &str) {
        self.failing_fetches.lock().insert(order_uid.to_string());
    }

    pub fn set_persist_delay(&self, delay: Duration) {
        *self.persist_delay.lock() = Some(delay);
    }

    /// Write only the header row, bypassing the transactional path.
    pub fn insert_header_only(&self, order: &Order) {
        let header = Order {
            delivery: Delivery::default(),
            payment: Payment::default(),
            items: Vec::new(),
            ..order.clone()
        };
        self.tables.lock().orders.insert(order.order_uid.clone(), header);
    }

    pub fn persist_calls(&self) -> usize {
        *self.persist_calls.lock()
    }

    pub fn order_count(&self) -> usize {
        self.tables.lock().orders.len()
    }

    fn stage(&self, staged: &mut Tables, order: &Order, item_inserts: &mut usize) -> Result<bool, StoreError> {
        let uid = &order.order_uid;

        if staged.orders.contains_key(uid) {
            return match self.duplicate_policy {
                DuplicatePolicy::Reject => Err(StoreError::Duplicate { order_uid: uid.clone() }),
                DuplicatePolicy::Skip => Ok(false),
            };
        }

        let header = Order {
            delivery: Delivery::default(),
            payment: Payment::default(),
            items: Vec::new(),
            ..order.clone()
        };
        staged.orders.insert(uid.clone(), header);
        staged.deliveries.insert(uid.clone(), order.delivery.clone());
        staged.payments.insert(uid.clone(), order.payment.clone());

        let fail_at = *self.fail_item_insert_at.lock();
        for item in &order.items {
            *item_inserts += 1;
            if fail_at == Some(*item_inserts) {
                return Err(StoreError::Insert {
                    table: "items",
                    order_uid: uid.clone(),
                    source: sqlx::Error::Protocol("injected item insert failure".to_string()),
                });
            }
            staged.items.entry(uid.clone()).or_default().push(item.clone());
        }

        Ok(true)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn persist(&self, orders: &[Order]) -> Result<PersistOutcome, StoreError> {
        *self.persist_calls.lock() += 1;

        let (accepted, rejected) = screen_batch(orders);
        let mut outcome = PersistOutcome { rejected, ..PersistOutcome::default() };
        if accepted.is_empty() {
            return Ok(outcome);
        }

        let mut staged = self.tables.lock().clone();
        let mut item_inserts = 0;
        let staging = accepted.iter().try_for_each(|order| {
            if self.stage(&mut staged, order, &mut item_inserts)? {
                outcome.persisted.push(order.order_uid.clone());
            } else {
                outcome.duplicates.push(order.order_uid.clone());
            }
            Ok::<(), StoreError>(())
        });
        // Injection is one-shot, like a transient failure.
        self.fail_item_insert_at.lock().take();
        staging?;

        let delay = *self.persist_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        *self.tables.lock() = staged;
        Ok(outcome)
    }

    async fn fetch_by_id(&self, order_uid: &str) -> Result<Option<Order>, StoreError> {
        if self.failing_fetches.lock().contains(order_uid) {
            return Err(StoreError::Query {
                table: "orders",
                source: sqlx::Error::Protocol("injected fetch failure".to_string()),
            });
        }

        let tables = self.tables.lock();
        let Some(header) = tables.orders.get(order_uid) else {
            return Ok(None);
        };

        let incomplete = |missing| StoreError::Incomplete {
            order_uid: order_uid.to_string(),
            missing,
        };
        let delivery = tables.deliveries.get(order_uid).ok_or_else(|| incomplete("delivery"))?;
        let payment = tables.payments.get(order_uid).ok_or_else(|| incomplete("payment"))?;
        let items = tables
            .items
            .get(order_uid)
            .filter(|items| !items.is_empty())
            .ok_or_else(|| incomplete("item"))?;

        Ok(Some(Order {
            delivery: delivery.clone(),
            payment: payment.clone(),
            items: items.clone(),
            ..header.clone()
        }))
    }

    async fn list_all_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tables.lock().orders.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::sample_order;

    #[tokio::test]
    async fn test_batch_rolls_back_when_an_item_insert_fails() {
        let store = MemoryStore::new();
        let mut second = sample_order("batch-2");
        second.items.push(second.items[0].clone());
        let batch = vec![sample_order("batch-1"), second, sample_order("batch-3")];

        // Item inserts: batch-1 -> 1, batch-2 -> 2 and 3.
        store.fail_item_insert_at(3);
        let err = store.persist(&batch).await.unwrap_err();
        assert!(matches!(err, StoreError::Insert { table: "items", .. }));

        for order in &batch {
            assert_eq!(store.fetch_by_id(&order.order_uid).await.unwrap(), None);
        }
        assert!(store.list_all_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_order_is_skipped_without_aborting_batch() {
        let store = MemoryStore::new();
        let mut invalid = sample_order("bad");
        invalid.delivery.phone.clear();

        let outcome = store
            .persist(&[sample_order("good-1"), invalid, sample_order("good-2")])
            .await
            .unwrap();

        assert_eq!(outcome.persisted, vec!["good-1".to_string(), "good-2".to_string()]);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(store.fetch_by_id("bad").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_rejected_rolls_back_batch() {
        let store = MemoryStore::new();
        store.persist(&[sample_order("dup")]).await.unwrap();

        let err = store
            .persist(&[sample_order("new"), sample_order("dup")])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Duplicate { ref order_uid } if order_uid == "dup"));
        assert_eq!(store.fetch_by_id("new").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_header_without_children_is_incomplete() {
        let store = MemoryStore::new();
        store.insert_header_only(&sample_order("partial"));

        let err = store.fetch_by_id("partial").await.unwrap_err();
        assert!(matches!(err, StoreError::Incomplete { missing: "delivery", .. }));
    }
}
