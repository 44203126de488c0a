use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::Order;
use crate::store::{OrderStore, StoreError};

// ============================================================================
// Order Cache - Read-Optimized In-Memory Mirror
// ============================================================================
//
// The only read path for the query surface. Readers share the lock; writers
// (the pipeline and startup hydration) hold it exclusively only while the
// map is mutated, never while the store is being read.
//
// Orders are stored behind `Arc` so snapshots and lookups are cheap clones
// of pointers, and an entry is always replaced whole.
//
// ============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HydrationReport {
    pub listed: usize,
    pub loaded: usize,
    pub skipped: usize,
}

#[derive(Default)]
pub struct OrderCache {
    orders: RwLock<HashMap<String, Arc<Order>>>,
}

impl OrderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-load every stored order.
    ///
    /// Best effort: a uid that fails to load (or vanished between listing and
    /// fetching) is logged and skipped. Only failing to list ids is an error.
    pub async fn hydrate<S>(&self, store: &S) -> Result<HydrationReport, StoreError>
    where
        S: OrderStore + ?Sized,
    {
        tracing::info!("Starting to load orders into cache");

        let uids = store.list_all_ids().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to fetch order ids from store");
            e
        })?;
        tracing::info!(count = uids.len(), "Fetched order ids");

        let mut report = HydrationReport { listed: uids.len(), ..HydrationReport::default() };

        for uid in uids {
            match store.fetch_by_id(&uid).await {
                Ok(Some(order)) => {
                    self.orders.write().insert(uid, Arc::new(order));
                    report.loaded += 1;
                }
                Ok(None) => {
                    tracing::warn!(order_uid = %uid, "Order disappeared before it could be loaded");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(order_uid = %uid, error = %e, "Failed to load order");
                    report.skipped += 1;
                }
            }
        }

        tracing::info!(
            loaded = report.loaded,
            skipped = report.skipped,
            cached_orders = self.len(),
            "Finished loading orders into cache"
        );

        Ok(report)
    }

    /// Insert or fully replace the entry for `order.order_uid`.
    pub fn put(&self, order: Order) {
        let uid = order.order_uid.clone();
        self.orders.write().insert(uid.clone(), Arc::new(order));
        tracing::debug!(order_uid = %uid, "Order added to cache");
    }

    pub fn get(&self, order_uid: &str) -> Option<Arc<Order>> {
        self.orders.read().get(order_uid).cloned()
    }

    /// Point-in-time snapshot; later writes are not visible through it.
    pub fn list(&self) -> Vec<Arc<Order>> {
        self.orders.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.read().is_empty()
    }
}
