use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DatabaseConfig;
use crate::metrics::Metrics;
use crate::models::{Delivery, Item, Order, Payment};
use super::{screen_batch, DuplicatePolicy, OrderStore, PersistOutcome, StoreError};

// ============================================================================
// PostgreSQL Order Store
// ============================================================================
//
// Insert order per aggregate is fixed: header, delivery, payment, items.
// Child tables reference the header, so items always go last.
//
// The transaction is held in a local: if the future is dropped (shutdown)
// or any step returns early, sqlx rolls it back when it goes out of scope.
//
// Every statement is counted and timed per (operation, table); committed
// transactions are counted separately.
//
// ============================================================================

const INSERT_ORDER: &str = "INSERT INTO orders (
        order_uid, track_number, entry, locale, internal_signature, customer_id,
        delivery_service, shardkey, sm_id, date_created, oof_shard
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)";

const INSERT_ORDER_SKIP_EXISTING: &str = "INSERT INTO orders (
        order_uid, track_number, entry, locale, internal_signature, customer_id,
        delivery_service, shardkey, sm_id, date_created, oof_shard
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (order_uid) DO NOTHING";

const INSERT_DELIVERY: &str = "INSERT INTO deliveries (
        order_uid, name, phone, zip, city, address, region, email
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

const INSERT_PAYMENT: &str = "INSERT INTO payments (
        order_uid, transaction, request_id, currency, provider, amount,
        payment_dt, bank, delivery_cost, goods_total, custom_fee
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)";

const INSERT_ITEM: &str = "INSERT INTO items (
        order_uid, chrt_id, track_number, price, rid, name, sale, size,
        total_price, nm_id, brand, status
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)";

pub struct PgOrderStore {
    pool: PgPool,
    duplicate_policy: DuplicatePolicy,
    metrics: Arc<Metrics>,
}

impl PgOrderStore {
    pub fn new(pool: PgPool, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            duplicate_policy: DuplicatePolicy::Reject,
            metrics,
        }
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Open a bounded pool and verify it with one round-trip.
    pub async fn connect(config: &DatabaseConfig, metrics: Arc<Metrics>) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(60))
            .max_lifetime(Duration::from_secs(300))
            .connect(&config.url())
            .await
            .map_err(StoreError::Connect)?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(StoreError::Connect)?;

        tracing::info!(
            host = %config.host,
            database = %config.name,
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );

        Ok(Self::new(pool, metrics))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn timed<T, F>(&self, operation: &'static str, table: &'static str, query: F) -> Result<T, sqlx::Error>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let result = query.await;
        self.metrics.record_query(operation, table, started.elapsed());
        result
    }

    /// Returns `false` when the header already existed and was left alone.
    async fn insert_header(&self, conn: &mut PgConnection, order: &Order) -> Result<bool, StoreError> {
        let sql = match self.duplicate_policy {
            DuplicatePolicy::Reject => INSERT_ORDER,
            DuplicatePolicy::Skip => INSERT_ORDER_SKIP_EXISTING,
        };

        let insert = sqlx::query(sql)
            .bind(&order.order_uid)
            .bind(&order.track_number)
            .bind(&order.entry)
            .bind(&order.locale)
            .bind(&order.internal_signature)
            .bind(&order.customer_id)
            .bind(&order.delivery_service)
            .bind(&order.shardkey)
            .bind(order.sm_id)
            .bind(order.date_created)
            .bind(&order.oof_shard)
            .execute(&mut *conn);
        let result = self
            .timed("insert", "orders", insert)
            .await
            .map_err(|e| insert_error("orders", &order.order_uid, e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_aggregate(&self, conn: &mut PgConnection, order: &Order) -> Result<bool, StoreError> {
        if !self.insert_header(conn, order).await? {
            return Ok(false);
        }

        let uid = &order.order_uid;
        let d = &order.delivery;
        let insert = sqlx::query(INSERT_DELIVERY)
            .bind(uid)
            .bind(&d.name)
            .bind(&d.phone)
            .bind(&d.zip)
            .bind(&d.city)
            .bind(&d.address)
            .bind(&d.region)
            .bind(&d.email)
            .execute(&mut *conn);
        self.timed("insert", "deliveries", insert)
            .await
            .map_err(|e| insert_error("deliveries", uid, e))?;

        let p = &order.payment;
        let insert = sqlx::query(INSERT_PAYMENT)
            .bind(uid)
            .bind(&p.transaction)
            .bind(&p.request_id)
            .bind(&p.currency)
            .bind(&p.provider)
            .bind(p.amount)
            .bind(p.payment_dt)
            .bind(&p.bank)
            .bind(p.delivery_cost)
            .bind(p.goods_total)
            .bind(p.custom_fee)
            .execute(&mut *conn);
        self.timed("insert", "payments", insert)
            .await
            .map_err(|e| insert_error("payments", uid, e))?;

        for item in &order.items {
            let insert = sqlx::query(INSERT_ITEM)
                .bind(uid)
                .bind(item.chrt_id)
                .bind(&item.track_number)
                .bind(item.price)
                .bind(&item.rid)
                .bind(&item.name)
                .bind(item.sale)
                .bind(&item.size)
                .bind(item.total_price)
                .bind(item.nm_id)
                .bind(&item.brand)
                .bind(item.status)
                .execute(&mut *conn);
            self.timed("insert", "items", insert)
                .await
                .map_err(|e| insert_error("items", uid, e))?;
        }

        Ok(true)
    }
}

fn insert_error(table: &'static str, order_uid: &str, e: sqlx::Error) -> StoreError {
    let unique_violation = e
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);

    if unique_violation && table == "orders" {
        StoreError::Duplicate { order_uid: order_uid.to_string() }
    } else {
        StoreError::Insert { table, order_uid: order_uid.to_string(), source: e }
    }
}

fn query_error(table: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Query { table, source }
}

fn header_from_row(row: &PgRow) -> Result<Order, sqlx::Error> {
    Ok(Order {
        order_uid: row.try_get("order_uid")?,
        track_number: row.try_get("track_number")?,
        entry: row.try_get("entry")?,
        locale: row.try_get("locale")?,
        internal_signature: row.try_get("internal_signature")?,
        customer_id: row.try_get("customer_id")?,
        delivery_service: row.try_get("delivery_service")?,
        shardkey: row.try_get("shardkey")?,
        sm_id: row.try_get("sm_id")?,
        date_created: row.try_get("date_created")?,
        oof_shard: row.try_get("oof_shard")?,
        ..Order::default()
    })
}

fn delivery_from_row(row: &PgRow) -> Result<Delivery, sqlx::Error> {
    Ok(Delivery {
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        zip: row.try_get("zip")?,
        city: row.try_get("city")?,
        address: row.try_get("address")?,
        region: row.try_get("region")?,
        email: row.try_get("email")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, sqlx::Error> {
    Ok(Payment {
        transaction: row.try_get("transaction")?,
        request_id: row.try_get("request_id")?,
        currency: row.try_get("currency")?,
        provider: row.try_get("provider")?,
        amount: row.try_get("amount")?,
        payment_dt: row.try_get("payment_dt")?,
        bank: row.try_get("bank")?,
        delivery_cost: row.try_get("delivery_cost")?,
        goods_total: row.try_get("goods_total")?,
        custom_fee: row.try_get("custom_fee")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item, sqlx::Error> {
    Ok(Item {
        chrt_id: row.try_get("chrt_id")?,
        track_number: row.try_get("track_number")?,
        price: row.try_get("price")?,
        rid: row.try_get("rid")?,
        name: row.try_get("name")?,
        sale: row.try_get("sale")?,
        size: row.try_get("size")?,
        total_price: row.try_get("total_price")?,
        nm_id: row.try_get("nm_id")?,
        brand: row.try_get("brand")?,
        status: row.try_get("status")?,
    })
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn persist(&self, orders: &[Order]) -> Result<PersistOutcome, StoreError> {
        let (accepted, rejected) = screen_batch(orders);
        let mut outcome = PersistOutcome { rejected, ..PersistOutcome::default() };

        if accepted.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await.map_err(StoreError::Begin)?;

        for order in accepted {
            if self.insert_aggregate(&mut *tx, order).await? {
                outcome.persisted.push(order.order_uid.clone());
            } else {
                tracing::info!(
                    order_uid = %order.order_uid,
                    "Order already stored, leaving existing aggregate in place"
                );
                outcome.duplicates.push(order.order_uid.clone());
            }
        }

        tx.commit().await.map_err(StoreError::Commit)?;
        self.metrics.record_transaction();

        tracing::debug!(
            persisted = outcome.persisted.len(),
            rejected = outcome.rejected.len(),
            duplicates = outcome.duplicates.len(),
            "Committed order batch"
        );

        Ok(outcome)
    }

    async fn fetch_by_id(&self, order_uid: &str) -> Result<Option<Order>, StoreError> {
        let select = sqlx::query(
            "SELECT order_uid, track_number, entry, locale, internal_signature, customer_id,
                    delivery_service, shardkey, sm_id, date_created, oof_shard
             FROM orders WHERE order_uid = $1",
        )
        .bind(order_uid)
        .fetch_optional(&self.pool);
        let header = self
            .timed("select", "orders", select)
            .await
            .map_err(query_error("orders"))?;

        let Some(header) = header else {
            return Ok(None);
        };
        let mut order = header_from_row(&header).map_err(query_error("orders"))?;

        let incomplete = |missing| StoreError::Incomplete {
            order_uid: order_uid.to_string(),
            missing,
        };

        let select = sqlx::query(
            "SELECT name, phone, zip, city, address, region, email
             FROM deliveries WHERE order_uid = $1",
        )
        .bind(order_uid)
        .fetch_optional(&self.pool);
        let delivery = self
            .timed("select", "deliveries", select)
            .await
            .map_err(query_error("deliveries"))?
            .ok_or_else(|| incomplete("delivery"))?;
        order.delivery = delivery_from_row(&delivery).map_err(query_error("deliveries"))?;

        let select = sqlx::query(
            "SELECT transaction, request_id, currency, provider, amount, payment_dt,
                    bank, delivery_cost, goods_total, custom_fee
             FROM payments WHERE order_uid = $1",
        )
        .bind(order_uid)
        .fetch_optional(&self.pool);
        let payment = self
            .timed("select", "payments", select)
            .await
            .map_err(query_error("payments"))?
            .ok_or_else(|| incomplete("payment"))?;
        order.payment = payment_from_row(&payment).map_err(query_error("payments"))?;

        let select = sqlx::query(
            "SELECT chrt_id, track_number, price, rid, name, sale, size,
                    total_price, nm_id, brand, status
             FROM items WHERE order_uid = $1 ORDER BY id",
        )
        .bind(order_uid)
        .fetch_all(&self.pool);
        let rows = self
            .timed("select", "items", select)
            .await
            .map_err(query_error("items"))?;

        if rows.is_empty() {
            return Err(incomplete("item"));
        }
        order.items = rows
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_error("items"))?;

        Ok(Some(order))
    }

    async fn list_all_ids(&self) -> Result<Vec<String>, StoreError> {
        let select = sqlx::query_scalar::<_, String>("SELECT order_uid FROM orders ORDER BY order_uid")
            .fetch_all(&self.pool);
        self.timed("select", "orders", select)
            .await
            .map_err(query_error("orders"))
    }
}

// ============================================================================
// Integration Tests (require PostgreSQL)
// ============================================================================
//
// Run with a disposable database:
//   DATABASE_URL=postgres://... cargo test -- --ignored
//
// ============================================================================
