use sqlx::PgPool;

use super::StoreError;

// ============================================================================
// Schema Bootstrap
// ============================================================================
//
// Idempotent DDL for the four order tables. Safe to run on every start;
// existing tables are never altered.
//
// ============================================================================

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS orders (
        order_uid          TEXT PRIMARY KEY,
        track_number       TEXT NOT NULL,
        entry              TEXT NOT NULL,
        locale             TEXT NOT NULL,
        internal_signature TEXT NOT NULL,
        customer_id        TEXT NOT NULL,
        delivery_service   TEXT NOT NULL,
        shardkey           TEXT NOT NULL,
        sm_id              INTEGER NOT NULL,
        date_created       TIMESTAMPTZ,
        oof_shard          TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS deliveries (
        order_uid TEXT PRIMARY KEY REFERENCES orders (order_uid) ON DELETE CASCADE,
        name      TEXT NOT NULL,
        phone     TEXT NOT NULL,
        zip       TEXT NOT NULL,
        city      TEXT NOT NULL,
        address   TEXT NOT NULL,
        region    TEXT NOT NULL,
        email     TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS payments (
        order_uid     TEXT PRIMARY KEY REFERENCES orders (order_uid) ON DELETE CASCADE,
        transaction   TEXT NOT NULL,
        request_id    TEXT NOT NULL,
        currency      TEXT NOT NULL,
        provider      TEXT NOT NULL,
        amount        BIGINT NOT NULL,
        payment_dt    BIGINT NOT NULL,
        bank          TEXT NOT NULL,
        delivery_cost BIGINT NOT NULL,
        goods_total   BIGINT NOT NULL,
        custom_fee    BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS items (
        id           BIGSERIAL PRIMARY KEY,
        order_uid    TEXT NOT NULL REFERENCES orders (order_uid) ON DELETE CASCADE,
        chrt_id      BIGINT NOT NULL,
        track_number TEXT NOT NULL,
        price        BIGINT NOT NULL,
        rid          TEXT NOT NULL,
        name         TEXT NOT NULL,
        sale         INTEGER NOT NULL,
        size         TEXT NOT NULL,
        total_price  BIGINT NOT NULL,
        nm_id        BIGINT NOT NULL,
        brand        TEXT NOT NULL,
        status       INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS items_order_uid_idx ON items (order_uid)",
];

pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(StoreError::Schema)?;
    }

    tracing::info!(tables = 4, "Order schema ready");
    Ok(())
}
