use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

// ============================================================================
// Metrics Module - Prometheus metrics for the ingestion service
// ============================================================================
//
// - Pipeline throughput, per-stage error counts, per-message latency
// - Batch sizes handed to the store
// - Database transactions, per-query counts and latency (operation, table)
// - Cache size
// - Query surface request counts and response times
//
// Each `Metrics` owns its registry, so tests can build isolated instances.
// Scraped as text from /metrics on the query surface.
// ============================================================================

/// Pipeline stage an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    Read,
    Decode,
    Validate,
    Persist,
}

impl ErrorStage {
    fn as_label(self) -> &'static str {
        match self {
            ErrorStage::Read => "read",
            ErrorStage::Decode => "decode",
            ErrorStage::Validate => "validate",
            ErrorStage::Persist => "persist",
        }
    }
}

pub struct Metrics {
    registry: Registry,

    pub orders_processed: IntCounter,
    pub processing_errors: IntCounterVec,
    pub processing_duration: Histogram,
    pub batch_size: Histogram,
    pub orders_cached: IntGauge,
    pub transactions: IntCounter,
    pub db_queries: IntCounterVec,
    pub db_query_duration: HistogramVec,
    pub http_requests: IntCounterVec,
    pub http_response_time: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let orders_processed = IntCounter::new(
            "orders_processed_total",
            "Orders persisted and mirrored into the cache",
        )?;
        registry.register(Box::new(orders_processed.clone()))?;

        let processing_errors = IntCounterVec::new(
            Opts::new("order_processing_errors_total", "Order processing errors by stage"),
            &["stage"],
        )?;
        registry.register(Box::new(processing_errors.clone()))?;

        let processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "order_processing_duration_seconds",
                "Time from message receipt to end of processing",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(processing_duration.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("order_batch_size", "Orders per persistence transaction")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let orders_cached = IntGauge::new("orders_cached", "Orders currently held in the cache")?;
        registry.register(Box::new(orders_cached.clone()))?;

        let transactions = IntCounter::new("transactions_total", "Committed database transactions")?;
        registry.register(Box::new(transactions.clone()))?;

        let db_queries = IntCounterVec::new(
            Opts::new("database_queries_total", "Database queries by operation and table"),
            &["operation", "table"],
        )?;
        registry.register(Box::new(db_queries.clone()))?;

        let db_query_duration = HistogramVec::new(
            HistogramOpts::new("database_query_duration_seconds", "Database query duration"),
            &["operation", "table"],
        )?;
        registry.register(Box::new(db_query_duration.clone()))?;

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Query surface requests"),
            &["endpoint", "status"],
        )?;
        registry.register(Box::new(http_requests.clone()))?;

        let http_response_time = HistogramVec::new(
            HistogramOpts::new("http_response_time_seconds", "Query surface response time"),
            &["endpoint"],
        )?;
        registry.register(Box::new(http_response_time.clone()))?;

        Ok(Self {
            registry,
            orders_processed,
            processing_errors,
            processing_duration,
            batch_size,
            orders_cached,
            transactions,
            db_queries,
            db_query_duration,
            http_requests,
            http_response_time,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_error(&self, stage: ErrorStage) {
        self.processing_errors.with_label_values(&[stage.as_label()]).inc();
    }

    pub fn record_batch(&self, size: usize, persisted: usize) {
        self.batch_size.observe(size as f64);
        self.orders_processed.inc_by(persisted as u64);
    }

    pub fn record_query(&self, operation: &str, table: &str, elapsed: Duration) {
        self.db_queries.with_label_values(&[operation, table]).inc();
        self.db_query_duration
            .with_label_values(&[operation, table])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_transaction(&self) {
        self.transactions.inc();
    }

    pub fn record_http(&self, endpoint: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.http_requests
            .with_label_values(&[endpoint, status.as_str()])
            .inc();
        self.http_response_time
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
