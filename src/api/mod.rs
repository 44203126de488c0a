use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::OrderCache;
use crate::metrics::Metrics;
use crate::models::Order;
use crate::pipeline::PipelineState;

// ============================================================================
// Query Surface
// ============================================================================
//
// Serves orders straight from the cache and never touches the store.
//
//   GET /order/{order_uid}   one order, 404 when unknown
//   GET /api/orders          every cached order, 404 when the cache is empty
//   GET /health              pipeline state, 503 once it has stopped
//   GET /metrics             Prometheus text format
//
// ============================================================================

pub struct AppState {
    pub cache: Arc<OrderCache>,
    pub metrics: Arc<Metrics>,
    pub pipeline: watch::Receiver<PipelineState>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/order/{order_uid}", web::get().to(get_order))
        .route("/order/", web::get().to(missing_order_uid))
        .route("/api/orders", web::get().to(list_orders))
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics));
}

/// Bind the query surface. Signals are left to the caller, which stops the
/// returned server through its handle.
pub fn start_api_server(state: AppState, port: u16, shutdown_timeout: Duration) -> std::io::Result<Server> {
    tracing::info!("Starting HTTP server on http://0.0.0.0:{}", port);

    let state = web::Data::new(state);
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind(("0.0.0.0", port))?
        .shutdown_timeout(shutdown_timeout.as_secs().max(1))
        .disable_signals()
        .run();

    Ok(server)
}

/// Run `server` until `shutdown` fires, then stop it gracefully.
///
/// `shutdown` is cancelled on return either way, so a server that exits on
/// its own also brings the pipeline down.
pub async fn serve_until_shutdown(server: Server, shutdown: CancellationToken) -> std::io::Result<()> {
    let handle = server.handle();
    tokio::pin!(server);

    let finished = tokio::select! {
        served = &mut server => Some(served),
        _ = shutdown.cancelled() => None,
    };
    let served = match finished {
        Some(served) => {
            tracing::warn!("HTTP server exited on its own");
            served
        }
        None => {
            tracing::info!("Stopping HTTP server");
            handle.stop(true).await;
            server.await
        }
    };

    shutdown.cancel();
    served
}

async fn get_order(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let started = Instant::now();
    let order_uid = path.into_inner();

    let response = if order_uid.trim().is_empty() {
        bad_request()
    } else {
        match state.cache.get(&order_uid) {
            Some(order) => HttpResponse::Ok().json(&*order),
            None => {
                tracing::debug!(order_uid = %order_uid, "Order not found in cache");
                HttpResponse::NotFound().json(serde_json::json!({
                    "error": "order not found",
                    "order_uid": order_uid,
                }))
            }
        }
    };

    state
        .metrics
        .record_http("/order", response.status().as_u16(), started.elapsed());
    response
}

async fn missing_order_uid(state: web::Data<AppState>) -> HttpResponse {
    let started = Instant::now();
    let response = bad_request();
    state
        .metrics
        .record_http("/order", response.status().as_u16(), started.elapsed());
    response
}

fn bad_request() -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({ "error": "order_uid is required" }))
}

async fn list_orders(state: web::Data<AppState>) -> HttpResponse {
    let started = Instant::now();
    let snapshot = state.cache.list();

    let response = if snapshot.is_empty() {
        HttpResponse::NotFound().json(serde_json::json!({ "error": "no orders found" }))
    } else {
        let mut orders: Vec<&Order> = snapshot.iter().map(|order| order.as_ref()).collect();
        orders.sort_by(|a, b| a.order_uid.cmp(&b.order_uid));
        HttpResponse::Ok().json(orders)
    };

    state
        .metrics
        .record_http("/api/orders", response.status().as_u16(), started.elapsed());
    response
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    let started = Instant::now();
    let pipeline = *state.pipeline.borrow();
    let body = |status: &str| {
        serde_json::json!({
            "status": status,
            "pipeline": pipeline.as_str(),
            "orders_cached": state.cache.len(),
        })
    };

    let response = if pipeline == PipelineState::Stopped {
        HttpResponse::ServiceUnavailable().json(body("unhealthy"))
    } else {
        HttpResponse::Ok().json(body("healthy"))
    };

    state
        .metrics
        .record_http("/health", response.status().as_u16(), started.elapsed());
    response
}

async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    match state.metrics.render() {
        Ok(text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(text),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            HttpResponse::InternalServerError().finish()
        }
    }
}
