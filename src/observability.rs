//! Observability HTTP surface (spec §6): `/health`, `/metrics`, `/schedule`
//! and `/pools`, served by `warp` alongside the Prometheus text exposition.
//!
//! Grounded on the teacher's `WebhookManager` in `calendar/webhook.rs`:
//! `warp::path(...)` filters combined with `.or()`, each handler an `async
//! move` closure returning `warp::reply::with_status`, bound with
//! `warp::serve(routes).run(addr)`.

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use warp::http::StatusCode;
use warp::Filter;

use crate::app::AppContext;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    dependencies: HealthDependencies,
}

#[derive(Serialize)]
struct HealthDependencies {
    status_store: bool,
    sink: bool,
}

#[derive(Serialize)]
struct MetricsSnapshot {
    accounts_total: usize,
    accounts_active: usize,
    queue_depth: usize,
    connections_active: u32,
    messages_processed: u64,
    messages_failed: u64,
    memory_bytes: u64,
    cpu_percent: f32,
}

/// spec §6: overall status is `healthy` if every dependency check passes,
/// `degraded` if the fleet can still serve cached work, `unhealthy` (503) if
/// the status store itself is unreachable.
async fn health_handler(ctx: Arc<AppContext>) -> Result<impl warp::Reply, std::convert::Infallible> {
    let store_ok = ctx.status_store.needing_reconnection().await.is_ok();
    let status = if store_ok { "healthy" } else { "unhealthy" };
    let code = if store_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    Ok(warp::reply::with_status(
        warp::reply::json(&HealthResponse {
            status,
            dependencies: HealthDependencies {
                status_store: store_ok,
                sink: true,
            },
        }),
        code,
    ))
}

async fn metrics_json_handler(ctx: Arc<AppContext>) -> Result<impl warp::Reply, std::convert::Infallible> {
    let mailboxes = ctx.mailboxes_handle();
    let snapshot = mailboxes.read().await;
    let accounts_total = snapshot.len();
    let accounts_active = snapshot.values().filter(|m| m.active).count();
    let queue_depth = ctx.worker_fleet.queue_depth();

    let connections_active: u32 = ctx.pool.stats().await.hosts.iter().map(|h| h.live_sessions).sum();

    let mailbox_ids: Vec<_> = snapshot.keys().copied().collect();
    drop(snapshot);
    let statuses = ctx.status_store.get_many(&mailbox_ids).await.unwrap_or_default();
    let messages_processed = statuses.values().map(|r| r.messages_processed).sum();
    let messages_failed = statuses.values().map(|r| r.failures).sum();

    let usage = crate::metrics::process_resource_usage();
    crate::metrics::record_resource_usage(usage);

    Ok(warp::reply::json(&MetricsSnapshot {
        accounts_total,
        accounts_active,
        queue_depth,
        connections_active,
        messages_processed,
        messages_failed,
        memory_bytes: usage.memory_bytes,
        cpu_percent: usage.cpu_percent,
    }))
}

async fn metrics_text_handler(handle: PrometheusHandle) -> Result<impl warp::Reply, std::convert::Infallible> {
    Ok(warp::reply::with_header(
        handle.render(),
        "content-type",
        "text/plain; version=0.0.4",
    ))
}

async fn schedule_handler(ctx: Arc<AppContext>) -> Result<impl warp::Reply, std::convert::Infallible> {
    Ok(warp::reply::json(&ctx.scheduler.snapshot().await))
}

async fn pools_handler(ctx: Arc<AppContext>) -> Result<impl warp::Reply, std::convert::Infallible> {
    let stats = ctx.pool.stats().await;
    let hosts: Vec<serde_json::Value> = stats
        .hosts
        .into_iter()
        .map(|h| {
            serde_json::json!({
                "canonical_host": h.canonical_host,
                "live_sessions": h.live_sessions,
                "max_sessions": h.max_sessions,
            })
        })
        .collect();
    Ok(warp::reply::json(&hosts))
}

fn with_ctx(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Arc<AppContext>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

fn with_metrics_handle(
    handle: PrometheusHandle,
) -> impl Filter<Extract = (PrometheusHandle,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || handle.clone())
}

/// Bind and serve the observability surface until `ctx`'s cancellation token
/// fires. Runs as one of `AppContext::start`'s background tasks.
pub fn spawn(ctx: Arc<AppContext>, metrics_handle: PrometheusHandle, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    let health = warp::path("health")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(health_handler);

    let metrics_json = warp::path("metrics")
        .and(warp::get())
        .and(warp::header::exact_ignore_case("accept", "application/json"))
        .and(with_ctx(ctx.clone()))
        .and_then(metrics_json_handler);

    let metrics_text = warp::path("metrics")
        .and(warp::get())
        .and(with_metrics_handle(metrics_handle))
        .and_then(metrics_text_handler);

    let schedule = warp::path("schedule")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(schedule_handler);

    let pools = warp::path("pools")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(pools_handler);

    let routes = health.or(metrics_json).or(metrics_text).or(schedule).or(pools);
    let cancel = ctx.cancellation_token();

    tokio::spawn(async move {
        let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async move {
            cancel.cancelled().await;
        });
        server.await;
    })
}
