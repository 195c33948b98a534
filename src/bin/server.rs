//! Process bootstrap: load [`AppConfig`] from the environment, initialize
//! logging, construct a single [`AppContext`], spawn every background loop,
//! and wait on SIGTERM/SIGINT for graceful shutdown.
//!
//! Grounded on the teacher's `flow_desk_cli` for the tokio `#[main]` +
//! `tracing_subscriber::fmt().try_init()` startup shape; the signal handling
//! and drain-then-exit sequence is net new (spec §6's "process signals"),
//! since the teacher's CLI binary runs to completion on stdin EOF rather
//! than serving indefinitely.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use imap_ingest_fleet::app::AppContext;
use imap_ingest_fleet::config::{AppConfig, LogFormat};
use imap_ingest_fleet::mailbox_source::SqliteMailboxSource;
use imap_ingest_fleet::sink::HttpSinkClient;
use imap_ingest_fleet::status_store::SqliteStatusStore;
use imap_ingest_fleet::{metrics, observability};

const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_logging(config.observability.log_format);

    info!("imap-ingest-fleet starting");

    let status_store = Arc::new(SqliteStatusStore::connect(&config.status_store.database_url).await?);
    let mailbox_source = Arc::new(SqliteMailboxSource::connect(&config.status_store.database_url).await?);
    let sink = Arc::new(HttpSinkClient::new(config.sink.endpoint.clone()));

    let http_bind_addr: SocketAddr = config
        .observability
        .http_bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid HTTP_BIND_ADDR: {e}"))?;

    let (ctx, task_rx, reconnect_rx) = AppContext::new(config, sink, status_store, mailbox_source);

    ctx.refresh_mailboxes().await?;

    let metrics_handle = metrics::install();
    let mut handles = ctx.start(task_rx, reconnect_rx);
    handles.push(observability::spawn(ctx.clone(), metrics_handle, http_bind_addr));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    ctx.shutdown(handles, SHUTDOWN_DRAIN_DEADLINE).await;

    Ok(())
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Text => subscriber.try_init(),
    };
    if let Err(err) = result {
        eprintln!("failed to initialize logging: {err}");
    }
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
