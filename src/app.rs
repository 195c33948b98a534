//! `AppContext` (spec §9's one sanctioned "singleton"): owns exactly one
//! instance of each component, constructed once at process startup and torn
//! down once at exit. Every cross-component reference is threaded through
//! here by construction rather than reached for as global state, per spec
//! §9's re-architecture note on the teacher's module-level singletons.
//!
//! Grounded on the teacher's `MailEngine` in `mail/engine.rs`: a struct
//! holding `Arc`s to its collaborators, a `start_sync`/`stop_sync` pair, and
//! a `shutdown()` that signals every background task and awaits them before
//! returning — generalized here into the four core components plus the two
//! adapters spec §2 names.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::IngestResult;
use crate::mailbox_source::MailboxSource;
use crate::pool::ConnectionPool;
use crate::scheduler::Scheduler;
use crate::sink::SinkClient;
use crate::status_store::StatusStore;
use crate::types::{Mailbox, MailboxId};
use crate::worker::WorkerFleet;

pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub pool: Arc<ConnectionPool>,
    pub scheduler: Arc<Scheduler>,
    pub worker_fleet: Arc<WorkerFleet>,
    pub sink: Arc<dyn SinkClient>,
    pub status_store: Arc<dyn StatusStore>,
    pub mailbox_source: Arc<dyn MailboxSource>,
    mailboxes: Arc<RwLock<HashMap<MailboxId, Mailbox>>>,
    cancel: CancellationToken,
}

impl AppContext {
    /// Construct every component from `config`, wiring the closed channel
    /// sets spec §9 calls for at each boundary: the Scheduler's task channel
    /// feeds the Worker Fleet's intake, and the Connection Pool's reconnect
    /// channel feeds back into the Scheduler.
    pub fn new(
        config: AppConfig,
        sink: Arc<dyn SinkClient>,
        status_store: Arc<dyn StatusStore>,
        mailbox_source: Arc<dyn MailboxSource>,
    ) -> (Arc<Self>, mpsc::Receiver<crate::types::Task>, mpsc::Receiver<MailboxId>) {
        let config = Arc::new(config);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1024);
        let (task_tx, task_rx) = mpsc::channel(config.worker.queue_capacity);

        let pool = ConnectionPool::new(config.pool.clone(), reconnect_tx, status_store.clone());
        let scheduler = Scheduler::new(config.scheduler.clone(), task_tx, config.worker.max_retries);
        let worker_fleet = WorkerFleet::new(
            config.worker.clone(),
            config.scheduler.clone(),
            pool.clone(),
            scheduler.clone(),
            sink.clone(),
            status_store.clone(),
        );

        let ctx = Arc::new(Self {
            config,
            pool,
            scheduler,
            worker_fleet,
            sink,
            status_store,
            mailbox_source,
            mailboxes: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
        });

        // `start()` needs `task_rx` to spawn the Worker Fleet's intake loop;
        // returned rather than stashed since `AppContext` itself has no
        // field for it once `WorkerFleet::new` has consumed `task_tx`.
        (ctx, task_rx, reconnect_rx)
    }

    /// Load active mailboxes from the source, registering newly-seen ones
    /// with the Scheduler and deregistering any that dropped out of the
    /// active set since the last load (spec §3: "removed when deactivated").
    pub async fn refresh_mailboxes(&self) -> IngestResult<()> {
        let fresh = self.mailbox_source.active_mailboxes().await?;
        let fresh_ids: std::collections::HashSet<MailboxId> = fresh.iter().map(|m| m.id).collect();

        let stale_ids: Vec<MailboxId> = {
            let current = self.mailboxes.read().await;
            current.keys().filter(|id| !fresh_ids.contains(id)).copied().collect()
        };
        for id in stale_ids {
            self.scheduler.deregister(id).await;
            self.mailboxes.write().await.remove(&id);
        }

        for mailbox in &fresh {
            self.scheduler.register(mailbox).await;
        }

        let mut current = self.mailboxes.write().await;
        for mailbox in fresh {
            current.insert(mailbox.id, mailbox);
        }
        info!(mailbox_count = current.len(), "mailbox list refreshed");
        Ok(())
    }

    pub fn mailboxes_handle(&self) -> Arc<RwLock<HashMap<MailboxId, Mailbox>>> {
        self.mailboxes.clone()
    }

    /// Active mailboxes joined against their current status, in one batched
    /// `StatusStore::get_many` call rather than an N+1 `get` per mailbox
    /// (spec §4.5). A mailbox with no status row yet (never polled) pairs
    /// with `None`.
    pub async fn mailboxes_with_status(
        &self,
    ) -> IngestResult<Vec<(Mailbox, Option<crate::types::StatusRecord>)>> {
        let mailboxes = self.mailboxes.read().await;
        let ids: Vec<MailboxId> = mailboxes.keys().copied().collect();
        let mut statuses = self.status_store.get_many(&ids).await?;
        Ok(mailboxes
            .values()
            .cloned()
            .map(|mailbox| {
                let status = statuses.remove(&mailbox.id);
                (mailbox, status)
            })
            .collect())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start every background loop: the Scheduler's tick, the Worker Fleet's
    /// intake and workers, the Connection Pool's sweeps, the periodic
    /// mailbox-list refresh, and the reconnect bridge from pool to
    /// scheduler. Returns the join handles so the caller can await them
    /// during shutdown.
    pub fn start(
        self: &Arc<Self>,
        task_rx: mpsc::Receiver<crate::types::Task>,
        mut reconnect_rx: mpsc::Receiver<MailboxId>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(
            self.scheduler
                .clone()
                .spawn_tick_loop(self.mailboxes.clone(), self.cancel.clone()),
        );
        handles.push(
            self.worker_fleet
                .clone()
                .spawn_intake(task_rx, self.cancel.clone()),
        );
        handles.extend(self.worker_fleet.clone().spawn_workers(self.cancel.clone()));

        let pool = self.pool.clone();
        let liveness_interval = self.config.pool.liveness_sweep_interval;
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(liveness_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => pool.liveness_sweep().await,
                }
            }
        }));

        let pool = self.pool.clone();
        let orphan_interval = self.config.pool.orphan_sweep_interval;
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orphan_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => pool.purge_orphans().await,
                }
            }
        }));

        let scheduler = self.scheduler.clone();
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = reconnect_rx.recv() => match received {
                        Some(mailbox_id) => scheduler.mark_due_now(mailbox_id).await,
                        None => break,
                    },
                }
            }
        }));

        let ctx = self.clone();
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = ctx.refresh_mailboxes().await {
                            warn!(error = %err, "periodic mailbox refresh failed");
                        }
                    }
                }
            }
        }));

        // Durable counterpart to the in-memory `reconnect_rx` bridge above:
        // a mailbox can land in `error`/`disconnected`/`reconnecting` via a
        // path that never touches the pool's reconnect channel (e.g. a
        // worker-reported task failure in `worker.rs`), so this scans the
        // Status Store directly and nudges the Scheduler for anything it
        // finds (spec §4.1's reconnection requirement).
        let status_store = self.status_store.clone();
        let scheduler = self.scheduler.clone();
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match status_store.needing_reconnection().await {
                            Ok(records) => {
                                for record in records {
                                    scheduler.mark_due_now(record.mailbox_id).await;
                                }
                            }
                            Err(err) => warn!(error = %err, "failed to scan status store for reconnection"),
                        }
                    }
                }
            }
        }));

        let pool = self.pool.clone();
        let metrics_interval = self.config.worker.metrics_interval;
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(metrics_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = pool.stats().await;
                        for host in stats.hosts {
                            crate::metrics::record_host_utilization(&host.canonical_host, host.live_sessions, host.max_sessions);
                        }
                    }
                }
            }
        }));

        handles
    }

    /// Graceful shutdown (spec §6's process signals): stop accepting new
    /// tasks, drain in-flight work up to `drain_deadline`, close sessions.
    /// Status upserts are flushed synchronously on every write already, so
    /// there is nothing buffered left to push here.
    pub async fn shutdown(&self, handles: Vec<tokio::task::JoinHandle<()>>, drain_deadline: Duration) {
        info!("shutdown initiated, stopping new task intake");
        self.cancel.cancel();

        let drained = tokio::time::timeout(drain_deadline, futures::future::join_all(handles)).await;
        if drained.is_err() {
            warn!(
                deadline_secs = drain_deadline.as_secs(),
                "shutdown drain deadline elapsed, closing sessions anyway"
            );
        }

        self.pool.shutdown().await;
        info!("shutdown complete");
    }
}
