//! Worker Fleet (C4): a bounded pool of workers draining a single priority
//! queue, executing Poll/Idle/HealthCheck tasks against a borrowed session
//! and reporting outcomes back to the Scheduler (spec §4.4).
//!
//! Grounded on the teacher's `ImapConnectionPool`'s background
//! `health_check_task` in `providers/imap/connection.rs` for the
//! spawn-a-loop-per-background-concern shape; the priority queue itself has
//! no teacher analogue (the source has no worker pool at all) and is built
//! from `std::collections::BinaryHeap` plus a monotonic sequence counter for
//! the FIFO tie-break spec §4.4 requires within a priority tier.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SchedulerConfig, WorkerConfig};
use crate::error::{IngestError, IngestResult};
use crate::monitor::{self, IdleOutcome};
use crate::pool::session::Session;
use crate::pool::ConnectionPool;
use crate::scheduler::{Outcome, Scheduler};
use crate::sink::{SinkClient, MAX_BATCH_SIZE};
use crate::status_store::StatusStore;
use crate::types::{Envelope, Mailbox, MailboxId, Task, TaskKind};

struct WorkItem {
    task: Task,
    seq: i64,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}
impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    /// Higher priority sorts greater (`BinaryHeap` is a max-heap); within a
    /// tier, a *smaller* sequence number sorts greater so FIFO order is
    /// preserved. Front-of-tier requeues use a disjoint, strictly negative
    /// sequence range so they always precede freshly enqueued work of the
    /// same priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TaskQueue {
    heap: Mutex<BinaryHeap<WorkItem>>,
    notify: Notify,
    depth: AtomicUsize,
    capacity: usize,
    next_seq: AtomicI64,
    next_front_seq: AtomicI64,
}

impl TaskQueue {
    fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            depth: AtomicUsize::new(0),
            capacity,
            next_seq: AtomicI64::new(0),
            next_front_seq: AtomicI64::new(i64::MIN),
        }
    }

    fn depth(&self) -> usize {
        self.depth.load(AtomicOrdering::SeqCst)
    }

    async fn push(&self, task: Task) -> IngestResult<()> {
        if self.depth() >= self.capacity {
            return Err(IngestError::QueueFull {
                capacity: self.capacity,
            });
        }
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.heap.lock().await.push(WorkItem { task, seq });
        self.depth.fetch_add(1, AtomicOrdering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }

    /// Requeue a task a stuck worker never finished, at the front of its
    /// priority tier. Bypasses the capacity check: the task was already
    /// admitted once and this is recovery, not new work. Sequence numbers
    /// count up from `i64::MIN`, far below `next_seq`'s 0-and-up range, so a
    /// front-requeue always precedes freshly enqueued work of the same
    /// priority while still preserving FIFO order among front-requeues
    /// themselves (the earliest stuck task gets the smallest seq).
    async fn push_front(&self, task: Task) {
        let seq = self.next_front_seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.heap.lock().await.push(WorkItem { task, seq });
        self.depth.fetch_add(1, AtomicOrdering::SeqCst);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Task {
        loop {
            {
                let mut heap = self.heap.lock().await;
                if let Some(item) = heap.pop() {
                    self.depth.fetch_sub(1, AtomicOrdering::SeqCst);
                    return item.task;
                }
            }
            self.notify.notified().await;
        }
    }
}

pub struct WorkerFleet {
    config: WorkerConfig,
    scheduler_config: SchedulerConfig,
    queue: Arc<TaskQueue>,
    pool: Arc<ConnectionPool>,
    scheduler: Arc<Scheduler>,
    sink: Arc<dyn SinkClient>,
    status_store: Arc<dyn StatusStore>,
}

impl WorkerFleet {
    pub fn new(
        config: WorkerConfig,
        scheduler_config: SchedulerConfig,
        pool: Arc<ConnectionPool>,
        scheduler: Arc<Scheduler>,
        sink: Arc<dyn SinkClient>,
        status_store: Arc<dyn StatusStore>,
    ) -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        Arc::new(Self {
            config,
            scheduler_config,
            queue,
            pool,
            scheduler,
            sink,
            status_store,
        })
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Drain the Scheduler's task channel into the priority queue. Tasks
    /// dropped for capacity are logged, not retried — the Scheduler will
    /// simply produce the mailbox's next task on a later tick.
    pub fn spawn_intake(
        self: Arc<Self>,
        mut task_rx: mpsc::Receiver<Task>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("worker intake loop stopping");
                        break;
                    }
                    task = task_rx.recv() => {
                        match task {
                            Some(task) => {
                                if let Err(err) = self.queue.push(task.clone()).await {
                                    warn!(mailbox_id = %task.mailbox_id, error = %err, "dropping task, queue full");
                                }
                            }
                            None => {
                                info!("scheduler task channel closed, stopping intake");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Spawn `worker_count` workers, each looping: pop, execute with a
    /// bounding timeout, handle the result.
    pub fn spawn_workers(self: Arc<Self>, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|idx| {
                let fleet = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { fleet.worker_loop(idx, cancel).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_index: u32, cancel: CancellationToken) {
        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker_index, "worker stopping");
                    return;
                }
                task = self.queue.pop() => task,
            };

            let mailbox_id = task.mailbox_id;
            crate::metrics::record_queue_depth(self.queue.depth());
            let started = std::time::Instant::now();
            let _ = self
                .status_store
                .increment(mailbox_id, crate::status_store::StatusCounter::Attempt)
                .await;
            match tokio::time::timeout(self.config.worker_timeout, self.run_task(&task)).await {
                Ok(Ok(())) => {
                    debug!(worker_index, mailbox_id = %mailbox_id, "task completed");
                    crate::metrics::record_task_outcome(&task.kind, task.priority, mailbox_id, "success", started.elapsed());
                    let _ = self
                        .status_store
                        .increment(mailbox_id, crate::status_store::StatusCounter::Success)
                        .await;
                    let state = if matches!(task.kind, TaskKind::Idle) {
                        crate::types::MailboxState::Idle
                    } else {
                        crate::types::MailboxState::Connected
                    };
                    let _ = self.status_store.set_state(mailbox_id, state, None).await;
                }
                Ok(Err(err)) => {
                    crate::metrics::record_task_outcome(&task.kind, task.priority, mailbox_id, "failure", started.elapsed());
                    let _ = self
                        .status_store
                        .increment(mailbox_id, crate::status_store::StatusCounter::Failure)
                        .await;
                    let _ = self
                        .status_store
                        .set_state(mailbox_id, crate::types::MailboxState::Error, Some(err.to_string()))
                        .await;
                    self.handle_failure(task, err).await;
                }
                Err(_) => {
                    warn!(
                        worker_index,
                        mailbox_id = %mailbox_id,
                        timeout_secs = self.config.worker_timeout.as_secs(),
                        "worker stuck on task, requeuing at front of its tier"
                    );
                    crate::metrics::record_task_outcome(&task.kind, task.priority, mailbox_id, "timeout", started.elapsed());
                    let _ = self
                        .status_store
                        .increment(mailbox_id, crate::status_store::StatusCounter::Failure)
                        .await;
                    // `run_task`'s future was dropped mid-flight by the timeout
                    // above, taking any held `pool::Borrow` with it without a
                    // chance to `release`/`discard` it. The mailbox lock frees
                    // on that drop, but its host-group capacity permit does
                    // not; `invalidate` reclaims it so the next acquire for
                    // this mailbox doesn't hold two permits at once.
                    self.pool.invalidate(mailbox_id).await;
                    self.queue.push_front(task).await;
                }
            }
        }
    }

    async fn handle_failure(&self, task: Task, err: IngestError) {
        warn!(mailbox_id = %task.mailbox_id, error = %err, retry_count = task.retry_count, "task failed");

        if task.retry_count < task.max_retries && err.is_retryable() {
            let backoff = self
                .config
                .retry_backoff_base
                .saturating_mul(2u32.saturating_pow(task.retry_count))
                .min(self.config.retry_backoff_cap);
            let retried = task.retried();
            let queue = self.queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                if let Err(err) = queue.push(retried).await {
                    warn!(error = %err, "failed to requeue retried task");
                }
            });
            return;
        }

        let outcome = match task.kind {
            TaskKind::Poll | TaskKind::HealthCheck => Outcome::PollFailure {
                mailbox_id: task.mailbox_id,
            },
            TaskKind::Idle => Outcome::IdleFailed {
                mailbox_id: task.mailbox_id,
            },
        };
        self.scheduler.report(outcome).await;
    }

    async fn run_task(&self, task: &Task) -> IngestResult<()> {
        match task.kind {
            TaskKind::HealthCheck => self.run_health_check(&task.mailbox_snapshot).await,
            TaskKind::Poll => self.run_poll(&task.mailbox_snapshot).await,
            TaskKind::Idle => self.run_idle(&task.mailbox_snapshot).await,
        }
    }

    async fn run_health_check(&self, mailbox: &Mailbox) -> IngestResult<()> {
        let mut borrow = self.pool.acquire(mailbox, crate::types::Priority::High).await?;
        let result = borrow.session.noop().await;
        match result {
            Ok(()) => {
                self.pool.release(mailbox, borrow, false).await;
                Ok(())
            }
            Err(err) => {
                self.pool.discard(mailbox.id, borrow).await;
                Err(err)
            }
        }
    }

    async fn run_poll(&self, mailbox: &Mailbox) -> IngestResult<()> {
        let watermark = self.current_watermark(mailbox.id).await?;
        let mut borrow = self.pool.acquire(mailbox, self.priority_for(mailbox).await).await?;

        let result = monitor::poll_once(&mut borrow.session, mailbox, watermark).await;
        let (envelopes, new_watermark) = match result {
            Ok(ok) => ok,
            Err(err) => {
                self.pool.discard(mailbox.id, borrow).await;
                return Err(err);
            }
        };

        match self.submit_and_advance(mailbox.id, envelopes, new_watermark).await {
            Ok(new_messages) => {
                self.pool.release(mailbox, borrow, false).await;
                self.scheduler
                    .report(Outcome::PollSuccess {
                        mailbox_id: mailbox.id,
                        new_messages,
                    })
                    .await;
                Ok(())
            }
            Err(err) => {
                self.pool.release(mailbox, borrow, false).await;
                Err(err)
            }
        }
    }

    async fn run_idle(&self, mailbox: &Mailbox) -> IngestResult<()> {
        let watermark = self.current_watermark(mailbox.id).await?;
        let borrow = self.pool.acquire(mailbox, self.priority_for(mailbox).await).await?;
        let crate::pool::Borrow { session, mailbox_guard } = borrow;

        let (session_opt, result, idle_outcome) = monitor::run_idle(
            session,
            mailbox,
            watermark,
            self.idle_startup_deadline(),
            self.idle_wait_window(),
            self.scheduler_config.noop_interval,
        )
        .await;

        let outcome_result = match result {
            Ok((envelopes, new_watermark)) => {
                self.submit_and_advance(mailbox.id, envelopes, new_watermark).await
            }
            Err(err) => Err(err),
        };

        match session_opt {
            Some(session) => {
                let borrow = crate::pool::Borrow { session, mailbox_guard };
                self.pool.release(mailbox, borrow, matches!(idle_outcome, IdleOutcome::Ok)).await;
            }
            None => {
                drop(mailbox_guard);
                self.pool.invalidate(mailbox.id).await;
            }
        }

        match outcome_result {
            Ok(_) => {
                self.scheduler.report(Outcome::IdleOk { mailbox_id: mailbox.id }).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn submit_and_advance(
        &self,
        mailbox_id: MailboxId,
        envelopes: Vec<Envelope>,
        new_watermark: Option<u32>,
    ) -> IngestResult<usize> {
        let total = envelopes.len();
        for chunk in envelopes.chunks(MAX_BATCH_SIZE) {
            if let Err(err) = self.sink.submit_batch(chunk).await {
                crate::metrics::record_sink_failure();
                return Err(err);
            }
        }
        crate::metrics::record_envelopes_submitted(total);
        if let Some(watermark) = new_watermark {
            self.status_store.advance_watermark(mailbox_id, watermark).await?;
        }
        if total > 0 {
            self.status_store
                .increment(mailbox_id, crate::status_store::StatusCounter::MessagesProcessed(total as u64))
                .await?;
        }
        Ok(total)
    }

    async fn current_watermark(&self, mailbox_id: MailboxId) -> IngestResult<Option<u32>> {
        Ok(self
            .status_store
            .get(mailbox_id)
            .await?
            .and_then(|record| record.last_processed_uid))
    }

    async fn priority_for(&self, mailbox: &Mailbox) -> crate::types::Priority {
        self.scheduler
            .entry(mailbox.id)
            .await
            .map(|entry| entry.priority)
            .unwrap_or(crate::types::Priority::Low)
    }

    fn idle_startup_deadline(&self) -> std::time::Duration {
        self.scheduler_config.idle_timeout
    }

    fn idle_wait_window(&self) -> std::time::Duration {
        // IDLE is re-issued roughly every five minutes by the Scheduler's
        // gating rule; wait the remainder of that window for a push before
        // returning control (spec §4.3's 300 s IDLE retry interval doubles
        // as the per-session IDLE refresh cadence).
        std::time::Duration::from_secs(290)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_store::InMemoryStatusStore;
    use crate::types::{MailboxCredentials, Priority, TaskKind, TlsMode};
    use secrecy::Secret;

    fn test_fleet() -> (Arc<WorkerFleet>, Arc<crate::sink::InMemorySinkClient>) {
        let status_store: Arc<dyn StatusStore> = Arc::new(InMemoryStatusStore::new());
        let (reconnect_tx, _reconnect_rx) = mpsc::channel(8);
        let pool = ConnectionPool::new(
            crate::config::PoolConfig::default(),
            reconnect_tx,
            status_store.clone(),
        );
        let (task_tx, _task_rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(SchedulerConfig::default(), task_tx, 2);
        let sink = Arc::new(crate::sink::InMemorySinkClient::new());
        let fleet = WorkerFleet::new(
            WorkerConfig::default(),
            SchedulerConfig::default(),
            pool,
            scheduler,
            sink.clone(),
            status_store,
        );
        (fleet, sink)
    }

    fn envelope(mailbox_id: MailboxId, uid: u32) -> Envelope {
        Envelope {
            mailbox_id,
            message_id: format!("<{uid}@example.com>"),
            internal_id: format!("internal-{uid}"),
            thread_id: String::new(),
            in_reply_to: String::new(),
            references: vec![],
            from: "a@example.com".into(),
            to: vec!["b@example.com".into()],
            subject: format!("subject {uid}"),
            body: format!("body {uid}"),
            received_at: chrono::Utc::now(),
            is_reply: false,
        }
    }

    /// S3 (spec §8): an EXISTS jump from 100 to 250 yields 150 new envelopes
    /// fetched in order; `submit_and_advance` must hand them to the sink in
    /// that same order, end the watermark at 250 (not at the count
    /// submitted), and bump `messages_processed` by exactly 150.
    #[tokio::test]
    async fn submit_and_advance_handles_exists_jump_in_order() {
        let (fleet, sink) = test_fleet();
        let mailbox_id = MailboxId::new();
        let envelopes: Vec<Envelope> = (101..=250).map(|uid| envelope(mailbox_id, uid)).collect();
        assert_eq!(envelopes.len(), 150);

        let submitted = fleet
            .submit_and_advance(mailbox_id, envelopes.clone(), Some(250))
            .await
            .expect("submit_and_advance should succeed");
        assert_eq!(submitted, 150);

        let record = fleet
            .status_store
            .get(mailbox_id)
            .await
            .unwrap()
            .expect("status row written");
        assert_eq!(record.last_processed_uid, Some(250));
        assert_eq!(record.messages_processed, 150);

        let recorded = sink.submitted.lock().await;
        assert_eq!(recorded.len(), 150);
        let recorded_ids: Vec<&str> = recorded.iter().map(|e| e.internal_id.as_str()).collect();
        let expected_ids: Vec<&str> = envelopes.iter().map(|e| e.internal_id.as_str()).collect();
        assert_eq!(recorded_ids, expected_ids, "envelopes submit in fetched order");
    }

    fn test_mailbox() -> Mailbox {
        Mailbox {
            id: MailboxId::new(),
            address: "user@example.com".into(),
            host: "imap.example.com".into(),
            port: 993,
            tls_mode: TlsMode::Implicit,
            credentials: MailboxCredentials {
                username: "user@example.com".into(),
                password: Secret::new("pw".into()),
            },
            active: true,
            owner: "team-a".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            daily_send_limit: 10,
        }
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_fifo() {
        let queue = TaskQueue::new(100);
        let low = Task::new(test_mailbox(), Priority::Low, TaskKind::Poll, 0);
        let high1 = Task::new(test_mailbox(), Priority::High, TaskKind::Poll, 0);
        let high2 = Task::new(test_mailbox(), Priority::High, TaskKind::Poll, 0);

        queue.push(low.clone()).await.unwrap();
        queue.push(high1.clone()).await.unwrap();
        queue.push(high2.clone()).await.unwrap();

        let first = queue.pop().await;
        let second = queue.pop().await;
        let third = queue.pop().await;

        assert_eq!(first.id, high1.id);
        assert_eq!(second.id, high2.id);
        assert_eq!(third.id, low.id);
    }

    #[tokio::test]
    async fn push_front_jumps_ahead_of_same_tier() {
        let queue = TaskQueue::new(100);
        let first = Task::new(test_mailbox(), Priority::Medium, TaskKind::Poll, 0);
        let stuck = Task::new(test_mailbox(), Priority::Medium, TaskKind::Poll, 0);

        queue.push(first.clone()).await.unwrap();
        queue.push_front(stuck.clone()).await;

        let popped = queue.pop().await;
        assert_eq!(popped.id, stuck.id);
    }

    #[tokio::test]
    async fn push_rejects_over_capacity() {
        let queue = TaskQueue::new(1);
        queue
            .push(Task::new(test_mailbox(), Priority::Low, TaskKind::Poll, 0))
            .await
            .unwrap();
        let result = queue
            .push(Task::new(test_mailbox(), Priority::Low, TaskKind::Poll, 0))
            .await;
        assert!(result.is_err());
    }
}
