//! Scheduler (C3): holds a [`ScheduleEntry`] per active mailbox, emits due
//! tasks onto the Worker Fleet's queue, and adjusts interval, priority and
//! IDLE enablement from reported outcomes (spec §4.3).
//!
//! Grounded on the teacher's `EmailScheduler` in `mail/scheduler.rs`: a
//! `RwLock<HashMap<Id, Entry>>` scanned by a single `tokio::spawn`'d tick
//! loop on a `tokio::time::interval`, reporting state transitions over an
//! event channel. The teacher's per-email one-shot timer becomes a 10 s scan
//! over all entries (spec §4.3's "single serial loop"), and the teacher's
//! `SchedulerEvent` enum becomes the narrower, closed outcome set the
//! Session Monitor reports back through (spec §9: explicit typed channels
//! rather than an ad-hoc event-emitter mesh).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::pool::host_group::{canonical_host, idle_supported_default};
use crate::types::{IdleState, Mailbox, MailboxId, Priority, ScheduleEntry, Task, TaskKind, VolumeTier};

/// The closed set of outcomes the Session Monitor and Worker Fleet report
/// back to the Scheduler for a single serviced mailbox (spec §9).
#[derive(Debug, Clone)]
pub enum Outcome {
    PollSuccess { mailbox_id: MailboxId, new_messages: usize },
    PollFailure { mailbox_id: MailboxId },
    IdleOk { mailbox_id: MailboxId },
    IdleFailed { mailbox_id: MailboxId },
}

pub struct Scheduler {
    config: SchedulerConfig,
    entries: RwLock<HashMap<MailboxId, ScheduleEntry>>,
    task_tx: mpsc::Sender<Task>,
    max_task_retries: u32,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, task_tx: mpsc::Sender<Task>, max_task_retries: u32) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: RwLock::new(HashMap::new()),
            task_tx,
            max_task_retries,
        })
    }

    /// Register a newly-loaded mailbox: derives initial priority from its
    /// daily-limit hint and `idle_supported` from its canonical host (spec
    /// §4.3). Re-registering an already-tracked mailbox is a no-op so a
    /// periodic config refresh doesn't reset in-flight backoff state.
    pub async fn register(&self, mailbox: &Mailbox) {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&mailbox.id) {
            return;
        }
        let priority = Priority::from_daily_limit(mailbox.daily_send_limit);
        let idle_supported =
            idle_supported_default(&canonical_host(&mailbox.host), &self.config.idle_deny_list);
        entries.insert(mailbox.id, ScheduleEntry::new(mailbox.id, priority, idle_supported));
    }

    /// Remove a deactivated mailbox's schedule. In-flight tasks already
    /// dispatched for it are allowed to complete but the mailbox will not be
    /// re-enqueued on subsequent ticks (spec §3 invariant).
    pub async fn deregister(&self, mailbox_id: MailboxId) {
        self.entries.write().await.remove(&mailbox_id);
    }

    /// External priority override; takes effect on the mailbox's next tick.
    pub async fn set_priority(&self, mailbox_id: MailboxId, priority: Priority) {
        if let Some(entry) = self.entries.write().await.get_mut(&mailbox_id) {
            entry.priority = priority;
            entry.base_priority = priority;
        }
    }

    /// Pull a mailbox's next tick forward to now, e.g. after the Connection
    /// Pool's liveness sweep evicts its session and reports it needs
    /// reconnection (spec §4.1).
    pub async fn mark_due_now(&self, mailbox_id: MailboxId) {
        if let Some(entry) = self.entries.write().await.get_mut(&mailbox_id) {
            entry.next_due = Utc::now();
        }
    }

    /// Re-enable IDLE after an operator-issued command (spec §8 property 6:
    /// IDLE never re-enables itself once disabled by repeated failure).
    pub async fn reenable_idle(&self, mailbox_id: MailboxId) {
        if let Some(entry) = self.entries.write().await.get_mut(&mailbox_id) {
            if entry.idle.idle_supported {
                entry.idle.idle_enabled = true;
                entry.idle.idle_failures = 0;
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<ScheduleEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn entry(&self, mailbox_id: MailboxId) -> Option<ScheduleEntry> {
        self.entries.read().await.get(&mailbox_id).cloned()
    }

    /// A single scan over all active entries (spec §4.3's serial tick loop):
    /// anything due is turned into a `Task` against the mailbox's current
    /// snapshot and pushed onto the Worker Fleet's queue. Entries for
    /// mailboxes missing from `mailboxes` (deregistered mid-scan) are
    /// skipped rather than erroring.
    pub async fn tick(&self, mailboxes: &HashMap<MailboxId, Mailbox>) {
        let now = Utc::now();
        let due: Vec<(MailboxId, TaskKind, Priority)> = {
            let mut entries = self.entries.write().await;
            let mut due = Vec::new();
            for entry in entries.values_mut() {
                if !entry.active || entry.next_due > now {
                    continue;
                }
                let kind = self.select_task_kind(entry, now);
                if matches!(kind, TaskKind::Idle) {
                    entry.idle.last_idle_attempt = Some(now);
                }
                due.push((entry.mailbox_id, kind, entry.priority));
            }
            due
        };

        for (mailbox_id, kind, priority) in due {
            let Some(mailbox) = mailboxes.get(&mailbox_id) else {
                continue;
            };
            if !mailbox.active {
                continue;
            }
            let task = Task::new(mailbox.clone(), priority, kind, self.max_task_retries);
            if self.task_tx.send(task).await.is_err() {
                debug!(mailbox_id = %mailbox_id, "worker queue closed, dropping tick-emitted task");
            }
        }
    }

    /// spec §4.3 IDLE gating: IDLE only if enabled, supported, and the
    /// retry interval since the last attempt has elapsed; poll otherwise.
    fn select_task_kind(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> TaskKind {
        if entry.idle.idle_enabled && entry.idle.idle_supported {
            let elapsed = entry
                .idle
                .last_idle_attempt
                .map(|t| now - t)
                .unwrap_or_else(|| ChronoDuration::seconds(i64::MAX / 2));
            let retry_interval = ChronoDuration::from_std(self.config.idle_retry_interval)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
            if elapsed >= retry_interval {
                return TaskKind::Idle;
            }
        }
        TaskKind::Poll
    }

    /// Spawn the scheduler's tick loop (spec §4.3: wakes every 10 s). Runs
    /// until `cancel` fires.
    pub fn spawn_tick_loop(
        self: Arc<Self>,
        mailboxes: Arc<RwLock<HashMap<MailboxId, Mailbox>>>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tick_interval = self.config.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("scheduler tick loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let snapshot = mailboxes.read().await.clone();
                        self.tick(&snapshot).await;
                    }
                }
            }
        })
    }

    /// Apply a reported outcome to the owning mailbox's schedule entry
    /// (spec §4.3's outcome-handling table).
    pub async fn report(&self, outcome: Outcome) {
        let mut entries = self.entries.write().await;
        match outcome {
            Outcome::PollSuccess { mailbox_id, new_messages } => {
                if let Some(entry) = entries.get_mut(&mailbox_id) {
                    self.apply_poll_success(entry, new_messages);
                }
            }
            Outcome::PollFailure { mailbox_id } => {
                if let Some(entry) = entries.get_mut(&mailbox_id) {
                    self.apply_poll_failure(entry);
                }
            }
            Outcome::IdleOk { mailbox_id } => {
                if let Some(entry) = entries.get_mut(&mailbox_id) {
                    entry.idle.idle_failures = 0;
                    entry.next_due = Utc::now() + ChronoDuration::seconds(60);
                }
            }
            Outcome::IdleFailed { mailbox_id } => {
                if let Some(entry) = entries.get_mut(&mailbox_id) {
                    self.apply_idle_failure(entry);
                }
            }
        }
    }

    fn apply_poll_success(&self, entry: &mut ScheduleEntry, new_messages: usize) {
        let now = Utc::now();
        entry.last_serviced = Some(now);
        entry.consecutive_failures = 0;
        entry.success_rate = (entry.success_rate + 0.1).min(1.0);
        // Quarantine lifts on the next success: restore the mailbox's
        // baseline priority (spec §4.3's quarantine is temporary).
        entry.priority = entry.base_priority;

        let new_tier = VolumeTier::from_new_message_count(new_messages);
        if new_tier != entry.volume_tier {
            entry.volume_tier = new_tier;
        }
        entry.interval_secs = entry.volume_tier.interval_secs();
        let candidate = now + ChronoDuration::seconds(entry.interval_secs as i64);
        // A tier change that shortens the interval pulls next_due earlier
        // immediately rather than waiting for the old, longer interval.
        entry.next_due = candidate;
    }

    fn apply_poll_failure(&self, entry: &mut ScheduleEntry) {
        let now = Utc::now();
        entry.consecutive_failures += 1;
        entry.success_rate = (entry.success_rate - 0.2).max(0.0);

        if entry.consecutive_failures >= self.config.max_consecutive_failures {
            entry.priority = Priority::Low;
            entry.interval_secs = (entry.interval_secs * 2).min(self.config.quarantine_interval_cap.as_secs());
            entry.next_due = now + ChronoDuration::seconds(entry.interval_secs as i64);
            return;
        }

        let backoff_secs = (entry.interval_secs as f64
            * self.config.backoff_multiplier.powi(entry.consecutive_failures as i32))
        .min(300.0) as i64;
        entry.next_due = now + ChronoDuration::seconds(backoff_secs);
    }

    fn apply_idle_failure(&self, entry: &mut ScheduleEntry) {
        let now = Utc::now();
        entry.idle.idle_failures += 1;
        if entry.idle.idle_failures >= self.config.max_idle_failures {
            entry.idle.idle_enabled = false;
            entry.next_due = now + ChronoDuration::seconds(30);
            return;
        }
        let backoff = (60.0 * 2f64.powi(entry.idle.idle_failures as i32)).min(300.0) as i64;
        entry.next_due = now + ChronoDuration::seconds(backoff);
    }
}

/// Derive the default IDLE sub-state for a freshly-registered mailbox; kept
/// as a free function so tests can exercise it without a full Scheduler.
pub fn default_idle_state(host: &str, deny_list: &[String]) -> IdleState {
    IdleState::new(idle_supported_default(&canonical_host(host), deny_list))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MailboxCredentials, TlsMode};
    use secrecy::Secret;

    fn test_mailbox(daily_limit: u32) -> Mailbox {
        Mailbox {
            id: MailboxId::new(),
            address: "user@gmail.com".into(),
            host: "imap.gmail.com".into(),
            port: 993,
            tls_mode: TlsMode::Implicit,
            credentials: MailboxCredentials {
                username: "user@gmail.com".into(),
                password: Secret::new("pw".into()),
            },
            active: true,
            owner: "team-a".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            daily_send_limit: daily_limit,
        }
    }

    #[tokio::test]
    async fn register_sets_priority_from_daily_limit() {
        let (tx, _rx) = mpsc::channel(10);
        let scheduler = Scheduler::new(SchedulerConfig::default(), tx, 2);
        let mailbox = test_mailbox(5000);
        scheduler.register(&mailbox).await;
        let entry = scheduler.entry(mailbox.id).await.unwrap();
        assert_eq!(entry.priority, Priority::High);
        assert!(entry.idle.idle_supported);
    }

    #[tokio::test]
    async fn quarantine_after_three_failures_then_success_restores() {
        let (tx, _rx) = mpsc::channel(10);
        let scheduler = Scheduler::new(SchedulerConfig::default(), tx, 2);
        let mailbox = test_mailbox(5000);
        scheduler.register(&mailbox).await;

        for _ in 0..3 {
            scheduler.report(Outcome::PollFailure { mailbox_id: mailbox.id }).await;
        }
        let entry = scheduler.entry(mailbox.id).await.unwrap();
        assert_eq!(entry.consecutive_failures, 3);
        assert_eq!(entry.priority, Priority::Low);
        assert!(entry.interval_secs >= Priority::High.base_interval_secs() * 2);

        scheduler
            .report(Outcome::PollSuccess { mailbox_id: mailbox.id, new_messages: 0 })
            .await;
        let entry = scheduler.entry(mailbox.id).await.unwrap();
        assert_eq!(entry.consecutive_failures, 0);
        assert_eq!(entry.priority, Priority::High);
    }

    #[tokio::test]
    async fn idle_disabled_after_max_failures_and_stays_disabled() {
        let (tx, _rx) = mpsc::channel(10);
        let scheduler = Scheduler::new(SchedulerConfig::default(), tx, 2);
        let mailbox = test_mailbox(5000);
        scheduler.register(&mailbox).await;

        for _ in 0..3 {
            scheduler.report(Outcome::IdleFailed { mailbox_id: mailbox.id }).await;
        }
        let entry = scheduler.entry(mailbox.id).await.unwrap();
        assert!(!entry.idle.idle_enabled);

        // IDLE success path is irrelevant once disabled; it does not flip
        // idle_enabled back on by itself (spec §8 property 6).
        scheduler.report(Outcome::IdleOk { mailbox_id: mailbox.id }).await;
        let entry = scheduler.entry(mailbox.id).await.unwrap();
        assert!(!entry.idle.idle_enabled);
    }

    #[tokio::test]
    async fn volume_tier_reclassification_shortens_interval() {
        let (tx, _rx) = mpsc::channel(10);
        let scheduler = Scheduler::new(SchedulerConfig::default(), tx, 2);
        let mailbox = test_mailbox(10); // low priority, 900s base interval
        scheduler.register(&mailbox).await;

        scheduler
            .report(Outcome::PollSuccess { mailbox_id: mailbox.id, new_messages: 150 })
            .await;
        let entry = scheduler.entry(mailbox.id).await.unwrap();
        assert_eq!(entry.volume_tier, VolumeTier::High);
        assert_eq!(entry.interval_secs, 60);
    }

    #[tokio::test]
    async fn deregistered_mailbox_is_not_reticked() {
        let (tx, mut rx) = mpsc::channel(10);
        let scheduler = Scheduler::new(SchedulerConfig::default(), tx, 2);
        let mailbox = test_mailbox(5000);
        scheduler.register(&mailbox).await;
        scheduler.deregister(mailbox.id).await;

        let mut mailboxes = HashMap::new();
        mailboxes.insert(mailbox.id, mailbox.clone());
        scheduler.tick(&mailboxes).await;

        assert!(rx.try_recv().is_err());
    }
}
