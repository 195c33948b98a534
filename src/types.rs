//! Core data model for the ingestion control plane: mailboxes, sessions,
//! host groups, schedule entries, tasks, envelopes and status records.

use chrono::{DateTime, Utc};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier for a [`Mailbox`]. A newtype rather than a bare `Uuid`
/// because `Mailbox`, `Session`, `Task` and `StatusRecord` all key off it and
/// mixing it up with an unrelated `Uuid` (thread id, internal envelope id) is
/// a bug class worth ruling out at the type level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailboxId(pub Uuid);

impl MailboxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MailboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a mailbox's IMAP port maps to a transport security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    /// Port 993: implicit TLS from the first byte.
    Implicit,
    /// Port 587 (or any port advertising STARTTLS): plaintext then upgrade.
    StartTls,
    /// No transport security at all.
    Plain,
}

impl TlsMode {
    /// Derive the TLS mode from a port number, per spec: 993 ⇒ implicit,
    /// 587 ⇒ STARTTLS, anything else ⇒ plaintext.
    pub fn from_port(port: u16) -> Self {
        match port {
            993 => TlsMode::Implicit,
            587 => TlsMode::StartTls,
            _ => TlsMode::Plain,
        }
    }
}

/// Credentials required to authenticate an IMAP session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxCredentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: Secret<String>,
}

/// An account to be monitored by the fleet. Created externally (the
/// configuration/credential source), loaded into memory at startup and
/// refreshed periodically; removed from the in-memory schedule when
/// deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    pub address: String,
    pub host: String,
    pub port: u16,
    pub tls_mode: TlsMode,
    pub credentials: MailboxCredentials,
    pub active: bool,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Used as a priority hint by the Scheduler (spec §4.3).
    pub daily_send_limit: u32,
}

/// The IMAP connection-level state of a [`Session`], mirrored in the
/// Status Record's `state` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailboxState {
    Connecting,
    Connected,
    Idle,
    Disconnected,
    Error,
    Reconnecting,
}

impl MailboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailboxState::Connecting => "connecting",
            MailboxState::Connected => "connected",
            MailboxState::Idle => "idle",
            MailboxState::Disconnected => "disconnected",
            MailboxState::Error => "error",
            MailboxState::Reconnecting => "reconnecting",
        }
    }

    pub fn needs_reconnection(&self) -> bool {
        matches!(
            self,
            MailboxState::Disconnected | MailboxState::Error | MailboxState::Reconnecting
        )
    }
}

/// A single live IMAP connection bound to one mailbox. Owned exclusively by
/// the Connection Pool; a worker *borrows* a session and releases it back at
/// the end of its task. Never shared between workers concurrently.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub mailbox_id: MailboxId,
    pub host_key: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: MailboxState,
}

/// Priority tier, ordered so the Worker Fleet's priority queue can order
/// tasks directly: `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Default priority derived from a mailbox's daily send-limit hint
    /// (spec §4.3): >1000 ⇒ high, >100 ⇒ medium, else low.
    pub fn from_daily_limit(daily_send_limit: u32) -> Self {
        if daily_send_limit > 1000 {
            Priority::High
        } else if daily_send_limit > 100 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    pub fn base_interval_secs(&self) -> u64 {
        match self {
            Priority::High => 60,
            Priority::Medium => 300,
            Priority::Low => 900,
        }
    }
}

/// Observed email-volume tier, reclassified by the Scheduler from the
/// number of new messages seen in a service cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeTier {
    High,
    Medium,
    Low,
}

impl VolumeTier {
    /// spec §4.3: >100 ⇒ high, >10 ⇒ medium, else low.
    pub fn from_new_message_count(count: usize) -> Self {
        if count > 100 {
            VolumeTier::High
        } else if count > 10 {
            VolumeTier::Medium
        } else {
            VolumeTier::Low
        }
    }

    pub fn interval_secs(&self) -> u64 {
        match self {
            VolumeTier::High => 60,
            VolumeTier::Medium => 300,
            VolumeTier::Low => 900,
        }
    }
}

/// The IDLE sub-state block of a [`ScheduleEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleState {
    pub idle_supported: bool,
    pub idle_enabled: bool,
    pub idle_failures: u32,
    pub last_idle_attempt: Option<DateTime<Utc>>,
}

impl IdleState {
    pub fn new(idle_supported: bool) -> Self {
        Self {
            idle_supported,
            idle_enabled: idle_supported,
            idle_failures: 0,
            last_idle_attempt: None,
        }
    }
}

/// The Scheduler's per-mailbox record: priority, cadence, observed volume
/// and the IDLE sub-state. One entry exists per active mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub mailbox_id: MailboxId,
    pub priority: Priority,
    /// Priority before any quarantine demotion; restored on the next
    /// successful poll (spec §4.3's quarantine is temporary).
    pub base_priority: Priority,
    pub interval_secs: u64,
    pub last_serviced: Option<DateTime<Utc>>,
    pub next_due: DateTime<Utc>,
    pub volume_tier: VolumeTier,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub active: bool,
    pub idle: IdleState,
}

impl ScheduleEntry {
    pub fn new(mailbox_id: MailboxId, priority: Priority, idle_supported: bool) -> Self {
        let interval_secs = priority.base_interval_secs();
        Self {
            mailbox_id,
            priority,
            base_priority: priority,
            interval_secs,
            last_serviced: None,
            next_due: Utc::now(),
            volume_tier: VolumeTier::Low,
            success_rate: 1.0,
            consecutive_failures: 0,
            active: true,
            idle: IdleState::new(idle_supported),
        }
    }
}

/// A unit of work handed to the Worker Fleet. Immutable once enqueued; a
/// retry produces a new logical instance with `retry_count` incremented.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskKind {
    Poll,
    Idle,
    HealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub mailbox_id: MailboxId,
    pub mailbox_snapshot: Mailbox,
    pub priority: Priority,
    pub kind: TaskKind,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Task {
    pub fn new(mailbox: Mailbox, priority: Priority, kind: TaskKind, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            mailbox_id: mailbox.id,
            mailbox_snapshot: mailbox,
            priority,
            kind,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries,
        }
    }

    /// Re-enqueue as a new logical instance with an incremented retry count.
    pub fn retried(&self) -> Self {
        let mut next = self.clone();
        next.id = Uuid::new_v4();
        next.enqueued_at = Utc::now();
        next.retry_count += 1;
        next
    }
}

/// The normalized record emitted per observed message, handed to the Sink
/// Adapter. Not retained after successful submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub mailbox_id: MailboxId,
    pub message_id: String,
    pub internal_id: String,
    pub thread_id: String,
    pub in_reply_to: String,
    pub references: Vec<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub is_reply: bool,
}

impl Envelope {
    /// Oversize handling (spec §4.2): truncate at 200 KB with an explicit
    /// marker, preserving every other field, when the serialized payload
    /// would exceed the downstream cap of ~250 KB.
    pub fn truncate_if_oversize(mut self) -> Self {
        const SINK_CAP_BYTES: usize = 250 * 1024;
        const TRUNCATE_TO_BYTES: usize = 200 * 1024;
        const MARKER: &str = "\n[Message truncated]";

        if self.body.len() > SINK_CAP_BYTES {
            let mut cut = TRUNCATE_TO_BYTES.min(self.body.len());
            while cut > 0 && !self.body.is_char_boundary(cut) {
                cut -= 1;
            }
            self.body.truncate(cut);
            self.body.push_str(MARKER);
        }
        self
    }
}

/// One attachment extracted by the Session Monitor's fully-parsed path
/// (spec §4.2's "alternative... path using an RFC-5322 parser"). Not part of
/// [`Envelope`] itself — the default path passes the raw source through as
/// the body and leaves attachment extraction to downstream MIME decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub content_base64: String,
}

/// Per-mailbox connection lifecycle state persisted to the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub mailbox_id: MailboxId,
    pub state: MailboxState,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub messages_processed: u64,
    pub next_reconnect: Option<DateTime<Utc>>,
    pub active: bool,
    /// Largest IMAP sequence number fully submitted to the Sink. `None`
    /// means "start from current EXISTS" on the next successful poll —
    /// the fleet never backfills historical mail on a fresh start.
    pub last_processed_uid: Option<u32>,
}

impl StatusRecord {
    pub fn new(mailbox_id: MailboxId) -> Self {
        Self {
            mailbox_id,
            state: MailboxState::Connecting,
            last_connected: None,
            last_disconnected: None,
            last_error: None,
            last_error_message: None,
            attempts: 0,
            successes: 0,
            failures: 0,
            messages_processed: 0,
            next_reconnect: None,
            active: true,
            last_processed_uid: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_mode_from_port() {
        assert_eq!(TlsMode::from_port(993), TlsMode::Implicit);
        assert_eq!(TlsMode::from_port(587), TlsMode::StartTls);
        assert_eq!(TlsMode::from_port(143), TlsMode::Plain);
    }

    #[test]
    fn priority_from_daily_limit() {
        assert_eq!(Priority::from_daily_limit(5000), Priority::High);
        assert_eq!(Priority::from_daily_limit(500), Priority::Medium);
        assert_eq!(Priority::from_daily_limit(10), Priority::Low);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn volume_tier_from_count() {
        assert_eq!(VolumeTier::from_new_message_count(150), VolumeTier::High);
        assert_eq!(VolumeTier::from_new_message_count(20), VolumeTier::Medium);
        assert_eq!(VolumeTier::from_new_message_count(1), VolumeTier::Low);
    }

    #[test]
    fn envelope_truncates_oversize_body() {
        let env = Envelope {
            mailbox_id: MailboxId::new(),
            message_id: "m1".into(),
            internal_id: "i1".into(),
            thread_id: String::new(),
            in_reply_to: String::new(),
            references: vec![],
            from: "a@example.com".into(),
            to: vec!["b@example.com".into()],
            subject: "big".into(),
            body: "x".repeat(300 * 1024),
            received_at: Utc::now(),
            is_reply: false,
        };
        let truncated = env.truncate_if_oversize();
        assert!(truncated.body.len() <= 200 * 1024 + 32);
        assert!(truncated.body.ends_with("[Message truncated]"));
    }

    #[test]
    fn envelope_under_cap_untouched() {
        let env = Envelope {
            mailbox_id: MailboxId::new(),
            message_id: "m1".into(),
            internal_id: "i1".into(),
            thread_id: String::new(),
            in_reply_to: String::new(),
            references: vec![],
            from: "a@example.com".into(),
            to: vec![],
            subject: "small".into(),
            body: "hello".into(),
            received_at: Utc::now(),
            is_reply: false,
        };
        let same = env.clone().truncate_if_oversize();
        assert_eq!(same.body, env.body);
    }
}
