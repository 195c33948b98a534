//! Host canonicalization (spec §4.1) and the per-host capacity/rate budget.
//!
//! Grounded on the teacher's `server_configs::get_config_by_domain`, which
//! matches a mailbox's domain against a static table of known providers via
//! suffix/exact match; here the same table groups live IMAP hosts behind a
//! single canonical key so a `HostGroup`'s caps apply across every mailbox
//! on that infrastructure, not per raw hostname.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{Quota, RateLimiter};
use governor::state::{InMemoryState, NotKeyed};
use governor::clock::DefaultClock;
use nonzero_ext::nonzero;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};

use crate::error::{IngestError, IngestResult};
use crate::types::Priority;

/// Canonicalize a raw IMAP hostname into the key its `HostGroup` is shared
/// under. Unknown hosts are keyed by their own lowercased value.
pub fn canonical_host(host: &str) -> String {
    let lower = host.to_lowercase();
    match lower.as_str() {
        h if h == "gmail.com" || h.ends_with(".google.com") || h == "imap.gmail.com" => {
            "gmail.com".to_string()
        }
        h if h.starts_with("outlook.") || h.starts_with("office365.") || h.contains("outlook.office365") => {
            "outlook.office365.com".to_string()
        }
        h if h.starts_with("yahoo.") || h.ends_with(".yahoo.com") => "yahoo.com".to_string(),
        h if h.starts_with("zoho.") || h.ends_with(".zoho.com") => "zoho.com".to_string(),
        h if h.starts_with("protonmail.") || h == "proton.me" || h.ends_with(".proton.me") => {
            "protonmail.ch".to_string()
        }
        other => other.to_string(),
    }
}

/// Whether a canonicalized host is known to support IDLE reliably, used by
/// the Scheduler to set `idle_supported`'s default (spec §4.3): known-good
/// hosts and unknown hosts both default to `true` (optimistic); only a host
/// named in the operator-configured `deny_list` (e.g. shared-hosting
/// providers observed dropping IDLE) defaults to `false`.
pub fn idle_supported_default(canonical: &str, deny_list: &[String]) -> bool {
    !deny_list.iter().any(|denied| denied == canonical)
}

/// All sessions targeting the same canonical host, sharing a concurrency
/// cap and a sliding new-session rate window.
pub struct HostGroup {
    pub canonical_host: String,
    pub max_concurrent_sessions: u32,
    concurrency: Arc<Semaphore>,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    /// Priority-ordered wait queue for requests parked on host capacity;
    /// woken in priority order with FIFO tie-break (spec §4.1).
    waiters: Mutex<BinaryHeap<WaitTicket>>,
    notify: Notify,
    next_seq: AtomicI64,
}

#[derive(Debug, Clone, Copy)]
struct WaitTicket {
    priority: Priority,
    seq: i64,
}

impl PartialEq for WaitTicket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for WaitTicket {}

impl PartialOrd for WaitTicket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WaitTicket {
    /// Higher priority sorts greater (`BinaryHeap::peek` surfaces it first);
    /// within a tier, a smaller sequence number (queued earlier) sorts
    /// greater so ties break FIFO.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl HostGroup {
    pub fn new(canonical_host: String, max_concurrent_sessions: u32, max_per_window: u32, window: Duration) -> Self {
        let quota = Quota::with_period(window / max_per_window.max(1))
            .unwrap_or_else(|| Quota::per_minute(nonzero!(200u32)))
            .allow_burst(
                std::num::NonZeroU32::new(max_per_window.max(1)).unwrap_or(nonzero!(1u32)),
            );
        Self {
            canonical_host,
            max_concurrent_sessions,
            concurrency: Arc::new(Semaphore::new(max_concurrent_sessions as usize)),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            waiters: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_seq: AtomicI64::new(0),
        }
    }

    /// Non-blocking check of the rate window; `true` means a new session
    /// may be created right now.
    pub fn try_admit_new_session(&self) -> bool {
        self.rate_limiter.check().is_ok()
    }

    pub fn live_sessions(&self) -> u32 {
        self.max_concurrent_sessions - self.concurrency.available_permits() as u32
    }

    /// Acquire a concurrency permit, admitting the highest-priority waiter
    /// (FIFO within a tier) as soon as one frees up rather than whichever
    /// caller happens to race the semaphore next (spec §4.1). Times out with
    /// a `Busy` error once `deadline` elapses since the caller first queued.
    pub async fn acquire_priority(&self, priority: Priority, deadline: Duration) -> IngestResult<OwnedSemaphorePermit> {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        let ticket = WaitTicket { priority, seq };
        self.waiters.lock().await.push(ticket);

        let started = Instant::now();
        let result = loop {
            let is_front = self.waiters.lock().await.peek().copied() == Some(ticket);
            if is_front {
                if let Ok(permit) = self.concurrency.clone().try_acquire_owned() {
                    break Ok(permit);
                }
            }

            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break Err(IngestError::busy(self.canonical_host.clone(), "timed out waiting for host capacity"));
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining.min(Duration::from_millis(50))) => {}
            }
        };

        let mut waiters = self.waiters.lock().await;
        waiters.retain(|t| *t != ticket);
        drop(waiters);
        self.notify.notify_waiters();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_known_providers() {
        assert_eq!(canonical_host("imap.gmail.com"), "gmail.com");
        assert_eq!(canonical_host("mail.google.com"), "gmail.com");
        assert_eq!(canonical_host("outlook.office365.com"), "outlook.office365.com");
        assert_eq!(canonical_host("imap.yahoo.com"), "yahoo.com");
        assert_eq!(canonical_host("zoho.eu"), "zoho.com");
        assert_eq!(canonical_host("imap.protonmail.ch"), "protonmail.ch");
    }

    #[test]
    fn unknown_host_keyed_by_itself() {
        assert_eq!(canonical_host("Mail.Example.COM"), "mail.example.com");
    }

    #[test]
    fn idle_default_optimistic_for_unknown() {
        assert!(idle_supported_default("mail.example.com", &[]));
        assert!(idle_supported_default("gmail.com", &[]));
    }

    #[test]
    fn idle_default_false_for_denied_host() {
        let deny_list = vec!["sharedhosting.example.com".to_string()];
        assert!(!idle_supported_default("sharedhosting.example.com", &deny_list));
        assert!(idle_supported_default("gmail.com", &deny_list));
    }
}
