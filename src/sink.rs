//! Sink Adapter (X1): submits batches of normalized envelopes to the
//! external durable queue (spec §4.5).
//!
//! Grounded on the teacher's `reqwest`-based provider clients (e.g.
//! `providers/gmail.rs`): a shared `reqwest::Client`, a `.post(url).json(
//! &body).send().await?` call, and a `response.status().is_success()` check
//! before treating the body as a success payload.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::error::{IngestError, IngestResult};
use crate::types::Envelope;

/// Hard cap on entries per submission (spec §4.5/§6).
pub const MAX_BATCH_SIZE: usize = 10;

/// One queue entry built from an [`Envelope`] (spec §4.5's per-entry shape).
#[derive(Debug, Clone, Serialize)]
pub struct SinkEntry {
    pub body: String,
    pub group_key: String,
    pub deduplication_key: String,
    pub attributes: SinkAttributes,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkAttributes {
    pub message_type: &'static str,
    pub account_id: String,
    pub original_message_id: String,
    pub internal_message_id: String,
    pub thread_id: String,
    pub is_reply: bool,
    pub has_text_content: bool,
    pub text_length: usize,
    pub timestamp: i64,
}

/// Per-entry submission result, mirroring a batch API that accepts ≤10
/// entries and returns per-entry success/failure (spec §4.5).
pub struct SubmitOutcome {
    pub succeeded: usize,
    pub failed: Vec<(String, String)>,
}

#[async_trait]
pub trait SinkClient: Send + Sync {
    async fn submit_batch(&self, envelopes: &[Envelope]) -> IngestResult<SubmitOutcome>;
}

/// Build the queue entry for one envelope. The deduplication key combines
/// the mailbox id with a wall-clock millisecond stamp (spec §4.5) — good
/// enough to collapse a single IMAP fetch's retries without the sink doing
/// content hashing.
pub fn build_entry(envelope: &Envelope) -> SinkEntry {
    let body = serde_json::to_string(envelope).unwrap_or_default();
    let wall_ms = Utc::now().timestamp_millis();
    SinkEntry {
        deduplication_key: format!("{}_{}", envelope.mailbox_id, wall_ms),
        group_key: envelope.mailbox_id.to_string(),
        attributes: SinkAttributes {
            message_type: "email",
            account_id: envelope.mailbox_id.to_string(),
            original_message_id: envelope.message_id.clone(),
            internal_message_id: envelope.internal_id.clone(),
            thread_id: envelope.thread_id.clone(),
            is_reply: envelope.is_reply,
            has_text_content: !envelope.body.is_empty(),
            text_length: envelope.body.len(),
            timestamp: envelope.received_at.timestamp(),
        },
        body,
    }
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    entries: &'a [SinkEntry],
}

pub struct HttpSinkClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSinkClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SinkClient for HttpSinkClient {
    async fn submit_batch(&self, envelopes: &[Envelope]) -> IngestResult<SubmitOutcome> {
        if envelopes.is_empty() {
            return Ok(SubmitOutcome {
                succeeded: 0,
                failed: Vec::new(),
            });
        }
        if envelopes.len() > MAX_BATCH_SIZE {
            return Err(IngestError::validation(
                "envelopes",
                format!("batch of {} exceeds sink cap of {MAX_BATCH_SIZE}", envelopes.len()),
            ));
        }

        let entries: Vec<SinkEntry> = envelopes.iter().map(build_entry).collect();

        let response = self
            .client
            .post(&self.endpoint)
            .json(&BatchRequest { entries: &entries })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IngestError::SinkRejected {
                message: format!("sink returned {}", response.status()),
            });
        }

        Ok(SubmitOutcome {
            succeeded: entries.len(),
            failed: Vec::new(),
        })
    }
}

/// In-memory fake for tests: records every submitted envelope, optionally
/// rejecting to exercise the Session Monitor's failure-reporting path.
pub struct InMemorySinkClient {
    pub submitted: tokio::sync::Mutex<Vec<Envelope>>,
    pub reject: std::sync::atomic::AtomicBool,
}

impl Default for InMemorySinkClient {
    fn default() -> Self {
        Self {
            submitted: tokio::sync::Mutex::new(Vec::new()),
            reject: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl InMemorySinkClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl SinkClient for InMemorySinkClient {
    async fn submit_batch(&self, envelopes: &[Envelope]) -> IngestResult<SubmitOutcome> {
        if envelopes.len() > MAX_BATCH_SIZE {
            return Err(IngestError::validation(
                "envelopes",
                format!("batch of {} exceeds sink cap of {MAX_BATCH_SIZE}", envelopes.len()),
            ));
        }
        if self.reject.load(std::sync::atomic::Ordering::SeqCst) {
            warn!("in-memory sink configured to reject, failing batch");
            return Err(IngestError::SinkRejected {
                message: "sink unavailable (test fixture)".into(),
            });
        }
        let mut submitted = self.submitted.lock().await;
        submitted.extend(envelopes.iter().cloned());
        Ok(SubmitOutcome {
            succeeded: envelopes.len(),
            failed: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MailboxId;

    fn test_envelope() -> Envelope {
        Envelope {
            mailbox_id: MailboxId::new(),
            message_id: "<abc@example.com>".into(),
            internal_id: "internal-1".into(),
            thread_id: String::new(),
            in_reply_to: String::new(),
            references: vec![],
            from: "a@example.com".into(),
            to: vec!["b@example.com".into()],
            subject: "hi".into(),
            body: "hello".into(),
            received_at: Utc::now(),
            is_reply: false,
        }
    }

    #[test]
    fn entry_attributes_match_envelope() {
        let envelope = test_envelope();
        let entry = build_entry(&envelope);
        assert_eq!(entry.group_key, envelope.mailbox_id.to_string());
        assert!(entry.deduplication_key.starts_with(&envelope.mailbox_id.to_string()));
        assert_eq!(entry.attributes.original_message_id, envelope.message_id);
        assert_eq!(entry.attributes.text_length, envelope.body.len());
    }

    #[tokio::test]
    async fn in_memory_sink_rejects_oversize_batch() {
        let sink = InMemorySinkClient::new();
        let envelopes: Vec<Envelope> = (0..11).map(|_| test_envelope()).collect();
        let result = sink.submit_batch(&envelopes).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn in_memory_sink_records_submissions() {
        let sink = InMemorySinkClient::new();
        let envelope = test_envelope();
        sink.submit_batch(std::slice::from_ref(&envelope)).await.unwrap();
        assert_eq!(sink.submitted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn in_memory_sink_honors_reject_flag() {
        let sink = InMemorySinkClient::new();
        sink.set_reject(true);
        let envelope = test_envelope();
        let result = sink.submit_batch(std::slice::from_ref(&envelope)).await;
        assert!(result.is_err());
    }
}
