//! Metrics (ambient stack, carried regardless of spec.md's Non-goals):
//! `metrics` + `metrics-exporter-prometheus`, rendered behind the
//! observability HTTP surface's `/metrics` endpoint alongside the JSON
//! snapshot spec §6 describes.
//!
//! Grounded on the teacher's dependency list, which already carries both
//! crates without using them; the instrumentation points below (task
//! completion, queue depth, pool utilization) are new, named after the
//! aggregates spec §4.4 and §6 ask for.

use std::sync::{Mutex, OnceLock};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::types::{MailboxId, Priority, TaskKind};

static SYSTEM: OnceLock<Mutex<sysinfo::System>> = OnceLock::new();

/// This process's current memory and CPU usage (spec §6's metrics snapshot:
/// "memory, CPU"). `cpu_percent` needs two samples spaced apart to mean
/// anything; the first call after startup reads as 0.
#[derive(Debug, Clone, Copy)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

pub fn process_resource_usage() -> ResourceUsage {
    let lock = SYSTEM.get_or_init(|| Mutex::new(sysinfo::System::new_all()));
    let mut sys = match lock.lock() {
        Ok(sys) => sys,
        Err(poisoned) => poisoned.into_inner(),
    };

    let Ok(pid) = sysinfo::get_current_pid() else {
        return ResourceUsage { memory_bytes: 0, cpu_percent: 0.0 };
    };
    sys.refresh_process(pid);
    match sys.process(pid) {
        Some(process) => ResourceUsage {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        },
        None => ResourceUsage { memory_bytes: 0, cpu_percent: 0.0 },
    }
}

pub fn record_resource_usage(usage: ResourceUsage) {
    metrics::gauge!("ingest_process_memory_bytes").set(usage.memory_bytes as f64);
    metrics::gauge!("ingest_process_cpu_percent").set(usage.cpu_percent as f64);
}

/// Install the global Prometheus recorder once at startup and hand back a
/// handle whose `render()` the observability server exposes at `/metrics`.
pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder")
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "high",
        Priority::Medium => "medium",
        Priority::Low => "low",
    }
}

fn kind_label(kind: &TaskKind) -> &'static str {
    match kind {
        TaskKind::Poll => "poll",
        TaskKind::Idle => "idle",
        TaskKind::HealthCheck => "health_check",
    }
}

/// Record one task's completion or failure (spec §4.4: "Workers emit, per
/// completed or failed task: task kind, priority, mailbox id, execution
/// duration, outcome"). The mailbox id is bounded in cardinality by
/// `max_concurrent_accounts` (spec's own cap on the active mailbox set), so
/// carrying it as a label stays within the same order of magnitude as the
/// fleet's own admission limit rather than growing unboundedly.
pub fn record_task_outcome(
    kind: &TaskKind,
    priority: Priority,
    mailbox_id: MailboxId,
    outcome: &'static str,
    duration: std::time::Duration,
) {
    let mailbox_label = mailbox_id.to_string();
    let labels = [
        ("kind", kind_label(kind)),
        ("priority", priority_label(priority)),
        ("outcome", outcome),
        ("mailbox_id", mailbox_label.as_str()),
    ];
    metrics::counter!("ingest_tasks_total", &labels).increment(1);
    metrics::histogram!("ingest_task_duration_seconds", &labels).record(duration.as_secs_f64());
}

pub fn record_queue_depth(depth: usize) {
    metrics::gauge!("ingest_queue_depth").set(depth as f64);
}

pub fn record_envelopes_submitted(count: usize) {
    metrics::counter!("ingest_envelopes_submitted_total").increment(count as u64);
}

pub fn record_sink_failure() {
    metrics::counter!("ingest_sink_failures_total").increment(1);
}

pub fn record_host_utilization(canonical_host: &str, live: u32, max: u32) {
    let labels = [("host", canonical_host.to_string())];
    metrics::gauge!("ingest_host_live_sessions", &labels).set(live as f64);
    metrics::gauge!("ingest_host_max_sessions", &labels).set(max as f64);
}
