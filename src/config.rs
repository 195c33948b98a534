//! Process configuration, loaded from environment variables at startup
//! (spec §6's Environment surface table). Struct-of-structs shape matches
//! the teacher's `MailEngineConfig`, but values are sourced from `std::env`
//! with typed defaults instead of being passed in as a literal.

use std::env;
use std::time::Duration;

use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections_per_account: u32,
    pub max_connections_per_server: u32,
    pub rate_limit_window: Duration,
    pub max_rate_limit: u32,
    pub session_creation_retries: u32,
    pub session_creation_backoff_base: Duration,
    pub session_creation_backoff_cap: Duration,
    pub liveness_sweep_interval: Duration,
    pub orphan_sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_account: 1,
            max_connections_per_server: 75,
            rate_limit_window: Duration::from_millis(60_000),
            max_rate_limit: 200,
            session_creation_retries: 3,
            session_creation_backoff_base: Duration::from_secs(1),
            session_creation_backoff_cap: Duration::from_secs(5),
            liveness_sweep_interval: Duration::from_secs(5 * 60),
            orphan_sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_accounts: u32,
    pub high_priority_interval: Duration,
    pub medium_priority_interval: Duration,
    pub low_priority_interval: Duration,
    pub max_consecutive_failures: u32,
    pub backoff_multiplier: f64,
    pub quarantine_interval_cap: Duration,
    pub idle_timeout: Duration,
    pub noop_interval: Duration,
    pub max_idle_failures: u32,
    pub idle_retry_interval: Duration,
    pub tick_interval: Duration,
    /// Canonical hosts that default `idle_supported` to `false` (spec §4.3:
    /// "known-bad hosts (configured deny-list such as shared-hosting
    /// providers)"). Empty by default; an operator names the hosts their
    /// own fleet has observed dropping IDLE.
    pub idle_deny_list: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_accounts: 10_000,
            high_priority_interval: Duration::from_secs(60),
            medium_priority_interval: Duration::from_secs(300),
            low_priority_interval: Duration::from_secs(900),
            max_consecutive_failures: 3,
            backoff_multiplier: 2.0,
            quarantine_interval_cap: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(30),
            noop_interval: Duration::from_secs(30),
            max_idle_failures: 3,
            idle_retry_interval: Duration::from_secs(300),
            tick_interval: Duration::from_secs(10),
            idle_deny_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: u32,
    pub worker_timeout: Duration,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    pub metrics_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 50,
            worker_timeout: Duration::from_secs(5 * 60),
            queue_capacity: 10_000,
            max_retries: 2,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_cap: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub endpoint: String,
    pub batch_size: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000/ingest".to_string(),
            batch_size: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusStoreConfig {
    pub database_url: String,
}

impl Default for StatusStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ingest-fleet.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    pub http_bind_addr: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Text,
            http_bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub sink: SinkConfig,
    pub status_store: StatusStoreConfig,
    pub observability: ObservabilityConfig,
}

fn env_u32(key: &str, default: u32) -> IngestResult<u32> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| IngestError::Configuration {
                message: format!("{key} must be an unsigned integer, got {v:?}"),
            }),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> IngestResult<usize> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| IngestError::Configuration {
                message: format!("{key} must be an unsigned integer, got {v:?}"),
            }),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> IngestResult<Duration> {
    match env::var(key) {
        Ok(v) => {
            let ms: u64 = v.parse().map_err(|_| IngestError::Configuration {
                message: format!("{key} must be milliseconds, got {v:?}"),
            })?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    /// Load configuration from process environment, falling back to the
    /// defaults given in spec §6 where a variable is unset.
    pub fn from_env() -> IngestResult<Self> {
        let defaults = AppConfig::default();

        let pool = PoolConfig {
            max_connections_per_account: env_u32(
                "MAX_CONNECTIONS_PER_ACCOUNT",
                defaults.pool.max_connections_per_account,
            )?,
            max_connections_per_server: env_u32(
                "MAX_CONNECTIONS_PER_SERVER",
                defaults.pool.max_connections_per_server,
            )?,
            rate_limit_window: env_millis("RATE_LIMIT_WINDOW", defaults.pool.rate_limit_window)?,
            max_rate_limit: env_u32("MAX_RATE_LIMIT", defaults.pool.max_rate_limit)?,
            ..defaults.pool
        };

        let scheduler = SchedulerConfig {
            max_concurrent_accounts: env_u32(
                "MAX_CONCURRENT_ACCOUNTS",
                defaults.scheduler.max_concurrent_accounts,
            )?,
            high_priority_interval: env_millis(
                "HIGH_PRIORITY_INTERVAL",
                defaults.scheduler.high_priority_interval,
            )?,
            medium_priority_interval: env_millis(
                "MEDIUM_PRIORITY_INTERVAL",
                defaults.scheduler.medium_priority_interval,
            )?,
            low_priority_interval: env_millis(
                "LOW_PRIORITY_INTERVAL",
                defaults.scheduler.low_priority_interval,
            )?,
            max_consecutive_failures: env_u32(
                "MAX_CONSECUTIVE_FAILURES",
                defaults.scheduler.max_consecutive_failures,
            )?,
            backoff_multiplier: match env::var("BACKOFF_MULTIPLIER") {
                Ok(v) => v.parse().map_err(|_| IngestError::Configuration {
                    message: format!("BACKOFF_MULTIPLIER must be a float, got {v:?}"),
                })?,
                Err(_) => defaults.scheduler.backoff_multiplier,
            },
            idle_timeout: env_millis("IDLE_TIMEOUT", defaults.scheduler.idle_timeout)?,
            noop_interval: env_millis("NOOP_INTERVAL", defaults.scheduler.noop_interval)?,
            max_idle_failures: env_u32(
                "MAX_IDLE_FAILURES",
                defaults.scheduler.max_idle_failures,
            )?,
            idle_deny_list: match env::var("IDLE_DENY_LIST") {
                Ok(v) => v
                    .split(',')
                    .map(|host| host.trim().to_lowercase())
                    .filter(|host| !host.is_empty())
                    .collect(),
                Err(_) => defaults.scheduler.idle_deny_list,
            },
            ..defaults.scheduler
        };

        let worker = WorkerConfig {
            worker_count: env_u32("MAX_WORKERS", defaults.worker.worker_count)?,
            worker_timeout: env_millis("WORKER_TIMEOUT", defaults.worker.worker_timeout)?,
            queue_capacity: env_usize("TASK_QUEUE_CAPACITY", defaults.worker.queue_capacity)?,
            ..defaults.worker
        };

        let sink = SinkConfig {
            endpoint: env_string("SINK_ENDPOINT", &defaults.sink.endpoint),
            ..defaults.sink
        };

        let status_store = StatusStoreConfig {
            database_url: env_string(
                "STATUS_STORE_DATABASE_URL",
                &defaults.status_store.database_url,
            ),
        };

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let observability = ObservabilityConfig {
            log_format,
            http_bind_addr: env_string(
                "HTTP_BIND_ADDR",
                &defaults.observability.http_bind_addr,
            ),
        };

        Ok(Self {
            pool,
            scheduler,
            worker,
            sink,
            status_store,
            observability,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.worker.worker_count, 50);
        assert_eq!(cfg.worker.queue_capacity, 10_000);
        assert_eq!(cfg.pool.max_rate_limit, 200);
        assert_eq!(cfg.scheduler.max_consecutive_failures, 3);
    }

    #[test]
    fn rejects_malformed_numeric_env() {
        env::set_var("MAX_WORKERS", "not-a-number");
        let result = AppConfig::from_env();
        env::remove_var("MAX_WORKERS");
        assert!(result.is_err());
    }
}
