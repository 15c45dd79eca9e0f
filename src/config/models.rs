//! Configuration data structures.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files.
//! They are serde-friendly and carry defaults so a minimal config stays
//! concise; `validate` enforces the invariants the engine asserts on.
use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_http_bind_address() -> String {
    "127.0.0.1:28690".to_string()
}

fn default_coap_bind_address() -> String {
    "127.0.0.1:18991".to_string()
}

fn default_upstream_address() -> String {
    "http://127.0.0.1:28881/json_rpc".to_string()
}

fn default_http_connection_timeout_ms() -> u64 {
    30_000
}

fn default_upstream_request_timeout_ms() -> u64 {
    10_000
}

fn default_worker_queue_len() -> usize {
    32
}

fn default_workers_expelling_interval_ms() -> u64 {
    1_000
}

fn default_timer_poll_interval_ms() -> u64 {
    1_000
}

fn default_again_bound() -> u32 {
    10
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Output format for structured logging.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Console,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP front-door bind address.
    pub http_bind_address: String,
    /// CoAP (UDP) front-door bind address.
    pub coap_bind_address: String,
    /// Default upstream daemon endpoint for Forward round-trips.
    pub upstream_address: String,
    /// How long a client task may stay in flight (also the postpone expiry).
    pub http_connection_timeout_ms: u64,
    /// Per-request timeout for upstream calls.
    pub upstream_request_timeout_ms: u64,
    /// Worker thread count; 0 means one per available CPU.
    pub workers_count: usize,
    /// Queue slots per worker; total queue capacity is workers * this.
    pub worker_queue_len: usize,
    /// Idle time after which a worker thread retires; 0 disables expulsion.
    pub workers_expelling_interval_ms: u64,
    /// Cadence of the periodic/postpone timer sweep.
    pub timer_poll_interval_ms: u64,
    /// Maximum Again retries per task before InternalError.
    pub again_bound: u32,
    /// How long shutdown waits for in-flight tasks to settle.
    pub shutdown_grace_ms: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_bind_address: default_http_bind_address(),
            coap_bind_address: default_coap_bind_address(),
            upstream_address: default_upstream_address(),
            http_connection_timeout_ms: default_http_connection_timeout_ms(),
            upstream_request_timeout_ms: default_upstream_request_timeout_ms(),
            workers_count: 0,
            worker_queue_len: default_worker_queue_len(),
            workers_expelling_interval_ms: default_workers_expelling_interval_ms(),
            timer_poll_interval_ms: default_timer_poll_interval_ms(),
            again_bound: default_again_bound(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Invariant violations found by [`ServerConfig::validate`].
#[derive(Error, Debug)]
#[error("invalid configuration:\n{}", problems.join("\n"))]
pub struct ConfigValidationError {
    pub problems: Vec<String>,
}

impl ServerConfig {
    /// Worker count with the "0 means per-CPU" rule applied.
    pub fn workers_count(&self) -> usize {
        if self.workers_count > 0 {
            self.workers_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        }
    }

    /// Check the invariants the engine relies on. Collects every problem
    /// instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut problems = Vec::new();
        if self.http_bind_address.is_empty() {
            problems.push("  http_bind_address must not be empty".to_string());
        }
        if self.coap_bind_address.is_empty() {
            problems.push("  coap_bind_address must not be empty".to_string());
        }
        if self.upstream_address.is_empty() {
            problems.push("  upstream_address must not be empty".to_string());
        }
        if self.http_connection_timeout_ms == 0 {
            problems.push("  http_connection_timeout_ms must be positive".to_string());
        }
        if self.upstream_request_timeout_ms == 0 {
            problems.push("  upstream_request_timeout_ms must be positive".to_string());
        }
        if self.worker_queue_len == 0 {
            problems.push("  worker_queue_len must be positive".to_string());
        }
        if self.timer_poll_interval_ms == 0 {
            problems.push("  timer_poll_interval_ms must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError { problems })
        }
    }
}
