//! Configuration for a pserver instance
//!
//! The binary layer (CLI flags) and tests both feed the service through this
//! struct; the core never parses flags itself.

use crate::optimizer::OptimizerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Pserver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PserverConfig {
    /// Bind address for the RPC listener (port 0 picks a free port)
    pub bind_addr: SocketAddr,

    /// Shard identifier this instance claims
    pub shard: u32,

    /// etcd endpoints
    #[serde(default = "default_etcd_endpoints")]
    pub etcd_endpoints: Vec<String>,

    /// Timeout for every coordination-store call
    #[serde(default = "default_coordination_timeout_ms")]
    pub coordination_timeout_ms: u64,

    /// Registration lease TTL
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Lease renewal interval (should be well under the TTL)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive heartbeat failures tolerated before the process gives up
    #[serde(default = "default_heartbeat_failure_limit")]
    pub heartbeat_failure_limit: u32,

    /// Registration attempts before startup fails
    #[serde(default = "default_register_attempts")]
    pub register_attempts: u32,

    /// Initial registration backoff (doubles per attempt, with jitter)
    #[serde(default = "default_register_backoff_ms")]
    pub register_backoff_ms: u64,

    /// Directory for snapshot files
    pub checkpoint_dir: PathBuf,

    /// Scheduled snapshot interval
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// How long draining waits for in-flight requests
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Per-request deadline for RPC handlers
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Start with an empty store when the recorded checkpoint is unreadable
    #[serde(default)]
    pub allow_cold_start: bool,

    /// Update rule applied to incoming gradients
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}
fn default_coordination_timeout_ms() -> u64 {
    5_000
}
fn default_lease_ttl_secs() -> u64 {
    10
}
fn default_heartbeat_interval_ms() -> u64 {
    3_000
}
fn default_heartbeat_failure_limit() -> u32 {
    5
}
fn default_register_attempts() -> u32 {
    5
}
fn default_register_backoff_ms() -> u64 {
    500
}
fn default_checkpoint_interval_secs() -> u64 {
    600
}
fn default_drain_timeout_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PserverConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            shard: 0,
            etcd_endpoints: default_etcd_endpoints(),
            coordination_timeout_ms: default_coordination_timeout_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_failure_limit: default_heartbeat_failure_limit(),
            register_attempts: default_register_attempts(),
            register_backoff_ms: default_register_backoff_ms(),
            checkpoint_dir: PathBuf::from("./data/pserver"),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            drain_timeout_ms: default_drain_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            allow_cold_start: false,
            optimizer: OptimizerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl PserverConfig {
    pub fn coordination_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn register_backoff(&self) -> Duration {
        Duration::from_millis(self.register_backoff_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.etcd_endpoints.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "at least one etcd endpoint is required".into(),
            ));
        }
        if self.lease_ttl_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "lease TTL must be positive".into(),
            ));
        }
        if self.heartbeat_interval_ms >= self.lease_ttl_secs * 1000 {
            return Err(crate::Error::InvalidConfig(
                "heartbeat interval must be shorter than the lease TTL".into(),
            ));
        }
        if self.register_attempts == 0 {
            return Err(crate::Error::InvalidConfig(
                "at least one registration attempt is required".into(),
            ));
        }
        Ok(())
    }
}
