//! Coordination-store abstraction
//!
//! A thin key-value view of etcd: lease-bound registration, compare-and-swap,
//! linearizable gets, and prefix watches. The service talks to this trait
//! only; `EtcdCoordinator` backs it in production and `MemCoordinator` in
//! tests and single-node development.

pub mod etcd;
pub mod memory;

pub use etcd::EtcdCoordinator;
pub use memory::MemCoordinator;

use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Key prefix under which all pserver state lives.
pub const PSERVER_PREFIX: &str = "/pservers/";

/// Registration key for a shard.
pub fn registration_key(shard: u32) -> String {
    format!("{PSERVER_PREFIX}{shard}/registration")
}

/// Checkpoint-record key for a shard.
pub fn checkpoint_key(shard: u32) -> String {
    format!("{PSERVER_PREFIX}{shard}/checkpoint")
}

/// Handle to a TTL lease held in the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseHandle {
    pub id: i64,
}

/// The etcd-resident registration record for one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub shard: u32,
    pub address: String,
    pub registered_at: u64,
    pub last_heartbeat: u64,
}

/// A single change observed under a watched prefix. `value: None` means the
/// key was deleted (or its lease expired).
#[derive(Debug, Clone)]
pub struct CoordEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Coordination-store operations, each bounded by the coordinator's
/// configured call timeout (`CoordinationTimeout` on expiry).
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Atomically create `key` bound to a fresh TTL lease.
    ///
    /// Fails with `ShardAlreadyClaimed` when a live registration already
    /// holds the key (the create-if-absent transaction is the distributed
    /// mutual-exclusion gate).
    async fn register(&self, shard: u32, key: &str, value: &[u8], ttl: Duration)
        -> Result<LeaseHandle>;

    /// Extend the lease's TTL.
    async fn renew_lease(&self, lease: &LeaseHandle) -> Result<()>;

    /// Drop the lease, releasing every key bound to it.
    async fn revoke_lease(&self, lease: &LeaseHandle) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a key, optionally binding it to an existing lease.
    async fn put(&self, key: &str, value: &[u8], lease: Option<&LeaseHandle>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Write `new` only if the key currently holds `expected` (`None` means
    /// "only if absent"). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool>;

    /// Stream changes under a key prefix. Dropping the receiver cancels the
    /// watch.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<CoordEvent>>;
}
