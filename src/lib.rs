//! # pserver
//!
//! A distributed parameter server shard with:
//! - etcd-backed registration, lease heartbeats, and crash detection
//! - Per-block locking so independent parameters update in parallel
//! - Pluggable gradient update rules (SGD, momentum)
//! - Durable, checksummed checkpoints with write-then-publish recovery
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ┌──────────┐  ┌──────────┐
//! │ Trainer 1 │  │ Trainer 2 │  │ Trainer N │
//! └─────┬────┘  └─────┬────┘  └─────┬────┘
//!       │ push/pull    │             │
//!   ┌───┴──────────────┴─────────────┴───┐
//!   │           pserver shard            │
//!   │  service ─ store ─ optimizer       │
//!   │      │                │            │
//!   │  checkpoint files  registration    │
//!   └──────┬────────────────┬────────────┘
//!          │ publish record │ lease + heartbeat
//!       ┌──┴────────────────┴──┐
//!       │         etcd         │
//!       │  /pservers/<shard>/* │
//!       └──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! pserver \
//!   --port 8001 \
//!   --shard 0 \
//!   --etcd-endpoint http://127.0.0.1:2379 \
//!   --checkpoint-dir ./data/pserver
//! ```

pub mod checkpoint;
pub mod common;
pub mod coord;
pub mod optimizer;
pub mod rpc;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use checkpoint::{CheckpointManager, CheckpointRecord};
pub use common::{Error, ErrorCode, PserverConfig, Result};
pub use coord::{Coordinator, EtcdCoordinator, MemCoordinator, ServiceRegistration};
pub use rpc::PserverClient;
pub use service::{PserverServer, PserverService, ServiceState};
pub use store::{ElementType, ParameterStore, Tensor};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
