//! Durable snapshots of the parameter store
//!
//! Saving walks the store under per-block read locks, writes the encoded
//! snapshot to a temp file, fsyncs, renames it into place, and only then
//! publishes the `CheckpointRecord` to the coordination store. A published
//! record therefore always points at a fully written snapshot.

use crate::checkpoint::format::{decode_snapshot, encode_snapshot};
use crate::common::{Error, Result};
use crate::coord::{checkpoint_key, Coordinator};
use crate::store::ParameterStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// etcd-resident pointer to the latest durable snapshot of a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub shard: u32,
    pub path: PathBuf,
    pub version: u64,
    pub checksum: u32,
    pub created_at: DateTime<Utc>,
}

pub struct CheckpointManager {
    shard: u32,
    dir: PathBuf,
    coordinator: Arc<dyn Coordinator>,
    next_version: AtomicU64,
    /// Saves run one at a time: overlapping writers would race on the shared
    /// temp file and the prune step could delete a just-published snapshot.
    save_lock: tokio::sync::Mutex<()>,
}

impl CheckpointManager {
    pub fn new(shard: u32, dir: PathBuf, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            shard,
            dir,
            coordinator,
            next_version: AtomicU64::new(1),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot the store and publish the record. Never called while holding
    /// any store lock; the export takes brief per-block read locks itself.
    /// Concurrent callers (scheduled snapshots, the checkpoint RPC, the
    /// drain-time save) serialize here.
    pub async fn save(&self, store: &ParameterStore) -> Result<CheckpointRecord> {
        let _exclusive = self.save_lock.lock().await;

        let blocks = store.export();
        let block_count = blocks.len();
        let (bytes, checksum) = encode_snapshot(&blocks)?;
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);

        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!("shard-{}.tmp", self.shard));
        let path = self.dir.join(format!("shard-{}-{}.ckpt", self.shard, version));

        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &path).await?;

        let record = CheckpointRecord {
            shard: self.shard,
            path: path.clone(),
            version,
            checksum,
            created_at: Utc::now(),
        };
        let raw = serde_json::to_vec(&record)
            .map_err(|e| Error::Internal(format!("record serialize error: {e}")))?;
        self.coordinator
            .put(&checkpoint_key(self.shard), &raw, None)
            .await?;

        self.prune_older(&path).await;

        tracing::info!(
            "Saved checkpoint v{} for shard {} ({} blocks) to {}",
            version,
            self.shard,
            block_count,
            path.display()
        );
        Ok(record)
    }

    /// Load the latest published snapshot into the store. `Ok(None)` means no
    /// checkpoint has ever been published for this shard (fresh start).
    pub async fn restore(&self, store: &ParameterStore) -> Result<Option<u64>> {
        let raw = match self.coordinator.get(&checkpoint_key(self.shard)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let record: CheckpointRecord = serde_json::from_slice(&raw)
            .map_err(|e| Error::CorruptCheckpoint(format!("unreadable checkpoint record: {e}")))?;

        let bytes = match tokio::fs::read(&record.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::CheckpointNotFound(record.path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let (blocks, checksum) = decode_snapshot(&bytes)?;
        if checksum != record.checksum {
            return Err(Error::CorruptCheckpoint(format!(
                "record checksum {:08x} does not match snapshot {:08x}",
                record.checksum, checksum
            )));
        }

        let block_count = blocks.len();
        store.import(blocks);
        self.next_version.store(record.version + 1, Ordering::SeqCst);

        tracing::info!(
            "Restored checkpoint v{} for shard {} ({} blocks)",
            record.version,
            self.shard,
            block_count
        );
        Ok(Some(record.version))
    }

    /// Remove superseded snapshot files. Best effort; the published record
    /// never points at anything removed here.
    async fn prune_older(&self, keep: &PathBuf) {
        let prefix = format!("shard-{}-", self.shard);
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("checkpoint prune skipped: {}", e);
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".ckpt") && &path != keep {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!("failed to prune old snapshot {}: {}", path.display(), e);
                }
            }
        }
    }
}
