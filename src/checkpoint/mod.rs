//! Checkpointing: snapshot format and save/restore orchestration

pub mod format;
pub mod manager;

pub use manager::{CheckpointManager, CheckpointRecord};
