//! Snapshot file format
//!
//! Layout: [MAGIC][bincode-encoded block records][CRC32]
//!
//! The record list is ordered by parameter name; each record carries its own
//! version tag (the snapshot is per-block consistent, not a single instant).
//! The trailing checksum covers the whole record set.

use crate::common::{utils, Error, Result};
use crate::store::ParameterBlock;

const SNAPSHOT_MAGIC: [u8; 4] = *b"PSV1";

/// Encode blocks into the snapshot wire form. Returns the bytes and the
/// body checksum (also embedded in the trailer).
pub fn encode_snapshot(blocks: &[ParameterBlock]) -> Result<(Vec<u8>, u32)> {
    let body = bincode::serialize(blocks)
        .map_err(|e| Error::Internal(format!("snapshot serialize error: {e}")))?;
    let checksum = utils::crc32(&body);

    let mut out = Vec::with_capacity(SNAPSHOT_MAGIC.len() + body.len() + 4);
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.extend_from_slice(&body);
    out.extend_from_slice(&checksum.to_le_bytes());
    Ok((out, checksum))
}

/// Decode and integrity-check a snapshot. Returns the blocks and the
/// verified checksum.
pub fn decode_snapshot(bytes: &[u8]) -> Result<(Vec<ParameterBlock>, u32)> {
    if bytes.len() < SNAPSHOT_MAGIC.len() + 4 {
        return Err(Error::CorruptCheckpoint("snapshot truncated".into()));
    }

    let (magic, rest) = bytes.split_at(SNAPSHOT_MAGIC.len());
    if magic != SNAPSHOT_MAGIC {
        return Err(Error::CorruptCheckpoint("invalid snapshot magic".into()));
    }

    let (body, trailer) = rest.split_at(rest.len() - 4);
    let stored = u32::from_le_bytes(trailer.try_into().unwrap());
    let computed = utils::crc32(body);
    if stored != computed {
        return Err(Error::CorruptCheckpoint(format!(
            "checksum mismatch: stored {stored:08x}, computed {computed:08x}"
        )));
    }

    let blocks: Vec<ParameterBlock> = bincode::deserialize(body)
        .map_err(|e| Error::CorruptCheckpoint(format!("undecodable record set: {e}")))?;
    Ok((blocks, stored))
}
