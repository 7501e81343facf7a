//! File reconstruction from the manifest.
//!
//! Concatenates a file's chunks in index order. Every chunk is re-hashed on
//! read and its length checked against the manifest, so a damaged store is
//! reported instead of producing a silently wrong file.

use std::io::Write;

use tracing::debug;

use crate::chunk::ChunkStore;
use crate::manifest::Manifest;
use crate::StoreError;

/// Writes the file recorded under `identity` to `out`.
///
/// Returns the number of bytes written.
pub fn restore_file<W: Write>(
    manifest: &Manifest,
    store: &ChunkStore,
    identity: &str,
    out: &mut W,
) -> Result<u64, StoreError> {
    let entry = manifest
        .get(identity)
        .ok_or_else(|| StoreError::EntryNotFound(identity.to_string()))?;

    let mut written = 0u64;
    for chunk in entry.chunks() {
        let data = store
            .get(&chunk.fingerprint)?
            .ok_or(StoreError::ChunkNotFound(chunk.fingerprint))?;
        if data.len() as u64 != chunk.length {
            return Err(StoreError::InvalidData(format!(
                "{identity}: chunk {} is {} bytes, manifest says {}",
                chunk.index,
                data.len(),
                chunk.length
            )));
        }
        out.write_all(&data)?;
        written += chunk.length;
    }
    if written != entry.size() {
        return Err(StoreError::InvalidData(format!(
            "{identity}: restored {written} bytes, manifest says {}",
            entry.size()
        )));
    }
    out.flush()?;

    debug!(identity, bytes = written, chunks = entry.chunks().len(), "Restored file");
    Ok(written)
}
