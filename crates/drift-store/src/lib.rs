//! Drift Store - on-disk state under a target root.
//!
//! Provides:
//! - A content-addressed, write-once chunk directory keyed by fingerprint
//! - The manifest mapping each source file to its ordered chunk list
//! - Garbage collection of chunks the committed manifest no longer references
//! - Reconstruction of files from the manifest and the chunk store
//!
//! Every write is published by renaming a fully flushed temporary file, so a
//! crash never leaves a torn chunk or manifest where readers look for one.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod chunk;
pub mod config;
pub mod gc;
pub mod manifest;
pub mod restore;

pub use chunk::{ChunkStore, ChunkStoreStats, PutOutcome};
pub use config::StoreConfig;
pub use gc::{GarbageCollector, GcReport};
pub use manifest::{ChunkRef, CommittedManifest, FileEntry, Manifest, ManifestStore, MANIFEST_VERSION};
pub use restore::restore_file;

use std::path::{Path, PathBuf};

use drift_core::Fingerprint;
use thiserror::Error;
use tracing::warn;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk not found
    #[error("Chunk not found: {}", .0.to_hex())]
    ChunkNotFound(Fingerprint),

    /// Stored blob does not hash to its name
    #[error("Chunk corrupt: expected {}, found {}", .expected.to_hex(), .actual.to_hex())]
    ChunkCorrupt {
        /// Fingerprint the blob is stored under
        expected: Fingerprint,
        /// Fingerprint of the bytes actually read
        actual: Fingerprint,
    },

    /// No manifest entry for a file identity
    #[error("No manifest entry for {0:?}")]
    EntryNotFound(String),

    /// Persisted manifest cannot be trusted
    #[error("Manifest at {} is corrupt: {reason}", .path.display())]
    ManifestCorrupt {
        /// Manifest location
        path: PathBuf,
        /// What failed to parse or validate
        reason: String,
    },

    /// Manifest serialization failed
    #[error("Manifest encoding error: {0}")]
    ManifestEncode(#[from] serde_json::Error),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Flushes a directory so a rename inside it survives a crash.
///
/// Best effort: some platforms cannot open directories for syncing, so a
/// failure is logged rather than returned.
pub(crate) fn fsync_dir(dir: &Path) {
    let result = std::fs::File::open(dir).and_then(|file| file.sync_all());
    if let Err(e) = result {
        warn!(dir = %dir.display(), error = %e, "Directory sync failed, rename may not be durable");
    }
}
