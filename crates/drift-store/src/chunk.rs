//! Chunk storage implementation.
//!
//! Stores chunk blobs keyed by their fingerprint, one file per chunk at
//! `chunks/<hex[0..2]>/<hex>.chunk`. Blobs are write-once: a put for a
//! fingerprint that already exists does nothing, and a new blob only becomes
//! visible under its final name after it is fully written.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use drift_core::{Fingerprint, FINGERPRINT_HEX_LEN};
use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::{fsync_dir, StoreError};

/// File extension of chunk blobs.
pub const CHUNK_EXTENSION: &str = "chunk";

/// Result of a [`ChunkStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// This call published the blob.
    Written,
    /// The blob already existed, or a concurrent writer published it first.
    AlreadyPresent,
}

/// Statistics for the chunk store.
#[derive(Debug, Default, Clone)]
pub struct ChunkStoreStats {
    /// Blobs physically written
    pub chunks_written: u64,
    /// Bytes physically written
    pub bytes_written: u64,
    /// Puts that found the blob already present
    pub dedup_hits: u64,
    /// Blobs deleted
    pub chunks_deleted: u64,
}

/// Local chunk storage backed by a directory of blob files.
///
/// Safe to share between threads. Concurrent puts of the same fingerprint
/// resolve to exactly one physical write; every caller sees success.
pub struct ChunkStore {
    chunks_dir: PathBuf,
    tmp_dir: PathBuf,
    sync_writes: bool,
    /// Statistics tracking
    stats: RwLock<ChunkStoreStats>,
}

impl ChunkStore {
    /// Opens or creates a chunk store under the configured target root.
    ///
    /// Leftover temporaries from an interrupted run are removed; they were
    /// never published, so nothing references them.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        config.create_dirs()?;
        let store = Self {
            chunks_dir: config.chunks_path(),
            tmp_dir: config.tmp_path(),
            sync_writes: config.sync_writes,
            stats: RwLock::new(ChunkStoreStats::default()),
        };
        store.clear_stale_temporaries()?;
        Ok(store)
    }

    /// Returns the blob path for a fingerprint.
    pub fn chunk_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.chunks_dir
            .join(&hex[..2])
            .join(format!("{hex}.{CHUNK_EXTENSION}"))
    }

    /// Checks if a chunk exists.
    pub fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        match fs::metadata(self.chunk_path(fingerprint)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Stores a chunk under its fingerprint.
    ///
    /// The caller guarantees `fingerprint` is the hash of `data`. The blob is
    /// written to a temporary file, flushed, and published with a
    /// no-clobber rename; losing that rename to another writer counts as
    /// success since both wrote identical bytes.
    pub fn put(&self, fingerprint: &Fingerprint, data: &[u8]) -> Result<PutOutcome, StoreError> {
        if self.exists(fingerprint)? {
            self.stats.write().dedup_hits += 1;
            return Ok(PutOutcome::AlreadyPresent);
        }

        let path = self.chunk_path(fingerprint);
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidData(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(&self.tmp_dir)?;
        tmp.write_all(data)?;
        if self.sync_writes {
            tmp.as_file().sync_all()?;
        }

        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                if self.sync_writes {
                    fsync_dir(parent);
                }
                {
                    let mut stats = self.stats.write();
                    stats.chunks_written += 1;
                    stats.bytes_written += data.len() as u64;
                }
                debug!(fingerprint = %fingerprint, size = data.len(), "Stored chunk");
                Ok(PutOutcome::Written)
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                // The losing temporary is removed when `e.file` drops.
                self.stats.write().dedup_hits += 1;
                debug!(fingerprint = %fingerprint, "Chunk published concurrently");
                Ok(PutOutcome::AlreadyPresent)
            }
            Err(e) => Err(StoreError::Io(e.error)),
        }
    }

    /// Retrieves a chunk, verifying it still hashes to its fingerprint.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Bytes>, StoreError> {
        match fs::read(self.chunk_path(fingerprint)) {
            Ok(data) => {
                let actual = Fingerprint::from_data(&data);
                if actual != *fingerprint {
                    warn!(expected = %fingerprint, actual = %actual, "Chunk hash mismatch");
                    return Err(StoreError::ChunkCorrupt {
                        expected: *fingerprint,
                        actual,
                    });
                }
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Returns the size of a stored blob.
    pub fn blob_size(&self, fingerprint: &Fingerprint) -> Result<Option<u64>, StoreError> {
        match fs::metadata(self.chunk_path(fingerprint)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Deletes a chunk. Returns false if it was already absent.
    ///
    /// Only the garbage collector calls this.
    pub fn delete(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        match fs::remove_file(self.chunk_path(fingerprint)) {
            Ok(()) => {
                self.stats.write().chunks_deleted += 1;
                debug!(fingerprint = %fingerprint, "Deleted chunk");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Lists all chunk fingerprints in the store.
    ///
    /// Files that do not look like chunk blobs are skipped with a warning.
    pub fn list(&self) -> Result<Vec<Fingerprint>, StoreError> {
        let mut fingerprints = Vec::new();

        for fan in fs::read_dir(&self.chunks_dir)? {
            let fan = fan?;
            if !fan.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(fan.path())? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                match parse_chunk_name(&entry.path()) {
                    Some(fp) if fan.file_name().to_str() == Some(&fp.to_hex()[..2]) => {
                        fingerprints.push(fp)
                    }
                    Some(_) => {
                        warn!(path = %entry.path().display(), "Ignoring chunk outside its fan-out directory")
                    }
                    None => warn!(path = %entry.path().display(), "Ignoring unexpected file in chunk store"),
                }
            }
        }

        Ok(fingerprints)
    }

    /// Returns the total size of all stored chunks.
    pub fn total_size(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for fp in self.list()? {
            total += self.blob_size(&fp)?.unwrap_or(0);
        }
        Ok(total)
    }

    /// Returns store statistics.
    pub fn stats(&self) -> ChunkStoreStats {
        self.stats.read().clone()
    }

    fn clear_stale_temporaries(&self) -> Result<(), StoreError> {
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.tmp_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            warn!(count = removed, "Removed stale temporary files from interrupted run");
        }
        Ok(())
    }
}

/// Parses `<64 hex chars>.chunk` back into a fingerprint.
fn parse_chunk_name(path: &Path) -> Option<Fingerprint> {
    if path.extension()?.to_str()? != CHUNK_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != FINGERPRINT_HEX_LEN {
        return None;
    }
    Fingerprint::from_hex(stem).ok()
}
