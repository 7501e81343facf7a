//! Manifest: the mapping from source files to ordered chunk lists.
//!
//! The manifest is the single source of truth for reconstruction and for
//! garbage collection. It is loaded once per run, mutated in memory by a
//! single committer, and persisted once as a whole document: written to a
//! temporary file and renamed over the canonical path.
//!
//! On disk it is JSON:
//!
//! ```json
//! {
//!   "version": 1,
//!   "files": {
//!     "vm/disk0.vhdx": {
//!       "size": 8192,
//!       "chunks": [
//!         { "index": 0, "fingerprint": "<64 hex>", "length": 4096 },
//!         { "index": 1, "fingerprint": "<64 hex>", "length": 4096 }
//!       ]
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};

use drift_core::Fingerprint;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::{fsync_dir, StoreError};

/// Manifest document format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Reference to one chunk of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Position within the file, 0-based and contiguous
    pub index: u64,
    /// Content hash of the chunk
    pub fingerprint: Fingerprint,
    /// Chunk length in bytes
    pub length: u64,
}

/// A source file and the chunks that reproduce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    identity: String,
    size: u64,
    chunks: Vec<ChunkRef>,
}

impl FileEntry {
    /// Builds an entry, checking that indices run 0, 1, 2, … and that no
    /// chunk is empty. The file size is the sum of chunk lengths.
    pub fn new(identity: impl Into<String>, chunks: Vec<ChunkRef>) -> Result<Self, StoreError> {
        let identity = identity.into();
        let size = chunks.iter().map(|c| c.length).sum();
        let entry = Self {
            identity,
            size,
            chunks,
        };
        entry.validate().map_err(StoreError::InvalidData)?;
        Ok(entry)
    }

    /// Returns the file identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the chunks in index order.
    pub fn chunks(&self) -> &[ChunkRef] {
        &self.chunks
    }

    /// Returns the chunk at `index`, if any.
    pub fn chunk(&self, index: u64) -> Option<&ChunkRef> {
        usize::try_from(index).ok().and_then(|i| self.chunks.get(i))
    }

    fn validate(&self) -> Result<(), String> {
        if self.identity.is_empty() {
            return Err("empty file identity".to_string());
        }
        let mut total = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != i as u64 {
                return Err(format!(
                    "{}: chunk at position {i} has index {}",
                    self.identity, chunk.index
                ));
            }
            if chunk.length == 0 {
                return Err(format!("{}: chunk {i} is empty", self.identity));
            }
            total = total
                .checked_add(chunk.length)
                .ok_or_else(|| format!("{}: size overflows", self.identity))?;
        }
        if total != self.size {
            return Err(format!(
                "{}: chunk lengths sum to {total}, recorded size is {}",
                self.identity, self.size
            ));
        }
        Ok(())
    }
}

/// In-memory manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, FileEntry>,
}

impl Manifest {
    /// Creates an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for a file identity.
    pub fn get(&self, identity: &str) -> Option<&FileEntry> {
        self.entries.get(identity)
    }

    /// Replaces a file's chunk list wholesale, returning the previous entry.
    pub fn upsert(
        &mut self,
        identity: impl Into<String>,
        chunks: Vec<ChunkRef>,
    ) -> Result<Option<FileEntry>, StoreError> {
        let entry = FileEntry::new(identity, chunks)?;
        Ok(self.insert_entry(entry))
    }

    /// Inserts a pre-built entry, returning the previous one.
    pub fn insert_entry(&mut self, entry: FileEntry) -> Option<FileEntry> {
        self.entries.insert(entry.identity.clone(), entry)
    }

    /// Removes a file's entry.
    pub fn remove(&mut self, identity: &str) -> Option<FileEntry> {
        self.entries.remove(identity)
    }

    /// Returns true if the manifest has an entry for `identity`.
    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    /// Iterates entries in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    /// Iterates file identities in order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Returns the number of files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no files.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns every fingerprint referenced by any file.
    pub fn reachable(&self) -> HashSet<Fingerprint> {
        self.entries
            .values()
            .flat_map(|e| e.chunks.iter().map(|c| c.fingerprint))
            .collect()
    }

    fn to_document(&self) -> ManifestDocument {
        ManifestDocument {
            version: MANIFEST_VERSION,
            files: self
                .entries
                .iter()
                .map(|(identity, entry)| {
                    (
                        identity.clone(),
                        FileRecord {
                            size: entry.size,
                            chunks: entry.chunks.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn from_document(doc: ManifestDocument) -> Result<Self, String> {
        if doc.version != MANIFEST_VERSION {
            return Err(format!(
                "unsupported version {} (expected {MANIFEST_VERSION})",
                doc.version
            ));
        }
        let mut entries = BTreeMap::new();
        for (identity, record) in doc.files {
            let entry = FileEntry {
                identity: identity.clone(),
                size: record.size,
                chunks: record.chunks,
            };
            entry.validate()?;
            entries.insert(identity, entry);
        }
        Ok(Self { entries })
    }
}

/// A manifest that is durably on disk.
///
/// Only [`ManifestStore::persist`] and [`ManifestStore::load_committed`]
/// produce one, so anything that takes a `&CommittedManifest` (the garbage
/// collector) cannot run against unsaved state.
#[derive(Debug, Clone)]
pub struct CommittedManifest {
    manifest: Manifest,
}

impl CommittedManifest {
    /// Returns the manifest for further mutation in a later run.
    pub fn into_inner(self) -> Manifest {
        self.manifest
    }
}

impl Deref for CommittedManifest {
    type Target = Manifest;

    fn deref(&self) -> &Manifest {
        &self.manifest
    }
}

#[derive(Serialize, Deserialize)]
struct ManifestDocument {
    version: u32,
    files: BTreeMap<String, FileRecord>,
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    size: u64,
    chunks: Vec<ChunkRef>,
}

/// Loads and persists the manifest of one target root.
pub struct ManifestStore {
    path: PathBuf,
    tmp_dir: PathBuf,
    sync_writes: bool,
}

impl ManifestStore {
    /// Creates a manifest store at the configured manifest path.
    pub fn open(config: &StoreConfig) -> Self {
        Self {
            path: config.manifest_path(),
            tmp_dir: config.tmp_path(),
            sync_writes: config.sync_writes,
        }
    }

    /// Returns the manifest path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the manifest. A missing file yields an empty manifest; an
    /// unreadable or invalid one is [`StoreError::ManifestCorrupt`].
    pub fn load(&self) -> Result<Manifest, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No manifest found, starting empty");
                return Ok(Manifest::new());
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        let corrupt = |reason: String| StoreError::ManifestCorrupt {
            path: self.path.clone(),
            reason,
        };
        let doc: ManifestDocument =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        let manifest = Manifest::from_document(doc).map_err(corrupt)?;

        info!(path = %self.path.display(), files = manifest.len(), "Loaded manifest");
        Ok(manifest)
    }

    /// Loads the on-disk manifest as committed state.
    pub fn load_committed(&self) -> Result<CommittedManifest, StoreError> {
        Ok(CommittedManifest {
            manifest: self.load()?,
        })
    }

    /// Writes the whole manifest atomically and returns it as committed.
    ///
    /// Readers see either the previous document or this one, never a mix.
    pub fn persist(&self, manifest: Manifest) -> Result<CommittedManifest, StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&self.tmp_dir)?;

        // Same filesystem as the manifest, so the rename is atomic; a crash
        // leaves the temporary where `ChunkStore::open` sweeps it.
        let tmp = NamedTempFile::new_in(&self.tmp_dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, &manifest.to_document())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        if self.sync_writes {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        if self.sync_writes {
            fsync_dir(&dir);
        }

        debug!(path = %self.path.display(), files = manifest.len(), "Persisted manifest");
        Ok(CommittedManifest { manifest })
    }
}
