//! Whole-run orchestration.
//!
//! A run processes each source file in turn, drops entries for files no
//! longer present, persists the manifest exactly once, and only then
//! collects chunks the persisted manifest does not reference.

use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;

use drift_store::{
    ChunkStore, CommittedManifest, GarbageCollector, Manifest, ManifestStore, StoreConfig,
};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::pipeline::Pipeline;
use crate::summary::{FileError, RunSummary};
use crate::EngineError;

/// Reason recorded for files the deadline kept the run from reaching.
pub const DEADLINE_REASON: &str = "run deadline reached";

/// A file to synchronize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Stable manifest key
    pub identity: String,
    /// Where to read it
    pub path: PathBuf,
}

impl SourceFile {
    /// Creates a source file.
    pub fn new(identity: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            identity: identity.into(),
            path: path.into(),
        }
    }
}

/// Synchronizes source files into a target root.
pub struct Engine {
    pipeline: Pipeline,
    store: ChunkStore,
    manifests: ManifestStore,
}

impl Engine {
    /// Opens the target root and starts the hashing workers.
    pub fn open(store_config: &StoreConfig, config: EngineConfig) -> Result<Self, EngineError> {
        let pipeline = Pipeline::new(config)?;
        let store = ChunkStore::open(store_config)?;
        let manifests = ManifestStore::open(store_config);
        Ok(Self {
            pipeline,
            store,
            manifests,
        })
    }

    /// Returns the chunk store.
    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Returns the manifest store.
    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Returns the pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Loads the persisted manifest and runs [`Engine::sync`] against it.
    ///
    /// A corrupt manifest aborts before any file is touched.
    pub fn run(
        &self,
        sources: &[SourceFile],
        deadline: Option<Instant>,
    ) -> Result<(CommittedManifest, RunSummary), EngineError> {
        let manifest = self.manifests.load()?;
        self.sync(manifest, sources, deadline)
    }

    /// Brings `manifest` up to date with `sources`, persists it, then
    /// collects orphan chunks.
    ///
    /// A file that cannot be read keeps its previous entry and is reported
    /// in the summary. Entries for identities not in `sources` are removed.
    /// `deadline` is checked between files only; files not reached keep
    /// their previous entry. Persistence and collection failures abort the
    /// run, as does an empty chunk.
    pub fn sync(
        &self,
        mut manifest: Manifest,
        sources: &[SourceFile],
        deadline: Option<Instant>,
    ) -> Result<(CommittedManifest, RunSummary), EngineError> {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        info!(files = sources.len(), entries = manifest.len(), "Sync started");

        let mut remaining = sources.iter();
        for source in remaining.by_ref() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(identity = %source.identity, "Deadline reached, stopping before file");
                summary.record_skip(FileError::new(&source.identity, DEADLINE_REASON));
                break;
            }
            self.sync_file(&mut manifest, source, &mut summary)?;
        }
        for source in remaining {
            summary.record_skip(FileError::new(&source.identity, DEADLINE_REASON));
        }

        let present: HashSet<&str> = sources.iter().map(|s| s.identity.as_str()).collect();
        let gone: Vec<String> = manifest
            .identities()
            .filter(|identity| !present.contains(identity))
            .map(String::from)
            .collect();
        for identity in gone {
            if let Some(entry) = manifest.remove(&identity) {
                info!(identity = %identity, chunks = entry.chunks().len(), "Source gone, entry removed");
                summary.files_removed += 1;
                summary.removed_chunks += entry.chunks().len();
            }
        }

        let committed = self.manifests.persist(manifest)?;
        let gc = GarbageCollector::new(&self.store).collect(&committed)?;
        summary.record_gc(&gc);

        info!(
            processed = summary.files_processed,
            skipped = summary.skipped.len(),
            removed = summary.files_removed,
            written = summary.chunks_written,
            collected = summary.chunks_collected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sync finished"
        );
        Ok((committed, summary))
    }

    fn sync_file(
        &self,
        manifest: &mut Manifest,
        source: &SourceFile,
        summary: &mut RunSummary,
    ) -> Result<(), EngineError> {
        let identity = source.identity.as_str();
        let file = match File::open(&source.path) {
            Ok(file) => file,
            Err(e) => {
                warn!(identity, path = %source.path.display(), error = %e, "Skipping unreadable file");
                summary.record_skip(FileError::new(identity, e));
                return Ok(());
            }
        };

        match self
            .pipeline
            .process_file(identity, file, manifest.get(identity), &self.store)
        {
            Ok(report) => {
                summary.record_file(&report);
                manifest.insert_entry(report.entry);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(identity, error = %e, "Skipping file, previous entry kept");
                summary.record_skip(FileError::new(identity, e));
                Ok(())
            }
        }
    }
}
