//! Source and target trees for end-to-end sync runs.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use drift_cdc::{CdcParams, ChunkingStrategy};
use drift_core::Fingerprint;
use drift_engine::{Engine, EngineConfig, SourceFile};
use drift_store::{restore_file, Manifest, ManifestStore, StoreConfig, StoreError};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

/// Minimum chunk size used by the small test strategy.
pub const MIN: usize = 1024;
/// Average chunk size used by the small test strategy.
pub const AVG: usize = 4096;
/// Maximum chunk size used by the small test strategy.
pub const MAX: usize = 16 * 1024;

/// Initialize tracing for tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("drift_tests=debug,drift_engine=info,drift_store=info")
        .with_test_writer()
        .try_init();
}

/// Content-defined strategy with 1 KiB / 4 KiB / 16 KiB bounds.
pub fn small_cdc() -> ChunkingStrategy {
    ChunkingStrategy::ContentDefined(CdcParams::new(MIN, AVG, MAX))
}

/// Deterministic pseudo-random bytes.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// A temporary source directory and target root.
pub struct TestTree {
    _dir: TempDir,
    source: PathBuf,
    target: PathBuf,
}

impl TestTree {
    /// Creates empty source and target directories.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let source = dir.path().join("source");
        let target = dir.path().join("target");
        fs::create_dir_all(&source).expect("create source dir");
        Self {
            _dir: dir,
            source,
            target,
        }
    }

    /// Returns the source directory.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Returns the target root.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Returns the store configuration for the target root.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.target)
    }

    /// Returns the path of a source file.
    pub fn path(&self, identity: &str) -> PathBuf {
        self.source.join(identity)
    }

    /// Writes a source file, replacing any previous contents.
    pub fn write(&self, identity: &str, data: &[u8]) {
        let path = self.path(identity);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, data).expect("write source file");
        debug!(identity, len = data.len(), "Wrote source file");
    }

    /// Appends to a source file.
    pub fn append(&self, identity: &str, data: &[u8]) {
        let mut contents = fs::read(self.path(identity)).expect("read source file");
        contents.extend_from_slice(data);
        self.write(identity, &contents);
    }

    /// Deletes a source file.
    pub fn remove(&self, identity: &str) {
        fs::remove_file(self.path(identity)).expect("remove source file");
    }

    /// Lists source files in identity order.
    pub fn sources(&self) -> Vec<SourceFile> {
        let mut sources = Vec::new();
        collect(&self.source, &mut sources);
        sources.sort_by(|a, b| a.identity.cmp(&b.identity));
        sources
    }

    /// Opens an engine on the target root.
    pub fn engine(&self, config: EngineConfig) -> Engine {
        Engine::open(&self.store_config(), config).expect("open engine")
    }

    /// Opens an engine with the small content-defined strategy.
    pub fn small_engine(&self) -> Engine {
        self.engine(EngineConfig::new(small_cdc()).with_workers(4))
    }

    /// Loads the persisted manifest.
    pub fn manifest(&self) -> Result<Manifest, StoreError> {
        ManifestStore::open(&self.store_config()).load()
    }

    /// Reconstructs a file from the persisted manifest and the store.
    pub fn restore(&self, engine: &Engine, identity: &str) -> Result<Vec<u8>, StoreError> {
        let manifest = self.manifest()?;
        let mut out = Vec::new();
        restore_file(&manifest, engine.store(), identity, &mut out)?;
        Ok(out)
    }

    /// Returns the fingerprints of blobs in the store.
    pub fn stored(&self, engine: &Engine) -> HashSet<Fingerprint> {
        engine
            .store()
            .list()
            .expect("list chunks")
            .into_iter()
            .collect()
    }
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

fn collect(root: &Path, out: &mut Vec<SourceFile>) {
    for entry in WalkDir::new(root) {
        let entry = entry.expect("walk source dir");
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).expect("path under root");
        let identity = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(SourceFile::new(identity, entry.path()));
    }
}
