//! Storage configuration.

use std::path::PathBuf;

/// Directory holding chunk blobs, relative to the target root.
pub const CHUNKS_DIR: &str = "chunks";

/// Directory holding in-progress writes, relative to the target root.
pub const TMP_DIR: &str = ".drift-tmp";

/// Manifest file name, relative to the target root.
pub const MANIFEST_FILE: &str = "drift-manifest.json";

/// Layout of a target root.
///
/// ```text
/// <target_root>/
///   drift-manifest.json
///   chunks/<hex[0..2]>/<hex>.chunk
///   .drift-tmp/
/// ```
///
/// The temporary directory lives on the same filesystem as the chunks so
/// that publishing a write is a rename.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base path for all storage
    pub target_root: PathBuf,
    /// Flush file data and directories before publishing writes
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            target_root: PathBuf::from(".drift"),
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with the given target root.
    pub fn new(target_root: impl Into<PathBuf>) -> Self {
        Self {
            target_root: target_root.into(),
            ..Default::default()
        }
    }

    /// Returns the path for chunk storage.
    pub fn chunks_path(&self) -> PathBuf {
        self.target_root.join(CHUNKS_DIR)
    }

    /// Returns the path for temporary files.
    pub fn tmp_path(&self) -> PathBuf {
        self.target_root.join(TMP_DIR)
    }

    /// Returns the manifest path.
    pub fn manifest_path(&self) -> PathBuf {
        self.target_root.join(MANIFEST_FILE)
    }

    /// Creates all necessary directories.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.target_root)?;
        std::fs::create_dir_all(self.chunks_path())?;
        std::fs::create_dir_all(self.tmp_path())?;
        Ok(())
    }
}
