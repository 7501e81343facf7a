//! Drift Engine - the chunk-and-commit pipeline.
//!
//! Provides:
//! - [`Pipeline`]: chunks one file sequentially, hashes its chunks on a
//!   bounded worker pool and commits them to the store in index order
//! - [`Engine`]: runs the pipeline over a set of source files, persists the
//!   manifest once and then collects orphan chunks
//! - [`RunSummary`]: what a run did, including the files it skipped
//!
//! # Commit ordering
//!
//! A chunk is written to the store before the manifest refers to it, the
//! manifest is persisted before garbage collection runs, and garbage
//! collection only sees the persisted manifest. A crash at any point leaves
//! the store holding every chunk some valid manifest needs.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod engine;
pub mod pipeline;
pub mod summary;

pub use config::EngineConfig;
pub use engine::{Engine, SourceFile};
pub use pipeline::{ChunkStatus, FileReport, Pipeline};
pub use summary::{FileError, RunSummary};

use drift_store::StoreError;
use thiserror::Error;

/// Errors from the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store or manifest failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Reading a source file failed
    #[error("Failed to read {identity}: {source}")]
    Source {
        /// File identity
        identity: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The chunker produced a zero-length chunk
    #[error("Empty chunk {index} in {identity}")]
    EmptyChunk {
        /// File identity
        identity: String,
        /// Chunk index
        index: u64,
    },

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A hashing worker exited without reporting its chunk
    #[error("Hashing worker lost while processing {identity}")]
    WorkerLost {
        /// File identity
        identity: String,
    },

    /// Hashing worker pool could not be built
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl EngineError {
    /// Returns true if the error must abort the whole run rather than just
    /// the file being processed.
    ///
    /// An empty chunk means the chunker is broken, so nothing it produced
    /// afterwards can be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::EmptyChunk { .. }
                | EngineError::WorkerLost { .. }
                | EngineError::InvalidConfig(_)
                | EngineError::ThreadPool(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let empty = EngineError::EmptyChunk {
            identity: "a.img".into(),
            index: 3,
        };
        assert!(empty.is_fatal());
        assert_eq!(empty.to_string(), "Empty chunk 3 in a.img");

        let source = EngineError::Source {
            identity: "a.img".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "device gone"),
        };
        assert!(!source.is_fatal());

        let store = EngineError::from(StoreError::InvalidData("x".into()));
        assert!(!store.is_fatal());
    }
}
