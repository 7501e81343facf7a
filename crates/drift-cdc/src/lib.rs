//! Drift CDC - content-defined chunking.
//!
//! Splits byte streams into chunks whose boundaries are chosen by a rolling
//! hash over the last few dozen bytes, so that an insertion or deletion only
//! disturbs the chunks around the edit. Backup images rewritten by an
//! incremental merge keep most of their chunk identities this way.
//!
//! A fixed-size strategy is also available; it shares the chunk sequence
//! contract but ignores content.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod chunker;
mod params;
mod rolling;
mod table;

pub use chunker::{chunk_boundaries, Chunk, ChunkBoundary, Chunker, DEFAULT_READ_BUFFER_SIZE};
pub use params::{CdcParams, ChunkingStrategy, ParamsError};
pub use rolling::{RollingHasher, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
pub use table::{byte_table, ByteTable, BYTE_TABLE};

/// Default chunk size bounds.
pub mod defaults {
    /// Minimum chunk size: 1 MiB
    pub const CHUNK_MIN_SIZE: usize = 1024 * 1024;

    /// Target average chunk size: 4 MiB
    pub const CHUNK_AVG_SIZE: usize = 4 * 1024 * 1024;

    /// Maximum chunk size: 16 MiB
    pub const CHUNK_MAX_SIZE: usize = 16 * 1024 * 1024;

    /// Chunk size for the fixed strategy: 4 MiB
    pub const FIXED_CHUNK_SIZE: usize = 4 * 1024 * 1024;
}
