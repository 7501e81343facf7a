//! Chunking parameters.

use std::fmt;

use thiserror::Error;

use crate::defaults::{CHUNK_AVG_SIZE, CHUNK_MAX_SIZE, CHUNK_MIN_SIZE, FIXED_CHUNK_SIZE};
use crate::rolling::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};

/// Invalid chunking parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    /// Bounds are not strictly increasing or the minimum is zero.
    #[error("chunk sizes must satisfy 0 < min ({min}) < avg ({avg}) < max ({max})")]
    Bounds {
        /// Minimum chunk size
        min: usize,
        /// Average chunk size
        avg: usize,
        /// Maximum chunk size
        max: usize,
    },

    /// Rolling window outside `1..=MAX_WINDOW_SIZE`.
    #[error("rolling window must be 1..={MAX_WINDOW_SIZE} bytes (got {0})")]
    Window(usize),

    /// Fixed chunk size of zero.
    #[error("fixed chunk size must be non-zero")]
    ZeroChunkSize,
}

/// Bounds for content-defined chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdcParams {
    /// No boundary is declared before a chunk reaches this length.
    pub min_size: usize,
    /// Target average; `log2(avg_size)` low bits of the fingerprint are tested.
    pub avg_size: usize,
    /// A boundary is forced at this length.
    pub max_size: usize,
    /// Rolling window in bytes.
    pub window_size: usize,
}

impl Default for CdcParams {
    fn default() -> Self {
        Self {
            min_size: CHUNK_MIN_SIZE,
            avg_size: CHUNK_AVG_SIZE,
            max_size: CHUNK_MAX_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl CdcParams {
    /// Creates parameters with the default rolling window.
    pub fn new(min_size: usize, avg_size: usize, max_size: usize) -> Self {
        Self {
            min_size,
            avg_size,
            max_size,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }

    /// Checks `0 < min < avg < max` and the window bound.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.min_size == 0 || self.min_size >= self.avg_size || self.avg_size >= self.max_size {
            return Err(ParamsError::Bounds {
                min: self.min_size,
                avg: self.avg_size,
                max: self.max_size,
            });
        }
        if !(1..=MAX_WINDOW_SIZE).contains(&self.window_size) {
            return Err(ParamsError::Window(self.window_size));
        }
        Ok(())
    }

    /// Mask over the `log2(avg_size)` low-order fingerprint bits.
    pub fn boundary_mask(&self) -> u64 {
        let bits = self.avg_size.ilog2();
        (1u64 << bits) - 1
    }
}

/// How a stream is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingStrategy {
    /// Constant-length chunks; only the last may be shorter.
    Fixed {
        /// Chunk length in bytes
        chunk_size: usize,
    },
    /// Rolling-hash boundaries within size bounds.
    ContentDefined(CdcParams),
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::ContentDefined(CdcParams::default())
    }
}

impl ChunkingStrategy {
    /// Fixed-size strategy with the default chunk size.
    pub fn fixed_default() -> Self {
        Self::Fixed {
            chunk_size: FIXED_CHUNK_SIZE,
        }
    }

    /// Validates the strategy's parameters.
    pub fn validate(&self) -> Result<(), ParamsError> {
        match self {
            Self::Fixed { chunk_size: 0 } => Err(ParamsError::ZeroChunkSize),
            Self::Fixed { .. } => Ok(()),
            Self::ContentDefined(params) => params.validate(),
        }
    }

    /// Largest chunk this strategy can emit.
    pub fn max_chunk_size(&self) -> usize {
        match self {
            Self::Fixed { chunk_size } => *chunk_size,
            Self::ContentDefined(params) => params.max_size,
        }
    }

    /// Typical chunk size, used to size buffers.
    pub fn expected_chunk_size(&self) -> usize {
        match self {
            Self::Fixed { chunk_size } => *chunk_size,
            Self::ContentDefined(params) => params.min_size + params.avg_size,
        }
    }
}

impl fmt::Display for ChunkingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed { chunk_size } => write!(f, "fixed({chunk_size})"),
            Self::ContentDefined(p) => write!(
                f,
                "content-defined(min={}, avg={}, max={}, window={})",
                p.min_size, p.avg_size, p.max_size, p.window_size
            ),
        }
    }
}
