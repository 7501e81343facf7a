//! Streaming chunker.
//!
//! Reads a byte stream through a fixed-size read buffer and yields owned
//! chunks in stream order. Boundary decisions depend only on the bytes seen
//! so far: the rolling window carries over between read buffers and across
//! chunk boundaries, so the same content cuts identically whatever the read
//! size.

use std::io::{self, Read};

use bytes::Bytes;
use tracing::trace;

use crate::params::{ChunkingStrategy, ParamsError};
use crate::rolling::RollingHasher;

/// Default read buffer: 256 KiB.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 256 * 1024;

/// Represents a chunk boundary with start and end offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBoundary {
    /// Start offset (inclusive)
    pub start: u64,
    /// End offset (exclusive)
    pub end: u64,
}

impl ChunkBoundary {
    /// Returns the size of this chunk.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true if this chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// A chunk cut from a stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Ordinal within the stream, starting at 0.
    pub index: u64,
    /// Byte offset of the first byte within the stream.
    pub offset: u64,
    /// Chunk contents.
    pub data: Bytes,
}

impl Chunk {
    /// Returns the chunk length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the chunk has no bytes. Never true for emitted chunks.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the byte range this chunk covers.
    pub fn boundary(&self) -> ChunkBoundary {
        ChunkBoundary {
            start: self.offset,
            end: self.offset + self.data.len() as u64,
        }
    }
}

/// Boundary detection state for one stream.
enum Detector {
    Fixed {
        chunk_size: usize,
    },
    Content {
        hasher: RollingHasher,
        min_size: usize,
        max_size: usize,
        mask: u64,
    },
}

impl Detector {
    fn new(strategy: &ChunkingStrategy) -> Self {
        match strategy {
            ChunkingStrategy::Fixed { chunk_size } => Self::Fixed {
                chunk_size: *chunk_size,
            },
            ChunkingStrategy::ContentDefined(params) => Self::Content {
                hasher: RollingHasher::new(params.window_size),
                min_size: params.min_size,
                max_size: params.max_size,
                mask: params.boundary_mask(),
            },
        }
    }

    /// Scans `data` as the continuation of a chunk already `pending` bytes
    /// long. Returns how many bytes belong to the chunk and whether the chunk
    /// ends after them.
    #[inline]
    fn scan(&mut self, pending: usize, data: &[u8]) -> (usize, bool) {
        match self {
            Self::Fixed { chunk_size } => {
                let need = *chunk_size - pending;
                if data.len() >= need {
                    (need, true)
                } else {
                    (data.len(), false)
                }
            }
            Self::Content {
                hasher,
                min_size,
                max_size,
                mask,
            } => {
                for (i, &byte) in data.iter().enumerate() {
                    let hash = hasher.push(byte);
                    let len = pending + i + 1;
                    if len >= *max_size || (len >= *min_size && hash & *mask == 0) {
                        return (i + 1, true);
                    }
                }
                (data.len(), false)
            }
        }
    }
}

/// Lazily cuts a reader into chunks.
///
/// Yields `io::Result<Chunk>`; after an error or the end of the stream the
/// iterator is exhausted. The sequence covers the stream exactly once with no
/// gaps or overlaps. An empty stream yields nothing; a stream shorter than
/// the minimum size yields a single chunk.
pub struct Chunker<R> {
    reader: R,
    detector: Detector,
    buffer: Box<[u8]>,
    buf_pos: usize,
    buf_len: usize,
    current: Vec<u8>,
    chunk_capacity: usize,
    offset: u64,
    index: u64,
    done: bool,
}

impl<R: Read> Chunker<R> {
    /// Creates a chunker with the default read buffer.
    pub fn new(reader: R, strategy: ChunkingStrategy) -> Result<Self, ParamsError> {
        Self::with_buffer_size(reader, strategy, DEFAULT_READ_BUFFER_SIZE)
    }

    /// Creates a chunker reading `buffer_size` bytes at a time.
    ///
    /// A `buffer_size` of 0 is treated as 1.
    pub fn with_buffer_size(
        reader: R,
        strategy: ChunkingStrategy,
        buffer_size: usize,
    ) -> Result<Self, ParamsError> {
        strategy.validate()?;
        let chunk_capacity = strategy
            .expected_chunk_size()
            .min(strategy.max_chunk_size());

        Ok(Self {
            reader,
            detector: Detector::new(&strategy),
            buffer: vec![0u8; buffer_size.max(1)].into_boxed_slice(),
            buf_pos: 0,
            buf_len: 0,
            current: Vec::with_capacity(chunk_capacity),
            chunk_capacity,
            offset: 0,
            index: 0,
            done: false,
        })
    }

    /// Returns the number of bytes emitted as chunks so far.
    pub fn position(&self) -> u64 {
        self.offset
    }

    fn emit(&mut self) -> Chunk {
        let data = std::mem::replace(&mut self.current, Vec::with_capacity(self.chunk_capacity));
        let chunk = Chunk {
            index: self.index,
            offset: self.offset,
            data: Bytes::from(data),
        };
        trace!(index = chunk.index, offset = chunk.offset, len = chunk.len(), "Cut chunk");
        self.index += 1;
        self.offset += chunk.len() as u64;
        chunk
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            if self.buf_pos == self.buf_len {
                match self.reader.read(&mut self.buffer) {
                    Ok(0) => {
                        self.done = true;
                        if self.current.is_empty() {
                            return None;
                        }
                        return Some(Ok(self.emit()));
                    }
                    Ok(n) => {
                        self.buf_pos = 0;
                        self.buf_len = n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }

            let window = &self.buffer[self.buf_pos..self.buf_len];
            let (taken, cut) = self.detector.scan(self.current.len(), window);
            self.current.extend_from_slice(&window[..taken]);
            self.buf_pos += taken;

            if cut {
                return Some(Ok(self.emit()));
            }
        }
    }
}

/// Computes chunk boundaries for an in-memory buffer.
///
/// Produces exactly the boundaries a [`Chunker`] would for the same bytes.
pub fn chunk_boundaries(
    data: &[u8],
    strategy: &ChunkingStrategy,
) -> Result<Vec<ChunkBoundary>, ParamsError> {
    strategy.validate()?;
    let mut detector = Detector::new(strategy);
    let mut boundaries = Vec::new();
    let mut start = 0usize;

    while start < data.len() {
        let (taken, _) = detector.scan(0, &data[start..]);
        let end = start + taken;
        boundaries.push(ChunkBoundary {
            start: start as u64,
            end: end as u64,
        });
        start = end;
    }

    Ok(boundaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CdcParams;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::io::Cursor;

    const MIN: usize = 1024;
    const AVG: usize = 4096;
    const MAX: usize = 16384;

    fn cdc() -> ChunkingStrategy {
        ChunkingStrategy::ContentDefined(CdcParams::new(MIN, AVG, MAX))
    }

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    fn collect(data: &[u8], strategy: ChunkingStrategy, buffer: usize) -> Vec<Chunk> {
        Chunker::with_buffer_size(Cursor::new(data), strategy, buffer)
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    fn reassemble(chunks: &[Chunk]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.data.iter().copied()).collect()
    }

    #[test]
    fn test_empty_stream() {
        assert!(collect(&[], cdc(), 4096).is_empty());
        assert!(collect(&[], ChunkingStrategy::Fixed { chunk_size: 10 }, 4096).is_empty());
        assert!(chunk_boundaries(&[], &cdc()).unwrap().is_empty());
    }

    #[test]
    fn test_short_stream_is_one_chunk() {
        let data = random_bytes(MIN - 1, 1);
        let chunks = collect(&data, cdc(), 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.as_ref(), data.as_slice());
        assert_eq!(chunks[0].boundary(), ChunkBoundary { start: 0, end: (MIN - 1) as u64 });
    }

    #[test]
    fn test_size_bounds() {
        let data = random_bytes(MAX * 40, 2);
        let chunks = collect(&data, cdc(), 64 * 1024);

        assert!(chunks.len() > 10, "should produce many chunks");
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= MIN, "chunk {} below min: {}", chunk.index, chunk.len());
            assert!(chunk.len() <= MAX, "chunk {} above max: {}", chunk.index, chunk.len());
        }
        assert!(chunks.last().unwrap().len() <= MAX);
    }

    #[test]
    fn test_uniform_data_forces_max_cuts() {
        let data = vec![0x42u8; MAX * 3 + 10];
        let chunks = collect(&data, cdc(), 4096);
        for chunk in &chunks {
            assert!(chunk.len() <= MAX);
        }
        assert_eq!(reassemble(&chunks), data);
    }

    #[test]
    fn test_contiguous_and_indexed() {
        let data = random_bytes(MAX * 8, 3);
        let chunks = collect(&data, cdc(), 10_000);

        let mut expected_offset = 0u64;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i as u64);
            assert_eq!(chunk.offset, expected_offset);
            assert!(!chunk.is_empty());
            expected_offset += chunk.len() as u64;
        }
        assert_eq!(expected_offset, data.len() as u64);
        assert_eq!(reassemble(&chunks), data);
    }

    #[test]
    fn test_read_buffer_size_does_not_matter() {
        let data = random_bytes(MAX * 10 + 123, 4);
        let reference: Vec<ChunkBoundary> =
            collect(&data, cdc(), 1).iter().map(Chunk::boundary).collect();

        for buffer in [7, 1000, 4096, MAX + 1, 1 << 20] {
            let got: Vec<ChunkBoundary> =
                collect(&data, cdc(), buffer).iter().map(Chunk::boundary).collect();
            assert_eq!(got, reference, "buffer size {buffer} changed boundaries");
        }

        assert_eq!(chunk_boundaries(&data, &cdc()).unwrap(), reference);
    }

    #[test]
    fn test_insertion_resyncs() {
        let base = random_bytes(MAX * 20, 5);
        let mut modified = vec![0xFFu8; 100];
        modified.extend_from_slice(&base);

        let a = chunk_boundaries(&base, &cdc()).unwrap();
        let b = chunk_boundaries(&modified, &cdc()).unwrap();

        let base_ends: Vec<u64> = a.iter().map(|c| c.end + 100).collect();
        let shifted_ends: Vec<u64> = b.iter().map(|c| c.end).collect();
        let shared = base_ends.iter().filter(|e| shifted_ends.contains(e)).count();

        assert!(
            shared * 2 > base_ends.len(),
            "only {shared} of {} boundaries survived a 100-byte insertion",
            base_ends.len()
        );
    }

    #[test]
    fn test_fixed_strategy() {
        let data = random_bytes(10_000, 6);
        let chunks = collect(&data, ChunkingStrategy::Fixed { chunk_size: 3000 }, 777);

        let sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![3000, 3000, 3000, 1000]);
        assert_eq!(reassemble(&chunks), data);
    }

    #[test]
    fn test_fixed_exact_multiple() {
        let data = random_bytes(9000, 7);
        let chunks = collect(&data, ChunkingStrategy::Fixed { chunk_size: 3000 }, 4096);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let bad = ChunkingStrategy::ContentDefined(CdcParams::new(4096, 1024, 16384));
        assert!(Chunker::new(Cursor::new(vec![1u8; 10]), bad).is_err());
        assert!(chunk_boundaries(&[1, 2, 3], &bad).is_err());
    }

    struct FailingReader {
        remaining: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "device gone"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(0xAB);
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_error_ends_stream() {
        let chunker = Chunker::with_buffer_size(
            FailingReader { remaining: MAX * 2 },
            cdc(),
            4096,
        )
        .unwrap();

        let results: Vec<io::Result<Chunk>> = chunker.collect();
        assert!(results.last().unwrap().is_err());
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    }
}
