//! Per-file pipeline.
//!
//! ```text
//! reader ─► Chunker ─► spawn(hash) ─┐
//!  (calling thread)     pool workers ├─► slots[index] ─► commit in index order
//!                                    ┘                    (put, then record)
//! ```
//!
//! Chunking runs on the calling thread because boundaries depend on every
//! preceding byte. Each chunk's buffer is moved into a hashing task on the
//! worker pool and comes back with its fingerprint over a channel, in
//! whatever order the workers finish. Results are parked in a slot per
//! chunk index and committed only once every lower index has been
//! committed, so store writes and manifest updates happen strictly in order.
//!
//! At most `max_in_flight` chunks are held between reading and committing,
//! counting both those being hashed and those waiting for a lower index.

use std::collections::VecDeque;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

use bytes::Bytes;
use drift_cdc::Chunker;
use drift_core::{hash_chunk, Fingerprint, HashError};
use drift_store::{ChunkRef, ChunkStore, FileEntry, PutOutcome};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::EngineError;

/// How a committed chunk compares with the previous entry for the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// No chunk at this index before
    New,
    /// A different chunk at this index before
    Changed,
    /// Same fingerprint and length at this index; no store write
    Unchanged,
}

impl ChunkStatus {
    fn classify(previous: Option<&ChunkRef>, fingerprint: &Fingerprint, length: u64) -> Self {
        match previous {
            None => Self::New,
            Some(prev) if prev.fingerprint == *fingerprint && prev.length == length => {
                Self::Unchanged
            }
            Some(_) => Self::Changed,
        }
    }
}

/// Result of processing one file.
#[derive(Debug, Clone)]
pub struct FileReport {
    /// The file's new manifest entry
    pub entry: FileEntry,
    /// Chunks at indices the previous entry did not have
    pub new_chunks: usize,
    /// Chunks whose fingerprint differs from the previous entry
    pub changed_chunks: usize,
    /// Chunks identical to the previous entry
    pub unchanged_chunks: usize,
    /// Previous chunks past the end of the new chunk list
    pub removed_chunks: usize,
    /// Blobs physically written
    pub chunks_written: usize,
    /// New or changed chunks whose blob already existed
    pub dedup_hits: usize,
    /// Bytes physically written
    pub bytes_written: u64,
}

impl FileReport {
    /// Returns true if the entry is identical to the previous one.
    pub fn is_unchanged(&self) -> bool {
        self.new_chunks == 0 && self.changed_chunks == 0 && self.removed_chunks == 0
    }
}

struct Hashed {
    index: u64,
    data: Bytes,
    /// `None` if the hashing task panicked
    fingerprint: Option<Result<Fingerprint, HashError>>,
}

type Hasher = fn(&[u8]) -> Result<Fingerprint, HashError>;

/// Chunks, hashes and commits files.
pub struct Pipeline {
    config: EngineConfig,
    pool: ThreadPool,
    max_in_flight: usize,
    hasher: Hasher,
}

impl Pipeline {
    /// Creates a pipeline and starts its hashing workers.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let workers = config.effective_workers();
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("drift-hash-{i}"))
            .build()?;
        let max_in_flight = config.effective_max_in_flight();

        debug!(workers, max_in_flight, strategy = %config.strategy, "Pipeline started");
        Ok(Self {
            config,
            pool,
            max_in_flight,
            hasher: hash_chunk,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the number of hashing workers.
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Processes one file.
    ///
    /// New and changed chunks are written to `store` before they are
    /// recorded. Chunks identical to those at the same index in `previous`
    /// are recorded without touching the store. On error no entry is
    /// produced; chunks already written stay in the store as orphans until
    /// the next collection.
    pub fn process_file<R: Read>(
        &self,
        identity: &str,
        reader: R,
        previous: Option<&FileEntry>,
        store: &ChunkStore,
    ) -> Result<FileReport, EngineError> {
        let chunker =
            Chunker::with_buffer_size(reader, self.config.strategy, self.config.read_buffer_size)
                .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        let mut commit = Commit {
            identity,
            previous,
            store,
            chunks: Vec::new(),
            new_chunks: 0,
            changed_chunks: 0,
            unchanged_chunks: 0,
            chunks_written: 0,
            dedup_hits: 0,
            bytes_written: 0,
        };

        self.pool
            .in_place_scope(|scope| -> Result<(), EngineError> {
                let (tx, rx) = mpsc::channel::<Hashed>();
                // Dropped once the chunker is exhausted, so a task that dies
                // without reporting shows up as a closed channel.
                let mut sender = Some(tx);
                let mut chunker = chunker;
                let hasher = self.hasher;
                // Every chunk read but not yet committed, hashed or not.
                let mut slots: VecDeque<Option<Hashed>> = VecDeque::new();
                let mut next_commit = 0u64;

                loop {
                    while sender.is_some() && slots.len() < self.max_in_flight {
                        match chunker.next() {
                            None => sender = None,
                            Some(Err(source)) => {
                                return Err(EngineError::Source {
                                    identity: identity.to_string(),
                                    source,
                                })
                            }
                            Some(Ok(chunk)) => {
                                if let Some(tx) = sender.clone() {
                                    slots.push_back(None);
                                    scope.spawn(move |_| {
                                        let fingerprint =
                                            panic::catch_unwind(AssertUnwindSafe(|| hasher(&chunk.data)))
                                                .ok();
                                        // The receiver is gone only if the file already failed.
                                        let _ = tx.send(Hashed {
                                            index: chunk.index,
                                            data: chunk.data,
                                            fingerprint,
                                        });
                                    });
                                }
                            }
                        }
                    }

                    if slots.is_empty() {
                        return Ok(());
                    }

                    let hashed = rx.recv().map_err(|_| EngineError::WorkerLost {
                        identity: identity.to_string(),
                    })?;
                    let slot = (hashed.index - next_commit) as usize;
                    slots[slot] = Some(hashed);

                    while matches!(slots.front(), Some(Some(_))) {
                        if let Some(Some(ready)) = slots.pop_front() {
                            commit.apply(ready)?;
                            next_commit += 1;
                        }
                    }
                }
            })?;

        commit.finish()
    }
}

/// Single-threaded commit state for one file.
struct Commit<'a> {
    identity: &'a str,
    previous: Option<&'a FileEntry>,
    store: &'a ChunkStore,
    chunks: Vec<ChunkRef>,
    new_chunks: usize,
    changed_chunks: usize,
    unchanged_chunks: usize,
    chunks_written: usize,
    dedup_hits: usize,
    bytes_written: u64,
}

impl Commit<'_> {
    fn apply(&mut self, hashed: Hashed) -> Result<(), EngineError> {
        debug_assert_eq!(hashed.index, self.chunks.len() as u64);
        let fingerprint = hashed
            .fingerprint
            .ok_or_else(|| EngineError::WorkerLost {
                identity: self.identity.to_string(),
            })?
            .map_err(|_| EngineError::EmptyChunk {
                identity: self.identity.to_string(),
                index: hashed.index,
            })?;
        let length = hashed.data.len() as u64;
        let previous = self.previous.and_then(|entry| entry.chunk(hashed.index));

        let status = ChunkStatus::classify(previous, &fingerprint, length);
        match status {
            ChunkStatus::Unchanged => self.unchanged_chunks += 1,
            ChunkStatus::New | ChunkStatus::Changed => {
                if status == ChunkStatus::New {
                    self.new_chunks += 1;
                } else {
                    self.changed_chunks += 1;
                }
                match self.store.put(&fingerprint, &hashed.data)? {
                    PutOutcome::Written => {
                        self.chunks_written += 1;
                        self.bytes_written += length;
                    }
                    PutOutcome::AlreadyPresent => self.dedup_hits += 1,
                }
            }
        }
        trace!(identity = self.identity, index = hashed.index, fingerprint = %fingerprint, ?status, "Committed chunk");

        self.chunks.push(ChunkRef {
            index: hashed.index,
            fingerprint,
            length,
        });
        Ok(())
    }

    fn finish(self) -> Result<FileReport, EngineError> {
        let removed_chunks = self
            .previous
            .map(|entry| entry.chunks().len().saturating_sub(self.chunks.len()))
            .unwrap_or(0);
        let entry = FileEntry::new(self.identity, self.chunks)?;

        info!(
            identity = self.identity,
            size = entry.size(),
            chunks = entry.chunks().len(),
            new = self.new_chunks,
            changed = self.changed_chunks,
            unchanged = self.unchanged_chunks,
            written = self.chunks_written,
            "Processed file"
        );
        Ok(FileReport {
            entry,
            new_chunks: self.new_chunks,
            changed_chunks: self.changed_chunks,
            unchanged_chunks: self.unchanged_chunks,
            removed_chunks,
            chunks_written: self.chunks_written,
            dedup_hits: self.dedup_hits,
            bytes_written: self.bytes_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_cdc::{CdcParams, ChunkingStrategy};
    use drift_store::{restore_file, Manifest, StoreConfig};
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::io::{self, Cursor};
    use tempfile::TempDir;

    const MIN: usize = 1024;
    const AVG: usize = 4096;
    const MAX: usize = 16384;

    fn strategy() -> ChunkingStrategy {
        ChunkingStrategy::ContentDefined(CdcParams::new(MIN, AVG, MAX))
    }

    fn pipeline(workers: usize, max_in_flight: usize) -> Pipeline {
        Pipeline::new(
            EngineConfig::new(strategy())
                .with_workers(workers)
                .with_max_in_flight(max_in_flight)
                .with_read_buffer_size(4096),
        )
        .unwrap()
    }

    fn store() -> (TempDir, ChunkStore) {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::open(&StoreConfig::new(dir.path())).unwrap();
        (dir, store)
    }

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    fn restore(entry: &FileEntry, store: &ChunkStore) -> Vec<u8> {
        let mut manifest = Manifest::new();
        manifest.insert_entry(entry.clone());
        let mut out = Vec::new();
        restore_file(&manifest, store, entry.identity(), &mut out).unwrap();
        out
    }

    #[test]
    fn test_first_pass_writes_everything() {
        let (_dir, store) = store();
        let data = random_bytes(MAX * 12, 1);

        let report = pipeline(4, 8)
            .process_file("a.img", Cursor::new(&data), None, &store)
            .unwrap();

        let chunks = report.entry.chunks().len();
        assert!(chunks > 1);
        assert_eq!(report.new_chunks, chunks);
        assert_eq!(report.chunks_written + report.dedup_hits, chunks);
        assert_eq!(report.entry.size(), data.len() as u64);
        assert_eq!(restore(&report.entry, &store), data);
    }

    #[test]
    fn test_second_pass_is_unchanged() {
        let (_dir, store) = store();
        let data = random_bytes(MAX * 8, 2);
        let pipeline = pipeline(4, 8);

        let first = pipeline
            .process_file("a.img", Cursor::new(&data), None, &store)
            .unwrap();
        let written = store.stats().chunks_written;

        let second = pipeline
            .process_file("a.img", Cursor::new(&data), Some(&first.entry), &store)
            .unwrap();

        assert!(second.is_unchanged());
        assert_eq!(second.unchanged_chunks, first.entry.chunks().len());
        assert_eq!(second.chunks_written, 0);
        assert_eq!(second.entry, first.entry);
        assert_eq!(store.stats().chunks_written, written);
    }

    #[test]
    fn test_commit_order_independent_of_parallelism() {
        let (_dir, store) = store();
        let data = random_bytes(MAX * 20 + 77, 3);

        let serial = pipeline(1, 1)
            .process_file("a.img", Cursor::new(&data), None, &store)
            .unwrap();
        let parallel = pipeline(8, 32)
            .process_file("a.img", Cursor::new(&data), None, &store)
            .unwrap();

        assert_eq!(serial.entry, parallel.entry);
        for (i, chunk) in parallel.entry.chunks().iter().enumerate() {
            assert_eq!(chunk.index, i as u64);
        }
    }

    #[test]
    fn test_modified_tail_classified_changed() {
        let (_dir, store) = store();
        let pipeline = pipeline(2, 4);
        let data = random_bytes(MAX * 6, 4);
        let first = pipeline
            .process_file("a.img", Cursor::new(&data), None, &store)
            .unwrap();

        let mut edited = data.clone();
        let last = edited.len() - 1;
        edited[last] ^= 0xFF;
        let second = pipeline
            .process_file("a.img", Cursor::new(&edited), Some(&first.entry), &store)
            .unwrap();

        assert!(second.changed_chunks >= 1);
        assert_eq!(second.new_chunks, 0);
        assert_eq!(
            second.unchanged_chunks + second.changed_chunks,
            second.entry.chunks().len()
        );
        assert_eq!(restore(&second.entry, &store), edited);
    }

    #[test]
    fn test_truncated_file_counts_removed_chunks() {
        let (_dir, store) = store();
        let pipeline = pipeline(2, 4);
        let data = random_bytes(MAX * 6, 5);
        let first = pipeline
            .process_file("a.img", Cursor::new(&data), None, &store)
            .unwrap();

        let second = pipeline
            .process_file("a.img", Cursor::new(&data[..0]), Some(&first.entry), &store)
            .unwrap();
        assert_eq!(second.removed_chunks, first.entry.chunks().len());
        assert!(second.entry.chunks().is_empty());
        assert!(!second.is_unchanged());
    }

    #[test]
    fn test_duplicate_content_written_once() {
        let (_dir, store) = store();
        let block = random_bytes(MAX, 6);
        let data: Vec<u8> = block.iter().chain(block.iter()).copied().collect();

        let report = pipeline(1, 1)
            .process_file("fixed.img", Cursor::new(&data), None, &store)
            .unwrap();
        assert_eq!(report.entry.size(), data.len() as u64);
        assert!(report.dedup_hits > 0 || report.entry.chunks().len() == report.chunks_written);
        assert_eq!(store.list().unwrap().len(), report.chunks_written);
    }

    struct FailAfter {
        inner: Cursor<Vec<u8>>,
        remaining: usize,
    }

    impl Read for FailAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "device gone"));
            }
            let n = buf.len().min(self.remaining);
            let n = self.inner.read(&mut buf[..n])?;
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_failure_produces_no_entry() {
        let (_dir, store) = store();
        let reader = FailAfter {
            inner: Cursor::new(random_bytes(MAX * 10, 7)),
            remaining: MAX * 5,
        };

        let err = pipeline(2, 4)
            .process_file("a.img", reader, None, &store)
            .unwrap_err();
        assert!(matches!(err, EngineError::Source { ref identity, .. } if identity == "a.img"));
        assert!(!err.is_fatal());
    }

    /// Every `read` records how many chunks have been cut but not yet
    /// written to the store.
    struct CountingReader<'a> {
        inner: Cursor<Vec<u8>>,
        store: &'a ChunkStore,
        reads: u64,
        max_uncommitted: u64,
    }

    impl Read for CountingReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // One fixed-size chunk per read, so `reads` chunks were cut before this one.
            let uncommitted = self.reads - self.store.stats().chunks_written;
            self.max_uncommitted = self.max_uncommitted.max(uncommitted);
            self.reads += 1;
            self.inner.read(buf)
        }
    }

    const FIXED: usize = 4096;

    fn slow_first_chunk(data: &[u8]) -> Result<Fingerprint, HashError> {
        if data.first() == Some(&0xFF) {
            std::thread::sleep(std::time::Duration::from_millis(300));
        }
        hash_chunk(data)
    }

    #[test]
    fn test_uncommitted_chunks_bounded_while_head_is_slow() {
        let (_dir, store) = store();
        let mut pipeline = Pipeline::new(
            EngineConfig::new(ChunkingStrategy::Fixed { chunk_size: FIXED })
                .with_workers(2)
                .with_max_in_flight(2)
                .with_read_buffer_size(FIXED),
        )
        .unwrap();
        pipeline.hasher = slow_first_chunk;

        let mut data = random_bytes(FIXED * 40, 8);
        for chunk in data.chunks_mut(FIXED) {
            chunk[0] = 0x00;
        }
        data[0] = 0xFF;

        let mut reader = CountingReader {
            inner: Cursor::new(data.clone()),
            store: &store,
            reads: 0,
            max_uncommitted: 0,
        };
        let report = pipeline
            .process_file("a.img", &mut reader, None, &store)
            .unwrap();

        assert_eq!(report.entry.chunks().len(), 40);
        assert!(
            reader.max_uncommitted <= 2,
            "{} chunks held uncommitted",
            reader.max_uncommitted
        );
        assert_eq!(restore(&report.entry, &store), data);
    }

    fn panicking_hasher(_: &[u8]) -> Result<Fingerprint, HashError> {
        panic!("hasher failed");
    }

    #[test]
    fn test_panicking_worker_reports_worker_lost() {
        let (_dir, store) = store();
        let mut pipeline = pipeline(2, 4);
        pipeline.hasher = panicking_hasher;

        let err = pipeline
            .process_file("a.img", Cursor::new(random_bytes(MAX * 4, 9)), None, &store)
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkerLost { ref identity } if identity == "a.img"));
        assert!(err.is_fatal());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_classify() {
        let fp = Fingerprint::from_data(b"x");
        let other = Fingerprint::from_data(b"y");
        let prev = ChunkRef {
            index: 0,
            fingerprint: fp,
            length: 1,
        };
        assert_eq!(ChunkStatus::classify(None, &fp, 1), ChunkStatus::New);
        assert_eq!(ChunkStatus::classify(Some(&prev), &fp, 1), ChunkStatus::Unchanged);
        assert_eq!(ChunkStatus::classify(Some(&prev), &other, 1), ChunkStatus::Changed);
    }
}
