//! Run summaries.

use std::fmt;

use drift_store::GcReport;

use crate::pipeline::FileReport;

/// A file the run did not process, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileError {
    /// File identity
    pub identity: String,
    /// Human-readable reason
    pub reason: String,
}

impl FileError {
    /// Creates a file error.
    pub fn new(identity: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            identity: identity.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.identity, self.reason)
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Files chunked successfully
    pub files_processed: usize,
    /// Processed files whose entry did not change
    pub files_unchanged: usize,
    /// Entries dropped because their source is gone
    pub files_removed: usize,
    /// Files left with their previous entry
    pub skipped: Vec<FileError>,
    /// Chunks at indices a file did not have before
    pub new_chunks: usize,
    /// Chunks that replaced a different chunk at the same index
    pub changed_chunks: usize,
    /// Chunks identical to the previous run
    pub unchanged_chunks: usize,
    /// References dropped from the manifest
    pub removed_chunks: usize,
    /// Blobs physically written
    pub chunks_written: usize,
    /// New or changed chunks whose blob already existed
    pub dedup_hits: usize,
    /// Bytes physically written
    pub bytes_written: u64,
    /// Bytes of source data chunked
    pub bytes_processed: u64,
    /// Orphan blobs deleted after the manifest was persisted
    pub chunks_collected: usize,
    /// Bytes reclaimed by collection
    pub bytes_freed: u64,
}

impl RunSummary {
    /// Adds one file's results.
    pub fn record_file(&mut self, report: &FileReport) {
        self.files_processed += 1;
        if report.is_unchanged() {
            self.files_unchanged += 1;
        }
        self.new_chunks += report.new_chunks;
        self.changed_chunks += report.changed_chunks;
        self.unchanged_chunks += report.unchanged_chunks;
        self.removed_chunks += report.removed_chunks;
        self.chunks_written += report.chunks_written;
        self.dedup_hits += report.dedup_hits;
        self.bytes_written += report.bytes_written;
        self.bytes_processed += report.entry.size();
    }

    /// Records a skipped file.
    pub fn record_skip(&mut self, error: FileError) {
        self.skipped.push(error);
    }

    /// Adds the collection results.
    pub fn record_gc(&mut self, report: &GcReport) {
        self.chunks_collected = report.deleted.len();
        self.bytes_freed = report.bytes_freed;
    }

    /// Returns true if any file was skipped.
    pub fn has_skipped(&self) -> bool {
        !self.skipped.is_empty()
    }

    /// Returns true if the run changed nothing on disk.
    pub fn is_noop(&self) -> bool {
        self.chunks_written == 0
            && self.new_chunks == 0
            && self.changed_chunks == 0
            && self.removed_chunks == 0
            && self.files_removed == 0
            && self.chunks_collected == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "files: {} processed ({} unchanged), {} removed, {} skipped",
            self.files_processed,
            self.files_unchanged,
            self.files_removed,
            self.skipped.len()
        )?;
        writeln!(
            f,
            "chunks: {} new, {} changed, {} unchanged, {} removed",
            self.new_chunks, self.changed_chunks, self.unchanged_chunks, self.removed_chunks
        )?;
        writeln!(
            f,
            "store: {} written ({} bytes), {} already present, {} bytes read",
            self.chunks_written, self.bytes_written, self.dedup_hits, self.bytes_processed
        )?;
        write!(
            f,
            "gc: {} orphans deleted ({} bytes)",
            self.chunks_collected, self.bytes_freed
        )?;
        for skipped in &self.skipped {
            write!(f, "\nskipped {skipped}")?;
        }
        Ok(())
    }
}
