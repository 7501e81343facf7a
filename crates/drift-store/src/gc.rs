//! Orphan chunk collection.
//!
//! Runs only against a [`CommittedManifest`]: every fingerprint the durable
//! manifest references is kept, everything else in the store is deleted.
//! A crash before the manifest is persisted therefore only ever leaves extra
//! chunks behind, never missing ones.

use std::collections::HashSet;

use drift_core::Fingerprint;
use tracing::{debug, info};

use crate::chunk::ChunkStore;
use crate::manifest::CommittedManifest;
use crate::StoreError;

/// Outcome of a collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Blobs found in the store
    pub scanned: usize,
    /// Distinct fingerprints the manifest references
    pub referenced: usize,
    /// Orphans deleted (or that would be, for a dry run)
    pub deleted: Vec<Fingerprint>,
    /// Bytes reclaimed
    pub bytes_freed: u64,
    /// Referenced fingerprints with no blob in the store
    pub missing: usize,
}

/// Deletes chunks unreachable from the committed manifest.
pub struct GarbageCollector<'a> {
    store: &'a ChunkStore,
}

impl<'a> GarbageCollector<'a> {
    /// Creates a collector over `store`.
    pub fn new(store: &'a ChunkStore) -> Self {
        Self { store }
    }

    /// Deletes every blob the manifest does not reference.
    pub fn collect(&self, manifest: &CommittedManifest) -> Result<GcReport, StoreError> {
        self.sweep(manifest, false)
    }

    /// Reports what [`GarbageCollector::collect`] would delete.
    pub fn dry_run(&self, manifest: &CommittedManifest) -> Result<GcReport, StoreError> {
        self.sweep(manifest, true)
    }

    fn sweep(&self, manifest: &CommittedManifest, dry_run: bool) -> Result<GcReport, StoreError> {
        let reachable = manifest.reachable();
        let listed = self.store.list()?;
        let present: HashSet<&Fingerprint> = listed.iter().collect();

        let mut report = GcReport {
            scanned: listed.len(),
            referenced: reachable.len(),
            missing: reachable.iter().filter(|fp| !present.contains(fp)).count(),
            ..Default::default()
        };

        for &fingerprint in &listed {
            if reachable.contains(&fingerprint) {
                continue;
            }
            let size = self.store.blob_size(&fingerprint)?.unwrap_or(0);
            if dry_run || self.store.delete(&fingerprint)? {
                debug!(fingerprint = %fingerprint, size, dry_run, "Orphan chunk");
                report.bytes_freed += size;
                report.deleted.push(fingerprint);
            }
        }

        info!(
            scanned = report.scanned,
            referenced = report.referenced,
            deleted = report.deleted.len(),
            bytes_freed = report.bytes_freed,
            missing = report.missing,
            dry_run,
            "Garbage collection finished"
        );
        Ok(report)
    }
}
