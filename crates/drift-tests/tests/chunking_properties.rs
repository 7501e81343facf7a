//! Chunking properties.
//!
//! Tests that chunk sequences:
//! - Reproduce the input exactly for both strategies and all edge sizes
//! - Do not depend on how the input is read
//! - Share chunks between files with common content

use std::collections::HashSet;
use std::io::Cursor;

use drift_cdc::{chunk_boundaries, Chunker, ChunkingStrategy};
use drift_core::{hash_chunk, Fingerprint};
use drift_engine::{EngineConfig, Pipeline};
use drift_store::{ChunkStore, StoreConfig};
use drift_tests::{init_tracing, random_bytes, small_cdc, TestTree, AVG, MAX, MIN};
use tempfile::TempDir;

const EDGE_SIZES: [usize; 7] = [0, 1, MIN - 1, MIN, AVG, MAX, MAX * 9 + 13];

fn strategies() -> Vec<ChunkingStrategy> {
    vec![small_cdc(), ChunkingStrategy::Fixed { chunk_size: AVG }]
}

fn fingerprints(data: &[u8], strategy: ChunkingStrategy, buffer_size: usize) -> Vec<(u64, Fingerprint)> {
    Chunker::with_buffer_size(Cursor::new(data), strategy, buffer_size)
        .unwrap()
        .map(|chunk| {
            let chunk = chunk.unwrap();
            (chunk.offset, hash_chunk(&chunk.data).unwrap())
        })
        .collect()
}

#[test]
fn test_round_trip_edge_sizes() {
    init_tracing();

    for strategy in strategies() {
        let tree = TestTree::new();
        for (i, size) in EDGE_SIZES.iter().enumerate() {
            tree.write(&format!("size-{size}.bin"), &random_bytes(*size, i as u64));
        }

        let engine = tree.engine(EngineConfig::new(strategy).with_workers(4));
        let (committed, summary) = engine.run(&tree.sources(), None).unwrap();
        assert!(!summary.has_skipped(), "{strategy}: {summary}");
        assert_eq!(committed.len(), EDGE_SIZES.len());

        for (i, size) in EDGE_SIZES.iter().enumerate() {
            let identity = format!("size-{size}.bin");
            let restored = tree.restore(&engine, &identity).unwrap();
            assert_eq!(restored, random_bytes(*size, i as u64), "{strategy}: {identity}");

            let entry = committed.get(&identity).unwrap();
            assert_eq!(entry.size(), *size as u64);
            if *size == 0 {
                assert!(entry.chunks().is_empty());
            }
            if *size > 0 && *size <= MIN {
                assert_eq!(entry.chunks().len(), 1, "{strategy}: {identity}");
            }
        }
    }
}

#[test]
fn test_chunk_lengths_within_bounds() {
    let data = random_bytes(MAX * 30, 11);
    let boundaries = chunk_boundaries(&data, &small_cdc()).unwrap();
    let (last, rest) = boundaries.split_last().unwrap();

    for boundary in rest {
        let size = boundary.size() as usize;
        assert!((MIN..=MAX).contains(&size), "chunk of {size} bytes");
    }
    assert!(last.size() as usize <= MAX);
    assert_eq!(last.end, data.len() as u64);
}

#[test]
fn test_read_buffer_size_does_not_change_fingerprints() {
    let data = random_bytes(MAX * 12 + 321, 12);

    for strategy in strategies() {
        let reference = fingerprints(&data, strategy, 64 * 1024);
        for buffer_size in [1, 333, 4096, MAX + 7] {
            assert_eq!(
                fingerprints(&data, strategy, buffer_size),
                reference,
                "{strategy} with {buffer_size}-byte reads"
            );
        }
    }
}

#[test]
fn test_pipeline_entries_match_across_read_sizes() {
    let data = random_bytes(MAX * 6, 13);
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::open(&StoreConfig::new(dir.path())).unwrap();

    let entries: Vec<_> = [1usize, 1000, 1 << 20]
        .into_iter()
        .map(|read_buffer_size| {
            let pipeline = Pipeline::new(
                EngineConfig::new(small_cdc())
                    .with_workers(3)
                    .with_read_buffer_size(read_buffer_size),
            )
            .unwrap();
            pipeline
                .process_file("a.bin", Cursor::new(&data), None, &store)
                .unwrap()
                .entry
        })
        .collect();

    assert_eq!(entries[0], entries[1]);
    assert_eq!(entries[1], entries[2]);
}

#[test]
fn test_shared_content_stored_once() {
    init_tracing();

    let tree = TestTree::new();
    let common = random_bytes(MAX * 8, 14);
    let mut longer = common.clone();
    longer.extend_from_slice(&random_bytes(MAX * 2, 15));
    tree.write("a.bin", &common);
    tree.write("b.bin", &longer);

    let engine = tree.small_engine();
    let (committed, summary) = engine.run(&tree.sources(), None).unwrap();

    let fps = |identity: &str| -> HashSet<Fingerprint> {
        committed
            .get(identity)
            .unwrap()
            .chunks()
            .iter()
            .map(|c| c.fingerprint)
            .collect()
    };
    let shared: Vec<_> = fps("a.bin").intersection(&fps("b.bin")).copied().collect();
    assert!(!shared.is_empty());
    assert!(summary.dedup_hits >= shared.len());

    for fingerprint in &shared {
        assert!(engine.store().exists(fingerprint).unwrap());
    }
    assert_eq!(tree.stored(&engine), committed.reachable());
}
