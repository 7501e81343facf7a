//! Integration tests for drift.
//!
//! This crate provides:
//! - A source/target directory harness for end-to-end sync runs
//! - Integration tests for chunking, the store and the sync pipeline

pub mod harness;

pub use harness::{init_tracing, random_bytes, small_cdc, TestTree, AVG, MAX, MIN};
