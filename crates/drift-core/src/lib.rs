//! Drift Core - identifiers and chunk hashing shared by every drift crate.
//!
//! This crate provides:
//! - The `Fingerprint` type: a BLAKE3 digest identifying a chunk's bytes
//! - The chunk hasher used by the pipeline workers
//!
//! A fingerprint is both the identity of a chunk and its storage key.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod hash;
pub mod identifiers;

pub use hash::{blake3_hash, hash_chunk, HashError};
pub use identifiers::{Fingerprint, FINGERPRINT_HEX_LEN, FINGERPRINT_LEN};
