//! Chunk hashing.
//!
//! BLAKE3 in default mode with 256-bit output. The hasher holds no state,
//! so any number of workers may call it concurrently on independent buffers.

use thiserror::Error;

use crate::identifiers::Fingerprint;

/// Errors from chunk hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HashError {
    /// A zero-length buffer was submitted. Zero-length chunks are not valid
    /// dedup keys; seeing one means the chunker is broken.
    #[error("cannot fingerprint an empty chunk")]
    EmptyInput,
}

/// Computes BLAKE3 in default mode with 256-bit output.
///
/// # Example
/// ```
/// use drift_core::blake3_hash;
///
/// let hash = blake3_hash(b"");
/// assert_eq!(
///     hex::encode(hash),
///     "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
/// );
/// ```
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Fingerprints a chunk.
///
/// Fails with [`HashError::EmptyInput`] for a zero-length buffer.
pub fn hash_chunk(data: &[u8]) -> Result<Fingerprint, HashError> {
    if data.is_empty() {
        return Err(HashError::EmptyInput);
    }
    Ok(Fingerprint::from_data(data))
}
