//! Byte substitution table for the rolling hash.
//!
//! Each byte value is mapped to a 64-bit word before entering the polynomial,
//! which spreads entropy into the low-order bits tested for boundaries. The
//! table is derived from BLAKE3 of single-byte inputs so it is reproducible
//! without shipping constants.

use std::sync::LazyLock;

use drift_core::blake3_hash;

/// Type alias for the byte table.
pub type ByteTable = [u64; 256];

/// Pre-computed byte table (computed once at runtime).
pub static BYTE_TABLE: LazyLock<ByteTable> = LazyLock::new(byte_table);

/// Generates the byte table.
///
/// For each byte value 0-255, computes BLAKE3 of that single byte
/// and takes the first 8 bytes as a little-endian u64.
pub fn byte_table() -> ByteTable {
    let mut table = [0u64; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let hash = blake3_hash(&[i as u8]);
        let mut word = [0u8; 8];
        word.copy_from_slice(&hash[..8]);
        *slot = u64::from_le_bytes(word);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_table_spot_checks() {
        let table = byte_table();
        assert_eq!(table[0], 0xf1611bf1dfde3a2d, "TABLE[0] mismatch: got {:#x}", table[0]);
        assert_eq!(table[1], 0xe072c1bb1f72fc48, "TABLE[1] mismatch: got {:#x}", table[1]);
        assert_eq!(table[255], 0x6d93c57b374dd499, "TABLE[255] mismatch: got {:#x}", table[255]);
    }

    #[test]
    fn test_byte_table_uniqueness() {
        let mut values = byte_table().to_vec();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 256, "duplicate table entries");
    }

    #[test]
    fn test_lazy_table_matches_fresh() {
        assert_eq!(*BYTE_TABLE, byte_table());
    }
}
