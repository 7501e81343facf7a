//! Rabin-Karp rolling hash.
//!
//! The fingerprint of a window `x[0..w]` is
//!
//! ```text
//! H = T[x0]·B^(w-1) + T[x1]·B^(w-2) + … + T[x(w-1)]   (mod 2^64)
//! ```
//!
//! where `T` is the byte table and `B` an odd constant. Sliding one byte
//! subtracts the leaving term, multiplies by `B` and adds the entering term,
//! so each byte costs O(1) regardless of window size. The incremental value
//! always equals [`RollingHasher::hash_window`] over the same bytes.

use crate::table::BYTE_TABLE;

/// Default rolling window: 48 bytes.
pub const DEFAULT_WINDOW_SIZE: usize = 48;

/// Largest accepted rolling window.
pub const MAX_WINDOW_SIZE: usize = 256;

/// Polynomial base. Odd, so multiplication is invertible modulo 2^64.
const BASE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Incremental polynomial fingerprint over a sliding byte window.
#[derive(Debug, Clone)]
pub struct RollingHasher {
    window: Box<[u8]>,
    /// Next slot to overwrite; also the oldest byte once full.
    pos: usize,
    filled: usize,
    hash: u64,
    /// BASE^(w-1), the weight of the byte leaving the window.
    out_factor: u64,
}

impl RollingHasher {
    /// Creates a hasher with an empty window of `window_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `window_size` is 0 or exceeds [`MAX_WINDOW_SIZE`].
    pub fn new(window_size: usize) -> Self {
        assert!(
            (1..=MAX_WINDOW_SIZE).contains(&window_size),
            "window_size must be 1..={MAX_WINDOW_SIZE} (got {window_size})"
        );

        let mut out_factor = 1u64;
        for _ in 1..window_size {
            out_factor = out_factor.wrapping_mul(BASE);
        }

        Self {
            window: vec![0u8; window_size].into_boxed_slice(),
            pos: 0,
            filled: 0,
            hash: 0,
            out_factor,
        }
    }

    /// Creates a hasher whose window already holds `bytes`.
    ///
    /// `bytes.len()` is the window size.
    pub fn from_window(bytes: &[u8]) -> Self {
        let mut hasher = Self::new(bytes.len());
        for &b in bytes {
            hasher.push(b);
        }
        hasher
    }

    /// Returns the window size in bytes.
    pub fn window_size(&self) -> usize {
        self.window.len()
    }

    /// Returns true once `window_size` bytes have been pushed.
    pub fn is_full(&self) -> bool {
        self.filled == self.window.len()
    }

    /// Returns the current fingerprint.
    pub fn fingerprint(&self) -> u64 {
        self.hash
    }

    /// Slides the window by one byte: `old` leaves, `new` enters.
    ///
    /// `old` must be the oldest byte of a full window. Callers that track
    /// the window themselves use this directly; everyone else uses
    /// [`RollingHasher::push`].
    #[inline]
    pub fn roll(&mut self, old: u8, new: u8) -> u64 {
        let table = &*BYTE_TABLE;
        self.hash = self
            .hash
            .wrapping_sub(table[old as usize].wrapping_mul(self.out_factor))
            .wrapping_mul(BASE)
            .wrapping_add(table[new as usize]);
        self.hash
    }

    /// Appends a byte, evicting the oldest one if the window is full.
    #[inline]
    pub fn push(&mut self, byte: u8) -> u64 {
        let size = self.window.len();
        if self.filled < size {
            self.hash = self
                .hash
                .wrapping_mul(BASE)
                .wrapping_add(BYTE_TABLE[byte as usize]);
            self.filled += 1;
            self.window[self.pos] = byte;
        } else {
            let old = self.window[self.pos];
            self.window[self.pos] = byte;
            self.roll(old, byte);
        }
        self.pos = (self.pos + 1) % size;
        self.hash
    }

    /// Empties the window.
    pub fn reset(&mut self) {
        self.window.fill(0);
        self.pos = 0;
        self.filled = 0;
        self.hash = 0;
    }

    /// Computes the fingerprint of `window` from scratch.
    pub fn hash_window(window: &[u8]) -> u64 {
        let table = &*BYTE_TABLE;
        window.iter().fold(0u64, |h, &b| {
            h.wrapping_mul(BASE).wrapping_add(table[b as usize])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    #[test]
    fn test_push_matches_scratch_hash() {
        let data = random_bytes(4096, 1);
        let w = DEFAULT_WINDOW_SIZE;
        let mut hasher = RollingHasher::new(w);

        for (i, &b) in data.iter().enumerate() {
            let rolled = hasher.push(b);
            let start = (i + 1).saturating_sub(w);
            assert_eq!(
                rolled,
                RollingHasher::hash_window(&data[start..=i]),
                "incremental hash diverged at byte {i}"
            );
        }
    }

    #[test]
    fn test_roll_matches_scratch_hash() {
        let data = random_bytes(2048, 2);
        for w in [1, 2, 16, 48, 64, MAX_WINDOW_SIZE] {
            let mut hasher = RollingHasher::from_window(&data[..w]);
            for i in w..data.len() {
                let rolled = hasher.roll(data[i - w], data[i]);
                assert_eq!(rolled, RollingHasher::hash_window(&data[i + 1 - w..=i]), "w={w} i={i}");
            }
        }
    }

    #[test]
    fn test_depends_only_on_window() {
        let w = 32;
        let tail = random_bytes(w, 3);

        let mut a = RollingHasher::new(w);
        for b in random_bytes(1000, 4).into_iter().chain(tail.iter().copied()) {
            a.push(b);
        }
        let mut b = RollingHasher::new(w);
        for x in random_bytes(77, 5).into_iter().chain(tail.iter().copied()) {
            b.push(x);
        }

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_reset() {
        let mut hasher = RollingHasher::new(8);
        for b in 0..20u8 {
            hasher.push(b);
        }
        assert!(hasher.is_full());

        hasher.reset();
        assert!(!hasher.is_full());
        assert_eq!(hasher.fingerprint(), 0);
        assert_eq!(hasher.push(7), RollingHasher::hash_window(&[7]));
    }

    #[test]
    #[should_panic(expected = "window_size must be")]
    fn test_zero_window_panics() {
        let _ = RollingHasher::new(0);
    }
}
