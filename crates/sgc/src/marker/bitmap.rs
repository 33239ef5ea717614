//! Mark Bitmap - Tracking Marked Objects
//!
//! One bit per allocation granule over the whole heap reservation, so an
//! object in any region can be marked without a per-region lookup.
//!
//! Bitmap Structure:
//! ```text
//! Heap:        64MB at heap_base
//! Granularity: 8 bytes per bit
//! Bitmap size: 64MB / 8 = 8M bits = 1MB
//!
//! Object at heap_base + 0x1040:
//! - Bit index:  0x1040 / 8 = 520
//! - Word index: 520 / 64   = 8
//! - Bit offset: 520 % 64   = 8
//! ```
//!
//! The backing store is its own anonymous mapping; clearing it between
//! collections remaps the pages instead of writing zeroes.

use crate::error::{Result, SgcError};
use crate::heap::memory_mapping::MemoryMapping;
use std::sync::atomic::{AtomicU64, Ordering};

/// MarkBitmap - one bit per granule of `[base, limit)`
pub struct MarkBitmap {
    mapping: MemoryMapping,
    base: usize,
    limit: usize,
    /// Granularity (bytes per bit)
    granularity: usize,
    /// Number of 64-bit words in use
    words: usize,
}

impl MarkBitmap {
    /// Create a cleared bitmap covering `[base, limit)`
    pub fn new(base: usize, limit: usize, granularity: usize) -> Result<Self> {
        if limit <= base {
            return Err(SgcError::InvalidArgument(format!(
                "bitmap range {:#x}..{:#x} is empty",
                base, limit
            )));
        }
        if !granularity.is_power_of_two() {
            return Err(SgcError::InvalidArgument(format!(
                "granularity ({}) must be a power of two",
                granularity
            )));
        }
        let bits = (limit - base).div_ceil(granularity);
        let words = bits.div_ceil(64);
        let mapping = MemoryMapping::anonymous(words * std::mem::size_of::<u64>())?;

        Ok(Self {
            mapping,
            base,
            limit,
            granularity,
            words,
        })
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.words);
        // SAFETY: the mapping holds `words` zero-initialized u64s.
        unsafe { &*(self.mapping.as_ptr() as *const AtomicU64).add(index) }
    }

    #[inline]
    fn locate(&self, addr: usize) -> Option<(usize, u64)> {
        if addr < self.base || addr >= self.limit {
            return None;
        }
        let bit = (addr - self.base) / self.granularity;
        Some((bit / 64, 1u64 << (bit % 64)))
    }

    /// Set the bit for `addr`
    ///
    /// Returns `true` if the bit was clear before (newly marked), `false` if
    /// it was already set or `addr` is outside the covered range.
    #[inline]
    pub fn mark(&self, addr: usize) -> bool {
        match self.locate(addr) {
            Some((index, mask)) => self.word(index).fetch_or(mask, Ordering::AcqRel) & mask == 0,
            None => false,
        }
    }

    /// Check if `addr` is marked
    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        match self.locate(addr) {
            Some((index, mask)) => self.word(index).load(Ordering::Acquire) & mask != 0,
            None => false,
        }
    }

    /// Count set bits
    pub fn count_marked(&self) -> usize {
        (0..self.words)
            .map(|i| self.word(i).load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Reset every bit by remapping the backing pages
    pub fn clear(&self) -> Result<()> {
        self.mapping.discard(0, self.mapping.size())
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Bytes of backing store
    pub fn memory_usage(&self) -> usize {
        self.mapping.size()
    }
}

impl std::fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkBitmap")
            .field("base", &format_args!("{:#x}", self.base))
            .field("limit", &format_args!("{:#x}", self.limit))
            .field("granularity", &self.granularity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10_0000;

    #[test]
    fn test_mark_is_test_and_set() {
        let bitmap = MarkBitmap::new(BASE, BASE + 4096, 8).unwrap();
        assert!(!bitmap.is_marked(BASE + 64));
        assert!(bitmap.mark(BASE + 64));
        assert!(!bitmap.mark(BASE + 64));
        assert!(bitmap.is_marked(BASE + 64));
        assert!(!bitmap.is_marked(BASE + 72));
        assert_eq!(bitmap.count_marked(), 1);
    }

    #[test]
    fn test_out_of_range_never_marked() {
        let bitmap = MarkBitmap::new(BASE, BASE + 4096, 8).unwrap();
        assert!(!bitmap.mark(BASE - 8));
        assert!(!bitmap.mark(BASE + 4096));
        assert_eq!(bitmap.count_marked(), 0);
    }

    #[test]
    fn test_word_boundaries() {
        let bitmap = MarkBitmap::new(BASE, BASE + 8 * 256, 8).unwrap();
        for granule in [0, 63, 64, 127, 128, 255] {
            assert!(bitmap.mark(BASE + granule * 8));
        }
        assert_eq!(bitmap.count_marked(), 6);
        assert!(bitmap.is_marked(BASE + 63 * 8));
        assert!(!bitmap.is_marked(BASE + 62 * 8));
    }

    #[test]
    fn test_clear() {
        let bitmap = MarkBitmap::new(BASE, BASE + (1 << 20), 8).unwrap();
        for i in 0..1000 {
            bitmap.mark(BASE + i * 64);
        }
        assert_eq!(bitmap.count_marked(), 1000);
        bitmap.clear().unwrap();
        assert_eq!(bitmap.count_marked(), 0);
        assert!(bitmap.mark(BASE));
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(MarkBitmap::new(BASE, BASE, 8).is_err());
        assert!(MarkBitmap::new(BASE, BASE + 64, 12).is_err());
    }
}
