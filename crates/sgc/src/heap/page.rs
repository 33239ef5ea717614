//! Page Helpers - OS Page Size and Alignment
//!
//! Regions, the mark bitmap and the fixed-address remap all work at page
//! granularity; everything here derives from the cached OS page size.

use std::sync::atomic::{AtomicUsize, Ordering};

/// System page size (cached)
static SYSTEM_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Get system page size
///
/// Queries the OS once and caches the result.
pub fn page_size() -> usize {
    let cached = SYSTEM_PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    let size = page_size::get();
    SYSTEM_PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Align size to page boundary (round up)
pub fn align_to_page(size: usize) -> usize {
    align_up(size, page_size())
}

/// Check if address is page-aligned
pub fn is_page_aligned(addr: usize) -> bool {
    addr % page_size() == 0
}

/// Round `value` up to `align`, which must be a power of two.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Check that `value` is a multiple of `align` (a power of two).
#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}
