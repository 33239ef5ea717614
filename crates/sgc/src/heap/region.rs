//! Region - Page-Aligned Span with an Atomic Bump Cursor
//!
//! A region is the unit of heap space: the two semispaces and the three
//! permanent regions are all `Region`s carved out of one reservation.
//!
//! Allocation is a compare-and-swap on `position`, so concurrent mutators
//! never receive overlapping ranges. The soft `limit` lets the heap start
//! small inside a semispace and grow up to `capacity` after collections.

use crate::error::{Result, SgcError};
use crate::heap::page::{align_up, is_page_aligned};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Region - contiguous span `[start, start + capacity)` with a bump cursor
pub struct Region {
    name: &'static str,
    start: usize,
    capacity: usize,
    /// Current allocation limit in bytes, `<= capacity`
    limit: AtomicUsize,
    /// Offset of the next free byte
    position: AtomicUsize,
    alignment: usize,
}

impl Region {
    /// Create a region over `[start, start + size)`
    ///
    /// Rejects a start that is not page aligned, a zero size, or an alignment
    /// that is not a power of two.
    pub fn new(name: &'static str, start: usize, size: usize, alignment: usize) -> Result<Self> {
        if size == 0 {
            return Err(SgcError::InvalidArgument(format!(
                "region '{}' must have a non-zero size",
                name
            )));
        }
        if !is_page_aligned(start) {
            return Err(SgcError::InvalidArgument(format!(
                "region '{}' start {:#x} is not page aligned",
                name, start
            )));
        }
        if !alignment.is_power_of_two() {
            return Err(SgcError::InvalidArgument(format!(
                "alignment ({}) must be a power of two",
                alignment
            )));
        }
        if start.checked_add(size).is_none() {
            return Err(SgcError::InvalidArgument(format!(
                "region '{}' wraps the address space",
                name
            )));
        }

        Ok(Self {
            name,
            start,
            capacity: size,
            limit: AtomicUsize::new(size),
            position: AtomicUsize::new(0),
            alignment,
        })
    }

    /// Allocate `size` bytes, rounded up to the object alignment
    ///
    /// Returns the address of the allocated block, or `None` when the
    /// request does not fit under the current limit.
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<usize> {
        let limit = self.limit.load(Ordering::Acquire);
        // Can never fit: don't bother with the CAS loop.
        if size > limit {
            return None;
        }
        let rounded = align_up(size, self.alignment);

        let mut current = self.position.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(rounded)?;
            if next > limit {
                return None;
            }
            match self.position.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(self.start + current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Allocate, raising the soft limit towards capacity if needed
    pub fn allocate_growing(&self, size: usize) -> Option<usize> {
        if let Some(addr) = self.allocate(size) {
            return Some(addr);
        }
        let needed = self
            .position
            .load(Ordering::Relaxed)
            .checked_add(align_up(size, self.alignment))?;
        if needed > self.capacity {
            return None;
        }
        self.limit.fetch_max(needed, Ordering::AcqRel);
        self.allocate(size)
    }

    /// Forget every allocation
    ///
    /// Only valid once nothing in the region is live, i.e. right after it
    /// stopped being the active semispace.
    pub fn reset(&self) {
        self.position.store(0, Ordering::Release);
    }

    /// Set the soft limit, clamped to `[used(), capacity]`
    pub fn set_limit(&self, limit: usize) -> usize {
        let clamped = limit.clamp(self.used(), self.capacity);
        self.limit.store(clamped, Ordering::Release);
        clamped
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// First byte of the region
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last byte the region may ever use
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.capacity
    }

    /// One past the last allocated byte
    #[inline]
    pub fn top(&self) -> usize {
        self.start + self.position.load(Ordering::Acquire)
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.position.load(Ordering::Acquire)
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes left under the current limit
    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.used())
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Check if `addr` lies in the allocated part of the region
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.top()
    }

    /// Check if `addr` lies anywhere in the region's span
    #[inline]
    pub fn spans(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("start", &format_args!("{:#x}", self.start))
            .field("used", &self.used())
            .field("limit", &self.limit())
            .field("capacity", &self.capacity)
            .finish()
    }
}
