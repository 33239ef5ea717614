//! Memory Mapping - Anonymous Mappings over memmap2
//!
//! The heap reservation and the mark bitmap are both anonymous, zero-filled
//! mappings. Giving pages back is done by mapping fresh anonymous memory over
//! them at the same address (`MAP_FIXED`), which drops the old frames and
//! leaves zero-fill-on-demand pages in place without moving the range.

use crate::error::{Result, SgcError};
use crate::heap::page::{align_to_page, is_page_aligned};
use memmap2::{MmapMut, MmapOptions};

/// Anonymous read/write mapping with a stable base address
pub struct MemoryMapping {
    /// Keeps the mapping alive; unmapped on drop
    _mmap: MmapMut,

    /// Base address of the mapping
    base: usize,

    /// Size of the mapping in bytes (page aligned)
    size: usize,
}

impl MemoryMapping {
    /// Create an anonymous, zero-filled mapping
    ///
    /// `size` is rounded up to the page size.
    pub fn anonymous(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SgcError::InvalidArgument(
                "mapping size must be non-zero".to_string(),
            ));
        }
        let aligned_size = align_to_page(size);

        let mut mmap = MmapOptions::new()
            .len(aligned_size)
            .map_anon()
            .map_err(|e| {
                SgcError::VirtualMemory(format!("Failed to create anonymous mapping: {}", e))
            })?;

        let base = mmap.as_mut_ptr() as usize;

        Ok(Self {
            _mmap: mmap,
            base,
            size: aligned_size,
        })
    }

    /// Get base address
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Get size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last mapped byte
    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Check if address is inside this mapping
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Raw pointer to the first byte
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base as *mut u8
    }

    /// Return `[offset, offset + len)` to the OS and leave zero pages behind
    ///
    /// Both bounds must be page aligned. The caller guarantees that no other
    /// thread touches the range while it is being replaced.
    pub fn discard(&self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if !is_page_aligned(offset) || !is_page_aligned(len) {
            return Err(SgcError::InvalidArgument(format!(
                "discard range {:#x}+{:#x} is not page aligned",
                offset, len
            )));
        }
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(SgcError::InvalidArgument(format!(
                "discard range {:#x}+{:#x} exceeds mapping of {:#x} bytes",
                offset, len, self.size
            )));
        }

        remap_zeroed(self.base + offset, len)
    }
}

// SAFETY: the mapping is plain memory; synchronization of its contents is
// the responsibility of the structures built on top of it.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

impl std::fmt::Debug for MemoryMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMapping")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(unix)]
fn remap_zeroed(addr: usize, len: usize) -> Result<()> {
    // SAFETY: [addr, addr + len) lies inside a mapping we own; MAP_FIXED
    // replaces exactly that range with fresh anonymous pages.
    let result = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if result == libc::MAP_FAILED || result as usize != addr {
        return Err(SgcError::VirtualMemory(format!(
            "fixed remap of {:#x}+{:#x} failed: {}",
            addr,
            len,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn remap_zeroed(addr: usize, len: usize) -> Result<()> {
    // SAFETY: the range lies inside a mapping we own.
    unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
    Ok(())
}
