//! Object Copying
//!
//! Copy Strategy:
//! 1. Allocate space in the destination semispace
//! 2. Copy the object bytes (memcpy)
//! 3. Caller installs the forwarding record over the source
//!
//! Copying happens with every mutator paused, so no barrier or lock is
//! involved: the source cannot change underneath the copy.

use crate::heap::Region;
use crate::object::header::ObjectRef;
use std::ptr;

/// ObjectCopier - byte copier with running totals
#[derive(Debug, Default)]
pub struct ObjectCopier {
    bytes_copied: usize,
    objects_copied: usize,
}

impl ObjectCopier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `size` bytes of `source` into `destination`
    ///
    /// Returns the copy, or `None` if the destination is full.
    pub fn copy_object(
        &mut self,
        source: ObjectRef,
        size: usize,
        destination: &Region,
    ) -> Option<ObjectRef> {
        let target = destination.allocate(size)?;
        // SAFETY: `source` spans `size` bytes; `target` is a fresh block of
        // at least `size` bytes in a different semispace.
        unsafe {
            ptr::copy_nonoverlapping(source.addr() as *const u8, target as *mut u8, size);
        }
        self.bytes_copied += size;
        self.objects_copied += 1;
        // SAFETY: an exact copy of a valid object.
        unsafe { ObjectRef::from_raw(target) }
    }

    pub fn bytes_copied(&self) -> usize {
        self.bytes_copied
    }

    pub fn objects_copied(&self) -> usize {
        self.objects_copied
    }
}
