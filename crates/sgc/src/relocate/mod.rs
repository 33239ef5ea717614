//! Relocate Module - Evacuation and Reference Fix-Up
//!
//! Relocation runs after marking, with the world still stopped:
//!
//! ```text
//!   active semispace (from)            spare semispace (to)
//!   ┌───┬───┬───┬───┬───┐              ┌───┬───┬───┐
//!   │ A │ x │ B │ x │ C │  ──copy──▶   │ A'│ B'│ C'│
//!   └───┴───┴───┴───┴───┘              └───┴───┴───┘
//!     │       │       │
//!     └── {header|MOVED, A'} ... forwarding records left behind
//! ```
//!
//! The source semispace is walked linearly; every marked object is copied
//! and its old location overwritten with a forwarding record. Unmarked
//! objects (`x`) are skipped and die with the semispace. The [`Fixer`] then
//! rewrites every stale reference, after which the source semispace holds
//! nothing reachable and can be discarded.

pub mod copy;
pub mod fixup;
pub mod forwarding;

pub use copy::ObjectCopier;
pub use fixup::Fixer;
pub use forwarding::{forwarding_address, install_forwarding, update_reference};

use crate::error::{Result, SgcError};
use crate::heap::{Heap, Region};
use crate::marker::MarkBitmap;
use serde::Serialize;

/// Counters for one relocation phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelocationStats {
    /// Objects copied into the destination
    pub objects_copied: usize,
    /// Bytes copied into the destination
    pub bytes_copied: usize,
    /// Unmarked objects left behind
    pub objects_skipped: usize,
}

/// Relocator - evacuates the marked objects of one semispace
pub struct Relocator<'h> {
    heap: &'h Heap,
    bitmap: &'h MarkBitmap,
    copier: ObjectCopier,
}

impl<'h> Relocator<'h> {
    pub fn new(heap: &'h Heap, bitmap: &'h MarkBitmap) -> Self {
        Self {
            heap,
            bitmap,
            copier: ObjectCopier::new(),
        }
    }

    /// Copy every marked object of `from` into `to`
    ///
    /// `to` must be empty. Its soft limit is lifted to full capacity first:
    /// the live set of `from` always fits in one semispace.
    pub fn relocate(&mut self, from: &Region, to: &Region) -> Result<RelocationStats> {
        if to.used() != 0 {
            return Err(SgcError::InvalidState {
                expected: "empty destination semispace".to_string(),
                actual: format!("{} bytes in use", to.used()),
            });
        }
        to.set_limit(to.capacity());

        let mut skipped = 0;
        for object in self.heap.objects(from) {
            let object = object?;
            if !self.bitmap.is_marked(object.addr()) {
                skipped += 1;
                continue;
            }
            let size = self.heap.aligned_size(object);
            let copy = self.copier.copy_object(object, size, to).ok_or_else(|| {
                SgcError::Internal(format!(
                    "destination '{}' overflowed copying {} bytes at {:#x}",
                    to.name(),
                    size,
                    object.addr()
                ))
            })?;
            install_forwarding(object, copy);
        }

        Ok(RelocationStats {
            objects_copied: self.copier.objects_copied(),
            bytes_copied: self.copier.bytes_copied(),
            objects_skipped: skipped,
        })
    }
}
