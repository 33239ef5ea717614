//! Stack-Allocated Objects
//!
//! Objects the compiler proved do not escape live outside the heap, in the
//! allocating frame. Their header carries `STACK_ALLOCATED`: the collector
//! traces through them and fixes their fields in place, but never copies
//! them and never sets a mark bit for them.

use crate::error::{Result, SgcError};
use crate::object::class::{ClassRef, ObjectKind};
use crate::object::header::{Header, ObjectRef, WORD_SIZE};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// An instance living in its own buffer outside the heap
pub struct StackObject {
    object: ObjectRef,
    layout: Layout,
}

impl StackObject {
    /// Zeroed instance of `class`
    pub fn new(class: ClassRef) -> Result<Self> {
        if class.instance_kind() != ObjectKind::Instance {
            return Err(SgcError::InvalidArgument(
                "only plain instances can be stack allocated".to_string(),
            ));
        }
        let layout = Layout::from_size_align(class.instance_size(), WORD_SIZE)
            .map_err(|e| SgcError::InvalidArgument(e.to_string()))?;
        // SAFETY: instance sizes are never zero.
        let Some(ptr) = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }) else {
            alloc::handle_alloc_error(layout);
        };
        // SAFETY: fresh, aligned, zeroed buffer of the instance size.
        let object = unsafe { ObjectRef::from_non_null(ptr.addr()) };
        object.set_header(Header::new(class).with_stack_allocated());
        Ok(Self { object, layout })
    }

    #[inline]
    pub fn object(&self) -> ObjectRef {
        self.object
    }
}

impl Drop for StackObject {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.object.addr() as *mut u8, self.layout) };
    }
}

impl std::fmt::Debug for StackObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StackObject").field(&self.object).finish()
    }
}
