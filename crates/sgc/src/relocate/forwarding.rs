//! Forwarding - Redirecting Stale References
//!
//! A relocated object's old location holds `{header | MOVED, new address}`.
//! Any slot still pointing at the old location is stale; updating it means
//! replacing its value with the forwarding address.

use crate::error::Result;
use crate::heap::Heap;
use crate::object::header::ObjectRef;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Overwrite `from` with a forwarding record to `to`
///
/// `to` must already hold a full copy of `from`.
#[inline]
pub fn install_forwarding(from: ObjectRef, to: ObjectRef) {
    from.forward_to(to);
}

/// New address of the object at `raw`, if it was relocated
pub fn forwarding_address(heap: &Heap, raw: usize) -> Result<Option<usize>> {
    if raw == 0 {
        return Ok(None);
    }
    Ok(heap.resolve(raw)?.forwardee().map(ObjectRef::addr))
}

/// Rewrite `slot` if it points at a relocated object
///
/// Returns `true` if the slot was changed. Null slots and slots whose target
/// did not move are left untouched.
pub fn update_reference(heap: &Heap, slot: &AtomicUsize) -> Result<bool> {
    match forwarding_address(heap, slot.load(Ordering::Relaxed))? {
        Some(new) => {
            slot.store(new, Ordering::Relaxed);
            Ok(true)
        }
        None => Ok(false),
    }
}
