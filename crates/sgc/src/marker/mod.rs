//! Marker Module - Roots-to-Closure Tracing
//!
//! Marking runs on the coordinator thread with every mutator paused. It is
//! a depth-first trace driven by an explicit worklist, so deep or cyclic
//! graphs never grow the native stack.
//!
//! # Roots
//!
//! 1. **Thread stacks** - each paused thread's saved context, via the
//!    configured [`StackWalker`], plus its managed thread object
//! 2. **Permanent regions** - every object in the class, image and string
//!    regions
//! 3. **Global roots** - the registered [`RootTable`] slots
//!
//! Heap objects are recorded in the [`MarkBitmap`]. Stack-allocated objects
//! have no mark bit; they are traced once each through a visited set.
//!
//! Any reference that fails validation is reported as
//! [`SgcError::HeapCorruption`]; the coordinator treats that as fatal.

pub mod bitmap;
pub mod roots;
pub mod stack_scan;

pub use bitmap::MarkBitmap;
pub use roots::RootTable;
pub use stack_scan::{ExecutionContext, ShadowStackWalker, StackWalker};

use crate::error::{Result, SgcError};
use crate::heap::{Heap, Region};
use crate::object::header::ObjectRef;
use crate::object::refmap::{ArrayElements, LiveValues, ValueCursor};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters for one mark phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MarkStats {
    /// Heap objects newly marked
    pub objects_marked: usize,
    /// Sum of their aligned sizes
    pub bytes_marked: usize,
    /// Stack-allocated objects traced
    pub stack_objects: usize,
    /// Non-null root slots visited
    pub roots: usize,
}

/// Marker - one trace over the heap
pub struct Marker<'h> {
    heap: &'h Heap,
    bitmap: &'h MarkBitmap,
    worklist: Vec<ObjectRef>,
    stack_visited: FxHashSet<usize>,
    stats: MarkStats,
}

impl<'h> Marker<'h> {
    pub fn new(heap: &'h Heap, bitmap: &'h MarkBitmap) -> Self {
        Self {
            heap,
            bitmap,
            worklist: Vec::with_capacity(256),
            stack_visited: FxHashSet::default(),
            stats: MarkStats::default(),
        }
    }

    /// Mark `raw` and everything reachable from it
    ///
    /// Returns `true` if `raw` itself was newly marked by this call.
    pub fn mark(&mut self, raw: usize) -> Result<bool> {
        let newly_marked = self.mark_one(raw)?;
        self.drain()?;
        Ok(newly_marked)
    }

    /// Set the mark for one reference and queue it for tracing
    fn mark_one(&mut self, raw: usize) -> Result<bool> {
        if raw == 0 {
            return Ok(false);
        }
        let object = self.heap.resolve(raw)?;
        if object.is_moved() {
            return Err(SgcError::corruption(raw, "forwarded object reached while marking"));
        }

        let newly_marked = if self.heap.is_heap_object(object) {
            let newly = self.bitmap.mark(object.addr());
            if newly {
                self.stats.objects_marked += 1;
                self.stats.bytes_marked += self.heap.aligned_size(object);
            }
            newly
        } else if object.is_stack_allocated() {
            let newly = self.stack_visited.insert(object.addr());
            if newly {
                self.stats.stack_objects += 1;
            }
            newly
        } else {
            // The meta class: static, nothing to trace.
            false
        };

        if newly_marked {
            self.worklist.push(object);
        }
        Ok(newly_marked)
    }

    fn mark_cursor(&mut self, cursor: &mut impl ValueCursor) -> Result<()> {
        while let Some(value) = cursor.next_value() {
            self.mark_one(value)?;
        }
        Ok(())
    }

    /// Trace everything queued so far
    pub fn drain(&mut self) -> Result<()> {
        while let Some(object) = self.worklist.pop() {
            self.mark_cursor(&mut LiveValues::for_object(Some(object)))?;
            self.mark_cursor(&mut ArrayElements::for_object(object))?;
        }
        Ok(())
    }

    /// Treat every object in `region` as a root
    pub fn mark_region(&mut self, region: &Region) -> Result<()> {
        for object in self.heap.objects(region) {
            self.stats.roots += 1;
            self.mark(object?.addr())?;
        }
        Ok(())
    }

    /// Mark from the frames of one paused thread
    pub fn mark_stack(
        &mut self,
        walker: &dyn StackWalker,
        context: &ExecutionContext,
    ) -> Result<()> {
        let mut failure = None;
        walker.walk(context, &mut |values| {
            if failure.is_some() {
                return;
            }
            while let Some(value) = values.next_value() {
                self.stats.roots += 1;
                if let Err(err) = self.mark_one(value) {
                    failure = Some(err);
                    return;
                }
            }
        });
        match failure {
            Some(err) => Err(err),
            None => self.drain(),
        }
    }

    /// Mark from a single root slot
    pub fn mark_slot(&mut self, slot: &AtomicUsize) -> Result<()> {
        let value = slot.load(Ordering::Relaxed);
        if value != 0 {
            self.stats.roots += 1;
            self.mark(value)?;
        }
        Ok(())
    }

    /// Mark from every registered global slot
    pub fn mark_globals(&mut self, roots: &RootTable) -> Result<()> {
        roots.for_each_slot(|slot| self.mark_slot(slot))
    }

    pub fn stats(&self) -> MarkStats {
        self.stats
    }
}
