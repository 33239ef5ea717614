//! Reference Fix-Up
//!
//! After relocation, every location that survived the collection is walked
//! again and each reference to a forwarded object is replaced with the
//! forwarding address:
//!
//! - permanent regions, object by object
//! - the destination semispace, whose copies still point at old locations
//! - thread stacks, through the same walker used for marking
//! - each thread's managed thread object slot
//! - registered global slots
//!
//! Stack-allocated objects are never copied. The first reference that
//! reaches one queues it, and its own fields are fixed in place exactly
//! once, so cycles through stack objects terminate.

use crate::error::Result;
use crate::heap::{Heap, Region};
use crate::marker::{ExecutionContext, RootTable, StackWalker};
use crate::object::header::ObjectRef;
use crate::object::refmap::{ArrayElements, LiveValues, ValueCursor};
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixer - one fix-up pass
pub struct Fixer<'h> {
    heap: &'h Heap,
    stack_visited: FxHashSet<usize>,
    stack_pending: Vec<ObjectRef>,
    updated: usize,
}

impl<'h> Fixer<'h> {
    pub fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            stack_visited: FxHashSet::default(),
            stack_pending: Vec::new(),
            updated: 0,
        }
    }

    /// Forwarding address for `raw`, queueing stack objects on first sight
    fn forward(&mut self, raw: usize) -> Result<Option<usize>> {
        let object = self.heap.resolve(raw)?;
        if let Some(new) = object.forwardee() {
            self.updated += 1;
            return Ok(Some(new.addr()));
        }
        if object.is_stack_allocated() && self.stack_visited.insert(object.addr()) {
            self.stack_pending.push(object);
        }
        Ok(None)
    }

    fn fix_cursor(&mut self, cursor: &mut impl ValueCursor) -> Result<()> {
        while let Some(value) = cursor.next_value() {
            if let Some(new) = self.forward(value)? {
                cursor.set_current(new)?;
            }
        }
        Ok(())
    }

    /// Fix the reference fields of one object
    pub fn update_object(&mut self, object: ObjectRef) -> Result<()> {
        self.fix_cursor(&mut LiveValues::for_object(Some(object)))?;
        self.fix_cursor(&mut ArrayElements::for_object(object))
    }

    fn drain_stack_objects(&mut self) -> Result<()> {
        while let Some(object) = self.stack_pending.pop() {
            self.update_object(object)?;
        }
        Ok(())
    }

    /// Fix every object in `region`
    pub fn update_region(&mut self, region: &Region) -> Result<()> {
        for object in self.heap.objects(region) {
            self.update_object(object?)?;
        }
        self.drain_stack_objects()
    }

    /// Fix the frames of one paused thread
    pub fn update_stack(
        &mut self,
        walker: &dyn StackWalker,
        context: &ExecutionContext,
    ) -> Result<()> {
        let mut failure = None;
        walker.walk(context, &mut |values| {
            if failure.is_none() {
                if let Err(err) = self.fix_cursor(values) {
                    failure = Some(err);
                }
            }
        });
        match failure {
            Some(err) => Err(err),
            None => self.drain_stack_objects(),
        }
    }

    /// Fix a single root slot
    ///
    /// Returns `true` if the slot was rewritten.
    pub fn update_slot(&mut self, slot: &AtomicUsize) -> Result<bool> {
        let value = slot.load(Ordering::Relaxed);
        if value == 0 {
            return Ok(false);
        }
        let updated = match self.forward(value)? {
            Some(new) => {
                slot.store(new, Ordering::Relaxed);
                true
            }
            None => false,
        };
        self.drain_stack_objects()?;
        Ok(updated)
    }

    /// Fix a thread's managed thread object slot
    #[inline]
    pub fn update_thread_object(&mut self, slot: &AtomicUsize) -> Result<bool> {
        self.update_slot(slot)
    }

    /// Fix every registered global slot
    pub fn update_globals(&mut self, roots: &RootTable) -> Result<()> {
        roots.for_each_slot(|slot| self.update_slot(slot).map(|_| ()))
    }

    /// References rewritten so far
    pub fn updated(&self) -> usize {
        self.updated
    }
}
