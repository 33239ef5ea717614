//! Stack Scanning - Frames of Paused Threads
//!
//! A thread records an [`ExecutionContext`] each time it enters a
//! safepoint. The collector hands that context to a [`StackWalker`], which
//! yields one [`LiveValues`] cursor per frame over the frame's live
//! reference slots. Marking reads through the cursor; fix-up writes back
//! through it.
//!
//! The default walker follows the runtime's shadow stack of
//! [`FrameRecord`]s. A native unwinder can be plugged in instead with
//! `Runtime::with_stack_walker`.

use crate::object::refmap::LiveValues;
use crate::runtime::frames::FrameRecord;

/// Execution state saved when a thread enters a safepoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Innermost shadow-stack frame, or 0
    pub frame_head: usize,
    /// Approximate native stack pointer at entry
    pub stack_pointer: usize,
}

impl ExecutionContext {
    /// Capture the calling thread's context
    #[inline(never)]
    pub fn capture(frame_head: *const FrameRecord) -> Self {
        let marker = 0u8;
        Self {
            frame_head: frame_head as usize,
            stack_pointer: std::hint::black_box(&marker) as *const u8 as usize,
        }
    }

    /// Check if there are no frames to scan
    pub fn is_empty(&self) -> bool {
        self.frame_head == 0
    }
}

/// Walks the frames described by a saved context
pub trait StackWalker: Send + Sync {
    /// Call `visit` once per frame, innermost first
    ///
    /// Only called while the owning thread is paused in a safepoint.
    fn walk(&self, context: &ExecutionContext, visit: &mut dyn FnMut(&mut LiveValues));
}

/// Walker over the runtime's shadow stack
#[derive(Debug, Default, Clone, Copy)]
pub struct ShadowStackWalker;

impl StackWalker for ShadowStackWalker {
    fn walk(&self, context: &ExecutionContext, visit: &mut dyn FnMut(&mut LiveValues)) {
        let mut frame = context.frame_head as *const FrameRecord;
        while !frame.is_null() {
            // SAFETY: frames stay linked and alive while their thread is
            // paused; they are only popped by the owner once it resumes.
            let record = unsafe { &*frame };
            visit(&mut record.live_values());
            frame = record.prev();
        }
    }
}

/// Summary of one frame, as captured by a stack-trace safepoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FrameSummary {
    /// Non-null reference slots in the frame
    pub live_references: usize,
}

/// Summaries of every frame described by `context`, innermost first
pub fn summarize(walker: &dyn StackWalker, context: &ExecutionContext) -> Vec<FrameSummary> {
    let mut frames = Vec::new();
    walker.walk(context, &mut |values| {
        frames.push(FrameSummary {
            live_references: values.count(),
        });
    });
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_context() {
        let context = ExecutionContext::capture(std::ptr::null());
        assert!(context.is_empty());
        assert_ne!(context.stack_pointer, 0);
        assert!(summarize(&ShadowStackWalker, &context).is_empty());
    }
}
