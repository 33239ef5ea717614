//! Shadow Stack Frames
//!
//! Managed code keeps references it holds across poll points in
//! [`LocalFrame`]s. Each frame is a [`FrameRecord`] linked to the one below
//! it; the thread's innermost record is captured in its execution context
//! when it enters a safepoint, and the collector walks the chain from
//! there.
//!
//! A frame has at most 64 slots, described by one live-slot bitmap word.
//! Writing a reference sets the slot's bit, writing null clears it.

use crate::error::{Result, SgcError};
use crate::object::header::ObjectRef;
use crate::object::refmap::LiveValues;
use crate::runtime::thread::ThreadControl;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Most slots one frame can hold
pub const MAX_FRAME_SLOTS: usize = 64;

/// One shadow-stack frame
#[repr(C)]
pub struct FrameRecord {
    prev: *const FrameRecord,
    slots: Box<[AtomicUsize]>,
    live: AtomicU64,
}

impl FrameRecord {
    fn new(prev: *const FrameRecord, slots: usize) -> Self {
        Self {
            prev,
            slots: (0..slots).map(|_| AtomicUsize::new(0)).collect(),
            live: AtomicU64::new(0),
        }
    }

    /// Cursor over the frame's live reference slots
    pub fn live_values(&self) -> LiveValues {
        // SAFETY: every bit of `live` names one of `slots`, which outlive
        // the cursor while the owning thread stays paused.
        unsafe {
            LiveValues::over_words(
                self.slots.as_ptr() as *mut usize,
                self.live.load(Ordering::Acquire),
                ptr::null(),
                0,
            )
        }
    }

    /// Next frame towards the bottom of the stack, or null
    #[inline]
    pub fn prev(&self) -> *const FrameRecord {
        self.prev
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A frame of reference slots on the current thread's shadow stack
///
/// Popped on drop. Frames are strictly nested and stay on the thread that
/// pushed them.
pub struct LocalFrame<'t> {
    thread: &'t ThreadControl,
    record: Box<FrameRecord>,
    _not_send: PhantomData<*const ()>,
}

impl<'t> LocalFrame<'t> {
    pub(crate) fn push(thread: &'t ThreadControl, slots: usize) -> Result<Self> {
        if slots > MAX_FRAME_SLOTS {
            return Err(SgcError::InvalidArgument(format!(
                "frame of {} slots exceeds the maximum of {}",
                slots, MAX_FRAME_SLOTS
            )));
        }
        let record = Box::new(FrameRecord::new(thread.frame_head(), slots));
        thread.set_frame_head(&*record);
        Ok(Self {
            thread,
            record,
            _not_send: PhantomData,
        })
    }

    fn slot(&self, index: usize) -> Result<&AtomicUsize> {
        self.record.slots.get(index).ok_or_else(|| {
            SgcError::InvalidArgument(format!(
                "slot {} out of range for a frame of {}",
                index,
                self.record.len()
            ))
        })
    }

    /// Reference held in slot `index`
    ///
    /// Read it again after any poll point: a collection may have moved it.
    pub fn get(&self, index: usize) -> Result<Option<ObjectRef>> {
        let raw = self.slot(index)?.load(Ordering::Acquire);
        // SAFETY: slots only ever hold null or a reference stored through
        // `set`, kept current by fix-up.
        Ok(unsafe { ObjectRef::from_raw(raw) })
    }

    /// Store `value` in slot `index`
    pub fn set(&self, index: usize, value: Option<ObjectRef>) -> Result<()> {
        let slot = self.slot(index)?;
        let bit = 1u64 << index;
        match value {
            Some(object) => {
                slot.store(object.addr(), Ordering::Release);
                self.record.live.fetch_or(bit, Ordering::Release);
            }
            None => {
                self.record.live.fetch_and(!bit, Ordering::Release);
                slot.store(0, Ordering::Release);
            }
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.record.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.record.is_empty()
    }
}

impl Drop for LocalFrame<'_> {
    fn drop(&mut self) {
        let this: *const FrameRecord = &*self.record;
        debug_assert_eq!(self.thread.frame_head(), this, "frames popped out of order");
        self.thread.set_frame_head(self.record.prev);
    }
}

impl std::fmt::Debug for LocalFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFrame")
            .field("slots", &self.len())
            .field("live", &format_args!("{:#b}", self.record.live.load(Ordering::Relaxed)))
            .finish()
    }
}
