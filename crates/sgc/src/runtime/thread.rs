//! Thread Control Blocks and the Safepoint Protocol
//!
//! Each registered thread owns a [`ThreadControl`]: an atomic state word
//! (see [`ThreadState`]) plus one mutex and two condition variables.
//!
//! - **inbound** - other threads signal this one (requests, releases,
//!   unpark, interrupt)
//! - **outbound** - this thread signals others (entered or left a
//!   safepoint)
//!
//! ## Protocol
//!
//! ```text
//!  requester                              target
//!  ─────────                              ──────
//!  request_safepoint(reason)
//!    state |= reason | REQUEST  ───────▶  poll_safepoint(): state < 0
//!    notify inbound                         enter_safepoint()
//!                                             save context
//!  await_safepoint()            ◀───────      state |= IN_SAFEPOINT
//!    until IN_SAFEPOINT                       notify outbound
//!  ... inspect / move the heap ...          exit_safepoint()
//!  release_safepoint(reason)                  wait inbound while REQUEST
//!    state &= !reason                 ───▶    state &= !IN_SAFEPOINT
//!    REQUEST cleared with last reason         notify outbound
//!    notify inbound
//! ```
//!
//! State transitions are lock-free CAS loops. The mutex only guards
//! condition-variable waits: every notifier takes it after changing the
//! word, and every waiter re-checks the word while holding it, so no wake
//! is lost and none is relied on for correctness.
//!
//! Blocking operations (park, sleep, monitor waits) run inside a safepoint,
//! so a blocked thread never needs to be woken to be collected.

use crate::error::{Result, SgcError};
use crate::marker::ExecutionContext;
use crate::object::header::ObjectRef;
use crate::runtime::frames::{FrameRecord, LocalFrame};
use crate::runtime::state::{SafepointReason, ThreadState, WaitReason};
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Registry links, only touched under the registry lock
pub(crate) struct Links {
    pub(crate) next: *const ThreadControl,
    pub(crate) prev: *const ThreadControl,
}

/// ThreadControl - native control block of one OS thread
pub struct ThreadControl {
    pub(crate) links: UnsafeCell<Links>,
    id: u64,
    os_thread: Thread,
    name: Option<String>,
    /// Managed thread object; a root, rewritten by fix-up
    managed: AtomicUsize,
    lock: Mutex<()>,
    inbound: Condvar,
    outbound: Condvar,
    state: AtomicU32,
    context: Mutex<ExecutionContext>,
    frames: AtomicPtr<FrameRecord>,
}

// SAFETY: `links` is only accessed under the registry lock and `frames`
// only by the owning thread or by the collector while the owner is paused.
unsafe impl Send for ThreadControl {}
// SAFETY: as above.
unsafe impl Sync for ThreadControl {}

impl ThreadControl {
    /// Control block for the calling OS thread, ALIVE and RUNNABLE
    pub(crate) fn new(id: u64, name: Option<String>) -> Self {
        Self {
            links: UnsafeCell::new(Links {
                next: ptr::null(),
                prev: ptr::null(),
            }),
            id,
            os_thread: thread::current(),
            name,
            managed: AtomicUsize::new(0),
            lock: Mutex::new(()),
            inbound: Condvar::new(),
            outbound: Condvar::new(),
            state: AtomicU32::new(ThreadState::ALIVE | ThreadState::RUNNABLE),
            context: Mutex::new(ExecutionContext::default()),
            frames: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Handle of the OS thread this block belongs to
    pub fn os_thread(&self) -> &Thread {
        &self.os_thread
    }

    /// Check if the calling thread owns this block
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.os_thread.id()
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_bits(self.state.load(Ordering::Acquire))
    }

    /// Context saved when the thread last entered a safepoint
    pub fn context(&self) -> ExecutionContext {
        *self.context.lock()
    }

    /// Set bits `set` and clear bits `clear` in one CAS loop
    fn update_state(&self, set: u32, clear: u32) -> ThreadState {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = (current & !clear) | set;
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ThreadState::from_bits(next),
                Err(actual) => current = actual,
            }
        }
    }

    fn notify_inbound(&self) {
        let _guard = self.lock.lock();
        self.inbound.notify_all();
    }

    fn notify_outbound(&self) {
        let _guard = self.lock.lock();
        self.outbound.notify_all();
    }

    // ========================================================================
    // MANAGED THREAD OBJECT
    // ========================================================================

    pub fn managed_object(&self) -> Option<ObjectRef> {
        // SAFETY: the slot holds null or a reference kept current by fix-up.
        unsafe { ObjectRef::from_raw(self.managed.load(Ordering::Acquire)) }
    }

    pub fn set_managed_object(&self, object: Option<ObjectRef>) {
        self.managed
            .store(object.map_or(0, ObjectRef::addr), Ordering::Release);
    }

    pub(crate) fn managed_slot(&self) -> &AtomicUsize {
        &self.managed
    }

    // ========================================================================
    // SHADOW STACK
    // ========================================================================

    /// Push a frame of `slots` reference slots
    ///
    /// Only the owning thread may push frames.
    pub fn push_frame(&self, slots: usize) -> Result<LocalFrame<'_>> {
        if !self.is_current() {
            return Err(SgcError::InvalidState {
                expected: format!("owner of thread {}", self.id),
                actual: format!("{:?}", thread::current().id()),
            });
        }
        LocalFrame::push(self, slots)
    }

    #[inline]
    pub(crate) fn frame_head(&self) -> *const FrameRecord {
        self.frames.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_frame_head(&self, frame: *const FrameRecord) {
        self.frames.store(frame as *mut FrameRecord, Ordering::Release);
    }

    // ========================================================================
    // SAFEPOINT PROTOCOL
    // ========================================================================

    /// Ask this thread to pause for `reason`
    ///
    /// Returns `false` if a request for the same reason was already
    /// outstanding.
    pub fn request_safepoint(&self, reason: SafepointReason) -> bool {
        let bits = reason.bit() | ThreadState::SAFEPOINT_REQUEST;
        let previous = self.state.fetch_or(bits, Ordering::AcqRel);
        if previous & reason.bit() != 0 {
            return false;
        }
        self.notify_inbound();
        true
    }

    /// Block until this thread is paused in a safepoint
    ///
    /// Spins briefly, then waits on the outbound condition. There is no
    /// deadline: a thread that never polls stalls the caller. Returns
    /// `false` if the thread terminated instead.
    pub fn await_safepoint(&self) -> bool {
        let reached = |state: ThreadState| state.in_safepoint() || state.is_terminated();

        let backoff = Backoff::new();
        while !backoff.is_completed() {
            let state = self.state();
            if reached(state) {
                return state.in_safepoint();
            }
            backoff.snooze();
        }

        let mut guard = self.lock.lock();
        loop {
            let state = self.state();
            if reached(state) {
                return state.in_safepoint();
            }
            self.outbound.wait(&mut guard);
        }
    }

    /// Withdraw the request for `reason`
    ///
    /// The aggregate request bit is cleared only once no reason remains,
    /// so an overlapping request keeps the thread paused. Even the last
    /// release touches request bits only: `IN_SAFEPOINT` is never cleared
    /// here. The target clears it itself in [`exit_safepoint`] after it
    /// observes the aggregate bit clear, so the flag has a single writer.
    /// Callers must not assume the thread is running again when this
    /// returns. Returns `false` if no request for `reason` was outstanding.
    ///
    /// [`exit_safepoint`]: ThreadControl::exit_safepoint
    pub fn release_safepoint(&self, reason: SafepointReason) -> bool {
        let bit = reason.bit();
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & bit == 0 {
                return false;
            }
            let mut next = current & !bit;
            if next & ThreadState::REQUEST_REASON_MASK == 0 {
                next &= !ThreadState::SAFEPOINT_REQUEST;
            }
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.notify_inbound();
        true
    }

    /// Pause here if a safepoint was requested
    ///
    /// Called by the owning thread at allocation slow paths and other poll
    /// points. Returns `true` if the thread paused.
    #[inline]
    pub fn poll_safepoint(&self) -> bool {
        if !self.state().safepoint_requested() {
            return false;
        }
        self.enter_safepoint(0, 0);
        self.exit_safepoint(0, 0);
        true
    }

    /// Save the context and become heap-inert
    ///
    /// Sets `IN_SAFEPOINT | set`, clears `clear`. Owner thread only.
    pub fn enter_safepoint(&self, set: u32, clear: u32) {
        *self.context.lock() = ExecutionContext::capture(self.frame_head());
        self.update_state(ThreadState::IN_SAFEPOINT | set, clear);
        self.notify_outbound();
    }

    /// Leave the safepoint once no request is outstanding
    ///
    /// Clears `IN_SAFEPOINT | clear`, sets `set`. Owner thread only.
    pub fn exit_safepoint(&self, set: u32, clear: u32) {
        let mut guard = self.lock.lock();
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & ThreadState::SAFEPOINT_REQUEST != 0 {
                self.inbound.wait(&mut guard);
                current = self.state.load(Ordering::Acquire);
                continue;
            }
            let next = (current & !(ThreadState::IN_SAFEPOINT | clear)) | set;
            match self.state.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.outbound.notify_all();
    }

    /// Run `f` inside a safepoint
    ///
    /// For blocking work that never touches the heap, such as waiting for
    /// another thread. Owner thread only.
    pub fn in_safe_region<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_safepoint(0, 0);
        let result = f();
        self.exit_safepoint(0, 0);
        result
    }

    /// Wait inside a safepoint for `reason`'s request, then consume it and
    /// leave in one step
    ///
    /// Used by the collector thread, whose only requests come from threads
    /// asking for a collection. Returns `false` once `stop` is set.
    pub(crate) fn wait_for_request(&self, reason: SafepointReason, stop: &AtomicBool) -> bool {
        let idle = ThreadState::WAITING | ThreadState::WAITING_INDEFINITELY | ThreadState::PARKED;
        self.enter_safepoint(idle, ThreadState::RUNNABLE);

        let leave = ThreadState::IN_SAFEPOINT | ThreadState::WAITING_MASK;
        let mut guard = self.lock.lock();
        let mut current = self.state.load(Ordering::Acquire);
        let requested = loop {
            let next = if current & reason.bit() != 0 {
                let mut next = current & !reason.bit();
                if next & ThreadState::REQUEST_REASON_MASK == 0 {
                    next &= !ThreadState::SAFEPOINT_REQUEST;
                }
                (next & !leave) | ThreadState::RUNNABLE
            } else if stop.load(Ordering::Acquire) {
                (current & !leave) | ThreadState::RUNNABLE
            } else {
                self.inbound.wait(&mut guard);
                current = self.state.load(Ordering::Acquire);
                continue;
            };
            match self.state.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break current & reason.bit() != 0,
                Err(actual) => current = actual,
            }
        };
        self.outbound.notify_all();
        requested
    }

    // ========================================================================
    // BLOCKING
    // ========================================================================

    /// Wait inside a safepoint until `done` holds or `deadline` passes
    ///
    /// `done` is evaluated with the control block's lock held; it must not
    /// call back into this block. Returns whether `done` held.
    fn block(
        &self,
        reason: WaitReason,
        deadline: Option<Instant>,
        mut done: impl FnMut(ThreadState) -> bool,
    ) -> bool {
        let timeout = match deadline {
            Some(_) => ThreadState::WAITING_WITH_TIMEOUT,
            None => ThreadState::WAITING_INDEFINITELY,
        };
        self.enter_safepoint(
            ThreadState::WAITING | timeout | reason.bit(),
            ThreadState::RUNNABLE,
        );

        let satisfied = {
            let mut guard = self.lock.lock();
            loop {
                if done(self.state()) {
                    break true;
                }
                match deadline {
                    Some(deadline) => {
                        if self.inbound.wait_until(&mut guard, deadline).timed_out() {
                            break done(self.state());
                        }
                    },
                    None => self.inbound.wait(&mut guard),
                }
            }
        };

        self.exit_safepoint(ThreadState::RUNNABLE, ThreadState::WAITING_MASK);
        satisfied
    }

    /// Clear `bit` if set, reporting whether it was
    fn take_flag(&self, bit: u32) -> bool {
        self.state.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Park until unparked, interrupted, or `timeout` elapses
    ///
    /// Consumes a pending unpark permit, returning immediately if one was
    /// available. Returns `true` if a permit was consumed.
    pub fn park(&self, timeout: Option<Duration>) -> bool {
        if self.take_flag(ThreadState::UNPARK) {
            return true;
        }
        if self.state().contains(ThreadState::INTERRUPTED) {
            return false;
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        self.block(WaitReason::Parked, deadline, |state| {
            state.intersects(ThreadState::UNPARK | ThreadState::INTERRUPTED)
        });
        self.take_flag(ThreadState::UNPARK)
    }

    /// Make a permit available and wake the thread if parked
    pub fn unpark(&self) {
        self.state.fetch_or(ThreadState::UNPARK, Ordering::AcqRel);
        self.notify_inbound();
    }

    /// Sleep for `duration`
    ///
    /// Fails with [`SgcError::Interrupted`] (clearing the flag) if the
    /// thread is interrupted before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        if self.take_flag(ThreadState::INTERRUPTED) {
            return Err(SgcError::Interrupted);
        }
        let deadline = Instant::now() + duration;
        self.block(WaitReason::Sleeping, Some(deadline), |state| {
            state.contains(ThreadState::INTERRUPTED) || Instant::now() >= deadline
        });
        if self.take_flag(ThreadState::INTERRUPTED) {
            return Err(SgcError::Interrupted);
        }
        Ok(())
    }

    /// Set the interrupt flag and wake the thread
    pub fn interrupt(&self) {
        self.state.fetch_or(ThreadState::INTERRUPTED, Ordering::AcqRel);
        self.notify_inbound();
    }

    pub fn is_interrupted(&self) -> bool {
        self.state().contains(ThreadState::INTERRUPTED)
    }

    /// Clear the interrupt flag, returning whether it was set
    pub fn take_interrupt(&self) -> bool {
        self.take_flag(ThreadState::INTERRUPTED)
    }

    /// Wait for `reason` until `predicate` holds or `deadline` passes
    ///
    /// Hook for monitor and object waits: whoever changes the condition
    /// calls [`wake`](Self::wake). The predicate runs with this block's lock
    /// held. Returns whether the predicate held.
    pub fn wait_until(
        &self,
        reason: WaitReason,
        deadline: Option<Instant>,
        mut predicate: impl FnMut() -> bool,
    ) -> bool {
        if predicate() {
            return true;
        }
        self.block(reason, deadline, |_| predicate())
    }

    /// Wake the thread so it re-checks whatever it waits for
    pub fn wake(&self) {
        self.notify_inbound();
    }

    /// Mark the thread as running outside managed code
    ///
    /// Informational only; native code still has to poll.
    pub fn set_in_native(&self, in_native: bool) {
        if in_native {
            self.update_state(ThreadState::IN_NATIVE, 0);
        } else {
            self.update_state(0, ThreadState::IN_NATIVE);
        }
    }

    /// Final transition on deregistration
    pub(crate) fn terminate(&self) {
        self.state.store(ThreadState::TERMINATED, Ordering::Release);
        self.notify_outbound();
    }
}

impl std::fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadControl")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
