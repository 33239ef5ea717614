//! GC Core Module - Collection Cycle Management
//!
//! Collections are stop-the-world and driven by one dedicated coordinator
//! thread. The coordinator idles inside a safepoint until its own
//! `SAFEPOINT_REQUEST_GC` bit is set, which is how any thread asks for a
//! collection, then runs one cycle:
//!
//! ```text
//! Idle ─▶ SafepointingOthers ─▶ Marking ─▶ Relocating ─▶ FixingUp ─▶ Swapping ─▶ Idle
//!          request + await        roots      active ─▶     every       flip,
//!          every thread           closure    spare         survivor    resize,
//!                                                                      clear bits
//! ```
//!
//! The registry lock is held for the whole cycle. Any failure inside a
//! cycle means the heap can no longer be trusted and aborts the process.

use crate::error::{OrFatal, Result, SgcError};
use crate::logging::GcEvent;
use crate::marker::Marker;
use crate::relocate::{Fixer, Relocator};
use crate::runtime::state::SafepointReason;
use crate::runtime::thread::ThreadControl;
use crate::runtime::RuntimeShared;
use crate::stats::{CycleRecord, GcStats, GcTimer};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// GC cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GcState {
    /// No collection in progress
    Idle,
    /// Waiting for every mutator to pause
    SafepointingOthers,
    /// Tracing from roots
    Marking,
    /// Copying live objects to the spare semispace
    Relocating,
    /// Rewriting stale references
    FixingUp,
    /// Flipping semispaces and clearing mark bits
    Swapping,
}

/// Started and completed cycle counts, read and written together
#[derive(Debug, Default, Clone, Copy)]
struct Epochs {
    started: u64,
    completed: u64,
}

/// GarbageCollector - cycle state, cycle epochs and statistics
pub struct GarbageCollector {
    state: Mutex<GcState>,
    /// Waiters block on `cycle_done` until `completed` reaches their target
    epoch: Mutex<Epochs>,
    cycle_done: Condvar,
    /// Control block of the running coordinator
    collector: Mutex<Option<Arc<ThreadControl>>>,
    shutdown: AtomicBool,
    stats: GcStats,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GcState::Idle),
            epoch: Mutex::new(Epochs::default()),
            cycle_done: Condvar::new(),
            collector: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            stats: GcStats::new(),
        }
    }

    pub fn state(&self) -> GcState {
        *self.state.lock()
    }

    fn set_state(&self, state: GcState) {
        *self.state.lock() = state;
    }

    /// Number of completed cycles
    pub fn epoch(&self) -> u64 {
        self.epoch.lock().completed
    }

    /// Epoch a collection requested now is guaranteed to reach
    ///
    /// A cycle that has started may have begun before the request, so the
    /// target is the cycle after the last one started.
    fn target_epoch(&self) -> u64 {
        self.epoch.lock().started + 1
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Check if the coordinator thread is running
    pub fn is_running(&self) -> bool {
        self.collector.lock().is_some()
    }

    pub(crate) fn collector(&self) -> Option<Arc<ThreadControl>> {
        self.collector.lock().clone()
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(collector) = self.collector() {
            collector.wake();
        }
    }

    /// Ask the coordinator for a collection and wait for it to finish
    ///
    /// A registered `requester` waits inside a safepoint, so the collection
    /// it asked for can proceed.
    pub(crate) fn request_collection(&self, requester: Option<&ThreadControl>) -> Result<()> {
        let collector = self.collector().ok_or_else(|| SgcError::InvalidState {
            expected: "collector running".to_string(),
            actual: "collector stopped".to_string(),
        })?;
        let target = self.target_epoch();
        collector.request_safepoint(SafepointReason::Gc);

        match requester {
            Some(thread) => thread.in_safe_region(|| self.wait_for_epoch(target)),
            None => self.wait_for_epoch(target),
        }
    }

    fn wait_for_epoch(&self, target: u64) -> Result<()> {
        let mut epoch = self.epoch.lock();
        while epoch.completed < target {
            if self.shutdown.load(Ordering::Acquire) && !self.is_running() {
                return Err(SgcError::InvalidState {
                    expected: "collector running".to_string(),
                    actual: "collector stopped".to_string(),
                });
            }
            self.cycle_done.wait(&mut epoch);
        }
        Ok(())
    }

    /// Number the cycle about to run
    fn begin_cycle(&self) -> u64 {
        let mut epoch = self.epoch.lock();
        epoch.started += 1;
        epoch.started
    }

    fn complete_cycle(&self) -> u64 {
        let mut epoch = self.epoch.lock();
        epoch.completed = epoch.started;
        self.cycle_done.notify_all();
        epoch.completed
    }

    /// Coordinator thread body
    pub(crate) fn run_coordinator(rt: Arc<RuntimeShared>, ready: crossbeam::channel::Sender<()>) {
        let gc = &rt.gc;
        let control = Arc::new(ThreadControl::new(0, Some("sgc-collector".to_string())));
        *gc.collector.lock() = Some(control.clone());
        // The receiver only disappears if `start` gave up waiting.
        let _ = ready.send(());
        log::debug!("sgc: collector thread started");

        while control.wait_for_request(SafepointReason::Gc, &gc.shutdown) {
            gc.run_cycle(&rt);
        }

        *gc.collector.lock() = None;
        {
            let _epoch = gc.epoch.lock();
            gc.cycle_done.notify_all();
        }
        log::debug!("sgc: collector thread stopped");
    }

    /// One stop-the-world collection
    fn run_cycle(&self, rt: &RuntimeShared) {
        let cycle = self.begin_cycle();
        let heap = &rt.heap;
        let walker = &*rt.walker;
        let mut timer = GcTimer::new();
        let phase = |name: &str, timer: &mut GcTimer| {
            rt.logger.log(GcEvent::PhaseComplete {
                cycle,
                phase: name.to_string(),
                duration_us: timer.lap().as_micros() as u64,
            });
        };

        let threads = rt.registry.lock();
        self.set_state(GcState::SafepointingOthers);
        rt.logger.log(GcEvent::CycleStart {
            cycle,
            heap_used: heap.active_space().used(),
            threads: threads.len(),
        });

        for thread in threads.iter() {
            thread.request_safepoint(SafepointReason::Gc);
        }
        for thread in threads.iter() {
            if !thread.await_safepoint() {
                crate::error::fatal(SgcError::Internal(format!(
                    "registered thread {} terminated during a safepoint",
                    thread.id()
                )));
            }
        }
        rt.logger.log(GcEvent::SafepointReached {
            cycle,
            threads: threads.len(),
            wait_us: timer.lap().as_micros() as u64,
        });

        self.set_state(GcState::Marking);
        let mut marker = Marker::new(heap, &rt.bitmap);
        for thread in threads.iter() {
            marker.mark_stack(walker, &thread.context()).or_fatal();
            marker.mark_slot(thread.managed_slot()).or_fatal();
        }
        for region in heap.permanent_regions() {
            marker.mark_region(region).or_fatal();
        }
        marker.mark_globals(&rt.roots).or_fatal();
        let marked = marker.stats();
        phase("mark", &mut timer);

        self.set_state(GcState::Relocating);
        let from = heap.active_space();
        let to = heap.spare_space();
        let used_before = from.used();
        let old_limit = from.limit();
        let relocation = Relocator::new(heap, &rt.bitmap)
            .relocate(from, to)
            .or_fatal();
        phase("relocate", &mut timer);

        self.set_state(GcState::FixingUp);
        let mut fixer = Fixer::new(heap);
        for region in heap.permanent_regions() {
            fixer.update_region(region).or_fatal();
        }
        fixer.update_region(to).or_fatal();
        for thread in threads.iter() {
            fixer.update_stack(walker, &thread.context()).or_fatal();
            fixer.update_thread_object(thread.managed_slot()).or_fatal();
        }
        fixer.update_globals(&rt.roots).or_fatal();
        phase("fix-up", &mut timer);

        self.set_state(GcState::Swapping);
        heap.swap_spaces().or_fatal();
        let live = relocation.bytes_copied;
        let new_limit = heap.resize_after_collection(live);
        rt.bitmap.clear().or_fatal();
        phase("swap", &mut timer);

        let pause = timer.elapsed();
        self.stats.record_cycle(&CycleRecord {
            pause,
            bytes_copied: relocation.bytes_copied,
            objects_relocated: relocation.objects_copied,
            live_bytes: live,
        });
        self.complete_cycle();

        for thread in threads.iter() {
            thread.release_safepoint(SafepointReason::Gc);
        }
        drop(threads);
        self.set_state(GcState::Idle);

        if new_limit != old_limit {
            rt.logger.log(GcEvent::HeapResized {
                old_limit,
                new_limit,
            });
        }
        rt.logger.log(GcEvent::CycleEnd {
            cycle,
            pause_us: pause.as_micros() as u64,
            live_bytes: live,
            reclaimed_bytes: used_before.saturating_sub(live),
        });
        if rt.config.verbose {
            log::info!(
                "sgc: cycle {} marked {} objects ({} on stack), {} updated references, {:?} pause",
                cycle,
                marked.objects_marked,
                marked.stack_objects,
                fixer.updated(),
                pause
            );
        }
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}
