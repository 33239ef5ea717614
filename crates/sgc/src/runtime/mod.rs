//! Runtime Module - Threads, Safepoints and the Runtime Context
//!
//! [`Runtime`] is the explicit context every collaborator goes through: it
//! owns the heap, the mark bitmap, the thread registry, the global root
//! table, the event log and the collector coordinator thread.
//!
//! # Threads
//!
//! A thread must [`register`](Runtime::register_thread) before it touches
//! the heap. Registration binds a [`ThreadControl`] to the calling OS
//! thread, keyed by runtime, and the binding detaches on its own when the
//! OS thread exits. Registered threads have to poll
//! ([`Runtime::poll_safepoint`]) often enough for collections to proceed.
//!
//! # Lifecycle
//!
//! ```text
//! new ─▶ Initialized ─▶ start ─▶ Running ─▶ stop ─▶ Stopped
//! ```
//!
//! Allocation works before `start` until the first collection is needed.

pub mod frames;
pub mod registry;
pub mod state;
pub mod thread;

pub use frames::{FrameRecord, LocalFrame, MAX_FRAME_SLOTS};
pub use registry::ThreadRegistry;
pub use state::{SafepointReason, ThreadState, WaitReason};
pub use thread::ThreadControl;

use crate::config::GcConfig;
use crate::error::{Result, SgcError};
use crate::gc::{GarbageCollector, GcState};
use crate::heap::{Heap, HeapUsage};
use crate::logging::{GcEvent, GcLogger};
use crate::marker::stack_scan::{summarize, FrameSummary};
use crate::marker::{ExecutionContext, MarkBitmap, RootTable, ShadowStackWalker, StackWalker};
use crate::object::class::{ClassLayout, ClassRef, ObjectKind};
use crate::object::header::ObjectRef;
use crate::stats::GcSummary;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Runtime lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Created, collector not started
    Initialized,
    /// Collector thread running
    Running,
    /// Collector thread stopped; cannot be restarted
    Stopped,
}

struct Lifecycle {
    state: RuntimeState,
    collector: Option<JoinHandle<()>>,
}

/// State shared between the runtime handle, the collector thread and the
/// thread-local bindings
pub(crate) struct RuntimeShared {
    pub(crate) id: u64,
    pub(crate) config: GcConfig,
    pub(crate) heap: Heap,
    pub(crate) bitmap: MarkBitmap,
    pub(crate) registry: ThreadRegistry,
    pub(crate) roots: RootTable,
    pub(crate) gc: GarbageCollector,
    pub(crate) walker: Box<dyn StackWalker>,
    pub(crate) logger: GcLogger,
    next_thread_id: AtomicU64,
    /// Serializes stack captures, which share one request bit
    capture: Mutex<()>,
}

impl RuntimeShared {
    /// Leave the registry for good
    ///
    /// Enters a safepoint first so a collection waiting on this thread can
    /// finish and release the registry lock.
    fn detach(&self, control: &ThreadControl) {
        control.enter_safepoint(0, 0);
        if self.registry.deregister(control).is_none() {
            log::warn!("sgc: thread {} was not in the registry", control.id());
        }
        control.terminate();
        self.logger.log(GcEvent::ThreadDetached {
            thread_id: control.id(),
        });
    }
}

struct Binding {
    shared: Weak<RuntimeShared>,
    control: Arc<ThreadControl>,
}

/// Per-OS-thread registrations, one per runtime
#[derive(Default)]
struct Bindings(FxHashMap<u64, Binding>);

impl Drop for Bindings {
    fn drop(&mut self) {
        for (_, binding) in self.0.drain() {
            if let Some(shared) = binding.shared.upgrade() {
                shared.detach(&binding.control);
            }
        }
    }
}

thread_local! {
    static BINDINGS: RefCell<Bindings> = RefCell::new(Bindings::default());
}

fn with_bindings<R>(f: impl FnOnce(&mut Bindings) -> R) -> Result<R> {
    BINDINGS
        .try_with(|cell| f(&mut cell.borrow_mut()))
        .map_err(|_| SgcError::InvalidState {
            expected: "live thread".to_string(),
            actual: "thread is exiting".to_string(),
        })
}

/// Runtime - heap, threads and collector
///
/// # Examples
///
/// ```rust
/// use sgc::{ClassLayout, GcConfig, Runtime};
///
/// let runtime = Runtime::new(GcConfig {
///     min_heap_size: 1 << 20,
///     max_heap_size: 4 << 20,
///     ..Default::default()
/// })?;
/// runtime.start()?;
///
/// let thread = runtime.register_thread(Some("main"))?;
/// let node = runtime.define_class(&ClassLayout::instance(16).with_references(&[8]))?;
/// let frame = thread.push_frame(1)?;
/// frame.set(0, Some(runtime.new_object(node)?))?;
///
/// runtime.collect()?;
/// assert!(frame.get(0)?.is_some());
///
/// drop(frame);
/// runtime.deregister_thread()?;
/// runtime.stop()?;
/// # Ok::<(), sgc::SgcError>(())
/// ```
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    lifecycle: Mutex<Lifecycle>,
}

impl Runtime {
    /// Reserve the heap, walking stacks through the shadow stack
    pub fn new(config: GcConfig) -> Result<Self> {
        Self::with_stack_walker(config, Box::new(ShadowStackWalker))
    }

    /// Reserve the heap with a custom stack walker
    pub fn with_stack_walker(config: GcConfig, walker: Box<dyn StackWalker>) -> Result<Self> {
        let heap = Heap::new(&config)?;
        let bitmap = MarkBitmap::new(heap.base(), heap.limit(), heap.alignment())?;
        let logger = GcLogger::new(config.log_events, config.json_events);
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);

        log::info!(
            "sgc: runtime {} initialized ({} min / {} max heap)",
            id,
            config.min_heap_size,
            config.max_heap_size
        );

        Ok(Self {
            shared: Arc::new(RuntimeShared {
                id,
                config,
                heap,
                bitmap,
                registry: ThreadRegistry::new(),
                roots: RootTable::new(),
                gc: GarbageCollector::new(),
                walker,
                logger,
                next_thread_id: AtomicU64::new(1),
                capture: Mutex::new(()),
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: RuntimeState::Initialized,
                collector: None,
            }),
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Spawn the collector thread
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != RuntimeState::Initialized {
            return Err(SgcError::InvalidState {
                expected: "Initialized".to_string(),
                actual: format!("{:?}", lifecycle.state),
            });
        }

        let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("sgc-collector".to_string())
            .spawn(move || GarbageCollector::run_coordinator(shared, ready_tx))
            .map_err(|e| SgcError::Internal(format!("failed to spawn collector thread: {}", e)))?;
        ready_rx
            .recv()
            .map_err(|_| SgcError::Internal("collector thread exited during startup".to_string()))?;

        lifecycle.collector = Some(handle);
        lifecycle.state = RuntimeState::Running;
        log::info!("sgc: runtime {} started", self.shared.id);
        Ok(())
    }

    /// Stop the collector thread
    ///
    /// Fails while any thread is still registered.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == RuntimeState::Running && !self.shared.registry.is_empty() {
            return Err(SgcError::InvalidState {
                expected: "no registered threads".to_string(),
                actual: format!("{} registered threads", self.shared.registry.len()),
            });
        }
        self.shutdown(&mut lifecycle);
        Ok(())
    }

    fn shutdown(&self, lifecycle: &mut Lifecycle) {
        if lifecycle.state == RuntimeState::Running {
            self.shared.gc.begin_shutdown();
            if let Some(handle) = lifecycle.collector.take() {
                if handle.join().is_err() {
                    log::error!("sgc: collector thread panicked");
                }
            }
            log::info!("sgc: runtime {} stopped", self.shared.id);
        }
        lifecycle.state = RuntimeState::Stopped;
    }

    pub fn state(&self) -> RuntimeState {
        self.lifecycle.lock().state
    }

    // ========================================================================
    // THREADS
    // ========================================================================

    /// Attach the calling OS thread
    pub fn register_thread(&self, name: Option<&str>) -> Result<Arc<ThreadControl>> {
        let shared = &self.shared;
        with_bindings(|bindings| {
            if bindings.0.contains_key(&shared.id) {
                return Err(SgcError::ThreadAlreadyRegistered);
            }
            let id = shared.next_thread_id.fetch_add(1, Ordering::Relaxed);
            let control = Arc::new(ThreadControl::new(id, name.map(str::to_owned)));
            shared.registry.register(control.clone());
            bindings.0.insert(
                shared.id,
                Binding {
                    shared: Arc::downgrade(shared),
                    control: control.clone(),
                },
            );
            shared.logger.log(GcEvent::ThreadAttached {
                thread_id: id,
                name: name.map(str::to_owned),
            });
            Ok(control)
        })?
    }

    /// Detach the calling OS thread
    ///
    /// Every frame it pushed must have been popped.
    pub fn deregister_thread(&self) -> Result<()> {
        let control = self.current_thread()?;
        if !control.frame_head().is_null() {
            return Err(SgcError::InvalidState {
                expected: "no live frames".to_string(),
                actual: "frames still pushed".to_string(),
            });
        }
        with_bindings(|bindings| bindings.0.remove(&self.shared.id))?;
        self.shared.detach(&control);
        Ok(())
    }

    /// Control block of the calling thread
    pub fn current_thread(&self) -> Result<Arc<ThreadControl>> {
        BINDINGS
            .try_with(|cell| {
                cell.borrow()
                    .0
                    .get(&self.shared.id)
                    .map(|binding| binding.control.clone())
            })
            .ok()
            .flatten()
            .ok_or(SgcError::ThreadNotRegistered)
    }

    /// Poll point for the calling thread
    ///
    /// Returns `true` if the thread paused for a safepoint.
    pub fn poll_safepoint(&self) -> Result<bool> {
        Ok(self.current_thread()?.poll_safepoint())
    }

    pub fn thread_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Frames of `thread`, innermost first
    ///
    /// Another thread is paused with a stack-trace safepoint for the
    /// duration of the walk; a registered caller waits inside a safepoint
    /// of its own.
    pub fn capture_stack(&self, thread: &ThreadControl) -> Result<Vec<FrameSummary>> {
        let walker = &*self.shared.walker;
        if thread.is_current() {
            return Ok(summarize(walker, &ExecutionContext::capture(thread.frame_head())));
        }

        let capture = || {
            let _serial = self.shared.capture.lock();
            thread.request_safepoint(SafepointReason::StackTrace);
            let paused = thread.await_safepoint();
            let frames = paused.then(|| summarize(walker, &thread.context()));
            thread.release_safepoint(SafepointReason::StackTrace);
            frames.ok_or_else(|| SgcError::InvalidState {
                expected: format!("thread {} alive", thread.id()),
                actual: "terminated".to_string(),
            })
        };

        match self.current_thread() {
            Ok(current) => current.in_safe_region(capture),
            Err(_) => capture(),
        }
    }

    // ========================================================================
    // ALLOCATION
    // ========================================================================

    /// Allocate `size` zeroed bytes in the active semispace
    ///
    /// The caller must write an object header into the block before its next
    /// poll point. Slow path: poll, retry, collect, retry once allowing the
    /// soft limit to grow, else [`SgcError::OutOfMemory`].
    pub fn allocate(&self, size: usize) -> Result<usize> {
        let thread = self.current_thread()?;
        self.allocate_for(&thread, size).map(NonZeroUsize::get)
    }

    fn allocate_for(&self, thread: &ThreadControl, size: usize) -> Result<NonZeroUsize> {
        if size == 0 {
            return Err(SgcError::InvalidArgument("zero-sized allocation".to_string()));
        }
        let heap = &self.shared.heap;
        if let Some(addr) = heap.allocate(size) {
            return Ok(addr);
        }
        if thread.poll_safepoint() {
            if let Some(addr) = heap.allocate(size) {
                return Ok(addr);
            }
        }

        let usage = heap.usage();
        if size <= usage.capacity {
            self.shared.gc.request_collection(Some(thread))?;
            if let Some(addr) = heap.allocate_growing(size) {
                return Ok(addr);
            }
        }

        let usage = heap.usage();
        let available = usage.capacity.saturating_sub(usage.used);
        self.shared.logger.log(GcEvent::AllocationFailure {
            requested: size,
            available,
        });
        Err(SgcError::OutOfMemory {
            requested: size,
            available,
        })
    }

    /// Allocate an instance of `class`
    pub fn new_object(&self, class: ClassRef) -> Result<ObjectRef> {
        if class.instance_kind() != ObjectKind::Instance {
            return Err(SgcError::InvalidArgument(format!(
                "new_object on a {:?} class",
                class.instance_kind()
            )));
        }
        self.new_movable(class, 0)
    }

    /// Allocate an array of `length` elements of `class`
    pub fn new_array(&self, class: ClassRef, length: usize) -> Result<ObjectRef> {
        if !class.instance_kind().is_array() {
            return Err(SgcError::InvalidArgument(format!(
                "new_array on a {:?} class",
                class.instance_kind()
            )));
        }
        self.new_movable(class, length)
    }

    fn new_movable(&self, class: ClassRef, length: usize) -> Result<ObjectRef> {
        let thread = self.current_thread()?;
        let heap = &self.shared.heap;
        let size = heap.object_size(class, length)?;
        let addr = self.allocate_for(&thread, size)?;
        // SAFETY: fresh zeroed block of `size` bytes; no poll point since.
        Ok(unsafe { heap.init_object(addr, class, length) })
    }

    /// Allocate a permanent object in the image region
    pub fn new_image_object(&self, class: ClassRef, length: usize) -> Result<ObjectRef> {
        self.current_thread()?;
        self.shared.heap.new_image_object(class, length)
    }

    /// Lay out a class descriptor in the class region
    pub fn define_class(&self, layout: &ClassLayout) -> Result<ClassRef> {
        self.current_thread()?;
        self.shared.heap.define_class(layout)
    }

    /// Canonical byte array holding `value`
    pub fn intern_string(&self, value: &str) -> Result<ObjectRef> {
        self.current_thread()?;
        self.shared.heap.intern_string(value)
    }

    // ========================================================================
    // ROOTS AND COLLECTION
    // ========================================================================

    /// Treat `count` words at `base` as root slots
    ///
    /// # Safety
    /// The slots must stay valid and hold only null or object references
    /// until unregistered.
    pub unsafe fn register_global_roots(&self, base: *mut usize, count: usize) -> Result<()> {
        self.shared.roots.register(base, count)
    }

    pub fn unregister_global_roots(&self, base: *mut usize) -> Result<()> {
        self.shared.roots.unregister(base)
    }

    /// Run a full collection and wait for it
    pub fn collect(&self) -> Result<()> {
        let current = self.current_thread().ok();
        self.shared.gc.request_collection(current.as_deref())
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn stats(&self) -> GcSummary {
        self.shared.gc.stats().summary()
    }

    pub fn logger(&self) -> &GcLogger {
        &self.shared.logger
    }

    pub fn heap(&self) -> &Heap {
        &self.shared.heap
    }

    pub fn heap_usage(&self) -> HeapUsage {
        self.shared.heap.usage()
    }

    pub fn gc_state(&self) -> GcState {
        self.shared.gc.state()
    }

    /// Completed collections
    pub fn cycles(&self) -> u64 {
        self.shared.gc.epoch()
    }

    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut();
        if lifecycle.state == RuntimeState::Running && !self.shared.registry.is_empty() {
            log::warn!(
                "sgc: runtime {} dropped with {} registered threads",
                self.shared.id,
                self.shared.registry.len()
            );
        }
        let mut lifecycle = std::mem::replace(
            lifecycle,
            Lifecycle {
                state: RuntimeState::Stopped,
                collector: None,
            },
        );
        self.shutdown(&mut lifecycle);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("threads", &self.thread_count())
            .field("cycles", &self.cycles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MB;

    fn small_config() -> GcConfig {
        GcConfig {
            min_heap_size: MB,
            max_heap_size: 4 * MB,
            class_region_size: 64 * 1024,
            image_region_size: 64 * 1024,
            string_region_size: 64 * 1024,
            ..Default::default()
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    #[test]
    fn test_start_stop() {
        let runtime = Runtime::new(small_config()).unwrap();
        assert_eq!(runtime.state(), RuntimeState::Initialized);
        runtime.start().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Running);
        assert!(runtime.start().is_err());
        runtime.stop().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Stopped);
        runtime.stop().unwrap();
    }

    #[test]
    fn test_stop_rejected_with_registered_threads() {
        let runtime = Runtime::new(small_config()).unwrap();
        runtime.start().unwrap();
        runtime.register_thread(None).unwrap();
        assert!(matches!(runtime.stop(), Err(SgcError::InvalidState { .. })));
        runtime.deregister_thread().unwrap();
        runtime.stop().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = GcConfig {
            min_heap_size: 8 * MB,
            max_heap_size: 4 * MB,
            ..Default::default()
        };
        assert!(matches!(Runtime::new(config), Err(SgcError::Config(_))));
    }

    // ========================================================================
    // THREADS
    // ========================================================================

    #[test]
    fn test_register_twice_rejected() {
        let runtime = Runtime::new(small_config()).unwrap();
        let control = runtime.register_thread(Some("main")).unwrap();
        assert_eq!(control.name(), Some("main"));
        assert!(matches!(
            runtime.register_thread(None),
            Err(SgcError::ThreadAlreadyRegistered)
        ));
        assert_eq!(runtime.thread_count(), 1);

        runtime.deregister_thread().unwrap();
        assert!(control.state().is_terminated());
        assert!(matches!(
            runtime.deregister_thread(),
            Err(SgcError::ThreadNotRegistered)
        ));
        assert_eq!(runtime.thread_count(), 0);
    }

    #[test]
    fn test_bindings_are_per_runtime() {
        let a = Runtime::new(small_config()).unwrap();
        let b = Runtime::new(small_config()).unwrap();
        a.register_thread(None).unwrap();
        assert!(b.current_thread().is_err());
        b.register_thread(None).unwrap();
        a.deregister_thread().unwrap();
        assert!(b.current_thread().is_ok());
        b.deregister_thread().unwrap();
    }

    #[test]
    fn test_thread_exit_detaches() {
        let runtime = Arc::new(Runtime::new(small_config()).unwrap());
        let shared = runtime.clone();
        let control = std::thread::spawn(move || shared.register_thread(None).unwrap())
            .join()
            .unwrap();
        assert!(control.state().is_terminated());
        assert_eq!(runtime.thread_count(), 0);
    }

    #[test]
    fn test_deregister_with_live_frame_rejected() {
        let runtime = Runtime::new(small_config()).unwrap();
        let control = runtime.register_thread(None).unwrap();
        let frame = control.push_frame(1).unwrap();
        assert!(runtime.deregister_thread().is_err());
        drop(frame);
        runtime.deregister_thread().unwrap();
    }

    // ========================================================================
    // ALLOCATION
    // ========================================================================

    #[test]
    fn test_allocation_requires_registration() {
        let runtime = Runtime::new(small_config()).unwrap();
        assert!(matches!(
            runtime.allocate(16),
            Err(SgcError::ThreadNotRegistered)
        ));
    }

    #[test]
    fn test_new_object_checks_kind() {
        let runtime = Runtime::new(small_config()).unwrap();
        runtime.register_thread(None).unwrap();
        let array = runtime.define_class(&ClassLayout::reference_array()).unwrap();
        let node = runtime
            .define_class(&ClassLayout::instance(16).with_references(&[8]))
            .unwrap();

        assert!(runtime.new_object(array).is_err());
        assert!(runtime.new_array(node, 4).is_err());
        let object = runtime.new_object(node).unwrap();
        assert_eq!(object.class(), node);
        assert_eq!(runtime.new_array(array, 4).unwrap().array_length(), 4);
        assert!(runtime.allocate(0).is_err());
        runtime.deregister_thread().unwrap();
    }

    #[test]
    fn test_oversized_allocation_fails_without_collecting() {
        let runtime = Runtime::new(small_config()).unwrap();
        runtime.register_thread(None).unwrap();
        let err = runtime.allocate(64 * MB).unwrap_err();
        assert!(matches!(err, SgcError::OutOfMemory { requested, .. } if requested == 64 * MB));
        assert_eq!(runtime.cycles(), 0);
        runtime.deregister_thread().unwrap();
    }

    // ========================================================================
    // COLLECTION
    // ========================================================================

    #[test]
    fn test_collect_before_start_fails() {
        let runtime = Runtime::new(small_config()).unwrap();
        assert!(matches!(runtime.collect(), Err(SgcError::InvalidState { .. })));
    }

    #[test]
    fn test_collect_from_registered_thread() {
        let runtime = Runtime::new(small_config()).unwrap();
        runtime.start().unwrap();
        let control = runtime.register_thread(None).unwrap();
        let node = runtime
            .define_class(&ClassLayout::instance(16).with_references(&[8]))
            .unwrap();

        {
            let frame = control.push_frame(1).unwrap();
            let a = runtime.new_object(node).unwrap();
            let b = runtime.new_object(node).unwrap();
            a.set_ref(8, Some(b)).unwrap();
            frame.set(0, Some(a)).unwrap();
            runtime.new_object(node).unwrap(); // garbage

            runtime.collect().unwrap();
            let moved = frame.get(0).unwrap().unwrap();
            assert_ne!(moved, a);
            assert_eq!(moved.class(), node);
            assert!(moved.get_ref(8).unwrap().is_some());
            assert_eq!(runtime.heap_usage().used, 32);
        }

        assert_eq!(runtime.cycles(), 1);
        assert_eq!(runtime.stats().cycles, 1);
        assert_eq!(runtime.gc_state(), GcState::Idle);
        assert!(control.state().is_runnable());
        runtime.deregister_thread().unwrap();
        runtime.stop().unwrap();
    }

    #[test]
    fn test_capture_own_stack() {
        let runtime = Runtime::new(small_config()).unwrap();
        let control = runtime.register_thread(None).unwrap();
        let node = runtime.define_class(&ClassLayout::instance(16)).unwrap();
        let outer = control.push_frame(2).unwrap();
        outer.set(1, Some(runtime.new_object(node).unwrap())).unwrap();
        let inner = control.push_frame(1).unwrap();

        let frames = runtime.capture_stack(&control).unwrap();
        let live: Vec<_> = frames.iter().map(|f| f.live_references).collect();
        assert_eq!(live, vec![0, 1]);

        drop(inner);
        drop(outer);
        runtime.deregister_thread().unwrap();
    }
}
