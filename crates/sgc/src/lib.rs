//! # SGC - Stop-the-World Semispace Collector
//!
//! SGC is a copying garbage collector for ahead-of-time compiled managed
//! code. Every collection stops all mutator threads at cooperative
//! safepoints, marks from roots, copies survivors into the spare semispace
//! and rewrites every reference before letting the world go again.
//!
//! ## Quick Start
//!
//! ```rust
//! use sgc::{ClassLayout, GcConfig, Runtime};
//!
//! fn main() -> Result<(), sgc::SgcError> {
//!     let runtime = sgc::init_with_config(GcConfig {
//!         min_heap_size: 1 << 20,
//!         max_heap_size: 8 << 20,
//!         ..Default::default()
//!     })?;
//!     runtime.start()?;
//!
//!     let thread = runtime.register_thread(Some("main"))?;
//!     let pair = runtime.define_class(&ClassLayout::instance(24).with_references(&[8, 16]))?;
//!
//!     let frame = thread.push_frame(1)?;
//!     frame.set(0, Some(runtime.new_object(pair)?))?;
//!     runtime.collect()?;
//!
//!     drop(frame);
//!     runtime.deregister_thread()?;
//!     runtime.stop()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Mutator Threads                        │
//! │   allocate ─▶ bump pointer in active semispace (CAS)         │
//! │   poll_safepoint ─▶ pause when the state word goes negative  │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │ request / await / release
//! ┌───────────────────────────────┼──────────────────────────────┐
//! │                    Collector Thread                          │
//! │   1. stop every registered thread                            │
//! │   2. mark from stacks, thread objects, permanent regions     │
//! │      and global roots                                        │
//! │   3. copy marked objects active ─▶ spare, forward the old    │
//! │   4. fix up every reference                                  │
//! │   5. swap semispaces, resize the soft limit, clear bits      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Object Header
//!
//! ```text
//! word 0:  class address | STACK_ALLOCATED (bit 1) | MOVED (bit 0)
//! moved:   class address | MOVED,  word 1 = new address
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod gc;

// Memory layout
pub mod heap;
pub mod object;

// GC algorithm components
pub mod marker;
pub mod relocate;

// Threads, safepoints and monitoring
pub mod logging;
pub mod runtime;
pub mod stats;

pub use config::{ConfigError, GcConfig};
pub use error::{Result, SgcError};
pub use gc::{GarbageCollector, GcState};
pub use heap::{Heap, HeapUsage};
pub use logging::{GcEvent, GcLogger};
pub use marker::{ExecutionContext, StackWalker};
pub use object::class::{ClassLayout, ClassRef, ObjectKind};
pub use object::header::ObjectRef;
pub use runtime::{LocalFrame, Runtime, SafepointReason, ThreadControl, ThreadState, WaitReason};
pub use stats::GcSummary;

/// SGC version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a runtime with the default configuration
///
/// The runtime must be started with `runtime.start()` before the first
/// collection is needed.
pub fn init() -> Result<Runtime> {
    Runtime::new(GcConfig::default())
}

/// Create a runtime with `config`
pub fn init_with_config(config: GcConfig) -> Result<Runtime> {
    Runtime::new(config)
}
