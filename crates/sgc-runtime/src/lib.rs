//! SGC Runtime Library
//!
//! C entry points over one process-wide [`sgc::Runtime`], for compiled
//! managed code and native collaborators:
//! - heap initialization and shutdown
//! - allocation
//! - thread registration and safepoint polling
//! - global root registration and explicit collection

mod gc;

pub use gc::*;
