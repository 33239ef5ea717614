//! Object Module - Object Model Seen by the Collector
//!
//! - `header` - header word, forwarding records and the [`ObjectRef`] handle
//! - `class` - class descriptors and the [`ClassLayout`] builder
//! - `refmap` - live-value cursors over reference slots
//! - `stack` - objects allocated outside the heap

pub mod class;
pub mod header;
pub mod refmap;
pub mod stack;

pub use class::{ClassLayout, ClassRef, ObjectKind};
pub use header::{
    Header, ObjectRef, ARRAY_HEADER_SIZE, HEADER_SIZE, MIN_OBJECT_SIZE, MOVED_BIT,
    STACK_ALLOCATED_BIT, WORD_SIZE,
};
pub use refmap::{ArrayElements, LiveValues, ValueCursor};
pub use stack::StackObject;
