//! Test Utilities for the SGC Integration Suite
//!
//! Fixtures build small heaps so collections happen often, and helpers
//! build object graphs whose shape and payload can be checked after the
//! objects have moved.

#![allow(dead_code)]

use sgc::{ClassLayout, ClassRef, GcConfig, GcState, ObjectRef, Runtime, ThreadControl};
use std::collections::HashSet;
use std::sync::Arc;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Field offsets of [`RuntimeFixture::node_class`]
pub const NEXT: usize = 8;
pub const OTHER: usize = 16;
pub const PAYLOAD: usize = 24;

// ============================================================================
// RUNTIME FIXTURE
// ============================================================================

/// Started runtime, stopped on drop
pub struct RuntimeFixture {
    pub runtime: Arc<Runtime>,
    pub config: GcConfig,
}

impl RuntimeFixture {
    /// 1MB min / 4MB max heap
    pub fn with_defaults() -> Self {
        Self::with_heap(MB, 4 * MB)
    }

    pub fn with_heap(min_heap_size: usize, max_heap_size: usize) -> Self {
        let config = GcConfig {
            min_heap_size,
            max_heap_size,
            class_region_size: 64 * KB,
            image_region_size: 64 * KB,
            string_region_size: 64 * KB,
            ..Default::default()
        };
        let runtime = Runtime::new(config.clone()).expect("runtime creation should succeed");
        runtime.start().expect("collector should start");
        Self {
            runtime: Arc::new(runtime),
            config,
        }
    }

    /// Register the calling thread
    pub fn attach(&self, name: &str) -> Arc<ThreadControl> {
        self.runtime
            .register_thread(Some(name))
            .expect("thread registration should succeed")
    }

    pub fn detach(&self) {
        self.runtime
            .deregister_thread()
            .expect("thread deregistration should succeed");
    }

    /// `{ next, other, payload }` instance
    pub fn node_class(&self) -> ClassRef {
        self.runtime
            .define_class(&ClassLayout::instance(32).with_references(&[NEXT, OTHER]))
            .expect("node class should be valid")
    }

    pub fn array_class(&self) -> ClassRef {
        self.runtime
            .define_class(&ClassLayout::reference_array())
            .expect("array class should be valid")
    }

    pub fn node(&self, class: ClassRef, payload: u64) -> ObjectRef {
        let node = self.runtime.new_object(class).expect("allocation should succeed");
        node.set_word(PAYLOAD, payload).expect("node has a payload field");
        node
    }

    /// Linked list of `len` nodes with payloads `0..len`, head first
    ///
    /// The partial list stays rooted while it is built. Store the result in
    /// a frame before the next poll point.
    pub fn list(&self, class: ClassRef, len: u64) -> Option<ObjectRef> {
        let thread = self
            .runtime
            .current_thread()
            .expect("list building needs a registered thread");
        let frame = thread.push_frame(1).expect("frame push should succeed");
        for payload in (0..len).rev() {
            let node = self.node(class, payload);
            node.set_ref(NEXT, frame.get(0).expect("slot 0 exists"))
                .expect("node has a next field");
            frame.set(0, Some(node)).expect("slot 0 exists");
        }
        let head = frame.get(0).expect("slot 0 exists");
        head
    }

    pub fn collect(&self) {
        let before = self.runtime.cycles();
        self.runtime.collect().expect("collection should succeed");
        assert!(self.runtime.cycles() > before, "collection did not complete a cycle");
        assert_eq!(self.runtime.gc_state(), GcState::Idle);
    }
}

impl Drop for RuntimeFixture {
    fn drop(&mut self) {
        let _ = self.runtime.deregister_thread();
        let _ = self.runtime.stop();
    }
}

// ============================================================================
// ASSERTION HELPERS
// ============================================================================

/// Payloads along the `NEXT` chain starting at `head`
pub fn list_payloads(head: Option<ObjectRef>) -> Vec<u64> {
    let mut payloads = Vec::new();
    let mut cursor = head;
    while let Some(node) = cursor {
        assert!(!node.is_moved(), "reached a forwarded node at {:?}", node);
        payloads.push(node.get_word(PAYLOAD).expect("node has a payload field"));
        cursor = node.get_ref(NEXT).expect("node has a next field");
    }
    payloads
}

#[track_caller]
pub fn assert_all_addresses_unique(addresses: &[usize], context: &str) {
    let unique: HashSet<_> = addresses.iter().collect();
    assert_eq!(
        unique.len(),
        addresses.len(),
        "{}: {} duplicate addresses out of {}",
        context,
        addresses.len() - unique.len(),
        addresses.len()
    );
}

#[track_caller]
pub fn assert_in_active_space(runtime: &Runtime, object: ObjectRef, context: &str) {
    assert!(
        runtime.heap().active_space().contains(object.addr()),
        "{}: {:?} is not in the active semispace",
        context,
        object
    );
}
