//! Thread Registry
//!
//! Intrusive doubly linked list of every registered [`ThreadControl`],
//! behind a single mutex. The list holds one strong reference per entry
//! (an `Arc` turned into a raw pointer), so a control block stays valid
//! while linked even if its thread has already dropped its own handle.
//!
//! The collector holds the lock for a whole cycle: no thread can join or
//! leave while the world is stopped.

use crate::runtime::thread::ThreadControl;
use parking_lot::{Mutex, MutexGuard};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct List {
    head: *const ThreadControl,
    tail: *const ThreadControl,
}

// SAFETY: the list owns one strong count of every linked block, and
// ThreadControl is Send + Sync.
unsafe impl Send for List {}

/// ThreadRegistry - all live mutator threads
pub struct ThreadRegistry {
    list: Mutex<List>,
    count: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(List {
                head: ptr::null(),
                tail: ptr::null(),
            }),
            count: AtomicUsize::new(0),
        }
    }

    /// Append `control` to the list
    pub fn register(&self, control: Arc<ThreadControl>) {
        let raw = Arc::into_raw(control);
        let mut list = self.list.lock();
        // SAFETY: `raw` is a live block; links are guarded by the list lock.
        unsafe {
            let links = &mut *(*raw).links.get();
            links.prev = list.tail;
            links.next = ptr::null();
            match list.tail.as_ref() {
                Some(tail) => (*tail.links.get()).next = raw,
                None => list.head = raw,
            }
        }
        list.tail = raw;
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Unlink `control`, returning the list's reference to it
    ///
    /// Returns `None` if it was not registered here.
    pub fn deregister(&self, control: &ThreadControl) -> Option<Arc<ThreadControl>> {
        let mut list = self.list.lock();
        let target: *const ThreadControl = control;
        if !Self::iter_list(&list).any(|entry| ptr::eq(entry, target)) {
            return None;
        }
        // SAFETY: `target` is linked, so it and its neighbours are live;
        // links are guarded by the list lock.
        unsafe {
            let links = &mut *control.links.get();
            match links.prev.as_ref() {
                Some(prev) => (*prev.links.get()).next = links.next,
                None => list.head = links.next,
            }
            match links.next.as_ref() {
                Some(next) => (*next.links.get()).prev = links.prev,
                None => list.tail = links.prev,
            }
            links.next = ptr::null();
            links.prev = ptr::null();
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        // SAFETY: the pointer came from `Arc::into_raw` in `register`.
        Some(unsafe { Arc::from_raw(target) })
    }

    fn iter_list<'a>(list: &'a List) -> impl Iterator<Item = &'a ThreadControl> + 'a {
        let mut cursor = list.head;
        std::iter::from_fn(move || {
            // SAFETY: linked blocks are live while the lock is held.
            let entry = unsafe { cursor.as_ref()? };
            cursor = unsafe { (*entry.links.get()).next };
            Some(entry)
        })
    }

    /// Lock the registry, freezing its membership
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            list: self.list.lock(),
        }
    }

    /// Number of registered threads, without taking the lock
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        let list = self.list.get_mut();
        let mut cursor = list.head;
        while !cursor.is_null() {
            // SAFETY: every linked pointer holds one strong count.
            let control = unsafe { Arc::from_raw(cursor) };
            cursor = unsafe { (*control.links.get()).next };
        }
        list.head = ptr::null();
        list.tail = ptr::null();
    }
}

/// Locked view of the registry
pub struct RegistryGuard<'a> {
    list: MutexGuard<'a, List>,
}

impl RegistryGuard<'_> {
    /// Registered threads in registration order
    pub fn iter(&self) -> impl Iterator<Item = &ThreadControl> + '_ {
        ThreadRegistry::iter_list(&self.list)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.list.head.is_null()
    }
}
