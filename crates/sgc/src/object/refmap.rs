//! Live-Value Iteration - Cursors over Reference Slots
//!
//! Marking, fix-up and stack scanning all visit reference slots through the
//! same small interface: `next_value()` yields the next non-null reference,
//! and `set_current()` rewrites the slot that value came from.
//!
//! [`LiveValues`] is driven by a reference bitmap (an object's class bitmap
//! plus overflow words, or a stack frame's live-slot bitmap).
//! [`ArrayElements`] covers dense runs of references: reference-array
//! elements and class static slots.
//!
//! ```text
//! bitmap word:  ...0 1 0 1 1 0
//!                      │   │ └─ word 1: field at offset 8
//!                      │   └─── word 2: field at offset 16
//!                      └─────── word 4: field at offset 32
//! ```

use crate::error::{Result, SgcError};
use crate::object::class::ObjectKind;
use crate::object::header::{ObjectRef, ARRAY_HEADER_SIZE};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bits per bitmap word
const BITS_PER_WORD: usize = 64;

/// A cursor over reference slots
pub trait ValueCursor {
    /// Next non-null reference, or `None` when exhausted
    fn next_value(&mut self) -> Option<usize>;

    /// Overwrite the slot the last value came from
    ///
    /// Fails if `next_value` has not yielded anything yet.
    fn set_current(&mut self, value: usize) -> Result<()>;
}

#[inline]
fn load(slot: *mut usize) -> usize {
    // SAFETY: cursors only hold pointers to word-aligned live slots.
    unsafe { (*(slot as *const AtomicUsize)).load(Ordering::Relaxed) }
}

#[inline]
fn store(slot: *mut usize, value: usize) {
    // SAFETY: as for `load`.
    unsafe { (*(slot as *const AtomicUsize)).store(value, Ordering::Relaxed) }
}

fn no_current() -> SgcError {
    SgcError::InvalidArgument("set_current called before a value was yielded".to_string())
}

/// Bitmap-driven cursor over the reference slots of one object or frame
pub struct LiveValues {
    /// Slot that bit 0 of `bits` refers to
    base: *mut usize,
    /// Unvisited bits of the current word
    bits: u64,
    /// Next overflow word
    next_word: *const u64,
    /// Overflow words not yet loaded
    words_left: usize,
    /// Slot of the last yielded value
    current: *mut usize,
}

impl LiveValues {
    /// Immediately exhausted cursor
    pub fn empty() -> Self {
        Self {
            base: ptr::null_mut(),
            bits: 0,
            next_word: ptr::null(),
            words_left: 0,
            current: ptr::null_mut(),
        }
    }

    /// Cursor over the reference fields of `object`
    ///
    /// A null object, or one without a field bitmap (arrays, classes), gives
    /// an exhausted cursor; use [`ArrayElements`] for those.
    pub fn for_object(object: Option<ObjectRef>) -> Self {
        let Some(object) = object else {
            return Self::empty();
        };
        let class = object.class();
        if class.instance_kind() != ObjectKind::Instance {
            return Self::empty();
        }
        let ext = class.extension_words();
        // SAFETY: the class bitmap only covers words inside the instance.
        unsafe {
            Self::over_words(
                object.addr() as *mut usize,
                class.reference_bits(),
                ext.as_ptr(),
                ext.len(),
            )
        }
    }

    /// Cursor over `base[i]` for every set bit `i` of the bitmap chain
    ///
    /// # Safety
    /// Every slot named by `bits` and the `words_left` overflow words at
    /// `next_word` must be a readable, writable, word-aligned location that
    /// outlives the cursor.
    pub unsafe fn over_words(
        base: *mut usize,
        bits: u64,
        next_word: *const u64,
        words_left: usize,
    ) -> Self {
        Self {
            base,
            bits,
            next_word,
            words_left,
            current: ptr::null_mut(),
        }
    }

    /// Location of the last yielded value
    pub fn current_slot(&self) -> Option<*mut usize> {
        (!self.current.is_null()).then_some(self.current)
    }
}

impl ValueCursor for LiveValues {
    fn next_value(&mut self) -> Option<usize> {
        loop {
            while self.bits != 0 {
                let bit = self.bits.trailing_zeros() as usize;
                self.bits &= self.bits - 1;
                let slot = self.base.wrapping_add(bit);
                let value = load(slot);
                if value != 0 {
                    self.current = slot;
                    return Some(value);
                }
            }
            if self.words_left == 0 {
                return None;
            }
            // SAFETY: `words_left` overflow words remain at `next_word`.
            self.bits = unsafe { self.next_word.read() };
            self.next_word = self.next_word.wrapping_add(1);
            self.words_left -= 1;
            self.base = self.base.wrapping_add(BITS_PER_WORD);
        }
    }

    fn set_current(&mut self, value: usize) -> Result<()> {
        if self.current.is_null() {
            return Err(no_current());
        }
        store(self.current, value);
        Ok(())
    }
}

impl Iterator for LiveValues {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.next_value()
    }
}

/// Cursor over a dense run of reference slots
pub struct ArrayElements {
    next: *mut usize,
    remaining: usize,
    current: *mut usize,
}

impl ArrayElements {
    pub fn empty() -> Self {
        Self {
            next: ptr::null_mut(),
            remaining: 0,
            current: ptr::null_mut(),
        }
    }

    /// Elements of a reference array, or static slots of a class descriptor
    ///
    /// Anything else gives an exhausted cursor.
    pub fn for_object(object: ObjectRef) -> Self {
        match object.kind() {
            ObjectKind::ReferenceArray => Self {
                next: object.slot_addr(ARRAY_HEADER_SIZE),
                remaining: object.array_length(),
                current: ptr::null_mut(),
            },
            ObjectKind::Class => match object.as_class() {
                Some(class) => Self {
                    next: object.slot_addr(class.statics_offset()),
                    remaining: class.static_count(),
                    current: ptr::null_mut(),
                },
                None => Self::empty(),
            },
            _ => Self::empty(),
        }
    }
}

impl ValueCursor for ArrayElements {
    fn next_value(&mut self) -> Option<usize> {
        while self.remaining > 0 {
            let slot = self.next;
            self.next = self.next.wrapping_add(1);
            self.remaining -= 1;
            let value = load(slot);
            if value != 0 {
                self.current = slot;
                return Some(value);
            }
        }
        None
    }

    fn set_current(&mut self, value: usize) -> Result<()> {
        if self.current.is_null() {
            return Err(no_current());
        }
        store(self.current, value);
        Ok(())
    }
}

impl Iterator for ArrayElements {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.next_value()
    }
}
