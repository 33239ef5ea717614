//! Object Header and Handle
//!
//! Object Layout (64-bit):
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ word 0: class address | flags            │  <- Header
//! │   bit 0: MOVED                           │
//! │   bit 1: STACK_ALLOCATED                 │
//! ├──────────────────────────────────────────┤
//! │ instance: fields, per the class bitmap   │
//! │ array:    word 1 = length, then elements │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Forwarding record written over a relocated object:
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ word 0: original header | MOVED          │
//! │ word 1: new address                      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Every object is at least [`MIN_OBJECT_SIZE`] bytes so the record always
//! fits. Once MOVED is set, nothing but word 0 and word 1 may be read from
//! the old location.
//!
//! [`ObjectRef`] is the only way the crate reads or writes object memory.
//! Constructing one from an address is `unsafe`; once constructed, the handle
//! is trusted to point at an object with a valid header.

use crate::error::{fatal, Result, SgcError};
use crate::object::class::{ClassRef, ObjectKind};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a machine word
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Size of the object header (class word)
pub const HEADER_SIZE: usize = WORD_SIZE;

/// Header plus length word of an array
pub const ARRAY_HEADER_SIZE: usize = 2 * WORD_SIZE;

/// Smallest object; room for a forwarding record
pub const MIN_OBJECT_SIZE: usize = 2 * WORD_SIZE;

/// Header flag: object has been relocated, word 1 holds its new address
pub const MOVED_BIT: usize = 1 << 0;

/// Header flag: object lives outside the heap and is never relocated
pub const STACK_ALLOCATED_BIT: usize = 1 << 1;

/// Low bits of the header reserved for flags
pub const FLAG_MASK: usize = 0b111;

/// Word 0 of an object
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header(usize);

impl Header {
    /// Header for a fresh heap object of `class`
    #[inline]
    pub fn new(class: ClassRef) -> Self {
        Self(class.addr())
    }

    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Class address with the flag bits stripped
    #[inline]
    pub const fn class_addr(self) -> usize {
        self.0 & !FLAG_MASK
    }

    #[inline]
    pub const fn is_moved(self) -> bool {
        self.0 & MOVED_BIT != 0
    }

    #[inline]
    pub const fn is_stack_allocated(self) -> bool {
        self.0 & STACK_ALLOCATED_BIT != 0
    }

    #[inline]
    pub const fn with_moved(self) -> Self {
        Self(self.0 | MOVED_BIT)
    }

    #[inline]
    pub const fn with_stack_allocated(self) -> Self {
        Self(self.0 | STACK_ALLOCATED_BIT)
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("class", &format_args!("{:#x}", self.class_addr()))
            .field("moved", &self.is_moved())
            .field("stack_allocated", &self.is_stack_allocated())
            .finish()
    }
}

/// Handle to an object
///
/// Plain address, `Copy`. A handle held across a safepoint goes stale when
/// the collector moves the object; only references stored in traced slots
/// (frames, globals, fields) are updated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wrap a raw address; `None` for null
    ///
    /// # Safety
    /// A non-null `addr` must point at a word-aligned object whose header is
    /// valid for as long as the handle is used.
    #[inline]
    pub unsafe fn from_raw(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    /// Wrap an address known to be non-null
    ///
    /// # Safety
    /// Same contract as [`ObjectRef::from_raw`].
    #[inline]
    pub(crate) const unsafe fn from_non_null(addr: NonZeroUsize) -> Self {
        Self(addr)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.get()
    }

    #[inline]
    fn word(self, offset: usize) -> &'static AtomicUsize {
        // SAFETY: the handle invariant guarantees the object is mapped and
        // word aligned; callers keep `offset` inside the object.
        unsafe { &*((self.addr() + offset) as *const AtomicUsize) }
    }

    /// Raw address of the word at `offset`
    #[inline]
    pub(crate) fn slot_addr(self, offset: usize) -> *mut usize {
        (self.addr() + offset) as *mut usize
    }

    #[inline]
    pub fn header(self) -> Header {
        Header(self.word(0).load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_header(self, header: Header) {
        self.word(0).store(header.raw(), Ordering::Relaxed);
    }

    /// Class descriptor of this object
    #[inline]
    pub fn class(self) -> ClassRef {
        // SAFETY: a valid header always carries a class address.
        match unsafe { ClassRef::from_raw(self.header().class_addr()) } {
            Some(class) => class,
            None => fatal(SgcError::corruption(self.addr(), "object header has no class")),
        }
    }

    #[inline]
    pub fn kind(self) -> ObjectKind {
        self.class().instance_kind()
    }

    #[inline]
    pub fn is_moved(self) -> bool {
        self.header().is_moved()
    }

    #[inline]
    pub fn is_stack_allocated(self) -> bool {
        self.header().is_stack_allocated()
    }

    /// New location of a relocated object
    #[inline]
    pub fn forwardee(self) -> Option<ObjectRef> {
        if !self.is_moved() {
            return None;
        }
        // SAFETY: word 1 of a forwarding record is the copy's address.
        unsafe { ObjectRef::from_raw(self.word(WORD_SIZE).load(Ordering::Relaxed)) }
    }

    /// Overwrite this object with a forwarding record to `to`
    ///
    /// Destroys every field; the caller must have copied the object first.
    #[inline]
    pub(crate) fn forward_to(self, to: ObjectRef) {
        let header = self.header().with_moved();
        self.word(WORD_SIZE).store(to.addr(), Ordering::Relaxed);
        self.word(0).store(header.raw(), Ordering::Release);
    }

    /// Element count of an array; 0 for anything else
    #[inline]
    pub fn array_length(self) -> usize {
        if self.kind().is_array() {
            self.word(WORD_SIZE).load(Ordering::Relaxed)
        } else {
            0
        }
    }

    #[inline]
    pub(crate) fn set_array_length(self, len: usize) {
        self.word(WORD_SIZE).store(len, Ordering::Relaxed);
    }

    /// Size in bytes, before rounding to the object alignment
    pub fn size(self) -> usize {
        let class = self.class();
        match class.instance_kind() {
            ObjectKind::Instance => class.instance_size(),
            ObjectKind::ReferenceArray => ARRAY_HEADER_SIZE + self.array_length() * WORD_SIZE,
            ObjectKind::PrimitiveArray => {
                ARRAY_HEADER_SIZE + self.array_length() * class.element_size()
            }
            ObjectKind::Class => self.as_class().map_or(0, |c| c.descriptor_size()),
        }
    }

    /// View a class object as its descriptor
    #[inline]
    pub fn as_class(self) -> Option<ClassRef> {
        if self.kind() == ObjectKind::Class {
            // SAFETY: objects of kind Class are class descriptors.
            unsafe { ClassRef::from_raw(self.addr()) }
        } else {
            None
        }
    }

    // ------------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------------

    fn check_field(self, offset: usize) -> Result<()> {
        let size = self.size();
        if offset < HEADER_SIZE || offset % WORD_SIZE != 0 || offset + WORD_SIZE > size {
            return Err(SgcError::InvalidArgument(format!(
                "field offset {} out of bounds for object of {} bytes",
                offset, size
            )));
        }
        Ok(())
    }

    /// Reference stored at byte `offset`
    ///
    /// Fails with [`SgcError::InvalidArgument`] if `offset` is not a
    /// word-aligned field inside the object. The same holds for every
    /// accessor below.
    pub fn get_ref(self, offset: usize) -> Result<Option<ObjectRef>> {
        self.check_field(offset)?;
        // SAFETY: reference fields only ever hold object addresses or null.
        Ok(unsafe { ObjectRef::from_raw(self.word(offset).load(Ordering::Relaxed)) })
    }

    /// Store a reference at byte `offset`
    pub fn set_ref(self, offset: usize, value: Option<ObjectRef>) -> Result<()> {
        self.check_field(offset)?;
        self.word(offset)
            .store(value.map_or(0, ObjectRef::addr), Ordering::Relaxed);
        Ok(())
    }

    /// Primitive word at byte `offset`
    pub fn get_word(self, offset: usize) -> Result<u64> {
        self.check_field(offset)?;
        Ok(self.word(offset).load(Ordering::Relaxed) as u64)
    }

    /// Store a primitive word at byte `offset`
    pub fn set_word(self, offset: usize, value: u64) -> Result<()> {
        self.check_field(offset)?;
        self.word(offset).store(value as usize, Ordering::Relaxed);
        Ok(())
    }

    fn expect_kind(self, kind: ObjectKind) -> Result<()> {
        let actual = self.kind();
        if actual != kind {
            return Err(SgcError::InvalidArgument(format!(
                "expected a {:?} object, found {:?}",
                kind, actual
            )));
        }
        Ok(())
    }

    fn element_offset(self, index: usize) -> Result<usize> {
        self.expect_kind(ObjectKind::ReferenceArray)?;
        let len = self.array_length();
        if index >= len {
            return Err(SgcError::InvalidArgument(format!(
                "index {} out of bounds for length {}",
                index, len
            )));
        }
        Ok(ARRAY_HEADER_SIZE + index * WORD_SIZE)
    }

    /// Element `index` of a reference array
    pub fn element(self, index: usize) -> Result<Option<ObjectRef>> {
        let offset = self.element_offset(index)?;
        // SAFETY: reference array elements hold object addresses or null.
        Ok(unsafe { ObjectRef::from_raw(self.word(offset).load(Ordering::Relaxed)) })
    }

    /// Store element `index` of a reference array
    pub fn set_element(self, index: usize, value: Option<ObjectRef>) -> Result<()> {
        let offset = self.element_offset(index)?;
        self.word(offset)
            .store(value.map_or(0, ObjectRef::addr), Ordering::Relaxed);
        Ok(())
    }

    fn payload_len(self) -> Result<usize> {
        self.expect_kind(ObjectKind::PrimitiveArray)?;
        Ok(self.array_length() * self.class().element_size())
    }

    /// Copy of the payload of a primitive array
    pub fn primitive_bytes(self) -> Result<Vec<u8>> {
        let len = self.payload_len()?;
        let mut out = vec![0u8; len];
        // SAFETY: the payload lies inside the object.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (self.addr() + ARRAY_HEADER_SIZE) as *const u8,
                out.as_mut_ptr(),
                len,
            )
        };
        Ok(out)
    }

    /// Overwrite the start of a primitive array's payload
    ///
    /// Fails if `bytes` is longer than the payload.
    pub fn write_primitive_bytes(self, bytes: &[u8]) -> Result<()> {
        let len = self.payload_len()?;
        if bytes.len() > len {
            return Err(SgcError::InvalidArgument(format!(
                "{} bytes do not fit in a payload of {}",
                bytes.len(),
                len
            )));
        }
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (self.addr() + ARRAY_HEADER_SIZE) as *mut u8,
                bytes.len(),
            )
        };
        Ok(())
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

// SAFETY: a handle is an address; access goes through atomic words.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}
