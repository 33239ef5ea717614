//! Class Descriptors - Reference Layout Consumed by the Collector
//!
//! The class-metadata collaborator describes each class with a
//! [`ClassLayout`]; the runtime lays it out as a descriptor object in the
//! class region:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ header        -> meta class              │  0
//! │ instance_size u32 | element_size u32     │  8
//! │ kind u32          | flags u32            │ 16
//! │ ref_bits u64  (bit i = word i holds ref) │ 24
//! │ ext_count u32     | static_count u32     │ 32
//! ├──────────────────────────────────────────┤
//! │ ext_count overflow bitmap words          │ 40
//! ├──────────────────────────────────────────┤
//! │ static_count static reference slots      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Word 0 of every descriptor points at [`ClassRef::meta`], a static
//! descriptor that describes descriptors. Bit `i` of bitmap word `k` marks
//! the word at byte offset `(64 * k + i) * 8` of an instance as a reference.

use crate::error::{fatal, Result, SgcError};
use crate::object::header::{
    Header, ObjectRef, ARRAY_HEADER_SIZE, HEADER_SIZE, MIN_OBJECT_SIZE, WORD_SIZE,
};
use crate::heap::page::align_up;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// What the instances of a class look like
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ObjectKind {
    /// Fixed-size object with a reference bitmap
    Instance = 1,
    /// Array whose elements are all references
    ReferenceArray = 2,
    /// Array of primitive elements
    PrimitiveArray = 3,
    /// Class descriptor
    Class = 4,
}

impl ObjectKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(ObjectKind::Instance),
            2 => Some(ObjectKind::ReferenceArray),
            3 => Some(ObjectKind::PrimitiveArray),
            4 => Some(ObjectKind::Class),
            _ => None,
        }
    }

    #[inline]
    pub fn is_array(self) -> bool {
        matches!(self, ObjectKind::ReferenceArray | ObjectKind::PrimitiveArray)
    }
}

/// Descriptor flag: overflow bitmap words follow the fixed part
pub const CLASS_FLAG_EXTENDED: u32 = 1 << 0;

/// Fixed part of a class descriptor
#[repr(C)]
pub struct ClassInfo {
    header: usize,
    instance_size: u32,
    element_size: u32,
    kind: u32,
    flags: u32,
    ref_bits: u64,
    ext_count: u32,
    static_count: u32,
}

/// Size of [`ClassInfo`]; overflow words start here
pub const CLASS_INFO_SIZE: usize = std::mem::size_of::<ClassInfo>();

static META_CLASS: ClassInfo = ClassInfo {
    header: 0,
    instance_size: 0,
    element_size: 0,
    kind: ObjectKind::Class as u32,
    flags: 0,
    ref_bits: 0,
    ext_count: 0,
    static_count: 0,
};

/// Handle to a class descriptor
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassRef(NonNull<ClassInfo>);

// SAFETY: descriptors are immutable after definition apart from static
// slots, which are accessed through atomic words.
unsafe impl Send for ClassRef {}
unsafe impl Sync for ClassRef {}

impl ClassRef {
    /// Wrap a descriptor address; `None` for null
    ///
    /// # Safety
    /// A non-null `addr` must point at a descriptor that stays mapped.
    #[inline]
    pub unsafe fn from_raw(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut ClassInfo).map(Self)
    }

    /// The descriptor of descriptors
    #[inline]
    pub fn meta() -> Self {
        Self(NonNull::from(&META_CLASS))
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    fn info(self) -> &'static ClassInfo {
        // SAFETY: guaranteed by `from_raw`'s contract.
        unsafe { &*self.0.as_ptr() }
    }

    #[inline]
    pub fn is_meta(self) -> bool {
        self == Self::meta()
    }

    /// Address stored in the descriptor's own header word
    #[inline]
    pub fn header(self) -> Header {
        Header::from_raw(self.info().header)
    }

    /// Raw kind tag, for validation
    #[inline]
    pub fn raw_kind(self) -> u32 {
        self.info().kind
    }

    /// Kind of the instances this class describes
    #[inline]
    pub fn instance_kind(self) -> ObjectKind {
        match ObjectKind::from_raw(self.info().kind) {
            Some(kind) => kind,
            None => fatal(SgcError::corruption(self.addr(), "unknown class kind")),
        }
    }

    #[inline]
    pub fn instance_size(self) -> usize {
        self.info().instance_size as usize
    }

    #[inline]
    pub fn element_size(self) -> usize {
        self.info().element_size as usize
    }

    /// First reference bitmap word
    #[inline]
    pub fn reference_bits(self) -> u64 {
        self.info().ref_bits
    }

    #[inline]
    pub fn is_extended(self) -> bool {
        self.info().flags & CLASS_FLAG_EXTENDED != 0
    }

    /// Overflow bitmap words, for classes with references past word 63
    pub fn extension_words(self) -> &'static [u64] {
        let count = if self.is_extended() {
            self.info().ext_count as usize
        } else {
            0
        };
        // SAFETY: the descriptor was laid out with `count` words after the
        // fixed part.
        unsafe {
            std::slice::from_raw_parts((self.addr() + CLASS_INFO_SIZE) as *const u64, count)
        }
    }

    #[inline]
    pub fn static_count(self) -> usize {
        self.info().static_count as usize
    }

    /// Byte offset of the first static slot within the descriptor
    #[inline]
    pub fn statics_offset(self) -> usize {
        CLASS_INFO_SIZE + self.info().ext_count as usize * WORD_SIZE
    }

    /// Size of the descriptor object in bytes
    #[inline]
    pub fn descriptor_size(self) -> usize {
        self.statics_offset() + self.static_count() * WORD_SIZE
    }

    /// The descriptor viewed as an object
    #[inline]
    pub fn as_object(self) -> ObjectRef {
        // SAFETY: a descriptor is an object whose class is the meta class.
        unsafe { ObjectRef::from_non_null(self.0.addr()) }
    }

    fn static_offset(self, index: usize) -> Result<usize> {
        if index >= self.static_count() {
            return Err(SgcError::InvalidArgument(format!(
                "static {} out of bounds for {} statics",
                index,
                self.static_count()
            )));
        }
        Ok(self.statics_offset() + index * WORD_SIZE)
    }

    /// Static reference slot `index`
    pub fn get_static(self, index: usize) -> Result<Option<ObjectRef>> {
        self.as_object().get_ref(self.static_offset(index)?)
    }

    /// Store static reference slot `index`
    pub fn set_static(self, index: usize, value: Option<ObjectRef>) -> Result<()> {
        self.as_object().set_ref(self.static_offset(index)?, value)
    }
}

impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_meta() {
            return write!(f, "ClassRef(meta)");
        }
        f.debug_struct("ClassRef")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("kind", &ObjectKind::from_raw(self.raw_kind()))
            .field("instance_size", &self.instance_size())
            .finish()
    }
}

/// Description of a class, as produced by the class-metadata loader
///
/// # Examples
///
/// ```rust
/// use sgc::ClassLayout;
///
/// // header, `next` reference, `value` word
/// let node = ClassLayout::instance(24).with_references(&[8]);
/// assert!(node.validate().is_ok());
///
/// let bytes = ClassLayout::primitive_array(1);
/// let objects = ClassLayout::reference_array().with_statics(2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLayout {
    kind: ObjectKind,
    instance_size: usize,
    element_size: usize,
    reference_offsets: Vec<usize>,
    statics: usize,
}

impl ClassLayout {
    /// Plain object of `size` bytes, header included
    ///
    /// Sizes below the minimum object size are padded up to it.
    pub fn instance(size: usize) -> Self {
        Self {
            kind: ObjectKind::Instance,
            instance_size: align_up(size.max(MIN_OBJECT_SIZE), WORD_SIZE),
            element_size: 0,
            reference_offsets: Vec::new(),
            statics: 0,
        }
    }

    /// Array of references
    pub fn reference_array() -> Self {
        Self {
            kind: ObjectKind::ReferenceArray,
            instance_size: ARRAY_HEADER_SIZE,
            element_size: WORD_SIZE,
            reference_offsets: Vec::new(),
            statics: 0,
        }
    }

    /// Array of primitives of `element_size` bytes each
    pub fn primitive_array(element_size: usize) -> Self {
        Self {
            kind: ObjectKind::PrimitiveArray,
            instance_size: ARRAY_HEADER_SIZE,
            element_size,
            reference_offsets: Vec::new(),
            statics: 0,
        }
    }

    /// Mark the words at these byte offsets as references
    pub fn with_references(mut self, offsets: &[usize]) -> Self {
        self.reference_offsets.extend_from_slice(offsets);
        self.reference_offsets.sort_unstable();
        self.reference_offsets.dedup();
        self
    }

    /// Give the class `count` static reference slots
    pub fn with_statics(mut self, count: usize) -> Self {
        self.statics = count;
        self
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[inline]
    pub fn instance_size(&self) -> usize {
        self.instance_size
    }

    /// Check the layout is something the collector can trace
    pub fn validate(&self) -> Result<()> {
        if self.kind == ObjectKind::Class {
            return Err(SgcError::InvalidArgument(
                "class descriptors are defined by the runtime".to_string(),
            ));
        }
        if self.instance_size > u32::MAX as usize {
            return Err(SgcError::InvalidArgument(format!(
                "instance size {} too large",
                self.instance_size
            )));
        }
        if self.statics > u32::MAX as usize {
            return Err(SgcError::InvalidArgument(format!(
                "{} statics is too many",
                self.statics
            )));
        }
        if self.kind == ObjectKind::PrimitiveArray
            && !matches!(self.element_size, 1 | 2 | 4 | 8)
        {
            return Err(SgcError::InvalidArgument(format!(
                "element size {} must be 1, 2, 4 or 8",
                self.element_size
            )));
        }
        if self.kind != ObjectKind::Instance && !self.reference_offsets.is_empty() {
            return Err(SgcError::InvalidArgument(
                "only instances carry reference fields".to_string(),
            ));
        }
        for &offset in &self.reference_offsets {
            if offset < HEADER_SIZE
                || offset % WORD_SIZE != 0
                || offset + WORD_SIZE > self.instance_size
            {
                return Err(SgcError::InvalidArgument(format!(
                    "reference offset {} is not a field of a {}-byte instance",
                    offset, self.instance_size
                )));
            }
        }
        Ok(())
    }

    /// Reference bitmap: the first word followed by the overflow words
    pub(crate) fn bitmap_words(&self) -> Vec<u64> {
        let Some(&last) = self.reference_offsets.last() else {
            return vec![0];
        };
        let mut words = vec![0u64; last / WORD_SIZE / 64 + 1];
        for &offset in &self.reference_offsets {
            let bit = offset / WORD_SIZE;
            words[bit / 64] |= 1u64 << (bit % 64);
        }
        words
    }

    /// Bytes the descriptor occupies in the class region
    pub fn descriptor_size(&self) -> usize {
        let ext = self.bitmap_words().len() - 1;
        CLASS_INFO_SIZE + (ext + self.statics) * WORD_SIZE
    }

    /// Write the descriptor at `addr`
    ///
    /// # Safety
    /// `addr` must be word aligned, zeroed, and hold `descriptor_size()`
    /// writable bytes that stay mapped for as long as the class is used.
    pub(crate) unsafe fn write_descriptor(&self, addr: NonZeroUsize) -> ClassRef {
        let addr = addr.get();
        let words = self.bitmap_words();
        let ext_count = words.len() - 1;
        let info = ClassInfo {
            header: ClassRef::meta().addr(),
            instance_size: self.instance_size as u32,
            element_size: self.element_size as u32,
            kind: self.kind as u32,
            flags: if ext_count > 0 { CLASS_FLAG_EXTENDED } else { 0 },
            ref_bits: words[0],
            ext_count: ext_count as u32,
            static_count: self.statics as u32,
        };
        std::ptr::write(addr as *mut ClassInfo, info);
        let ext = (addr + CLASS_INFO_SIZE) as *mut u64;
        for (i, word) in words[1..].iter().enumerate() {
            ext.add(i).write(*word);
        }
        // Statics start out null; the memory was zeroed.
        ClassRef(NonNull::new_unchecked(addr as *mut ClassInfo))
    }
}

/// Descriptor living in its own allocation, outside any heap
#[cfg(test)]
pub(crate) struct OwnedClass {
    class: ClassRef,
    layout: std::alloc::Layout,
}

#[cfg(test)]
impl OwnedClass {
    pub(crate) fn new(layout: &ClassLayout) -> Result<Self> {
        layout.validate()?;
        let alloc_layout = std::alloc::Layout::from_size_align(layout.descriptor_size(), 8)
            .map_err(|e| SgcError::InvalidArgument(e.to_string()))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(alloc_layout) };
        let addr = NonZeroUsize::new(ptr as usize).expect("allocation failed");
        let class = unsafe { layout.write_descriptor(addr) };
        Ok(Self {
            class,
            layout: alloc_layout,
        })
    }

    pub(crate) fn class_ref(&self) -> ClassRef {
        self.class
    }
}

#[cfg(test)]
impl Drop for OwnedClass {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.class.addr() as *mut u8, self.layout) };
    }
}
