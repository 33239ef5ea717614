//! Heap Module - Reservation, Regions and Reference Validation
//!
//! The heap is one anonymous reservation split into five regions:
//!
//! ```text
//! base                                                             limit
//! ┌─────────┬─────────┬─────────┬──────────────────┬──────────────────┐
//! │ classes │  image  │ strings │   semispace A    │   semispace B    │
//! └─────────┴─────────┴─────────┴──────────────────┴──────────────────┘
//!  permanent: traced and fixed up,  movable objects: one is active, the
//!  never relocated                  other is the copy target of the next
//!                                   collection
//! ```
//!
//! Permanent regions only grow; nothing in them is ever reclaimed.

pub mod memory_mapping;
pub mod page;
pub mod region;

pub use memory_mapping::MemoryMapping;
pub use region::Region;

use crate::config::GcConfig;
use crate::error::{Result, SgcError};
use crate::object::class::{ClassLayout, ClassRef, ObjectKind};
use crate::object::header::{Header, ObjectRef, ARRAY_HEADER_SIZE, WORD_SIZE};
use indexmap::IndexMap;
use page::{align_to_page, align_up};
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of heap occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapUsage {
    /// Bytes allocated in the active semispace
    pub used: usize,
    /// Current soft limit of the active semispace
    pub limit: usize,
    /// Capacity of one semispace
    pub capacity: usize,
    pub class_region_used: usize,
    pub image_region_used: usize,
    pub string_region_used: usize,
}

/// The managed heap
pub struct Heap {
    mapping: MemoryMapping,
    classes: Region,
    image: Region,
    strings: Region,
    spaces: [Region; 2],
    /// Index into `spaces` of the semispace mutators allocate in
    active: AtomicUsize,
    alignment: usize,
    min_sane_address: usize,
    /// Floor for the active semispace's soft limit
    min_space_limit: usize,
    byte_array_class: ClassRef,
    interned: Mutex<IndexMap<String, ObjectRef>>,
}

impl Heap {
    /// Reserve and lay out the heap
    pub fn new(config: &GcConfig) -> Result<Self> {
        config.validate()?;
        let alignment = config.object_alignment;

        let class_size = align_to_page(config.class_region_size);
        let image_size = align_to_page(config.image_region_size);
        let string_size = align_to_page(config.string_region_size);
        let space_size = align_to_page(config.semispace_size());

        let total = [class_size, image_size, string_size, space_size, space_size]
            .iter()
            .try_fold(0usize, |acc, &size| acc.checked_add(size))
            .ok_or_else(|| {
                SgcError::InvalidArgument("heap layout overflows the address space".to_string())
            })?;

        let mapping = MemoryMapping::anonymous(total)?;
        let mut cursor = mapping.base();
        let mut carve = |name: &'static str, size: usize| -> Result<Region> {
            let region = Region::new(name, cursor, size, alignment)?;
            cursor += size;
            Ok(region)
        };

        let classes = carve("classes", class_size)?;
        let image = carve("image", image_size)?;
        let strings = carve("strings", string_size)?;
        let spaces = [carve("space-a", space_size)?, carve("space-b", space_size)?];

        let min_space_limit = align_up(config.min_heap_size / 2, alignment).min(space_size);
        spaces[0].set_limit(min_space_limit);

        let byte_array_layout = ClassLayout::primitive_array(1);
        let addr = classes
            .allocate(byte_array_layout.descriptor_size())
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| SgcError::OutOfMemory {
                requested: byte_array_layout.descriptor_size(),
                available: classes.available(),
            })?;
        // SAFETY: fresh zeroed memory in the class region.
        let byte_array_class = unsafe { byte_array_layout.write_descriptor(addr) };

        log::debug!(
            "sgc: heap reserved at {:#x}, {} bytes ({} per semispace)",
            mapping.base(),
            total,
            space_size
        );

        Ok(Self {
            mapping,
            classes,
            image,
            strings,
            spaces,
            active: AtomicUsize::new(0),
            alignment,
            min_sane_address: config.min_sane_address,
            min_space_limit,
            byte_array_class,
            interned: Mutex::new(IndexMap::new()),
        })
    }

    // ========================================================================
    // LAYOUT
    // ========================================================================

    /// First byte of the reservation
    #[inline]
    pub fn base(&self) -> usize {
        self.mapping.base()
    }

    /// One past the last byte of the reservation
    #[inline]
    pub fn limit(&self) -> usize {
        self.mapping.end()
    }

    /// Check if `addr` lies inside the reservation
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.mapping.contains(addr)
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub fn min_sane_address(&self) -> usize {
        self.min_sane_address
    }

    #[inline]
    fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Semispace mutators allocate in
    #[inline]
    pub fn active_space(&self) -> &Region {
        &self.spaces[self.active_index()]
    }

    /// Semispace the next collection copies into
    #[inline]
    pub fn spare_space(&self) -> &Region {
        &self.spaces[1 - self.active_index()]
    }

    #[inline]
    pub fn class_region(&self) -> &Region {
        &self.classes
    }

    #[inline]
    pub fn image_region(&self) -> &Region {
        &self.image
    }

    #[inline]
    pub fn string_region(&self) -> &Region {
        &self.strings
    }

    /// Class, image and string regions, in that order
    pub fn permanent_regions(&self) -> [&Region; 3] {
        [&self.classes, &self.image, &self.strings]
    }

    /// Class of the byte arrays backing interned strings
    pub fn byte_array_class(&self) -> ClassRef {
        self.byte_array_class
    }

    pub fn usage(&self) -> HeapUsage {
        let active = self.active_space();
        HeapUsage {
            used: active.used(),
            limit: active.limit(),
            capacity: active.capacity(),
            class_region_used: self.classes.used(),
            image_region_used: self.image.used(),
            string_region_used: self.strings.used(),
        }
    }

    // ========================================================================
    // ALLOCATION
    // ========================================================================

    /// Bump-allocate in the active semispace
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<NonZeroUsize> {
        self.active_space().allocate(size).and_then(NonZeroUsize::new)
    }

    /// Allocate in the active semispace, growing its soft limit if needed
    pub fn allocate_growing(&self, size: usize) -> Option<NonZeroUsize> {
        self.active_space()
            .allocate_growing(size)
            .and_then(NonZeroUsize::new)
    }

    fn allocate_permanent(&self, region: &Region, size: usize) -> Result<NonZeroUsize> {
        let addr = region.allocate(size).and_then(NonZeroUsize::new);
        addr.ok_or_else(|| SgcError::OutOfMemory {
            requested: size,
            available: region.available(),
        })
    }

    /// Bytes needed for an instance or array of `class`
    pub fn object_size(&self, class: ClassRef, length: usize) -> Result<usize> {
        let too_big =
            || SgcError::InvalidArgument(format!("array of {} elements is too large", length));
        match class.instance_kind() {
            ObjectKind::Instance => Ok(class.instance_size()),
            ObjectKind::ReferenceArray | ObjectKind::PrimitiveArray => {
                let element_size = if class.instance_kind() == ObjectKind::ReferenceArray {
                    WORD_SIZE
                } else {
                    class.element_size()
                };
                length
                    .checked_mul(element_size)
                    .and_then(|bytes| bytes.checked_add(ARRAY_HEADER_SIZE))
                    .ok_or_else(too_big)
            }
            ObjectKind::Class => Err(SgcError::InvalidArgument(
                "class descriptors are created with define_class".to_string(),
            )),
        }
    }

    /// Write the header (and length) of a fresh object at `addr`
    ///
    /// # Safety
    /// `addr` must be a zeroed block of at least
    /// `object_size(class, length)` bytes returned by one of the heap's
    /// allocators.
    pub(crate) unsafe fn init_object(
        &self,
        addr: NonZeroUsize,
        class: ClassRef,
        length: usize,
    ) -> ObjectRef {
        let object = ObjectRef::from_non_null(addr);
        if class.instance_kind().is_array() {
            object.set_array_length(length);
        }
        object.set_header(Header::new(class));
        object
    }

    /// Lay out a class descriptor in the class region
    pub fn define_class(&self, layout: &ClassLayout) -> Result<ClassRef> {
        layout.validate()?;
        let addr = self.allocate_permanent(&self.classes, layout.descriptor_size())?;
        // SAFETY: fresh zeroed memory in the class region.
        Ok(unsafe { layout.write_descriptor(addr) })
    }

    /// Allocate a pre-initialized object in the image region
    pub fn new_image_object(&self, class: ClassRef, length: usize) -> Result<ObjectRef> {
        let size = self.object_size(class, length)?;
        let addr = self.allocate_permanent(&self.image, size)?;
        // SAFETY: fresh zeroed block of `size` bytes.
        Ok(unsafe { self.init_object(addr, class, length) })
    }

    /// Canonical byte array for `value`, in the string region
    pub fn intern_string(&self, value: &str) -> Result<ObjectRef> {
        let mut table = self.interned.lock();
        if let Some(&object) = table.get(value) {
            return Ok(object);
        }
        let size = self.object_size(self.byte_array_class, value.len())?;
        let addr = self.allocate_permanent(&self.strings, size)?;
        // SAFETY: fresh zeroed block of `size` bytes.
        let object = unsafe { self.init_object(addr, self.byte_array_class, value.len()) };
        object.write_primitive_bytes(value.as_bytes())?;
        table.insert(value.to_owned(), object);
        Ok(object)
    }

    /// Number of distinct interned strings
    pub fn interned_count(&self) -> usize {
        self.interned.lock().len()
    }

    // ========================================================================
    // VALIDATION
    // ========================================================================

    /// Turn a raw reference into a handle, or report corruption
    ///
    /// Accepts objects in the allocated part of any region, stack-allocated
    /// objects outside the heap, and the meta class.
    pub fn resolve(&self, raw: usize) -> Result<ObjectRef> {
        if raw < self.min_sane_address {
            return Err(SgcError::corruption(raw, "below minimum sane address"));
        }
        if raw % WORD_SIZE != 0 {
            return Err(SgcError::corruption(raw, "misaligned reference"));
        }
        if raw == ClassRef::meta().addr() {
            return Ok(ClassRef::meta().as_object());
        }

        let in_heap = self.contains(raw);
        if in_heap && !self.is_allocated(raw) {
            return Err(SgcError::corruption(raw, "reference into unallocated heap space"));
        }

        // SAFETY: the address is either allocated heap memory or, outside
        // the heap, trusted to be a stack-allocated object; the header is
        // validated before the handle escapes.
        let object = match unsafe { ObjectRef::from_raw(raw) } {
            Some(object) => object,
            None => return Err(SgcError::corruption(raw, "null reference")),
        };
        let header = object.header();
        if in_heap == header.is_stack_allocated() {
            return Err(SgcError::corruption(
                raw,
                if in_heap {
                    "heap object flagged as stack allocated"
                } else {
                    "reference outside the heap"
                },
            ));
        }
        self.validate_class(raw, header.class_addr())?;
        Ok(object)
    }

    fn is_allocated(&self, addr: usize) -> bool {
        self.spaces.iter().any(|r| r.contains(addr))
            || self.permanent_regions().iter().any(|r| r.contains(addr))
    }

    fn validate_class(&self, object: usize, class_addr: usize) -> Result<()> {
        let meta = ClassRef::meta();
        if class_addr == meta.addr() {
            return Ok(());
        }
        if !self.classes.contains(class_addr) {
            return Err(SgcError::corruption(
                object,
                format!("class word {:#x} is outside the class region", class_addr),
            ));
        }
        // SAFETY: allocated memory in the class region.
        let class = match unsafe { ClassRef::from_raw(class_addr) } {
            Some(class) => class,
            None => return Err(SgcError::corruption(object, "null class word")),
        };
        if class.header().raw() != meta.addr() {
            return Err(SgcError::corruption(
                object,
                format!("class word {:#x} does not point at a class", class_addr),
            ));
        }
        if ObjectKind::from_raw(class.raw_kind()).is_none() {
            return Err(SgcError::corruption(object, "class has an unknown kind"));
        }
        Ok(())
    }

    /// Check if `object` is an ordinary heap object (has a mark bit)
    #[inline]
    pub fn is_heap_object(&self, object: ObjectRef) -> bool {
        self.contains(object.addr())
    }

    /// Size of `object` rounded to the object alignment
    #[inline]
    pub fn aligned_size(&self, object: ObjectRef) -> usize {
        align_up(object.size(), self.alignment)
    }

    /// Walk the objects allocated in `region`, in address order
    pub fn objects<'h>(&'h self, region: &'h Region) -> ObjectWalker<'h> {
        ObjectWalker {
            heap: self,
            cursor: region.start(),
            end: region.top(),
        }
    }

    // ========================================================================
    // COLLECTION SUPPORT
    // ========================================================================

    /// Make the spare semispace active and give the old one back to the OS
    ///
    /// Only called with the world stopped, after every live object has been
    /// copied out of the old active semispace.
    pub(crate) fn swap_spaces(&self) -> Result<()> {
        let old = self.active_index();
        let region = &self.spaces[old];
        self.mapping
            .discard(region.start() - self.base(), region.capacity())?;
        region.reset();
        region.set_limit(region.capacity());
        self.active.store(1 - old, Ordering::Release);
        Ok(())
    }

    /// Size the active semispace's soft limit for `live` surviving bytes
    ///
    /// Returns the new limit.
    pub(crate) fn resize_after_collection(&self, live: usize) -> usize {
        let target = live.saturating_mul(2).max(self.min_space_limit);
        self.active_space().set_limit(align_up(target, self.alignment))
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("mapping", &self.mapping)
            .field("active", self.active_space())
            .field("spare", self.spare_space())
            .finish()
    }
}

/// Linear walk over a region's objects
pub struct ObjectWalker<'h> {
    heap: &'h Heap,
    cursor: usize,
    end: usize,
}

impl Iterator for ObjectWalker<'_> {
    type Item = Result<ObjectRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            return None;
        }
        let object = match self.heap.resolve(self.cursor) {
            Ok(object) => object,
            Err(err) => {
                self.cursor = self.end;
                return Some(Err(err));
            }
        };
        let size = self.heap.aligned_size(object);
        if size == 0 {
            self.cursor = self.end;
            return Some(Err(SgcError::corruption(object.addr(), "zero-sized object")));
        }
        self.cursor += size;
        Some(Ok(object))
    }
}
