//! Global Roots - Statically Allocated Reference Slots
//!
//! Collaborators register the address and length of every static array of
//! reference-typed variables. The collector treats each non-null slot as a
//! root and rewrites it during fix-up.

use crate::error::{Result, SgcError};
use crate::object::header::WORD_SIZE;
use parking_lot::RwLock;
use std::sync::atomic::AtomicUsize;

/// One registered run of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GlobalRoots {
    base: usize,
    count: usize,
}

/// Table of registered global reference slots
#[derive(Debug, Default)]
pub struct RootTable {
    entries: RwLock<Vec<GlobalRoots>>,
}

impl RootTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `count` reference slots starting at `base`
    ///
    /// # Safety
    /// The slots must stay valid, word aligned and hold only null or object
    /// references until unregistered. The collector reads and rewrites them
    /// while the world is stopped.
    pub unsafe fn register(&self, base: *mut usize, count: usize) -> Result<()> {
        let base = base as usize;
        if base == 0 || count == 0 {
            return Err(SgcError::InvalidArgument(
                "global roots need a non-null base and a non-zero count".to_string(),
            ));
        }
        if base % WORD_SIZE != 0 {
            return Err(SgcError::InvalidArgument(format!(
                "global roots at {:#x} are misaligned",
                base
            )));
        }
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.base == base) {
            return Err(SgcError::InvalidArgument(format!(
                "global roots at {:#x} already registered",
                base
            )));
        }
        entries.push(GlobalRoots { base, count });
        Ok(())
    }

    /// Forget the run registered at `base`
    pub fn unregister(&self, base: *mut usize) -> Result<()> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.base != base as usize);
        if entries.len() == before {
            return Err(SgcError::InvalidArgument(format!(
                "no global roots registered at {:#x}",
                base as usize
            )));
        }
        Ok(())
    }

    /// Number of registered runs
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total number of registered slots
    pub fn slot_count(&self) -> usize {
        self.entries.read().iter().map(|e| e.count).sum()
    }

    /// Visit every registered slot
    pub(crate) fn for_each_slot(
        &self,
        mut visit: impl FnMut(&AtomicUsize) -> Result<()>,
    ) -> Result<()> {
        for entry in self.entries.read().iter() {
            for i in 0..entry.count {
                // SAFETY: guaranteed by `register`'s contract.
                let slot = unsafe { &*((entry.base + i * WORD_SIZE) as *const AtomicUsize) };
                visit(slot)?;
            }
        }
        Ok(())
    }
}
