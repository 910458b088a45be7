//! Hardware page-directory contract.
//!
//! The VM core manipulates address translation only through [`PageDir`],
//! the seam behind which the x86 page-table encoding lives. The host build
//! and the test suite use [`SimPageDir`], which models mappings plus the
//! accessed/dirty bits the eviction clock depends on.

use alloc::{collections::BTreeMap, sync::Arc};

use spin::Mutex;

/// Identifier of a physical frame in the frame table.
pub type FrameId = u64;

/// A hardware mapping as visible to the VM layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub frame: FrameId,
    pub writable: bool,
}

/// Per-process address translation.
pub trait PageDir: Send + Sync {
    /// Install `upage -> frame`. Replaces any existing mapping.
    fn map(&self, upage: usize, frame: FrameId, writable: bool);

    /// Remove the mapping for `upage`, if any.
    fn unmap(&self, upage: usize);

    /// Current mapping of `upage`.
    fn mapping(&self, upage: usize) -> Option<Mapping>;

    /// Downgrade/upgrade the writable bit without remapping.
    fn set_writable(&self, upage: usize, writable: bool);

    /// Clear the accessed bit, returning its previous value.
    fn clear_accessed(&self, upage: usize) -> bool;

    /// Hardware dirty bit.
    fn is_dirty(&self, upage: usize) -> bool;

    fn clear_dirty(&self, upage: usize);

    /// Mark the page accessed (and dirty on writes). Called on the
    /// software access paths that stand in for real loads and stores.
    fn mark_access(&self, upage: usize, write: bool);

    /// Invalidate any cached translation for `upage`.
    fn flush_tlb(&self, upage: usize);

    /// Make this the active address space (no-op off hardware).
    fn activate(&self);
}

#[derive(Debug, Clone, Copy)]
struct SimEntry {
    frame: FrameId,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Map-backed page directory for the host build and tests.
pub struct SimPageDir {
    entries: Mutex<BTreeMap<usize, SimEntry>>,
}

impl SimPageDir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(BTreeMap::new()),
        })
    }

    /// Number of live mappings (tests).
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl PageDir for SimPageDir {
    fn map(&self, upage: usize, frame: FrameId, writable: bool) {
        self.entries.lock().insert(
            upage,
            SimEntry {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );
    }

    fn unmap(&self, upage: usize) {
        self.entries.lock().remove(&upage);
    }

    fn mapping(&self, upage: usize) -> Option<Mapping> {
        self.entries.lock().get(&upage).map(|e| Mapping {
            frame: e.frame,
            writable: e.writable,
        })
    }

    fn set_writable(&self, upage: usize, writable: bool) {
        if let Some(e) = self.entries.lock().get_mut(&upage) {
            e.writable = writable;
        }
    }

    fn clear_accessed(&self, upage: usize) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&upage) {
            Some(e) => core::mem::replace(&mut e.accessed, false),
            None => false,
        }
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .map(|e| e.dirty)
            .unwrap_or(false)
    }

    fn clear_dirty(&self, upage: usize) {
        if let Some(e) = self.entries.lock().get_mut(&upage) {
            e.dirty = false;
        }
    }

    fn mark_access(&self, upage: usize, write: bool) {
        if let Some(e) = self.entries.lock().get_mut(&upage) {
            e.accessed = true;
            if write {
                e.dirty = true;
            }
        }
    }

    fn flush_tlb(&self, _upage: usize) {}

    fn activate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessed_and_dirty_bits_track_access() {
        let pd = SimPageDir::new();
        pd.map(0x1000, 7, true);
        assert!(!pd.is_dirty(0x1000));
        pd.mark_access(0x1000, false);
        assert!(pd.clear_accessed(0x1000));
        assert!(!pd.clear_accessed(0x1000));
        pd.mark_access(0x1000, true);
        assert!(pd.is_dirty(0x1000));
        assert_eq!(
            pd.mapping(0x1000),
            Some(Mapping {
                frame: 7,
                writable: true
            })
        );
    }
}
