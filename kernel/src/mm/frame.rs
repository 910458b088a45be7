//! Frame table and clock eviction.
//!
//! Every user frame is tracked here with its owning page(s), a pin count
//! that excludes it from eviction during I/O, and its position in the
//! clock ring. Allocation first tries the bounded page pool; when the pool
//! is dry a victim is selected by second-chance clock (skipping pinned and
//! shared frames), saved to swap or its backing file, and its page
//! recycled.
//!
//! The eviction order matters: the victim's PTE is cleared (and the TLB
//! flushed) *before* the contents are saved, so the owner cannot race a
//! store into the frame after it was captured.

use alloc::{collections::BTreeMap, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::process::Pid;

use super::{
    page_pool::{KPage, PagePool},
    pagedir::FrameId,
    spt::{FileSlice, FrameBacking, SpeKind},
    Vm, PAGE_SIZE,
};

/// A (process, user page) pair referencing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef {
    pub pid: Pid,
    pub upage: usize,
}

struct FrameEntry {
    page: KPage,
    refs: Vec<PageRef>,
    pinned: u32,
}

struct FrameInner {
    frames: BTreeMap<FrameId, FrameEntry>,
    /// Clock ring of frame ids.
    order: Vec<FrameId>,
    hand: usize,
    next_id: FrameId,
}

/// The frame table.
pub struct FrameTable {
    inner: Mutex<FrameInner>,
    pool: PagePool,
}

impl FrameTable {
    pub fn new(max_frames: usize) -> Self {
        Self {
            inner: Mutex::new(FrameInner {
                frames: BTreeMap::new(),
                order: Vec::new(),
                hand: 0,
                next_id: 1,
            }),
            pool: PagePool::new(max_frames),
        }
    }

    /// Allocate a fresh frame if the pool allows it. The page is zeroed,
    /// the entry is registered atomically, and the frame returns pinned.
    ///
    /// The page is allocated before the table lock is taken, so the lock
    /// is never held across allocator work.
    pub fn try_new_frame(&self, owner: PageRef) -> Option<FrameId> {
        let page = self.pool.try_alloc()?;
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.frames.insert(
            id,
            FrameEntry {
                page,
                refs: alloc::vec![owner],
                pinned: 1,
            },
        );
        inner.order.push(id);
        Some(id)
    }

    /// Pin a frame (excludes it from eviction). Returns false if absent.
    pub fn pin(&self, id: FrameId) -> bool {
        let mut inner = self.inner.lock();
        match inner.frames.get_mut(&id) {
            Some(e) => {
                e.pinned += 1;
                true
            }
            None => false,
        }
    }

    /// Atomically check-and-pin: the COW fault path uses this to detect
    /// that its recorded frame was evicted in the meantime.
    pub fn pin_if_present(&self, id: FrameId) -> bool {
        self.pin(id)
    }

    pub fn unpin(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.frames.get_mut(&id) {
            debug_assert!(e.pinned > 0);
            e.pinned = e.pinned.saturating_sub(1);
        }
    }

    /// Add a referencing page (COW sharing).
    pub fn add_ref(&self, id: FrameId, owner: PageRef) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.frames.get_mut(&id) {
            if !e.refs.contains(&owner) {
                e.refs.push(owner);
            }
        }
    }

    /// Drop one reference; the frame is freed when the last goes away.
    pub fn remove_ref_and_maybe_free(&self, id: FrameId, owner: PageRef) -> usize {
        let mut inner = self.inner.lock();
        let remaining = match inner.frames.get_mut(&id) {
            Some(e) => {
                e.refs.retain(|r| *r != owner);
                e.refs.len()
            }
            None => return 0,
        };
        if remaining == 0 {
            inner.frames.remove(&id);
            inner.order.retain(|f| *f != id);
        }
        remaining
    }

    /// Remove a frame outright, returning its page to the pool.
    pub fn free_frame(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        inner.frames.remove(&id);
        inner.order.retain(|f| *f != id);
    }

    pub fn ref_count(&self, id: FrameId) -> usize {
        self.inner
            .lock()
            .frames
            .get(&id)
            .map(|e| e.refs.len())
            .unwrap_or(0)
    }

    pub fn frame_count(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn pool_in_use(&self) -> usize {
        self.pool.in_use()
    }

    pub fn pool_limit(&self) -> usize {
        self.pool.limit()
    }

    /// Run `f` on the frame's bytes under the table lock (short copies).
    pub fn with_slice<R>(&self, id: FrameId, f: impl FnOnce(&mut [u8]) -> R) -> KernelResult<R> {
        let mut inner = self.inner.lock();
        match inner.frames.get_mut(&id) {
            Some(e) => Ok(f(e.page.as_mut_slice())),
            None => Err(KernelError::BadArg {
                what: "no such frame",
            }),
        }
    }

    /// Run `f` on a *pinned* frame's bytes with the table lock released
    /// (for swap and file I/O).
    pub fn with_pinned_slice<R>(
        &self,
        id: FrameId,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> KernelResult<R> {
        let ptr = {
            let inner = self.inner.lock();
            let entry = inner.frames.get(&id).ok_or(KernelError::BadArg {
                what: "no such frame",
            })?;
            debug_assert!(entry.pinned > 0, "pinned access to unpinned frame");
            entry.page.as_ptr()
        };
        // SAFETY: the frame is pinned, so the entry (and its page) outlive
        // this call; pinned frames are not evicted and their PTEs are
        // cleared before any eviction save, so no other writer races us.
        let bytes = unsafe { core::slice::from_raw_parts_mut(ptr, PAGE_SIZE) };
        Ok(f(bytes))
    }

    /// Copy bytes between two pinned frames.
    pub fn copy_frame(&self, from: FrameId, to: FrameId) -> KernelResult<()> {
        let (src, dst) = {
            let inner = self.inner.lock();
            let src = inner.frames.get(&from).ok_or(KernelError::BadArg {
                what: "no such frame",
            })?;
            let dst = inner.frames.get(&to).ok_or(KernelError::BadArg {
                what: "no such frame",
            })?;
            debug_assert!(src.pinned > 0 && dst.pinned > 0);
            (src.page.as_ptr(), dst.page.as_ptr())
        };
        // SAFETY: both frames are pinned (liveness) and distinct KPage
        // allocations (no overlap); see with_pinned_slice for the aliasing
        // argument.
        unsafe { core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE) };
        Ok(())
    }

    /// Next clock candidate: (frame, sole owner) of an unpinned,
    /// unshared frame, advancing the hand. Returns None when the ring has
    /// no eligible entry this step.
    fn clock_step(&self) -> Option<(FrameId, Option<PageRef>, bool)> {
        let mut inner = self.inner.lock();
        if inner.order.is_empty() {
            return None;
        }
        let len = inner.order.len();
        let idx = inner.hand % len;
        inner.hand = (inner.hand + 1) % len;
        let id = inner.order[idx];
        let entry = inner.frames.get(&id)?;
        let eligible = entry.pinned == 0 && entry.refs.len() == 1;
        Some((id, entry.refs.first().copied(), eligible))
    }

    /// Claim a frame for eviction: re-verify eligibility and pin it.
    fn claim_for_eviction(&self, id: FrameId, owner: PageRef) -> bool {
        let mut inner = self.inner.lock();
        match inner.frames.get_mut(&id) {
            Some(e) if e.pinned == 0 && e.refs.as_slice() == [owner] => {
                e.pinned = 1;
                true
            }
            _ => false,
        }
    }
}

/// Allocate a frame for `owner`, evicting as needed. The returned frame is
/// pinned; the caller unpins once its mapping is installed.
///
/// Never call this while holding an SPT lock: eviction acquires the
/// victim's SPT lock, and lock-ordering would invert.
pub fn frame_alloc(vm: &Vm, owner: PageRef) -> KernelResult<FrameId> {
    loop {
        if let Some(id) = vm.frames.try_new_frame(owner) {
            return Ok(id);
        }
        evict_one(vm)?;
    }
}

/// Select and evict one victim, freeing its page back to the pool.
fn evict_one(vm: &Vm) -> KernelResult<()> {
    let max_steps = {
        let count = vm.frames.frame_count();
        if count == 0 {
            return Err(KernelError::OutOfMemory);
        }
        count * 4 + 8
    };
    let mut last_err = KernelError::OutOfMemory;
    for _ in 0..max_steps {
        let Some((id, owner, eligible)) = vm.frames.clock_step() else {
            return Err(KernelError::OutOfMemory);
        };
        if !eligible {
            continue;
        }
        let Some(owner) = owner else {
            // Orphaned frame: reclaim directly.
            vm.frames.free_frame(id);
            return Ok(());
        };
        let Some(pvm) = vm.process(owner.pid) else {
            vm.frames.free_frame(id);
            return Ok(());
        };
        // Second chance: a set accessed bit buys the frame one pass.
        if pvm.pagedir.clear_accessed(owner.upage) {
            continue;
        }
        if !vm.frames.claim_for_eviction(id, owner) {
            continue;
        }
        match evict_frame(vm, id, owner, &pvm) {
            Ok(()) => return Ok(()),
            Err(e) => {
                // Backing store failed; victim was restored. Try another.
                vm.frames.unpin(id);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

enum SaveAction {
    ToSwap,
    ToFile(FileSlice),
    Drop(FileSlice),
    /// SPE vanished or points elsewhere; just reclaim the page.
    Reclaim,
}

/// The ordered eviction protocol for a claimed (pinned) victim.
fn evict_frame(
    vm: &Vm,
    id: FrameId,
    owner: PageRef,
    pvm: &alloc::sync::Arc<super::spt::ProcessVm>,
) -> KernelResult<()> {
    // Flush so the accessed/dirty bits below are accurate.
    pvm.pagedir.flush_tlb(owner.upage);

    let mut spt = pvm.spt.lock();
    let dirty = pvm.pagedir.is_dirty(owner.upage);

    // Clear the PTE before saving: a still-live mapping could let the
    // owner write into the frame after its contents were captured.
    pvm.pagedir.unmap(owner.upage);
    pvm.pagedir.flush_tlb(owner.upage);

    let (action, writable) = match spt.get(&owner.upage) {
        Some(spe) => {
            let writable = spe.writable;
            match &spe.kind {
                SpeKind::Frame { frame, backing } if *frame == id => match backing {
                    FrameBacking::Anon => (SaveAction::ToSwap, writable),
                    FrameBacking::File(slice) => {
                        if dirty {
                            if slice.writeback {
                                (SaveAction::ToFile(slice.clone()), writable)
                            } else {
                                (SaveAction::ToSwap, writable)
                            }
                        } else {
                            (SaveAction::Drop(slice.clone()), writable)
                        }
                    }
                },
                // A sole-owned COW frame is anonymous modifiable memory.
                SpeKind::Cow { frame } if *frame == id => (SaveAction::ToSwap, writable),
                _ => (SaveAction::Reclaim, writable),
            }
        }
        None => (SaveAction::Reclaim, true),
    };

    let new_kind = match action {
        SaveAction::ToSwap => {
            let slot = match vm.frames.with_pinned_slice(id, |b| vm.swap.swap_out(b))? {
                Ok(slot) => slot,
                Err(e) => {
                    // Restore the mapping and report; the caller picks
                    // another victim.
                    pvm.pagedir.map(owner.upage, id, writable);
                    return Err(e);
                }
            };
            Some(SpeKind::Swap { slot })
        }
        SaveAction::ToFile(slice) => {
            let result = vm.frames.with_pinned_slice(id, |b| {
                slice.file.write_at(&b[..slice.read_bytes as usize], slice.offset)
            })?;
            if let Err(e) = result {
                pvm.pagedir.map(owner.upage, id, writable);
                return Err(e);
            }
            Some(SpeKind::File(slice))
        }
        SaveAction::Drop(slice) => Some(SpeKind::File(slice)),
        SaveAction::Reclaim => None,
    };

    if let (Some(kind), Some(spe)) = (new_kind, spt.get_mut(&owner.upage)) {
        spe.kind = kind;
    }
    drop(spt);
    vm.frames.free_frame(id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(pid: Pid, upage: usize) -> PageRef {
        PageRef { pid, upage }
    }

    #[test]
    fn new_frames_come_back_pinned_and_registered() {
        let table = FrameTable::new(4);
        let id = table.try_new_frame(owner(1, 0x1000)).expect("frame");
        assert_eq!(table.ref_count(id), 1);
        assert_eq!(table.frame_count(), 1);
        table.unpin(id);
        table.free_frame(id);
        assert_eq!(table.frame_count(), 0);
        assert_eq!(table.pool_in_use(), 0);
    }

    #[test]
    fn pool_cap_limits_frames() {
        let table = FrameTable::new(2);
        let _a = table.try_new_frame(owner(1, 0x1000)).expect("a");
        let _b = table.try_new_frame(owner(1, 0x2000)).expect("b");
        assert!(table.try_new_frame(owner(1, 0x3000)).is_none());
    }

    #[test]
    fn pin_if_present_detects_freed_frames() {
        let table = FrameTable::new(2);
        let id = table.try_new_frame(owner(1, 0x1000)).expect("frame");
        table.unpin(id);
        assert!(table.pin_if_present(id));
        table.unpin(id);
        table.free_frame(id);
        assert!(!table.pin_if_present(id));
    }

    #[test]
    fn shared_frames_free_on_last_ref() {
        let table = FrameTable::new(2);
        let id = table.try_new_frame(owner(1, 0x1000)).expect("frame");
        table.unpin(id);
        table.add_ref(id, owner(2, 0x1000));
        assert_eq!(table.ref_count(id), 2);
        assert_eq!(table.remove_ref_and_maybe_free(id, owner(1, 0x1000)), 1);
        assert_eq!(table.frame_count(), 1);
        assert_eq!(table.remove_ref_and_maybe_free(id, owner(2, 0x1000)), 0);
        assert_eq!(table.frame_count(), 0);
    }
}
