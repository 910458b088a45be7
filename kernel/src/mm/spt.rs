//! Supplemental page table.
//!
//! Per-process metadata for every user virtual page beyond what the
//! hardware page table encodes: where the page's contents live (zero fill,
//! file slice, resident frame, swap slot, or a copy-on-write shared frame)
//! and whether the process may write it. The page-fault handler consults
//! this table to materialize pages; eviction updates it when a frame's
//! contents move to backing store.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{FsError, KernelError, KernelResult};
use crate::process::Pid;

use super::{
    frame,
    mmap::MmapRegion,
    pagedir::{FrameId, PageDir},
    Vm, PAGE_SIZE,
};

/// Backing store the VM reads file pages from and writes mmap pages to.
///
/// The filesystem supplies the real implementation; tests may use an
/// in-memory stand-in.
pub trait FileBacking: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> KernelResult<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> KernelResult<usize>;
    fn len(&self) -> u64;
}

/// A page-sized window into a backing file.
#[derive(Clone)]
pub struct FileSlice {
    pub file: Arc<dyn FileBacking>,
    pub offset: u64,
    /// Bytes to read from the file; the rest of the page is zeroed.
    pub read_bytes: u32,
    /// Dirty pages go back to the file (mmap) instead of swap.
    pub writeback: bool,
}

impl FileSlice {
    pub fn zero_bytes(&self) -> u32 {
        PAGE_SIZE as u32 - self.read_bytes
    }
}

/// Where a resident page's contents go when evicted.
#[derive(Clone)]
pub enum FrameBacking {
    /// Anonymous memory: always saved to swap.
    Anon,
    /// File-backed: dirty mmap pages write back to the file, dirty
    /// private pages go to swap, clean pages are simply dropped.
    File(FileSlice),
}

/// Page state. Exactly one variant holds per page at any time.
#[derive(Clone)]
pub enum SpeKind {
    /// Zero-filled on first touch; no storage yet.
    Zero,
    /// Contents live in a file (lazy load or evicted mmap/code page).
    File(FileSlice),
    /// Resident in a frame.
    Frame { frame: FrameId, backing: FrameBacking },
    /// Saved to a swap slot.
    Swap { slot: super::swap::SwapSlot },
    /// Shares a read-only frame with other SPEs; writes fault and copy.
    Cow { frame: FrameId },
    /// Shares a read-only frame through the (per-process) mmap cache.
    MmapShared { frame: FrameId },
}

/// One supplemental page entry.
#[derive(Clone)]
pub struct Spe {
    pub writable: bool,
    pub kind: SpeKind,
}

/// A process's VM view: page directory plus supplemental page table.
pub struct ProcessVm {
    pub pid: Pid,
    pub pagedir: Arc<dyn PageDir>,
    pub spt: Mutex<BTreeMap<usize, Spe>>,
    pub mmaps: Mutex<Vec<MmapRegion>>,
    next_map_id: AtomicU32,
}

impl ProcessVm {
    pub fn new(pid: Pid, pagedir: Arc<dyn PageDir>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            pagedir,
            spt: Mutex::new(BTreeMap::new()),
            mmaps: Mutex::new(Vec::new()),
            next_map_id: AtomicU32::new(1),
        })
    }

    pub fn alloc_map_id(&self) -> u32 {
        self.next_map_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a page. Fails if the page already has an entry.
    pub fn insert(&self, upage: usize, spe: Spe) -> KernelResult<()> {
        debug_assert_eq!(upage % PAGE_SIZE, 0);
        let mut spt = self.spt.lock();
        if spt.contains_key(&upage) {
            return Err(KernelError::Fs(FsError::Exists));
        }
        spt.insert(upage, spe);
        Ok(())
    }

    pub fn find(&self, upage: usize) -> Option<Spe> {
        self.spt.lock().get(&upage).cloned()
    }

    pub fn remove(&self, upage: usize) -> Option<Spe> {
        self.spt.lock().remove(&upage)
    }

    pub fn page_count(&self) -> usize {
        self.spt.lock().len()
    }

    /// Clone this address space into `child` for fork.
    ///
    /// Zero and File entries copy their metadata. Resident and COW pages
    /// are pinned under the parent's SPT lock, write-protected in both
    /// page directories, and shared as COW with a bumped reference count.
    /// Swapped pages materialize a private child copy, which requires
    /// releasing the parent lock around frame allocation (allocation may
    /// evict, and eviction takes SPT locks).
    pub fn clone_into(self: &Arc<Self>, vm: &Vm, child: &Arc<ProcessVm>) -> KernelResult<()> {
        // Pages present at the start of the clone; fork is single-threaded
        // within the process, so the set is stable even though individual
        // entries may be evicted under us while the lock is dropped.
        let upages: Vec<usize> = self.spt.lock().keys().copied().collect();

        for upage in upages {
            let child_ref = frame::PageRef {
                pid: child.pid,
                upage,
            };
            loop {
                let mut spt = self.spt.lock();
                let Some(spe) = spt.get_mut(&upage) else {
                    break;
                };
                match spe.kind.clone() {
                    SpeKind::Zero => {
                        let entry = spe.clone();
                        drop(spt);
                        child.spt.lock().insert(upage, entry);
                        break;
                    }
                    SpeKind::File(slice) => {
                        let writable = spe.writable;
                        drop(spt);
                        child.spt.lock().insert(
                            upage,
                            Spe {
                                writable,
                                kind: SpeKind::File(slice),
                            },
                        );
                        break;
                    }
                    SpeKind::Frame {
                        frame,
                        backing: FrameBacking::File(slice),
                    } => {
                        // File pages reload lazily in the child.
                        let _ = frame;
                        let writable = spe.writable;
                        drop(spt);
                        child.spt.lock().insert(
                            upage,
                            Spe {
                                writable,
                                kind: SpeKind::File(slice),
                            },
                        );
                        break;
                    }
                    SpeKind::Frame {
                        frame,
                        backing: FrameBacking::Anon,
                    } => {
                        // Share as COW: pin under the parent lock, then both
                        // sides lose write access to the frame.
                        vm.frames.pin(frame);
                        vm.frames.add_ref(frame, child_ref);
                        self.pagedir.set_writable(upage, false);
                        self.pagedir.flush_tlb(upage);
                        spe.kind = SpeKind::Cow { frame };
                        let writable = spe.writable;
                        drop(spt);
                        child.spt.lock().insert(
                            upage,
                            Spe {
                                writable,
                                kind: SpeKind::Cow { frame },
                            },
                        );
                        // Unpin only after the child's entry is in place.
                        vm.frames.unpin(frame);
                        break;
                    }
                    SpeKind::Cow { frame } | SpeKind::MmapShared { frame } => {
                        vm.frames.pin(frame);
                        vm.frames.add_ref(frame, child_ref);
                        let writable = spe.writable;
                        drop(spt);
                        child.spt.lock().insert(
                            upage,
                            Spe {
                                writable,
                                kind: SpeKind::Cow { frame },
                            },
                        );
                        vm.frames.unpin(frame);
                        break;
                    }
                    SpeKind::Swap { slot } => {
                        // Materialize a private child copy. Allocation may
                        // evict, and eviction takes SPT locks, so the parent
                        // lock cannot be held across it; re-check afterward
                        // in case the entry moved while unlocked.
                        drop(spt);
                        let frame = frame::frame_alloc(vm, child_ref)?;
                        let result = vm
                            .frames
                            .with_pinned_slice(frame, |bytes| vm.swap.read_slot(slot, bytes));
                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) | Err(e) => {
                                vm.frames.free_frame(frame);
                                return Err(e);
                            }
                        }
                        let still_swapped = matches!(
                            self.spt.lock().get(&upage).map(|s| s.kind.clone()),
                            Some(SpeKind::Swap { slot: s }) if s == slot
                        );
                        if !still_swapped {
                            // The parent faulted or evicted meanwhile; retry
                            // this page from its current state.
                            vm.frames.free_frame(frame);
                            continue;
                        }
                        let writable = {
                            let spt = self.spt.lock();
                            spt.get(&upage).map(|s| s.writable).unwrap_or(true)
                        };
                        vm.frames.unpin(frame);
                        child.spt.lock().insert(
                            upage,
                            Spe {
                                writable,
                                kind: SpeKind::Frame {
                                    frame,
                                    backing: FrameBacking::Anon,
                                },
                            },
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Tear down the address space: free frames, swap slots, and COW
    /// references. Memory-mapped regions must already be unmapped (process
    /// exit runs `mmap::munmap_all` first).
    pub fn destroy(&self, vm: &Vm) {
        let entries: Vec<(usize, Spe)> = {
            let mut spt = self.spt.lock();
            let drained: Vec<(usize, Spe)> = spt.iter().map(|(k, v)| (*k, v.clone())).collect();
            spt.clear();
            drained
        };
        for (upage, spe) in entries {
            let owner = frame::PageRef {
                pid: self.pid,
                upage,
            };
            match spe.kind {
                SpeKind::Frame { frame, .. }
                | SpeKind::Cow { frame }
                | SpeKind::MmapShared { frame } => {
                    self.pagedir.unmap(upage);
                    vm.frames.remove_ref_and_maybe_free(frame, owner);
                }
                SpeKind::Swap { slot } => vm.swap.free_slot(slot),
                SpeKind::Zero | SpeKind::File(_) => {}
            }
        }
    }
}
