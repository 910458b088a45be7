//! Memory-mapped files.
//!
//! A region maps a run of user pages onto a file window. The backing file
//! reference is independent of any user descriptor (the process reopens
//! it at `mmap` time), pages load lazily through FILE-state entries, and
//! dirty pages are written back at `munmap` or process exit.

use alloc::sync::Arc;

use crate::error::{FsError, KernelError, KernelResult};

use super::{
    frame::PageRef,
    spt::{FileBacking, FileSlice, FrameBacking, ProcessVm, Spe, SpeKind},
    Vm, PAGE_SIZE, STACK_MAX, STACK_TOP,
};

/// One mapped region.
pub struct MmapRegion {
    pub id: u32,
    pub base: usize,
    pub pages: usize,
    pub file: Arc<dyn FileBacking>,
    pub offset: u64,
    pub writable: bool,
}

/// Map `len` bytes of `file` starting at `offset` to `base`.
///
/// `base` and `offset` must be page-aligned, the range must be non-empty,
/// below the stack region, and must not overlap any existing page.
pub fn mmap(
    vm: &Vm,
    pvm: &Arc<ProcessVm>,
    file: Arc<dyn FileBacking>,
    offset: u64,
    base: usize,
    len: usize,
    writable: bool,
) -> KernelResult<u32> {
    let _ = vm;
    if base == 0 || base % PAGE_SIZE != 0 {
        return Err(KernelError::BadArg {
            what: "mmap base must be page aligned and nonzero",
        });
    }
    if offset % PAGE_SIZE as u64 != 0 {
        return Err(KernelError::BadArg {
            what: "mmap offset must be page aligned",
        });
    }
    if len == 0 {
        return Err(KernelError::BadArg {
            what: "mmap length must be nonzero",
        });
    }
    let end = base.checked_add(len).ok_or(KernelError::BadArg {
        what: "mmap range overflows",
    })?;
    if end > STACK_TOP - STACK_MAX {
        return Err(KernelError::BadArg {
            what: "mmap range collides with the stack region",
        });
    }
    let pages = len.div_ceil(PAGE_SIZE);
    for i in 0..pages {
        if pvm.find(base + i * PAGE_SIZE).is_some() {
            return Err(KernelError::BadArg {
                what: "mmap range overlaps existing pages",
            });
        }
    }

    let id = pvm.alloc_map_id();
    for i in 0..pages {
        let page_off = offset + (i * PAGE_SIZE) as u64;
        let read_bytes = file.len().saturating_sub(page_off).min(PAGE_SIZE as u64) as u32;
        pvm.insert(
            base + i * PAGE_SIZE,
            Spe {
                writable,
                kind: SpeKind::File(FileSlice {
                    file: file.clone(),
                    offset: page_off,
                    read_bytes,
                    writeback: true,
                }),
            },
        )?;
    }
    pvm.mmaps.lock().push(MmapRegion {
        id,
        base,
        pages,
        file,
        offset,
        writable,
    });
    Ok(id)
}

/// Unmap a region: write dirty resident pages back, free frames, drop the
/// supplemental entries, release the region.
pub fn munmap(vm: &Vm, pvm: &Arc<ProcessVm>, id: u32) -> KernelResult<()> {
    let region = {
        let mut regions = pvm.mmaps.lock();
        let idx = regions
            .iter()
            .position(|r| r.id == id)
            .ok_or(KernelError::Fs(FsError::BadFd))?;
        regions.swap_remove(idx)
    };
    writeback_region(vm, pvm, &region)
}

/// Unmap every region (process exit).
pub fn munmap_all(vm: &Vm, pvm: &Arc<ProcessVm>) -> KernelResult<()> {
    loop {
        let id = {
            let regions = pvm.mmaps.lock();
            match regions.first() {
                Some(r) => r.id,
                None => return Ok(()),
            }
        };
        munmap(vm, pvm, id)?;
    }
}

fn writeback_region(vm: &Vm, pvm: &Arc<ProcessVm>, region: &MmapRegion) -> KernelResult<()> {
    for i in 0..region.pages {
        let upage = region.base + i * PAGE_SIZE;
        let owner = PageRef {
            pid: pvm.pid,
            upage,
        };
        let Some(spe) = pvm.remove(upage) else {
            continue;
        };
        match spe.kind {
            SpeKind::Frame {
                frame,
                backing: FrameBacking::File(slice),
            } => {
                let dirty = pvm.pagedir.is_dirty(upage);
                pvm.pagedir.unmap(upage);
                pvm.pagedir.flush_tlb(upage);
                if dirty && slice.writeback && slice.read_bytes > 0 {
                    if vm.frames.pin(frame) {
                        let result = vm.frames.with_pinned_slice(frame, |bytes| {
                            slice
                                .file
                                .write_at(&bytes[..slice.read_bytes as usize], slice.offset)
                        })?;
                        vm.frames.unpin(frame);
                        result?;
                    }
                }
                vm.frames.remove_ref_and_maybe_free(frame, owner);
            }
            SpeKind::Frame { frame, .. }
            | SpeKind::Cow { frame }
            | SpeKind::MmapShared { frame } => {
                pvm.pagedir.unmap(upage);
                pvm.pagedir.flush_tlb(upage);
                vm.frames.remove_ref_and_maybe_free(frame, owner);
            }
            SpeKind::Swap { slot } => vm.swap.free_slot(slot),
            SpeKind::Zero | SpeKind::File(_) => {}
        }
    }
    Ok(())
}
