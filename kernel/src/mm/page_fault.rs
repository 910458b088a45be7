//! Page-fault resolution.
//!
//! Consults the supplemental page table to materialize the faulting page
//! from zeros, a file, swap, or a shared COW frame; grants stack growth
//! within the sanctioned window; anything else is a terminal user fault.
//!
//! Every materialization allocates its frame *without* holding the SPT
//! lock (allocation may evict, which takes SPT locks), then re-verifies
//! the entry before installing, retrying the whole fault when it lost a
//! race with eviction or another fault.

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};

use super::{
    frame::{self, PageRef},
    spt::{FrameBacking, ProcessVm, Spe, SpeKind},
    Vm, PAGE_SIZE, STACK_MAX, STACK_SLOP, STACK_TOP, USER_LIMIT,
};

/// Decoded fault information handed up from the exception path.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// Faulting address (the CR2 equivalent).
    pub addr: usize,
    /// True for a write access.
    pub write: bool,
    /// User stack pointer at fault time, for the growth heuristic.
    pub esp: usize,
}

/// True when a fault at `addr` qualifies as stack growth: within the
/// stack ceiling and no more than [`STACK_SLOP`] bytes below `esp`.
pub fn is_stack_growth(addr: usize, esp: usize) -> bool {
    addr < STACK_TOP && addr >= STACK_TOP - STACK_MAX && addr + STACK_SLOP >= esp
}

/// Resolve a user fault. `Ok(())` means the access can be retried;
/// `Err(UserFault)` means the process must die with -1.
pub fn handle_fault(vm: &Vm, pvm: &Arc<ProcessVm>, info: &FaultInfo) -> KernelResult<()> {
    if info.addr >= USER_LIMIT {
        return Err(KernelError::UserFault { addr: info.addr });
    }
    let upage = info.addr & !(PAGE_SIZE - 1);
    let owner = PageRef {
        pid: pvm.pid,
        upage,
    };

    // Retry loop: each pass re-reads the entry, since eviction or another
    // fault may transition it while our frame was being prepared.
    for _ in 0..64 {
        let Some(spe) = pvm.find(upage) else {
            if is_stack_growth(info.addr, info.esp) {
                pvm.insert(
                    upage,
                    Spe {
                        writable: true,
                        kind: SpeKind::Zero,
                    },
                )?;
                continue;
            }
            return Err(KernelError::UserFault { addr: info.addr });
        };

        if info.write && !spe.writable {
            return Err(KernelError::UserFault { addr: info.addr });
        }

        match spe.kind {
            SpeKind::Zero => {
                let frame = frame::frame_alloc(vm, owner)?;
                // Fresh pool pages are already zeroed.
                if install(pvm, upage, frame, spe.writable, FrameBacking::Anon, |k| {
                    matches!(k, SpeKind::Zero)
                }) {
                    vm.frames.unpin(frame);
                    return Ok(());
                }
                vm.frames.free_frame(frame);
            }
            SpeKind::File(ref slice) => {
                let frame = frame::frame_alloc(vm, owner)?;
                let slice = slice.clone();
                let read = vm.frames.with_pinned_slice(frame, |bytes| {
                    let n = slice.read_bytes as usize;
                    if n > 0 {
                        slice.file.read_at(&mut bytes[..n], slice.offset)?;
                    }
                    bytes[n..].fill(0);
                    Ok::<(), KernelError>(())
                })?;
                if let Err(e) = read {
                    vm.frames.free_frame(frame);
                    return Err(e);
                }
                let expected_off = slice.offset;
                if install(
                    pvm,
                    upage,
                    frame,
                    spe.writable,
                    FrameBacking::File(slice),
                    |k| matches!(k, SpeKind::File(s) if s.offset == expected_off),
                ) {
                    vm.frames.unpin(frame);
                    return Ok(());
                }
                vm.frames.free_frame(frame);
            }
            SpeKind::Swap { slot } => {
                let frame = frame::frame_alloc(vm, owner)?;
                let read = vm
                    .frames
                    .with_pinned_slice(frame, |bytes| vm.swap.read_slot(slot, bytes))?;
                if let Err(e) = read {
                    vm.frames.free_frame(frame);
                    return Err(e);
                }
                let installed = install(pvm, upage, frame, spe.writable, FrameBacking::Anon, |k| {
                    matches!(k, SpeKind::Swap { slot: s } if *s == slot)
                });
                if installed {
                    vm.swap.free_slot(slot);
                    vm.frames.unpin(frame);
                    return Ok(());
                }
                vm.frames.free_frame(frame);
            }
            SpeKind::Frame { frame, .. } => {
                // Resident but unmapped (fork leaves child pages lazy).
                if !vm.frames.pin_if_present(frame) {
                    continue;
                }
                let mut spt = pvm.spt.lock();
                match spt.get(&upage) {
                    Some(cur) if matches!(cur.kind, SpeKind::Frame { frame: f, .. } if f == frame) =>
                    {
                        pvm.pagedir.map(upage, frame, cur.writable);
                        drop(spt);
                        vm.frames.unpin(frame);
                        return Ok(());
                    }
                    _ => {
                        drop(spt);
                        vm.frames.unpin(frame);
                    }
                }
            }
            SpeKind::Cow { frame } | SpeKind::MmapShared { frame } => {
                if !info.write {
                    // Read access: share the frame read-only.
                    if !vm.frames.pin_if_present(frame) {
                        // Raced with eviction; the entry has moved on.
                        continue;
                    }
                    let mut spt = pvm.spt.lock();
                    let still = matches!(
                        spt.get(&upage).map(|s| &s.kind),
                        Some(SpeKind::Cow { frame: f }) | Some(SpeKind::MmapShared { frame: f })
                            if *f == frame
                    );
                    if still {
                        pvm.pagedir.map(upage, frame, false);
                        drop(spt);
                        vm.frames.unpin(frame);
                        return Ok(());
                    }
                    drop(spt);
                    vm.frames.unpin(frame);
                    continue;
                }
                if break_cow(vm, pvm, upage, frame, owner, spe.writable)? {
                    return Ok(());
                }
            }
        }
    }
    Err(KernelError::UserFault { addr: info.addr })
}

/// Install a prepared frame for `upage` if the entry still matches
/// `expect`. Returns false when the entry changed and the caller must
/// retry.
fn install(
    pvm: &Arc<ProcessVm>,
    upage: usize,
    frame: super::pagedir::FrameId,
    writable: bool,
    backing: FrameBacking,
    expect: impl Fn(&SpeKind) -> bool,
) -> bool {
    let mut spt = pvm.spt.lock();
    match spt.get_mut(&upage) {
        Some(spe) if expect(&spe.kind) => {
            spe.kind = SpeKind::Frame { frame, backing };
            pvm.pagedir.map(upage, frame, writable);
            true
        }
        _ => false,
    }
}

/// Break copy-on-write for a write fault. Returns Ok(true) when resolved,
/// Ok(false) to retry the fault from scratch.
fn break_cow(
    vm: &Vm,
    pvm: &Arc<ProcessVm>,
    upage: usize,
    shared: super::pagedir::FrameId,
    owner: PageRef,
    writable: bool,
) -> KernelResult<bool> {
    // Pin the recorded frame; failure means eviction got there first and
    // the entry is now SWAP (retry resolves it as a not-present fault).
    if !vm.frames.pin_if_present(shared) {
        return Ok(false);
    }

    if vm.frames.ref_count(shared) == 1 {
        // Last sharer: take the frame private in place.
        let mut spt = pvm.spt.lock();
        let still = matches!(
            spt.get(&upage).map(|s| &s.kind),
            Some(SpeKind::Cow { frame }) | Some(SpeKind::MmapShared { frame }) if *frame == shared
        );
        if !still {
            drop(spt);
            vm.frames.unpin(shared);
            return Ok(false);
        }
        if let Some(spe) = spt.get_mut(&upage) {
            spe.kind = SpeKind::Frame {
                frame: shared,
                backing: FrameBacking::Anon,
            };
        }
        pvm.pagedir.map(upage, shared, writable);
        drop(spt);
        vm.frames.unpin(shared);
        return Ok(true);
    }

    // Shared: copy into a private frame and drop our reference.
    let private = frame::frame_alloc(vm, owner)?;
    if let Err(e) = vm.frames.copy_frame(shared, private) {
        vm.frames.free_frame(private);
        vm.frames.unpin(shared);
        return Err(e);
    }
    let mut spt = pvm.spt.lock();
    let still = matches!(
        spt.get(&upage).map(|s| &s.kind),
        Some(SpeKind::Cow { frame }) | Some(SpeKind::MmapShared { frame }) if *frame == shared
    );
    if !still {
        drop(spt);
        vm.frames.free_frame(private);
        vm.frames.unpin(shared);
        return Ok(false);
    }
    if let Some(spe) = spt.get_mut(&upage) {
        spe.kind = SpeKind::Frame {
            frame: private,
            backing: FrameBacking::Anon,
        };
    }
    pvm.pagedir.map(upage, private, writable);
    drop(spt);
    vm.frames.unpin(private);
    vm.frames.unpin(shared);
    vm.frames.remove_ref_and_maybe_free(shared, owner);
    Ok(true)
}
