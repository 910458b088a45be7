//! Validated user-memory access.
//!
//! System calls read their arguments from user space through these
//! helpers. Every byte must fall below the user/kernel boundary; pages
//! that are absent (or write-protected for a write) go through the page
//! fault handler, so a bad pointer surfaces as a clean [`KernelError::UserFault`]
//! instead of a kernel panic. This is the fix-up path the exception
//! handler relies on for kernel-mode faults during user copies.

use alloc::{string::String, sync::Arc, vec, vec::Vec};

use crate::error::{KernelError, KernelResult};

use super::{
    page_fault::{self, FaultInfo},
    pagedir::FrameId,
    spt::ProcessVm,
    Vm, PAGE_SIZE, USER_LIMIT,
};

/// Longest C string a system call will pull from user space.
pub const MAX_USER_STRING: usize = 4096;

/// Copy `len` bytes from user space.
pub fn copy_in(
    vm: &Vm,
    pvm: &Arc<ProcessVm>,
    uaddr: usize,
    len: usize,
    esp: usize,
) -> KernelResult<Vec<u8>> {
    let mut out = vec![0u8; len];
    walk(vm, pvm, uaddr, len, false, esp, |frame_bytes, page_off, buf_off, chunk| {
        out[buf_off..buf_off + chunk].copy_from_slice(&frame_bytes[page_off..page_off + chunk]);
    })?;
    Ok(out)
}

/// Copy `buf` into user space.
pub fn copy_out(
    vm: &Vm,
    pvm: &Arc<ProcessVm>,
    uaddr: usize,
    buf: &[u8],
    esp: usize,
) -> KernelResult<()> {
    walk(vm, pvm, uaddr, buf.len(), true, esp, |frame_bytes, page_off, buf_off, chunk| {
        frame_bytes[page_off..page_off + chunk].copy_from_slice(&buf[buf_off..buf_off + chunk]);
    })
}

/// Read a little-endian u32 from user space (syscall arguments).
pub fn read_u32(vm: &Vm, pvm: &Arc<ProcessVm>, uaddr: usize, esp: usize) -> KernelResult<u32> {
    let bytes = copy_in(vm, pvm, uaddr, 4, esp)?;
    Ok(u32::from_le_bytes(bytes[..4].try_into().expect("len")))
}

/// Write a little-endian u32 into user space.
pub fn write_u32(
    vm: &Vm,
    pvm: &Arc<ProcessVm>,
    uaddr: usize,
    value: u32,
    esp: usize,
) -> KernelResult<()> {
    copy_out(vm, pvm, uaddr, &value.to_le_bytes(), esp)
}

/// Pull a NUL-terminated string from user space, bounded by
/// [`MAX_USER_STRING`].
pub fn read_cstring(
    vm: &Vm,
    pvm: &Arc<ProcessVm>,
    uaddr: usize,
    esp: usize,
) -> KernelResult<String> {
    let mut collected = Vec::new();
    let mut addr = uaddr;
    while collected.len() < MAX_USER_STRING {
        // Read to the end of the current page, scanning for NUL.
        let page_rest = PAGE_SIZE - (addr % PAGE_SIZE);
        let chunk_len = page_rest.min(MAX_USER_STRING - collected.len());
        let chunk = copy_in(vm, pvm, addr, chunk_len, esp)?;
        match chunk.iter().position(|b| *b == 0) {
            Some(nul) => {
                collected.extend_from_slice(&chunk[..nul]);
                return String::from_utf8(collected)
                    .map_err(|_| KernelError::BadArg { what: "non-utf8 string" });
            }
            None => collected.extend_from_slice(&chunk),
        }
        addr += chunk_len;
    }
    Err(KernelError::BadArg {
        what: "unterminated user string",
    })
}

/// Page-wise access driver: validates, faults pages in as needed, pins
/// the frame across the copy, and keeps the hardware accessed/dirty bits
/// honest.
fn walk(
    vm: &Vm,
    pvm: &Arc<ProcessVm>,
    uaddr: usize,
    len: usize,
    write: bool,
    esp: usize,
    mut copy: impl FnMut(&mut [u8], usize, usize, usize),
) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    let end = uaddr.checked_add(len).ok_or(KernelError::UserFault { addr: uaddr })?;
    if end > USER_LIMIT {
        return Err(KernelError::UserFault { addr: end - 1 });
    }
    let mut pos = 0;
    while pos < len {
        let addr = uaddr + pos;
        let upage = addr & !(PAGE_SIZE - 1);
        let page_off = addr - upage;
        let chunk = (PAGE_SIZE - page_off).min(len - pos);
        let frame = resolve_page(vm, pvm, upage, write, esp)?;
        vm.frames
            .with_pinned_slice(frame, |bytes| copy(bytes, page_off, pos, chunk))?;
        pvm.pagedir.mark_access(upage, write);
        vm.frames.unpin(frame);
        pos += chunk;
    }
    Ok(())
}

/// Translate a user page, faulting it in (or breaking COW) as required.
/// Returns a pinned frame.
fn resolve_page(
    vm: &Vm,
    pvm: &Arc<ProcessVm>,
    upage: usize,
    write: bool,
    esp: usize,
) -> KernelResult<FrameId> {
    for _ in 0..64 {
        match pvm.pagedir.mapping(upage) {
            Some(m) if !write || m.writable => {
                if vm.frames.pin_if_present(m.frame) {
                    return Ok(m.frame);
                }
                // Evicted between translate and pin; fault it back.
            }
            _ => {}
        }
        page_fault::handle_fault(
            vm,
            pvm,
            &FaultInfo {
                addr: upage,
                write,
                esp,
            },
        )?;
    }
    Err(KernelError::UserFault { addr: upage })
}
