//! Memory system calls.

use alloc::sync::Arc;

use crate::error::KernelResult;
use crate::fs::FdObject;
use crate::kernel::Kernel;
use crate::mm::mmap;
use crate::process::Pcb;

/// Map the whole file behind `fd` at `addr`. Returns the mapping id, or
/// -1 when the address or descriptor is unusable.
pub fn sys_mmap(kernel: &Kernel, pcb: &Arc<Pcb>, fd: usize, addr: usize) -> KernelResult<i32> {
    // The console descriptors never map.
    if fd <= 2 {
        return Ok(-1);
    }
    let obj = match pcb.fds.lock().get(fd) {
        Ok(obj) => obj,
        Err(_) => return Ok(-1),
    };
    let FdObject::File(file) = obj else {
        return Ok(-1);
    };
    let len = file.size() as usize;
    if len == 0 {
        return Ok(-1);
    }
    // Reopen the inode so closing the descriptor keeps the mapping valid.
    let backing = kernel.fs.backing_for(file.inode());
    match mmap::mmap(&kernel.vm, &pcb.vm, backing, 0, addr, len, true) {
        Ok(id) => Ok(id as i32),
        Err(_) => Ok(-1),
    }
}

pub fn sys_munmap(kernel: &Kernel, pcb: &Arc<Pcb>, id: u32) -> KernelResult<i32> {
    match mmap::munmap(&kernel.vm, &pcb.vm, id) {
        Ok(()) => Ok(0),
        Err(_) => Ok(-1),
    }
}
