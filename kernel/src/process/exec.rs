//! Program loading.
//!
//! The executable container format is deliberately minimal: a magic
//! header naming the entry point plus a table of segments, each a file
//! window to read and a tail to zero-fill, mirroring what an ELF program
//! header provides. A full ELF parser plugs in behind [`LoadedImage`]
//! without touching the rest of exec.
//!
//! Segments become lazy FILE/ZERO supplemental entries; nothing is read
//! until the first fault. The stack seed page and argument block are the
//! only pages materialized eagerly.

use alloc::{string::String, sync::Arc, vec::Vec};

use crate::error::{KernelError, KernelResult};
use crate::fs::{FileSystem, Inode, InodeKind};
use crate::kernel::Kernel;
use crate::mm::{self, user, FileSlice, ProcessVm, Spe, SpeKind, PAGE_SIZE, STACK_TOP};

use super::pcb::Pcb;

/// Magic number of the executable header ("FRX1").
pub const IMAGE_MAGIC: u32 = 0x4652_5831;

/// Maximum segments an image may carry.
pub const MAX_SEGMENTS: usize = 16;

const HEADER_SIZE: usize = 12;
const SEG_SIZE: usize = 20;

/// One loadable segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First user page of the segment (page aligned).
    pub upage: usize,
    /// File offset the readable part starts at.
    pub offset: u64,
    /// Bytes to read from the file.
    pub read_bytes: u32,
    /// Bytes to zero after the read part.
    pub zero_bytes: u32,
    pub writable: bool,
}

/// A parsed executable.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub entry: usize,
    pub segments: Vec<Segment>,
}

/// Parse the image header from an executable file.
pub fn parse_image(fs: &FileSystem, inode: &Arc<Inode>) -> KernelResult<LoadedImage> {
    let bad = || KernelError::BadArg {
        what: "bad executable image",
    };
    if inode.kind() != InodeKind::File {
        return Err(bad());
    }
    let mut header = [0u8; HEADER_SIZE];
    if inode.read_at(&fs.ctx, &mut header, 0)? != HEADER_SIZE {
        return Err(bad());
    }
    let magic = u32::from_le_bytes(header[0..4].try_into().expect("len"));
    if magic != IMAGE_MAGIC {
        return Err(bad());
    }
    let entry = u32::from_le_bytes(header[4..8].try_into().expect("len")) as usize;
    let nsegs = u32::from_le_bytes(header[8..12].try_into().expect("len")) as usize;
    if nsegs > MAX_SEGMENTS {
        return Err(bad());
    }
    let mut segments = Vec::with_capacity(nsegs);
    for i in 0..nsegs {
        let mut rec = [0u8; SEG_SIZE];
        let off = (HEADER_SIZE + i * SEG_SIZE) as u32;
        if inode.read_at(&fs.ctx, &mut rec, off)? != SEG_SIZE {
            return Err(bad());
        }
        let upage = u32::from_le_bytes(rec[0..4].try_into().expect("len")) as usize;
        if upage % PAGE_SIZE != 0 || upage >= mm::USER_LIMIT {
            return Err(bad());
        }
        segments.push(Segment {
            upage,
            offset: u32::from_le_bytes(rec[4..8].try_into().expect("len")) as u64,
            read_bytes: u32::from_le_bytes(rec[8..12].try_into().expect("len")),
            zero_bytes: u32::from_le_bytes(rec[12..16].try_into().expect("len")),
            writable: u32::from_le_bytes(rec[16..20].try_into().expect("len")) & 1 != 0,
        });
    }
    Ok(LoadedImage { entry, segments })
}

/// Build the lazy supplemental entries for an image's segments.
pub fn install_segments(
    fs: &FileSystem,
    pvm: &Arc<ProcessVm>,
    exec_inode: &Arc<Inode>,
    image: &LoadedImage,
) -> KernelResult<()> {
    for seg in &image.segments {
        let total = seg.read_bytes as usize + seg.zero_bytes as usize;
        let pages = total.div_ceil(PAGE_SIZE);
        let mut remaining_read = seg.read_bytes as usize;
        for i in 0..pages {
            let upage = seg.upage + i * PAGE_SIZE;
            let page_read = remaining_read.min(PAGE_SIZE);
            remaining_read -= page_read;
            let spe = if page_read == 0 {
                Spe {
                    writable: seg.writable,
                    kind: SpeKind::Zero,
                }
            } else {
                Spe {
                    writable: seg.writable,
                    kind: SpeKind::File(FileSlice {
                        file: fs.backing_for(exec_inode),
                        offset: seg.offset + (i * PAGE_SIZE) as u64,
                        read_bytes: page_read as u32,
                        writeback: false,
                    }),
                }
            };
            pvm.insert(upage, spe)?;
        }
    }
    Ok(())
}

/// Seed the user stack: one zero page below the boundary, then the
/// argument block in the conventional layout (strings, aligned argv
/// vector, argv, argc, fake return address). Returns the initial user
/// stack pointer.
pub fn setup_stack(kernel: &Kernel, pvm: &Arc<ProcessVm>, args: &[String]) -> KernelResult<usize> {
    pvm.insert(
        STACK_TOP - PAGE_SIZE,
        Spe {
            writable: true,
            kind: SpeKind::Zero,
        },
    )?;

    let mut esp = STACK_TOP;
    let mut arg_ptrs: Vec<u32> = Vec::with_capacity(args.len());

    // Strings, last argument first.
    for arg in args.iter().rev() {
        let bytes = arg.as_bytes();
        esp -= bytes.len() + 1;
        user::copy_out(&kernel.vm, pvm, esp, bytes, esp)?;
        user::copy_out(&kernel.vm, pvm, esp + bytes.len(), &[0], esp)?;
        arg_ptrs.push(esp as u32);
    }
    arg_ptrs.reverse();

    // Word alignment.
    esp &= !3;

    // argv[argc] = NULL, then the pointers.
    esp -= 4;
    user::write_u32(&kernel.vm, pvm, esp, 0, esp)?;
    for ptr in arg_ptrs.iter().rev() {
        esp -= 4;
        user::write_u32(&kernel.vm, pvm, esp, *ptr, esp)?;
    }
    let argv = esp as u32;
    esp -= 4;
    user::write_u32(&kernel.vm, pvm, esp, argv, esp)?;
    esp -= 4;
    user::write_u32(&kernel.vm, pvm, esp, args.len() as u32, esp)?;
    // Fake return address.
    esp -= 4;
    user::write_u32(&kernel.vm, pvm, esp, 0, esp)?;
    Ok(esp)
}

/// Replace the current address space with a freshly loaded image.
///
/// On success the PCB's VM, executable denial, and saved user stack
/// pointer all refer to the new program; the returned value is its entry
/// point.
pub fn exec(
    kernel: &Kernel,
    pcb: &Arc<Pcb>,
    path: &str,
    args: &[String],
) -> KernelResult<usize> {
    let cwd = super::cwd_or_root(kernel, pcb);
    let opened = kernel.fs.open(&cwd, path);
    kernel.fs.close_inode(&cwd)?;
    let exec_inode = opened?;
    let image = match parse_image(&kernel.fs, &exec_inode) {
        Ok(image) => image,
        Err(e) => {
            kernel.fs.close_inode(&exec_inode)?;
            return Err(e);
        }
    };
    exec_inode.deny_write();

    // Tear the old address space down; the emptied ProcessVm (and its
    // page directory) is reused for the new image.
    mm::mmap::munmap_all(&kernel.vm, &pcb.vm)?;
    pcb.vm.destroy(&kernel.vm);

    let result = install_segments(&kernel.fs, &pcb.vm, &exec_inode, &image)
        .and_then(|_| setup_stack(kernel, &pcb.vm, args));
    match result {
        Ok(esp) => {
            pcb.set_user_esp(esp);
            // Release the previous executable's denial, if any.
            let old = pcb.exec_inode.lock().replace(exec_inode);
            if let Some(old) = old {
                old.allow_write();
                kernel.fs.close_inode(&old)?;
            }
            Ok(image.entry)
        }
        Err(e) => {
            exec_inode.allow_write();
            kernel.fs.close_inode(&exec_inode)?;
            Err(e)
        }
    }
}
