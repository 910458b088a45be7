//! Open-file handles and file-descriptor objects.
//!
//! A [`File`] pairs an inode reference with an independent position, so
//! handles obtained by separate opens (or reopened across `fork`) seek
//! independently. [`FdObject`] is what a descriptor slot actually holds:
//! the console, a file, a directory cursor, or one end of a pipe.

use alloc::sync::Arc;

use spin::Mutex;

use super::{
    dir::Dir,
    inode::{Inode, InodeKind},
    pipe::{PipeReader, PipeWriter},
    wal::TxnHandle,
    FsContext,
};
use crate::error::{FsError, KernelError, KernelResult};

/// An open regular file with its own position.
pub struct File {
    inode: Arc<Inode>,
    pos: Mutex<u32>,
}

impl File {
    pub fn new(inode: Arc<Inode>) -> KernelResult<Self> {
        if inode.kind() == InodeKind::Dir {
            return Err(KernelError::Fs(FsError::IsDir));
        }
        Ok(Self {
            inode,
            pos: Mutex::new(0),
        })
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn size(&self) -> u32 {
        self.inode.length()
    }

    pub fn tell(&self) -> u32 {
        *self.pos.lock()
    }

    /// Position past EOF is allowed; a later write grows the file.
    pub fn seek(&self, pos: u32) {
        *self.pos.lock() = pos;
    }

    /// Read from the current position, advancing it.
    pub fn read(&self, ctx: &FsContext, buf: &mut [u8]) -> KernelResult<usize> {
        let mut pos = self.pos.lock();
        let n = self.inode.read_at(ctx, buf, *pos)?;
        *pos += n as u32;
        Ok(n)
    }

    /// Write at the current position, advancing it. Needs the caller's
    /// transaction for any growth metadata.
    pub fn write(&self, ctx: &FsContext, txn: TxnHandle, buf: &[u8]) -> KernelResult<usize> {
        let mut pos = self.pos.lock();
        let n = self.inode.write_at(ctx, txn, buf, *pos)?;
        *pos += n as u32;
        Ok(n)
    }
}

/// A directory opened for `readdir`, carrying a cursor.
pub struct DirCursor {
    dir: Dir,
    slot: Mutex<usize>,
}

impl DirCursor {
    pub fn new(dir: Dir) -> Self {
        Self {
            dir,
            slot: Mutex::new(0),
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        self.dir.inode()
    }

    /// Next entry name, skipping `.` and `..`; None at the end.
    pub fn next_name(&self, ctx: &FsContext) -> KernelResult<Option<alloc::string::String>> {
        let mut slot = self.slot.lock();
        match self.dir.next_entry(ctx, *slot)? {
            Some((entry, next)) => {
                *slot = next;
                Ok(Some(entry.name))
            }
            None => Ok(None),
        }
    }
}

/// What a file-descriptor slot holds.
#[derive(Clone)]
pub enum FdObject {
    /// Serial/VGA console (conventionally fds 0-2).
    Console,
    File(Arc<File>),
    Dir(Arc<DirCursor>),
    PipeRead(Arc<PipeReader>),
    PipeWrite(Arc<PipeWriter>),
}

impl FdObject {
    pub fn is_console(&self) -> bool {
        matches!(self, FdObject::Console)
    }

    pub fn as_file(&self) -> KernelResult<&Arc<File>> {
        match self {
            FdObject::File(f) => Ok(f),
            _ => Err(KernelError::Fs(FsError::BadFd)),
        }
    }
}
