//! Process control blocks and file-descriptor tables.

use alloc::{
    collections::BTreeMap,
    string::String,
    sync::Arc,
    vec::Vec,
};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{wait::Rendezvous, Pid};
use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::{FdObject, File, Inode};
use crate::mm::ProcessVm;
use crate::sched::Tid;
use crate::sync::{Lock, Semaphore};

/// Size of the per-process descriptor table.
pub const MAX_FDS: usize = 128;

/// Dense descriptor table; fds 0-2 start as the console by convention.
pub struct FdTable {
    slots: Vec<Option<FdObject>>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        let mut slots: Vec<Option<FdObject>> = Vec::with_capacity(MAX_FDS);
        slots.resize_with(MAX_FDS, || None);
        slots[0] = Some(FdObject::Console);
        slots[1] = Some(FdObject::Console);
        slots[2] = Some(FdObject::Console);
        Self { slots }
    }

    /// Install an object in the lowest free slot.
    pub fn install(&mut self, obj: FdObject) -> KernelResult<usize> {
        for (fd, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(obj);
                return Ok(fd);
            }
        }
        Err(KernelError::LimitExceeded {
            resource: "file descriptors",
        })
    }

    pub fn get(&self, fd: usize) -> KernelResult<FdObject> {
        self.slots
            .get(fd)
            .and_then(|s| s.clone())
            .ok_or(KernelError::Fs(FsError::BadFd))
    }

    /// Remove and return the object (the caller releases inode refs).
    pub fn take(&mut self, fd: usize) -> KernelResult<FdObject> {
        match self.slots.get_mut(fd) {
            Some(slot) if slot.is_some() => Ok(slot.take().expect("checked")),
            _ => Err(KernelError::Fs(FsError::BadFd)),
        }
    }

    /// All live objects, draining the table (process exit).
    pub fn drain(&mut self) -> Vec<FdObject> {
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }

    /// Iterate live (fd, object) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &FdObject)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, s)| s.as_ref().map(|obj| (fd, obj)))
    }
}

/// Handle to a child: its pid and the shared exit rendezvous.
pub struct ChildRef {
    pub pid: Pid,
    pub rv: Arc<Rendezvous>,
}

/// A process control block.
pub struct Pcb {
    pub pid: Pid,
    pub name: String,
    pub parent: Option<Pid>,
    /// Address space (page directory + supplemental page table).
    pub vm: Arc<ProcessVm>,
    /// Main thread in the scheduler.
    pub main_tid: Mutex<Option<Tid>>,
    pub fds: Mutex<FdTable>,
    /// Working directory; None once it could not be re-referenced.
    pub cwd: Mutex<Option<Arc<Inode>>>,
    /// This process's own exit rendezvous (shared with the parent).
    pub rendezvous: Arc<Rendezvous>,
    pub children: Mutex<Vec<ChildRef>>,
    /// Executable inode held open with writes denied.
    pub exec_inode: Mutex<Option<Arc<Inode>>>,
    /// User-visible synchronization objects, by small id.
    pub user_locks: Mutex<BTreeMap<u32, Arc<Lock>>>,
    pub user_semas: Mutex<BTreeMap<u32, Arc<Semaphore>>>,
    next_usync_id: Mutex<u32>,
    /// Additional user threads (`pt_create`).
    pub threads: Mutex<Vec<Tid>>,
    /// User stack pointer captured at syscall entry (stack-growth checks).
    pub user_esp: AtomicUsize,
}

impl Pcb {
    pub fn new(pid: Pid, name: String, parent: Option<Pid>, vm: Arc<ProcessVm>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            name,
            parent,
            vm,
            main_tid: Mutex::new(None),
            fds: Mutex::new(FdTable::new()),
            cwd: Mutex::new(None),
            rendezvous: Arc::new(Rendezvous::new()),
            children: Mutex::new(Vec::new()),
            exec_inode: Mutex::new(None),
            user_locks: Mutex::new(BTreeMap::new()),
            user_semas: Mutex::new(BTreeMap::new()),
            next_usync_id: Mutex::new(1),
            threads: Mutex::new(Vec::new()),
            user_esp: AtomicUsize::new(crate::mm::STACK_TOP),
        })
    }

    pub fn alloc_usync_id(&self) -> u32 {
        let mut next = self.next_usync_id.lock();
        let id = *next;
        *next += 1;
        id
    }

    pub fn set_user_esp(&self, esp: usize) {
        self.user_esp.store(esp, Ordering::Relaxed);
    }

    pub fn user_esp(&self) -> usize {
        self.user_esp.load(Ordering::Relaxed)
    }

    /// Find a child handle by pid.
    pub fn child(&self, pid: Pid) -> Option<Arc<Rendezvous>> {
        self.children
            .lock()
            .iter()
            .find(|c| c.pid == pid)
            .map(|c| c.rv.clone())
    }

    /// Forget a child after its status was reaped.
    pub fn forget_child(&self, pid: Pid) {
        self.children.lock().retain(|c| c.pid != pid);
    }
}

/// Duplicate a descriptor table for fork: console and pipe ends are
/// shared, files are reopened with an independent position (seeded from
/// the parent's).
pub fn clone_fds_for_fork(
    fs: &crate::fs::FileSystem,
    parent: &FdTable,
) -> KernelResult<FdTable> {
    let mut child = FdTable {
        slots: Vec::new(),
    };
    child.slots.resize_with(MAX_FDS, || None);
    for (fd, obj) in parent.iter() {
        let cloned = match obj {
            FdObject::Console => FdObject::Console,
            FdObject::PipeRead(r) => FdObject::PipeRead(r.clone()),
            FdObject::PipeWrite(w) => FdObject::PipeWrite(w.clone()),
            FdObject::Dir(d) => {
                // Directory cursors share the inode; take a new ref.
                let _ = fs.inodes.reopen(d.inode());
                FdObject::Dir(d.clone())
            }
            FdObject::File(f) => {
                let inode = fs.inodes.reopen(f.inode());
                let file = File::new(inode)?;
                file.seek(f.tell());
                FdObject::File(Arc::new(file))
            }
        };
        child.slots[fd] = Some(cloned);
    }
    Ok(child)
}
