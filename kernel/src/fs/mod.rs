//! Filesystem core.
//!
//! [`FileSystem`] composes the block device, buffer cache, write-ahead
//! log, free map, inode registry, and directory tree. Every operation that
//! mutates metadata runs inside a WAL transaction via [`FileSystem::with_txn`];
//! a full log forces a checkpoint and retries once before giving up.

pub mod blockdev;
pub mod cache;
pub mod dir;
pub mod file;
pub mod freemap;
pub mod inode;
pub mod path;
pub mod pipe;
pub mod wal;

use alloc::{string::String, sync::Arc, vec::Vec};

pub use blockdev::{
    BlockDevice, DiskLayout, RamDisk, Sector, DATA_START, FREE_MAP_SECTOR, ROOT_DIR_SECTOR,
    SECTOR_SIZE, WAL_META_SECTOR, WAL_SECTORS, WAL_START,
};
pub use cache::{BufferCache, CACHE_SLOTS, FLUSH_INTERVAL_TICKS};
pub use file::{DirCursor, FdObject, File};
pub use inode::{Inode, InodeFlags, InodeKind, InodeManager, MAX_FILE_LEN};
pub use wal::{RecoveryReport, TxnHandle, Wal};

use dir::Dir;
use freemap::FreeMap;
use path::Resolver;

use crate::error::{FsError, KernelError, KernelResult};

/// Shared handles the lower filesystem layers operate through.
#[derive(Clone)]
pub struct FsContext {
    pub cache: Arc<BufferCache>,
    pub wal: Arc<Wal>,
    pub freemap: Arc<FreeMap>,
}

/// A mounted filesystem.
pub struct FileSystem {
    #[allow(dead_code)]
    dev: Arc<dyn BlockDevice>,
    layout: DiskLayout,
    pub ctx: FsContext,
    pub inodes: Arc<InodeManager>,
    root: Arc<Inode>,
    /// What recovery did at mount, if it ran.
    pub recovery: Option<RecoveryReport>,
}

impl FileSystem {
    /// Create a fresh filesystem on `dev` and mount it.
    pub fn format(dev: Arc<dyn BlockDevice>, layout: DiskLayout) -> KernelResult<FileSystem> {
        Wal::format(&dev)?;
        let cache = BufferCache::new(dev.clone());
        let (wal, _) = Wal::mount(dev.clone())?;
        cache.attach_wal(wal.clone());

        let freemap = Arc::new(FreeMap::format(&cache, &layout)?);
        if freemap.backing_sectors().len() > inode::DIRECT_COUNT {
            return Err(KernelError::BadArg {
                what: "data region too large for the free-map inode",
            });
        }

        // Hand-craft the free-map file's inode at sector 0. Its content is
        // the bitmap itself (log-exempt: every bit flip already journals
        // its own images).
        let mut fm_inode = inode::DiskInode::new(InodeKind::File, inode::InodeFlags::LOG_EXEMPT);
        fm_inode.length = FreeMap::bitmap_bytes(layout.data_sectors) as u32;
        for (i, sector) in freemap.backing_sectors().iter().enumerate() {
            fm_inode.direct[i] = *sector;
        }
        cache.write(FREE_MAP_SECTOR, &fm_inode.encode())?;

        let ctx = FsContext {
            cache,
            wal,
            freemap,
        };
        let inodes = Arc::new(InodeManager::new());

        // Root directory with its structural entries.
        let txn = ctx.wal.txn_begin()?;
        inodes.create(&ctx, txn, ROOT_DIR_SECTOR, InodeKind::Dir, inode::InodeFlags::empty())?;
        let root = inodes.open(&ctx, ROOT_DIR_SECTOR)?;
        let root_dir = Dir::open(inodes.reopen(&root))?;
        root_dir.init_dot_entries(&ctx, txn, ROOT_DIR_SECTOR)?;
        inodes.close(&ctx, &root_dir.into_inode())?;
        ctx.wal.txn_commit(&ctx.cache, txn)?;
        ctx.cache.flush()?;

        Ok(FileSystem {
            dev,
            layout,
            ctx,
            inodes,
            root,
            recovery: None,
        })
    }

    /// Mount an existing filesystem, running recovery if the last shutdown
    /// was unclean.
    pub fn mount(dev: Arc<dyn BlockDevice>, layout: DiskLayout) -> KernelResult<FileSystem> {
        let cache = BufferCache::new(dev.clone());
        let (wal, recovery) = Wal::mount(dev.clone())?;
        cache.attach_wal(wal.clone());

        // The free map bootstraps without the inode layer: its inode is
        // read raw and the backing sectors come from the direct pointers.
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(FREE_MAP_SECTOR, &mut buf)?;
        let fm_inode = inode::DiskInode::decode(FREE_MAP_SECTOR, &buf)?;
        let n_backing = FreeMap::bitmap_sectors(layout.data_sectors) as usize;
        let backing: Vec<Sector> = fm_inode.direct[..n_backing].to_vec();
        let freemap = Arc::new(FreeMap::open(&cache, &layout, backing)?);

        let ctx = FsContext {
            cache,
            wal,
            freemap,
        };
        let inodes = Arc::new(InodeManager::new());
        let root = inodes.open(&ctx, ROOT_DIR_SECTOR)?;
        Ok(FileSystem {
            dev,
            layout,
            ctx,
            inodes,
            root,
            recovery,
        })
    }

    /// Flush everything and mark a clean shutdown.
    pub fn unmount(&self) -> KernelResult<()> {
        self.ctx.cache.flush()?;
        self.ctx.wal.unmount(&self.ctx.cache)
    }

    pub fn root(&self) -> &Arc<Inode> {
        &self.root
    }

    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver {
            ctx: &self.ctx,
            inodes: &self.inodes,
            root: &self.root,
        }
    }

    /// Run `f` inside a transaction: commit on success, roll back on
    /// error. A full log checkpoints and retries once.
    pub fn with_txn<R>(&self, f: impl FnOnce(TxnHandle) -> KernelResult<R>) -> KernelResult<R> {
        self.ctx.wal.maybe_deferred_checkpoint(&self.ctx.cache)?;
        let txn = match self.ctx.wal.txn_begin() {
            Ok(t) => t,
            Err(KernelError::LogFull) => {
                self.ctx.wal.checkpoint(&self.ctx.cache)?;
                self.ctx.wal.txn_begin()?
            }
            Err(e) => return Err(e),
        };
        match f(txn) {
            Ok(r) => match self.ctx.wal.txn_commit(&self.ctx.cache, txn) {
                Ok(()) => Ok(r),
                Err(KernelError::LogFull) => {
                    self.ctx.wal.checkpoint(&self.ctx.cache)?;
                    self.ctx.wal.txn_commit(&self.ctx.cache, txn)?;
                    Ok(r)
                }
                Err(e) => {
                    let _ = self.ctx.wal.txn_abort(&self.ctx.cache, txn);
                    Err(e)
                }
            },
            Err(e) => {
                let _ = self.ctx.wal.txn_abort(&self.ctx.cache, txn);
                Err(e)
            }
        }
    }

    /// Create a regular file. `size` sets the initial (sparse) length.
    pub fn create(&self, cwd: &Arc<Inode>, path: &str, size: u32) -> KernelResult<()> {
        self.with_txn(|txn| {
            let (parent, name) = self.resolver().resolve_parent(cwd, path)?;
            let result = (|| {
                let name = name.ok_or(KernelError::Fs(FsError::Exists))?;
                dir::check_name(&name)?;
                if parent.lookup(&self.ctx, &name)?.is_some() {
                    return Err(KernelError::Fs(FsError::Exists));
                }
                let sector = self
                    .ctx
                    .freemap
                    .allocate(&self.ctx.cache, &self.ctx.wal, txn)?;
                self.inodes.create(&self.ctx, txn, sector, InodeKind::File, inode::InodeFlags::empty())?;
                if size > 0 {
                    let inode = self.inodes.open(&self.ctx, sector)?;
                    let r = inode.extend_length(&self.ctx, txn, size);
                    self.inodes.close(&self.ctx, &inode)?;
                    r?;
                }
                parent.add(&self.ctx, txn, &name, sector)
            })();
            let closed = self.inodes.close(&self.ctx, &parent.into_inode());
            result.and(closed)
        })
    }

    /// Open a file or directory inode by path, following symlinks.
    /// The returned reference must be released with [`FileSystem::close_inode`].
    pub fn open(&self, cwd: &Arc<Inode>, path: &str) -> KernelResult<Arc<Inode>> {
        self.resolver().resolve(cwd, path, true)
    }

    pub fn close_inode(&self, inode: &Arc<Inode>) -> KernelResult<()> {
        self.inodes.close(&self.ctx, inode)
    }

    /// Open a regular file as a positioned handle.
    pub fn open_file(&self, cwd: &Arc<Inode>, path: &str) -> KernelResult<File> {
        let inode = self.open(cwd, path)?;
        match File::new(inode.clone()) {
            Ok(f) => Ok(f),
            Err(e) => {
                self.inodes.close(&self.ctx, &inode)?;
                Err(e)
            }
        }
    }

    /// Open a directory as a `readdir` cursor.
    pub fn open_dir(&self, cwd: &Arc<Inode>, path: &str) -> KernelResult<DirCursor> {
        let inode = self.open(cwd, path)?;
        match Dir::open(inode.clone()) {
            Ok(d) => Ok(DirCursor::new(d)),
            Err(e) => {
                self.inodes.close(&self.ctx, &inode)?;
                Err(e)
            }
        }
    }

    /// Remove a file or an empty directory. Open handles keep working;
    /// space is reclaimed at last close.
    pub fn remove(&self, cwd: &Arc<Inode>, path: &str) -> KernelResult<()> {
        self.with_txn(|txn| {
            let (parent, name) = self.resolver().resolve_parent(cwd, path)?;
            let result = (|| {
                let name = name.ok_or(KernelError::BadArg {
                    what: "cannot remove the starting directory",
                })?;
                if name == "." || name == ".." {
                    return Err(KernelError::BadArg {
                        what: "cannot remove . or ..",
                    });
                }
                let sector = parent
                    .lookup(&self.ctx, &name)?
                    .ok_or(KernelError::Fs(FsError::NotFound))?;
                if sector == ROOT_DIR_SECTOR {
                    return Err(KernelError::BadArg {
                        what: "cannot remove the root directory",
                    });
                }
                let target = self.inodes.open(&self.ctx, sector)?;
                let check = (|| {
                    if target.kind() == InodeKind::Dir {
                        let d = Dir::open(self.inodes.reopen(&target))?;
                        let empty = d.is_empty(&self.ctx);
                        self.inodes.close(&self.ctx, &d.into_inode())?;
                        if !empty? {
                            return Err(KernelError::Fs(FsError::NotEmpty));
                        }
                    }
                    parent.remove_entry(&self.ctx, txn, &name)?;
                    target.mark_removed();
                    Ok(())
                })();
                let closed = self.inodes.close(&self.ctx, &target);
                check.and(closed)
            })();
            let closed = self.inodes.close(&self.ctx, &parent.into_inode());
            result.and(closed)
        })
    }

    /// Create a directory with its `.` and `..` entries.
    pub fn mkdir(&self, cwd: &Arc<Inode>, path: &str) -> KernelResult<()> {
        self.with_txn(|txn| {
            let (parent, name) = self.resolver().resolve_parent(cwd, path)?;
            let parent_sector = parent.inode().sector();
            let result = (|| {
                let name = name.ok_or(KernelError::Fs(FsError::Exists))?;
                dir::check_name(&name)?;
                if parent.lookup(&self.ctx, &name)?.is_some() {
                    return Err(KernelError::Fs(FsError::Exists));
                }
                let sector = self
                    .ctx
                    .freemap
                    .allocate(&self.ctx.cache, &self.ctx.wal, txn)?;
                self.inodes.create(&self.ctx, txn, sector, InodeKind::Dir, inode::InodeFlags::empty())?;
                let child = self.inodes.open(&self.ctx, sector)?;
                let setup = (|| {
                    let d = Dir::open(self.inodes.reopen(&child))?;
                    let r = d.init_dot_entries(&self.ctx, txn, parent_sector);
                    self.inodes.close(&self.ctx, &d.into_inode())?;
                    r
                })();
                let closed = self.inodes.close(&self.ctx, &child);
                setup.and(closed)?;
                parent.add(&self.ctx, txn, &name, sector)
            })();
            let closed = self.inodes.close(&self.ctx, &parent.into_inode());
            result.and(closed)
        })
    }

    /// Resolve a new working directory, returning its held inode.
    pub fn chdir(&self, cwd: &Arc<Inode>, path: &str) -> KernelResult<Arc<Inode>> {
        let inode = self.open(cwd, path)?;
        if inode.kind() != InodeKind::Dir {
            self.inodes.close(&self.ctx, &inode)?;
            return Err(KernelError::Fs(FsError::NotDir));
        }
        Ok(inode)
    }

    /// Create a symbolic link at `linkpath` pointing to `target`.
    pub fn symlink(&self, cwd: &Arc<Inode>, target: &str, linkpath: &str) -> KernelResult<()> {
        if target.is_empty() {
            return Err(KernelError::Fs(FsError::BadPath));
        }
        self.with_txn(|txn| {
            let (parent, name) = self.resolver().resolve_parent(cwd, linkpath)?;
            let result = (|| {
                let name = name.ok_or(KernelError::Fs(FsError::Exists))?;
                dir::check_name(&name)?;
                if parent.lookup(&self.ctx, &name)?.is_some() {
                    return Err(KernelError::Fs(FsError::Exists));
                }
                let sector = self
                    .ctx
                    .freemap
                    .allocate(&self.ctx.cache, &self.ctx.wal, txn)?;
                self.inodes
                    .create(&self.ctx, txn, sector, InodeKind::Symlink, inode::InodeFlags::empty())?;
                let link = self.inodes.open(&self.ctx, sector)?;
                let wrote = link
                    .write_at_journaled(&self.ctx, txn, target.as_bytes(), 0)
                    .and_then(|n| {
                        if n == target.len() {
                            Ok(())
                        } else {
                            Err(KernelError::Fs(FsError::NoSpace))
                        }
                    });
                let closed = self.inodes.close(&self.ctx, &link);
                wrote.and(closed)?;
                parent.add(&self.ctx, txn, &name, sector)
            })();
            let closed = self.inodes.close(&self.ctx, &parent.into_inode());
            result.and(closed)
        })
    }

    /// Read the target stored in a symlink, without following it.
    pub fn readlink(&self, cwd: &Arc<Inode>, path: &str) -> KernelResult<String> {
        let inode = self.resolver().resolve(cwd, path, false)?;
        let result = if inode.kind() == InodeKind::Symlink {
            path::read_link_target(&self.ctx, &inode)
        } else {
            Err(KernelError::BadArg {
                what: "not a symlink",
            })
        };
        self.inodes.close(&self.ctx, &inode)?;
        result
    }

    /// Write through a positioned file handle.
    ///
    /// Split into bounded per-transaction chunks: a single huge write
    /// would append more growth records than the circular log can hold.
    /// Each committed chunk leaves the file consistent at its new length,
    /// so a failure mid-way is an ordinary short write.
    pub fn write_file(&self, file: &File, buf: &[u8]) -> KernelResult<usize> {
        const TXN_WRITE_CHUNK: usize = 8 * SECTOR_SIZE;
        let mut done = 0;
        while done < buf.len() {
            let end = (done + TXN_WRITE_CHUNK).min(buf.len());
            let chunk = end - done;
            let n = self.with_txn(|txn| file.write(&self.ctx, txn, &buf[done..end]))?;
            done += n;
            if n < chunk {
                break; // short write: out of space
            }
        }
        Ok(done)
    }

    /// Read through a positioned file handle.
    pub fn read_file(&self, file: &File, buf: &mut [u8]) -> KernelResult<usize> {
        file.read(&self.ctx, buf)
    }

    /// Flush dirty cache entries (periodic flusher and tests).
    pub fn flush(&self) -> KernelResult<()> {
        self.ctx.cache.flush()
    }

    /// A VM-facing backing handle for an inode, holding its own registry
    /// reference so the mapping survives the descriptor being closed.
    pub fn backing_for(&self, inode: &Arc<Inode>) -> Arc<InodeBacking> {
        Arc::new(InodeBacking {
            ctx: self.ctx.clone(),
            inodes: self.inodes.clone(),
            inode: self.inodes.reopen(inode),
        })
    }
}

/// File backing used by lazy loading, mmap write-back, and eviction.
pub struct InodeBacking {
    ctx: FsContext,
    inodes: Arc<InodeManager>,
    inode: Arc<Inode>,
}

impl InodeBacking {
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }
}

impl crate::mm::FileBacking for InodeBacking {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> KernelResult<usize> {
        self.inode.read_at(&self.ctx, buf, offset as u32)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> KernelResult<usize> {
        // Write-back runs in its own small transaction: growth metadata
        // (hole allocation under an mmap page) journals like any other
        // extension.
        let txn = self.ctx.wal.txn_begin()?;
        match self.inode.write_at(&self.ctx, txn, buf, offset as u32) {
            Ok(n) => {
                self.ctx.wal.txn_commit(&self.ctx.cache, txn)?;
                Ok(n)
            }
            Err(e) => {
                let _ = self.ctx.wal.txn_abort(&self.ctx.cache, txn);
                Err(e)
            }
        }
    }

    fn len(&self) -> u64 {
        self.inode.length() as u64
    }
}

impl Drop for InodeBacking {
    fn drop(&mut self) {
        let _ = self.inodes.close(&self.ctx, &self.inode);
    }
}
