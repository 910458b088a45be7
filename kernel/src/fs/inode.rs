//! Indexed inodes.
//!
//! Each inode occupies exactly one sector: 12 direct pointers, one
//! indirect, one doubly-indirect, sized for 8 MiB files. Pointer value 0
//! (the free-map inode's sector, never valid file data) marks an
//! unallocated slot, which is how sparse files are represented: reads of
//! holes return zeros, and extension past EOF allocates nothing until the
//! bytes are actually written.
//!
//! All pointer and length updates are journaled through the enclosing
//! transaction; file data bytes go straight to the cache. Growth tracks
//! every sector it allocates so a mid-extension failure releases them and
//! leaves the length unchanged.

use alloc::{collections::BTreeMap, sync::Arc};

use spin::Mutex;

use super::{
    blockdev::{Sector, SECTOR_SIZE},
    wal::TxnHandle,
    FsContext,
};
use crate::error::{FsError, KernelError, KernelResult};

/// Magic value identifying a valid inode sector.
pub const INODE_MAGIC: u32 = 0x4649_4E4F; // "FINO"

/// Direct pointers per inode.
pub const DIRECT_COUNT: usize = 12;
/// Sector pointers per indirect block.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4;
/// Largest supported file in sectors.
pub const MAX_FILE_SECTORS: usize =
    DIRECT_COUNT + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;
/// Largest supported file in bytes (a bit over 8 MiB).
pub const MAX_FILE_LEN: u32 = (MAX_FILE_SECTORS * SECTOR_SIZE) as u32;

bitflags::bitflags! {
    /// Inode flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InodeFlags: u8 {
        /// Content exempt from journaling (the free map's bitmap file,
        /// whose updates carry their own images).
        const LOG_EXEMPT = 0x01;
    }
}

// Byte offsets of fields within the on-disk inode sector.
const OFF_LENGTH: usize = 0;
const OFF_MAGIC: usize = 4;
const OFF_DIRECT: usize = 8;
const OFF_INDIRECT: usize = OFF_DIRECT + 4 * DIRECT_COUNT; // 56
const OFF_DINDIRECT: usize = OFF_INDIRECT + 4; // 60
const OFF_KIND: usize = 64;
const OFF_FLAGS: usize = 65;

/// What an inode names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InodeKind {
    File = 0,
    Dir = 1,
    Symlink = 2,
}

impl InodeKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::File),
            1 => Some(Self::Dir),
            2 => Some(Self::Symlink),
            _ => None,
        }
    }
}

/// In-memory image of the on-disk inode.
#[derive(Debug, Clone)]
pub struct DiskInode {
    pub length: u32,
    pub direct: [Sector; DIRECT_COUNT],
    pub indirect: Sector,
    pub dindirect: Sector,
    pub kind: InodeKind,
    pub flags: InodeFlags,
}

impl DiskInode {
    pub fn new(kind: InodeKind, flags: InodeFlags) -> Self {
        Self {
            length: 0,
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            dindirect: 0,
            kind,
            flags,
        }
    }

    pub fn encode(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[OFF_LENGTH..OFF_LENGTH + 4].copy_from_slice(&self.length.to_le_bytes());
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&INODE_MAGIC.to_le_bytes());
        for (i, ptr) in self.direct.iter().enumerate() {
            let off = OFF_DIRECT + 4 * i;
            buf[off..off + 4].copy_from_slice(&ptr.to_le_bytes());
        }
        buf[OFF_INDIRECT..OFF_INDIRECT + 4].copy_from_slice(&self.indirect.to_le_bytes());
        buf[OFF_DINDIRECT..OFF_DINDIRECT + 4].copy_from_slice(&self.dindirect.to_le_bytes());
        buf[OFF_KIND] = self.kind as u8;
        buf[OFF_FLAGS] = self.flags.bits();
        buf
    }

    pub fn decode(sector: Sector, buf: &[u8; SECTOR_SIZE]) -> KernelResult<Self> {
        let magic = u32::from_le_bytes(buf[OFF_MAGIC..OFF_MAGIC + 4].try_into().expect("len"));
        if magic != INODE_MAGIC {
            return Err(KernelError::Corrupt { sector });
        }
        let kind = InodeKind::from_u8(buf[OFF_KIND]).ok_or(KernelError::Corrupt { sector })?;
        let mut direct = [0; DIRECT_COUNT];
        for (i, ptr) in direct.iter_mut().enumerate() {
            let off = OFF_DIRECT + 4 * i;
            *ptr = u32::from_le_bytes(buf[off..off + 4].try_into().expect("len"));
        }
        Ok(Self {
            length: u32::from_le_bytes(buf[OFF_LENGTH..OFF_LENGTH + 4].try_into().expect("len")),
            direct,
            indirect: u32::from_le_bytes(
                buf[OFF_INDIRECT..OFF_INDIRECT + 4].try_into().expect("len"),
            ),
            dindirect: u32::from_le_bytes(
                buf[OFF_DINDIRECT..OFF_DINDIRECT + 4].try_into().expect("len"),
            ),
            kind,
            flags: InodeFlags::from_bits_truncate(buf[OFF_FLAGS]),
        })
    }
}

struct InodeInner {
    disk: DiskInode,
    open_cnt: u32,
    deny_write_cnt: u32,
    removed: bool,
}

/// An open inode. Shared by reference count through [`InodeManager`].
pub struct Inode {
    sector: Sector,
    inner: Mutex<InodeInner>,
}

/// Registry of open inodes, keyed by sector.
pub struct InodeManager {
    open: Mutex<BTreeMap<Sector, Arc<Inode>>>,
}

impl Default for InodeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeManager {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(BTreeMap::new()),
        }
    }

    /// Write a fresh inode to `sector` within the transaction.
    pub fn create(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        sector: Sector,
        kind: InodeKind,
        flags: InodeFlags,
    ) -> KernelResult<()> {
        let mut old = [0u8; SECTOR_SIZE];
        ctx.cache.read(sector, &mut old)?;
        let new = DiskInode::new(kind, flags).encode();
        ctx.wal.log_write(txn, sector, 0, &old, &new)?;
        ctx.cache.write(sector, &new)
    }

    /// Open the inode at `sector`, sharing any existing open instance.
    pub fn open(&self, ctx: &FsContext, sector: Sector) -> KernelResult<Arc<Inode>> {
        {
            let open = self.open.lock();
            if let Some(inode) = open.get(&sector) {
                inode.inner.lock().open_cnt += 1;
                return Ok(inode.clone());
            }
        }
        let mut buf = [0u8; SECTOR_SIZE];
        ctx.cache.read(sector, &mut buf)?;
        let disk = DiskInode::decode(sector, &buf)?;
        let inode = Arc::new(Inode {
            sector,
            inner: Mutex::new(InodeInner {
                disk,
                open_cnt: 1,
                deny_write_cnt: 0,
                removed: false,
            }),
        });
        let mut open = self.open.lock();
        // Another opener may have raced us; prefer the registered one.
        if let Some(existing) = open.get(&sector) {
            existing.inner.lock().open_cnt += 1;
            return Ok(existing.clone());
        }
        open.insert(sector, inode.clone());
        Ok(inode)
    }

    /// Take another reference to an already open inode.
    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        inode.inner.lock().open_cnt += 1;
        inode.clone()
    }

    /// Drop one reference. The last close of a removed inode frees its
    /// contents (in bounded transactions, since a maximally sized file has
    /// far more sectors than the log holds records) and then its own
    /// sector.
    pub fn close(&self, ctx: &FsContext, inode: &Arc<Inode>) -> KernelResult<()> {
        let (last, removed) = {
            let mut inner = inode.inner.lock();
            inner.open_cnt -= 1;
            (inner.open_cnt == 0, inner.removed)
        };
        if !last {
            return Ok(());
        }
        self.open.lock().remove(&inode.sector);
        if removed {
            inode.free_contents(ctx)?;
            let txn = ctx.wal.txn_begin()?;
            match ctx.freemap.release(&ctx.cache, &ctx.wal, txn, inode.sector) {
                Ok(()) => ctx.wal.txn_commit(&ctx.cache, txn)?,
                Err(e) => {
                    ctx.wal.txn_abort(&ctx.cache, txn)?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Open count of the instance registered for `sector` (diagnostics).
    pub fn open_count(&self, sector: Sector) -> u32 {
        self.open
            .lock()
            .get(&sector)
            .map(|i| i.inner.lock().open_cnt)
            .unwrap_or(0)
    }
}

impl Inode {
    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn length(&self) -> u32 {
        self.inner.lock().disk.length
    }

    pub fn kind(&self) -> InodeKind {
        self.inner.lock().disk.kind
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    /// Mark for removal; space is reclaimed at last close.
    pub fn mark_removed(&self) {
        self.inner.lock().removed = true;
    }

    /// Forbid writes through file handles (running executable).
    pub fn deny_write(&self) {
        self.inner.lock().deny_write_cnt += 1;
    }

    pub fn allow_write(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.deny_write_cnt > 0);
        inner.deny_write_cnt -= 1;
    }

    pub fn write_denied(&self) -> bool {
        self.inner.lock().deny_write_cnt > 0
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns the byte count;
    /// zero past end of file. Holes within the file read as zeros.
    pub fn read_at(&self, ctx: &FsContext, buf: &mut [u8], offset: u32) -> KernelResult<usize> {
        let inner = self.inner.lock();
        let length = inner.disk.length;
        if offset >= length {
            return Ok(0);
        }
        let end = (offset as usize + buf.len()).min(length as usize);
        let mut pos = offset as usize;
        let mut done = 0;
        while pos < end {
            let idx = pos / SECTOR_SIZE;
            let within = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(end - pos);
            match lookup_sector(ctx, &inner.disk, idx)? {
                Some(sector) => {
                    ctx.cache
                        .read_at(sector, &mut buf[done..done + chunk], within)?;
                    // Read-ahead: queue the next allocated sector.
                    if (idx + 1) * SECTOR_SIZE < length as usize {
                        if let Some(next) = lookup_sector(ctx, &inner.disk, idx + 1)? {
                            ctx.cache.prefetch(next);
                        }
                    }
                }
                None => buf[done..done + chunk].fill(0),
            }
            pos += chunk;
            done += chunk;
        }
        Ok(done)
    }

    /// Write `buf` at `offset`, extending and allocating as needed.
    ///
    /// Returns the number of bytes written, which is short only when the
    /// free map runs out mid-write; the length then advances to cover
    /// exactly the bytes written. Pointer and length updates are journaled
    /// in `txn`; an abort restores the pre-write inode image.
    pub fn write_at(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        buf: &[u8],
        offset: u32,
    ) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        if inner.deny_write_cnt > 0 {
            return Err(KernelError::Fs(FsError::DenyWrite));
        }
        let end = (offset as u64 + buf.len() as u64).min(MAX_FILE_LEN as u64) as usize;
        let mut pos = offset as usize;
        let mut done = 0;
        let mut no_space = false;
        while pos < end {
            let idx = pos / SECTOR_SIZE;
            let within = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(end - pos);
            let sector = match self.ensure_sector(ctx, txn, &mut inner, idx) {
                Ok(sector) => sector,
                Err(KernelError::Fs(FsError::NoSpace)) => {
                    no_space = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            ctx.cache.write_at(sector, &buf[done..done + chunk], within)?;
            pos += chunk;
            done += chunk;
        }
        // Advance the length only after the covered sectors exist.
        let new_len = (offset as usize + done) as u32;
        if done > 0 && new_len > inner.disk.length {
            self.set_length(ctx, txn, &mut inner, new_len)?;
        }
        if done == 0 && no_space {
            return Err(KernelError::Fs(FsError::NoSpace));
        }
        Ok(done)
    }

    /// Like [`Inode::write_at`], but journals the data bytes themselves
    /// with before/after images. Used for content that is metadata:
    /// directory entries and symlink targets.
    pub fn write_at_journaled(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        buf: &[u8],
        offset: u32,
    ) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        let end = (offset as u64 + buf.len() as u64).min(MAX_FILE_LEN as u64) as usize;
        let mut pos = offset as usize;
        let mut done = 0;
        while pos < end {
            let idx = pos / SECTOR_SIZE;
            let within = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(end - pos);
            let sector = self.ensure_sector(ctx, txn, &mut inner, idx)?;
            let mut old = [0u8; SECTOR_SIZE];
            ctx.cache.read_at(sector, &mut old[..chunk], within)?;
            ctx.wal
                .log_write(txn, sector, within, &old[..chunk], &buf[done..done + chunk])?;
            ctx.cache.write_at(sector, &buf[done..done + chunk], within)?;
            pos += chunk;
            done += chunk;
        }
        let new_len = (offset as usize + done) as u32;
        if done > 0 && new_len > inner.disk.length {
            self.set_length(ctx, txn, &mut inner, new_len)?;
        }
        Ok(done)
    }

    /// Extend the file length without allocating data sectors (sparse
    /// extension used by seek-past-EOF writes elsewhere in the same call).
    pub fn extend_length(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        new_len: u32,
    ) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        if new_len > inner.disk.length {
            self.set_length(ctx, txn, &mut inner, new_len.min(MAX_FILE_LEN))?;
        }
        Ok(())
    }

    /// Release every allocated sector (pointer blocks included).
    ///
    /// Runs as a series of bounded transactions: each batch of bit flips
    /// is journaled and committed on its own, so no single transaction
    /// outgrows the log. The inode is already unreachable from any
    /// directory when this runs, so a crash between batches leaks at most
    /// the unreleased tail, never corrupts the free map.
    pub fn free_contents(&self, ctx: &FsContext) -> KernelResult<()> {
        const RELEASE_BATCH: usize = 24;
        let sectors = {
            let inner = self.inner.lock();
            let mut sectors: alloc::vec::Vec<Sector> = alloc::vec::Vec::new();
            let disk = &inner.disk;
            for ptr in disk.direct.iter() {
                if *ptr != 0 {
                    sectors.push(*ptr);
                }
            }
            if disk.indirect != 0 {
                collect_ptr_block(ctx, disk.indirect, false, &mut sectors)?;
            }
            if disk.dindirect != 0 {
                collect_ptr_block(ctx, disk.dindirect, true, &mut sectors)?;
            }
            sectors
        };
        for batch in sectors.chunks(RELEASE_BATCH) {
            let txn = ctx.wal.txn_begin()?;
            let result = batch
                .iter()
                .try_for_each(|s| ctx.freemap.release(&ctx.cache, &ctx.wal, txn, *s));
            match result {
                Ok(()) => ctx.wal.txn_commit(&ctx.cache, txn)?,
                Err(e) => {
                    ctx.wal.txn_abort(&ctx.cache, txn)?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Number of data sectors currently allocated (tests).
    pub fn allocated_sectors(&self, ctx: &FsContext) -> KernelResult<usize> {
        let inner = self.inner.lock();
        let mut count = 0;
        let max_idx = (inner.disk.length as usize).div_ceil(SECTOR_SIZE);
        for idx in 0..max_idx {
            if lookup_sector(ctx, &inner.disk, idx)?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn set_length(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        inner: &mut InodeInner,
        new_len: u32,
    ) -> KernelResult<()> {
        let old = inner.disk.length.to_le_bytes();
        let new = new_len.to_le_bytes();
        ctx.wal.log_write(txn, self.sector, OFF_LENGTH, &old, &new)?;
        ctx.cache.write_at(self.sector, &new, OFF_LENGTH)?;
        inner.disk.length = new_len;
        Ok(())
    }

    /// Journal and apply a pointer-field update within the inode sector.
    fn set_inode_ptr(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        field_off: usize,
        old: Sector,
        new: Sector,
    ) -> KernelResult<()> {
        ctx.wal
            .log_write(txn, self.sector, field_off, &old.to_le_bytes(), &new.to_le_bytes())?;
        ctx.cache.write_at(self.sector, &new.to_le_bytes(), field_off)
    }

    /// Make sure the data sector for file-sector `idx` exists, allocating
    /// leaves and pointer blocks as needed. On allocation failure every
    /// sector acquired for this index is released again and the inode is
    /// left exactly as it was.
    fn ensure_sector(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        inner: &mut InodeInner,
        idx: usize,
    ) -> KernelResult<Sector> {
        if idx >= MAX_FILE_SECTORS {
            return Err(KernelError::Fs(FsError::NoSpace));
        }
        if idx < DIRECT_COUNT {
            if inner.disk.direct[idx] != 0 {
                return Ok(inner.disk.direct[idx]);
            }
            let leaf = ctx.freemap.allocate(&ctx.cache, &ctx.wal, txn)?;
            ctx.cache.zero(leaf)?;
            self.set_inode_ptr(ctx, txn, OFF_DIRECT + 4 * idx, 0, leaf)?;
            inner.disk.direct[idx] = leaf;
            return Ok(leaf);
        }

        if idx < DIRECT_COUNT + PTRS_PER_SECTOR {
            let slot = idx - DIRECT_COUNT;
            let mut fresh_indirect = None;
            let ind = if inner.disk.indirect != 0 {
                inner.disk.indirect
            } else {
                let s = ctx.freemap.allocate(&ctx.cache, &ctx.wal, txn)?;
                ctx.cache.zero(s)?;
                self.set_inode_ptr(ctx, txn, OFF_INDIRECT, 0, s)?;
                inner.disk.indirect = s;
                fresh_indirect = Some(s);
                s
            };
            match self.ensure_leaf_in_block(ctx, txn, ind, slot) {
                Ok(leaf) => Ok(leaf),
                Err(e) => {
                    if let Some(s) = fresh_indirect {
                        self.set_inode_ptr(ctx, txn, OFF_INDIRECT, s, 0)?;
                        inner.disk.indirect = 0;
                        ctx.freemap.release(&ctx.cache, &ctx.wal, txn, s)?;
                    }
                    Err(e)
                }
            }
        } else {
            let slot = idx - DIRECT_COUNT - PTRS_PER_SECTOR;
            let outer_slot = slot / PTRS_PER_SECTOR;
            let inner_slot = slot % PTRS_PER_SECTOR;

            let mut fresh_outer = None;
            let outer = if inner.disk.dindirect != 0 {
                inner.disk.dindirect
            } else {
                let s = ctx.freemap.allocate(&ctx.cache, &ctx.wal, txn)?;
                ctx.cache.zero(s)?;
                self.set_inode_ptr(ctx, txn, OFF_DINDIRECT, 0, s)?;
                inner.disk.dindirect = s;
                fresh_outer = Some(s);
                s
            };

            let rollback_outer = |inode: &Inode, inner: &mut InodeInner| -> KernelResult<()> {
                if let Some(s) = fresh_outer {
                    inode.set_inode_ptr(ctx, txn, OFF_DINDIRECT, s, 0)?;
                    inner.disk.dindirect = 0;
                    ctx.freemap.release(&ctx.cache, &ctx.wal, txn, s)?;
                }
                Ok(())
            };

            let mut fresh_mid = None;
            let mid = match read_ptr(ctx, outer, outer_slot)? {
                0 => {
                    let s = match ctx.freemap.allocate(&ctx.cache, &ctx.wal, txn) {
                        Ok(s) => s,
                        Err(e) => {
                            rollback_outer(self, inner)?;
                            return Err(e);
                        }
                    };
                    ctx.cache.zero(s)?;
                    write_ptr(ctx, txn, outer, outer_slot, 0, s)?;
                    fresh_mid = Some(s);
                    s
                }
                s => s,
            };

            match self.ensure_leaf_in_block(ctx, txn, mid, inner_slot) {
                Ok(leaf) => Ok(leaf),
                Err(e) => {
                    if let Some(s) = fresh_mid {
                        write_ptr(ctx, txn, outer, outer_slot, s, 0)?;
                        ctx.freemap.release(&ctx.cache, &ctx.wal, txn, s)?;
                    }
                    rollback_outer(self, inner)?;
                    Err(e)
                }
            }
        }
    }

    /// Allocate (if needed) the leaf pointed to by `slot` of pointer block
    /// `block`.
    fn ensure_leaf_in_block(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        block: Sector,
        slot: usize,
    ) -> KernelResult<Sector> {
        let existing = read_ptr(ctx, block, slot)?;
        if existing != 0 {
            return Ok(existing);
        }
        let leaf = ctx.freemap.allocate(&ctx.cache, &ctx.wal, txn)?;
        ctx.cache.zero(leaf)?;
        write_ptr(ctx, txn, block, slot, 0, leaf)?;
        Ok(leaf)
    }
}

/// Map a file-sector index to its data sector, if allocated.
fn lookup_sector(ctx: &FsContext, disk: &DiskInode, idx: usize) -> KernelResult<Option<Sector>> {
    if idx >= MAX_FILE_SECTORS {
        return Ok(None);
    }
    if idx < DIRECT_COUNT {
        return Ok(nonzero(disk.direct[idx]));
    }
    if idx < DIRECT_COUNT + PTRS_PER_SECTOR {
        if disk.indirect == 0 {
            return Ok(None);
        }
        return Ok(nonzero(read_ptr(ctx, disk.indirect, idx - DIRECT_COUNT)?));
    }
    if disk.dindirect == 0 {
        return Ok(None);
    }
    let slot = idx - DIRECT_COUNT - PTRS_PER_SECTOR;
    let mid = read_ptr(ctx, disk.dindirect, slot / PTRS_PER_SECTOR)?;
    if mid == 0 {
        return Ok(None);
    }
    Ok(nonzero(read_ptr(ctx, mid, slot % PTRS_PER_SECTOR)?))
}

fn nonzero(sector: Sector) -> Option<Sector> {
    if sector == 0 {
        None
    } else {
        Some(sector)
    }
}

fn read_ptr(ctx: &FsContext, block: Sector, slot: usize) -> KernelResult<Sector> {
    let mut buf = [0u8; 4];
    ctx.cache.read_at(block, &mut buf, slot * 4)?;
    Ok(Sector::from_le_bytes(buf))
}

/// Journal and apply a pointer update inside an indirect block.
fn write_ptr(
    ctx: &FsContext,
    txn: TxnHandle,
    block: Sector,
    slot: usize,
    old: Sector,
    new: Sector,
) -> KernelResult<()> {
    ctx.wal
        .log_write(txn, block, slot * 4, &old.to_le_bytes(), &new.to_le_bytes())?;
    ctx.cache.write_at(block, &new.to_le_bytes(), slot * 4)
}

/// Collect every sector reachable from a pointer block, the blocks below
/// it, and the block itself.
fn collect_ptr_block(
    ctx: &FsContext,
    block: Sector,
    doubly: bool,
    out: &mut alloc::vec::Vec<Sector>,
) -> KernelResult<()> {
    for slot in 0..PTRS_PER_SECTOR {
        let ptr = read_ptr(ctx, block, slot)?;
        if ptr == 0 {
            continue;
        }
        if doubly {
            collect_ptr_block(ctx, ptr, false, out)?;
        } else {
            out.push(ptr);
        }
    }
    out.push(block);
    Ok(())
}
