//! Directories.
//!
//! A directory is a file whose content is an array of fixed-size entries:
//! inode sector, a 14-byte NUL-terminated name, and an in-use flag. Lookup
//! scans linearly; insertion reuses the first free slot or appends. Every
//! directory carries structural `.` and `..` entries.

use alloc::{string::String, sync::Arc, vec::Vec};

use super::{
    blockdev::Sector,
    inode::{Inode, InodeKind},
    wal::TxnHandle,
    FsContext,
};
use crate::error::{FsError, KernelError, KernelResult};

/// Maximum usable name length (the field holds 14 bytes incl. NUL).
pub const NAME_MAX: usize = 13;
const NAME_FIELD: usize = 14;
/// Size of one directory entry on disk.
pub const ENTRY_SIZE: usize = 20;

const OFF_SECTOR: usize = 0;
const OFF_NAME: usize = 4;
const OFF_IN_USE: usize = 4 + NAME_FIELD;

/// One decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode_sector: Sector,
    pub name: String,
    pub in_use: bool,
}

impl DirEntry {
    fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[OFF_SECTOR..OFF_SECTOR + 4].copy_from_slice(&self.inode_sector.to_le_bytes());
        let bytes = self.name.as_bytes();
        buf[OFF_NAME..OFF_NAME + bytes.len()].copy_from_slice(bytes);
        buf[OFF_IN_USE] = u8::from(self.in_use);
        buf
    }

    fn decode(buf: &[u8; ENTRY_SIZE]) -> Self {
        let inode_sector =
            Sector::from_le_bytes(buf[OFF_SECTOR..OFF_SECTOR + 4].try_into().expect("len"));
        let name_field = &buf[OFF_NAME..OFF_NAME + NAME_FIELD];
        let name_len = name_field.iter().position(|b| *b == 0).unwrap_or(NAME_FIELD);
        let name = String::from_utf8_lossy(&name_field[..name_len]).into_owned();
        Self {
            inode_sector,
            name,
            in_use: buf[OFF_IN_USE] != 0,
        }
    }
}

/// Validate a single path component as an entry name.
pub fn check_name(name: &str) -> KernelResult<()> {
    if name.is_empty() {
        return Err(KernelError::Fs(FsError::BadPath));
    }
    if name.len() > NAME_MAX {
        return Err(KernelError::Fs(FsError::NameTooLong));
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(KernelError::Fs(FsError::BadPath));
    }
    Ok(())
}

/// A directory view over an inode of kind [`InodeKind::Dir`].
pub struct Dir {
    inode: Arc<Inode>,
}

impl Dir {
    pub fn open(inode: Arc<Inode>) -> KernelResult<Dir> {
        if inode.kind() != InodeKind::Dir {
            return Err(KernelError::Fs(FsError::NotDir));
        }
        Ok(Dir { inode })
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Give up the directory view, handing its inode reference to the
    /// caller (who becomes responsible for the registry close).
    pub fn into_inode(self) -> Arc<Inode> {
        self.inode
    }

    /// Number of entry slots (in use or free) the directory has grown to.
    fn slot_count(&self) -> usize {
        self.inode.length() as usize / ENTRY_SIZE
    }

    fn read_slot(&self, ctx: &FsContext, slot: usize) -> KernelResult<DirEntry> {
        let mut buf = [0u8; ENTRY_SIZE];
        let n = self
            .inode
            .read_at(ctx, &mut buf, (slot * ENTRY_SIZE) as u32)?;
        debug_assert_eq!(n, ENTRY_SIZE);
        Ok(DirEntry::decode(&buf))
    }

    fn write_slot(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        slot: usize,
        entry: &DirEntry,
    ) -> KernelResult<()> {
        let buf = entry.encode();
        let n = self
            .inode
            .write_at_journaled(ctx, txn, &buf, (slot * ENTRY_SIZE) as u32)?;
        if n != ENTRY_SIZE {
            return Err(KernelError::Fs(FsError::NoSpace));
        }
        Ok(())
    }

    /// Find `name`, returning its inode sector.
    pub fn lookup(&self, ctx: &FsContext, name: &str) -> KernelResult<Option<Sector>> {
        for slot in 0..self.slot_count() {
            let entry = self.read_slot(ctx, slot)?;
            if entry.in_use && entry.name == name {
                return Ok(Some(entry.inode_sector));
            }
        }
        Ok(None)
    }

    /// Insert `name -> sector`, reusing a free slot or appending.
    pub fn add(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        name: &str,
        sector: Sector,
    ) -> KernelResult<()> {
        check_name(name)?;
        if self.inode.is_removed() {
            return Err(KernelError::Fs(FsError::Removed));
        }
        let mut free_slot = None;
        for slot in 0..self.slot_count() {
            let entry = self.read_slot(ctx, slot)?;
            if entry.in_use {
                if entry.name == name {
                    return Err(KernelError::Fs(FsError::Exists));
                }
            } else if free_slot.is_none() {
                free_slot = Some(slot);
            }
        }
        let slot = free_slot.unwrap_or_else(|| self.slot_count());
        self.write_slot(
            ctx,
            txn,
            slot,
            &DirEntry {
                inode_sector: sector,
                name: String::from(name),
                in_use: true,
            },
        )
    }

    /// Mark `name`'s entry free, returning the inode sector it named.
    /// `.` and `..` are structural and refuse removal.
    pub fn remove_entry(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        name: &str,
    ) -> KernelResult<Sector> {
        if name == "." || name == ".." {
            return Err(KernelError::BadArg {
                what: "cannot remove . or ..",
            });
        }
        for slot in 0..self.slot_count() {
            let mut entry = self.read_slot(ctx, slot)?;
            if entry.in_use && entry.name == name {
                let sector = entry.inode_sector;
                entry.in_use = false;
                self.write_slot(ctx, txn, slot, &entry)?;
                return Ok(sector);
            }
        }
        Err(KernelError::Fs(FsError::NotFound))
    }

    /// Next in-use entry at or after `slot`, skipping `.` and `..`.
    /// Returns the entry and the slot to continue from.
    pub fn next_entry(
        &self,
        ctx: &FsContext,
        mut slot: usize,
    ) -> KernelResult<Option<(DirEntry, usize)>> {
        while slot < self.slot_count() {
            let entry = self.read_slot(ctx, slot)?;
            slot += 1;
            if entry.in_use && entry.name != "." && entry.name != ".." {
                return Ok(Some((entry, slot)));
            }
        }
        Ok(None)
    }

    /// True when nothing but `.` and `..` remain.
    pub fn is_empty(&self, ctx: &FsContext) -> KernelResult<bool> {
        Ok(self.next_entry(ctx, 0)?.is_none())
    }

    /// All in-use names (tests and diagnostics).
    pub fn list(&self, ctx: &FsContext) -> KernelResult<Vec<String>> {
        let mut names = Vec::new();
        let mut slot = 0;
        while let Some((entry, next)) = self.next_entry(ctx, slot)? {
            names.push(entry.name);
            slot = next;
        }
        Ok(names)
    }

    /// Write the structural `.` and `..` entries of a fresh directory.
    pub fn init_dot_entries(
        &self,
        ctx: &FsContext,
        txn: TxnHandle,
        parent_sector: Sector,
    ) -> KernelResult<()> {
        self.write_slot(
            ctx,
            txn,
            0,
            &DirEntry {
                inode_sector: self.inode.sector(),
                name: String::from("."),
                in_use: true,
            },
        )?;
        self.write_slot(
            ctx,
            txn,
            1,
            &DirEntry {
                inode_sector: parent_sector,
                name: String::from(".."),
                in_use: true,
            },
        )
    }
}
