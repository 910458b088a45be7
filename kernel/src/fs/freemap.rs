//! Free-sector bitmap.
//!
//! One bit per data sector, persisted as the file whose inode lives at
//! sector 0. The in-memory bitmap addresses its backing sectors through a
//! list captured at format/mount time, so bitmap I/O never recurses into
//! the inode layer. Every allocate and release is journaled as a one-byte
//! before/after image.

use alloc::{vec, vec::Vec};

use spin::Mutex;

use super::{
    blockdev::{DiskLayout, Sector, SECTOR_SIZE},
    cache::BufferCache,
    wal::{TxnHandle, Wal},
};
use crate::error::{FsError, KernelError, KernelResult};

/// The free map.
pub struct FreeMap {
    data_start: Sector,
    data_sectors: u32,
    /// Data sectors of the free-map file itself, in file order.
    backing: Vec<Sector>,
    bits: Mutex<Vec<u8>>,
}

impl FreeMap {
    /// Bytes needed to cover `data_sectors` sectors.
    pub fn bitmap_bytes(data_sectors: u32) -> usize {
        data_sectors.div_ceil(8) as usize
    }

    /// Sectors needed to store the bitmap file.
    pub fn bitmap_sectors(data_sectors: u32) -> u32 {
        (Self::bitmap_bytes(data_sectors).div_ceil(SECTOR_SIZE)) as u32
    }

    /// Build a fresh free map at format time.
    ///
    /// The bitmap file occupies the first sectors of the data region; those
    /// sectors are pre-marked used and the initial bitmap is written out.
    /// The caller writes the matching inode at sector 0.
    pub fn format(cache: &BufferCache, layout: &DiskLayout) -> KernelResult<FreeMap> {
        let n_sectors = Self::bitmap_sectors(layout.data_sectors);
        let backing: Vec<Sector> = (0..n_sectors).map(|i| layout.data_start + i).collect();
        let map = FreeMap {
            data_start: layout.data_start,
            data_sectors: layout.data_sectors,
            backing,
            bits: Mutex::new(vec![0u8; Self::bitmap_bytes(layout.data_sectors)]),
        };
        {
            let mut bits = map.bits.lock();
            for i in 0..n_sectors {
                set_bit(&mut bits, i as usize);
            }
        }
        map.write_all(cache)?;
        Ok(map)
    }

    /// Load the bitmap from its backing sectors at mount time.
    pub fn open(
        cache: &BufferCache,
        layout: &DiskLayout,
        backing: Vec<Sector>,
    ) -> KernelResult<FreeMap> {
        let bytes = Self::bitmap_bytes(layout.data_sectors);
        let mut bits = vec![0u8; bytes];
        for (i, sector) in backing.iter().enumerate() {
            let start = i * SECTOR_SIZE;
            let len = (bytes - start).min(SECTOR_SIZE);
            cache.read_at(*sector, &mut bits[start..start + len], 0)?;
        }
        Ok(FreeMap {
            data_start: layout.data_start,
            data_sectors: layout.data_sectors,
            backing,
            bits: Mutex::new(bits),
        })
    }

    /// Backing sectors of the bitmap file (for building its inode).
    pub fn backing_sectors(&self) -> &[Sector] {
        &self.backing
    }

    /// Allocate one free sector. Journaled; the bit flip reaches the cache
    /// before the sector number is returned.
    pub fn allocate(
        &self,
        cache: &BufferCache,
        wal: &Wal,
        txn: TxnHandle,
    ) -> KernelResult<Sector> {
        let mut bits = self.bits.lock();
        let bit = match first_clear(&bits, self.data_sectors as usize) {
            Some(bit) => bit,
            None => return Err(KernelError::Fs(FsError::NoSpace)),
        };
        let byte_idx = bit / 8;
        let old = bits[byte_idx];
        let new = old | (1 << (bit % 8));
        self.journal_byte(cache, wal, txn, byte_idx, old, new)?;
        bits[byte_idx] = new;
        Ok(self.data_start + bit as Sector)
    }

    /// Release a sector back to the free map. Journaled.
    pub fn release(
        &self,
        cache: &BufferCache,
        wal: &Wal,
        txn: TxnHandle,
        sector: Sector,
    ) -> KernelResult<()> {
        if sector < self.data_start || sector >= self.data_start + self.data_sectors {
            return Err(KernelError::BadArg {
                what: "release outside data region",
            });
        }
        let bit = (sector - self.data_start) as usize;
        let mut bits = self.bits.lock();
        let byte_idx = bit / 8;
        let old = bits[byte_idx];
        let new = old & !(1 << (bit % 8));
        if old == new {
            return Err(KernelError::Corrupt { sector });
        }
        self.journal_byte(cache, wal, txn, byte_idx, old, new)?;
        bits[byte_idx] = new;
        Ok(())
    }

    /// Number of sectors currently allocated.
    pub fn used_count(&self) -> u32 {
        let bits = self.bits.lock();
        bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Number of sectors still free.
    pub fn free_count(&self) -> u32 {
        self.data_sectors - self.used_count()
    }

    pub fn is_used(&self, sector: Sector) -> bool {
        if sector < self.data_start || sector >= self.data_start + self.data_sectors {
            return false;
        }
        let bit = (sector - self.data_start) as usize;
        let bits = self.bits.lock();
        bits[bit / 8] & (1 << (bit % 8)) != 0
    }

    fn journal_byte(
        &self,
        cache: &BufferCache,
        wal: &Wal,
        txn: TxnHandle,
        byte_idx: usize,
        old: u8,
        new: u8,
    ) -> KernelResult<()> {
        let sector = self.backing[byte_idx / SECTOR_SIZE];
        let offset = byte_idx % SECTOR_SIZE;
        wal.log_write(txn, sector, offset, &[old], &[new])?;
        cache.write_at(sector, &[new], offset)
    }

    /// Write the whole bitmap through the cache (format only).
    fn write_all(&self, cache: &BufferCache) -> KernelResult<()> {
        let bits = self.bits.lock();
        for (i, sector) in self.backing.iter().enumerate() {
            let start = i * SECTOR_SIZE;
            let len = (bits.len() - start).min(SECTOR_SIZE);
            let mut sector_buf = [0u8; SECTOR_SIZE];
            sector_buf[..len].copy_from_slice(&bits[start..start + len]);
            cache.write(*sector, &sector_buf)?;
        }
        Ok(())
    }
}

fn set_bit(bits: &mut [u8], bit: usize) {
    bits[bit / 8] |= 1 << (bit % 8);
}

fn first_clear(bits: &[u8], limit: usize) -> Option<usize> {
    for (i, byte) in bits.iter().enumerate() {
        if *byte != 0xFF {
            let bit = i * 8 + byte.trailing_ones() as usize;
            if bit < limit {
                return Some(bit);
            }
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::blockdev::{BlockDevice, RamDisk};
    use alloc::sync::Arc;

    fn setup() -> (Arc<BufferCache>, Arc<Wal>, FreeMap) {
        let disk = RamDisk::new(2048);
        let dev: Arc<dyn BlockDevice> = disk;
        Wal::format(&dev).unwrap();
        let cache = BufferCache::new(dev.clone());
        let (wal, _) = Wal::mount(dev).unwrap();
        cache.attach_wal(wal.clone());
        let layout = DiskLayout::new(2048, 8).unwrap();
        let map = FreeMap::format(&cache, &layout).unwrap();
        (cache, wal, map)
    }

    #[test]
    fn format_reserves_its_own_backing() {
        let (_cache, _wal, map) = setup();
        for s in map.backing_sectors().to_vec() {
            assert!(map.is_used(s));
        }
        assert_eq!(map.used_count(), map.backing_sectors().len() as u32);
    }

    #[test]
    fn allocate_release_round_trip() {
        let (cache, wal, map) = setup();
        let txn = wal.txn_begin().unwrap();
        let a = map.allocate(&cache, &wal, txn).unwrap();
        let b = map.allocate(&cache, &wal, txn).unwrap();
        assert_ne!(a, b);
        assert!(map.is_used(a));
        map.release(&cache, &wal, txn, a).unwrap();
        assert!(!map.is_used(a));
        wal.txn_commit(&cache, txn).unwrap();
    }

    #[test]
    fn double_release_is_detected() {
        let (cache, wal, map) = setup();
        let txn = wal.txn_begin().unwrap();
        let a = map.allocate(&cache, &wal, txn).unwrap();
        map.release(&cache, &wal, txn, a).unwrap();
        assert!(map.release(&cache, &wal, txn, a).is_err());
        wal.txn_commit(&cache, txn).unwrap();
    }

    #[test]
    fn aborted_allocation_is_restored_on_disk() {
        let (cache, wal, map) = setup();
        let used_before = map.used_count();
        let txn = wal.txn_begin().unwrap();
        let _a = map.allocate(&cache, &wal, txn).unwrap();
        wal.txn_abort(&cache, txn).unwrap();
        // The on-disk (cached) bitmap byte is back to its old image. The
        // in-memory copy is refreshed by re-reading the backing sectors.
        let layout = DiskLayout::new(2048, 8).unwrap();
        let reread = FreeMap::open(&cache, &layout, map.backing_sectors().to_vec()).unwrap();
        assert_eq!(reread.used_count(), used_before);
    }
}
