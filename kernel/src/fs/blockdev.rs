//! Block device abstraction and on-disk region layout.
//!
//! Devices are sector-addressed with 512-byte sectors. The hardware ATA
//! driver lives behind this trait in the adaptation layer; tests and the
//! host build use [`RamDisk`].

use alloc::{sync::Arc, vec, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Sector number on a block device.
pub type Sector = u32;

/// Size of one sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector holding the free-map file's inode.
pub const FREE_MAP_SECTOR: Sector = 0;
/// Sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: Sector = 1;
/// First sector of the circular write-ahead log region.
pub const WAL_START: Sector = 2;
/// Length of the log region in sectors (one record per sector).
pub const WAL_SECTORS: Sector = 128;
/// Sector holding the WAL metadata block.
pub const WAL_META_SECTOR: Sector = WAL_START + WAL_SECTORS;
/// First general-purpose data sector.
pub const DATA_START: Sector = WAL_META_SECTOR + 1;

/// A sector-addressed storage device.
pub trait BlockDevice: Send + Sync {
    /// Total number of sectors.
    fn sector_count(&self) -> Sector;

    /// Read one sector into `buf` (`buf.len() == SECTOR_SIZE`).
    fn read_sector(&self, sector: Sector, buf: &mut [u8]) -> KernelResult<()>;

    /// Write one sector from `buf` (`buf.len() == SECTOR_SIZE`).
    fn write_sector(&self, sector: Sector, buf: &[u8]) -> KernelResult<()>;
}

/// Division of a device into data and swap regions.
///
/// The fixed header (inodes, log, log metadata) precedes the data region;
/// the swap area is a contiguous tail sized in whole pages.
#[derive(Debug, Clone, Copy)]
pub struct DiskLayout {
    /// First data sector.
    pub data_start: Sector,
    /// Number of data sectors.
    pub data_sectors: Sector,
    /// First swap sector.
    pub swap_start: Sector,
    /// Number of swap slots (pages).
    pub swap_slots: u32,
}

/// Sectors per page-sized swap slot.
pub const SECTORS_PER_PAGE: u32 = (crate::mm::PAGE_SIZE / SECTOR_SIZE) as u32;

impl DiskLayout {
    /// Split a device of `total` sectors, reserving `swap_pages` pages of
    /// swap at the tail.
    pub fn new(total: Sector, swap_pages: u32) -> KernelResult<Self> {
        let swap_sectors = swap_pages * SECTORS_PER_PAGE;
        if total < DATA_START + swap_sectors + 16 {
            return Err(KernelError::BadArg {
                what: "device too small for layout",
            });
        }
        let swap_start = total - swap_sectors;
        Ok(Self {
            data_start: DATA_START,
            data_sectors: swap_start - DATA_START,
            swap_start,
            swap_slots: swap_pages,
        })
    }
}

/// RAM-backed block device for tests and the host build.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    count: Sector,
}

impl RamDisk {
    pub fn new(count: Sector) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; count as usize * SECTOR_SIZE]),
            count,
        })
    }

    /// Byte-for-byte copy of the device, for crash-recovery tests.
    pub fn clone_contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Replace the device contents (simulates remounting a crashed image).
    pub fn restore_contents(&self, contents: &[u8]) {
        let mut data = self.data.lock();
        data.copy_from_slice(contents);
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> Sector {
        self.count
    }

    fn read_sector(&self, sector: Sector, buf: &mut [u8]) -> KernelResult<()> {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        if sector >= self.count {
            return Err(KernelError::Io { sector });
        }
        let data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&self, sector: Sector, buf: &[u8]) -> KernelResult<()> {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        if sector >= self.count {
            return Err(KernelError::Io { sector });
        }
        let mut data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramdisk_round_trip() {
        let disk = RamDisk::new(32);
        let mut sector = [0u8; SECTOR_SIZE];
        sector[0] = 0xAB;
        sector[511] = 0xCD;
        disk.write_sector(5, &sector).unwrap();
        let mut back = [0u8; SECTOR_SIZE];
        disk.read_sector(5, &mut back).unwrap();
        assert_eq!(sector, back);
    }

    #[test]
    fn out_of_range_is_io_error() {
        let disk = RamDisk::new(4);
        let buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            disk.write_sector(4, &buf),
            Err(KernelError::Io { sector: 4 })
        );
    }

    #[test]
    fn layout_reserves_swap_tail() {
        let layout = DiskLayout::new(1024, 8).unwrap();
        assert_eq!(layout.swap_start, 1024 - 8 * SECTORS_PER_PAGE);
        assert_eq!(layout.data_start, DATA_START);
        assert_eq!(
            layout.data_start + layout.data_sectors,
            layout.swap_start
        );
    }
}
