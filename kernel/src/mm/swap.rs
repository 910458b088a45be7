//! Swap-slot management.
//!
//! The swap area is the contiguous tail of the block device, divided into
//! page-sized groups of sectors tracked by a bitmap. Slots are reserved at
//! eviction and released on swap-in or process teardown.

use alloc::{sync::Arc, vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::fs::blockdev::{BlockDevice, DiskLayout, Sector, SECTORS_PER_PAGE, SECTOR_SIZE};

use super::PAGE_SIZE;

/// A reserved swap slot (one page).
pub type SwapSlot = u32;

/// The swap table.
pub struct SwapTable {
    dev: Arc<dyn BlockDevice>,
    start: Sector,
    slots: u32,
    bits: Mutex<alloc::vec::Vec<u8>>,
}

impl SwapTable {
    pub fn new(dev: Arc<dyn BlockDevice>, layout: &DiskLayout) -> Self {
        Self {
            dev,
            start: layout.swap_start,
            slots: layout.swap_slots,
            bits: Mutex::new(vec![0u8; (layout.swap_slots as usize).div_ceil(8)]),
        }
    }

    /// Write one page of data out, returning the reserved slot.
    pub fn swap_out(&self, page: &[u8]) -> KernelResult<SwapSlot> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let slot = self.reserve().ok_or(KernelError::SwapFull)?;
        if let Err(e) = self.write_slot(slot, page) {
            self.free_slot(slot);
            return Err(e);
        }
        Ok(slot)
    }

    /// Read a slot back into `page` and release it.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) -> KernelResult<()> {
        self.read_slot(slot, page)?;
        self.free_slot(slot);
        Ok(())
    }

    /// Read a slot without releasing it (fork materializes private copies
    /// of swapped pages while the parent keeps the slot).
    pub fn read_slot(&self, slot: SwapSlot, page: &mut [u8]) -> KernelResult<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let base = self.slot_sector(slot)?;
        for i in 0..SECTORS_PER_PAGE {
            let off = i as usize * SECTOR_SIZE;
            self.dev
                .read_sector(base + i, &mut page[off..off + SECTOR_SIZE])?;
        }
        Ok(())
    }

    fn write_slot(&self, slot: SwapSlot, page: &[u8]) -> KernelResult<()> {
        let base = self.slot_sector(slot)?;
        for i in 0..SECTORS_PER_PAGE {
            let off = i as usize * SECTOR_SIZE;
            self.dev
                .write_sector(base + i, &page[off..off + SECTOR_SIZE])?;
        }
        Ok(())
    }

    /// Release a slot without reading it.
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut bits = self.bits.lock();
        let idx = slot as usize;
        bits[idx / 8] &= !(1 << (idx % 8));
    }

    pub fn used_slots(&self) -> u32 {
        let bits = self.bits.lock();
        bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn total_slots(&self) -> u32 {
        self.slots
    }

    fn reserve(&self) -> Option<SwapSlot> {
        let mut bits = self.bits.lock();
        for slot in 0..self.slots as usize {
            let mask = 1 << (slot % 8);
            if bits[slot / 8] & mask == 0 {
                bits[slot / 8] |= mask;
                return Some(slot as SwapSlot);
            }
        }
        None
    }

    fn slot_sector(&self, slot: SwapSlot) -> KernelResult<Sector> {
        if slot >= self.slots {
            return Err(KernelError::BadArg {
                what: "swap slot out of range",
            });
        }
        Ok(self.start + slot * SECTORS_PER_PAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::blockdev::RamDisk;

    fn table(slots: u32) -> SwapTable {
        let disk = RamDisk::new(1024);
        let layout = DiskLayout::new(1024, slots).unwrap();
        SwapTable::new(disk, &layout)
    }

    #[test]
    fn out_then_in_round_trips_and_frees() {
        let swap = table(4);
        let mut page = vec![0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let slot = swap.swap_out(&page).unwrap();
        assert_eq!(swap.used_slots(), 1);
        let mut back = vec![0u8; PAGE_SIZE];
        swap.swap_in(slot, &mut back).unwrap();
        assert_eq!(page, back);
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn exhaustion_reports_swap_full() {
        let swap = table(2);
        let page = vec![0u8; PAGE_SIZE];
        swap.swap_out(&page).unwrap();
        swap.swap_out(&page).unwrap();
        assert_eq!(swap.swap_out(&page), Err(KernelError::SwapFull));
    }

    #[test]
    fn read_slot_does_not_release() {
        let swap = table(2);
        let page = vec![7u8; PAGE_SIZE];
        let slot = swap.swap_out(&page).unwrap();
        let mut back = vec![0u8; PAGE_SIZE];
        swap.read_slot(slot, &mut back).unwrap();
        assert_eq!(swap.used_slots(), 1);
        swap.free_slot(slot);
        assert_eq!(swap.used_slots(), 0);
    }
}
