//! Write-back buffer cache.
//!
//! Fixed capacity of 64 sector-sized entries. The map lock guards only
//! entry state and slot reservation; all block I/O runs with it released
//! and the chosen slot parked in LOADING, so concurrent users of that
//! sector wait for the load to complete. A LOADING entry is never
//! evictable, and a dirty victim is written back before its slot is
//! reused. Eviction is second-chance clock.
//!
//! The write-ahead rule is enforced here: before a dirty sector leaves the
//! cache for the device, any unflushed log records are forced first.

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, Once};

use super::{
    blockdev::{BlockDevice, Sector, SECTOR_SIZE},
    wal::Wal,
};
use crate::error::KernelResult;
use crate::sched;

/// Number of cache entries.
pub const CACHE_SLOTS: usize = 64;

/// Periodic flush cadence in timer ticks (30 seconds).
pub const FLUSH_INTERVAL_TICKS: u64 = 30 * crate::sched::TICK_HZ;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Invalid,
    /// Reserved for I/O in flight (load, or write-back of the previous
    /// occupant). Not evictable; waiters poll-yield until VALID.
    Loading,
    Valid,
}

#[derive(Clone, Copy)]
struct SlotMeta {
    status: SlotStatus,
    sector: Option<Sector>,
    dirty: bool,
    /// Second-chance reference bit.
    refbit: bool,
    /// Bumped on every content mutation; lets flush clear `dirty` only
    /// when the snapshot it wrote is still current.
    version: u64,
}

const EMPTY_SLOT: SlotMeta = SlotMeta {
    status: SlotStatus::Invalid,
    sector: None,
    dirty: false,
    refbit: false,
    version: 0,
};

struct CacheMap {
    slots: [SlotMeta; CACHE_SLOTS],
    hand: usize,
}

/// The buffer cache.
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    map: Mutex<CacheMap>,
    data: Vec<Mutex<[u8; SECTOR_SIZE]>>,
    wal: Once<Arc<Wal>>,
    prefetch_queue: Mutex<VecDeque<Sector>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

enum Fill<'a> {
    /// Read the sector from the device.
    Load,
    /// Full-sector overwrite; skip the device read.
    Data(&'a [u8]),
}

impl BufferCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Arc<Self> {
        let mut data = Vec::with_capacity(CACHE_SLOTS);
        for _ in 0..CACHE_SLOTS {
            data.push(Mutex::new([0u8; SECTOR_SIZE]));
        }
        Arc::new(Self {
            dev,
            map: Mutex::new(CacheMap {
                slots: [EMPTY_SLOT; CACHE_SLOTS],
                hand: 0,
            }),
            data,
            wal: Once::new(),
            prefetch_queue: Mutex::new(VecDeque::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Wire up the log so dirty write-back can honor the write-ahead rule.
    pub fn attach_wal(&self, wal: Arc<Wal>) {
        self.wal.call_once(|| wal);
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Read a whole sector.
    pub fn read(&self, sector: Sector, buf: &mut [u8]) -> KernelResult<()> {
        self.read_at(sector, buf, 0)
    }

    /// Read `buf.len()` bytes starting at `off` within a sector.
    pub fn read_at(&self, sector: Sector, buf: &mut [u8], off: usize) -> KernelResult<()> {
        debug_assert!(off + buf.len() <= SECTOR_SIZE);
        loop {
            match self.try_use(sector, |data| {
                buf.copy_from_slice(&data[off..off + buf.len()]);
                false
            })? {
                true => return Ok(()),
                false => self.install(sector, Fill::Load)?,
            }
        }
    }

    /// Write a whole sector.
    pub fn write(&self, sector: Sector, buf: &[u8]) -> KernelResult<()> {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        loop {
            match self.try_use(sector, |data| {
                data.copy_from_slice(buf);
                true
            })? {
                true => return Ok(()),
                // Full overwrite: no need to read the old contents in.
                false => self.install(sector, Fill::Data(buf))?,
            }
        }
    }

    /// Write part of a sector (loads the remainder on a miss).
    pub fn write_at(&self, sector: Sector, buf: &[u8], off: usize) -> KernelResult<()> {
        debug_assert!(off + buf.len() <= SECTOR_SIZE);
        loop {
            match self.try_use(sector, |data| {
                data[off..off + buf.len()].copy_from_slice(buf);
                true
            })? {
                true => return Ok(()),
                false => self.install(sector, Fill::Load)?,
            }
        }
    }

    /// Fill a sector with zeros without reading it.
    pub fn zero(&self, sector: Sector) -> KernelResult<()> {
        let zeros = [0u8; SECTOR_SIZE];
        self.write(sector, &zeros)
    }

    /// Queue an asynchronous load of `sector` (read-ahead).
    pub fn prefetch(&self, sector: Sector) {
        {
            let map = self.map.lock();
            if map.slot_of(sector).is_some() {
                return;
            }
        }
        let mut q = self.prefetch_queue.lock();
        if !q.contains(&sector) {
            q.push_back(sector);
        }
    }

    /// Load queued read-ahead sectors. Run by the read-ahead daemon on bare
    /// metal; tests call it directly.
    pub fn drain_prefetch(&self) -> KernelResult<usize> {
        let mut n = 0;
        loop {
            let Some(sector) = self.prefetch_queue.lock().pop_front() else {
                return Ok(n);
            };
            let already = self.map.lock().slot_of(sector).is_some();
            if !already {
                self.install(sector, Fill::Load)?;
                n += 1;
            }
        }
    }

    /// Write every dirty entry back to the device. LOADING and INVALID
    /// entries are skipped.
    pub fn flush(&self) -> KernelResult<()> {
        for i in 0..CACHE_SLOTS {
            let snapshot = {
                let map = self.map.lock();
                let meta = &map.slots[i];
                if meta.status != SlotStatus::Valid || !meta.dirty {
                    continue;
                }
                let sector = meta.sector.expect("valid slot without sector");
                let data = self.data[i].lock();
                (sector, *data, meta.version)
            };
            let (sector, data, version) = snapshot;
            self.write_barrier(sector)?;
            self.dev.write_sector(sector, &data)?;
            let mut map = self.map.lock();
            let meta = &mut map.slots[i];
            if meta.status == SlotStatus::Valid
                && meta.sector == Some(sector)
                && meta.version == version
            {
                meta.dirty = false;
            }
        }
        Ok(())
    }

    /// Number of cached sectors (for tests and diagnostics).
    pub fn resident(&self) -> usize {
        let map = self.map.lock();
        map.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Valid)
            .count()
    }

    /// True when the sector is resident and dirty.
    pub fn is_dirty(&self, sector: Sector) -> bool {
        let map = self.map.lock();
        map.slot_of(sector)
            .map(|i| map.slots[i].dirty)
            .unwrap_or(false)
    }

    fn write_barrier(&self, sector: Sector) -> KernelResult<()> {
        if let Some(wal) = self.wal.get() {
            wal.write_barrier(sector)?;
        }
        Ok(())
    }

    /// Attempt to use a resident sector. Returns Ok(true) when `f` ran,
    /// Ok(false) on a miss. Waits out LOADING entries.
    ///
    /// `f` returns true when it mutated the contents (marks dirty).
    fn try_use(
        &self,
        sector: Sector,
        f: impl FnOnce(&mut [u8; SECTOR_SIZE]) -> bool,
    ) -> KernelResult<bool> {
        let mut f = Some(f);
        loop {
            {
                let mut map = self.map.lock();
                match map.slot_of(sector) {
                    Some(i) => match map.slots[i].status {
                        SlotStatus::Valid => {
                            map.slots[i].refbit = true;
                            // The data lock cannot block here: holders doing
                            // I/O park the slot in LOADING first, and other
                            // copiers only take it under the map lock.
                            let mut data = self.data[i].lock();
                            let f = f.take().expect("single use");
                            let mutated = f(&mut data);
                            if mutated {
                                map.slots[i].dirty = true;
                                map.slots[i].version += 1;
                            }
                            self.hits.fetch_add(1, Ordering::Relaxed);
                            return Ok(true);
                        }
                        SlotStatus::Loading => {}
                        SlotStatus::Invalid => return Ok(false),
                    },
                    None => return Ok(false),
                }
            }
            // Someone else is loading this sector; let them finish.
            sched::relax();
        }
    }

    /// Bring `sector` into the cache, evicting if necessary. On return the
    /// sector is VALID (or an error is reported and nothing is resident).
    fn install(&self, sector: Sector, fill: Fill<'_>) -> KernelResult<()> {
        // Phase 1: reserve a slot, writing back the previous occupant.
        // Duplicate check and claim happen under one hold of the map lock,
        // so two loaders can never bind the same sector twice.
        let slot = loop {
            let claim = {
                let mut map = self.map.lock();
                if map.slot_of(sector).is_some() {
                    // Raced with another loader; the caller's retry loop
                    // will find it.
                    return Ok(());
                }
                match map.choose_slot() {
                    None => None,
                    Some(i) => {
                        let meta = &mut map.slots[i];
                        let old = (meta.sector, meta.status == SlotStatus::Valid && meta.dirty);
                        meta.status = SlotStatus::Loading;
                        meta.dirty = false;
                        Some((i, old))
                    }
                }
            };
            match claim {
                Some((i, old)) => {
                    // Write back the old occupant if dirty; the slot sits in
                    // LOADING (still owned by the old sector) meanwhile, so
                    // readers of the old sector wait and then reload from
                    // the freshly written device contents.
                    if let (Some(old_sector), true) = old {
                        let data = *self.data[i].lock();
                        self.write_barrier(old_sector)?;
                        if let Err(e) = self.dev.write_sector(old_sector, &data) {
                            let mut map = self.map.lock();
                            let meta = &mut map.slots[i];
                            meta.status = SlotStatus::Valid;
                            meta.dirty = true;
                            return Err(e);
                        }
                    }
                    break i;
                }
                None => {
                    // Every slot is mid-I/O; wait for one to settle.
                    sched::relax();
                }
            }
        };

        // Phase 2: the slot is ours (LOADING). Rebind it and fill.
        {
            let mut map = self.map.lock();
            let meta = &mut map.slots[slot];
            meta.sector = Some(sector);
            meta.refbit = true;
            meta.version += 1;
        }
        let overwrite = matches!(fill, Fill::Data(_));
        let result = {
            let mut data = self.data[slot].lock();
            match fill {
                Fill::Load => self.dev.read_sector(sector, &mut data[..]),
                Fill::Data(src) => {
                    data.copy_from_slice(src);
                    Ok(())
                }
            }
        };
        let mut map = self.map.lock();
        let meta = &mut map.slots[slot];
        match result {
            Ok(()) => {
                meta.status = SlotStatus::Valid;
                meta.dirty = overwrite;
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                *meta = EMPTY_SLOT;
                Err(e)
            }
        }
    }
}

impl CacheMap {
    fn slot_of(&self, sector: Sector) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.sector == Some(sector) && s.status != SlotStatus::Invalid)
    }

    /// Pick a victim slot: any INVALID slot first, else second-chance clock
    /// over VALID entries. LOADING entries are never chosen. Returns None
    /// when everything is mid-I/O.
    fn choose_slot(&mut self) -> Option<usize> {
        if let Some(i) = self
            .slots
            .iter()
            .position(|s| s.status == SlotStatus::Invalid)
        {
            return Some(i);
        }
        for _ in 0..CACHE_SLOTS * 2 {
            let i = self.hand;
            self.hand = (self.hand + 1) % CACHE_SLOTS;
            let meta = &mut self.slots[i];
            if meta.status != SlotStatus::Valid {
                continue;
            }
            if meta.refbit {
                meta.refbit = false;
                continue;
            }
            return Some(i);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::blockdev::RamDisk;

    fn filled(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    #[test]
    fn read_returns_written_data() {
        let disk = RamDisk::new(256);
        let cache = BufferCache::new(disk);
        cache.write(9, &filled(0x5A)).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(9, &mut buf).unwrap();
        assert_eq!(buf, filled(0x5A));
    }

    #[test]
    fn partial_write_preserves_rest_of_sector() {
        let disk = RamDisk::new(256);
        disk.write_sector(3, &filled(0x11)).unwrap();
        let cache = BufferCache::new(disk);
        cache.write_at(3, &[0xFF, 0xFF], 100).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(3, &mut buf).unwrap();
        assert_eq!(buf[99], 0x11);
        assert_eq!(buf[100], 0xFF);
        assert_eq!(buf[101], 0xFF);
        assert_eq!(buf[102], 0x11);
    }

    #[test]
    fn eviction_writes_dirty_victim_back() {
        let disk = RamDisk::new(1024);
        let cache = BufferCache::new(disk.clone());
        // Dirty all 64 slots with distinct sectors.
        for s in 0..CACHE_SLOTS as Sector {
            cache.write(s, &filled(s as u8)).unwrap();
        }
        assert_eq!(cache.resident(), CACHE_SLOTS);
        // Touch one more sector to force an eviction.
        cache.write(500, &filled(0xEE)).unwrap();
        assert_eq!(cache.resident(), CACHE_SLOTS);
        // Exactly one of the original sectors was written back to disk.
        let mut on_disk = 0;
        for s in 0..CACHE_SLOTS as Sector {
            let mut buf = [0u8; SECTOR_SIZE];
            disk.read_sector(s, &mut buf).unwrap();
            if buf == filled(s as u8) {
                on_disk += 1;
            }
        }
        assert_eq!(on_disk, 1);
        // The evictee reloads from disk with the written-back value.
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(0, &mut buf).unwrap();
        assert_eq!(buf, filled(0));
    }

    #[test]
    fn flush_cleans_all_dirty_entries() {
        let disk = RamDisk::new(256);
        let cache = BufferCache::new(disk.clone());
        for s in 0..10 {
            cache.write(s, &filled(0xA0 + s as u8)).unwrap();
            assert!(cache.is_dirty(s));
        }
        cache.flush().unwrap();
        for s in 0..10 {
            assert!(!cache.is_dirty(s));
            let mut buf = [0u8; SECTOR_SIZE];
            disk.read_sector(s, &mut buf).unwrap();
            assert_eq!(buf, filled(0xA0 + s as u8));
        }
    }

    #[test]
    fn second_chance_spares_recently_used_entries() {
        let disk = RamDisk::new(1024);
        let cache = BufferCache::new(disk);
        for s in 0..CACHE_SLOTS as Sector {
            cache.write(s, &filled(1)).unwrap();
        }
        // First eviction sweeps every reference bit clear.
        cache.write(600, &filled(2)).unwrap();
        // Re-reference sector 5; the next eviction must pass over it.
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(5, &mut buf).unwrap();
        cache.write(601, &filled(3)).unwrap();
        let map = cache.map.lock();
        assert!(map.slot_of(5).is_some());
        assert!(map.slot_of(600).is_some());
        assert!(map.slot_of(1).is_none());
    }

    #[test]
    fn prefetch_loads_in_background_drain() {
        let disk = RamDisk::new(256);
        disk.write_sector(42, &filled(0x42)).unwrap();
        let cache = BufferCache::new(disk);
        cache.prefetch(42);
        assert_eq!(cache.resident(), 0);
        assert_eq!(cache.drain_prefetch().unwrap(), 1);
        assert_eq!(cache.resident(), 1);
        let (hits_before, _) = cache.stats();
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(42, &mut buf).unwrap();
        assert_eq!(buf, filled(0x42));
        assert_eq!(cache.stats().0, hits_before + 1);
    }
}
