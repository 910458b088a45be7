//! Hardware page-directory implementation.
//!
//! Implements the [`PageDir`] contract over real x86_64 page tables using
//! the bootloader's physical-memory window. Frame ids are resolved to
//! physical addresses through the frame table's page allocations, which
//! live in the identity-mapped kernel heap.

use alloc::{collections::BTreeMap, sync::Arc};

use spin::Mutex;
use x86_64::{
    registers::control::Cr3,
    structures::paging::{
        FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
        Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::mm::{FrameId, Mapping, PageDir, PAGE_SIZE};

/// Offset of the physical-memory window the bootloader mapped for us.
static PHYS_OFFSET: Mutex<u64> = Mutex::new(0);

/// Record the physical memory offset from the boot info.
pub fn set_phys_offset(offset: u64) {
    *PHYS_OFFSET.lock() = offset;
}

fn phys_offset() -> u64 {
    *PHYS_OFFSET.lock()
}

/// Allocates page-table frames from the kernel heap (page-aligned).
struct TableFrameAllocator;

// SAFETY: frames come from page-aligned heap allocations that are never
// freed while the page table lives, and the heap is identity-reachable
// through the physical window.
unsafe impl FrameAllocator<Size4KiB> for TableFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let layout =
            core::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("static layout");
        // SAFETY: non-zero, valid layout.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        let phys = ptr as u64 - phys_offset();
        Some(PhysFrame::containing_address(PhysAddr::new(phys)))
    }
}

/// A hardware page directory: one level-4 table per process.
pub struct X86PageDir {
    root: Mutex<&'static mut PageTable>,
    /// frame id -> (physical address, writable) as installed.
    installed: Mutex<BTreeMap<usize, (FrameId, bool)>>,
}

impl X86PageDir {
    /// Build a fresh address space sharing the kernel's higher half.
    pub fn new() -> Arc<Self> {
        let layout =
            core::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("static layout");
        // SAFETY: valid layout; the table is leaked into the page-dir.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) } as *mut PageTable;
        // SAFETY: freshly zeroed, exclusively owned allocation.
        let table = unsafe { &mut *ptr };
        // Copy the kernel half from the active tables so kernel code and
        // data stay mapped in every address space.
        // SAFETY: CR3 points at a live level-4 table in the physical
        // window for the duration of this copy.
        unsafe {
            let (frame, _) = Cr3::read();
            let active = &*((frame.start_address().as_u64() + phys_offset()) as *const PageTable);
            for i in 256..512 {
                table[i] = active[i].clone();
            }
        }
        Arc::new(Self {
            root: Mutex::new(table),
            installed: Mutex::new(BTreeMap::new()),
        })
    }

    fn mapper(root: &mut PageTable) -> OffsetPageTable<'_> {
        // SAFETY: the physical window covers all frames the tables name.
        unsafe { OffsetPageTable::new(root, VirtAddr::new(phys_offset())) }
    }

    fn frame_phys(frame: FrameId) -> Option<PhysAddr> {
        let kernel = crate::kernel::global()?;
        let ptr = kernel
            .vm
            .frames
            .with_pinned_slice(frame, |bytes| bytes.as_ptr() as u64)
            .ok()?;
        Some(PhysAddr::new(ptr - phys_offset()))
    }
}

impl PageDir for X86PageDir {
    fn map(&self, upage: usize, frame: FrameId, writable: bool) {
        let Some(phys) = Self::frame_phys(frame) else {
            return;
        };
        let mut root = self.root.lock();
        let mut mapper = Self::mapper(&mut root);
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(upage as u64));
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        let _ = mapper.unmap(page);
        // SAFETY: the frame is owned by the frame table and mapped at most
        // once per address space; flags keep user/kernel separation.
        if let Ok(flush) = unsafe {
            mapper.map_to(
                page,
                PhysFrame::containing_address(phys),
                flags,
                &mut TableFrameAllocator,
            )
        } {
            flush.flush();
            self.installed.lock().insert(upage, (frame, writable));
        }
    }

    fn unmap(&self, upage: usize) {
        let mut root = self.root.lock();
        let mut mapper = Self::mapper(&mut root);
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(upage as u64));
        if let Ok((_, flush)) = mapper.unmap(page) {
            flush.flush();
        }
        self.installed.lock().remove(&upage);
    }

    fn mapping(&self, upage: usize) -> Option<Mapping> {
        self.installed
            .lock()
            .get(&upage)
            .map(|(frame, writable)| Mapping {
                frame: *frame,
                writable: *writable,
            })
    }

    fn set_writable(&self, upage: usize, writable: bool) {
        let mut root = self.root.lock();
        let mut mapper = Self::mapper(&mut root);
        let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(upage as u64));
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        // SAFETY: only permission bits change; the translation stays.
        if let Ok(flush) = unsafe { mapper.update_flags(page, flags) } {
            flush.flush();
        }
        if let Some(entry) = self.installed.lock().get_mut(&upage) {
            entry.1 = writable;
        }
    }

    fn clear_accessed(&self, upage: usize) -> bool {
        self.page_flag_swap(upage, PageTableFlags::ACCESSED)
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.page_flags(upage)
            .map(|f| f.contains(PageTableFlags::DIRTY))
            .unwrap_or(false)
    }

    fn clear_dirty(&self, upage: usize) {
        self.page_flag_swap(upage, PageTableFlags::DIRTY);
    }

    fn mark_access(&self, _upage: usize, _write: bool) {
        // The MMU sets accessed/dirty bits itself.
    }

    fn flush_tlb(&self, upage: usize) {
        x86_64::instructions::tlb::flush(VirtAddr::new(upage as u64));
    }

    fn activate(&self) {
        let root = self.root.lock();
        let phys = (*root as *const PageTable) as u64 - phys_offset();
        // SAFETY: the table was built by X86PageDir::new with the kernel
        // half shared from the boot tables.
        unsafe {
            Cr3::write(
                PhysFrame::containing_address(PhysAddr::new(phys)),
                Cr3::read().1,
            )
        };
    }
}

impl X86PageDir {
    fn page_flags(&self, upage: usize) -> Option<PageTableFlags> {
        use x86_64::structures::paging::mapper::TranslateResult;
        use x86_64::structures::paging::Translate;
        let mut root = self.root.lock();
        let mapper = Self::mapper(&mut root);
        match mapper.translate(VirtAddr::new(upage as u64)) {
            TranslateResult::Mapped { flags, .. } => Some(flags),
            _ => None,
        }
    }

    /// Clear `bit` in the PTE, returning whether it was set.
    fn page_flag_swap(&self, upage: usize, bit: PageTableFlags) -> bool {
        let Some(flags) = self.page_flags(upage) else {
            return false;
        };
        let was_set = flags.contains(bit);
        if was_set {
            let mut root = self.root.lock();
            let mut mapper = Self::mapper(&mut root);
            let page: Page<Size4KiB> = Page::containing_address(VirtAddr::new(upage as u64));
            // SAFETY: clearing a status bit leaves the translation valid.
            if let Ok(flush) = unsafe { mapper.update_flags(page, flags - bit) } {
                flush.flush();
            }
        }
        was_set
    }
}
