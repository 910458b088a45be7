//! Virtual-memory scenarios: demand paging, eviction to swap, COW fork,
//! stack growth, and memory-mapped files, all over a RAM disk and the
//! simulated page directory.

use std::sync::Arc;

use ferrite_kernel::error::KernelError;
use ferrite_kernel::fs::{DiskLayout, FileSystem, RamDisk};
use ferrite_kernel::mm::{
    self, page_fault::FaultInfo, user, PageDir, ProcessVm, SimPageDir, Spe, SpeKind, SwapTable,
    Vm, PAGE_SIZE, STACK_MAX, STACK_TOP,
};

const DISK_SECTORS: u32 = 8192;
const SWAP_PAGES: u32 = 64;

fn fresh_vm(frames: usize) -> (Arc<Vm>, Arc<ProcessVm>) {
    let disk = RamDisk::new(DISK_SECTORS);
    let layout = DiskLayout::new(DISK_SECTORS, SWAP_PAGES).unwrap();
    let vm = Vm::new(frames, SwapTable::new(disk, &layout));
    let pvm = ProcessVm::new(1, SimPageDir::new());
    vm.register(pvm.clone());
    (vm, pvm)
}

fn zero_page(pvm: &Arc<ProcessVm>, upage: usize) {
    pvm.insert(
        upage,
        Spe {
            writable: true,
            kind: SpeKind::Zero,
        },
    )
    .unwrap();
}

fn page_pattern(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed))
        .collect()
}

#[test]
fn heavy_eviction_preserves_every_byte() {
    // 16 writable pages through a 4-frame pool: most pages round-trip
    // through swap at least once, and every byte must survive.
    let (vm, pvm) = fresh_vm(4);
    let base = 0x0010_0000;
    for i in 0..16 {
        zero_page(&pvm, base + i * PAGE_SIZE);
    }
    for i in 0..16 {
        let data = page_pattern(i as u8);
        user::copy_out(&vm, &pvm, base + i * PAGE_SIZE, &data, STACK_TOP).unwrap();
    }
    assert!(vm.frames.frame_count() <= 4);
    assert!(vm.swap.used_slots() > 0, "pressure must reach swap");
    for i in 0..16 {
        let back = user::copy_in(&vm, &pvm, base + i * PAGE_SIZE, PAGE_SIZE, STACK_TOP).unwrap();
        assert_eq!(back, page_pattern(i as u8), "page {}", i);
    }
    pvm.destroy(&vm);
    assert_eq!(vm.swap.used_slots(), 0);
    assert_eq!(vm.frames.frame_count(), 0);
}

#[test]
fn cow_fork_isolates_parent_writes_from_child() {
    // Scenario: parent fills 8 pages with P, forks, then overwrites half
    // with P'. The child must observe P everywhere; the parent sees P'
    // then P. A small pool keeps eviction in play throughout.
    let (vm, parent) = fresh_vm(12);
    let child = ProcessVm::new(2, SimPageDir::new());
    vm.register(child.clone());

    let base = 0x0020_0000;
    for i in 0..8 {
        zero_page(&parent, base + i * PAGE_SIZE);
        let data = page_pattern(i as u8);
        user::copy_out(&vm, &parent, base + i * PAGE_SIZE, &data, STACK_TOP).unwrap();
    }

    parent.clone_into(&vm, &child).unwrap();
    assert_eq!(child.page_count(), 8);

    // Parent breaks COW on the first four pages.
    for i in 0..4 {
        let data = page_pattern(0xA0 + i as u8);
        user::copy_out(&vm, &parent, base + i * PAGE_SIZE, &data, STACK_TOP).unwrap();
    }

    // Extra anonymous pages push sole-owned frames out to swap.
    for j in 0..4 {
        let upage = 0x0040_0000 + j * PAGE_SIZE;
        zero_page(&parent, upage);
        user::copy_out(&vm, &parent, upage, &page_pattern(0xF0 + j as u8), STACK_TOP).unwrap();
    }

    for i in 0..8 {
        let got = user::copy_in(&vm, &child, base + i * PAGE_SIZE, PAGE_SIZE, STACK_TOP).unwrap();
        assert_eq!(got, page_pattern(i as u8), "child page {}", i);
    }
    for i in 0..4 {
        let got = user::copy_in(&vm, &parent, base + i * PAGE_SIZE, PAGE_SIZE, STACK_TOP).unwrap();
        assert_eq!(got, page_pattern(0xA0 + i as u8), "parent page {}", i);
    }
    for i in 4..8 {
        let got = user::copy_in(&vm, &parent, base + i * PAGE_SIZE, PAGE_SIZE, STACK_TOP).unwrap();
        assert_eq!(got, page_pattern(i as u8), "parent page {}", i);
    }

    child.destroy(&vm);
    vm.unregister(2);
    parent.destroy(&vm);
    vm.unregister(1);
    assert_eq!(vm.frames.frame_count(), 0);
    assert_eq!(vm.swap.used_slots(), 0);
}

#[test]
fn fork_materializes_private_copies_of_swapped_pages() {
    // Push every parent page out to swap with a second process's working
    // set, then fork: each child page is a private resident copy while
    // the parent keeps its slots.
    let (vm, parent) = fresh_vm(4);
    let base = 0x0030_0000;
    for i in 0..3 {
        zero_page(&parent, base + i * PAGE_SIZE);
        user::copy_out(
            &vm,
            &parent,
            base + i * PAGE_SIZE,
            &page_pattern(i as u8),
            STACK_TOP,
        )
        .unwrap();
    }

    // Pressure process occupies the whole pool, evicting the parent.
    let squeezer = ProcessVm::new(9, SimPageDir::new());
    vm.register(squeezer.clone());
    for j in 0..4 {
        let upage = 0x0900_0000 + j * PAGE_SIZE;
        zero_page(&squeezer, upage);
        user::copy_out(&vm, &squeezer, upage, &[j as u8], STACK_TOP).unwrap();
    }
    for i in 0..3 {
        assert!(
            matches!(
                parent.find(base + i * PAGE_SIZE).map(|s| s.kind),
                Some(SpeKind::Swap { .. })
            ),
            "parent page {} should be swapped",
            i
        );
    }
    squeezer.destroy(&vm);
    vm.unregister(9);

    let slots_before = vm.swap.used_slots();
    let child = ProcessVm::new(2, SimPageDir::new());
    vm.register(child.clone());
    parent.clone_into(&vm, &child).unwrap();

    // Parent slots were read, not released.
    assert_eq!(vm.swap.used_slots(), slots_before);
    for i in 0..3 {
        let got = user::copy_in(&vm, &child, base + i * PAGE_SIZE, PAGE_SIZE, STACK_TOP).unwrap();
        assert_eq!(got, page_pattern(i as u8), "child page {}", i);
        let got = user::copy_in(&vm, &parent, base + i * PAGE_SIZE, PAGE_SIZE, STACK_TOP).unwrap();
        assert_eq!(got, page_pattern(i as u8), "parent page {}", i);
    }

    child.destroy(&vm);
    parent.destroy(&vm);
}

#[test]
fn stack_growth_window_is_enforced() {
    let (vm, pvm) = fresh_vm(8);
    let esp = STACK_TOP - 64;

    // Within 32 bytes below the stack pointer: granted.
    let addr = esp - 32;
    mm::handle_fault(
        &vm,
        &pvm,
        &FaultInfo {
            addr,
            write: true,
            esp,
        },
    )
    .unwrap();
    assert!(pvm.find(addr & !(PAGE_SIZE - 1)).is_some());

    // Far below the stack pointer: killed.
    let wild = STACK_TOP - 3 * PAGE_SIZE;
    assert!(matches!(
        mm::handle_fault(
            &vm,
            &pvm,
            &FaultInfo {
                addr: wild,
                write: true,
                esp,
            },
        ),
        Err(KernelError::UserFault { .. })
    ));

    // Below the 8 MiB stack ceiling: killed even if close to esp.
    let deep_esp = STACK_TOP - STACK_MAX - PAGE_SIZE;
    assert!(matches!(
        mm::handle_fault(
            &vm,
            &pvm,
            &FaultInfo {
                addr: deep_esp,
                write: true,
                esp: deep_esp,
            },
        ),
        Err(KernelError::UserFault { .. })
    ));
}

#[test]
fn write_to_readonly_page_is_fatal() {
    let (vm, pvm) = fresh_vm(4);
    let upage = 0x0050_0000;
    pvm.insert(
        upage,
        Spe {
            writable: false,
            kind: SpeKind::Zero,
        },
    )
    .unwrap();
    // Reads are fine.
    user::copy_in(&vm, &pvm, upage, 16, STACK_TOP).unwrap();
    // Writes kill.
    assert!(matches!(
        user::copy_out(&vm, &pvm, upage, &[1, 2, 3], STACK_TOP),
        Err(KernelError::UserFault { .. })
    ));
}

#[test]
fn mmap_modifications_persist_through_munmap() {
    let disk = RamDisk::new(DISK_SECTORS);
    let layout = DiskLayout::new(DISK_SECTORS, SWAP_PAGES).unwrap();
    let fs = FileSystem::format(disk.clone(), layout).unwrap();
    let vm = Vm::new(16, SwapTable::new(disk, &layout));
    let pvm = ProcessVm::new(1, SimPageDir::new());
    vm.register(pvm.clone());

    // A two-page file with known content.
    let root = fs.root().clone();
    fs.create(&root, "mapped", 0).unwrap();
    let file = fs.open_file(&root, "mapped").unwrap();
    let mut content = Vec::new();
    content.extend_from_slice(&page_pattern(1));
    content.extend_from_slice(&page_pattern(2));
    fs.write_file(&file, &content).unwrap();

    let base = 0x0060_0000;
    let backing = fs.backing_for(file.inode());
    let id = mm::mmap::mmap(&vm, &pvm, backing, 0, base, content.len(), true).unwrap();

    // Lazy load: the mapping reads the file content.
    let got = user::copy_in(&vm, &pvm, base, PAGE_SIZE, STACK_TOP).unwrap();
    assert_eq!(got, page_pattern(1));

    // Modify the second page through the mapping, then unmap.
    let update = page_pattern(0xEE);
    user::copy_out(&vm, &pvm, base + PAGE_SIZE, &update, STACK_TOP).unwrap();
    mm::mmap::munmap(&vm, &pvm, id).unwrap();
    assert_eq!(pvm.page_count(), 0);

    // The file now carries the modification.
    file.seek(PAGE_SIZE as u32);
    let mut back = vec![0u8; PAGE_SIZE];
    assert_eq!(fs.read_file(&file, &mut back).unwrap(), PAGE_SIZE);
    assert_eq!(back, update);
    fs.close_inode(file.inode()).unwrap();
}

#[test]
fn mmap_rejects_bad_ranges() {
    let disk = RamDisk::new(DISK_SECTORS);
    let layout = DiskLayout::new(DISK_SECTORS, SWAP_PAGES).unwrap();
    let fs = FileSystem::format(disk.clone(), layout).unwrap();
    let vm = Vm::new(16, SwapTable::new(disk, &layout));
    let pvm = ProcessVm::new(1, SimPageDir::new());
    vm.register(pvm.clone());

    let root = fs.root().clone();
    fs.create(&root, "f", 0).unwrap();
    let file = fs.open_file(&root, "f").unwrap();
    fs.write_file(&file, &[7u8; 100]).unwrap();

    // Unaligned base.
    assert!(mm::mmap::mmap(
        &vm,
        &pvm,
        fs.backing_for(file.inode()),
        0,
        0x0060_0010,
        100,
        true
    )
    .is_err());
    // Zero base.
    assert!(
        mm::mmap::mmap(&vm, &pvm, fs.backing_for(file.inode()), 0, 0, 100, true).is_err()
    );
    // Stack collision.
    assert!(mm::mmap::mmap(
        &vm,
        &pvm,
        fs.backing_for(file.inode()),
        0,
        STACK_TOP - PAGE_SIZE,
        100,
        true
    )
    .is_err());
    // Overlap with an existing page.
    zero_page(&pvm, 0x0070_0000);
    assert!(mm::mmap::mmap(
        &vm,
        &pvm,
        fs.backing_for(file.inode()),
        0,
        0x0070_0000,
        100,
        true
    )
    .is_err());
    fs.close_inode(file.inode()).unwrap();
}

#[test]
fn accessed_bits_give_second_chances_during_eviction() {
    // With a 2-frame pool and three pages, the page touched most recently
    // should tend to stay resident: after touching A, loading C must not
    // evict A when B's accessed bit is already clear.
    let (vm, pvm) = fresh_vm(2);
    let a = 0x0080_0000;
    let b = a + PAGE_SIZE;
    let c = a + 2 * PAGE_SIZE;
    for page in [a, b, c] {
        zero_page(&pvm, page);
    }
    user::copy_out(&vm, &pvm, a, &[1], STACK_TOP).unwrap();
    user::copy_out(&vm, &pvm, b, &[2], STACK_TOP).unwrap();
    // Touch A again so its accessed bit is freshly set, then fault C in.
    user::copy_out(&vm, &pvm, a, &[3], STACK_TOP).unwrap();
    // Clear B's accessed bit as the clock would after one pass.
    pvm.pagedir.clear_accessed(b);
    user::copy_out(&vm, &pvm, c, &[4], STACK_TOP).unwrap();

    // A must still be resident; B went to swap.
    assert!(pvm.pagedir.mapping(a).is_some());
    assert!(matches!(
        pvm.find(b).map(|s| s.kind),
        Some(SpeKind::Swap { .. })
    ));
}
