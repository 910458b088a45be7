//! End-to-end filesystem scenarios over a RAM disk.

use std::sync::Arc;

use ferrite_kernel::error::{FsError, KernelError};
use ferrite_kernel::fs::{DiskLayout, FileSystem, InodeKind, RamDisk, WAL_SECTORS};

const DISK_SECTORS: u32 = 20480; // 10 MiB
const SWAP_PAGES: u32 = 16;

fn fresh_fs() -> (Arc<RamDisk>, FileSystem) {
    let disk = RamDisk::new(DISK_SECTORS);
    let layout = DiskLayout::new(DISK_SECTORS, SWAP_PAGES).unwrap();
    let fs = FileSystem::format(disk.clone(), layout).unwrap();
    (disk, fs)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[test]
fn write_read_round_trips_across_sizes() {
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    // 100_000 bytes reaches the doubly-indirect level (direct + indirect
    // cover 71,680 bytes).
    for (i, size) in [1usize, 511, 512, 4096, 65536, 100_000].iter().enumerate() {
        let name = format!("f{}", i);
        fs.create(&root, &name, 0).unwrap();
        let file = fs.open_file(&root, &name).unwrap();
        let data = pattern(*size, i as u8);
        assert_eq!(fs.write_file(&file, &data).unwrap(), *size);
        file.seek(0);
        let mut back = vec![0u8; *size];
        assert_eq!(fs.read_file(&file, &mut back).unwrap(), *size);
        assert_eq!(back, data, "size {}", size);
        fs.close_inode(file.inode()).unwrap();
    }
}

#[test]
fn create_close_reopen_preserves_content() {
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    fs.create(&root, "keep", 0).unwrap();
    let file = fs.open_file(&root, "keep").unwrap();
    let data = pattern(3000, 9);
    fs.write_file(&file, &data).unwrap();
    fs.close_inode(file.inode()).unwrap();
    drop(file);

    let again = fs.open_file(&root, "keep").unwrap();
    let mut back = vec![0u8; 3000];
    assert_eq!(fs.read_file(&again, &mut back).unwrap(), 3000);
    assert_eq!(back, data);
    fs.close_inode(again.inode()).unwrap();
}

#[test]
fn read_past_eof_returns_zero_bytes() {
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    fs.create(&root, "short", 0).unwrap();
    let file = fs.open_file(&root, "short").unwrap();
    fs.write_file(&file, b"abc").unwrap();
    file.seek(100);
    let mut buf = [0u8; 8];
    assert_eq!(fs.read_file(&file, &mut buf).unwrap(), 0);
    fs.close_inode(file.inode()).unwrap();
}

#[test]
fn sparse_file_reads_zeros_and_allocates_minimally() {
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    let used_before = fs.ctx.freemap.used_count();

    fs.create(&root, "sparse", 0).unwrap();
    let file = fs.open_file(&root, "sparse").unwrap();
    file.seek(1_000_000);
    assert_eq!(fs.write_file(&file, b"X").unwrap(), 1);
    assert_eq!(file.size(), 1_000_001);

    file.seek(500_000);
    let mut buf = [0xFFu8; 1];
    assert_eq!(fs.read_file(&file, &mut buf).unwrap(), 1);
    assert_eq!(buf[0], 0);

    file.seek(1_000_000);
    let mut tail = [0u8; 1];
    assert_eq!(fs.read_file(&file, &mut tail).unwrap(), 1);
    assert_eq!(&tail, b"X");

    // Only the inode, the pointer blocks on the path to the single data
    // sector, and the data sector itself were allocated.
    let used_after = fs.ctx.freemap.used_count();
    assert!(
        used_after - used_before <= 4,
        "sparse write allocated {} sectors",
        used_after - used_before
    );
    fs.close_inode(file.inode()).unwrap();
}

#[test]
fn seek_past_eof_write_zero_fills_the_gap() {
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    fs.create(&root, "gap", 0).unwrap();
    let file = fs.open_file(&root, "gap").unwrap();
    fs.write_file(&file, b"head").unwrap();
    file.seek(600);
    fs.write_file(&file, b"tail").unwrap();
    assert_eq!(file.size(), 604);
    // Bytes in the gap (same sector as "head") read back as zeros.
    file.seek(4);
    let mut gap = [0xAAu8; 4];
    fs.read_file(&file, &mut gap).unwrap();
    assert_eq!(gap, [0, 0, 0, 0]);
    fs.close_inode(file.inode()).unwrap();
}

#[test]
fn unclean_shutdown_triggers_recovery_and_preserves_committed_state() {
    let disk = RamDisk::new(DISK_SECTORS);
    let layout = DiskLayout::new(DISK_SECTORS, SWAP_PAGES).unwrap();
    {
        let fs = FileSystem::format(disk.clone(), layout).unwrap();
        let root = fs.root().clone();
        fs.create(&root, "durable", 0).unwrap();
        let file = fs.open_file(&root, "durable").unwrap();
        fs.write_file(&file, b"committed").unwrap();
        fs.close_inode(file.inode()).unwrap();
        // Push cached data to the device, then "crash" without unmount:
        // the WAL metadata still says dirty.
        fs.flush().unwrap();
    }

    let fs = FileSystem::mount(disk, layout).unwrap();
    assert!(fs.recovery.is_some(), "dirty mount must run recovery");
    let root = fs.root().clone();
    let file = fs.open_file(&root, "durable").unwrap();
    let mut buf = [0u8; 9];
    assert_eq!(fs.read_file(&file, &mut buf).unwrap(), 9);
    assert_eq!(&buf, b"committed");
    fs.close_inode(file.inode()).unwrap();
}

#[test]
fn clean_unmount_skips_recovery() {
    let disk = RamDisk::new(DISK_SECTORS);
    let layout = DiskLayout::new(DISK_SECTORS, SWAP_PAGES).unwrap();
    {
        let fs = FileSystem::format(disk.clone(), layout).unwrap();
        let root = fs.root().clone();
        fs.create(&root, "f", 0).unwrap();
        fs.unmount().unwrap();
    }
    let fs = FileSystem::mount(disk, layout).unwrap();
    assert!(fs.recovery.is_none());
    let root = fs.root().clone();
    let inode = fs.open(&root, "f").unwrap();
    assert_eq!(inode.kind(), InodeKind::File);
    fs.close_inode(&inode).unwrap();
}

#[test]
fn many_metadata_ops_survive_via_deferred_checkpoints() {
    // Scenario F: small metadata operations fill the log past 75%; the
    // deferred checkpoint keeps appends succeeding indefinitely.
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    for i in 0..200 {
        let name = format!("n{}", i);
        fs.create(&root, &name, 0).unwrap();
    }
    assert!(fs.ctx.wal.occupancy() < WAL_SECTORS as u64);
    // And the volume still mounts cleanly afterward.
    fs.unmount().unwrap();
}

#[test]
fn eviction_pressure_from_many_files_preserves_contents() {
    // Scenario C at the filesystem level: far more dirty sectors than the
    // 64-slot cache, then verify every byte.
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    let mut handles = Vec::new();
    for i in 0..40 {
        let name = format!("big{}", i);
        fs.create(&root, &name, 0).unwrap();
        let file = fs.open_file(&root, &name).unwrap();
        fs.write_file(&file, &pattern(2048, i as u8)).unwrap();
        handles.push(file);
    }
    for (i, file) in handles.iter().enumerate() {
        file.seek(0);
        let mut back = vec![0u8; 2048];
        assert_eq!(fs.read_file(file, &mut back).unwrap(), 2048);
        assert_eq!(back, pattern(2048, i as u8), "file {}", i);
    }
    for file in &handles {
        fs.close_inode(file.inode()).unwrap();
    }
}

#[test]
fn directories_nest_list_and_refuse_nonempty_removal() {
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    fs.mkdir(&root, "a").unwrap();
    fs.mkdir(&root, "a/b").unwrap();
    fs.create(&root, "a/b/file", 0).unwrap();

    let cursor = fs.open_dir(&root, "a/b").unwrap();
    assert_eq!(cursor.next_name(&fs.ctx).unwrap(), Some("file".into()));
    assert_eq!(cursor.next_name(&fs.ctx).unwrap(), None);
    fs.close_inode(cursor.inode()).unwrap();

    assert_eq!(
        fs.remove(&root, "a"),
        Err(KernelError::Fs(FsError::NotEmpty))
    );
    assert_eq!(
        fs.remove(&root, "a/b"),
        Err(KernelError::Fs(FsError::NotEmpty))
    );
    fs.remove(&root, "a/b/file").unwrap();
    fs.remove(&root, "a/b").unwrap();
    fs.remove(&root, "a").unwrap();
    assert!(matches!(
        fs.open(&root, "a"),
        Err(KernelError::Fs(FsError::NotFound))
    ));
}

#[test]
fn relative_paths_resolve_through_cwd_and_dots() {
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    fs.mkdir(&root, "home").unwrap();
    fs.create(&root, "home/notes", 0).unwrap();

    let cwd = fs.chdir(&root, "home").unwrap();
    let inode = fs.open(&cwd, "notes").unwrap();
    assert_eq!(inode.kind(), InodeKind::File);
    fs.close_inode(&inode).unwrap();

    // `..` climbs back to the root; empty components are ignored.
    let inode = fs.open(&cwd, ".././/home//notes").unwrap();
    fs.close_inode(&inode).unwrap();
    fs.close_inode(&cwd).unwrap();
}

#[test]
fn removing_the_cwd_fails_later_operations_on_it() {
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    fs.mkdir(&root, "gone").unwrap();
    let cwd = fs.chdir(&root, "gone").unwrap();
    fs.remove(&root, "gone").unwrap();
    assert_eq!(
        fs.create(&cwd, "orphan", 0),
        Err(KernelError::Fs(FsError::Removed))
    );
    fs.close_inode(&cwd).unwrap();
}

#[test]
fn removed_open_file_stays_readable_until_last_close() {
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    fs.create(&root, "ghost", 0).unwrap();
    let file = fs.open_file(&root, "ghost").unwrap();
    fs.write_file(&file, b"boo").unwrap();

    let used_with_file = fs.ctx.freemap.used_count();
    fs.remove(&root, "ghost").unwrap();

    // Name is gone, handle still works.
    assert!(fs.open(&root, "ghost").is_err());
    file.seek(0);
    let mut buf = [0u8; 3];
    assert_eq!(fs.read_file(&file, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"boo");

    // Last close reclaims the inode and data sectors.
    fs.close_inode(file.inode()).unwrap();
    assert!(fs.ctx.freemap.used_count() < used_with_file);
}

#[test]
fn symlinks_resolve_and_cycles_fail() {
    let (_disk, fs) = fresh_fs();
    let root = fs.root().clone();
    fs.create(&root, "target", 0).unwrap();
    let file = fs.open_file(&root, "target").unwrap();
    fs.write_file(&file, b"through the link").unwrap();
    fs.close_inode(file.inode()).unwrap();

    fs.symlink(&root, "target", "link").unwrap();
    assert_eq!(fs.readlink(&root, "link").unwrap(), "target");

    let via = fs.open_file(&root, "link").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read_file(&via, &mut buf).unwrap(), 16);
    assert_eq!(&buf, b"through the link");
    fs.close_inode(via.inode()).unwrap();

    // A two-link cycle terminates with NotFound instead of looping.
    fs.symlink(&root, "loop2", "loop1").unwrap();
    fs.symlink(&root, "loop1", "loop2").unwrap();
    assert!(matches!(
        fs.open(&root, "loop1"),
        Err(KernelError::Fs(FsError::NotFound))
    ));
}

#[test]
fn wal_write_barrier_precedes_cache_writeback() {
    // The write-ahead rule: once metadata ops are in flight, any dirty
    // sector leaving the cache must be preceded by the log records that
    // describe it. Observable effect: after a flush with no commit, a
    // remount (recovery) rolls the uncommitted creation back.
    let disk = RamDisk::new(DISK_SECTORS);
    let layout = DiskLayout::new(DISK_SECTORS, SWAP_PAGES).unwrap();
    let before_used;
    {
        let fs = FileSystem::format(disk.clone(), layout).unwrap();
        before_used = fs.ctx.freemap.used_count();
        let root = fs.root().clone();
        // A committed create, then flush; then crash.
        fs.create(&root, "present", 0).unwrap();
        fs.flush().unwrap();
    }
    let fs = FileSystem::mount(disk.clone(), layout).unwrap();
    let report = fs.recovery.expect("recovery ran");
    assert_eq!(report.rolled_back, 0);
    assert!(report.committed >= 1);
    let root = fs.root().clone();
    let inode = fs.open(&root, "present").unwrap();
    fs.close_inode(&inode).unwrap();
    assert_eq!(fs.ctx.freemap.used_count(), before_used + 1);
}
