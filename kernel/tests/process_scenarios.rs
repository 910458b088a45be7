//! Process-model scenarios: exec with lazy segments, fork isolation,
//! wait semantics, and the system-call surface driven through validated
//! user memory.

use std::sync::Arc;

use ferrite_kernel::error::{FsError, KernelError};
use ferrite_kernel::kernel::Kernel;
use ferrite_kernel::mm::{user, Spe, SpeKind, PAGE_SIZE, STACK_TOP};
use ferrite_kernel::process::{self, Pcb, IMAGE_MAGIC};
use ferrite_kernel::syscall::{self, Syscall, SyscallFrame};

fn boot() -> Kernel {
    Kernel::test_instance(20480, 64, 256).unwrap()
}

fn init_process(kernel: &Kernel, name: &str) -> Arc<Pcb> {
    let pcb = kernel.spawn_process(name).unwrap();
    kernel.adopt_current_thread(&pcb);
    pcb
}

/// Write a minimal executable: header plus one segment whose payload
/// starts at file offset 512.
fn write_program(kernel: &Kernel, name: &str, entry: usize, upage: usize, payload: &[u8]) {
    let root = kernel.fs.root().clone();
    kernel.fs.create(&root, name, 0).unwrap();
    let file = kernel.fs.open_file(&root, name).unwrap();

    let mut image = Vec::new();
    image.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
    image.extend_from_slice(&(entry as u32).to_le_bytes());
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(&(upage as u32).to_le_bytes());
    image.extend_from_slice(&512u32.to_le_bytes());
    image.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    image.extend_from_slice(&((PAGE_SIZE - payload.len()) as u32).to_le_bytes());
    image.extend_from_slice(&1u32.to_le_bytes());
    image.resize(512, 0);
    image.extend_from_slice(payload);

    assert_eq!(kernel.fs.write_file(&file, &image).unwrap(), image.len());
    kernel.fs.close_inode(file.inode()).unwrap();
}

#[test]
fn exec_loads_segments_lazily_and_seeds_the_stack() {
    let kernel = boot();
    let pcb = init_process(&kernel, "init");
    let seg_base = 0x0800_0000;
    write_program(&kernel, "prog", 0x0804_8000, seg_base, b"hello segment");

    let entry = process::exec(
        &kernel,
        &pcb,
        "prog",
        &["prog".to_string(), "arg1".to_string()],
    )
    .unwrap();
    assert_eq!(entry, 0x0804_8000);

    // The segment loads on first touch, straight from the file.
    let got = user::copy_in(&kernel.vm, &pcb.vm, seg_base, 13, pcb.user_esp()).unwrap();
    assert_eq!(got, b"hello segment");
    // The zero tail of the page really is zero.
    let tail = user::copy_in(&kernel.vm, &pcb.vm, seg_base + 13, 16, pcb.user_esp()).unwrap();
    assert!(tail.iter().all(|b| *b == 0));

    // Conventional stack layout: fake return address, argc, argv.
    let esp = pcb.user_esp();
    assert_eq!(esp % 4, 0);
    let argc = user::read_u32(&kernel.vm, &pcb.vm, esp + 4, esp).unwrap();
    assert_eq!(argc, 2);
    let argv = user::read_u32(&kernel.vm, &pcb.vm, esp + 8, esp).unwrap() as usize;
    let argv0 = user::read_u32(&kernel.vm, &pcb.vm, argv, esp).unwrap() as usize;
    let name = user::read_cstring(&kernel.vm, &pcb.vm, argv0, esp).unwrap();
    assert_eq!(name, "prog");

    // The running executable denies writes.
    let root = kernel.fs.root().clone();
    let file = kernel.fs.open_file(&root, "prog").unwrap();
    assert_eq!(
        kernel.fs.write_file(&file, b"clobber"),
        Err(KernelError::Fs(FsError::DenyWrite))
    );
    kernel.fs.close_inode(file.inode()).unwrap();
}

#[test]
fn exec_rejects_garbage_images() {
    let kernel = boot();
    let pcb = init_process(&kernel, "init");
    let root = kernel.fs.root().clone();
    kernel.fs.create(&root, "junk", 0).unwrap();
    let file = kernel.fs.open_file(&root, "junk").unwrap();
    kernel.fs.write_file(&file, b"not an image at all").unwrap();
    kernel.fs.close_inode(file.inode()).unwrap();

    assert!(process::exec(&kernel, &pcb, "junk", &["junk".to_string()]).is_err());
    // The failed exec released its write denial.
    let file = kernel.fs.open_file(&root, "junk").unwrap();
    assert!(kernel.fs.write_file(&file, b"fine now").is_ok());
    kernel.fs.close_inode(file.inode()).unwrap();
}

#[test]
fn fork_isolates_memory_and_wait_reaps_exactly_once() {
    let kernel = boot();
    let parent = init_process(&kernel, "parent");

    // Parent-owned page with a known pattern.
    let page = 0x0200_0000;
    parent
        .vm
        .insert(
            page,
            Spe {
                writable: true,
                kind: SpeKind::Zero,
            },
        )
        .unwrap();
    user::copy_out(&kernel.vm, &parent.vm, page, b"original", STACK_TOP).unwrap();

    let child = process::fork(&kernel, &parent).unwrap();
    assert_eq!(kernel.procs.count(), 2);

    // Parent diverges; the child's view must not move.
    user::copy_out(&kernel.vm, &parent.vm, page, b"PARENT!!", STACK_TOP).unwrap();
    let child_view = user::copy_in(&kernel.vm, &child.vm, page, 8, STACK_TOP).unwrap();
    assert_eq!(child_view, b"original");
    let parent_view = user::copy_in(&kernel.vm, &parent.vm, page, 8, STACK_TOP).unwrap();
    assert_eq!(parent_view, b"PARENT!!");

    // Child exits; the parent reaps its status exactly once.
    process::exit(&kernel, &child, 42).unwrap();
    assert_eq!(kernel.procs.count(), 1);
    assert_eq!(process::wait(&kernel, &parent, child.pid).unwrap(), 42);
    assert!(process::wait(&kernel, &parent, child.pid).is_err());
}

#[test]
fn fork_reopens_files_with_independent_positions() {
    let kernel = boot();
    let parent = init_process(&kernel, "parent");
    let root = kernel.fs.root().clone();
    kernel.fs.create(&root, "shared", 0).unwrap();
    let file = kernel.fs.open_file(&root, "shared").unwrap();
    kernel.fs.write_file(&file, b"0123456789").unwrap();
    file.seek(4);
    let fd = {
        let mut fds = parent.fds.lock();
        fds.install(ferrite_kernel::fs::FdObject::File(Arc::new(file)))
            .unwrap()
    };

    let child = process::fork(&kernel, &parent).unwrap();
    let child_file = match child.fds.lock().get(fd).unwrap() {
        ferrite_kernel::fs::FdObject::File(f) => f,
        _ => panic!("fd class changed across fork"),
    };
    // Same starting position, independent afterward.
    assert_eq!(child_file.tell(), 4);
    child_file.seek(0);
    let parent_file = match parent.fds.lock().get(fd).unwrap() {
        ferrite_kernel::fs::FdObject::File(f) => f,
        _ => panic!("parent fd missing"),
    };
    assert_eq!(parent_file.tell(), 4);
    process::exit(&kernel, &child, 0).unwrap();
    let _ = process::wait(&kernel, &parent, child.pid);
}

/// Helper: build the on-stack argument block for one syscall.
fn push_syscall(kernel: &Kernel, pcb: &Arc<Pcb>, usp: usize, nr: Syscall, args: &[u32]) {
    user::write_u32(&kernel.vm, &pcb.vm, usp, nr as u32, usp).unwrap();
    for (i, arg) in args.iter().enumerate() {
        user::write_u32(&kernel.vm, &pcb.vm, usp + 4 * (i + 1), *arg, usp).unwrap();
    }
}

fn call(kernel: &Kernel, pcb: &Arc<Pcb>, usp: usize, nr: Syscall, args: &[u32]) -> i32 {
    push_syscall(kernel, pcb, usp, nr, args);
    let mut frame = SyscallFrame { usp, retval: 0 };
    syscall::dispatch(kernel, &mut frame);
    frame.retval
}

#[test]
fn syscalls_round_trip_files_through_validated_user_memory() {
    let kernel = boot();
    let pcb = init_process(&kernel, "user");
    // Hand-built user stack page.
    pcb.vm
        .insert(
            STACK_TOP - PAGE_SIZE,
            Spe {
                writable: true,
                kind: SpeKind::Zero,
            },
        )
        .unwrap();
    let usp = STACK_TOP - 512;
    let path_ptr = (STACK_TOP - 64) as u32;
    let buf_ptr = (STACK_TOP - 128) as u32;
    let buf2_ptr = (STACK_TOP - 192) as u32;
    user::copy_out(&kernel.vm, &pcb.vm, path_ptr as usize, b"data\0", usp).unwrap();
    user::copy_out(&kernel.vm, &pcb.vm, buf_ptr as usize, b"payload!", usp).unwrap();

    assert_eq!(call(&kernel, &pcb, usp, Syscall::Create, &[path_ptr, 0]), 1);
    // Creating the same name again collides.
    assert_eq!(call(&kernel, &pcb, usp, Syscall::Create, &[path_ptr, 0]), 0);

    let fd = call(&kernel, &pcb, usp, Syscall::Open, &[path_ptr]);
    assert!(fd >= 3, "console owns fds 0-2, got {}", fd);
    let fd = fd as u32;

    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::Write, &[fd, buf_ptr, 8]),
        8
    );
    assert_eq!(call(&kernel, &pcb, usp, Syscall::Filesize, &[fd]), 8);
    assert_eq!(call(&kernel, &pcb, usp, Syscall::Tell, &[fd]), 8);
    assert_eq!(call(&kernel, &pcb, usp, Syscall::Seek, &[fd, 0]), 0);
    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::Read, &[fd, buf2_ptr, 8]),
        8
    );
    let read_back = user::copy_in(&kernel.vm, &pcb.vm, buf2_ptr as usize, 8, usp).unwrap();
    assert_eq!(read_back, b"payload!");
    assert_eq!(call(&kernel, &pcb, usp, Syscall::Isdir, &[fd]), 0);
    assert_eq!(call(&kernel, &pcb, usp, Syscall::Close, &[fd]), 0);
    assert_eq!(call(&kernel, &pcb, usp, Syscall::Close, &[fd]), -1);

    // Directory surface: open "/", list it, check its inode number.
    let slash_ptr = (STACK_TOP - 224) as u32;
    user::copy_out(&kernel.vm, &pcb.vm, slash_ptr as usize, b"/\0", usp).unwrap();
    let dir_fd = call(&kernel, &pcb, usp, Syscall::Open, &[slash_ptr]) as u32;
    assert_eq!(call(&kernel, &pcb, usp, Syscall::Isdir, &[dir_fd]), 1);
    assert_eq!(call(&kernel, &pcb, usp, Syscall::Inumber, &[dir_fd]), 1);
    let name_ptr = (STACK_TOP - 256) as u32;
    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::Readdir, &[dir_fd, name_ptr]),
        1
    );
    let name = user::read_cstring(&kernel.vm, &pcb.vm, name_ptr as usize, usp).unwrap();
    assert_eq!(name, "data");
    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::Readdir, &[dir_fd, name_ptr]),
        0
    );
}

#[test]
fn pipe_syscall_moves_bytes_between_descriptors() {
    let kernel = boot();
    let pcb = init_process(&kernel, "piper");
    pcb.vm
        .insert(
            STACK_TOP - PAGE_SIZE,
            Spe {
                writable: true,
                kind: SpeKind::Zero,
            },
        )
        .unwrap();
    let usp = STACK_TOP - 512;
    let fds_ptr = (STACK_TOP - 64) as u32;
    let msg_ptr = (STACK_TOP - 128) as u32;
    let out_ptr = (STACK_TOP - 192) as u32;
    user::copy_out(&kernel.vm, &pcb.vm, msg_ptr as usize, b"plumbing", usp).unwrap();

    assert_eq!(call(&kernel, &pcb, usp, Syscall::Pipe, &[fds_ptr]), 0);
    let read_fd = user::read_u32(&kernel.vm, &pcb.vm, fds_ptr as usize, usp).unwrap();
    let write_fd = user::read_u32(&kernel.vm, &pcb.vm, fds_ptr as usize + 4, usp).unwrap();

    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::Write, &[write_fd, msg_ptr, 8]),
        8
    );
    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::Read, &[read_fd, out_ptr, 8]),
        8
    );
    let got = user::copy_in(&kernel.vm, &pcb.vm, out_ptr as usize, 8, usp).unwrap();
    assert_eq!(got, b"plumbing");
}

#[test]
fn user_sync_objects_follow_small_id_indexing() {
    let kernel = boot();
    let pcb = init_process(&kernel, "locker");
    pcb.vm
        .insert(
            STACK_TOP - PAGE_SIZE,
            Spe {
                writable: true,
                kind: SpeKind::Zero,
            },
        )
        .unwrap();
    let usp = STACK_TOP - 512;

    let lock_id = call(&kernel, &pcb, usp, Syscall::LockInit, &[]);
    assert!(lock_id > 0);
    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::LockAcquire, &[lock_id as u32]),
        0
    );
    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::LockRelease, &[lock_id as u32]),
        0
    );
    // Releasing a lock we do not hold fails.
    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::LockRelease, &[lock_id as u32]),
        -1
    );

    let sema_id = call(&kernel, &pcb, usp, Syscall::SemaInit, &[2]);
    assert!(sema_id > lock_id);
    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::SemaDown, &[sema_id as u32]),
        0
    );
    assert_eq!(
        call(&kernel, &pcb, usp, Syscall::SemaUp, &[sema_id as u32]),
        0
    );
    // Unknown ids are rejected.
    assert_eq!(call(&kernel, &pcb, usp, Syscall::SemaDown, &[999]), -1);
}

#[test]
fn bad_user_pointer_kills_the_process_with_minus_one() {
    let kernel = boot();
    let pcb = init_process(&kernel, "victim");
    let pid = pcb.pid;
    // The "stack pointer" points at unmapped memory far from the stack
    // region, so even reading the call number faults.
    let mut frame = SyscallFrame {
        usp: 0x1000,
        retval: 0,
    };
    syscall::dispatch(&kernel, &mut frame);
    assert_eq!(frame.retval, process::KILLED_EXIT_CODE);
    assert!(kernel.procs.get(pid).is_none(), "process must be reaped");
}
