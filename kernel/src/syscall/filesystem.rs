//! Filesystem system calls.
//!
//! Bool-style calls (`create`, `remove`, `mkdir`, `chdir`, `symlink`)
//! report failure as 0 rather than killing the caller; only invalid user
//! memory is fatal. Byte-count calls return -1 on error.

use alloc::{sync::Arc, vec};

use crate::error::KernelResult;
use crate::fs::{FdObject, File, InodeKind};
use crate::kernel::Kernel;
use crate::mm::user;
use crate::process::{cwd_or_root, release_fd_object, Pcb};

fn path_arg(kernel: &Kernel, pcb: &Arc<Pcb>, ptr: usize) -> KernelResult<alloc::string::String> {
    user::read_cstring(&kernel.vm, &pcb.vm, ptr, pcb.user_esp())
}

pub fn sys_create(kernel: &Kernel, pcb: &Arc<Pcb>, path: usize, size: u32) -> KernelResult<i32> {
    let path = path_arg(kernel, pcb, path)?;
    let cwd = cwd_or_root(kernel, pcb);
    let ok = kernel.fs.create(&cwd, &path, size).is_ok();
    kernel.fs.close_inode(&cwd)?;
    Ok(ok as i32)
}

pub fn sys_remove(kernel: &Kernel, pcb: &Arc<Pcb>, path: usize) -> KernelResult<i32> {
    let path = path_arg(kernel, pcb, path)?;
    let cwd = cwd_or_root(kernel, pcb);
    let ok = kernel.fs.remove(&cwd, &path).is_ok();
    kernel.fs.close_inode(&cwd)?;
    Ok(ok as i32)
}

pub fn sys_open(kernel: &Kernel, pcb: &Arc<Pcb>, path: usize) -> KernelResult<i32> {
    let path = path_arg(kernel, pcb, path)?;
    let cwd = cwd_or_root(kernel, pcb);
    let opened = kernel.fs.open(&cwd, &path);
    kernel.fs.close_inode(&cwd)?;
    let Ok(inode) = opened else {
        return Ok(-1);
    };
    let obj = if inode.kind() == InodeKind::Dir {
        match crate::fs::dir::Dir::open(inode.clone()) {
            Ok(dir) => FdObject::Dir(Arc::new(crate::fs::DirCursor::new(dir))),
            Err(_) => {
                kernel.fs.close_inode(&inode)?;
                return Ok(-1);
            }
        }
    } else {
        match File::new(inode.clone()) {
            Ok(file) => FdObject::File(Arc::new(file)),
            Err(_) => {
                kernel.fs.close_inode(&inode)?;
                return Ok(-1);
            }
        }
    };
    match pcb.fds.lock().install(obj) {
        Ok(fd) => Ok(fd as i32),
        Err(_) => {
            kernel.fs.close_inode(&inode)?;
            Ok(-1)
        }
    }
}

pub fn sys_filesize(kernel: &Kernel, pcb: &Arc<Pcb>, fd: usize) -> KernelResult<i32> {
    let _ = kernel;
    let obj = pcb.fds.lock().get(fd);
    match obj {
        Ok(FdObject::File(file)) => Ok(file.size() as i32),
        _ => Ok(-1),
    }
}

pub fn sys_read(
    kernel: &Kernel,
    pcb: &Arc<Pcb>,
    fd: usize,
    buf: usize,
    size: usize,
) -> KernelResult<i32> {
    let obj = match pcb.fds.lock().get(fd) {
        Ok(obj) => obj,
        Err(_) => return Ok(-1),
    };
    match obj {
        // Console input is outside this core; reads return 0 bytes.
        FdObject::Console if fd == 0 => Ok(0),
        FdObject::File(file) => {
            let mut data = vec![0u8; size];
            match kernel.fs.read_file(&file, &mut data) {
                Ok(n) => {
                    user::copy_out(&kernel.vm, &pcb.vm, buf, &data[..n], pcb.user_esp())?;
                    Ok(n as i32)
                }
                Err(_) => Ok(-1),
            }
        }
        FdObject::PipeRead(reader) => {
            let mut data = vec![0u8; size];
            match reader.read(&mut data) {
                Ok(n) => {
                    user::copy_out(&kernel.vm, &pcb.vm, buf, &data[..n], pcb.user_esp())?;
                    Ok(n as i32)
                }
                Err(_) => Ok(-1),
            }
        }
        _ => Ok(-1),
    }
}

pub fn sys_write(
    kernel: &Kernel,
    pcb: &Arc<Pcb>,
    fd: usize,
    buf: usize,
    size: usize,
) -> KernelResult<i32> {
    let obj = match pcb.fds.lock().get(fd) {
        Ok(obj) => obj,
        Err(_) => return Ok(-1),
    };
    let data = user::copy_in(&kernel.vm, &pcb.vm, buf, size, pcb.user_esp())?;
    match obj {
        FdObject::Console => {
            if let Ok(text) = core::str::from_utf8(&data) {
                print!("{}", text);
            }
            Ok(size as i32)
        }
        FdObject::File(file) => match kernel.fs.write_file(&file, &data) {
            Ok(n) => Ok(n as i32),
            Err(_) => Ok(-1),
        },
        FdObject::PipeWrite(writer) => match writer.write(&data) {
            Ok(n) => Ok(n as i32),
            Err(_) => Ok(-1),
        },
        _ => Ok(-1),
    }
}

pub fn sys_seek(kernel: &Kernel, pcb: &Arc<Pcb>, fd: usize, pos: u32) -> KernelResult<i32> {
    let _ = kernel;
    if let Ok(FdObject::File(file)) = pcb.fds.lock().get(fd) {
        file.seek(pos);
        Ok(0)
    } else {
        Ok(-1)
    }
}

pub fn sys_tell(kernel: &Kernel, pcb: &Arc<Pcb>, fd: usize) -> KernelResult<i32> {
    let _ = kernel;
    if let Ok(FdObject::File(file)) = pcb.fds.lock().get(fd) {
        Ok(file.tell() as i32)
    } else {
        Ok(-1)
    }
}

pub fn sys_close(kernel: &Kernel, pcb: &Arc<Pcb>, fd: usize) -> KernelResult<i32> {
    let taken = pcb.fds.lock().take(fd);
    match taken {
        Ok(obj) => {
            release_fd_object(kernel, obj)?;
            Ok(0)
        }
        Err(_) => Ok(-1),
    }
}

pub fn sys_chdir(kernel: &Kernel, pcb: &Arc<Pcb>, path: usize) -> KernelResult<i32> {
    let path = path_arg(kernel, pcb, path)?;
    let cwd = cwd_or_root(kernel, pcb);
    let new_cwd = kernel.fs.chdir(&cwd, &path);
    kernel.fs.close_inode(&cwd)?;
    match new_cwd {
        Ok(inode) => {
            let old = pcb.cwd.lock().replace(inode);
            if let Some(old) = old {
                kernel.fs.close_inode(&old)?;
            }
            Ok(1)
        }
        Err(_) => Ok(0),
    }
}

pub fn sys_mkdir(kernel: &Kernel, pcb: &Arc<Pcb>, path: usize) -> KernelResult<i32> {
    let path = path_arg(kernel, pcb, path)?;
    let cwd = cwd_or_root(kernel, pcb);
    let ok = kernel.fs.mkdir(&cwd, &path).is_ok();
    kernel.fs.close_inode(&cwd)?;
    Ok(ok as i32)
}

pub fn sys_readdir(kernel: &Kernel, pcb: &Arc<Pcb>, fd: usize, name_buf: usize) -> KernelResult<i32> {
    let obj = match pcb.fds.lock().get(fd) {
        Ok(obj) => obj,
        Err(_) => return Ok(0),
    };
    match obj {
        FdObject::Dir(cursor) => match cursor.next_name(&kernel.fs.ctx) {
            Ok(Some(name)) => {
                let mut bytes = name.into_bytes();
                bytes.push(0);
                user::copy_out(&kernel.vm, &pcb.vm, name_buf, &bytes, pcb.user_esp())?;
                Ok(1)
            }
            _ => Ok(0),
        },
        _ => Ok(0),
    }
}

pub fn sys_isdir(kernel: &Kernel, pcb: &Arc<Pcb>, fd: usize) -> KernelResult<i32> {
    let _ = kernel;
    match pcb.fds.lock().get(fd) {
        Ok(FdObject::Dir(_)) => Ok(1),
        Ok(_) => Ok(0),
        Err(_) => Ok(-1),
    }
}

pub fn sys_inumber(kernel: &Kernel, pcb: &Arc<Pcb>, fd: usize) -> KernelResult<i32> {
    let _ = kernel;
    match pcb.fds.lock().get(fd) {
        Ok(FdObject::File(file)) => Ok(file.inode().sector() as i32),
        Ok(FdObject::Dir(dir)) => Ok(dir.inode().sector() as i32),
        _ => Ok(-1),
    }
}

pub fn sys_symlink(
    kernel: &Kernel,
    pcb: &Arc<Pcb>,
    target: usize,
    linkpath: usize,
) -> KernelResult<i32> {
    let target = path_arg(kernel, pcb, target)?;
    let linkpath = path_arg(kernel, pcb, linkpath)?;
    let cwd = cwd_or_root(kernel, pcb);
    let ok = kernel.fs.symlink(&cwd, &target, &linkpath).is_ok();
    kernel.fs.close_inode(&cwd)?;
    Ok(if ok { 0 } else { -1 })
}

pub fn sys_readlink(
    kernel: &Kernel,
    pcb: &Arc<Pcb>,
    path: usize,
    buf: usize,
    size: usize,
) -> KernelResult<i32> {
    let path = path_arg(kernel, pcb, path)?;
    let cwd = cwd_or_root(kernel, pcb);
    let target = kernel.fs.readlink(&cwd, &path);
    kernel.fs.close_inode(&cwd)?;
    match target {
        Ok(target) => {
            let bytes = target.as_bytes();
            let n = bytes.len().min(size);
            user::copy_out(&kernel.vm, &pcb.vm, buf, &bytes[..n], pcb.user_esp())?;
            Ok(n as i32)
        }
        Err(_) => Ok(-1),
    }
}
