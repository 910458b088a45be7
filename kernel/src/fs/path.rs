//! Path resolution.
//!
//! Absolute paths walk from the root inode, relative paths from the
//! process working directory. Empty components are ignored, `.` and `..`
//! resolve through the structural directory entries, and symbolic links
//! restart resolution with the link target, bounded by a finite chase
//! limit so cycles fail instead of looping.
//!
//! The walk is hand-over-hand: the next component's inode reference is
//! taken before the previous one is released.

use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use super::{
    dir::Dir,
    inode::{Inode, InodeKind, InodeManager},
    FsContext,
};
use crate::error::{FsError, KernelError, KernelResult};

/// Symbolic links followed before resolution fails.
pub const SYMLINK_CHASE_MAX: usize = 8;

/// Everything resolution needs, bundled to keep signatures sane.
pub struct Resolver<'a> {
    pub ctx: &'a FsContext,
    pub inodes: &'a InodeManager,
    pub root: &'a Arc<Inode>,
}

impl<'a> Resolver<'a> {
    /// Resolve a path to an inode, following symlinks everywhere
    /// (including the final component when `follow_final` is set).
    pub fn resolve(
        &self,
        cwd: &Arc<Inode>,
        path: &str,
        follow_final: bool,
    ) -> KernelResult<Arc<Inode>> {
        let mut chase = 0;
        let mut path = path.to_string();
        'restart: loop {
            let (dir, last) = self.walk_to_parent(cwd, &path, &mut chase)?;
            let Some(last) = last else {
                // Path named the starting directory itself ("/", ".", "").
                return Ok(dir.into_inode());
            };
            let sector = match dir.lookup(self.ctx, &last) {
                Ok(Some(s)) => s,
                Ok(None) => {
                    self.inodes.close(self.ctx, &dir.into_inode())?;
                    return Err(KernelError::Fs(FsError::NotFound));
                }
                Err(e) => {
                    self.inodes.close(self.ctx, &dir.into_inode())?;
                    return Err(e);
                }
            };
            let inode = self.inodes.open(self.ctx, sector)?;
            self.inodes.close(self.ctx, &dir.into_inode())?;
            if follow_final && inode.kind() == InodeKind::Symlink {
                chase += 1;
                if chase >= SYMLINK_CHASE_MAX {
                    self.inodes.close(self.ctx, &inode)?;
                    return Err(KernelError::Fs(FsError::NotFound));
                }
                let target = read_link_target(self.ctx, &inode)?;
                self.inodes.close(self.ctx, &inode)?;
                // Relative targets resolve from the link's directory.
                path = if target.starts_with('/') {
                    target
                } else {
                    let mut joined = parent_prefix(&path);
                    joined.push_str(&target);
                    joined
                };
                continue 'restart;
            }
            return Ok(inode);
        }
    }

    /// Resolve the parent directory of `path` and return it with the final
    /// component. A `None` component means the path named the start itself.
    pub fn resolve_parent(
        &self,
        cwd: &Arc<Inode>,
        path: &str,
    ) -> KernelResult<(Dir, Option<String>)> {
        let mut chase = 0;
        self.walk_to_parent(cwd, path, &mut chase)
    }

    fn walk_to_parent(
        &self,
        cwd: &Arc<Inode>,
        path: &str,
        chase: &mut usize,
    ) -> KernelResult<(Dir, Option<String>)> {
        let start = if path.starts_with('/') {
            self.root
        } else {
            cwd
        };
        if start.is_removed() {
            return Err(KernelError::Fs(FsError::Removed));
        }
        if start.kind() != InodeKind::Dir {
            return Err(KernelError::Fs(FsError::NotDir));
        }
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut current = Dir::open(self.inodes.reopen(start))?;
        if components.is_empty() {
            return Ok((current, None));
        }
        for (i, component) in components.iter().enumerate() {
            let is_last = i == components.len() - 1;
            if is_last {
                return Ok((current, Some((*component).to_string())));
            }
            let sector = match current.lookup(self.ctx, component)? {
                Some(s) => s,
                None => {
                    self.inodes.close(self.ctx, &current.into_inode())?;
                    return Err(KernelError::Fs(FsError::NotFound));
                }
            };
            // Hand-over-hand: take the child reference before dropping the
            // parent's.
            let next = self.inodes.open(self.ctx, sector)?;
            let next = if next.kind() == InodeKind::Symlink {
                *chase += 1;
                if *chase >= SYMLINK_CHASE_MAX {
                    self.inodes.close(self.ctx, &next)?;
                    self.inodes.close(self.ctx, current.inode())?;
                    return Err(KernelError::Fs(FsError::NotFound));
                }
                let target = read_link_target(self.ctx, &next)?;
                self.inodes.close(self.ctx, &next)?;
                let resolved = if target.starts_with('/') {
                    self.resolve(self.root, &target, true)?
                } else {
                    self.resolve(current.inode(), &target, true)?
                };
                resolved
            } else {
                next
            };
            if next.kind() != InodeKind::Dir {
                self.inodes.close(self.ctx, &next)?;
                self.inodes.close(self.ctx, &current.into_inode())?;
                return Err(KernelError::Fs(FsError::NotDir));
            }
            self.inodes.close(self.ctx, current.inode())?;
            current = Dir::open(next)?;
        }
        unreachable!("loop returns on the last component");
    }
}

/// Read a symlink inode's target path.
pub fn read_link_target(ctx: &FsContext, inode: &Arc<Inode>) -> KernelResult<String> {
    let len = inode.length() as usize;
    let mut buf = alloc::vec![0u8; len];
    let n = inode.read_at(ctx, &mut buf, 0)?;
    buf.truncate(n);
    String::from_utf8(buf).map_err(|_| KernelError::Corrupt {
        sector: inode.sector(),
    })
}

/// Everything up to and including the final `/` of `path` ("" when none).
fn parent_prefix(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => path[..=i].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_prefix_splits() {
        assert_eq!(parent_prefix("a/b/c"), "a/b/");
        assert_eq!(parent_prefix("/x"), "/");
        assert_eq!(parent_prefix("plain"), "");
    }
}
