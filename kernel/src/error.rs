//! Kernel error types.
//!
//! Structured error values used across the kernel in place of string
//! literals. Filesystem-visible conditions live in [`FsError`]; everything
//! else is a [`KernelError`] variant. System-call handlers translate these
//! into the `-1` convention user programs see.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Malformed argument from user space or an internal caller.
    BadArg { what: &'static str },

    /// Filesystem condition (name lookup, directory, descriptor state).
    Fs(FsError),

    /// Kernel page pool exhausted and no evictable frame was found.
    OutOfMemory,

    /// Swap region has no free slot.
    SwapFull,

    /// Write-ahead log region is full and cannot checkpoint here.
    LogFull,

    /// Block device I/O failure.
    Io { sector: u32 },

    /// A log record or on-disk structure failed validation.
    Corrupt { sector: u32 },

    /// A user-supplied pointer faulted; the process is terminated with -1.
    UserFault { addr: usize },

    /// The enclosing transaction was rolled back.
    Aborted { txn: u32 },

    /// Write on a pipe whose read end is closed.
    BrokenPipe,

    /// Called before the owning subsystem was initialized.
    NotInitialized { subsystem: &'static str },

    /// A fixed-size kernel table is full.
    LimitExceeded { resource: &'static str },
}

/// Filesystem-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File, directory, or inode not found.
    NotFound,
    /// Name collision on create.
    Exists,
    /// rmdir on a non-empty directory.
    NotEmpty,
    /// Directory where a regular file was expected.
    IsDir,
    /// Regular file where a directory was expected.
    NotDir,
    /// Closed or out-of-range file descriptor.
    BadFd,
    /// File is mapped as a running executable.
    DenyWrite,
    /// Free map exhausted.
    NoSpace,
    /// Path component exceeds the directory entry name field.
    NameTooLong,
    /// Symbolic link chase limit exceeded.
    LinkLoop,
    /// Operation on a directory whose inode has been removed.
    Removed,
    /// Empty or otherwise unusable path.
    BadPath,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadArg { what } => write!(f, "bad argument: {}", what),
            Self::Fs(e) => write!(f, "filesystem error: {:?}", e),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::SwapFull => write!(f, "swap region exhausted"),
            Self::LogFull => write!(f, "write-ahead log full"),
            Self::Io { sector } => write!(f, "I/O error at sector {}", sector),
            Self::Corrupt { sector } => write!(f, "corrupt data at sector {}", sector),
            Self::UserFault { addr } => write!(f, "user fault at {:#x}", addr),
            Self::Aborted { txn } => write!(f, "transaction {} aborted", txn),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::LimitExceeded { resource } => write!(f, "table full: {}", resource),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_error_converts() {
        fn open_missing() -> KernelResult<()> {
            Err(FsError::NotFound)?;
            Ok(())
        }
        assert_eq!(open_missing(), Err(KernelError::Fs(FsError::NotFound)));
    }

    #[test]
    fn display_is_stable() {
        use alloc::format;
        assert_eq!(
            format!("{}", KernelError::UserFault { addr: 0x1000 }),
            "user fault at 0x1000"
        );
    }
}
