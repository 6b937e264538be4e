//! Errors reported by filesystem operations and their errno mapping.

use crate::fs::path::PathError;
use nix::libc::{self, c_int};

/// Error of a filesystem operation, converted to an errno before
/// being returned to fuser.
#[derive(Debug, thiserror::Error)]
pub(crate) enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("only read-only access is supported")]
    AccessDenied,

    #[error("unknown handle FH#{0}")]
    BadHandle(u64),

    #[error("unknown inode {0}")]
    UnknownInode(u64),

    #[error("invalid offset {0}")]
    InvalidOffset(i64),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("errno {0}")]
    Errno(c_int),

    #[error("tokio runtime error {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FsError {
    /// Return the libc error code to report for this error.
    pub(crate) fn errno(&self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AccessDenied => libc::EACCES,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::UnknownInode(_) => libc::ENOENT,
            FsError::InvalidOffset(_) => libc::EINVAL,
            FsError::Path(_) => libc::EINVAL,
            FsError::Io(err) => err.raw_os_error().unwrap_or_else(|| io_errno(err.kind())),
            FsError::Errno(errno) => *errno,
            FsError::Join(_) => libc::EIO,
        }
    }

    /// Convert into a libc error code, for fuser.
    pub(crate) fn log_and_convert(self) -> c_int {
        let errno = self.errno();

        log::debug!("FUSE operation error: {self:?} -> {errno}");

        errno
    }
}

impl From<nix::errno::Errno> for FsError {
    fn from(value: nix::errno::Errno) -> Self {
        FsError::Errno(value as c_int)
    }
}

/// Errno for I/O errors that don't carry an OS error code.
fn io_errno(kind: std::io::ErrorKind) -> c_int {
    use std::io::ErrorKind;

    match kind {
        ErrorKind::NotFound => libc::ENOENT,
        ErrorKind::PermissionDenied => libc::EACCES,
        ErrorKind::NotADirectory => libc::ENOTDIR,
        ErrorKind::IsADirectory => libc::EISDIR,
        ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::InvalidFilename => {
            libc::EINVAL
        }
        ErrorKind::StaleNetworkFileHandle => libc::ESTALE,
        ErrorKind::TimedOut => libc::ETIMEDOUT,
        ErrorKind::Interrupted => libc::EINTR,
        ErrorKind::WouldBlock => libc::EAGAIN,
        ErrorKind::Unsupported => libc::ENOSYS,
        ErrorKind::OutOfMemory => libc::ENOMEM,
        _ => libc::EIO,
    }
}
