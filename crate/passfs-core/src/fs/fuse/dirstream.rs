//! Owned directory stream with position support.
//!
//! Neither [std::fs::ReadDir] nor [nix::dir::Dir] expose
//! telldir/seekdir, which directory handles need to resume listings
//! at an offset previously given to the kernel.

use nix::errno::Errno;
use nix::libc;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;
use std::ptr::NonNull;

/// An entry, as returned by readdir(3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawEntry {
    pub(crate) name: OsString,
    pub(crate) ino: u64,

    /// Type tag (DT_*), DT_UNKNOWN if the filesystem doesn't report it.
    pub(crate) d_type: u8,
}

/// A directory stream opened with opendir(3), closed on drop.
#[derive(Debug)]
pub(crate) struct DirStream {
    dirp: NonNull<libc::DIR>,
}

// The stream is only ever accessed through &mut or while owned, so
// moving it between threads is fine.
unsafe impl Send for DirStream {}

impl DirStream {
    pub(crate) fn open(path: &Path) -> Result<Self, Errno> {
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;
        let dirp = unsafe { libc::opendir(cpath.as_ptr()) };

        NonNull::new(dirp)
            .map(|dirp| DirStream { dirp })
            .ok_or_else(Errno::last)
    }

    /// Read the next entry, advancing the stream.
    ///
    /// Returns None at the end of the directory.
    pub(crate) fn next_entry(&mut self) -> Result<Option<RawEntry>, Errno> {
        // readdir returns NULL both at the end and on error; only
        // errno tells them apart.
        Errno::clear();
        let dirent = unsafe { libc::readdir(self.dirp.as_ptr()) };
        if dirent.is_null() {
            return match Errno::last_raw() {
                0 => Ok(None),
                errno => Err(Errno::from_raw(errno)),
            };
        }

        // The dirent stays valid until the next call on the stream,
        // which can't happen while self is borrowed.
        let dirent = unsafe { &*dirent };
        let name = unsafe { CStr::from_ptr(dirent.d_name.as_ptr()) };

        Ok(Some(RawEntry {
            name: OsStr::from_bytes(name.to_bytes()).to_os_string(),
            ino: dirent.d_ino as u64,
            d_type: dirent.d_type,
        }))
    }

    /// Current position, as an opaque offset for [DirStream::seek].
    pub(crate) fn tell(&self) -> i64 {
        unsafe { libc::telldir(self.dirp.as_ptr()) as i64 }
    }

    /// Move to a position previously returned by [DirStream::tell].
    pub(crate) fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.dirp.as_ptr(), offset as libc::c_long) }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.dirp.as_ptr());
        }
    }
}
