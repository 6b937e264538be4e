//! FUSE handles layer - open files and directories
//!
//! Every successful open() or opendir() creates a handle, registered
//! under the number that's returned to the kernel. The handle owns
//! the underlying file descriptor or directory stream until
//! release() or releasedir() removes it from the registry.

use super::dirstream::{DirStream, RawEntry};
use super::error::FsError;
use nix::libc;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A file opened for reading.
///
/// The handle has no read position; all reads pass an offset.
#[derive(Debug)]
pub(crate) struct FileHandle {
    fd: OwnedFd,
}

impl FileHandle {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for FileHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Attributes sent along with a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryAttr {
    pub(crate) ino: u64,

    /// File mode; only the file type bits are set unless the entry
    /// was stat'ed.
    pub(crate) mode: u32,
}

impl EntryAttr {
    fn from_raw(entry: &RawEntry) -> Self {
        Self {
            ino: entry.ino,
            mode: (entry.d_type as u32) << 12,
        }
    }
}

/// Receives directory entries.
pub(crate) trait DirSink {
    /// Add an entry, to be followed by the entry at `next_offset`.
    ///
    /// Returns true if the sink is full. The entry was then not
    /// added and must be sent again in a later call.
    fn push(&mut self, name: &OsStr, attr: EntryAttr, next_offset: i64) -> bool;
}

/// An open directory, listed in possibly many readdir calls.
#[derive(Debug)]
pub(crate) struct DirHandle {
    stream: DirStream,

    /// Real path of the directory.
    path: PathBuf,

    /// Entry read from the stream but not yet accepted by a sink.
    pending: Option<RawEntry>,

    /// Last offset delivered to a sink.
    offset: i64,
}

impl DirHandle {
    pub(crate) fn new(stream: DirStream, path: PathBuf) -> Self {
        Self {
            stream,
            path,
            pending: None,
            offset: 0,
        }
    }

    /// Send entries, starting at `offset`, to `sink` until it's full
    /// or the directory has been listed completely.
    ///
    /// `offset` must be 0 or an offset previously passed to a sink
    /// by this handle. If `stat` is true, full metadata is sent for
    /// each entry, otherwise just its inode and type. Entries of
    /// unknown type are always stat'ed.
    pub(crate) fn fill(&mut self, offset: i64, stat: bool, sink: &mut impl DirSink) {
        if offset != self.offset {
            log::debug!(
                "readdir {}: seek from {} to {offset}",
                self.path.display(),
                self.offset
            );
            self.stream.seek(offset);
            self.pending = None;
            self.offset = offset;
        }

        loop {
            let entry = match self.pending.take() {
                Some(entry) => entry,
                None => match self.stream.next_entry() {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(errno) => {
                        log::debug!("readdir {}: {errno}", self.path.display());
                        break;
                    }
                },
            };
            let attr = if stat || entry.d_type == libc::DT_UNKNOWN {
                self.stat_entry(&entry)
            } else {
                EntryAttr::from_raw(&entry)
            };
            let next_offset = self.stream.tell();
            if sink.push(&entry.name, attr, next_offset) {
                self.pending = Some(entry);
                break;
            }
            self.offset = next_offset;
        }
    }

    /// Attributes of an entry from lstat, falling back to the raw
    /// entry if it's gone.
    fn stat_entry(&self, entry: &RawEntry) -> EntryAttr {
        match std::fs::symlink_metadata(self.path.join(&entry.name)) {
            Ok(m) => EntryAttr {
                ino: m.ino(),
                mode: m.mode(),
            },
            Err(err) => {
                log::debug!(
                    "readdir {}: stat {:?}: {err}",
                    self.path.display(),
                    entry.name
                );
                EntryAttr::from_raw(entry)
            }
        }
    }
}

/// Any open handle.
#[derive(Clone)]
pub(crate) enum Handle {
    File(Arc<FileHandle>),
    Dir(Arc<Mutex<DirHandle>>),
}

/// Keeps track of open handles.
pub(crate) struct HandleRegistry {
    by_fh: Mutex<BTreeMap<u64, Handle>>,
}

impl HandleRegistry {
    pub(crate) fn new() -> Self {
        Self {
            by_fh: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a handle and return its number.
    pub(crate) async fn add(&self, handle: Handle) -> u64 {
        let mut by_fh = self.by_fh.lock().await;
        let fh = by_fh.last_key_value().map(|(k, _)| *k + 1).unwrap_or(1);
        by_fh.insert(fh, handle);

        fh
    }

    pub(crate) async fn get(&self, fh: u64) -> Option<Handle> {
        self.by_fh.lock().await.get(&fh).cloned()
    }

    pub(crate) async fn file(&self, fh: u64) -> Result<Arc<FileHandle>, FsError> {
        match self.get(fh).await {
            Some(Handle::File(file)) => Ok(file),
            _ => Err(FsError::BadHandle(fh)),
        }
    }

    pub(crate) async fn dir(&self, fh: u64) -> Result<Arc<Mutex<DirHandle>>, FsError> {
        match self.get(fh).await {
            Some(Handle::Dir(dir)) => Ok(dir),
            _ => Err(FsError::BadHandle(fh)),
        }
    }

    /// Remove a handle from the registry.
    ///
    /// The underlying resource is released once in-flight operations
    /// on the handle are done with it.
    pub(crate) async fn remove(&self, fh: u64) -> Option<Handle> {
        self.by_fh.lock().await.remove(&fh)
    }

    pub(crate) async fn len(&self) -> usize {
        self.by_fh.lock().await.len()
    }
}

/// Access mode requested by open(2) flags.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    Invalid,
}

impl AccessMode {
    pub(crate) fn from_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => AccessMode::ReadOnly,
            libc::O_WRONLY => AccessMode::WriteOnly,
            libc::O_RDWR => AccessMode::ReadWrite,
            mode => {
                log::debug!("Invalid open flags: mode={mode:o} (all flags= 0x{flags:x})");

                AccessMode::Invalid
            }
        }
    }

    /// Fail unless this is read-only access, the only kind supported.
    pub(crate) fn check_read_only(&self) -> Result<(), FsError> {
        if *self != AccessMode::ReadOnly {
            return Err(FsError::AccessDenied);
        }

        Ok(())
    }
}
