//! FUSE operations layer - what each filesystem operation does
//!
//! Operations work on virtual paths, which are resolved to real paths
//! under the target directory before the real filesystem is touched.

use super::dirstream::DirStream;
use super::error::FsError;
use super::handles::{AccessMode, DirHandle, DirSink, FileHandle, Handle, HandleRegistry};
use super::inodes::{Inode, InodeTable};
use crate::config::MountConfig;
use crate::fs::path::VirtualPath;
use fuser::FileType;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::stat::Mode;
use nix::sys::statvfs::Statvfs;
use std::ffi::OsStr;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

pub(crate) struct InnerPassFs {
    config: Arc<MountConfig>,
    inodes: InodeTable,
    handles: HandleRegistry,
}

impl InnerPassFs {
    pub(crate) fn new(config: Arc<MountConfig>) -> Self {
        Self {
            config,
            inodes: InodeTable::new(),
            handles: HandleRegistry::new(),
        }
    }

    pub(crate) fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Look up `name` in the directory `parent`.
    ///
    /// The returned attributes carry the inode assigned to the entry.
    pub(crate) async fn lookup(
        &self,
        parent: Inode,
        name: &OsStr,
    ) -> Result<fuser::FileAttr, FsError> {
        let path = self.inodes.path(parent).await?.join(name)?;
        let mut attr = self.getattr(&path).await?;
        attr.ino = self.inodes.assign(&path).await.as_u64();

        Ok(attr)
    }

    /// Attributes of an inode returned by [InnerPassFs::lookup].
    pub(crate) async fn getattr_inode(&self, ino: Inode) -> Result<fuser::FileAttr, FsError> {
        let path = self.inodes.path(ino).await?;
        let mut attr = self.getattr(&path).await?;
        attr.ino = ino.as_u64();

        Ok(attr)
    }

    pub(crate) async fn opendir_inode(&self, ino: Inode, flags: i32) -> Result<u64, FsError> {
        let path = self.inodes.path(ino).await?;

        self.opendir(&path, flags).await
    }

    pub(crate) async fn open_inode(&self, ino: Inode, flags: i32) -> Result<(u64, u32), FsError> {
        let path = self.inodes.path(ino).await?;

        self.open(&path, flags).await
    }

    /// Attributes of a file or directory.
    ///
    /// The root always exists; everything else has the attributes of
    /// the real file, including its real inode number.
    pub(crate) async fn getattr(&self, path: &VirtualPath) -> Result<fuser::FileAttr, FsError> {
        if path.is_root() {
            return Ok(root_attr());
        }
        let realpath = self.config.resolve(path);
        match tokio::fs::metadata(&realpath).await {
            Ok(m) => Ok(metadata_to_attr(&m)),
            Err(err) if is_missing(&err) => Err(FsError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Open a directory for listing, returning its handle.
    pub(crate) async fn opendir(&self, path: &VirtualPath, flags: i32) -> Result<u64, FsError> {
        let realpath = self.existing_realpath(path).await?;
        AccessMode::from_flags(flags).check_read_only()?;

        let stream = tokio::task::spawn_blocking({
            let realpath = realpath.clone();

            move || DirStream::open(&realpath)
        })
        .await??;
        let fh = self
            .handles
            .add(Handle::Dir(Arc::new(Mutex::new(DirHandle::new(
                stream, realpath,
            )))))
            .await;
        log::debug!("Opened directory {path} as FH#{fh}");

        Ok(fh)
    }

    /// Look up an open directory, to be listed with [DirReader::fill].
    pub(crate) async fn readdir(&self, fh: u64) -> Result<DirReader, FsError> {
        Ok(DirReader {
            dir: self.handles.dir(fh).await?,
            stat: self.config.readdir_stat(),
        })
    }

    /// Open a file for reading, returning its handle and FOPEN_* flags.
    pub(crate) async fn open(
        &self,
        path: &VirtualPath,
        flags: i32,
    ) -> Result<(u64, u32), FsError> {
        let realpath = self.existing_realpath(path).await?;
        AccessMode::from_flags(flags).check_read_only()?;

        let fd = tokio::task::spawn_blocking(move || {
            nix::fcntl::open(&realpath, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        })
        .await??;
        let fh = self
            .handles
            .add(Handle::File(Arc::new(FileHandle::new(fd))))
            .await;
        log::debug!("Opened file {path} as FH#{fh}");

        let open_flags = if self.config.kernel_cache() {
            fuser::consts::FOPEN_KEEP_CACHE
        } else {
            0
        };

        Ok((fh, open_flags))
    }

    /// Read up to `size` bytes at `offset`.
    ///
    /// Returns less than `size` bytes only at the end of the file.
    pub(crate) async fn read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, FsError> {
        let file = self.handles.file(fh).await?;
        if offset < 0 {
            return Err(FsError::InvalidOffset(offset));
        }

        let data = tokio::task::spawn_blocking(move || {
            read_at(file.as_fd(), offset as libc::off_t, size as usize)
        })
        .await??;

        Ok(data)
    }

    /// Close a file or directory handle.
    pub(crate) async fn release(&self, fh: u64) -> Result<(), FsError> {
        if self.handles.remove(fh).await.is_some() {
            log::debug!(
                "Released FH#{fh}, {} handle(s) still open",
                self.handles.len().await
            );
        }

        Ok(())
    }

    /// Filesystem statistics of the target directory.
    pub(crate) async fn statfs(&self) -> Result<Statvfs, FsError> {
        let target = self.config.target().to_path_buf();

        Ok(tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&target)).await??)
    }

    /// Resolve `path` and make sure it exists.
    async fn existing_realpath(&self, path: &VirtualPath) -> Result<PathBuf, FsError> {
        let realpath = self.config.resolve(path);
        match tokio::fs::try_exists(&realpath).await {
            Ok(true) => Ok(realpath),
            Ok(false) => Err(FsError::NotFound),
            Err(err) if is_missing(&err) => Err(FsError::NotFound),
            Err(err) => Err(err.into()),
        }
    }
}

/// An open directory, as returned by [InnerPassFs::readdir].
pub(crate) struct DirReader {
    dir: Arc<Mutex<DirHandle>>,
    stat: bool,
}

impl DirReader {
    /// Send the entries of the directory to `sink`, starting at
    /// `offset`, then give the sink back.
    ///
    /// Stops early when the sink is full, at the end of the directory
    /// or if the directory can't be read. Concurrent calls on the same
    /// handle run one after the other.
    pub(crate) async fn fill<S>(self, offset: i64, mut sink: S) -> Result<S, FsError>
    where
        S: DirSink + Send + 'static,
    {
        let mut dir = self.dir.lock_owned().await;
        let stat = self.stat;

        Ok(tokio::task::spawn_blocking(move || {
            dir.fill(offset, stat, &mut sink);

            sink
        })
        .await?)
    }
}

/// True if `err` means that there is nothing at the path, including
/// when one of its parents is not a directory.
fn is_missing(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

/// Positional read that only stops short at the end of the file.
fn read_at(fd: BorrowedFd<'_>, offset: libc::off_t, size: usize) -> Result<Vec<u8>, Errno> {
    let mut buffer = vec![0; size];
    let mut filled = 0;
    while filled < size {
        match nix::sys::uio::pread(fd, &mut buffer[filled..], offset + filled as libc::off_t) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(Errno::EINTR) => continue,
            Err(_) if filled > 0 => break,
            Err(errno) => return Err(errno),
        }
    }
    buffer.truncate(filled);

    Ok(buffer)
}

/// Attributes of the root of the mount, which doesn't depend on the
/// target directory.
fn root_attr() -> fuser::FileAttr {
    fuser::FileAttr {
        ino: Inode::ROOT.as_u64(),
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        rdev: 0,
        blksize: 512,
        flags: 0, // macOS only
    }
}

/// Build a FileAttr from the metadata of a real file.
pub(crate) fn metadata_to_attr(m: &std::fs::Metadata) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: m.ino(),
        size: m.size(),
        blocks: m.blocks(),
        atime: m.accessed().unwrap_or(UNIX_EPOCH),
        mtime: m.modified().unwrap_or(UNIX_EPOCH),
        ctime: unix_time(m.ctime(), m.ctime_nsec()),
        crtime: m.created().unwrap_or(UNIX_EPOCH),
        kind: file_type(m.mode()),
        perm: (m.mode() & 0o7777) as u16,
        nlink: m.nlink() as u32,
        uid: m.uid(),
        gid: m.gid(),
        rdev: m.rdev() as u32,
        blksize: m.blksize() as u32,
        flags: 0, // macOS only
    }
}

/// File type from the S_IFMT bits of a mode.
///
/// Unknown types are reported as regular files.
pub(crate) fn file_type(mode: u32) -> FileType {
    match (mode as libc::mode_t) & libc::S_IFMT {
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = Duration::from_nanos(nsecs as u64);
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nsecs
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nsecs
    }
}
