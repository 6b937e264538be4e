//! FUSE interface layer - protocol handling and mount management
//!
//! This module contains the external interface for mounting the
//! passthrough filesystem and the dispatch of fuser callbacks to the
//! operations layer.

use super::handles::{DirSink, EntryAttr};
use super::inodes::Inode;
use super::operations::{InnerPassFs, file_type};
use crate::config::MountConfig;
use fuser::MountOption;
use nix::libc;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

const TTL: Duration = Duration::ZERO;

/// Mount the target directory of `config` as FUSE filesystem at the
/// given mountpoint.
///
/// Must be called from within a tokio runtime, which then runs the
/// filesystem operations.
pub fn export(
    config: Arc<MountConfig>,
    mountpoint: &std::path::Path,
) -> anyhow::Result<FuseHandle> {
    let options = mount_options(&config);
    let fs = PassFs {
        handle: Handle::current(),
        inner: Arc::new(InnerPassFs::new(config)),
    };
    let bgsession = fuser::spawn_mount2(fs, mountpoint, &options)?;

    Ok(FuseHandle { inner: bgsession })
}

fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::RO,
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
        MountOption::NoDev,
        MountOption::NoSuid,
        MountOption::FSName(config.name().to_string()),
        MountOption::Subtype("passfs".to_string()),
    ];
    if config.allow_other() {
        options.push(MountOption::AllowOther);
    }

    options
}

/// Handle that must be kept as long as the filesystem must
/// remain mounted.
///
/// To unmount the filesystem, call join() on the handle.
pub struct FuseHandle {
    inner: fuser::BackgroundSession,
}

impl FuseHandle {
    /// Unmount the filesystem and wait for the fuse run loop to stop.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        let Self { inner } = self;
        tokio::task::spawn_blocking(move || inner.join()).await
    }

    /// Unmount the filesystem and wait for the fuse run loop to stop.
    pub fn join_blocking(self) {
        self.inner.join();
    }
}

struct PassFs {
    /// Handle on the main tokio runtime (multithreaded)
    handle: Handle,

    inner: Arc<InnerPassFs>,
}

// Code in this impl runs on a thread started by fuser. Use
// Handle::spawn to run async code. The reply is moved into the spawned
// task and filled in there.
impl fuser::Filesystem for PassFs {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        log::info!(
            "Serving {} read-only",
            self.inner.config().target().display()
        );

        Ok(())
    }

    fn destroy(&mut self) {
        log::debug!("Filesystem unmounted");
    }

    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();

        self.handle.spawn(async move {
            match inner.lookup(Inode(parent), &name).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(attr) => reply.entry(&TTL, &attr, 0),
            }
        });
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.getattr_inode(Inode(ino)).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(attr) => reply.attr(&TTL, &attr),
            }
        });
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.open_inode(Inode(ino), flags).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok((fh, flags)) => reply.opened(fh, flags),
            }
        });
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.read(fh, offset, size).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(data) => reply.data(&data),
            }
        });
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.release(fh).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(()) => reply.ok(),
            }
        });
    }

    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.opendir_inode(Inode(ino), flags).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(fh) => reply.opened(fh, 0),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        reply: fuser::ReplyDirectory,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            let dir = match inner.readdir(fh).await {
                Err(err) => return reply.error(err.log_and_convert()),
                Ok(dir) => dir,
            };
            // If the listing fails, the reply is dropped and fuser
            // answers EIO.
            match dir.fill(offset, reply).await {
                Err(err) => log::warn!("readdir FH#{fh}: {err}"),
                Ok(reply) => reply.ok(),
            }
        });
    }

    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.release(fh).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(()) => reply.ok(),
            }
        });
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.statfs().await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(stat) => reply.statfs(
                    stat.blocks() as u64,
                    stat.blocks_free() as u64,
                    stat.blocks_available() as u64,
                    stat.files() as u64,
                    stat.files_free() as u64,
                    stat.block_size() as u32,
                    stat.name_max() as u32,
                    stat.fragment_size() as u32,
                ),
            }
        });
    }
}

impl DirSink for fuser::ReplyDirectory {
    fn push(&mut self, name: &OsStr, attr: EntryAttr, next_offset: i64) -> bool {
        self.add(attr.ino, next_offset, file_type(attr.mode), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use assert_fs::TempDir;
    use assert_fs::prelude::*;
    use std::os::unix::fs::MetadataExt as _;
    use std::path::Path;
    use std::time::Instant;

    fn mount_config(allow_other: bool) -> anyhow::Result<MountConfig> {
        Ok(MountConfig::new(
            Path::new("/"),
            &Config {
                target: Some("/srv/data".into()),
                name: "data".to_string(),
                allow_other,
                ..Config::default()
            },
        )?)
    }

    #[test]
    fn read_only_mount_options() -> anyhow::Result<()> {
        let options = mount_options(&mount_config(false)?);
        assert!(options.contains(&MountOption::RO));
        assert!(options.contains(&MountOption::FSName("data".to_string())));
        assert!(options.contains(&MountOption::Subtype("passfs".to_string())));
        assert!(!options.contains(&MountOption::AllowOther));

        let options = mount_options(&mount_config(true)?);
        assert!(options.contains(&MountOption::AllowOther));

        Ok(())
    }

    struct FuseFixture {
        tempdir: TempDir,
        fuse: Option<FuseHandle>,
    }

    impl FuseFixture {
        async fn setup() -> anyhow::Result<Self> {
            let _ = env_logger::try_init();
            let tempdir = TempDir::new()?;
            let target = tempdir.child("target");
            target.create_dir_all()?;
            target.child("notes.txt").write_str("hi\n")?;
            target.child("sub/inner.txt").write_str("inner")?;

            let mountpoint = tempdir.child("mnt");
            mountpoint.create_dir_all()?;
            let dev = std::fs::metadata(mountpoint.path())?.dev();

            let config = MountConfig::new(
                tempdir.path(),
                &Config {
                    target: Some(target.to_path_buf()),
                    ..Config::default()
                },
            )?;
            let fuse = export(Arc::new(config), mountpoint.path())?;

            // Wait for the mount to be visible.
            let start = Instant::now();
            while std::fs::metadata(mountpoint.path())?.dev() == dev {
                if start.elapsed() > Duration::from_secs(5) {
                    anyhow::bail!("{} never mounted", mountpoint.display());
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            Ok(Self {
                tempdir,
                fuse: Some(fuse),
            })
        }

        fn mountpoint(&self) -> std::path::PathBuf {
            self.tempdir.path().join("mnt")
        }
    }

    impl Drop for FuseFixture {
        fn drop(&mut self) {
            if let Some(fuse) = self.fuse.take() {
                fuse.join_blocking();
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    #[test_tag::tag(fuse)]
    #[ignore = "requires a usable /dev/fuse"]
    async fn list_and_read_through_mount() -> anyhow::Result<()> {
        let fixture = FuseFixture::setup().await?;
        let mountpoint = fixture.mountpoint();

        let mut names = vec![];
        let mut entries = tokio::fs::read_dir(&mountpoint).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_unordered::assert_eq_unordered!(
            vec!["notes.txt".to_string(), "sub".to_string()],
            names
        );

        assert_eq!(
            "hi\n",
            tokio::fs::read_to_string(mountpoint.join("notes.txt")).await?
        );
        assert_eq!(
            "inner",
            tokio::fs::read_to_string(mountpoint.join("sub/inner.txt")).await?
        );
        assert!(tokio::fs::metadata(mountpoint.join("sub")).await?.is_dir());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[test_tag::tag(fuse)]
    #[ignore = "requires a usable /dev/fuse"]
    async fn mount_is_read_only() -> anyhow::Result<()> {
        let fixture = FuseFixture::setup().await?;
        let mountpoint = fixture.mountpoint();

        assert!(
            tokio::fs::write(mountpoint.join("notes.txt"), "changed")
                .await
                .is_err()
        );
        assert!(
            tokio::fs::write(mountpoint.join("new.txt"), "new")
                .await
                .is_err()
        );
        fixture
            .tempdir
            .child("target/notes.txt")
            .assert("hi\n");

        Ok(())
    }
}
