//! Mapping between FUSE inode numbers and virtual paths.

use super::error::FsError;
use crate::fs::path::VirtualPath;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Inode number, as known to the kernel.
///
/// These are allocated by [InodeTable]; they're not the inode
/// numbers of the real files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Inode(pub u64);

impl Inode {
    /// The root of the mount.
    pub(crate) const ROOT: Inode = Inode(fuser::FUSE_ROOT_ID);

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Assigns inodes to virtual paths.
///
/// A path keeps its inode for as long as the filesystem is mounted.
pub(crate) struct InodeTable {
    state: Mutex<InodeTableState>,
}

struct InodeTableState {
    by_inode: HashMap<Inode, VirtualPath>,
    by_path: HashMap<VirtualPath, Inode>,
    next: u64,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        let root = VirtualPath::root();
        Self {
            state: Mutex::new(InodeTableState {
                by_inode: HashMap::from([(Inode::ROOT, root.clone())]),
                by_path: HashMap::from([(root, Inode::ROOT)]),
                next: Inode::ROOT.as_u64() + 1,
            }),
        }
    }

    /// Return the inode of `path`, assigning one if necessary.
    pub(crate) async fn assign(&self, path: &VirtualPath) -> Inode {
        let mut state = self.state.lock().await;
        if let Some(ino) = state.by_path.get(path) {
            return *ino;
        }
        let ino = Inode(state.next);
        state.next += 1;
        state.by_inode.insert(ino, path.clone());
        state.by_path.insert(path.clone(), ino);
        log::debug!("Assigned inode {ino} to {path}");

        ino
    }

    /// Return the path of an inode previously returned by
    /// [InodeTable::assign].
    pub(crate) async fn path(&self, ino: Inode) -> Result<VirtualPath, FsError> {
        self.state
            .lock()
            .await
            .by_inode
            .get(&ino)
            .cloned()
            .ok_or(FsError::UnknownInode(ino.as_u64()))
    }
}
