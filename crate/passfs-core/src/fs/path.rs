use std::ffi::OsStr;
use std::path::{self, Component, PathBuf};

/// A path within the mounted filesystem.
///
/// Virtual paths are always absolute: `/` is the root of the mount,
/// not the root of the host filesystem. Names need not be valid
/// unicode.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath(PathBuf);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("virtual paths must start with /")]
    NotAbsolute,

    #[error("invalid file name")]
    InvalidName,
}

impl VirtualPath {
    /// The root of the mount.
    pub fn root() -> Self {
        VirtualPath(PathBuf::from("/"))
    }

    /// Build a virtual path from a slash-rooted string.
    pub fn parse(path: impl Into<PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        if !path.has_root() {
            return Err(PathError::NotAbsolute);
        }

        Ok(VirtualPath(path))
    }

    /// Return the path of the entry `name` inside this directory.
    ///
    /// `name` must be a single, normal path component.
    pub fn join(&self, name: &OsStr) -> Result<Self, PathError> {
        let mut components = path::Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(n)), None) if n == name => Ok(VirtualPath(self.0.join(name))),
            _ => Err(PathError::InvalidName),
        }
    }

    pub fn is_root(&self) -> bool {
        self.0.components().all(|c| c == Component::RootDir)
    }

    pub fn as_path(&self) -> &path::Path {
        &self.0
    }
}

impl std::fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Map a virtual path to the real path under `root`.
///
/// This is purely lexical: the filesystem is not accessed, so the
/// result may not exist. `.` components are dropped and `..` never
/// climbs above `root`.
pub fn resolve(root: &path::Path, vpath: &VirtualPath) -> PathBuf {
    let mut relative = PathBuf::new();
    for component in vpath.0.components() {
        match component {
            Component::Normal(name) => relative.push(name),
            Component::ParentDir => {
                relative.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    if relative.as_os_str().is_empty() {
        return root.to_path_buf();
    }

    root.join(relative)
}
