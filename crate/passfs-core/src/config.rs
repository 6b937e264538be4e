use crate::fs::path::{self, VirtualPath};
use std::path::{Path, PathBuf};

/// Filesystem name reported to the kernel when none is configured.
pub const DEFAULT_NAME: &str = "passfs";

/// Configuration, as read from a TOML file.
///
/// All fields are optional in the file; the command line may provide
/// or override them.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory whose content is exposed through the mountpoint.
    ///
    /// Relative paths are resolved against the working directory of
    /// the process at startup.
    pub target: Option<PathBuf>,

    /// Name of the filesystem, as shown by mount(8).
    pub name: String,

    /// Let the kernel keep cached file content between opens.
    pub kernel_cache: bool,

    /// Allow users other than the one that mounted the filesystem
    /// to access it. Requires user_allow_other in /etc/fuse.conf.
    pub allow_other: bool,

    /// Stat each entry while listing directories, instead of only
    /// reporting inode and file type.
    pub readdir_stat: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: None,
            name: DEFAULT_NAME.to_string(),
            kernel_cache: true,
            allow_other: false,
            readdir_stat: false,
        }
    }
}

impl Config {
    /// Parse a TOML configuration.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a TOML configuration file.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;

        Self::parse(&content)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("no target directory configured")]
    MissingTarget,
}

/// Mount configuration, fixed for the lifetime of the mount.
///
/// Built once at startup and shared, read-only, with every
/// filesystem operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountConfig {
    cwd: PathBuf,
    target: PathBuf,
    name: String,
    kernel_cache: bool,
    allow_other: bool,
    readdir_stat: bool,
}

impl MountConfig {
    /// Build the mount configuration, resolving the target against
    /// `cwd`.
    ///
    /// This is the only place the target is made absolute; later
    /// changes of the process working directory have no effect.
    pub fn new(cwd: &Path, config: &Config) -> Result<Self, ConfigError> {
        let target = config.target.as_ref().ok_or(ConfigError::MissingTarget)?;
        let target = std::path::absolute(cwd.join(target))?;

        Ok(Self {
            cwd: cwd.to_path_buf(),
            target,
            name: config.name.clone(),
            kernel_cache: config.kernel_cache,
            allow_other: config.allow_other,
            readdir_stat: config.readdir_stat,
        })
    }

    /// Working directory of the process when the mount was configured.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Absolute path of the target root.
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel_cache(&self) -> bool {
        self.kernel_cache
    }

    pub fn allow_other(&self) -> bool {
        self.allow_other
    }

    pub fn readdir_stat(&self) -> bool {
        self.readdir_stat
    }

    /// Real path that corresponds to the given virtual path.
    pub fn resolve(&self, vpath: &VirtualPath) -> PathBuf {
        path::resolve(&self.target, vpath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config() -> anyhow::Result<()> {
        let config = Config::parse(
            r#"
            target = "/srv/data"
            name = "data"
            kernel_cache = false
            allow_other = true
            readdir_stat = true
            "#,
        )?;
        assert_eq!(
            config,
            Config {
                target: Some(PathBuf::from("/srv/data")),
                name: "data".to_string(),
                kernel_cache: false,
                allow_other: true,
                readdir_stat: true,
            }
        );

        Ok(())
    }

    #[test]
    fn parse_empty_config() -> anyhow::Result<()> {
        assert_eq!(Config::default(), Config::parse("")?);

        Ok(())
    }

    #[test]
    fn reject_unknown_field() {
        assert!(matches!(
            Config::parse("targte = \"/srv\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn mount_config_requires_target() {
        assert!(matches!(
            MountConfig::new(Path::new("/home/user"), &Config::default()),
            Err(ConfigError::MissingTarget)
        ));
    }

    #[test]
    fn relative_target_is_resolved_once() -> anyhow::Result<()> {
        let config = Config {
            target: Some(PathBuf::from("data/./files")),
            ..Config::default()
        };
        let mount = MountConfig::new(Path::new("/home/user"), &config)?;
        assert_eq!(Path::new("/home/user/data/files"), mount.target());
        assert_eq!(Path::new("/home/user"), mount.cwd());

        Ok(())
    }

    #[test]
    fn absolute_target_ignores_cwd() -> anyhow::Result<()> {
        let config = Config {
            target: Some(PathBuf::from("/srv/data")),
            ..Config::default()
        };
        let mount = MountConfig::new(Path::new("/home/user"), &config)?;
        assert_eq!(Path::new("/srv/data"), mount.target());

        Ok(())
    }

    #[test]
    fn resolve_through_mount_config() -> anyhow::Result<()> {
        let config = Config {
            target: Some(PathBuf::from("/srv/data")),
            ..Config::default()
        };
        let mount = MountConfig::new(Path::new("/"), &config)?;
        assert_eq!(
            PathBuf::from("/srv/data/notes.txt"),
            mount.resolve(&VirtualPath::parse("/notes.txt")?)
        );

        Ok(())
    }
}
