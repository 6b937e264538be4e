//! Daemon binary for the passfs passthrough filesystem

use anyhow::Context as _;
use clap::Parser;
use futures_util::stream::StreamExt as _;
use passfs_core::config::{Config, MountConfig};
use passfs_core::fs::fuse;
use passfs_core::utils::logging;
use signal_hook_tokio::Signals;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, process};

/// Mount a directory read-only at the given mountpoint and serve it
/// in the foreground.
///
/// Files and directories of the target directory are visible through
/// the mountpoint as they are, without modification. Unmounts and
/// stops on SIGTERM, SIGINT, SIGHUP or SIGQUIT.
///
/// By default, outputs errors and warnings to stderr. To configure
/// the output, set the env variable RUST_LOG. Set the env variable
/// RUST_LOG_FORMAT=SYSTEMD to a systemd-friendly log output.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about, verbatim_doc_comment)]
struct Cli {
    /// Path to the TOML configuration file (optional)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory to expose, overrides target from the configuration file
    #[arg(long)]
    target: Option<PathBuf>,

    /// Filesystem name shown by mount (default: passfs)
    #[arg(long)]
    name: Option<String>,

    /// Where to mount the filesystem
    mountpoint: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_with_info_modules(vec!["passfs", "passfs_core"]);

    if let Err(err) = execute(cli).await {
        eprintln!("ERROR: {err:#}");
        process::exit(1);
    };
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::read(path).with_context(|| {
            format!("{}: failed to read TOML config file", path.display())
        })?,
        None => Config::default(),
    };
    if let Some(target) = cli.target {
        config.target = Some(target);
    }
    if let Some(name) = cli.name {
        config.name = name;
    }

    let cwd = std::env::current_dir().context("Failed to get the current directory")?;
    let config = MountConfig::new(&cwd, &config)
        .context("Target directory must be set with --target or in the config file")?;
    check_target_access(config.target())?;
    check_mountpoint(&cli.mountpoint)?;

    let mut signals = Signals::new([
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGQUIT,
    ])?;

    let target = config.target().to_path_buf();
    let handle = fuse::export(Arc::new(config), &cli.mountpoint).with_context(|| {
        format!("Failed to mount {} on {}", target.display(), cli.mountpoint.display())
    })?;

    log::info!(
        "Mounted {} on {}",
        target.display(),
        cli.mountpoint.display()
    );
    println!("Mounted {} on {}", target.display(), cli.mountpoint.display());

    let _ = signals.next().await;

    log::info!("Interrupted. Unmounting..");
    signals.handle().close(); // A 2nd signal kills the process
    handle.join().await?;

    Ok(())
}

/// Checks that the target is a directory that can be read.
fn check_target_access(path: &Path) -> anyhow::Result<()> {
    log::debug!("Checking target directory {}", path.display());
    if !path.exists() {
        anyhow::bail!("Target '{}' does not exist", path.display());
    }
    if !fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false) {
        anyhow::bail!("Target '{}' is not a directory", path.display());
    }
    if fs::read_dir(path).is_err() {
        anyhow::bail!("No read access to target directory '{}'", path.display());
    }

    Ok(())
}

fn check_mountpoint(path: &Path) -> anyhow::Result<()> {
    if !fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false) {
        anyhow::bail!("Mountpoint '{}' is not a directory", path.display());
    }

    Ok(())
}
