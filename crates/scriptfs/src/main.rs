use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use owo_colors::OwoColorize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scriptfs::fuse::{self, MountConfig};
use scriptfs::{CacheConfig, DispatcherConfig, FilesystemDispatcher};

/// Mirror BASEDIR at MOUNTPOINT, serving the files named in `.config.yml`
/// from the output of their scripts.
#[derive(Parser, Debug)]
#[command(name = "scriptfs", version, about)]
struct Cli {
    /// Directory to mirror
    basedir: PathBuf,

    /// Where to mount (created if missing)
    mountpoint: PathBuf,

    /// Kill scripts that run longer than this many seconds
    #[arg(long, env = "SCRIPTFS_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Memory kept for stat-cached outputs, in MB
    #[arg(long, env = "SCRIPTFS_CACHE_SIZE_MB", default_value = "64")]
    cache_size_mb: u32,

    /// Let other users access the mount
    #[arg(long, env = "SCRIPTFS_ALLOW_OTHER")]
    allow_other: bool,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "SCRIPTFS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write daily-rotated logs into this directory
    #[arg(long, env = "SCRIPTFS_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let _guard = init_tracing(&cli);

    if let Err(e) = run(cli) {
        tracing::error!("{:#}", e);
        eprintln!("{} {:#}", "error:".red(), e);
        std::process::exit(1);
    }
}

/// The returned guard flushes the file writer on drop
fn init_tracing(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("scriptfs={},warn", cli.log_level)));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "scriptfs.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if !cli.basedir.is_dir() {
        anyhow::bail!("base directory {} does not exist", cli.basedir.display());
    }
    std::fs::create_dir_all(&cli.mountpoint).with_context(|| {
        format!("failed to create mountpoint {}", cli.mountpoint.display())
    })?;

    let options = DispatcherConfig {
        timeout: cli.timeout_secs.map(Duration::from_secs),
        shell: None,
        cache: CacheConfig {
            max_size_mb: cli.cache_size_mb,
        },
    };
    let dispatcher = FilesystemDispatcher::new(&cli.basedir, &cli.mountpoint, options)
        .context("failed to load configuration")?;

    let virtual_count = dispatcher.table().len();
    println!(
        "{} {} -> {} ({} virtual file(s))",
        "Mounting".green(),
        cli.mountpoint.display(),
        cli.basedir.display(),
        virtual_count
    );

    let config = MountConfig {
        allow_other: cli.allow_other,
        ..MountConfig::default()
    };
    fuse::mount(Arc::new(dispatcher), &cli.mountpoint, &config)
        .with_context(|| format!("failed to mount at {}", cli.mountpoint.display()))?;

    tracing::info!("Unmounted {}", cli.mountpoint.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["scriptfs", "/base", "/mnt"]).unwrap();
        assert_eq!(cli.basedir, PathBuf::from("/base"));
        assert_eq!(cli.mountpoint, PathBuf::from("/mnt"));
        assert_eq!(cli.cache_size_mb, 64);
        assert_eq!(cli.log_level, "info");
        assert!(cli.timeout_secs.is_none());
        assert!(!cli.allow_other);
    }

    #[test]
    fn test_cli_requires_both_paths() {
        assert!(Cli::try_parse_from(["scriptfs", "/base"]).is_err());
    }
}
