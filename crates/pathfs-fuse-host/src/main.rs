// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! pathfs FUSE host: mounts the in-memory sample filesystem.
//!
//! With the `fuse` feature on Linux the filesystem is mounted through the
//! kernel. Otherwise, or with `--selftest`, it is mounted on the loopback
//! driver and a scripted session runs against it, printing a JSON report.

#[cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]
mod inodes;
#[cfg(all(feature = "fuse", target_os = "linux"))]
mod kernel;
mod memfs;
mod run;
mod selftest;
#[cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]
mod signals;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use pathfs_core::MountConfig;
use pathfs_logging::{CliLogLevel, CliLoggingArgs};
use tracing::info;

use memfs::{Capacity, MemFs};
use run::ServeMode;

const DEFAULT_FSNAME: &str = "memfs";
const DEFAULT_SUBTYPE: &str = "pathfs";

#[derive(Parser, Debug)]
#[command(name = "pathfs-fuse-host", version, about = "Mount the pathfs in-memory filesystem")]
struct Args {
    /// Mount point for the filesystem (a scratch directory for the self-test when omitted)
    mount_point: Option<PathBuf>,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra mount options, comma separated
    #[arg(short = 'o', value_delimiter = ',')]
    options: Vec<String>,

    /// Filesystem name shown in the mount table
    #[arg(long)]
    fsname: Option<String>,

    /// Trace every filesystem call
    #[arg(short, long)]
    debug: bool,

    /// Mount read-only
    #[arg(long)]
    read_only: bool,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    /// Dispatch threads; 1 runs the single-threaded loop
    #[arg(long)]
    threads: Option<usize>,

    /// Poll the session descriptor from the host instead of the built-in loop
    #[arg(long)]
    manual_loop: bool,

    /// Bytes of file data the in-memory filesystem accepts
    #[arg(long)]
    max_bytes: Option<u64>,

    /// Nodes the in-memory filesystem accepts
    #[arg(long)]
    max_nodes: Option<u64>,

    /// Errno returned when a handler fails without a code
    #[arg(long)]
    default_errno: Option<i32>,

    /// Run the loopback self-test even when kernel support is compiled in
    #[arg(long, env = "PATHFS_SELFTEST")]
    selftest: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

/// Layers command-line flags over the optional configuration file.
fn merge_config(args: &Args) -> Result<MountConfig> {
    let mut config = match &args.config {
        Some(path) => MountConfig::load(path)?,
        None => MountConfig::default(),
    };
    if args.mount_point.is_some() {
        config.mount_point = args.mount_point.clone();
    }
    if args.fsname.is_some() {
        config.fsname = args.fsname.clone();
    }
    config.fsname.get_or_insert_with(|| DEFAULT_FSNAME.to_owned());
    config.subtype.get_or_insert_with(|| DEFAULT_SUBTYPE.to_owned());
    config.debug |= args.debug;
    config.read_only |= args.read_only;
    config.allow_other |= args.allow_other;
    config.allow_root |= args.allow_root;
    config.auto_unmount |= args.auto_unmount;
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(errno) = args.default_errno {
        config.default_errno = errno;
    }
    if !args.options.is_empty() {
        config.options.push("-o".to_owned());
        config.options.push(args.options.join(","));
    }
    config.validate()?;
    Ok(config)
}

/// `-d` traces every call, so it also opens the filter to trace level
/// unless `--log-level` says otherwise.
fn default_log_level(config: &MountConfig) -> CliLogLevel {
    if config.debug {
        CliLogLevel::Trace
    } else {
        CliLogLevel::Info
    }
}

fn filesystem(args: &Args, config: &MountConfig) -> MemFs {
    let defaults = Capacity::default();
    let capacity = Capacity {
        bytes: args.max_bytes.unwrap_or(defaults.bytes),
        nodes: args.max_nodes.unwrap_or(defaults.nodes),
    };
    MemFs::new()
        .with_capacity(capacity)
        .read_only(config.read_only)
}

fn run_selftest(config: &MountConfig, fs: MemFs, mode: ServeMode) -> Result<()> {
    let scratch;
    let mount_point = match &config.mount_point {
        Some(path) => path.as_path(),
        None => {
            scratch = tempfile::tempdir().context("creating scratch mount point")?;
            scratch.path()
        }
    };

    let report = selftest::run(mount_point, fs, &config.argv(), mode, config.default_errno)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    anyhow::ensure!(report.passed(), "self-test failed");
    Ok(())
}

#[cfg(all(feature = "fuse", target_os = "linux"))]
fn mount_kernel(config: &MountConfig, fs: MemFs, mode: ServeMode) -> Result<()> {
    use kernel::KernelDriver;
    use pathfs_core::Mount;

    let mount_point = config
        .mount_point
        .clone()
        .context("a mount point is required to mount through the kernel")?;
    let mut driver = KernelDriver::new()?;
    if let Some(size) = config.dir_buffer_size {
        driver = driver.with_dir_capacity(size);
    }
    let mut mount = Mount::new(driver, fs).with_default_errno(config.default_errno);

    info!("Mounting filesystem...");
    mount.initialize(&mount_point, config.argv().as_slice())?;

    let exit = mount.exit_handle().context("mount has no active session")?;
    ctrlc::set_handler(move || {
        info!("Received interrupt, unmounting");
        exit.exit();
    })?;
    let traps =
        signals::SignalTraps::install(mount.signals()).context("installing signal traps")?;

    run::serve(&mut mount, mode)?;
    drop(traps);
    mount.unmount()?;
    info!("Filesystem unmounted");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = merge_config(&args)?;
    args.logging
        .clone()
        .init_with_default_level("pathfs-fuse-host", default_log_level(&config))?;

    info!("Starting pathfs FUSE host");
    info!(?config, "Configuration loaded");
    let mode = ServeMode::select(config.threads, args.manual_loop);
    let fs = filesystem(&args, &config);

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        if !args.selftest {
            return mount_kernel(&config, fs, mode);
        }
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        if !args.selftest {
            tracing::warn!("FUSE support not compiled in; running the loopback self-test instead");
        }
    }

    run_selftest(&config, fs, mode)
}
