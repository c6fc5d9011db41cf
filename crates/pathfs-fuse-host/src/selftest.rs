// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Exercises the sample filesystem through a loopback mount.
//!
//! Used when the binary is built without kernel support, and as an
//! end-to-end check of the adapter: every request crosses the native
//! callback table exactly as a kernel request would.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use libc::c_int;
use pathfs_core::driver::loopback::{LoopbackClient, LoopbackDriver};
use pathfs_core::driver::request::{Reply, Request};
use pathfs_core::{ExitHandle, Mount};
use serde::Serialize;
use tracing::{info, warn};

use crate::memfs::MemFs;
use crate::run::{serve, ServeMode};

const STEP_TIMEOUT: Duration = Duration::from_secs(10);
const CONTENT: &[u8] = b"hello from pathfs\n";
const XATTR_NAME: &str = "user.origin";
const XATTR_VALUE: &[u8] = b"selftest";

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: &'static str,
    pub ok: bool,
    pub reply: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfTestReport {
    pub mount_point: PathBuf,
    pub mode: String,
    pub steps: Vec<StepReport>,
    /// Handles still registered when the loop stopped.
    pub open_handles: usize,
    /// Nodes left in the filesystem after the script cleaned up.
    pub nodes: usize,
    /// `max_write` the filesystem saw in `init`.
    pub max_write: Option<u32>,
}

impl SelfTestReport {
    pub fn passed(&self) -> bool {
        self.open_handles == 0 && self.steps.iter().all(|step| step.ok)
    }
}

/// Stops the session when the script finishes, panics included.
struct ExitOnDrop(ExitHandle);

impl Drop for ExitOnDrop {
    fn drop(&mut self) {
        self.0.exit();
    }
}

struct Script {
    client: LoopbackClient,
    steps: Vec<StepReport>,
}

impl Script {
    fn step(
        &mut self,
        name: &'static str,
        request: Request,
        check: impl FnOnce(&Reply) -> bool,
    ) -> Reply {
        let reply = self.client.request_timeout(request, STEP_TIMEOUT);
        let ok = check(&reply);
        if !ok {
            warn!(step = name, reply = ?reply, "Self-test step failed");
        }
        self.steps.push(StepReport {
            name,
            ok,
            reply: describe(&reply),
        });
        reply
    }

    fn run(mut self) -> Vec<StepReport> {
        let dir = PathBuf::from("/docs");
        let file = dir.join("readme.txt");
        let renamed = dir.join("README");

        self.step("mkdir", Request::Mkdir { path: dir.clone(), mode: 0o755 }, is_ok);

        let created = self.step(
            "create",
            Request::Create {
                path: file.clone(),
                mode: 0o644,
                flags: libc::O_WRONLY | libc::O_CREAT,
            },
            |reply| matches!(reply, Reply::Opened(_)),
        );
        let fh = opened_fh(&created);
        self.step(
            "write",
            Request::Write {
                path: file.clone(),
                data: CONTENT.to_vec(),
                offset: 0,
                fh,
            },
            |reply| *reply == Reply::Written(CONTENT.len()),
        );
        self.step("release", Request::Release { path: file.clone(), fh, flags: 0 }, is_ok);

        let opened = self.step(
            "open",
            Request::Open {
                path: file.clone(),
                flags: libc::O_RDONLY,
            },
            |reply| matches!(reply, Reply::Opened(_)),
        );
        let fh = opened_fh(&opened);
        self.step(
            "read",
            Request::Read {
                path: file.clone(),
                size: 4096,
                offset: 0,
                fh,
            },
            |reply| *reply == Reply::Data(CONTENT.to_vec()),
        );
        self.step("release", Request::Release { path: file.clone(), fh, flags: 0 }, is_ok);

        let listing = self.client.readdir(&dir, 0, 0);
        let listed = matches!(
            &listing,
            Reply::Entries(listing)
                if listing.entries.iter().any(|e| e.name == OsString::from("readme.txt"))
        );
        self.steps.push(StepReport {
            name: "readdir",
            ok: listed,
            reply: describe(&listing),
        });

        self.step(
            "setxattr",
            Request::Setxattr {
                path: file.clone(),
                name: XATTR_NAME.into(),
                value: XATTR_VALUE.to_vec(),
                flags: 0,
            },
            is_ok,
        );
        self.step(
            "getxattr-size",
            Request::Getxattr {
                path: file.clone(),
                name: XATTR_NAME.into(),
                size: 0,
            },
            |reply| *reply == Reply::Size(XATTR_VALUE.len()),
        );
        self.step(
            "getxattr",
            Request::Getxattr {
                path: file.clone(),
                name: XATTR_NAME.into(),
                size: 64,
            },
            |reply| *reply == Reply::Data(XATTR_VALUE.to_vec()),
        );

        self.step(
            "rename",
            Request::Rename {
                from: file.clone(),
                to: renamed.clone(),
            },
            is_ok,
        );
        self.step(
            "getattr",
            Request::Getattr {
                path: renamed.clone(),
            },
            |reply| matches!(reply, Reply::Attr(st) if st.size == CONTENT.len() as u64),
        );
        self.step("unlink", Request::Unlink { path: renamed.clone() }, is_ok);
        self.step(
            "getattr-unlinked",
            Request::Getattr { path: renamed },
            |reply| *reply == Reply::Error(libc::ENOENT),
        );
        self.step("rmdir", Request::Rmdir { path: dir }, is_ok);
        self.step(
            "statfs",
            Request::Statfs {
                path: PathBuf::from("/"),
            },
            |reply| matches!(reply, Reply::Statfs(st) if st.blocks > 0),
        );
        self.steps
    }
}

fn is_ok(reply: &Reply) -> bool {
    *reply == Reply::Ok
}

fn opened_fh(reply: &Reply) -> u64 {
    match reply {
        Reply::Opened(opened) => opened.fh,
        _ => 0,
    }
}

fn describe(reply: &Reply) -> String {
    match reply {
        Reply::Ok => "ok".to_owned(),
        Reply::Error(code) => format!("errno {code}"),
        Reply::Attr(st) => format!("mode {:o} size {}", st.mode, st.size),
        Reply::Statfs(st) => format!("{} of {} blocks free", st.bfree, st.blocks),
        Reply::Data(data) => format!("{} bytes", data.len()),
        Reply::Size(size) => format!("size {size}"),
        Reply::Written(n) => format!("wrote {n}"),
        Reply::Opened(opened) => format!("fh {:#x}", opened.fh),
        Reply::Entries(listing) => listing
            .entries
            .iter()
            .map(|entry| entry.name.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" "),
        other => format!("{other:?}"),
    }
}

/// Mounts `fs` at `mount_point` and runs the script against it.
pub fn run(
    mount_point: &Path,
    fs: MemFs,
    args: &[String],
    mode: ServeMode,
    default_errno: c_int,
) -> anyhow::Result<SelfTestReport> {
    let driver = LoopbackDriver::new().context("creating loopback driver")?;
    let client = driver.client();
    let mut mount = Mount::new(driver, fs).with_default_errno(default_errno);
    mount
        .initialize(mount_point, args)
        .with_context(|| format!("mounting at {}", mount_point.display()))?;
    let exit = mount
        .exit_handle()
        .context("mounted session has no exit handle")?;

    let script = std::thread::spawn(move || {
        let _exit = ExitOnDrop(exit);
        Script {
            client,
            steps: Vec::new(),
        }
        .run()
    });
    serve(&mut mount, mode)?;
    let steps = script
        .join()
        .map_err(|_| anyhow::anyhow!("self-test script panicked"))?;

    let open_handles = mount.open_handles();
    mount.unmount()?;
    let fs = mount.into_filesystem();
    let report = SelfTestReport {
        mount_point: mount_point.to_path_buf(),
        mode: format!("{mode:?}"),
        steps,
        open_handles,
        nodes: fs.node_count(),
        max_write: fs.conn().map(|conn| conn.max_write),
    };
    info!(passed = report.passed(), steps = report.steps.len(), "Self-test finished");
    Ok(report)
}
