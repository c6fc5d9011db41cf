// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use libc::{gid_t, mode_t, pid_t, uid_t};

/// Per-call record the driver passes as the first argument of every callback.
///
/// `private_data` is the user-data pointer registered at mount time.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawContext {
    pub uid: uid_t,
    pub gid: gid_t,
    pub pid: pid_t,
    pub umask: mode_t,
    pub private_data: *mut c_void,
}

/// Static facts about the mount, visible to every handler call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub args: Vec<String>,
    pub fsname: Option<String>,
}

impl MountInfo {
    pub fn new(mount_point: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let fsname = fsname_from_args(&args);
        Self {
            mount_point: mount_point.into(),
            args,
            fsname,
        }
    }
}

fn fsname_from_args(args: &[String]) -> Option<String> {
    args.iter()
        .flat_map(|token| token.strip_prefix("-o").unwrap_or(token).split(','))
        .find_map(|opt| opt.strip_prefix("fsname="))
        .map(str::to_owned)
}

/// The caller of one filesystem operation.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    uid: u32,
    gid: u32,
    pid: i32,
    umask: u32,
    mount: &'a MountInfo,
}

impl<'a> Context<'a> {
    pub fn new(uid: u32, gid: u32, pid: i32, umask: u32, mount: &'a MountInfo) -> Self {
        Self {
            uid,
            gid,
            pid,
            umask,
            mount,
        }
    }

    pub(crate) fn from_native(raw: &RawContext, mount: &'a MountInfo) -> Self {
        Self::new(raw.uid, raw.gid, raw.pid, raw.umask.into(), mount)
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn umask(&self) -> u32 {
        self.umask
    }

    pub fn mount(&self) -> &'a MountInfo {
        self.mount
    }

    pub fn mount_point(&self) -> &'a Path {
        &self.mount.mount_point
    }
}
