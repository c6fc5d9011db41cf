// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path-level requests and the native caller that performs them.
//!
//! [`NativeCaller`] invokes a [`RawOperations`] table exactly the way a C
//! driver would: it builds the native argument structs, calls the slot, and
//! decodes the return code and output buffers into a [`Reply`].

use std::ffi::{c_void, CStr, CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use libc::{c_char, c_int, off_t};

use super::UserData;
use crate::attr::{ConnInfo, Flock, LockCommand, RawConnInfo, SetTime, Stat, StatVfs};
use crate::context::RawContext;
use crate::dispatch::RawOperations;
use crate::filesystem::Operation;
use crate::handle::RawFileInfo;

/// Directory buffer size used when a request does not name one.
pub const DEFAULT_DIR_BUFFER: usize = 4096;

/// Fixed part of a kernel directory entry (ino, off, namelen, type).
pub const DIRENT_HEADER: usize = 24;

/// Bytes one entry with a `name_len`-byte name occupies in a directory buffer.
pub const fn dirent_size(name_len: usize) -> usize {
    (DIRENT_HEADER + name_len + 7) & !7
}

/// Identity of the process issuing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
    pub umask: u32,
}

impl Caller {
    /// The current process, with a `022` umask.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            pid: nix::unistd::getpid().as_raw(),
            umask: 0o022,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Init { conn: ConnInfo },
    Destroy,
    Getattr { path: PathBuf },
    Fgetattr { path: PathBuf, fh: u64 },
    Readlink { path: PathBuf, size: usize },
    Mknod { path: PathBuf, mode: u32, rdev: u64 },
    Mkdir { path: PathBuf, mode: u32 },
    Unlink { path: PathBuf },
    Rmdir { path: PathBuf },
    Symlink { target: PathBuf, link: PathBuf },
    Rename { from: PathBuf, to: PathBuf },
    Link { from: PathBuf, to: PathBuf },
    Chmod { path: PathBuf, mode: u32 },
    Chown { path: PathBuf, uid: Option<u32>, gid: Option<u32> },
    Truncate { path: PathBuf, size: i64 },
    Ftruncate { path: PathBuf, size: i64, fh: u64 },
    Utime { path: PathBuf, atime: i64, mtime: i64 },
    Utimens { path: PathBuf, atime: SetTime, mtime: SetTime },
    Open { path: PathBuf, flags: i32 },
    Create { path: PathBuf, mode: u32, flags: i32 },
    Read { path: PathBuf, size: usize, offset: i64, fh: u64 },
    Write { path: PathBuf, data: Vec<u8>, offset: i64, fh: u64 },
    Statfs { path: PathBuf },
    Flush { path: PathBuf, fh: u64 },
    Release { path: PathBuf, fh: u64, flags: i32 },
    Fsync { path: PathBuf, datasync: bool, fh: u64 },
    Setxattr { path: PathBuf, name: OsString, value: Vec<u8>, flags: i32 },
    Getxattr { path: PathBuf, name: OsString, size: usize },
    Listxattr { path: PathBuf, size: usize },
    Removexattr { path: PathBuf, name: OsString },
    Opendir { path: PathBuf, flags: i32 },
    Readdir { path: PathBuf, offset: i64, fh: u64, capacity: usize },
    Releasedir { path: PathBuf, fh: u64 },
    Fsyncdir { path: PathBuf, datasync: bool, fh: u64 },
    Access { path: PathBuf, mask: i32 },
    Lock { path: PathBuf, fh: u64, cmd: LockCommand, lock: Flock },
    Bmap { path: PathBuf, blocksize: usize, index: u64 },
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::Init { .. } => Operation::Init,
            Request::Destroy => Operation::Destroy,
            Request::Getattr { .. } => Operation::Getattr,
            Request::Fgetattr { .. } => Operation::Fgetattr,
            Request::Readlink { .. } => Operation::Readlink,
            Request::Mknod { .. } => Operation::Mknod,
            Request::Mkdir { .. } => Operation::Mkdir,
            Request::Unlink { .. } => Operation::Unlink,
            Request::Rmdir { .. } => Operation::Rmdir,
            Request::Symlink { .. } => Operation::Symlink,
            Request::Rename { .. } => Operation::Rename,
            Request::Link { .. } => Operation::Link,
            Request::Chmod { .. } => Operation::Chmod,
            Request::Chown { .. } => Operation::Chown,
            Request::Truncate { .. } => Operation::Truncate,
            Request::Ftruncate { .. } => Operation::Ftruncate,
            Request::Utime { .. } => Operation::Utime,
            Request::Utimens { .. } => Operation::Utimens,
            Request::Open { .. } => Operation::Open,
            Request::Create { .. } => Operation::Create,
            Request::Read { .. } => Operation::Read,
            Request::Write { .. } => Operation::Write,
            Request::Statfs { .. } => Operation::Statfs,
            Request::Flush { .. } => Operation::Flush,
            Request::Release { .. } => Operation::Release,
            Request::Fsync { .. } => Operation::Fsync,
            Request::Setxattr { .. } => Operation::Setxattr,
            Request::Getxattr { .. } => Operation::Getxattr,
            Request::Listxattr { .. } => Operation::Listxattr,
            Request::Removexattr { .. } => Operation::Removexattr,
            Request::Opendir { .. } => Operation::Opendir,
            Request::Readdir { .. } => Operation::Readdir,
            Request::Releasedir { .. } => Operation::Releasedir,
            Request::Fsyncdir { .. } => Operation::Fsyncdir,
            Request::Access { .. } => Operation::Access,
            Request::Lock { .. } => Operation::Lock,
            Request::Bmap { .. } => Operation::Bmap,
        }
    }
}

/// Output flags and identity of a successful open-family call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub fh: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
    pub nonseekable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: OsString,
    pub stat: Option<Stat>,
    pub offset: i64,
}

/// Entries accepted by a directory buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DirListing {
    pub entries: Vec<DirEntry>,
    /// True once the buffer rejected an entry.
    pub full: bool,
    pub used: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    /// Positive errno.
    Error(c_int),
    Attr(Stat),
    Statfs(StatVfs),
    Data(Vec<u8>),
    /// Answer to a zero-size xattr query.
    Size(usize),
    Written(usize),
    Opened(Opened),
    Entries(DirListing),
    Lock(Flock),
    Block(u64),
    Conn(ConnInfo),
}

impl Reply {
    pub fn errno(&self) -> Option<c_int> {
        match self {
            Reply::Error(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// The raw return code a C driver would have seen.
    pub fn status(&self) -> c_int {
        self.errno().map_or(0, |code| -code)
    }
}

/// Calls the native table on behalf of a driver.
#[derive(Debug, Clone, Copy)]
pub struct NativeCaller {
    ops: RawOperations,
    user_data: UserData,
}

struct DirBuffer {
    listing: DirListing,
}

unsafe extern "C" fn fill_dir_buffer(
    buf: *mut c_void,
    name: *const c_char,
    stbuf: *const libc::stat,
    off: off_t,
) -> c_int {
    // SAFETY: `buf` is the DirBuffer passed alongside this callback.
    let Some(buffer) = (unsafe { buf.cast::<DirBuffer>().as_mut() }) else {
        return 1;
    };
    if name.is_null() {
        return 1;
    }
    // SAFETY: the filler passes a NUL-terminated name.
    let name = unsafe { CStr::from_ptr(name) }.to_bytes();
    let listing = &mut buffer.listing;
    let cost = dirent_size(name.len());
    if listing.used + cost > listing.capacity {
        listing.full = true;
        return 1;
    }
    listing.used += cost;
    // SAFETY: a non-null stat pointer is valid for the duration of the call.
    let stat = unsafe { stbuf.as_ref() }.and_then(|st| Stat::from_native(st).ok());
    listing.entries.push(DirEntry {
        name: OsStr::from_bytes(name).to_os_string(),
        stat,
        offset: off.into(),
    });
    0
}

fn c_path(path: &Path) -> Result<CString, c_int> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)
}

fn c_name(name: &OsStr) -> Result<CString, c_int> {
    CString::new(name.as_bytes()).map_err(|_| libc::EINVAL)
}

fn status(rc: c_int) -> Result<c_int, c_int> {
    if rc < 0 {
        Err(-rc)
    } else {
        Ok(rc)
    }
}

fn slot<T>(slot: Option<T>) -> Result<T, c_int> {
    slot.ok_or(libc::ENOSYS)
}

fn file_info(fh: u64) -> RawFileInfo {
    RawFileInfo {
        fh,
        ..RawFileInfo::default()
    }
}

fn returned_len(rc: c_int) -> usize {
    usize::try_from(rc).unwrap_or(0)
}

impl NativeCaller {
    pub fn new(ops: RawOperations, user_data: UserData) -> Self {
        Self { ops, user_data }
    }

    pub fn operations(&self) -> &RawOperations {
        &self.ops
    }

    fn context(&self, caller: &Caller) -> RawContext {
        RawContext {
            uid: caller.uid,
            gid: caller.gid,
            pid: caller.pid,
            umask: caller.umask as libc::mode_t,
            private_data: self.user_data.as_ptr(),
        }
    }

    /// Performs one request. Empty slots answer `ENOSYS`.
    pub fn call(&self, caller: &Caller, request: Request) -> Reply {
        // SAFETY: every pointer passed below is built here and outlives the call.
        match unsafe { self.perform(caller, request) } {
            Ok(reply) => reply,
            Err(errno) => Reply::Error(errno),
        }
    }

    unsafe fn perform(&self, caller: &Caller, request: Request) -> Result<Reply, c_int> {
        let ctx = self.context(caller);
        let cx: *const RawContext = &ctx;
        let ops = &self.ops;
        let reply = unsafe {
            match request {
                Request::Init { conn } => {
                    let f = slot(ops.init)?;
                    let mut raw = RawConnInfo::default();
                    conn.to_native(&mut raw);
                    status(f(cx, &mut raw))?;
                    Reply::Conn(ConnInfo::from_native(&raw))
                }
                Request::Destroy => {
                    slot(ops.destroy)?(cx);
                    Reply::Ok
                }
                Request::Getattr { path } => {
                    let f = slot(ops.getattr)?;
                    let path = c_path(&path)?;
                    let mut st: libc::stat = std::mem::zeroed();
                    status(f(cx, path.as_ptr(), &mut st))?;
                    Reply::Attr(Stat::from_native(&st).map_err(|_| libc::EIO)?)
                }
                Request::Fgetattr { path, fh } => {
                    let f = slot(ops.fgetattr)?;
                    let path = c_path(&path)?;
                    let mut st: libc::stat = std::mem::zeroed();
                    let mut fi = file_info(fh);
                    status(f(cx, path.as_ptr(), &mut st, &mut fi))?;
                    Reply::Attr(Stat::from_native(&st).map_err(|_| libc::EIO)?)
                }
                Request::Readlink { path, size } => {
                    let f = slot(ops.readlink)?;
                    let path = c_path(&path)?;
                    let mut buf = vec![0u8; size];
                    status(f(cx, path.as_ptr(), buf.as_mut_ptr().cast(), size))?;
                    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
                    buf.truncate(end);
                    Reply::Data(buf)
                }
                Request::Mknod { path, mode, rdev } => {
                    let f = slot(ops.mknod)?;
                    let path = c_path(&path)?;
                    let rdev = libc::dev_t::try_from(rdev).map_err(|_| libc::EINVAL)?;
                    status(f(cx, path.as_ptr(), mode as libc::mode_t, rdev))?;
                    Reply::Ok
                }
                Request::Mkdir { path, mode } => {
                    let f = slot(ops.mkdir)?;
                    let path = c_path(&path)?;
                    status(f(cx, path.as_ptr(), mode as libc::mode_t))?;
                    Reply::Ok
                }
                Request::Unlink { path } => {
                    let f = slot(ops.unlink)?;
                    status(f(cx, c_path(&path)?.as_ptr()))?;
                    Reply::Ok
                }
                Request::Rmdir { path } => {
                    let f = slot(ops.rmdir)?;
                    status(f(cx, c_path(&path)?.as_ptr()))?;
                    Reply::Ok
                }
                Request::Symlink { target, link } => {
                    let f = slot(ops.symlink)?;
                    let (target, link) = (c_path(&target)?, c_path(&link)?);
                    status(f(cx, target.as_ptr(), link.as_ptr()))?;
                    Reply::Ok
                }
                Request::Rename { from, to } => {
                    let f = slot(ops.rename)?;
                    let (from, to) = (c_path(&from)?, c_path(&to)?);
                    status(f(cx, from.as_ptr(), to.as_ptr()))?;
                    Reply::Ok
                }
                Request::Link { from, to } => {
                    let f = slot(ops.link)?;
                    let (from, to) = (c_path(&from)?, c_path(&to)?);
                    status(f(cx, from.as_ptr(), to.as_ptr()))?;
                    Reply::Ok
                }
                Request::Chmod { path, mode } => {
                    let f = slot(ops.chmod)?;
                    let path = c_path(&path)?;
                    status(f(cx, path.as_ptr(), mode as libc::mode_t))?;
                    Reply::Ok
                }
                Request::Chown { path, uid, gid } => {
                    let f = slot(ops.chown)?;
                    let path = c_path(&path)?;
                    let uid = uid.unwrap_or(libc::uid_t::MAX);
                    let gid = gid.unwrap_or(libc::gid_t::MAX);
                    status(f(cx, path.as_ptr(), uid, gid))?;
                    Reply::Ok
                }
                Request::Truncate { path, size } => {
                    let f = slot(ops.truncate)?;
                    status(f(cx, c_path(&path)?.as_ptr(), size as off_t))?;
                    Reply::Ok
                }
                Request::Ftruncate { path, size, fh } => {
                    let f = slot(ops.ftruncate)?;
                    let path = c_path(&path)?;
                    let mut fi = file_info(fh);
                    status(f(cx, path.as_ptr(), size as off_t, &mut fi))?;
                    Reply::Ok
                }
                Request::Utime { path, atime, mtime } => {
                    let f = slot(ops.utime)?;
                    let path = c_path(&path)?;
                    let mut times = libc::utimbuf {
                        actime: atime as libc::time_t,
                        modtime: mtime as libc::time_t,
                    };
                    status(f(cx, path.as_ptr(), &mut times))?;
                    Reply::Ok
                }
                Request::Utimens { path, atime, mtime } => {
                    let f = slot(ops.utimens)?;
                    let path = c_path(&path)?;
                    let times = [
                        atime.to_native().map_err(|_| libc::EINVAL)?,
                        mtime.to_native().map_err(|_| libc::EINVAL)?,
                    ];
                    status(f(cx, path.as_ptr(), times.as_ptr()))?;
                    Reply::Ok
                }
                Request::Open { path, flags } => {
                    let f = slot(ops.open)?;
                    let path = c_path(&path)?;
                    let mut fi = RawFileInfo::with_flags(flags);
                    status(f(cx, path.as_ptr(), &mut fi))?;
                    Reply::Opened(opened(&fi))
                }
                Request::Create { path, mode, flags } => {
                    let f = slot(ops.create)?;
                    let path = c_path(&path)?;
                    let mut fi = RawFileInfo::with_flags(flags);
                    status(f(cx, path.as_ptr(), mode as libc::mode_t, &mut fi))?;
                    Reply::Opened(opened(&fi))
                }
                Request::Read {
                    path,
                    size,
                    offset,
                    fh,
                } => {
                    let f = slot(ops.read)?;
                    let path = c_path(&path)?;
                    let mut buf = vec![0u8; size];
                    let mut fi = file_info(fh);
                    let rc = status(f(
                        cx,
                        path.as_ptr(),
                        buf.as_mut_ptr().cast(),
                        size,
                        offset as off_t,
                        &mut fi,
                    ))?;
                    buf.truncate(returned_len(rc));
                    Reply::Data(buf)
                }
                Request::Write {
                    path,
                    data,
                    offset,
                    fh,
                } => {
                    let f = slot(ops.write)?;
                    let path = c_path(&path)?;
                    let mut fi = file_info(fh);
                    let rc = status(f(
                        cx,
                        path.as_ptr(),
                        data.as_ptr().cast(),
                        data.len(),
                        offset as off_t,
                        &mut fi,
                    ))?;
                    Reply::Written(returned_len(rc))
                }
                Request::Statfs { path } => {
                    let f = slot(ops.statfs)?;
                    let path = c_path(&path)?;
                    let mut st: libc::statvfs = std::mem::zeroed();
                    status(f(cx, path.as_ptr(), &mut st))?;
                    Reply::Statfs(StatVfs::from_native(&st).map_err(|_| libc::EIO)?)
                }
                Request::Flush { path, fh } => {
                    let f = slot(ops.flush)?;
                    let path = c_path(&path)?;
                    let mut fi = file_info(fh);
                    status(f(cx, path.as_ptr(), &mut fi))?;
                    Reply::Ok
                }
                Request::Release { path, fh, flags } => {
                    let f = slot(ops.release)?;
                    let path = c_path(&path)?;
                    let mut fi = RawFileInfo {
                        flags,
                        ..file_info(fh)
                    };
                    status(f(cx, path.as_ptr(), &mut fi))?;
                    Reply::Ok
                }
                Request::Fsync { path, datasync, fh } => {
                    let f = slot(ops.fsync)?;
                    let path = c_path(&path)?;
                    let mut fi = file_info(fh);
                    status(f(cx, path.as_ptr(), c_int::from(datasync), &mut fi))?;
                    Reply::Ok
                }
                Request::Setxattr {
                    path,
                    name,
                    value,
                    flags,
                } => {
                    let f = slot(ops.setxattr)?;
                    let (path, name) = (c_path(&path)?, c_name(&name)?);
                    status(f(
                        cx,
                        path.as_ptr(),
                        name.as_ptr(),
                        value.as_ptr().cast(),
                        value.len(),
                        flags,
                    ))?;
                    Reply::Ok
                }
                Request::Getxattr { path, name, size } => {
                    let f = slot(ops.getxattr)?;
                    let (path, name) = (c_path(&path)?, c_name(&name)?);
                    let mut buf = vec![0u8; size];
                    let rc = status(f(
                        cx,
                        path.as_ptr(),
                        name.as_ptr(),
                        buf.as_mut_ptr().cast(),
                        size,
                    ))?;
                    sized(buf, size, rc)
                }
                Request::Listxattr { path, size } => {
                    let f = slot(ops.listxattr)?;
                    let path = c_path(&path)?;
                    let mut buf = vec![0u8; size];
                    let rc = status(f(cx, path.as_ptr(), buf.as_mut_ptr().cast(), size))?;
                    sized(buf, size, rc)
                }
                Request::Removexattr { path, name } => {
                    let f = slot(ops.removexattr)?;
                    let (path, name) = (c_path(&path)?, c_name(&name)?);
                    status(f(cx, path.as_ptr(), name.as_ptr()))?;
                    Reply::Ok
                }
                Request::Opendir { path, flags } => {
                    let f = slot(ops.opendir)?;
                    let path = c_path(&path)?;
                    let mut fi = RawFileInfo::with_flags(flags);
                    status(f(cx, path.as_ptr(), &mut fi))?;
                    Reply::Opened(opened(&fi))
                }
                Request::Readdir {
                    path,
                    offset,
                    fh,
                    capacity,
                } => {
                    let f = slot(ops.readdir)?;
                    let path = c_path(&path)?;
                    let mut fi = file_info(fh);
                    let mut buffer = DirBuffer {
                        listing: DirListing {
                            capacity,
                            ..DirListing::default()
                        },
                    };
                    status(f(
                        cx,
                        path.as_ptr(),
                        (&mut buffer as *mut DirBuffer).cast(),
                        Some(fill_dir_buffer),
                        offset as off_t,
                        &mut fi,
                    ))?;
                    Reply::Entries(buffer.listing)
                }
                Request::Releasedir { path, fh } => {
                    let f = slot(ops.releasedir)?;
                    let path = c_path(&path)?;
                    let mut fi = file_info(fh);
                    status(f(cx, path.as_ptr(), &mut fi))?;
                    Reply::Ok
                }
                Request::Fsyncdir { path, datasync, fh } => {
                    let f = slot(ops.fsyncdir)?;
                    let path = c_path(&path)?;
                    let mut fi = file_info(fh);
                    status(f(cx, path.as_ptr(), c_int::from(datasync), &mut fi))?;
                    Reply::Ok
                }
                Request::Access { path, mask } => {
                    let f = slot(ops.access)?;
                    status(f(cx, c_path(&path)?.as_ptr(), mask))?;
                    Reply::Ok
                }
                Request::Lock {
                    path,
                    fh,
                    cmd,
                    lock,
                } => {
                    let f = slot(ops.lock)?;
                    let path = c_path(&path)?;
                    let mut fi = file_info(fh);
                    let mut raw = lock.native().map_err(|_| libc::EINVAL)?;
                    status(f(cx, path.as_ptr(), &mut fi, cmd.to_native(), &mut raw))?;
                    Reply::Lock(Flock::from_native(&raw).map_err(|_| libc::EIO)?)
                }
                Request::Bmap {
                    path,
                    blocksize,
                    index,
                } => {
                    let f = slot(ops.bmap)?;
                    let path = c_path(&path)?;
                    let mut idx = index;
                    status(f(cx, path.as_ptr(), blocksize, &mut idx))?;
                    Reply::Block(idx)
                }
            }
        };
        Ok(reply)
    }
}

fn opened(fi: &RawFileInfo) -> Opened {
    Opened {
        fh: fi.fh,
        direct_io: fi.direct_io != 0,
        keep_cache: fi.keep_cache != 0,
        nonseekable: fi.nonseekable != 0,
    }
}

fn sized(mut buf: Vec<u8>, size: usize, rc: c_int) -> Reply {
    if size == 0 {
        Reply::Size(returned_len(rc))
    } else {
        buf.truncate(returned_len(rc));
        Reply::Data(buf)
    }
}

/// Splits a NUL-packed xattr name list.
pub fn split_names(packed: &[u8]) -> Vec<OsString> {
    packed
        .split(|b| *b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| OsString::from_vec(name.to_vec()))
        .collect()
}
