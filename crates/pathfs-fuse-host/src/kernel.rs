// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel driver built on `fuser`.
//!
//! The kernel names files by inode. [`PathBridge`] runs on fuser's session
//! thread, resolves inodes through an [`InodeTable`], and submits each
//! kernel request as a path [`Request`] on the session queue. The mount's own
//! loop then serves it through the native callback table like any other
//! driver's requests.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, KernelConfig, MountOption, ReplyAttr, ReplyBmap, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, TimeOrNow,
};
use libc::c_int;
use pathfs_core::driver::queue::{Channel, Pending, RequestQueue};
use pathfs_core::driver::request::{Caller, NativeCaller, Opened, Reply, Request, DEFAULT_DIR_BUFFER};
use pathfs_core::driver::Received;
use pathfs_core::{
    ConnInfo, Driver, DriverError, ExitHandle, Flock, LockCommand, LockKind, MountArgs,
    RawOperations, Session, SetTime, Stat, Timespec, UserData, Whence, S_IFBLK, S_IFCHR, S_IFDIR,
    S_IFIFO, S_IFLNK, S_IFMT, S_IFSOCK,
};
use tracing::{debug, info, warn};

use crate::inodes::{InodeTable, ROOT_INODE};

const TTL: Duration = Duration::from_secs(1);
const PATH_MAX: usize = 4096;
/// Lock end the kernel uses for "to end of file".
const OFFSET_MAX: u64 = i64::MAX as u64;

/// Connection parameters offered to `init` before the kernel negotiates.
pub const KERNEL_CONN: ConnInfo = ConnInfo {
    proto_major: 7,
    proto_minor: 31,
    async_read: true,
    max_write: 128 * 1024,
    max_readahead: 128 * 1024,
    capable: 0,
    want: 0,
};

/// Maps `-o` tokens to kernel mount options. Options only the adapter
/// understands (such as `debug`) are not forwarded.
pub fn mount_options(args: &MountArgs) -> Vec<MountOption> {
    args.options()
        .iter()
        .filter_map(|option| {
            let parsed = match option.split_once('=') {
                Some(("fsname", name)) => MountOption::FSName(name.to_owned()),
                Some(("subtype", name)) => MountOption::Subtype(name.to_owned()),
                Some(_) => MountOption::CUSTOM(option.clone()),
                None => match option.as_str() {
                    "debug" => return None,
                    "ro" => MountOption::RO,
                    "rw" => MountOption::RW,
                    "allow_other" => MountOption::AllowOther,
                    "allow_root" => MountOption::AllowRoot,
                    "auto_unmount" => MountOption::AutoUnmount,
                    "default_permissions" => MountOption::DefaultPermissions,
                    "dev" => MountOption::Dev,
                    "nodev" => MountOption::NoDev,
                    "suid" => MountOption::Suid,
                    "nosuid" => MountOption::NoSuid,
                    "exec" => MountOption::Exec,
                    "noexec" => MountOption::NoExec,
                    "atime" => MountOption::Atime,
                    "noatime" => MountOption::NoAtime,
                    "dirsync" => MountOption::DirSync,
                    "sync" => MountOption::Sync,
                    "async" => MountOption::Async,
                    other => MountOption::CUSTOM(other.to_owned()),
                },
            };
            Some(parsed)
        })
        .collect()
}

#[derive(Debug)]
pub struct KernelDriver {
    queue: Arc<RequestQueue>,
    dir_capacity: usize,
}

impl KernelDriver {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            queue: Arc::new(RequestQueue::new()?),
            dir_capacity: DEFAULT_DIR_BUFFER,
        })
    }

    pub fn with_dir_capacity(mut self, capacity: usize) -> Self {
        self.dir_capacity = capacity;
        self
    }
}

impl Driver for KernelDriver {
    type Session = KernelSession;

    fn mount(
        &mut self,
        mount_point: &Path,
        args: &MountArgs,
        ops: RawOperations,
        user_data: UserData,
    ) -> Result<KernelSession, DriverError> {
        match std::fs::metadata(mount_point) {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(DriverError::BadMountPoint(mount_point.to_path_buf())),
        }
        if self.queue.exited() {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }

        let native = NativeCaller::new(ops, user_data);
        let conn = if ops.init.is_some() {
            match native.call(&Caller::current(), Request::Init { conn: KERNEL_CONN }) {
                Reply::Conn(conn) => conn,
                Reply::Error(code) => return Err(DriverError::InitFailed(code)),
                _ => KERNEL_CONN,
            }
        } else {
            KERNEL_CONN
        };

        let inodes = Arc::new(Mutex::new(InodeTable::new()));
        let bridge = PathBridge {
            queue: Arc::clone(&self.queue),
            inodes: Arc::clone(&inodes),
            conn,
            dir_capacity: self.dir_capacity,
        };
        let options = mount_options(args);
        let background = match fuser::spawn_mount2(bridge, mount_point, &options) {
            Ok(background) => background,
            Err(err) => {
                if ops.destroy.is_some() {
                    native.call(&Caller::current(), Request::Destroy);
                }
                return Err(DriverError::MountFailed(err));
            }
        };
        let notifier = background.notifier();

        info!(
            target: "pathfs::kernel",
            mount_point = %mount_point.display(),
            options = ?options,
            "Kernel session mounted"
        );
        Ok(KernelSession {
            channel: Channel::new(Arc::clone(&self.queue), native),
            background: Some(background),
            notifier,
            inodes,
            mount_point: mount_point.to_path_buf(),
        })
    }
}

pub struct KernelSession {
    channel: Channel,
    background: Option<fuser::BackgroundSession>,
    notifier: fuser::Notifier,
    inodes: Arc<Mutex<InodeTable>>,
    mount_point: PathBuf,
}

impl KernelSession {
    fn inodes(&self) -> MutexGuard<'_, InodeTable> {
        self.inodes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Session for KernelSession {
    fn event_fd(&self) -> BorrowedFd<'_> {
        self.channel.queue().as_fd()
    }

    fn read_request(&mut self) -> Result<Received, DriverError> {
        self.channel.read_request()
    }

    fn dispatch(&mut self, request: Pending) {
        self.channel.dispatch(request);
    }

    fn run(&mut self) -> Result<(), DriverError> {
        self.channel.run()
    }

    fn run_multi(&mut self, workers: usize) -> Result<(), DriverError> {
        self.channel.run_multi(workers)
    }

    fn exit(&self) {
        self.channel.queue().exit();
    }

    fn exited(&self) -> bool {
        self.channel.queue().exited()
    }

    fn exit_handle(&self) -> ExitHandle {
        ExitHandle::new(Arc::clone(self.channel.queue()))
    }

    fn unmount(&mut self) -> Result<(), DriverError> {
        let Some(background) = self.background.take() else {
            return Ok(());
        };
        // Requests still in flight on the kernel thread get ENOTCONN.
        self.channel.queue().exit();
        background.umount_and_join();

        let native = self.channel.native();
        if native.operations().destroy.is_some() {
            native.call(&Caller::current(), Request::Destroy);
        }
        info!(
            target: "pathfs::kernel",
            mount_point = %self.mount_point.display(),
            "Kernel session unmounted"
        );
        Ok(())
    }

    fn invalidate(&mut self, path: &Path) -> Result<(), DriverError> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(());
        };
        let Some(parent_ino) = self.inodes().inode(parent) else {
            return Ok(());
        };
        match self.notifier.inval_entry(parent_ino, name) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {}
            Err(err) => return Err(err.into()),
        }
        debug!(target: "pathfs::kernel", path = %path.display(), "Entry invalidated");
        Ok(())
    }
}

/// Runs on fuser's session thread and forwards kernel requests as path
/// requests.
struct PathBridge {
    queue: Arc<RequestQueue>,
    inodes: Arc<Mutex<InodeTable>>,
    conn: ConnInfo,
    dir_capacity: usize,
}

impl PathBridge {
    fn inodes(&self) -> MutexGuard<'_, InodeTable> {
        self.inodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call(&self, req: &fuser::Request<'_>, request: Request) -> Reply {
        let caller = Caller {
            uid: req.uid(),
            gid: req.gid(),
            pid: i32::try_from(req.pid()).unwrap_or(i32::MAX),
            umask: 0o022,
        };
        self.queue
            .submit(caller, request)
            .recv()
            .unwrap_or(Reply::Error(libc::ENOTCONN))
    }

    fn path(&self, ino: u64) -> Result<PathBuf, c_int> {
        self.inodes()
            .path(ino)
            .map(Path::to_path_buf)
            .ok_or(libc::ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf, c_int> {
        self.inodes().child(parent, name).ok_or(libc::ENOENT)
    }

    fn ok(&self, req: &fuser::Request<'_>, request: Request) -> Result<(), c_int> {
        match self.call(req, request) {
            Reply::Ok => Ok(()),
            other => Err(errno(&other)),
        }
    }

    /// Attributes through the handle when the filesystem supports it.
    fn attr(&self, req: &fuser::Request<'_>, path: &Path, fh: Option<u64>) -> Result<Stat, c_int> {
        if let Some(fh) = fh {
            let path = path.to_path_buf();
            match self.call(req, Request::Fgetattr { path, fh }) {
                Reply::Attr(stat) => return Ok(stat),
                Reply::Error(libc::ENOSYS) => {}
                other => return Err(errno(&other)),
            }
        }
        match self.call(req, Request::Getattr { path: path.to_path_buf() }) {
            Reply::Attr(stat) => Ok(stat),
            other => Err(errno(&other)),
        }
    }

    /// Looks `path` up and counts the reference the kernel takes.
    fn entry(&self, req: &fuser::Request<'_>, path: &Path) -> Result<FileAttr, c_int> {
        let stat = self.attr(req, path, None)?;
        let ino = self.inodes().lookup(path);
        Ok(file_attr(ino, &stat))
    }

    fn opened(&self, req: &fuser::Request<'_>, request: Request) -> Result<Opened, c_int> {
        match self.call(req, request) {
            Reply::Opened(opened) => Ok(opened),
            other => Err(errno(&other)),
        }
    }
}

fn errno(reply: &Reply) -> c_int {
    reply.errno().unwrap_or(libc::EIO)
}

fn reply_empty(reply: ReplyEmpty, result: Result<(), c_int>) {
    match result {
        Ok(()) => reply.ok(),
        Err(code) => reply.error(code),
    }
}

fn reply_entry(reply: ReplyEntry, result: Result<FileAttr, c_int>) {
    match result {
        Ok(attr) => reply.entry(&TTL, &attr, 0),
        Err(code) => reply.error(code),
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & S_IFMT {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        S_IFCHR => FileType::CharDevice,
        S_IFBLK => FileType::BlockDevice,
        S_IFIFO => FileType::NamedPipe,
        S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn file_attr(ino: u64, stat: &Stat) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: stat.atime.into(),
        mtime: stat.mtime.into(),
        ctime: stat.ctime.into(),
        crtime: stat.ctime.into(),
        kind: file_type(stat.mode),
        perm: (stat.mode & 0o7777) as u16,
        nlink: u32::try_from(stat.nlink).unwrap_or(u32::MAX),
        uid: stat.uid,
        gid: stat.gid,
        rdev: u32::try_from(stat.rdev).unwrap_or(0),
        blksize: u32::try_from(stat.blksize).unwrap_or(4096),
        flags: 0,
    }
}

fn open_flags(opened: &Opened) -> u32 {
    let mut flags = 0;
    if opened.direct_io {
        flags |= fuser::consts::FOPEN_DIRECT_IO;
    }
    if opened.keep_cache {
        flags |= fuser::consts::FOPEN_KEEP_CACHE;
    }
    if opened.nonseekable {
        flags |= fuser::consts::FOPEN_NONSEEKABLE;
    }
    flags
}

fn set_time(time: Option<TimeOrNow>) -> SetTime {
    match time {
        None => SetTime::Omit,
        Some(TimeOrNow::Now) => SetTime::Now,
        Some(TimeOrNow::SpecificTime(at)) => SetTime::At(Timespec::from(at)),
    }
}

fn lock_kind(typ: i32) -> Result<LockKind, c_int> {
    match typ {
        libc::F_RDLCK => Ok(LockKind::Read),
        libc::F_WRLCK => Ok(LockKind::Write),
        libc::F_UNLCK => Ok(LockKind::Unlock),
        _ => Err(libc::EINVAL),
    }
}

/// Converts the kernel's inclusive `[start, end]` range into a lock record.
fn kernel_lock(start: u64, end: u64, typ: i32, pid: u32) -> Result<Flock, c_int> {
    let len = if end >= OFFSET_MAX {
        0
    } else {
        end.checked_sub(start).map(|span| span + 1).ok_or(libc::EINVAL)?
    };
    Ok(Flock {
        kind: lock_kind(typ)?,
        whence: Whence::Set,
        start: i64::try_from(start).map_err(|_| libc::EINVAL)?,
        len: i64::try_from(len).map_err(|_| libc::EINVAL)?,
        pid: i32::try_from(pid).unwrap_or(0),
    })
}

fn size_arg(size: u64) -> Result<i64, c_int> {
    i64::try_from(size).map_err(|_| libc::EFBIG)
}

impl fuser::Filesystem for PathBridge {
    fn init(&mut self, _req: &fuser::Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        if let Err(nearest) = config.set_max_write(self.conn.max_write) {
            warn!(
                target: "pathfs::kernel",
                wanted = self.conn.max_write,
                nearest,
                "Kernel limited max_write"
            );
        }
        if let Err(nearest) = config.set_max_readahead(self.conn.max_readahead) {
            warn!(
                target: "pathfs::kernel",
                wanted = self.conn.max_readahead,
                nearest,
                "Kernel limited max_readahead"
            );
        }
        debug!(target: "pathfs::kernel", "Kernel connection initialized");
        Ok(())
    }

    /// The kernel session ended, from our unmount or an external one.
    fn destroy(&mut self) {
        debug!(target: "pathfs::kernel", "Kernel session ended");
        self.queue.exit();
    }

    fn lookup(&mut self, req: &fuser::Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.child(parent, name).and_then(|path| self.entry(req, &path));
        reply_entry(reply, result);
    }

    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.inodes().forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &fuser::Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        match self.path(ino).and_then(|path| self.attr(req, &path, fh)) {
            Ok(stat) => reply.attr(&TTL, &file_attr(ino, &stat)),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = self.path(ino).and_then(|path| {
            if let Some(mode) = mode {
                self.ok(req, Request::Chmod { path: path.clone(), mode })?;
            }
            if uid.is_some() || gid.is_some() {
                self.ok(req, Request::Chown { path: path.clone(), uid, gid })?;
            }
            if let Some(size) = size {
                let size = size_arg(size)?;
                let request = match fh {
                    Some(fh) => Request::Ftruncate { path: path.clone(), size, fh },
                    None => Request::Truncate { path: path.clone(), size },
                };
                self.ok(req, request)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.ok(
                    req,
                    Request::Utimens {
                        path: path.clone(),
                        atime: set_time(atime),
                        mtime: set_time(mtime),
                    },
                )?;
            }
            self.attr(req, &path, fh)
        });
        match result {
            Ok(stat) => reply.attr(&TTL, &file_attr(ino, &stat)),
            Err(code) => reply.error(code),
        }
    }

    fn readlink(&mut self, req: &fuser::Request<'_>, ino: u64, reply: ReplyData) {
        let result = self.path(ino).and_then(|path| {
            match self.call(req, Request::Readlink { path, size: PATH_MAX }) {
                Reply::Data(target) => Ok(target),
                other => Err(errno(&other)),
            }
        });
        match result {
            Ok(target) => reply.data(&target),
            Err(code) => reply.error(code),
        }
    }

    fn mknod(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child(parent, name).and_then(|path| {
            self.ok(
                req,
                Request::Mknod {
                    path: path.clone(),
                    mode,
                    rdev: rdev.into(),
                },
            )?;
            self.entry(req, &path)
        });
        reply_entry(reply, result);
    }

    fn mkdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child(parent, name).and_then(|path| {
            self.ok(req, Request::Mkdir { path: path.clone(), mode })?;
            self.entry(req, &path)
        });
        reply_entry(reply, result);
    }

    fn unlink(&mut self, req: &fuser::Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child(parent, name).and_then(|path| {
            self.ok(req, Request::Unlink { path: path.clone() })?;
            self.inodes().remove(&path);
            Ok(())
        });
        reply_empty(reply, result);
    }

    fn rmdir(&mut self, req: &fuser::Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child(parent, name).and_then(|path| {
            self.ok(req, Request::Rmdir { path: path.clone() })?;
            self.inodes().remove(&path);
            Ok(())
        });
        reply_empty(reply, result);
    }

    fn symlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.child(parent, link_name).and_then(|link| {
            self.ok(
                req,
                Request::Symlink {
                    target: target.to_path_buf(),
                    link: link.clone(),
                },
            )?;
            self.entry(req, &link)
        });
        reply_entry(reply, result);
    }

    fn rename(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let result = self
            .child(parent, name)
            .and_then(|from| Ok((from, self.child(newparent, newname)?)))
            .and_then(|(from, to)| {
                self.ok(
                    req,
                    Request::Rename {
                        from: from.clone(),
                        to: to.clone(),
                    },
                )?;
                self.inodes().rename(&from, &to);
                Ok(())
            });
        reply_empty(reply, result);
    }

    fn link(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self
            .path(ino)
            .and_then(|from| Ok((from, self.child(newparent, newname)?)))
            .and_then(|(from, to)| {
                self.ok(req, Request::Link { from, to: to.clone() })?;
                self.entry(req, &to)
            });
        reply_entry(reply, result);
    }

    fn open(&mut self, req: &fuser::Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self
            .path(ino)
            .and_then(|path| self.opened(req, Request::Open { path, flags }));
        match result {
            Ok(opened) => reply.opened(opened.fh, open_flags(&opened)),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.path(ino).and_then(|path| {
            let request = Request::Read {
                path,
                size: size as usize,
                offset,
                fh,
            };
            match self.call(req, request) {
                Reply::Data(data) => Ok(data),
                other => Err(errno(&other)),
            }
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.path(ino).and_then(|path| {
            let request = Request::Write {
                path,
                data: data.to_vec(),
                offset,
                fh,
            };
            match self.call(req, request) {
                Reply::Written(n) => u32::try_from(n).map_err(|_| libc::EIO),
                other => Err(errno(&other)),
            }
        });
        match result {
            Ok(written) => reply.written(written),
            Err(code) => reply.error(code),
        }
    }

    fn flush(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let result = self
            .path(ino)
            .and_then(|path| self.ok(req, Request::Flush { path, fh }));
        reply_empty(reply, result);
    }

    fn release(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // The inode may already be forgotten after an unlink; the handle
        // still has to be released.
        let path = self.path(ino).unwrap_or_default();
        reply_empty(reply, self.ok(req, Request::Release { path, fh, flags }));
    }

    fn fsync(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let result = self
            .path(ino)
            .and_then(|path| self.ok(req, Request::Fsync { path, datasync, fh }));
        reply_empty(reply, result);
    }

    fn opendir(&mut self, req: &fuser::Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self
            .path(ino)
            .and_then(|path| self.opened(req, Request::Opendir { path, flags }));
        match result {
            Ok(opened) => reply.opened(opened.fh, open_flags(&opened)),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let request = Request::Readdir {
            path: path.clone(),
            offset,
            fh,
            capacity: self.dir_capacity,
        };
        let listing = match self.call(req, request) {
            Reply::Entries(listing) => listing,
            other => {
                reply.error(errno(&other));
                return;
            }
        };

        let inodes = self.inodes();
        let parent = path
            .parent()
            .and_then(|dir| inodes.inode(dir))
            .unwrap_or(ROOT_INODE);
        for entry in listing.entries {
            let entry_ino = if entry.name == "." {
                ino
            } else if entry.name == ".." {
                parent
            } else {
                inodes.listed(&path.join(&entry.name))
            };
            let kind = entry.stat.map_or(FileType::RegularFile, |stat| file_type(stat.mode));
            if reply.add(entry_ino, entry.offset, kind, &entry.name) {
                break;
            }
        }
        drop(inodes);
        reply.ok();
    }

    fn releasedir(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        let path = self.path(ino).unwrap_or_default();
        reply_empty(reply, self.ok(req, Request::Releasedir { path, fh }));
    }

    fn fsyncdir(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let result = self
            .path(ino)
            .and_then(|path| self.ok(req, Request::Fsyncdir { path, datasync, fh }));
        reply_empty(reply, result);
    }

    fn statfs(&mut self, req: &fuser::Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.path(ino).unwrap_or_else(|_| PathBuf::from("/"));
        match self.call(req, Request::Statfs { path }) {
            Reply::Statfs(st) => reply.statfs(
                st.blocks,
                st.bfree,
                st.bavail,
                st.files,
                st.ffree,
                u32::try_from(st.bsize).unwrap_or(u32::MAX),
                u32::try_from(st.namemax).unwrap_or(u32::MAX),
                u32::try_from(st.frsize).unwrap_or(u32::MAX),
            ),
            other => reply.error(errno(&other)),
        }
    }

    fn setxattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.path(ino).and_then(|path| {
            let request = Request::Setxattr {
                path,
                name: name.to_os_string(),
                value: value.to_vec(),
                flags,
            };
            self.ok(req, request)
        });
        reply_empty(reply, result);
    }

    fn getxattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let result = self.path(ino).map(|path| {
            let request = Request::Getxattr {
                path,
                name: name.to_os_string(),
                size: size as usize,
            };
            self.call(req, request)
        });
        reply_xattr(reply, result);
    }

    fn listxattr(&mut self, req: &fuser::Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self.path(ino).map(|path| {
            self.call(
                req,
                Request::Listxattr {
                    path,
                    size: size as usize,
                },
            )
        });
        reply_xattr(reply, result);
    }

    fn removexattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        reply: ReplyEmpty,
    ) {
        let result = self.path(ino).and_then(|path| {
            self.ok(
                req,
                Request::Removexattr {
                    path,
                    name: name.to_os_string(),
                },
            )
        });
        reply_empty(reply, result);
    }

    fn access(&mut self, req: &fuser::Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let result = self
            .path(ino)
            .and_then(|path| self.ok(req, Request::Access { path, mask }));
        reply_empty(reply, result);
    }

    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.child(parent, name).and_then(|path| {
            let opened = self.opened(
                req,
                Request::Create {
                    path: path.clone(),
                    mode,
                    flags,
                },
            )?;
            Ok((self.entry(req, &path)?, opened))
        });
        match result {
            Ok((attr, opened)) => reply.created(&TTL, &attr, 0, opened.fh, open_flags(&opened)),
            Err(code) => reply.error(code),
        }
    }

    fn getlk(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let result = self.path(ino).and_then(|path| {
            let lock = kernel_lock(start, end, typ, pid)?;
            let request = Request::Lock {
                path,
                fh,
                cmd: LockCommand::GetLock,
                lock,
            };
            match self.call(req, request) {
                Reply::Lock(lock) => Ok(lock),
                other => Err(errno(&other)),
            }
        });
        match result {
            Ok(lock) => {
                let start = u64::try_from(lock.start).unwrap_or(0);
                let end = match u64::try_from(lock.len) {
                    Ok(len) if len > 0 => start + len - 1,
                    _ => OFFSET_MAX,
                };
                let typ = match lock.kind {
                    LockKind::Read => libc::F_RDLCK,
                    LockKind::Write => libc::F_WRLCK,
                    LockKind::Unlock => libc::F_UNLCK,
                };
                reply.locked(start, end, typ, u32::try_from(lock.pid).unwrap_or(0));
            }
            Err(code) => reply.error(code),
        }
    }

    fn setlk(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let result = self.path(ino).and_then(|path| {
            let cmd = if sleep {
                LockCommand::SetLockWait
            } else {
                LockCommand::SetLock
            };
            let lock = kernel_lock(start, end, typ, pid)?;
            match self.call(req, Request::Lock { path, fh, cmd, lock }) {
                Reply::Lock(_) => Ok(()),
                other => Err(errno(&other)),
            }
        });
        reply_empty(reply, result);
    }

    fn bmap(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        blocksize: u32,
        idx: u64,
        reply: ReplyBmap,
    ) {
        let result = self.path(ino).map(|path| {
            let request = Request::Bmap {
                path,
                blocksize: blocksize as usize,
                index: idx,
            };
            self.call(req, request)
        });
        match result {
            Ok(Reply::Block(block)) => reply.bmap(block),
            Ok(other) => reply.error(errno(&other)),
            Err(code) => reply.error(code),
        }
    }
}

fn reply_xattr(reply: ReplyXattr, result: Result<Reply, c_int>) {
    match result {
        Ok(Reply::Size(size)) => reply.size(u32::try_from(size).unwrap_or(u32::MAX)),
        Ok(Reply::Data(data)) => reply.data(&data),
        Ok(other) => reply.error(errno(&other)),
        Err(code) => reply.error(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_map_to_kernel_mount_options() {
        let args = MountArgs::parse([
            "-o",
            "fsname=memfs,subtype=pathfs,ro,allow_other,debug,max_read=4096",
        ])
        .unwrap();
        assert_eq!(
            mount_options(&args),
            vec![
                MountOption::FSName("memfs".into()),
                MountOption::Subtype("pathfs".into()),
                MountOption::RO,
                MountOption::AllowOther,
                MountOption::CUSTOM("max_read=4096".into()),
            ]
        );
    }

    #[test]
    fn kernel_lock_ranges_are_inclusive() {
        let lock = kernel_lock(10, 19, libc::F_WRLCK, 7).unwrap();
        assert_eq!((lock.start, lock.len, lock.kind), (10, 10, LockKind::Write));
        let whole = kernel_lock(0, OFFSET_MAX, libc::F_RDLCK, 7).unwrap();
        assert_eq!(whole.len, 0);
        assert_eq!(kernel_lock(5, 1, libc::F_RDLCK, 7), Err(libc::EINVAL));
        assert_eq!(kernel_lock(0, 1, 99, 7), Err(libc::EINVAL));
    }

    #[test]
    fn destroy_ends_the_serving_loop() {
        let queue = Arc::new(RequestQueue::new().unwrap());
        let channel = Channel::new(
            Arc::clone(&queue),
            NativeCaller::new(RawOperations::default(), UserData::null()),
        );
        let serving = std::thread::spawn(move || channel.run());
        let mut bridge = PathBridge {
            queue: Arc::clone(&queue),
            inodes: Arc::new(Mutex::new(InodeTable::new())),
            conn: KERNEL_CONN,
            dir_capacity: DEFAULT_DIR_BUFFER,
        };

        fuser::Filesystem::destroy(&mut bridge);
        serving.join().unwrap().unwrap();
        assert!(queue.exited());
        let late = queue.submit(Caller::default(), Request::Getattr { path: PathBuf::from("/") });
        assert_eq!(late.recv().unwrap(), Reply::Error(libc::ENOTCONN));
    }

    #[test]
    fn attributes_follow_the_mode_bits() {
        let mut stat = Stat::with_kind(S_IFLNK, 0o777);
        stat.nlink = 1;
        stat.size = 6;
        let attr = file_attr(42, &stat);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.kind, FileType::Symlink);
        assert_eq!(attr.perm, 0o777);
        assert_eq!(set_time(None), SetTime::Omit);
        assert_eq!(set_time(Some(TimeOrNow::Now)), SetTime::Now);
    }
}
