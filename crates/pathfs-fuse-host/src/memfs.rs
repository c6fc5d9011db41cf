// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory sample filesystem.
//!
//! Nodes live in an inode table; paths map to inode numbers so hard links
//! share one node. Open files keep their node alive after unlink through the
//! [`OpenFile`] payload stored in the handle.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

use pathfs_core::driver::request::Caller;
use pathfs_core::{
    ConnInfo, Context, DirFiller, Filesystem, Flock, FsError, FsResult, Handle, LockCommand,
    LockKind, OperationSet, SetTime, Stat, StatVfs, Timespec, Whence, S_IFDIR, S_IFLNK,
    S_IFMT, S_IFREG,
};
use tracing::{debug, info};

const BLOCK_SIZE: u64 = 4096;
const NAME_MAX: usize = 255;
const ROOT_INO: u64 = 1;
const ST_RDONLY: u64 = 1;

/// Source of timestamps for new and modified nodes.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send {
    fn now(&self) -> Timespec;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timespec {
        Timespec::now()
    }
}

/// Limits reported by `statfs` and enforced on writes and node creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub bytes: u64,
    pub nodes: u64,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            bytes: 64 * 1024 * 1024,
            nodes: 65_536,
        }
    }
}

#[derive(Debug)]
enum Content {
    Directory,
    File(Vec<u8>),
    Symlink(PathBuf),
    Special,
}

#[derive(Debug)]
struct Node {
    stat: Stat,
    content: Content,
    xattrs: BTreeMap<OsString, Vec<u8>>,
    open: usize,
}

impl Node {
    fn data(&self) -> FsResult<&Vec<u8>> {
        match &self.content {
            Content::File(data) => Ok(data),
            Content::Directory => Err(FsError::IsADirectory),
            Content::Symlink(_) | Content::Special => Err(FsError::InvalidArgument),
        }
    }
}

/// State carried in the handle of every open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    pub ino: u64,
    pub append: bool,
}

/// A byte-range lock; `end` is exclusive and `None` extends to end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordLock {
    ino: u64,
    pid: i32,
    kind: LockKind,
    start: i64,
    end: Option<i64>,
}

impl RecordLock {
    fn overlaps(&self, other: &RecordLock) -> bool {
        self.start < other.end.unwrap_or(i64::MAX) && other.start < self.end.unwrap_or(i64::MAX)
    }

    /// The parts of `self` left after removing `other`'s range.
    fn subtract(&self, other: &RecordLock) -> Vec<RecordLock> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut rest = Vec::new();
        if self.start < other.start {
            rest.push(RecordLock {
                end: Some(other.start),
                ..*self
            });
        }
        if let Some(other_end) = other.end {
            if self.end.map_or(true, |end| end > other_end) {
                rest.push(RecordLock {
                    start: other_end,
                    ..*self
                });
            }
        }
        rest
    }
}

pub struct MemFs<C: Clock = SystemClock> {
    entries: BTreeMap<PathBuf, u64>,
    nodes: HashMap<u64, Node>,
    locks: Vec<RecordLock>,
    next_ino: u64,
    clock: C,
    capacity: Capacity,
    read_only: bool,
    conn: Option<ConnInfo>,
}

impl MemFs<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemFs<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> fmt::Debug for MemFs<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemFs")
            .field("entries", &self.entries.len())
            .field("nodes", &self.nodes.len())
            .field("locks", &self.locks.len())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl<C: Clock> MemFs<C> {
    /// An empty tree owned by the current process.
    pub fn with_clock(clock: C) -> Self {
        let now = clock.now();
        let owner = Caller::current();
        let mut root = Stat::directory(0o755);
        root.ino = ROOT_INO;
        root.nlink = 2;
        root.uid = owner.uid;
        root.gid = owner.gid;
        root.blksize = BLOCK_SIZE;
        root.atime = now;
        root.mtime = now;
        root.ctime = now;

        let mut fs = Self {
            entries: BTreeMap::new(),
            nodes: HashMap::new(),
            locks: Vec::new(),
            next_ino: ROOT_INO + 1,
            clock,
            capacity: Capacity::default(),
            read_only: false,
            conn: None,
        };
        fs.entries.insert(PathBuf::from("/"), ROOT_INO);
        fs.nodes.insert(
            ROOT_INO,
            Node {
                stat: root,
                content: Content::Directory,
                xattrs: BTreeMap::new(),
                open: 0,
            },
        );
        fs
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Number of live nodes, including unlinked ones that are still open.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Connection parameters seen by `init`.
    pub fn conn(&self) -> Option<&ConnInfo> {
        self.conn.as_ref()
    }

    fn ino(&self, path: &Path) -> FsResult<u64> {
        self.entries.get(path).copied().ok_or(FsError::NotFound)
    }

    fn node(&self, ino: u64) -> FsResult<&Node> {
        self.nodes.get(&ino).ok_or(FsError::NotFound)
    }

    fn node_mut(&mut self, ino: u64) -> FsResult<&mut Node> {
        self.nodes.get_mut(&ino).ok_or(FsError::NotFound)
    }

    fn lookup(&self, path: &Path) -> FsResult<&Node> {
        self.node(self.ino(path)?)
    }

    fn lookup_mut(&mut self, path: &Path) -> FsResult<&mut Node> {
        let ino = self.ino(path)?;
        self.node_mut(ino)
    }

    /// The handle's node when one is attached, else the node at `path`.
    fn target(&self, path: &Path, handle: Option<&Handle>) -> FsResult<u64> {
        match handle.and_then(|h| h.payload::<OpenFile>()) {
            Some(open) => Ok(open.ino),
            None => self.ino(path),
        }
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn check_name(path: &Path) -> FsResult<&OsStr> {
        let name = path.file_name().ok_or(FsError::InvalidArgument)?;
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        Ok(name)
    }

    fn parent_dir(&self, path: &Path) -> FsResult<u64> {
        let parent = path.parent().ok_or(FsError::InvalidArgument)?;
        let ino = self.ino(parent)?;
        match self.node(ino)?.content {
            Content::Directory => Ok(ino),
            _ => Err(FsError::NotADirectory),
        }
    }

    fn children<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = (&'a PathBuf, u64)> + 'a {
        self.entries
            .iter()
            .filter(move |(path, _)| path.parent() == Some(dir))
            .map(|(path, ino)| (path, *ino))
    }

    fn used_bytes(&self) -> u64 {
        self.nodes
            .values()
            .filter_map(|node| node.data().ok())
            .map(|data| data.len() as u64)
            .sum()
    }

    fn touch_dir(&mut self, ino: u64, now: Timespec) {
        if let Some(dir) = self.nodes.get_mut(&ino) {
            dir.stat.mtime = now;
            dir.stat.ctime = now;
        }
    }

    /// Adds a new node at `path` owned by the caller.
    fn insert(
        &mut self,
        cx: &Context<'_>,
        path: &Path,
        mut stat: Stat,
        content: Content,
    ) -> FsResult<u64> {
        self.check_writable()?;
        Self::check_name(path)?;
        let parent = self.parent_dir(path)?;
        if self.entries.contains_key(path) {
            return Err(FsError::AlreadyExists);
        }
        if self.nodes.len() as u64 >= self.capacity.nodes {
            return Err(FsError::NoSpace);
        }

        let now = self.clock.now();
        let ino = self.next_ino;
        self.next_ino += 1;
        let is_dir = matches!(content, Content::Directory);
        stat.ino = ino;
        stat.nlink = if is_dir { 2 } else { 1 };
        stat.uid = cx.uid();
        stat.gid = cx.gid();
        stat.blksize = BLOCK_SIZE;
        stat.atime = now;
        stat.mtime = now;
        stat.ctime = now;

        self.nodes.insert(
            ino,
            Node {
                stat,
                content,
                xattrs: BTreeMap::new(),
                open: 0,
            },
        );
        self.entries.insert(path.to_path_buf(), ino);
        self.touch_dir(parent, now);
        if is_dir {
            if let Some(dir) = self.nodes.get_mut(&parent) {
                dir.stat.nlink += 1;
            }
        }
        debug!(target: "pathfs::memfs", path = %path.display(), ino, "Node created");
        Ok(ino)
    }

    /// Removes the name at `path`; the node goes once no name or open
    /// handle refers to it.
    fn detach(&mut self, path: &Path) -> FsResult<()> {
        let parent = self.parent_dir(path)?;
        let ino = self.entries.remove(path).ok_or(FsError::NotFound)?;
        let now = self.clock.now();
        self.touch_dir(parent, now);

        let node = self.node_mut(ino)?;
        let is_dir = matches!(node.content, Content::Directory);
        node.stat.nlink = if is_dir { 0 } else { node.stat.nlink.saturating_sub(1) };
        node.stat.ctime = now;
        if is_dir {
            if let Some(dir) = self.nodes.get_mut(&parent) {
                dir.stat.nlink = dir.stat.nlink.saturating_sub(1);
            }
        }
        self.collect(ino);
        Ok(())
    }

    fn collect(&mut self, ino: u64) {
        let unused = self
            .nodes
            .get(&ino)
            .is_some_and(|node| node.stat.nlink == 0 && node.open == 0);
        if unused {
            self.nodes.remove(&ino);
            self.locks.retain(|lock| lock.ino != ino);
            debug!(target: "pathfs::memfs", ino, "Node freed");
        }
    }

    fn resize(&mut self, ino: u64, size: u64) -> FsResult<()> {
        self.check_writable()?;
        let len = usize::try_from(size).map_err(|_| FsError::NoSpace)?;
        let current = self.node(ino)?.data()?.len() as u64;
        if size > current && self.used_bytes() - current + size > self.capacity.bytes {
            return Err(FsError::NoSpace);
        }
        let now = self.clock.now();
        let node = self.node_mut(ino)?;
        if let Content::File(data) = &mut node.content {
            data.resize(len, 0);
        }
        set_size(&mut node.stat, size);
        node.stat.mtime = now;
        node.stat.ctime = now;
        Ok(())
    }

    fn open_node(&mut self, ino: u64, handle: &mut Handle) -> FsResult<()> {
        if handle.access_mode() != libc::O_RDONLY {
            self.check_writable()?;
        }
        if matches!(self.node(ino)?.content, Content::Directory) {
            return Err(FsError::IsADirectory);
        }
        if handle.flags() & libc::O_TRUNC != 0 {
            self.resize(ino, 0)?;
        }
        self.node_mut(ino)?.open += 1;
        handle.set_payload(OpenFile {
            ino,
            append: handle.flags() & libc::O_APPEND != 0,
        });
        Ok(())
    }

    fn conflicting(&self, wanted: &RecordLock) -> Option<&RecordLock> {
        self.locks.iter().find(|held| {
            held.ino == wanted.ino
                && held.pid != wanted.pid
                && held.overlaps(wanted)
                && (held.kind == LockKind::Write || wanted.kind == LockKind::Write)
        })
    }
}

fn set_size(stat: &mut Stat, size: u64) {
    stat.size = size;
    stat.blocks = size.div_ceil(512);
}

impl<C: Clock> Filesystem for MemFs<C> {
    fn operations(&self) -> OperationSet {
        OperationSet::all()
    }

    fn init(&mut self, _cx: &Context<'_>, conn: &mut ConnInfo) -> FsResult<()> {
        info!(
            target: "pathfs::memfs",
            proto = %format!("{}.{}", conn.proto_major, conn.proto_minor),
            max_write = conn.max_write,
            read_only = self.read_only,
            "memfs initialized"
        );
        self.conn = Some(*conn);
        Ok(())
    }

    fn destroy(&mut self, _cx: &Context<'_>) {
        info!(
            target: "pathfs::memfs",
            entries = self.entries.len(),
            bytes = self.used_bytes(),
            "memfs destroyed"
        );
    }

    fn signal(&mut self, signal: i32) {
        if signal == libc::SIGHUP {
            info!(
                target: "pathfs::memfs",
                entries = self.entries.len(),
                nodes = self.nodes.len(),
                bytes = self.used_bytes(),
                byte_limit = self.capacity.bytes,
                locks = self.locks.len(),
                "memfs usage"
            );
        }
    }

    fn getattr(&mut self, _cx: &Context<'_>, path: &Path) -> FsResult<Option<Stat>> {
        Ok(self
            .entries
            .get(path)
            .and_then(|ino| self.nodes.get(ino))
            .map(|node| node.stat))
    }

    fn fgetattr(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        handle: Option<&mut Handle>,
    ) -> FsResult<Option<Stat>> {
        let ino = self.target(path, handle.as_deref())?;
        Ok(Some(self.node(ino)?.stat))
    }

    fn readlink(&mut self, _cx: &Context<'_>, path: &Path) -> FsResult<OsString> {
        match &self.lookup(path)?.content {
            Content::Symlink(target) => Ok(target.clone().into_os_string()),
            _ => Err(FsError::InvalidArgument),
        }
    }

    fn mknod(&mut self, cx: &Context<'_>, path: &Path, mode: u32, rdev: u64) -> FsResult<()> {
        let (kind, content) = match mode & S_IFMT {
            0 | S_IFREG => (S_IFREG, Content::File(Vec::new())),
            S_IFDIR | S_IFLNK => return Err(FsError::InvalidArgument),
            kind => (kind, Content::Special),
        };
        let mut stat = Stat::with_kind(kind, mode);
        stat.rdev = rdev;
        self.insert(cx, path, stat, content)?;
        Ok(())
    }

    fn mkdir(&mut self, cx: &Context<'_>, path: &Path, mode: u32) -> FsResult<()> {
        self.insert(cx, path, Stat::directory(mode), Content::Directory)?;
        Ok(())
    }

    fn unlink(&mut self, _cx: &Context<'_>, path: &Path) -> FsResult<()> {
        self.check_writable()?;
        if matches!(self.lookup(path)?.content, Content::Directory) {
            return Err(FsError::IsADirectory);
        }
        self.detach(path)
    }

    fn rmdir(&mut self, _cx: &Context<'_>, path: &Path) -> FsResult<()> {
        self.check_writable()?;
        let ino = self.ino(path)?;
        if ino == ROOT_INO {
            return Err(FsError::Busy);
        }
        if !matches!(self.node(ino)?.content, Content::Directory) {
            return Err(FsError::NotADirectory);
        }
        if self.children(path).next().is_some() {
            return Err(FsError::NotEmpty);
        }
        self.detach(path)
    }

    fn symlink(&mut self, cx: &Context<'_>, target: &Path, link: &Path) -> FsResult<()> {
        let mut stat = Stat::symlink(0o777);
        set_size(&mut stat, target.as_os_str().len() as u64);
        self.insert(cx, link, stat, Content::Symlink(target.to_path_buf()))?;
        Ok(())
    }

    fn rename(&mut self, _cx: &Context<'_>, from: &Path, to: &Path) -> FsResult<()> {
        self.check_writable()?;
        let ino = self.ino(from)?;
        if ino == ROOT_INO {
            return Err(FsError::Busy);
        }
        if from == to {
            return Ok(());
        }
        if to.starts_with(from) {
            return Err(FsError::InvalidArgument);
        }
        Self::check_name(to)?;
        let old_parent = self.parent_dir(from)?;
        let new_parent = self.parent_dir(to)?;
        let moving_dir = matches!(self.node(ino)?.content, Content::Directory);

        if let Some(existing) = self.entries.get(to).copied() {
            let replacing_dir = matches!(self.node(existing)?.content, Content::Directory);
            match (moving_dir, replacing_dir) {
                (true, false) => return Err(FsError::NotADirectory),
                (false, true) => return Err(FsError::IsADirectory),
                (true, true) if self.children(to).next().is_some() => {
                    return Err(FsError::NotEmpty)
                }
                _ => {}
            }
            self.detach(to)?;
        }

        let moved: Vec<(PathBuf, u64)> = self
            .entries
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            self.entries.remove(&old);
            let suffix = old.strip_prefix(from).map_err(FsError::other)?;
            let new = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            self.entries.insert(new, ino);
        }

        let now = self.clock.now();
        if moving_dir && old_parent != new_parent {
            if let Some(dir) = self.nodes.get_mut(&old_parent) {
                dir.stat.nlink = dir.stat.nlink.saturating_sub(1);
            }
            if let Some(dir) = self.nodes.get_mut(&new_parent) {
                dir.stat.nlink += 1;
            }
        }
        self.touch_dir(old_parent, now);
        self.touch_dir(new_parent, now);
        self.node_mut(ino)?.stat.ctime = now;
        Ok(())
    }

    fn link(&mut self, _cx: &Context<'_>, from: &Path, to: &Path) -> FsResult<()> {
        self.check_writable()?;
        let ino = self.ino(from)?;
        if matches!(self.node(ino)?.content, Content::Directory) {
            return Err(FsError::PermissionDenied);
        }
        Self::check_name(to)?;
        let parent = self.parent_dir(to)?;
        if self.entries.contains_key(to) {
            return Err(FsError::AlreadyExists);
        }
        let now = self.clock.now();
        self.entries.insert(to.to_path_buf(), ino);
        let node = self.node_mut(ino)?;
        node.stat.nlink += 1;
        node.stat.ctime = now;
        self.touch_dir(parent, now);
        Ok(())
    }

    fn chmod(&mut self, cx: &Context<'_>, path: &Path, mode: u32) -> FsResult<()> {
        self.check_writable()?;
        let now = self.clock.now();
        let node = self.lookup_mut(path)?;
        if cx.uid() != 0 && cx.uid() != node.stat.uid {
            return Err(FsError::PermissionDenied);
        }
        node.stat.mode = (node.stat.mode & S_IFMT) | (mode & 0o7777);
        node.stat.ctime = now;
        Ok(())
    }

    fn chown(
        &mut self,
        cx: &Context<'_>,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        self.check_writable()?;
        let now = self.clock.now();
        let node = self.lookup_mut(path)?;
        let caller = cx.uid();
        if caller != 0 {
            let changes_owner = uid.is_some_and(|uid| uid != node.stat.uid);
            if changes_owner || caller != node.stat.uid {
                return Err(FsError::PermissionDenied);
            }
        }
        if let Some(uid) = uid {
            node.stat.uid = uid;
        }
        if let Some(gid) = gid {
            node.stat.gid = gid;
        }
        node.stat.ctime = now;
        Ok(())
    }

    fn truncate(&mut self, _cx: &Context<'_>, path: &Path, size: u64) -> FsResult<()> {
        let ino = self.ino(path)?;
        self.resize(ino, size)
    }

    fn ftruncate(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        size: u64,
        handle: Option<&mut Handle>,
    ) -> FsResult<()> {
        let ino = self.target(path, handle.as_deref())?;
        self.resize(ino, size)
    }

    fn utime(&mut self, cx: &Context<'_>, path: &Path, atime: i64, mtime: i64) -> FsResult<()> {
        self.utimens(
            cx,
            path,
            SetTime::At(Timespec::new(atime, 0)),
            SetTime::At(Timespec::new(mtime, 0)),
        )
    }

    fn utimens(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        atime: SetTime,
        mtime: SetTime,
    ) -> FsResult<()> {
        self.check_writable()?;
        let now = self.clock.now();
        let node = self.lookup_mut(path)?;
        if let Some(atime) = atime.resolve(now) {
            node.stat.atime = atime;
        }
        if let Some(mtime) = mtime.resolve(now) {
            node.stat.mtime = mtime;
        }
        node.stat.ctime = now;
        Ok(())
    }

    fn open(&mut self, _cx: &Context<'_>, path: &Path, handle: &mut Handle) -> FsResult<()> {
        let ino = self.ino(path)?;
        self.open_node(ino, handle)
    }

    fn create(
        &mut self,
        cx: &Context<'_>,
        path: &Path,
        mode: u32,
        handle: &mut Handle,
    ) -> FsResult<()> {
        let ino = self.insert(cx, path, Stat::file(mode), Content::File(Vec::new()))?;
        self.open_node(ino, handle)
    }

    fn read(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        size: usize,
        offset: u64,
        handle: Option<&mut Handle>,
    ) -> FsResult<Vec<u8>> {
        let ino = self.target(path, handle.as_deref())?;
        let data = self.node(ino)?.data()?;
        let start = usize::try_from(offset).map_or(data.len(), |o| o.min(data.len()));
        let end = start.saturating_add(size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        bytes: &[u8],
        offset: u64,
        handle: Option<&mut Handle>,
    ) -> FsResult<usize> {
        self.check_writable()?;
        let append = handle
            .as_deref()
            .and_then(|h| h.payload::<OpenFile>())
            .is_some_and(|open| open.append);
        let ino = self.target(path, handle.as_deref())?;
        let current = self.node(ino)?.data()?.len();
        let start = if append {
            current
        } else {
            usize::try_from(offset).map_err(|_| FsError::InvalidArgument)?
        };
        let end = start.checked_add(bytes.len()).ok_or(FsError::InvalidArgument)?;
        if end > current && self.used_bytes() - current as u64 + end as u64 > self.capacity.bytes {
            return Err(FsError::NoSpace);
        }

        let now = self.clock.now();
        let node = self.node_mut(ino)?;
        if let Content::File(data) = &mut node.content {
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(bytes);
            let len = data.len() as u64;
            set_size(&mut node.stat, len);
        }
        node.stat.mtime = now;
        node.stat.ctime = now;
        Ok(bytes.len())
    }

    fn statfs(&mut self, _cx: &Context<'_>, _path: &Path) -> FsResult<Option<StatVfs>> {
        let blocks = self.capacity.bytes / BLOCK_SIZE;
        let free = blocks.saturating_sub(self.used_bytes().div_ceil(BLOCK_SIZE));
        let files_free = self.capacity.nodes.saturating_sub(self.nodes.len() as u64);
        Ok(Some(StatVfs {
            bsize: BLOCK_SIZE,
            frsize: BLOCK_SIZE,
            blocks,
            bfree: free,
            bavail: free,
            files: self.capacity.nodes,
            ffree: files_free,
            favail: files_free,
            fsid: 0,
            flag: if self.read_only { ST_RDONLY } else { 0 },
            namemax: NAME_MAX as u64,
        }))
    }

    fn flush(&mut self, _cx: &Context<'_>, path: &Path, handle: Option<&mut Handle>) -> FsResult<()> {
        self.target(path, handle.as_deref()).map(drop)
    }

    fn release(&mut self, cx: &Context<'_>, _path: &Path, handle: Option<Handle>) -> FsResult<()> {
        let Some(open) = handle.and_then(|mut h| h.take_payload::<OpenFile>()) else {
            return Ok(());
        };
        let pid = cx.pid();
        self.locks.retain(|lock| !(lock.ino == open.ino && lock.pid == pid));
        if let Some(node) = self.nodes.get_mut(&open.ino) {
            node.open = node.open.saturating_sub(1);
        }
        self.collect(open.ino);
        Ok(())
    }

    fn fsync(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        _datasync: bool,
        handle: Option<&mut Handle>,
    ) -> FsResult<()> {
        self.target(path, handle.as_deref()).map(drop)
    }

    fn setxattr(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> FsResult<()> {
        self.check_writable()?;
        let now = self.clock.now();
        let node = self.lookup_mut(path)?;
        let exists = node.xattrs.contains_key(name);
        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(FsError::AlreadyExists);
        }
        if flags & libc::XATTR_REPLACE != 0 && !exists {
            return Err(FsError::NoData);
        }
        node.xattrs.insert(name.to_os_string(), value.to_vec());
        node.stat.ctime = now;
        Ok(())
    }

    fn getxattr(&mut self, _cx: &Context<'_>, path: &Path, name: &OsStr) -> FsResult<Vec<u8>> {
        self.lookup(path)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or(FsError::NoData)
    }

    fn listxattr(&mut self, _cx: &Context<'_>, path: &Path) -> FsResult<Vec<OsString>> {
        Ok(self.lookup(path)?.xattrs.keys().cloned().collect())
    }

    fn removexattr(&mut self, _cx: &Context<'_>, path: &Path, name: &OsStr) -> FsResult<()> {
        self.check_writable()?;
        let now = self.clock.now();
        let node = self.lookup_mut(path)?;
        node.xattrs.remove(name).ok_or(FsError::NoData)?;
        node.stat.ctime = now;
        Ok(())
    }

    fn opendir(&mut self, _cx: &Context<'_>, path: &Path, _handle: &mut Handle) -> FsResult<()> {
        match self.lookup(path)?.content {
            Content::Directory => Ok(()),
            _ => Err(FsError::NotADirectory),
        }
    }

    fn readdir(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        filler: &mut DirFiller<'_>,
        offset: u64,
        _handle: Option<&mut Handle>,
    ) -> FsResult<()> {
        let dir = self.lookup(path)?;
        if !matches!(dir.content, Content::Directory) {
            return Err(FsError::NotADirectory);
        }
        let parent = path
            .parent()
            .and_then(|p| self.entries.get(p))
            .and_then(|ino| self.nodes.get(ino))
            .map_or(dir.stat, |node| node.stat);
        let skip = usize::try_from(offset).map_err(|_| FsError::InvalidArgument)?;

        let dots = [
            (OsString::from("."), dir.stat),
            (OsString::from(".."), parent),
        ];
        let children = self.children(path).filter_map(|(child, ino)| {
            Some((child.file_name()?.to_os_string(), self.nodes.get(&ino)?.stat))
        });
        let entries = dots
            .into_iter()
            .chain(children)
            .enumerate()
            .skip(skip)
            .map(|(i, (name, stat))| (name, Some(stat), i as u64 + 1));
        filler.add_all(entries)?;
        Ok(())
    }

    fn releasedir(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _handle: Option<Handle>,
    ) -> FsResult<()> {
        Ok(())
    }

    fn fsyncdir(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        _datasync: bool,
        _handle: Option<&mut Handle>,
    ) -> FsResult<()> {
        self.ino(path).map(drop)
    }

    fn access(&mut self, cx: &Context<'_>, path: &Path, mask: i32) -> FsResult<()> {
        let stat = self.lookup(path)?.stat;
        if mask == libc::F_OK {
            return Ok(());
        }
        if mask & libc::W_OK != 0 && self.read_only {
            return Err(FsError::ReadOnly);
        }
        let wanted = u32::try_from(mask & 0o7).map_err(|_| FsError::InvalidArgument)?;
        if cx.uid() == 0 {
            let executable = stat.is_dir() || stat.mode & 0o111 != 0;
            return if wanted & 0o1 != 0 && !executable {
                Err(FsError::AccessDenied)
            } else {
                Ok(())
            };
        }
        let granted = if cx.uid() == stat.uid {
            (stat.mode >> 6) & 0o7
        } else if cx.gid() == stat.gid {
            (stat.mode >> 3) & 0o7
        } else {
            stat.mode & 0o7
        };
        if granted & wanted == wanted {
            Ok(())
        } else {
            Err(FsError::AccessDenied)
        }
    }

    fn lock(
        &mut self,
        cx: &Context<'_>,
        path: &Path,
        handle: Option<&mut Handle>,
        cmd: LockCommand,
        lock: &mut Flock,
    ) -> FsResult<()> {
        let ino = self.target(path, handle.as_deref())?;
        let size = i64::try_from(self.node(ino)?.stat.size).map_err(|_| FsError::InvalidArgument)?;
        let start = match lock.whence {
            Whence::Set | Whence::Current => lock.start,
            Whence::End => size + lock.start,
        };
        let end = match lock.len {
            0 => None,
            len if len > 0 => Some(start + len),
            _ => return Err(FsError::InvalidArgument),
        };
        if start < 0 {
            return Err(FsError::InvalidArgument);
        }
        let wanted = RecordLock {
            ino,
            pid: cx.pid(),
            kind: lock.kind,
            start,
            end,
        };

        match cmd {
            LockCommand::GetLock => {
                match self.conflicting(&wanted) {
                    Some(held) => {
                        *lock = Flock {
                            kind: held.kind,
                            whence: Whence::Set,
                            start: held.start,
                            len: held.end.map_or(0, |end| end - held.start),
                            pid: held.pid,
                        };
                    }
                    None => lock.kind = LockKind::Unlock,
                }
                Ok(())
            }
            // Waiting would stall the dispatch loop, so a blocking request
            // that conflicts fails like a non-blocking one.
            LockCommand::SetLock | LockCommand::SetLockWait => {
                if wanted.kind != LockKind::Unlock && self.conflicting(&wanted).is_some() {
                    return Err(FsError::Errno(libc::EAGAIN));
                }
                let mut kept = Vec::with_capacity(self.locks.len() + 1);
                for held in self.locks.drain(..) {
                    if held.ino == ino && held.pid == wanted.pid {
                        kept.extend(held.subtract(&wanted));
                    } else {
                        kept.push(held);
                    }
                }
                if wanted.kind != LockKind::Unlock {
                    kept.push(wanted);
                }
                self.locks = kept;
                Ok(())
            }
        }
    }

    fn bmap(&mut self, _cx: &Context<'_>, path: &Path, _blocksize: usize, index: u64) -> FsResult<u64> {
        self.lookup(path)?.data()?;
        Ok(index)
    }
}
