// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The interface a path-based filesystem implements.
//!
//! An implementation declares which operations it supports through
//! [`Filesystem::operations`]; only those are wired into the native table.
//! Every handler has a default body returning [`FsError::NotImplemented`].

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::Path;

use crate::attr::{ConnInfo, Flock, LockCommand, SetTime, Stat, StatVfs};
use crate::context::Context;
use crate::error::{FsError, FsResult};
use crate::filler::DirFiller;
use crate::handle::Handle;

macro_rules! operations {
    ($($variant:ident => $name:literal,)*) => {
        /// Every operation the dispatch table knows how to wire.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Operation {
            $($variant,)*
        }

        impl Operation {
            pub const ALL: &'static [Operation] = &[$(Operation::$variant,)*];

            pub const fn name(self) -> &'static str {
                match self {
                    $(Operation::$variant => $name,)*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Operation::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

operations! {
    Getattr => "getattr",
    Readlink => "readlink",
    Mknod => "mknod",
    Mkdir => "mkdir",
    Unlink => "unlink",
    Rmdir => "rmdir",
    Symlink => "symlink",
    Rename => "rename",
    Link => "link",
    Chmod => "chmod",
    Chown => "chown",
    Truncate => "truncate",
    Utime => "utime",
    Open => "open",
    Read => "read",
    Write => "write",
    Statfs => "statfs",
    Flush => "flush",
    Release => "release",
    Fsync => "fsync",
    Setxattr => "setxattr",
    Getxattr => "getxattr",
    Listxattr => "listxattr",
    Removexattr => "removexattr",
    Opendir => "opendir",
    Readdir => "readdir",
    Releasedir => "releasedir",
    Fsyncdir => "fsyncdir",
    Init => "init",
    Destroy => "destroy",
    Access => "access",
    Create => "create",
    Ftruncate => "ftruncate",
    Fgetattr => "fgetattr",
    Lock => "lock",
    Utimens => "utimens",
    Bmap => "bmap",
}

impl Operation {
    const fn bit(self) -> u64 {
        1 << (self as u32)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of operations, used to declare an implementation's capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OperationSet(u64);

impl OperationSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn of(ops: &[Operation]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < ops.len() {
            bits |= ops[i].bit();
            i += 1;
        }
        Self(bits)
    }

    pub fn all() -> Self {
        Self::of(Operation::ALL)
    }

    pub const fn with(self, op: Operation) -> Self {
        Self(self.0 | op.bit())
    }

    pub const fn without(self, op: Operation) -> Self {
        Self(self.0 & !op.bit())
    }

    pub fn insert(&mut self, op: Operation) {
        self.0 |= op.bit();
    }

    pub const fn contains(&self, op: Operation) -> bool {
        self.0 & op.bit() != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Operation> + '_ {
        Operation::ALL.iter().copied().filter(|op| self.contains(*op))
    }
}

impl FromIterator<Operation> for OperationSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        let mut set = Self::empty();
        for op in iter {
            set.insert(op);
        }
        set
    }
}

/// A high-level, path-based filesystem.
///
/// Handlers receive the caller's [`Context`] and the path inside the mount.
/// Returning `Err` with a coded [`FsError`] reports that code to the driver;
/// any other failure is logged and reported as the mount's default code.
pub trait Filesystem {
    /// The operations this implementation handles.
    fn operations(&self) -> OperationSet;

    /// `Ok(None)` is reported as `ENOENT`, exactly like `Err(FsError::NotFound)`.
    fn getattr(&mut self, _cx: &Context<'_>, _path: &Path) -> FsResult<Option<Stat>> {
        Err(FsError::NotImplemented)
    }

    /// Returns the link target; it is truncated to the caller's buffer.
    fn readlink(&mut self, _cx: &Context<'_>, _path: &Path) -> FsResult<OsString> {
        Err(FsError::NotImplemented)
    }

    fn mknod(&mut self, _cx: &Context<'_>, _path: &Path, _mode: u32, _rdev: u64) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn mkdir(&mut self, _cx: &Context<'_>, _path: &Path, _mode: u32) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn unlink(&mut self, _cx: &Context<'_>, _path: &Path) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn rmdir(&mut self, _cx: &Context<'_>, _path: &Path) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// Creates `link` pointing at `target`.
    fn symlink(&mut self, _cx: &Context<'_>, _target: &Path, _link: &Path) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn rename(&mut self, _cx: &Context<'_>, _from: &Path, _to: &Path) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn link(&mut self, _cx: &Context<'_>, _from: &Path, _to: &Path) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn chmod(&mut self, _cx: &Context<'_>, _path: &Path, _mode: u32) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// `None` leaves the corresponding id unchanged.
    fn chown(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _uid: Option<u32>,
        _gid: Option<u32>,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn truncate(&mut self, _cx: &Context<'_>, _path: &Path, _size: u64) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// Whole-second timestamps; prefer `utimens`.
    fn utime(&mut self, _cx: &Context<'_>, _path: &Path, _atime: i64, _mtime: i64) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// The handle is registered after this returns `Ok`; store per-open state
    /// with [`Handle::set_payload`].
    fn open(&mut self, _cx: &Context<'_>, _path: &Path, _handle: &mut Handle) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// Must return at most `size` bytes.
    fn read(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _size: usize,
        _offset: u64,
        _handle: Option<&mut Handle>,
    ) -> FsResult<Vec<u8>> {
        Err(FsError::NotImplemented)
    }

    /// Returns the number of bytes written.
    fn write(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _data: &[u8],
        _offset: u64,
        _handle: Option<&mut Handle>,
    ) -> FsResult<usize> {
        Err(FsError::NotImplemented)
    }

    fn statfs(&mut self, _cx: &Context<'_>, _path: &Path) -> FsResult<Option<StatVfs>> {
        Err(FsError::NotImplemented)
    }

    fn flush(&mut self, _cx: &Context<'_>, _path: &Path, _handle: Option<&mut Handle>) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// Receives the deregistered handle; it is dropped when this returns.
    fn release(&mut self, _cx: &Context<'_>, _path: &Path, _handle: Option<Handle>) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn fsync(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _datasync: bool,
        _handle: Option<&mut Handle>,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn setxattr(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// Returns the full value; size negotiation happens in the dispatcher.
    fn getxattr(&mut self, _cx: &Context<'_>, _path: &Path, _name: &OsStr) -> FsResult<Vec<u8>> {
        Err(FsError::NotImplemented)
    }

    fn listxattr(&mut self, _cx: &Context<'_>, _path: &Path) -> FsResult<Vec<OsString>> {
        Err(FsError::NotImplemented)
    }

    fn removexattr(&mut self, _cx: &Context<'_>, _path: &Path, _name: &OsStr) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn opendir(&mut self, _cx: &Context<'_>, _path: &Path, _handle: &mut Handle) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// Push entries starting after `offset`; stop once the filler reports full.
    fn readdir(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _filler: &mut DirFiller<'_>,
        _offset: u64,
        _handle: Option<&mut Handle>,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn releasedir(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _handle: Option<Handle>,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn fsyncdir(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _datasync: bool,
        _handle: Option<&mut Handle>,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// Called once when the session starts; changes to the negotiable
    /// connection fields are sent back to the driver.
    fn init(&mut self, _cx: &Context<'_>, _conn: &mut ConnInfo) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// Called once when the session ends.
    fn destroy(&mut self, _cx: &Context<'_>) {}

    /// Called from the mount loop for every signal raised on the mount's
    /// [`SignalQueue`](crate::SignalQueue). Not part of the callback table,
    /// so it needs no entry in [`operations`](Filesystem::operations).
    fn signal(&mut self, _signal: i32) {}

    fn access(&mut self, _cx: &Context<'_>, _path: &Path, _mask: i32) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn create(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _mode: u32,
        _handle: &mut Handle,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn ftruncate(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _size: u64,
        _handle: Option<&mut Handle>,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn fgetattr(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _handle: Option<&mut Handle>,
    ) -> FsResult<Option<Stat>> {
        Err(FsError::NotImplemented)
    }

    /// For [`LockCommand::GetLock`], overwrite `lock` with the conflicting
    /// lock or set its kind to unlock.
    fn lock(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _handle: Option<&mut Handle>,
        _cmd: LockCommand,
        _lock: &mut Flock,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    fn utimens(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _atime: SetTime,
        _mtime: SetTime,
    ) -> FsResult<()> {
        Err(FsError::NotImplemented)
    }

    /// Maps a file block index to a device block index.
    fn bmap(&mut self, _cx: &Context<'_>, _path: &Path, _blocksize: usize, _index: u64) -> FsResult<u64> {
        Err(FsError::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_round_trip() {
        assert_eq!(Operation::ALL.len(), 37);
        for op in Operation::ALL {
            assert_eq!(Operation::from_name(op.name()), Some(*op));
        }
        assert_eq!(Operation::from_name("getdir"), None);
    }

    #[test]
    fn operation_set_membership() {
        const READ_ONLY: OperationSet =
            OperationSet::of(&[Operation::Getattr, Operation::Open, Operation::Read]);
        assert!(READ_ONLY.contains(Operation::Read));
        assert!(!READ_ONLY.contains(Operation::Write));
        assert_eq!(READ_ONLY.len(), 3);
        let set = READ_ONLY.with(Operation::Release).without(Operation::Open);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![Operation::Getattr, Operation::Read, Operation::Release]
        );
        assert_eq!(OperationSet::all().len(), Operation::ALL.len());
        assert!(OperationSet::empty().is_empty());
    }
}
