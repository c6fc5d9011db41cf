// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Generic attribute records and their conversions to the native layouts.
//!
//! Native field widths differ between platforms (`nlink_t`, `blksize_t`,
//! `mode_t`), so every store goes through [`narrow`] and reports
//! [`MarshalError::OutOfRange`] instead of truncating.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libc::c_uint;

use crate::error::MarshalError;

const NANOS_PER_SEC: i128 = 1_000_000_000;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFIFO: u32 = 0o010000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFSOCK: u32 = 0o140000;

fn narrow<S, T>(field: &'static str, value: S) -> Result<T, MarshalError>
where
    S: Copy + Into<i128>,
    T: TryFrom<S>,
{
    T::try_from(value).map_err(|_| MarshalError::OutOfRange {
        field,
        value: value.into(),
    })
}

fn nanos<S>(value: S) -> Result<u32, MarshalError>
where
    S: Copy + Into<i128>,
    u32: TryFrom<S>,
{
    let wide = value.into();
    if !(0..NANOS_PER_SEC).contains(&wide) {
        return Err(MarshalError::InvalidNanos(wide));
    }
    narrow("nsec", value)
}

/// Seconds and nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    fn validate(&self) -> Result<(), MarshalError> {
        if i128::from(self.nsec) >= NANOS_PER_SEC {
            return Err(MarshalError::InvalidNanos(self.nsec.into()));
        }
        Ok(())
    }

    pub fn to_native(&self) -> Result<libc::timespec, MarshalError> {
        self.validate()?;
        // SAFETY: timespec is plain old data; all-zero is a valid value.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = narrow("tv_sec", self.sec)?;
        ts.tv_nsec = narrow("tv_nsec", self.nsec)?;
        Ok(ts)
    }

    pub fn from_native(ts: &libc::timespec) -> Result<Self, MarshalError> {
        Ok(Self {
            sec: narrow("tv_sec", ts.tv_sec)?,
            nsec: nanos(ts.tv_nsec)?,
        })
    }
}

impl From<SystemTime> for Timespec {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self {
                sec: i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
                nsec: after.subsec_nanos(),
            },
            Err(before) => {
                let before = before.duration();
                let secs = i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
                match before.subsec_nanos() {
                    0 => Self { sec: -secs, nsec: 0 },
                    n => Self {
                        sec: -secs - 1,
                        nsec: 1_000_000_000 - n,
                    },
                }
            }
        }
    }
}

impl From<Timespec> for SystemTime {
    fn from(ts: Timespec) -> Self {
        let nanos = Duration::from_nanos(u64::from(ts.nsec));
        if ts.sec >= 0 {
            UNIX_EPOCH + Duration::from_secs(ts.sec.unsigned_abs()) + nanos
        } else {
            UNIX_EPOCH - Duration::from_secs(ts.sec.unsigned_abs()) + nanos
        }
    }
}

/// File status, as returned by `getattr`/`fgetattr` and pushed to a directory filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl Stat {
    /// A record of the given file type; every other field is zero.
    pub fn with_kind(kind: u32, perm: u32) -> Self {
        Self {
            mode: (kind & S_IFMT) | (perm & 0o7777),
            ..Self::default()
        }
    }

    pub fn directory(perm: u32) -> Self {
        Self::with_kind(S_IFDIR, perm)
    }

    pub fn file(perm: u32) -> Self {
        Self::with_kind(S_IFREG, perm)
    }

    pub fn symlink(perm: u32) -> Self {
        Self::with_kind(S_IFLNK, perm)
    }

    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn to_native(&self, st: &mut libc::stat) -> Result<(), MarshalError> {
        self.atime.validate()?;
        self.mtime.validate()?;
        self.ctime.validate()?;
        st.st_dev = narrow("dev", self.dev)?;
        st.st_ino = narrow("ino", self.ino)?;
        st.st_mode = narrow("mode", self.mode)?;
        st.st_nlink = narrow("nlink", self.nlink)?;
        st.st_uid = self.uid;
        st.st_gid = self.gid;
        st.st_rdev = narrow("rdev", self.rdev)?;
        st.st_size = narrow("size", self.size)?;
        st.st_blksize = narrow("blksize", self.blksize)?;
        st.st_blocks = narrow("blocks", self.blocks)?;
        st.st_atime = narrow("atime", self.atime.sec)?;
        st.st_atime_nsec = narrow("atime_nsec", self.atime.nsec)?;
        st.st_mtime = narrow("mtime", self.mtime.sec)?;
        st.st_mtime_nsec = narrow("mtime_nsec", self.mtime.nsec)?;
        st.st_ctime = narrow("ctime", self.ctime.sec)?;
        st.st_ctime_nsec = narrow("ctime_nsec", self.ctime.nsec)?;
        Ok(())
    }

    pub fn from_native(st: &libc::stat) -> Result<Self, MarshalError> {
        Ok(Self {
            dev: narrow("dev", st.st_dev)?,
            ino: narrow("ino", st.st_ino)?,
            mode: narrow("mode", st.st_mode)?,
            nlink: narrow("nlink", st.st_nlink)?,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: narrow("rdev", st.st_rdev)?,
            size: narrow("size", st.st_size)?,
            blksize: narrow("blksize", st.st_blksize)?,
            blocks: narrow("blocks", st.st_blocks)?,
            atime: Timespec::new(narrow("atime", st.st_atime)?, nanos(st.st_atime_nsec)?),
            mtime: Timespec::new(narrow("mtime", st.st_mtime)?, nanos(st.st_mtime_nsec)?),
            ctime: Timespec::new(narrow("ctime", st.st_ctime)?, nanos(st.st_ctime_nsec)?),
        })
    }

    pub fn native(&self) -> Result<libc::stat, MarshalError> {
        // SAFETY: stat is plain old data; all-zero is a valid value.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        self.to_native(&mut st)?;
        Ok(st)
    }
}

/// Filesystem status, as returned by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

impl StatVfs {
    pub fn to_native(&self, st: &mut libc::statvfs) -> Result<(), MarshalError> {
        st.f_bsize = narrow("bsize", self.bsize)?;
        st.f_frsize = narrow("frsize", self.frsize)?;
        st.f_blocks = narrow("blocks", self.blocks)?;
        st.f_bfree = narrow("bfree", self.bfree)?;
        st.f_bavail = narrow("bavail", self.bavail)?;
        st.f_files = narrow("files", self.files)?;
        st.f_ffree = narrow("ffree", self.ffree)?;
        st.f_favail = narrow("favail", self.favail)?;
        st.f_fsid = narrow("fsid", self.fsid)?;
        st.f_flag = narrow("flag", self.flag)?;
        st.f_namemax = narrow("namemax", self.namemax)?;
        Ok(())
    }

    pub fn from_native(st: &libc::statvfs) -> Result<Self, MarshalError> {
        Ok(Self {
            bsize: narrow("bsize", st.f_bsize)?,
            frsize: narrow("frsize", st.f_frsize)?,
            blocks: narrow("blocks", st.f_blocks)?,
            bfree: narrow("bfree", st.f_bfree)?,
            bavail: narrow("bavail", st.f_bavail)?,
            files: narrow("files", st.f_files)?,
            ffree: narrow("ffree", st.f_ffree)?,
            favail: narrow("favail", st.f_favail)?,
            fsid: narrow("fsid", st.f_fsid)?,
            flag: narrow("flag", st.f_flag)?,
            namemax: narrow("namemax", st.f_namemax)?,
        })
    }
}

/// Native connection-info block handed to `init`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawConnInfo {
    pub proto_major: c_uint,
    pub proto_minor: c_uint,
    pub async_read: c_uint,
    pub max_write: c_uint,
    pub max_readahead: c_uint,
    pub capable: c_uint,
    pub want: c_uint,
}

/// Connection parameters negotiated with the driver during `init`.
///
/// Only `async_read`, `max_write`, `max_readahead` and `want` are written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnInfo {
    pub proto_major: u32,
    pub proto_minor: u32,
    pub async_read: bool,
    pub max_write: u32,
    pub max_readahead: u32,
    pub capable: u32,
    pub want: u32,
}

impl ConnInfo {
    pub fn from_native(raw: &RawConnInfo) -> Self {
        Self {
            proto_major: raw.proto_major,
            proto_minor: raw.proto_minor,
            async_read: raw.async_read != 0,
            max_write: raw.max_write,
            max_readahead: raw.max_readahead,
            capable: raw.capable,
            want: raw.want,
        }
    }

    pub fn to_native(&self, raw: &mut RawConnInfo) {
        raw.proto_major = self.proto_major;
        raw.proto_minor = self.proto_minor;
        self.write_back(raw);
        raw.capable = self.capable;
    }

    /// Copies the negotiable fields into the native block.
    pub fn write_back(&self, raw: &mut RawConnInfo) {
        raw.async_read = c_uint::from(self.async_read);
        raw.max_write = self.max_write;
        raw.max_readahead = self.max_readahead;
        raw.want = self.want;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

/// A POSIX record lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flock {
    pub kind: LockKind,
    pub whence: Whence,
    pub start: i64,
    pub len: i64,
    pub pid: i32,
}

impl Flock {
    pub fn to_native(&self, fl: &mut libc::flock) -> Result<(), MarshalError> {
        let kind = match self.kind {
            LockKind::Read => libc::F_RDLCK,
            LockKind::Write => libc::F_WRLCK,
            LockKind::Unlock => libc::F_UNLCK,
        };
        let whence = match self.whence {
            Whence::Set => libc::SEEK_SET,
            Whence::Current => libc::SEEK_CUR,
            Whence::End => libc::SEEK_END,
        };
        fl.l_type = narrow("l_type", kind)?;
        fl.l_whence = narrow("l_whence", whence)?;
        fl.l_start = narrow("l_start", self.start)?;
        fl.l_len = narrow("l_len", self.len)?;
        fl.l_pid = self.pid;
        Ok(())
    }

    pub fn from_native(fl: &libc::flock) -> Result<Self, MarshalError> {
        let kind = match i32::from(fl.l_type) {
            libc::F_RDLCK => LockKind::Read,
            libc::F_WRLCK => LockKind::Write,
            libc::F_UNLCK => LockKind::Unlock,
            other => return Err(MarshalError::UnknownLockType(other)),
        };
        let whence = match i32::from(fl.l_whence) {
            libc::SEEK_SET => Whence::Set,
            libc::SEEK_CUR => Whence::Current,
            libc::SEEK_END => Whence::End,
            other => return Err(MarshalError::UnknownWhence(other)),
        };
        Ok(Self {
            kind,
            whence,
            start: narrow("l_start", fl.l_start)?,
            len: narrow("l_len", fl.l_len)?,
            pid: fl.l_pid,
        })
    }

    pub fn native(&self) -> Result<libc::flock, MarshalError> {
        // SAFETY: flock is plain old data; all-zero is a valid value.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        self.to_native(&mut fl)?;
        Ok(fl)
    }
}

/// Command passed alongside a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCommand {
    GetLock,
    SetLock,
    SetLockWait,
}

impl LockCommand {
    pub fn from_native(cmd: libc::c_int) -> Option<Self> {
        match cmd {
            libc::F_GETLK => Some(LockCommand::GetLock),
            libc::F_SETLK => Some(LockCommand::SetLock),
            libc::F_SETLKW => Some(LockCommand::SetLockWait),
            _ => None,
        }
    }

    pub fn to_native(self) -> libc::c_int {
        match self {
            LockCommand::GetLock => libc::F_GETLK,
            LockCommand::SetLock => libc::F_SETLK,
            LockCommand::SetLockWait => libc::F_SETLKW,
        }
    }
}

/// One timestamp argument of `utimens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    Now,
    Omit,
    At(Timespec),
}

impl SetTime {
    pub fn from_native(ts: &libc::timespec) -> Result<Self, MarshalError> {
        match ts.tv_nsec {
            libc::UTIME_NOW => Ok(SetTime::Now),
            libc::UTIME_OMIT => Ok(SetTime::Omit),
            _ => Timespec::from_native(ts).map(SetTime::At),
        }
    }

    pub fn to_native(&self) -> Result<libc::timespec, MarshalError> {
        match self {
            SetTime::At(ts) => ts.to_native(),
            SetTime::Now | SetTime::Omit => {
                // SAFETY: timespec is plain old data; all-zero is a valid value.
                let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
                ts.tv_nsec = if matches!(self, SetTime::Now) {
                    libc::UTIME_NOW
                } else {
                    libc::UTIME_OMIT
                };
                Ok(ts)
            }
        }
    }

    /// Resolves against `now`; `None` means leave the timestamp unchanged.
    pub fn resolve(&self, now: Timespec) -> Option<Timespec> {
        match self {
            SetTime::Now => Some(now),
            SetTime::Omit => None,
            SetTime::At(ts) => Some(*ts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stat() -> Stat {
        Stat {
            dev: 7,
            ino: 42,
            nlink: 3,
            uid: 1000,
            gid: 100,
            rdev: 0,
            size: 12_345,
            blksize: 4096,
            blocks: 25,
            atime: Timespec::new(1_700_000_000, 123_456_789),
            mtime: Timespec::new(1_700_000_100, 1),
            ctime: Timespec::new(1_700_000_200, 999_999_999),
            ..Stat::file(0o640)
        }
    }

    #[test]
    fn mode_composition_masks_type_and_permissions() {
        let dir = Stat::directory(0o40755);
        assert_eq!(dir.mode, S_IFDIR | 0o755);
        assert!(dir.is_dir());
        let file = Stat::with_kind(S_IFREG | 0o777, 0o1644);
        assert_eq!(file.file_type(), S_IFREG);
        assert_eq!(file.permissions(), 0o1644);
    }

    #[test]
    fn stat_survives_native_conversion() {
        let stat = sample_stat();
        let native = stat.native().unwrap();
        assert_eq!(native.st_size, 12_345);
        assert_eq!(native.st_atime_nsec, 123_456_789);
        assert_eq!(Stat::from_native(&native).unwrap(), stat);
    }

    #[test]
    fn oversized_values_are_rejected() {
        let stat = Stat {
            size: u64::MAX,
            ..Stat::file(0o644)
        };
        assert!(matches!(
            stat.native(),
            Err(MarshalError::OutOfRange { field: "size", .. })
        ));

        let stat = Stat {
            mtime: Timespec::new(0, 1_000_000_000),
            ..Stat::file(0o644)
        };
        assert!(matches!(stat.native(), Err(MarshalError::InvalidNanos(_))));
    }

    #[test]
    fn statvfs_survives_native_conversion() {
        let vfs = StatVfs {
            bsize: 4096,
            frsize: 4096,
            blocks: 1000,
            bfree: 600,
            bavail: 500,
            files: 100,
            ffree: 90,
            favail: 80,
            fsid: 0xfeed,
            flag: 1,
            namemax: 255,
        };
        // SAFETY: statvfs is plain old data.
        let mut native: libc::statvfs = unsafe { std::mem::zeroed() };
        vfs.to_native(&mut native).unwrap();
        assert_eq!(StatVfs::from_native(&native).unwrap(), vfs);
    }

    #[test]
    fn conn_info_write_back_only_touches_negotiable_fields() {
        let mut raw = RawConnInfo {
            proto_major: 7,
            proto_minor: 26,
            async_read: 1,
            max_write: 4096,
            max_readahead: 8192,
            capable: 0xff,
            want: 0x0f,
        };
        let mut conn = ConnInfo::from_native(&raw);
        assert!(conn.async_read);
        conn.proto_major = 99;
        conn.capable = 0;
        conn.async_read = false;
        conn.max_write = 1 << 20;
        conn.want = 0x01;
        conn.write_back(&mut raw);
        assert_eq!(raw.proto_major, 7);
        assert_eq!(raw.capable, 0xff);
        assert_eq!(raw.async_read, 0);
        assert_eq!(raw.max_write, 1 << 20);
        assert_eq!(raw.want, 0x01);
    }

    #[test]
    fn flock_survives_native_conversion() {
        let lock = Flock {
            kind: LockKind::Write,
            whence: Whence::Current,
            start: 10,
            len: 20,
            pid: 4321,
        };
        let native = lock.native().unwrap();
        assert_eq!(i32::from(native.l_type), libc::F_WRLCK);
        assert_eq!(Flock::from_native(&native).unwrap(), lock);
    }

    #[test]
    fn utime_markers_decode() {
        let now = SetTime::Now.to_native().unwrap();
        assert_eq!(SetTime::from_native(&now).unwrap(), SetTime::Now);
        let omit = SetTime::Omit.to_native().unwrap();
        assert_eq!(SetTime::from_native(&omit).unwrap(), SetTime::Omit);
        let at = SetTime::At(Timespec::new(5, 6)).to_native().unwrap();
        assert_eq!(
            SetTime::from_native(&at).unwrap(),
            SetTime::At(Timespec::new(5, 6))
        );
        assert_eq!(SetTime::Omit.resolve(Timespec::new(1, 0)), None);
    }

    #[test]
    fn timespec_system_time_conversion() {
        let ts = Timespec::new(1_600_000_000, 500);
        assert_eq!(Timespec::from(SystemTime::from(ts)), ts);
        let before = Timespec::new(-2, 250_000_000);
        assert_eq!(Timespec::from(SystemTime::from(before)), before);
    }
}
