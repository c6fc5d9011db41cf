// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use super::*;
use crate::attr::{ConnInfo, Flock, LockCommand, LockKind, SetTime, Stat, Whence};
use crate::context::Context;
use crate::driver::request::{Caller, NativeCaller, Reply, Request};
use crate::error::{FsError, FsResult};
use crate::filler::{DirFiller, Fill};
use crate::handle::Handle;
use crate::test_support::capture_logs;

#[derive(Default)]
struct Recorder {
    declared: OperationSet,
    released: Vec<Option<String>>,
    times: Vec<(SetTime, SetTime)>,
    callers: Vec<(u32, u32, i32)>,
    signals: Vec<i32>,
}

impl Recorder {
    fn declaring(ops: &[Operation]) -> Self {
        Self {
            declared: OperationSet::of(ops),
            ..Self::default()
        }
    }
}

impl Filesystem for Recorder {
    fn operations(&self) -> OperationSet {
        self.declared
    }

    fn signal(&mut self, signal: i32) {
        assert_ne!(signal, libc::SIGTERM, "no handler for SIGTERM");
        self.signals.push(signal);
    }

    fn getattr(&mut self, cx: &Context<'_>, path: &Path) -> FsResult<Option<Stat>> {
        self.callers.push((cx.uid(), cx.gid(), cx.pid()));
        match path.to_str() {
            Some("/") => Ok(Some(Stat::directory(0o755))),
            Some("/gone") => Err(FsError::NotFound),
            Some("/busy") => Err(FsError::Busy),
            Some("/huge") => Ok(Some(Stat {
                size: u64::MAX,
                ..Stat::file(0o644)
            })),
            Some("/broken") => Err(FsError::other(anyhow::anyhow!("backend offline"))),
            _ => Ok(None),
        }
    }

    fn open(&mut self, _cx: &Context<'_>, path: &Path, handle: &mut Handle) -> FsResult<()> {
        handle.set_payload(path.display().to_string());
        handle.set_direct_io(true);
        Ok(())
    }

    fn read(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        size: usize,
        offset: u64,
        handle: Option<&mut Handle>,
    ) -> FsResult<Vec<u8>> {
        if path == Path::new("/overrun") {
            return Ok(vec![b'x'; size + 1]);
        }
        let opened = handle.and_then(|h| h.payload::<String>().cloned());
        let data = opened.unwrap_or_default().into_bytes();
        let start = usize::try_from(offset).map_err(FsError::other)?.min(data.len());
        let end = (start + size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn release(&mut self, _cx: &Context<'_>, _path: &Path, handle: Option<Handle>) -> FsResult<()> {
        self.released
            .push(handle.and_then(|mut h| h.take_payload::<String>()));
        Ok(())
    }

    fn access(&mut self, _cx: &Context<'_>, _path: &Path, _mask: i32) -> FsResult<()> {
        panic!("access handler exploded");
    }

    fn getxattr(&mut self, _cx: &Context<'_>, _path: &Path, name: &OsStr) -> FsResult<Vec<u8>> {
        match name.to_str() {
            Some("user.v") => Ok(b"value".to_vec()),
            _ => Err(FsError::NoData),
        }
    }

    fn listxattr(&mut self, _cx: &Context<'_>, _path: &Path) -> FsResult<Vec<OsString>> {
        Ok(vec!["user.a".into(), "user.bb".into()])
    }

    fn opendir(&mut self, _cx: &Context<'_>, _path: &Path, _handle: &mut Handle) -> FsResult<()> {
        Ok(())
    }

    fn readdir(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        filler: &mut DirFiller<'_>,
        _offset: u64,
        _handle: Option<&mut Handle>,
    ) -> FsResult<()> {
        let entries = ["a", "bb", "ccc", "dddd"]
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, Some(Stat::file(0o644)), i as u64 + 1));
        if filler.add_all(entries)? == Fill::Full {
            // A later push after a rejection must not reach the sink.
            assert_eq!(filler.push("late", None, 99)?, Fill::Full);
        }
        Ok(())
    }

    fn init(&mut self, _cx: &Context<'_>, conn: &mut ConnInfo) -> FsResult<()> {
        conn.max_write = 4096;
        conn.proto_major = 99;
        Ok(())
    }

    fn lock(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        _handle: Option<&mut Handle>,
        cmd: LockCommand,
        lock: &mut Flock,
    ) -> FsResult<()> {
        if cmd == LockCommand::GetLock {
            lock.kind = LockKind::Unlock;
        }
        Ok(())
    }

    fn utimens(
        &mut self,
        _cx: &Context<'_>,
        _path: &Path,
        atime: SetTime,
        mtime: SetTime,
    ) -> FsResult<()> {
        self.times.push((atime, mtime));
        Ok(())
    }

    fn bmap(&mut self, _cx: &Context<'_>, _path: &Path, _blocksize: usize, index: u64) -> FsResult<u64> {
        Ok(index * 2)
    }
}

struct Harness<F> {
    dispatch: Box<Dispatch<F>>,
    native: NativeCaller,
}

impl<F: Filesystem> Harness<F> {
    fn new(fs: F) -> Self {
        let dispatch = Dispatch::new(fs, ErrorTranslator::default());
        let table = OperationTable::build(dispatch.lock().fs.operations());
        let native = NativeCaller::new(table.native::<F>(), dispatch.user_data());
        Self { dispatch, native }
    }

    fn call(&self, request: Request) -> Reply {
        self.native.call(&Caller::default(), request)
    }

    fn state(&mut self) -> &mut DispatchState<F> {
        self.dispatch.state_mut()
    }
}

fn path(p: &str) -> PathBuf {
    PathBuf::from(p)
}

#[test]
fn undeclared_operations_leave_slots_empty() {
    let table = OperationTable::build(OperationSet::of(&[Operation::Getattr, Operation::Read]));
    let ops = table.native::<Recorder>();

    assert!(ops.getattr.is_some());
    assert!(ops.read.is_some());
    assert!(ops.mkdir.is_none());
    assert!(ops.release.is_none());
    assert!(ops.releasedir.is_none());
    assert_eq!(table.len(), 2);
    for op in Operation::ALL {
        assert_eq!(ops.is_wired(*op), table.is_wired(*op), "{op}");
    }
}

#[test]
fn open_family_gets_builtin_release() {
    let table = OperationTable::build(OperationSet::of(&[Operation::Create]));
    assert_eq!(table.binding(Operation::Release), Some(Binding::Builtin));
    assert_eq!(table.binding(Operation::Releasedir), None);

    let table = OperationTable::build(OperationSet::of(&[Operation::Opendir]));
    assert_eq!(table.binding(Operation::Releasedir), Some(Binding::Builtin));
    assert_eq!(table.binding(Operation::Release), None);

    let table = OperationTable::build(OperationSet::of(&[Operation::Open, Operation::Release]));
    assert_eq!(table.binding(Operation::Release), Some(Binding::Handler));
}

#[test]
fn missing_and_not_found_are_indistinguishable() {
    let h = Harness::new(Recorder::declaring(&[Operation::Getattr]));
    let (replies, logs) = capture_logs(|| {
        [
            h.call(Request::Getattr { path: path("/nothing") }),
            h.call(Request::Getattr { path: path("/gone") }),
            h.call(Request::Getattr { path: path("/busy") }),
        ]
    });
    assert_eq!(replies[0], Reply::Error(libc::ENOENT));
    assert_eq!(replies[1], Reply::Error(libc::ENOENT));
    assert_eq!(replies[2], Reply::Error(libc::EBUSY));
    assert!(logs.is_empty(), "coded failures must not log: {logs}");
}

#[test]
fn pending_signals_are_delivered_before_the_next_call() {
    let mut h = Harness::new(Recorder::declaring(&[Operation::Getattr]));
    let signals = h.state().signals.clone();
    signals.raise(libc::SIGHUP);
    signals.raise(libc::SIGTERM);
    signals.raise(libc::SIGUSR1);

    let (reply, logs) = capture_logs(|| h.call(Request::Getattr { path: path("/") }));
    assert!(matches!(reply, Reply::Attr(st) if st.is_dir()));
    assert!(signals.is_empty());
    assert_eq!(h.state().fs.signals, [libc::SIGHUP, libc::SIGUSR1]);
    assert!(h.state().trace_calls);
    assert!(logs.contains("Signal handler panicked"), "{logs}");
    assert!(logs.contains("Toggled call tracing"), "{logs}");
    assert!(logs.contains("==> call"), "{logs}");
    assert!(logs.contains("<== return"), "{logs}");
}

#[test]
fn caller_identity_reaches_the_handler() {
    let mut h = Harness::new(Recorder::declaring(&[Operation::Getattr]));
    let caller = Caller {
        uid: 1000,
        gid: 100,
        pid: 4242,
        umask: 0o027,
    };
    let reply = h.native.call(&caller, Request::Getattr { path: path("/") });
    assert!(matches!(reply, Reply::Attr(st) if st.is_dir() && st.permissions() == 0o755));
    assert_eq!(h.state().fs.callers, [(1000, 100, 4242)]);
}

#[test]
fn uncoded_failure_is_logged_and_defaulted() {
    let h = Harness::new(Recorder::declaring(&[Operation::Getattr]));
    let (reply, logs) = capture_logs(|| h.call(Request::Getattr { path: path("/broken") }));
    assert_eq!(reply, Reply::Error(libc::ENOENT));
    assert!(logs.contains("backend offline"), "{logs}");
    assert!(logs.contains("getattr"), "{logs}");
}

#[test]
fn panicking_handler_returns_default_errno() {
    let mut h = Harness::new(Recorder::declaring(&[Operation::Access]));
    h.state().translator = ErrorTranslator::new(libc::EIO);
    let (reply, logs) = capture_logs(|| {
        h.call(Request::Access {
            path: path("/"),
            mask: libc::R_OK,
        })
    });
    assert_eq!(reply, Reply::Error(libc::EIO));
    assert!(logs.contains("access handler exploded"), "{logs}");
}

#[test]
fn malformed_record_is_fatal() {
    let mut h = Harness::new(Recorder::declaring(&[Operation::Getattr]));
    let reply = h.call(Request::Getattr { path: path("/huge") });
    assert_eq!(reply, Reply::Error(libc::EIO));
    assert!(matches!(
        h.state().fatal,
        Some(MarshalError::OutOfRange { field: "size", .. })
    ));
}

#[test]
fn handles_live_from_open_to_release() {
    let mut h = Harness::new(Recorder::declaring(&[Operation::Open, Operation::Read]));
    let Reply::Opened(opened) = h.call(Request::Open {
        path: path("/file"),
        flags: libc::O_RDONLY,
    }) else {
        panic!("open failed");
    };
    assert!(opened.direct_io);
    assert_ne!(opened.fh, 0);
    let id = crate::handle::HandleId::from_raw(opened.fh).unwrap();
    assert!(h.state().handles.contains(id));

    let reply = h.call(Request::Read {
        path: path("/file"),
        size: 3,
        offset: 1,
        fh: opened.fh,
    });
    assert_eq!(reply, Reply::Data(b"fil".to_vec()));

    // Built-in release: deregisters without a handler.
    let reply = h.call(Request::Release {
        path: path("/file"),
        fh: opened.fh,
        flags: 0,
    });
    assert_eq!(reply, Reply::Ok);
    assert!(h.state().handles.is_empty());
}

#[test]
fn release_handler_receives_the_handle() {
    let mut h = Harness::new(Recorder::declaring(&[Operation::Open, Operation::Release]));
    let Reply::Opened(opened) = h.call(Request::Open {
        path: path("/owned"),
        flags: libc::O_RDWR,
    }) else {
        panic!("open failed");
    };
    h.call(Request::Release {
        path: path("/owned"),
        fh: opened.fh,
        flags: 0,
    });
    // A second release of the same id finds nothing.
    h.call(Request::Release {
        path: path("/owned"),
        fh: opened.fh,
        flags: 0,
    });
    assert_eq!(h.state().fs.released, [Some("/owned".to_owned()), None]);
}

#[test]
fn read_overrun_is_an_error() {
    let h = Harness::new(Recorder::declaring(&[Operation::Read]));
    let (reply, logs) = capture_logs(|| {
        h.call(Request::Read {
            path: path("/overrun"),
            size: 8,
            offset: 0,
            fh: 0,
        })
    });
    assert_eq!(reply, Reply::Error(libc::ENOENT));
    assert!(logs.contains("9 bytes for a 8 byte request"), "{logs}");
}

#[test]
fn xattr_size_queries_and_range() {
    let h = Harness::new(Recorder::declaring(&[Operation::Getxattr, Operation::Listxattr]));
    let get = |size| {
        h.call(Request::Getxattr {
            path: path("/"),
            name: "user.v".into(),
            size,
        })
    };
    assert_eq!(get(0), Reply::Size(5));
    assert_eq!(get(2), Reply::Error(libc::ERANGE));
    assert_eq!(get(64), Reply::Data(b"value".to_vec()));

    let list = |size| h.call(Request::Listxattr { path: path("/"), size });
    assert_eq!(list(0), Reply::Size(15));
    assert_eq!(list(4), Reply::Error(libc::ERANGE));
    assert_eq!(list(15), Reply::Data(b"user.a\0user.bb\0".to_vec()));

    let missing = h.call(Request::Getxattr {
        path: path("/"),
        name: "user.none".into(),
        size: 0,
    });
    assert_eq!(missing, Reply::Error(libc::ENODATA));
}

#[test]
fn readdir_stops_when_the_buffer_fills() {
    use crate::driver::request::dirent_size;

    let h = Harness::new(Recorder::declaring(&[Operation::Opendir, Operation::Readdir]));
    let capacity = dirent_size(1) + dirent_size(2);
    let reply = h.call(Request::Readdir {
        path: path("/"),
        offset: 0,
        fh: 0,
        capacity,
    });
    let Reply::Entries(listing) = reply else {
        panic!("readdir failed: {reply:?}");
    };
    let names: Vec<_> = listing.entries.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, [OsString::from("a"), OsString::from("bb")]);
    assert!(listing.full);
    assert_eq!(listing.entries[1].offset, 2);
    assert!(listing.entries[0].stat.is_some());
}

#[test]
fn init_writes_back_negotiable_fields_only() {
    let h = Harness::new(Recorder::declaring(&[Operation::Init]));
    let conn = ConnInfo {
        proto_major: 7,
        max_write: 1 << 20,
        ..ConnInfo::default()
    };
    let Reply::Conn(conn) = h.call(Request::Init { conn }) else {
        panic!("init failed");
    };
    assert_eq!(conn.max_write, 4096);
    assert_eq!(conn.proto_major, 7);
}

#[test]
fn lock_record_is_written_back() {
    let h = Harness::new(Recorder::declaring(&[Operation::Lock]));
    let lock = Flock {
        kind: LockKind::Write,
        whence: Whence::Set,
        start: 0,
        len: 10,
        pid: 7,
    };
    let reply = h.call(Request::Lock {
        path: path("/f"),
        fh: 0,
        cmd: LockCommand::GetLock,
        lock,
    });
    assert_eq!(
        reply,
        Reply::Lock(Flock {
            kind: LockKind::Unlock,
            ..lock
        })
    );
}

#[test]
fn utimens_and_bmap_arguments() {
    let mut h = Harness::new(Recorder::declaring(&[Operation::Utimens, Operation::Bmap]));
    let at = crate::attr::Timespec::new(1_700_000_000, 5);
    h.call(Request::Utimens {
        path: path("/f"),
        atime: SetTime::Omit,
        mtime: SetTime::At(at),
    });
    assert_eq!(h.state().fs.times, [(SetTime::Omit, SetTime::At(at))]);

    let reply = h.call(Request::Bmap {
        path: path("/f"),
        blocksize: 4096,
        index: 21,
    });
    assert_eq!(reply, Reply::Block(42));
}

#[test]
fn invalid_offsets_are_rejected() {
    let h = Harness::new(Recorder::declaring(&[Operation::Read]));
    let reply = h.call(Request::Read {
        path: path("/f"),
        size: 1,
        offset: -1,
        fh: 0,
    });
    assert_eq!(reply, Reply::Error(libc::EINVAL));
}
