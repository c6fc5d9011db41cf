// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod common;

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use common::{capture_filtered_logs, mount, mount_with, roundtrip, Tree};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use pathfs_core::driver::loopback::LoopbackDriver;
use pathfs_core::driver::request::{dirent_size, Reply, Request};
use pathfs_core::{HandleId, Mount, MountError, MountState, Operation, ProcessOutcome, S_IFDIR};

const FILE_OPS: &[Operation] = &[
    Operation::Init,
    Operation::Destroy,
    Operation::Getattr,
    Operation::Open,
    Operation::Read,
    Operation::Write,
    Operation::Create,
    Operation::Mkdir,
    Operation::Opendir,
    Operation::Readdir,
];

fn p(path: &str) -> PathBuf {
    PathBuf::from(path)
}

#[test]
fn getattr_root_returns_the_handler_record() {
    let (mut mount, client, _dir) = mount(Tree::new(FILE_OPS), &[]);
    let reply = roundtrip(&mut mount, &client, Request::Getattr { path: p("/") });
    let Reply::Attr(st) = reply else {
        panic!("getattr failed: {reply:?}");
    };
    assert_eq!(st.mode, S_IFDIR | 0o755);
    assert_eq!(st.nlink, 2);
    assert_eq!((st.uid, st.gid), (1000, 1000));
}

#[test]
fn open_missing_file_registers_nothing() {
    let (mut mount, client, _dir) = mount(Tree::new(FILE_OPS), &[]);
    let reply = roundtrip(
        &mut mount,
        &client,
        Request::Open {
            path: p("/missing"),
            flags: libc::O_RDONLY,
        },
    );
    assert_eq!(reply, Reply::Error(libc::ENOENT));
    assert_eq!(mount.open_handles(), 0);
}

#[test]
fn open_read_release_cycle() {
    let tree = Tree::new(FILE_OPS).with_file("/f", b"hello world");
    let (mut mount, client, _dir) = mount(tree, &[]);

    let Reply::Opened(opened) = roundtrip(
        &mut mount,
        &client,
        Request::Open {
            path: p("/f"),
            flags: libc::O_RDONLY,
        },
    ) else {
        panic!("open failed");
    };
    let id = HandleId::from_raw(opened.fh).unwrap();
    assert!(mount.handles().contains(id));
    assert_eq!(
        mount.handles().lookup(id).and_then(|h| h.payload::<String>().cloned()),
        Some("h1".to_owned())
    );

    let reply = roundtrip(
        &mut mount,
        &client,
        Request::Read {
            path: p("/f"),
            size: 4,
            offset: 0,
            fh: opened.fh,
        },
    );
    assert_eq!(reply, Reply::Data(b"hell".to_vec()));

    // No release handler is declared; the built-in one deregisters.
    let reply = roundtrip(
        &mut mount,
        &client,
        Request::Release {
            path: p("/f"),
            fh: opened.fh,
            flags: 0,
        },
    );
    assert_eq!(reply, Reply::Ok);
    assert!(!mount.handles().contains(id));
    assert!(mount.filesystem().released.is_empty());
}

#[test]
fn declared_release_gets_the_payload_back() {
    let ops: Vec<_> = FILE_OPS.iter().copied().chain([Operation::Release]).collect();
    let (mut mount, client, _dir) = mount(Tree::new(&ops), &[]);

    let Reply::Opened(opened) = roundtrip(
        &mut mount,
        &client,
        Request::Create {
            path: p("/new"),
            mode: 0o600,
            flags: libc::O_WRONLY | libc::O_CREAT,
        },
    ) else {
        panic!("create failed");
    };
    let written = roundtrip(
        &mut mount,
        &client,
        Request::Write {
            path: p("/new"),
            data: b"abc".to_vec(),
            offset: 2,
            fh: opened.fh,
        },
    );
    assert_eq!(written, Reply::Written(3));
    roundtrip(
        &mut mount,
        &client,
        Request::Release {
            path: p("/new"),
            fh: opened.fh,
            flags: 0,
        },
    );

    let fs = mount.into_filesystem();
    assert_eq!(fs.released, ["created"]);
    assert_eq!(fs.entries[&p("/new")].1, b"\0\0abc");
}

#[test]
fn unwired_operations_answer_enosys() {
    let (mut mount, client, _dir) = mount(Tree::new(&[Operation::Getattr]), &[]);
    let table = mount.table().unwrap();
    assert!(!table.is_wired(Operation::Release));
    assert!(!table.is_wired(Operation::Unlink));

    let reply = roundtrip(&mut mount, &client, Request::Unlink { path: p("/x") });
    assert_eq!(reply, Reply::Error(libc::ENOSYS));
}

#[test]
fn readdir_reports_a_full_buffer() {
    let tree = Tree::new(FILE_OPS)
        .with_file("/alpha", b"")
        .with_file("/beta", b"")
        .with_file("/gamma", b"");
    // Room for ".", ".." and "alpha" only.
    let capacity = 2 * dirent_size(2) + dirent_size(5);
    let driver = LoopbackDriver::new().unwrap().with_dir_capacity(capacity);
    let (mut mount, client, _dir) = mount_with(driver, tree, &[]);

    let rx = client.submit(Request::Readdir {
        path: p("/"),
        offset: 0,
        fh: 0,
        capacity,
    });
    assert_eq!(mount.process_one_event().unwrap(), ProcessOutcome::Dispatched);
    let Reply::Entries(listing) = rx.recv().unwrap() else {
        panic!("readdir failed");
    };
    let names: Vec<_> = listing.entries.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, [".", "..", "alpha"].map(OsString::from));
    assert!(listing.full);
    assert!(listing.used <= listing.capacity);

    // Resume after the last accepted entry.
    let rx = client.submit(Request::Readdir {
        path: p("/"),
        offset: listing.entries[2].offset,
        fh: 0,
        capacity,
    });
    mount.process_one_event().unwrap();
    let Reply::Entries(rest) = rx.recv().unwrap() else {
        panic!("readdir failed");
    };
    let names: Vec<_> = rest.entries.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["beta", "gamma"].map(OsString::from));
    assert!(!rest.full);
}

#[test]
fn unmount_twice_is_a_no_op() {
    let (mut mount, _client, _dir) = mount(Tree::new(FILE_OPS), &[]);
    assert_eq!(mount.filesystem().init_calls, 1);

    mount.unmount().unwrap();
    mount.unmount().unwrap();
    assert_eq!(mount.state(), MountState::Unmounted);
    assert!(matches!(mount.process_one_event(), Err(MountError::NotMounted)));
    assert!(matches!(mount.invalidate("/x"), Err(MountError::NotMounted)));

    let fs = mount.into_filesystem();
    assert_eq!(fs.destroy_calls, 1);
}

#[test]
fn dropping_a_mount_runs_destroy_and_fails_clients() {
    let (mount, client, _dir) = mount(Tree::new(FILE_OPS), &[]);
    let pending = client.submit(Request::Getattr { path: p("/") });
    drop(mount);
    assert_eq!(pending.recv().unwrap(), Reply::Error(libc::ENOTCONN));
    assert_eq!(
        client.request(Request::Getattr { path: p("/") }),
        Reply::Error(libc::ENOTCONN)
    );
}

#[test]
fn event_descriptor_becomes_readable_on_submit() {
    let (mut mount, client, _dir) = mount(Tree::new(FILE_OPS), &[]);

    let ready = |mount: &common::TreeMount, timeout: PollTimeout| {
        let fd = mount.event_source_descriptor().unwrap();
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        poll(&mut fds, timeout).unwrap()
    };
    assert_eq!(ready(&mount, PollTimeout::ZERO), 0);

    let rx = client.submit(Request::Getattr { path: p("/") });
    assert_eq!(ready(&mount, PollTimeout::from(1000u16)), 1);
    assert_eq!(mount.process_one_event().unwrap(), ProcessOutcome::Dispatched);
    assert!(matches!(rx.recv().unwrap(), Reply::Attr(_)));
}

#[test]
fn exit_handle_stops_the_loop_from_another_thread() {
    let (mut mount, client, _dir) = mount(Tree::new(FILE_OPS), &[]);
    let exit = mount.exit_handle().unwrap();

    let worker = std::thread::spawn(move || {
        let reply = client.request_timeout(Request::Getattr { path: p("/") }, Duration::from_secs(5));
        exit.exit();
        reply
    });
    mount.run_loop().unwrap();
    assert!(matches!(worker.join().unwrap(), Reply::Attr(_)));
    assert!(!mount.mounted());
    assert_eq!(mount.process_one_event().unwrap(), ProcessOutcome::Exited);
    assert_eq!(mount.state(), MountState::Mounted);
    mount.unmount().unwrap();
}

#[test]
fn multi_threaded_loop_serializes_handlers() {
    let tree = Tree::new(FILE_OPS).with_file("/counter", b"");
    let (mut mount, client, _dir) = mount(tree, &["-o", "fsname=tree"]);
    let exit = mount.exit_handle().unwrap();

    let clients: Vec<_> = (0..4u8)
        .map(|n| {
            let client = client.clone();
            std::thread::spawn(move || {
                for i in 0..25u8 {
                    let offset = i64::from(n) * 25 + i64::from(i);
                    let reply = client.request(Request::Write {
                        path: p("/counter"),
                        data: vec![n],
                        offset,
                        fh: 0,
                    });
                    assert_eq!(reply, Reply::Written(1));
                }
            })
        })
        .collect();
    let stopper = std::thread::spawn(move || {
        for handle in clients {
            handle.join().unwrap();
        }
        exit.exit();
    });

    mount.run_loop_multi(4).unwrap();
    stopper.join().unwrap();
    assert_eq!(mount.mount_info().fsname.as_deref(), Some("tree"));
    let fs = mount.into_filesystem();
    let data = &fs.entries[&p("/counter")].1;
    assert_eq!(data.len(), 100);
    for n in 0..4u8 {
        let start = usize::from(n) * 25;
        assert!(data[start..start + 25].iter().all(|b| *b == n));
    }
}

#[test]
fn debug_option_traces_every_call() {
    let (mut mount, client, _dir) = mount(Tree::new(FILE_OPS), &["-d"]);
    assert!(mount.trace_calls());
    let (reply, logs) = capture_filtered_logs("info", || {
        roundtrip(&mut mount, &client, Request::Getattr { path: p("/nope") })
    });
    assert_eq!(reply, Reply::Error(libc::ENOENT));
    assert!(logs.contains("==> call"), "{logs}");
    assert!(logs.contains("<== return"), "{logs}");
    assert!(logs.contains("/nope"), "{logs}");
    assert!(!logs.contains("ERROR"), "{logs}");
}

#[test]
fn trace_filter_alone_enables_call_tracing() {
    let (mut mount, client, _dir) = mount(Tree::new(FILE_OPS), &[]);
    assert!(!mount.trace_calls());

    let (reply, logs) = capture_filtered_logs("pathfs::dispatch=trace", || {
        roundtrip(&mut mount, &client, Request::Getattr { path: p("/nope") })
    });
    assert_eq!(reply, Reply::Error(libc::ENOENT));
    assert!(logs.contains("==> call"), "{logs}");
    assert!(logs.contains("<== return"), "{logs}");

    let (_, logs) = capture_filtered_logs("info", || {
        roundtrip(&mut mount, &client, Request::Getattr { path: p("/nope") })
    });
    assert!(!logs.contains("==> call"), "{logs}");
}

#[test]
fn signals_reach_the_filesystem_and_toggle_tracing() {
    let (mut mount, client, _dir) = mount(Tree::new(FILE_OPS), &[]);
    let signals = mount.signals();
    assert!(!mount.trace_calls());

    signals.raise(libc::SIGHUP);
    signals.raise(libc::SIGUSR1);
    assert_eq!(mount.deliver_signals(), 2);
    assert!(mount.trace_calls());
    assert_eq!(mount.filesystem().signals, [libc::SIGHUP, libc::SIGUSR1]);
    assert_eq!(mount.deliver_signals(), 0);

    // Raised while idle, delivered before the next call is dispatched.
    signals.raise(libc::SIGUSR1);
    let reply = roundtrip(&mut mount, &client, Request::Getattr { path: p("/") });
    assert!(matches!(reply, Reply::Attr(st) if st.is_dir()));
    assert!(!mount.trace_calls());
    assert_eq!(mount.filesystem().signals.len(), 3);
    assert!(signals.is_empty());
}

#[test]
fn bad_mount_point_is_rejected_and_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let mut mount = Mount::new(LoopbackDriver::new().unwrap(), Tree::new(FILE_OPS));

    let err = mount
        .initialize(dir.path().join("absent"), &[] as &[&str])
        .unwrap_err();
    assert!(matches!(err, MountError::Rejected { .. }));
    let err = mount.initialize(dir.path(), &["-h"]).unwrap_err();
    assert!(matches!(err, MountError::Rejected { .. }));
    assert_eq!(mount.state(), MountState::Created);
    assert_eq!(mount.filesystem().init_calls, 0);

    mount.initialize(dir.path(), &[] as &[&str]).unwrap();
    assert!(mount.mounted());
    assert_eq!(mount.filesystem().init_calls, 1);
}
