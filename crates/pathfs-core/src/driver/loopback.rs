// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process driver.
//!
//! Mounting attaches to an existing directory without involving the kernel.
//! Requests come from a [`LoopbackClient`] and are served through the native
//! callback table exactly as a kernel driver would serve them.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use super::queue::{Channel, Pending, RequestQueue};
use super::request::{Caller, NativeCaller, Reply, Request, DEFAULT_DIR_BUFFER};
use super::{Driver, DriverError, ExitHandle, MountArgs, Received, Session, UserData};
use crate::attr::ConnInfo;
use crate::dispatch::RawOperations;

/// Connection parameters offered to `init`.
pub const LOOPBACK_CONN: ConnInfo = ConnInfo {
    proto_major: 7,
    proto_minor: 26,
    async_read: true,
    max_write: 128 * 1024,
    max_readahead: 128 * 1024,
    capable: 0,
    want: 0,
};

#[derive(Debug)]
pub struct LoopbackDriver {
    queue: Arc<RequestQueue>,
    dir_capacity: usize,
}

impl LoopbackDriver {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            queue: Arc::new(RequestQueue::new()?),
            dir_capacity: DEFAULT_DIR_BUFFER,
        })
    }

    /// Directory buffer size used by clients' `readdir` calls.
    pub fn with_dir_capacity(mut self, capacity: usize) -> Self {
        self.dir_capacity = capacity;
        self
    }

    /// A client for this driver's sessions. Clients may be created before
    /// mounting; requests they submit wait until a loop dispatches them.
    pub fn client(&self) -> LoopbackClient {
        LoopbackClient {
            queue: Arc::clone(&self.queue),
            caller: Caller::current(),
            dir_capacity: self.dir_capacity,
        }
    }
}

impl Driver for LoopbackDriver {
    type Session = LoopbackSession;

    fn mount(
        &mut self,
        mount_point: &Path,
        args: &MountArgs,
        ops: RawOperations,
        user_data: UserData,
    ) -> Result<LoopbackSession, DriverError> {
        match std::fs::metadata(mount_point) {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(DriverError::BadMountPoint(mount_point.to_path_buf())),
        }
        if self.queue.exited() {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }

        let native = NativeCaller::new(ops, user_data);
        if ops.init.is_some() {
            let conn = LOOPBACK_CONN;
            if let Reply::Error(code) = native.call(&Caller::current(), Request::Init { conn }) {
                return Err(DriverError::InitFailed(code));
            }
        }

        info!(
            target: "pathfs::driver",
            mount_point = %mount_point.display(),
            options = ?args.options(),
            wired = ?ops,
            "Loopback session mounted"
        );
        Ok(LoopbackSession {
            channel: Channel::new(Arc::clone(&self.queue), native),
            mount_point: mount_point.to_path_buf(),
            invalidated: Vec::new(),
            unmounted: false,
        })
    }
}

#[derive(Debug)]
pub struct LoopbackSession {
    channel: Channel,
    mount_point: PathBuf,
    invalidated: Vec<PathBuf>,
    unmounted: bool,
}

impl LoopbackSession {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Paths passed to [`Session::invalidate`], oldest first.
    pub fn invalidated(&self) -> &[PathBuf] {
        &self.invalidated
    }
}

impl Session for LoopbackSession {
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
        if self.unmounted {
            return Ok(());
        }
        self.unmounted = true;
        self.channel.queue().exit();
        let native = self.channel.native();
        if native.operations().destroy.is_some() {
            native.call(&Caller::current(), Request::Destroy);
        }
        info!(
            target: "pathfs::driver",
            mount_point = %self.mount_point.display(),
            "Loopback session unmounted"
        );
        Ok(())
    }

    fn invalidate(&mut self, path: &Path) -> Result<(), DriverError> {
        debug!(target: "pathfs::driver", path = %path.display(), "Invalidation recorded");
        self.invalidated.push(path.to_path_buf());
        Ok(())
    }
}

/// Submits requests to a loopback session as a given caller.
#[derive(Debug, Clone)]
pub struct LoopbackClient {
    queue: Arc<RequestQueue>,
    caller: Caller,
    dir_capacity: usize,
}

impl LoopbackClient {
    pub fn with_caller(mut self, caller: Caller) -> Self {
        self.caller = caller;
        self
    }

    pub fn caller(&self) -> Caller {
        self.caller
    }

    /// Queues `request` without waiting for the reply.
    pub fn submit(&self, request: Request) -> Receiver<Reply> {
        self.queue.submit(self.caller, request)
    }

    /// Queues `request` and blocks until it is answered. A session that ends
    /// first yields `ENOTCONN`.
    pub fn request(&self, request: Request) -> Reply {
        self.submit(request)
            .recv()
            .unwrap_or(Reply::Error(libc::ENOTCONN))
    }

    /// Like [`request`](Self::request) but gives up with `ETIMEDOUT`.
    pub fn request_timeout(&self, request: Request, timeout: Duration) -> Reply {
        match self.submit(request).recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Reply::Error(libc::ETIMEDOUT),
            Err(RecvTimeoutError::Disconnected) => Reply::Error(libc::ENOTCONN),
        }
    }

    /// Reads a directory with the driver's buffer size.
    pub fn readdir(&self, path: impl Into<PathBuf>, offset: i64, fh: u64) -> Reply {
        self.request(Request::Readdir {
            path: path.into(),
            offset,
            fh,
            capacity: self.dir_capacity,
        })
    }
}
