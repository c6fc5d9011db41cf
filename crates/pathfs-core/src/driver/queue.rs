// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process request queue shared by the drivers.
//!
//! Requests wait in a lock-free queue; every submission writes one byte to a
//! socket pair whose read end is the session's pollable descriptor. Exiting
//! shuts the write end down, so every blocked reader sees end-of-file.

use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use crossbeam_queue::SegQueue;
use tracing::{debug, trace, warn};

use super::request::{Caller, NativeCaller, Reply, Request};
use super::{DriverError, Received};

#[cfg(any(target_os = "linux", target_os = "android"))]
const WAKE_SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
// Without MSG_NOSIGNAL a write after shutdown raises SIGPIPE; Rust binaries
// ignore it by default.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const WAKE_SEND_FLAGS: libc::c_int = 0;

/// A request waiting for dispatch, with the channel its reply goes to.
#[derive(Debug)]
pub struct Pending {
    pub caller: Caller,
    pub request: Request,
    reply: crossbeam_channel::Sender<Reply>,
}

impl Pending {
    pub fn respond(self, reply: Reply) {
        // The submitter may have stopped waiting.
        let _ = self.reply.send(reply);
    }

    /// Performs the request through `native` and sends the reply.
    pub fn serve(self, native: &NativeCaller) {
        let operation = self.request.operation();
        let reply = native.call(&self.caller, self.request);
        trace!(
            target: "pathfs::driver",
            %operation,
            status = reply.status(),
            "Request served"
        );
        let _ = self.reply.send(reply);
    }
}

#[derive(Debug)]
pub struct RequestQueue {
    pending: SegQueue<Pending>,
    wake_tx: UnixStream,
    wake_rx: UnixStream,
    exited: AtomicBool,
}

impl RequestQueue {
    pub fn new() -> io::Result<Self> {
        let (wake_tx, wake_rx) = UnixStream::pair()?;
        Ok(Self {
            pending: SegQueue::new(),
            wake_tx,
            wake_rx,
            exited: AtomicBool::new(false),
        })
    }

    /// Queues a request. After exit the reply is `ENOTCONN` at once.
    pub fn submit(&self, caller: Caller, request: Request) -> Receiver<Reply> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let pending = Pending {
            caller,
            request,
            reply: tx,
        };
        if self.exited() {
            pending.respond(Reply::Error(libc::ENOTCONN));
            return rx;
        }
        self.pending.push(pending);
        if let Err(err) = self.wake() {
            warn!(target: "pathfs::driver", error = %err, "Failed to signal queued request");
            self.fail_pending();
        }
        rx
    }

    fn wake(&self) -> io::Result<()> {
        let byte = [1u8];
        // SAFETY: the buffer is valid for one byte and the descriptor is owned
        // by `wake_tx`.
        let rc = unsafe {
            libc::send(
                self.wake_tx.as_raw_fd(),
                byte.as_ptr().cast(),
                byte.len(),
                WAKE_SEND_FLAGS,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until a request is signalled or the queue exits.
    pub fn next(&self) -> Result<Received, DriverError> {
        if self.exited() {
            return Ok(Received::Exited);
        }
        let mut byte = [0u8; 1];
        match (&self.wake_rx).read(&mut byte) {
            Ok(0) => {
                self.fail_pending();
                Ok(Received::Exited)
            }
            Ok(_) => Ok(self
                .pending
                .pop()
                .map_or(Received::Idle, Received::Request)),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Received::Idle),
            Err(err) => Err(err.into()),
        }
    }

    pub fn exit(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.wake_tx.shutdown(Shutdown::Write) {
            warn!(target: "pathfs::driver", error = %err, "Failed to shut down wake socket");
        }
        self.fail_pending();
        debug!(target: "pathfs::driver", "Request queue exited");
    }

    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn fail_pending(&self) {
        let mut failed = 0usize;
        while let Some(pending) = self.pending.pop() {
            pending.respond(Reply::Error(libc::ENOTCONN));
            failed += 1;
        }
        if failed > 0 {
            debug!(target: "pathfs::driver", failed, "Failed queued requests");
        }
    }
}

impl AsFd for RequestQueue {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.wake_rx.as_fd()
    }
}

/// The receive and dispatch half every session delegates to.
#[derive(Debug, Clone)]
pub struct Channel {
    queue: Arc<RequestQueue>,
    native: NativeCaller,
}

impl Channel {
    pub fn new(queue: Arc<RequestQueue>, native: NativeCaller) -> Self {
        Self { queue, native }
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn native(&self) -> &NativeCaller {
        &self.native
    }

    pub fn read_request(&self) -> Result<Received, DriverError> {
        self.queue.next()
    }

    pub fn dispatch(&self, pending: Pending) {
        pending.serve(&self.native);
    }

    pub fn run(&self) -> Result<(), DriverError> {
        loop {
            match self.read_request()? {
                Received::Request(pending) => self.dispatch(pending),
                Received::Idle => continue,
                Received::Exited => return Ok(()),
            }
        }
    }

    /// Runs `workers` dispatch threads; returns once all have stopped.
    pub fn run_multi(&self, workers: usize) -> Result<(), DriverError> {
        let workers = workers.max(1);
        debug!(target: "pathfs::driver", workers, "Starting dispatch workers");
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        let result = self.run();
                        if result.is_err() {
                            self.queue.exit();
                        }
                        result
                    })
                })
                .collect();
            handles.into_iter().try_for_each(|handle| {
                handle.join().map_err(|_| DriverError::WorkerPanicked)?
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn getattr(path: &str) -> Request {
        Request::Getattr {
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn submitted_request_is_received_and_answered() {
        let queue = RequestQueue::new().unwrap();
        let rx = queue.submit(Caller::default(), getattr("/a"));
        assert_eq!(queue.len(), 1);

        let Received::Request(pending) = queue.next().unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(pending.request, getattr("/a"));
        pending.respond(Reply::Ok);
        assert_eq!(rx.recv().unwrap(), Reply::Ok);
    }

    #[test]
    fn exit_fails_queued_requests() {
        let queue = RequestQueue::new().unwrap();
        let rx = queue.submit(Caller::default(), getattr("/a"));
        queue.exit();
        queue.exit();

        assert_eq!(rx.recv().unwrap(), Reply::Error(libc::ENOTCONN));
        assert!(matches!(queue.next().unwrap(), Received::Exited));
        assert!(queue.is_empty());

        let late = queue.submit(Caller::default(), getattr("/b"));
        assert_eq!(late.recv().unwrap(), Reply::Error(libc::ENOTCONN));
    }

    #[test]
    fn blocked_reader_wakes_on_exit() {
        let queue = Arc::new(RequestQueue::new().unwrap());
        let reader = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.next().map(|r| matches!(r, Received::Exited)))
        };
        queue.exit();
        assert!(reader.join().unwrap().unwrap());
    }

    #[test]
    fn channel_without_slots_answers_enosys() {
        use crate::dispatch::RawOperations;
        use crate::driver::UserData;

        let queue = Arc::new(RequestQueue::new().unwrap());
        let channel = Channel::new(
            Arc::clone(&queue),
            NativeCaller::new(RawOperations::default(), UserData::null()),
        );
        let rx = queue.submit(Caller::default(), getattr("/"));
        let Received::Request(pending) = channel.read_request().unwrap() else {
            panic!("expected a request");
        };
        channel.dispatch(pending);
        assert_eq!(rx.recv().unwrap(), Reply::Error(libc::ENOSYS));
    }
}
