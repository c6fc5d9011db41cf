// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The native driver contract.
//!
//! A [`Driver`] mounts a callback table and returns a [`Session`], which
//! exposes the pollable descriptor, the read-one/dispatch-one pair, the
//! blocking loops, and unmount.

pub mod loopback;
pub mod queue;
pub mod request;

use std::ffi::{c_void, CString};
use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libc::c_int;
use thiserror::Error;

use crate::dispatch::RawOperations;
use queue::{Pending, RequestQueue};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid mount arguments: {0}")]
    InvalidArgs(String),
    #[error("help requested; not mounting")]
    HelpRequested,
    #[error("mount point {} is not an accessible directory", .0.display())]
    BadMountPoint(PathBuf),
    #[error("filesystem init failed with errno {0}")]
    InitFailed(c_int),
    #[error("kernel mount failed: {0}")]
    MountFailed(#[source] io::Error),
    #[error("dispatch worker panicked")]
    WorkerPanicked,
    #[error("operation not supported by this driver")]
    Unsupported,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Opaque pointer handed back to every callback through the call context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(*mut c_void);

// SAFETY: the pointee is the mount's dispatch state, whose trampolines
// serialize access with a mutex; multi-threaded loops are only offered for
// implementations that are `Send`.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    pub fn new(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }
}

/// Asks a session's dispatch loop to stop. Cheap to clone and usable from
/// any thread, including signal handlers installed with `ctrlc`.
#[derive(Debug, Clone)]
pub struct ExitHandle {
    queue: Arc<RequestQueue>,
}

impl ExitHandle {
    pub fn new(queue: Arc<RequestQueue>) -> Self {
        Self { queue }
    }

    pub fn exit(&self) {
        self.queue.exit();
    }

    pub fn exited(&self) -> bool {
        self.queue.exited()
    }
}

/// Result of reading one request from a session.
#[derive(Debug)]
pub enum Received {
    Request(Pending),
    /// The descriptor was readable but no request was queued.
    Idle,
    Exited,
}

/// Mount options in the driver's own command-line syntax.
///
/// The forwarded vector starts with an empty program-name token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountArgs {
    argv: Vec<String>,
    options: Vec<String>,
    debug: bool,
    foreground: bool,
    single_threaded: bool,
}

impl MountArgs {
    /// Accepts `-o opt[,opt]`, `-oopt`, `-d`, `-f` and `-s`. `-h` and any
    /// other token are rejected.
    pub fn parse<I, S>(tokens: I) -> Result<Self, DriverError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = Self {
            argv: vec![String::new()],
            ..Self::default()
        };
        let mut tokens = tokens.into_iter().map(|t| t.as_ref().to_owned());
        while let Some(token) = tokens.next() {
            args.argv.push(token.clone());
            match token.as_str() {
                "-o" => {
                    let value = tokens
                        .next()
                        .ok_or_else(|| DriverError::InvalidArgs("-o requires a value".into()))?;
                    args.argv.push(value.clone());
                    args.add_options(&value);
                }
                "-d" => args.debug = true,
                "-f" => args.foreground = true,
                "-s" => args.single_threaded = true,
                "-h" | "--help" => return Err(DriverError::HelpRequested),
                other => match other.strip_prefix("-o") {
                    Some(value) if !value.is_empty() => args.add_options(value),
                    _ => {
                        return Err(DriverError::InvalidArgs(format!(
                            "unrecognized token {other:?}"
                        )))
                    }
                },
            }
        }
        Ok(args)
    }

    fn add_options(&mut self, value: &str) {
        for option in value.split(',').filter(|o| !o.is_empty()) {
            if option == "debug" {
                self.debug = true;
            }
            self.options.push(option.to_owned());
        }
    }

    /// The full vector, program-name token first.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The tokens after the program name.
    pub fn tokens(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|o| o == name)
    }

    pub fn option_value(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find_map(|o| o.strip_prefix(key)?.strip_prefix('='))
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn foreground(&self) -> bool {
        self.foreground
    }

    pub fn single_threaded(&self) -> bool {
        self.single_threaded
    }

    /// NUL-terminated copies for drivers that take a C `argv`.
    pub fn c_argv(&self) -> Result<Vec<CString>, DriverError> {
        self.argv
            .iter()
            .map(|arg| {
                CString::new(arg.as_bytes())
                    .map_err(|_| DriverError::InvalidArgs(format!("NUL byte in {arg:?}")))
            })
            .collect()
    }
}

/// A native driver able to mount a callback table.
pub trait Driver {
    type Session: Session;

    /// Mounts `ops` at `mount_point`; `user_data` comes back in every
    /// callback's context.
    fn mount(
        &mut self,
        mount_point: &Path,
        args: &MountArgs,
        ops: RawOperations,
        user_data: UserData,
    ) -> Result<Self::Session, DriverError>;
}

/// One mounted session.
pub trait Session {
    /// Becomes readable when a request is waiting.
    fn event_fd(&self) -> BorrowedFd<'_>;

    /// Reads one request, blocking until one arrives or the session exits.
    fn read_request(&mut self) -> Result<Received, DriverError>;

    /// Runs the callback for one request and sends its reply.
    fn dispatch(&mut self, request: Pending);

    /// Dispatches requests on the calling thread until the session exits.
    fn run(&mut self) -> Result<(), DriverError> {
        loop {
            match self.read_request()? {
                Received::Request(request) => self.dispatch(request),
                Received::Idle => continue,
                Received::Exited => return Ok(()),
            }
        }
    }

    /// Dispatches on `workers` threads until the session exits.
    fn run_multi(&mut self, workers: usize) -> Result<(), DriverError>;

    fn exit(&self);

    fn exited(&self) -> bool;

    fn exit_handle(&self) -> ExitHandle;

    /// Detaches from the mount point. Called at most once per session.
    fn unmount(&mut self) -> Result<(), DriverError>;

    /// Cache invalidation hint; drivers without a cache return `Unsupported`.
    fn invalidate(&mut self, path: &Path) -> Result<(), DriverError>;
}
