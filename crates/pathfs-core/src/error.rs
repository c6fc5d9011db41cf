// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types and the errno translation policy applied at the native boundary.

use std::any::Any;
use std::backtrace::Backtrace;
use std::io;
use std::path::PathBuf;

use libc::c_int;
use thiserror::Error;
use tracing::error;

use crate::driver::DriverError;
use crate::filesystem::Operation;
use crate::mount::MountState;

/// Failure returned by a filesystem handler.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("resource busy")]
    Busy,
    #[error("no space left")]
    NoSpace,
    #[error("name too long")]
    NameTooLong,
    #[error("operation not supported")]
    NotSupported,
    #[error("result too large")]
    Range,
    #[error("no such attribute")]
    NoData,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("cross-device link")]
    CrossDevice,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("errno {0}")]
    Errno(c_int),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed record: {0}")]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl FsError {
    /// The POSIX code this failure carries, if any.
    ///
    /// `None` marks an unexpected failure: the translator logs it and
    /// substitutes the mount's default code.
    pub fn errno(&self) -> Option<c_int> {
        let code = match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::AccessDenied => libc::EACCES,
            FsError::PermissionDenied => libc::EPERM,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Busy => libc::EBUSY,
            FsError::NoSpace => libc::ENOSPC,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::Range => libc::ERANGE,
            FsError::NoData => libc::ENODATA,
            FsError::BadFileDescriptor => libc::EBADF,
            FsError::ReadOnly => libc::EROFS,
            FsError::CrossDevice => libc::EXDEV,
            FsError::NotImplemented => libc::ENOSYS,
            FsError::Errno(code) if *code > 0 => *code,
            FsError::Errno(_) => return None,
            FsError::Io(err) => return err.raw_os_error().filter(|code| *code > 0),
            FsError::Marshal(_) | FsError::Other(_) => return None,
        };
        Some(code)
    }

    /// Wraps an arbitrary error as an un-coded failure.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        FsError::Other(err.into())
    }
}

/// A record could not be converted to or from its native layout.
///
/// This is an implementation bug, not a filesystem condition, so it is never
/// reported as an errno.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("null pointer passed for {0}")]
    NullPointer(&'static str),
    #[error("{0} contains an interior NUL byte")]
    InteriorNul(&'static str),
    #[error("{field} value {value} does not fit the native field")]
    OutOfRange { field: &'static str, value: i128 },
    #[error("nanosecond component {0} is out of range")]
    InvalidNanos(i128),
    #[error("unknown lock type {0}")]
    UnknownLockType(i32),
    #[error("unknown lock whence {0}")]
    UnknownWhence(i32),
}

/// Lifecycle and session failures surfaced by [`crate::Mount`].
#[derive(Error, Debug)]
pub enum MountError {
    #[error("filesystem is not mounted")]
    NotMounted,
    #[error("mount is {actual}, expected {expected}")]
    InvalidState {
        expected: MountState,
        actual: MountState,
    },
    #[error("mount of {} rejected: {source}", mount_point.display())]
    Rejected {
        mount_point: PathBuf,
        #[source]
        source: DriverError,
    },
    #[error("handler returned a malformed record: {0}")]
    Marshal(#[source] MarshalError),
    #[error("driver failure: {0}")]
    Driver(#[from] DriverError),
    #[error("invalid mount configuration: {0}")]
    Config(String),
}

/// Maps handler failures to the negated codes returned to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorTranslator {
    default_errno: c_int,
}

impl Default for ErrorTranslator {
    fn default() -> Self {
        Self::new(libc::ENOENT)
    }
}

impl ErrorTranslator {
    pub fn new(default_errno: c_int) -> Self {
        Self { default_errno }
    }

    pub fn default_errno(&self) -> c_int {
        self.default_errno
    }

    /// Coded failures return silently; everything else is logged with a
    /// backtrace and reported as the default code.
    pub fn translate(&self, op: Operation, err: &FsError) -> c_int {
        match err.errno() {
            Some(code) => -code,
            None => {
                let backtrace = Backtrace::force_capture();
                error!(
                    target: "pathfs::dispatch",
                    operation = %op,
                    error = %err,
                    details = ?err,
                    default_errno = self.default_errno,
                    "Handler failed without an errno\n{backtrace}"
                );
                -self.default_errno
            }
        }
    }

    /// Reports a handler panic caught at the trampoline boundary.
    pub fn translate_panic(&self, op: Operation, payload: &(dyn Any + Send)) -> c_int {
        let message = panic_message(payload);
        let backtrace = Backtrace::force_capture();
        error!(
            target: "pathfs::dispatch",
            operation = %op,
            panic = %message,
            default_errno = self.default_errno,
            "Handler panicked\n{backtrace}"
        );
        -self.default_errno
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
