// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path-based filesystems over a C-ABI callback table.
//!
//! An implementation of [`Filesystem`] declares the operations it supports.
//! [`Mount`] turns that declaration into a native [`RawOperations`] table,
//! hands it to a [`Driver`], and runs the session's event loop. Every
//! callback crosses back into Rust through a trampoline that converts native
//! records, tracks open handles, and maps failures to negated errno values.
//!
//! ```no_run
//! use std::path::Path;
//! use pathfs_core::{Context, Filesystem, FsResult, Mount, Operation, OperationSet, Stat};
//! use pathfs_core::driver::loopback::LoopbackDriver;
//!
//! struct Empty;
//!
//! impl Filesystem for Empty {
//!     fn operations(&self) -> OperationSet {
//!         OperationSet::of(&[Operation::Getattr])
//!     }
//!
//!     fn getattr(&mut self, _cx: &Context<'_>, path: &Path) -> FsResult<Option<Stat>> {
//!         Ok((path == Path::new("/")).then(|| Stat::directory(0o755)))
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut mount = Mount::new(LoopbackDriver::new()?, Empty);
//! mount.initialize("/mnt/empty", &["-o", "fsname=empty"])?;
//! mount.run_loop()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod attr;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod filesystem;
pub mod filler;
pub mod handle;
pub mod mount;
pub mod signal;

pub use attr::{
    ConnInfo, Flock, LockCommand, LockKind, SetTime, Stat, StatVfs, Timespec, Whence, S_IFBLK,
    S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
};
pub use config::MountConfig;
pub use context::{Context, MountInfo};
pub use dispatch::{Binding, OperationTable, RawOperations};
pub use driver::{Driver, DriverError, ExitHandle, MountArgs, Session, UserData};
pub use error::{ErrorTranslator, FsError, FsResult, MarshalError, MountError};
pub use filesystem::{Filesystem, Operation, OperationSet};
pub use filler::{DirFiller, Fill};
pub use handle::{Handle, HandleId, HandleRegistry};
pub use mount::{Mount, MountState, ProcessOutcome, StateRef};
pub use signal::SignalQueue;

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex, MutexGuard};

    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct BufferWriter(Arc<Mutex<Vec<u8>>>);

    struct BufferGuard<'a>(MutexGuard<'a, Vec<u8>>);

    impl Write for BufferGuard<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for BufferWriter {
        type Writer = BufferGuard<'a>;

        fn make_writer(&'a self) -> Self::Writer {
            BufferGuard(self.0.lock().unwrap())
        }
    }

    /// Runs `f` with a thread-local subscriber and returns what it logged.
    /// Capped at debug, so per-call traces stay out unless forced.
    pub(crate) fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
        let writer = BufferWriter::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        let logs = String::from_utf8_lossy(&writer.0.lock().unwrap()).into_owned();
        (result, logs)
    }
}
