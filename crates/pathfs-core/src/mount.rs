// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount lifecycle controller.
//!
//! A [`Mount`] owns one filesystem implementation and one driver. It builds
//! the callback table at `initialize`, drives the session's event loop, and
//! tears everything down at `unmount` (or on drop).

use std::fmt;
use std::ops::Deref;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use libc::c_int;
use tracing::{debug, info, warn};

use crate::context::MountInfo;
use crate::dispatch::{Dispatch, DispatchGuard, DispatchState, OperationTable};
use crate::driver::{Driver, DriverError, ExitHandle, MountArgs, Received, Session};
use crate::error::{ErrorTranslator, MountError};
use crate::filesystem::Filesystem;
use crate::handle::HandleRegistry;
use crate::signal::SignalQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Created,
    Mounted,
    Unmounted,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MountState::Created => "created",
            MountState::Mounted => "mounted",
            MountState::Unmounted => "unmounted",
        })
    }
}

/// What one [`Mount::process_one_event`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// One request was read and answered.
    Dispatched,
    /// The descriptor woke up without a request.
    Idle,
    /// The session has exited; the caller should stop polling.
    Exited,
}

/// Owns a session and tears it down when dropped.
struct ActiveSession<S: Session>(Option<S>);

impl<S: Session> ActiveSession<S> {
    fn get(&self) -> Option<&S> {
        self.0.as_ref()
    }

    fn get_mut(&mut self) -> Option<&mut S> {
        self.0.as_mut()
    }
}

impl<S: Session> Drop for ActiveSession<S> {
    fn drop(&mut self) {
        if let Some(mut session) = self.0.take() {
            session.exit();
            if let Err(err) = session.unmount() {
                warn!(target: "pathfs::mount", error = %err, "Unmount during drop failed");
            }
        }
    }
}

/// Read access to part of the dispatch state, holding the call lock.
pub struct StateRef<'a, F, T: ?Sized> {
    guard: DispatchGuard<'a, F>,
    project: fn(&DispatchState<F>) -> &T,
}

impl<F, T: ?Sized> Deref for StateRef<'_, F, T> {
    type Target = T;

    fn deref(&self) -> &T {
        (self.project)(&self.guard)
    }
}

fn project_fs<F>(state: &DispatchState<F>) -> &F {
    &state.fs
}

fn project_handles<F>(state: &DispatchState<F>) -> &HandleRegistry {
    &state.handles
}

/// A filesystem implementation bound to a driver.
///
/// Dropping a mounted `Mount` exits and unmounts its session.
pub struct Mount<F: Filesystem, D: Driver> {
    // Declared before `dispatch` so the session (and its destroy callback)
    // is torn down while the dispatch state is still alive.
    session: ActiveSession<D::Session>,
    dispatch: Box<Dispatch<F>>,
    driver: D,
    table: Option<OperationTable>,
    state: MountState,
}

impl<F: Filesystem, D: Driver> Mount<F, D> {
    pub fn new(driver: D, fs: F) -> Self {
        Self {
            session: ActiveSession(None),
            dispatch: Dispatch::new(fs, ErrorTranslator::default()),
            driver,
            table: None,
            state: MountState::Created,
        }
    }

    /// Code returned for failures that carry no errno. Defaults to `ENOENT`.
    pub fn with_default_errno(mut self, errno: c_int) -> Self {
        self.dispatch.state_mut().translator = ErrorTranslator::new(errno);
        self
    }

    /// Builds the operation table and mounts it at `mount_point`.
    ///
    /// On failure the mount stays in [`MountState::Created`].
    pub fn initialize<S: AsRef<str>>(
        &mut self,
        mount_point: impl AsRef<Path>,
        options: &[S],
    ) -> Result<(), MountError> {
        if self.state != MountState::Created {
            return Err(MountError::InvalidState {
                expected: MountState::Created,
                actual: self.state,
            });
        }
        let mount_point = mount_point.as_ref();
        let rejected = |source: DriverError| MountError::Rejected {
            mount_point: mount_point.to_path_buf(),
            source,
        };

        let args = MountArgs::parse(options.iter().map(AsRef::as_ref)).map_err(rejected)?;
        let state = self.dispatch.state_mut();
        let table = OperationTable::build(state.fs.operations());
        state.info = Arc::new(MountInfo::new(mount_point, args.tokens().to_vec()));
        state.trace_calls = args.debug();
        state.fatal = None;

        let ops = table.native::<F>();
        let user_data = self.dispatch.user_data();
        let mut session = match self.driver.mount(mount_point, &args, ops, user_data) {
            Ok(session) => session,
            Err(err) => {
                warn!(
                    target: "pathfs::mount",
                    mount_point = %mount_point.display(),
                    error = %err,
                    "Mount rejected"
                );
                return Err(rejected(err));
            }
        };

        if let Some(err) = self.dispatch.state_mut().fatal.take() {
            session.exit();
            if let Err(unmount_err) = session.unmount() {
                warn!(target: "pathfs::mount", error = %unmount_err, "Unmount after failed init failed");
            }
            return Err(MountError::Marshal(err));
        }

        self.dispatch.state_mut().exit = Some(session.exit_handle());
        info!(
            target: "pathfs::mount",
            mount_point = %mount_point.display(),
            operations = table.len(),
            "Mounted filesystem"
        );
        self.session = ActiveSession(Some(session));
        self.table = Some(table);
        self.state = MountState::Mounted;
        Ok(())
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    /// True while the session is mounted and has not been asked to exit.
    pub fn mounted(&self) -> bool {
        self.state == MountState::Mounted && self.session.get().is_some_and(|s| !s.exited())
    }

    /// The operation table built at `initialize`.
    pub fn table(&self) -> Option<&OperationTable> {
        self.table.as_ref()
    }

    pub fn mount_info(&self) -> Arc<MountInfo> {
        Arc::clone(&self.dispatch.lock().info)
    }

    fn session_mut(&mut self) -> Result<&mut D::Session, MountError> {
        match self.state {
            MountState::Mounted => self.session.get_mut().ok_or(MountError::NotMounted),
            _ => Err(MountError::NotMounted),
        }
    }

    /// Descriptor that becomes readable when a request is waiting.
    pub fn event_source_descriptor(&self) -> Result<BorrowedFd<'_>, MountError> {
        match (self.state, self.session.get()) {
            (MountState::Mounted, Some(session)) => Ok(session.event_fd()),
            _ => Err(MountError::NotMounted),
        }
    }

    /// Reads and answers at most one request. Pending signals are delivered
    /// first.
    pub fn process_one_event(&mut self) -> Result<ProcessOutcome, MountError> {
        self.deliver_signals();
        let outcome = {
            let session = self.session_mut()?;
            if session.exited() {
                return Ok(ProcessOutcome::Exited);
            }
            match session.read_request()? {
                Received::Request(request) => {
                    session.dispatch(request);
                    ProcessOutcome::Dispatched
                }
                Received::Idle => ProcessOutcome::Idle,
                Received::Exited => ProcessOutcome::Exited,
            }
        };
        self.check_fatal()?;
        Ok(outcome)
    }

    /// Dispatches on the calling thread until the session exits.
    pub fn run_loop(&mut self) -> Result<(), MountError> {
        debug!(target: "pathfs::mount", "Entering single-threaded loop");
        self.session_mut()?.run()?;
        self.check_fatal()
    }

    /// Unmounts; later calls do nothing.
    pub fn unmount(&mut self) -> Result<(), MountError> {
        if self.state != MountState::Mounted {
            return Ok(());
        }
        let result = match self.session.0.take() {
            Some(mut session) => {
                session.exit();
                session.unmount()
            }
            None => Ok(()),
        };

        let state = self.dispatch.state_mut();
        state.exit = None;
        let leftover = state.handles.clear();
        if leftover > 0 {
            warn!(
                target: "pathfs::mount",
                leftover,
                "Dropping handles that were never released"
            );
        }
        self.state = MountState::Unmounted;
        info!(
            target: "pathfs::mount",
            mount_point = %state.info.mount_point.display(),
            "Unmounted filesystem"
        );
        result.map_err(MountError::from)
    }

    /// Asks the driver to drop cached state for `path`.
    pub fn invalidate(&mut self, path: impl AsRef<Path>) -> Result<(), MountError> {
        self.session_mut()?.invalidate(path.as_ref())?;
        Ok(())
    }

    /// A handle that stops the loop from any thread.
    pub fn exit_handle(&self) -> Option<ExitHandle> {
        self.session.get().map(Session::exit_handle)
    }

    pub fn exit(&self) {
        if let Some(session) = self.session.get() {
            session.exit();
        }
    }

    /// The queue signals are raised on. The blocking loops deliver them
    /// before the next dispatched call.
    pub fn signals(&self) -> SignalQueue {
        self.dispatch.lock().signals.clone()
    }

    /// Delivers pending signals now; returns how many were delivered.
    pub fn deliver_signals(&self) -> usize {
        self.dispatch.lock().deliver_signals()
    }

    /// Whether every call is traced, from `-d` or toggled by `SIGUSR1`.
    pub fn trace_calls(&self) -> bool {
        self.dispatch.lock().trace_calls
    }

    /// Shared access to the implementation; waits for any running handler.
    pub fn filesystem(&self) -> StateRef<'_, F, F> {
        StateRef {
            guard: self.dispatch.lock(),
            project: project_fs,
        }
    }

    pub fn filesystem_mut(&mut self) -> &mut F {
        &mut self.dispatch.state_mut().fs
    }

    /// The open-handle registry.
    pub fn handles(&self) -> StateRef<'_, F, HandleRegistry> {
        StateRef {
            guard: self.dispatch.lock(),
            project: project_handles,
        }
    }

    pub fn open_handles(&self) -> usize {
        self.dispatch.lock().handles.len()
    }

    /// Unmounts and returns the implementation.
    pub fn into_filesystem(mut self) -> F {
        if let Err(err) = self.unmount() {
            warn!(target: "pathfs::mount", error = %err, "Unmount failed");
        }
        let Mount { dispatch, .. } = self;
        dispatch.into_filesystem()
    }

    fn check_fatal(&mut self) -> Result<(), MountError> {
        match self.dispatch.state_mut().fatal.take() {
            Some(err) => Err(MountError::Marshal(err)),
            None => Ok(()),
        }
    }
}

impl<F: Filesystem + Send, D: Driver> Mount<F, D> {
    /// Dispatches on `workers` threads until the session exits. Handlers
    /// still run one at a time.
    pub fn run_loop_multi(&mut self, workers: usize) -> Result<(), MountError> {
        debug!(target: "pathfs::mount", workers, "Entering multi-threaded loop");
        self.session_mut()?.run_multi(workers)?;
        self.check_fatal()
    }
}

impl<F: Filesystem, D: Driver> fmt::Debug for Mount<F, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("state", &self.state)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
