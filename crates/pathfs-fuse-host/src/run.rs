// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Serving a mounted filesystem until its session exits.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use pathfs_core::{Driver, DriverError, Filesystem, Mount, MountError, ProcessOutcome};
use tracing::{debug, info};

const POLL_INTERVAL_MS: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// The single-threaded loop.
    Blocking,
    /// The multi-threaded loop with this many workers.
    Multi(usize),
    /// Poll the event descriptor here and process one event per wake-up.
    Manual,
}

impl ServeMode {
    pub fn select(threads: usize, manual: bool) -> Self {
        match (manual, threads) {
            (true, _) => ServeMode::Manual,
            (false, 0 | 1) => ServeMode::Blocking,
            (false, n) => ServeMode::Multi(n),
        }
    }
}

/// Runs the loop `mode` selects. The blocking loops deliver pending signals
/// before each dispatched call.
pub fn serve<F, D>(mount: &mut Mount<F, D>, mode: ServeMode) -> Result<(), MountError>
where
    F: Filesystem + Send,
    D: Driver,
{
    info!(?mode, "Serving requests");
    match mode {
        ServeMode::Blocking => mount.run_loop(),
        ServeMode::Multi(workers) => mount.run_loop_multi(workers),
        ServeMode::Manual => manual_loop(mount),
    }
}

/// Drives the mount from an external poll loop, the way an application
/// embedding the adapter in its own event loop would. Pending signals are
/// delivered on every wake-up, idle ones included.
pub fn manual_loop<F, D>(mount: &mut Mount<F, D>) -> Result<(), MountError>
where
    F: Filesystem,
    D: Driver,
{
    let mut dispatched = 0u64;
    loop {
        let ready = {
            let fd = mount.event_source_descriptor()?;
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(DriverError::Io(err.into()).into()),
            }
        };
        if !ready {
            if mount.exit_handle().is_some_and(|exit| exit.exited()) {
                break;
            }
            mount.deliver_signals();
            continue;
        }
        match mount.process_one_event()? {
            ProcessOutcome::Dispatched => dispatched += 1,
            ProcessOutcome::Idle => {}
            ProcessOutcome::Exited => break,
        }
    }
    debug!(dispatched, "Manual loop finished");
    Ok(())
}
