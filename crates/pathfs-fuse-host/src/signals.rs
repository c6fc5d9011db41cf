// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Traps the signals a running mount reacts to and forwards them to its
//! signal queue. Interrupt and terminate stay with the ctrl-c handler.

use std::io;
use std::thread::JoinHandle;

use libc::c_int;
use pathfs_core::SignalQueue;
use signal_hook::consts::{SIGHUP, SIGUSR1, SIGUSR2};
use signal_hook::iterator::{Handle, Signals};
use tracing::{debug, warn};

/// `SIGHUP` reports usage, `SIGUSR1` toggles call tracing.
pub const FORWARDED: [c_int; 3] = [SIGHUP, SIGUSR1, SIGUSR2];

/// Forwards trapped signals until dropped.
pub struct SignalTraps {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalTraps {
    pub fn install(queue: SignalQueue) -> io::Result<Self> {
        let mut signals = Signals::new(FORWARDED)?;
        let handle = signals.handle();
        let thread = std::thread::Builder::new()
            .name("pathfs-signals".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    debug!(signal, "Trapped signal");
                    queue.raise(signal);
                }
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalTraps {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Signal forwarding thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use pathfs_core::driver::loopback::LoopbackDriver;
    use pathfs_core::driver::request::{Reply, Request};
    use pathfs_core::Mount;

    use super::*;
    use crate::memfs::MemFs;
    use crate::run::{serve, ServeMode};

    fn wait_for(queue: &SignalQueue, pending: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.len() < pending {
            assert!(Instant::now() < deadline, "signal never forwarded");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn trapped_signals_reach_the_mount() {
        let dir = tempfile::tempdir().unwrap();
        let driver = LoopbackDriver::new().unwrap();
        let client = driver.client();
        let mut mount = Mount::new(driver, MemFs::new());
        mount.initialize(dir.path(), &[] as &[&str]).unwrap();
        let signals = mount.signals();
        let traps = SignalTraps::install(signals.clone()).unwrap();

        signal_hook::low_level::raise(SIGUSR1).unwrap();
        wait_for(&signals, 1);
        drop(traps);

        let exit = mount.exit_handle().unwrap();
        let worker = std::thread::spawn(move || {
            let stat = client.request(Request::Getattr {
                path: PathBuf::from("/"),
            });
            exit.exit();
            stat
        });
        serve(&mut mount, ServeMode::Manual).unwrap();

        assert!(matches!(worker.join().unwrap(), Reply::Attr(st) if st.is_dir()));
        assert!(signals.is_empty());
        assert!(mount.trace_calls());
        mount.unmount().unwrap();
    }
}
