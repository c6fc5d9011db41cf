// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Signals forwarded into a mount.
//!
//! A signal handler (or any other thread) raises signals on a
//! [`SignalQueue`]; the mount delivers them to its filesystem under the call
//! lock, before the next dispatched call or whenever the host calls
//! [`Mount::deliver_signals`](crate::Mount::deliver_signals). `SIGUSR1`
//! additionally toggles per-call tracing.

use std::fmt;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use libc::c_int;

/// The signal that toggles per-call tracing when delivered.
pub const TRACE_TOGGLE: c_int = libc::SIGUSR1;

/// Pending signals shared between the raising threads and the mount.
#[derive(Clone, Default)]
pub struct SignalQueue(Arc<SegQueue<c_int>>);

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `signal` for delivery. Safe to call from any thread.
    pub fn raise(&self, signal: c_int) {
        self.0.push(signal);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn pop(&self) -> Option<c_int> {
        self.0.pop()
    }
}

impl fmt::Debug for SignalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalQueue")
            .field("pending", &self.len())
            .finish()
    }
}
