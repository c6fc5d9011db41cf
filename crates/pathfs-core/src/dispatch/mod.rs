// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation dispatch table.
//!
//! [`OperationTable::build`] decides once per mount which callback slots are
//! wired; [`OperationTable::native`] turns that decision into the C-ABI
//! [`RawOperations`] table whose slots point at the generic trampolines.

mod trampolines;

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libc::{c_char, c_int, dev_t, gid_t, mode_t, off_t, size_t, uid_t};
use tracing::{debug, error, info, warn};

use crate::attr::RawConnInfo;
use crate::context::{MountInfo, RawContext};
use crate::driver::{ExitHandle, UserData};
use crate::error::{ErrorTranslator, MarshalError};
use crate::filesystem::{Filesystem, Operation, OperationSet};
use crate::filler::FillDirFn;
use crate::handle::{HandleRegistry, RawFileInfo};
use crate::signal::{SignalQueue, TRACE_TOGGLE};

pub type GetattrFn = unsafe extern "C" fn(*const RawContext, *const c_char, *mut libc::stat) -> c_int;
pub type ReadlinkFn =
    unsafe extern "C" fn(*const RawContext, *const c_char, *mut c_char, size_t) -> c_int;
pub type MknodFn = unsafe extern "C" fn(*const RawContext, *const c_char, mode_t, dev_t) -> c_int;
pub type ModeFn = unsafe extern "C" fn(*const RawContext, *const c_char, mode_t) -> c_int;
pub type PathFn = unsafe extern "C" fn(*const RawContext, *const c_char) -> c_int;
pub type TwoPathFn = unsafe extern "C" fn(*const RawContext, *const c_char, *const c_char) -> c_int;
pub type ChownFn = unsafe extern "C" fn(*const RawContext, *const c_char, uid_t, gid_t) -> c_int;
pub type TruncateFn = unsafe extern "C" fn(*const RawContext, *const c_char, off_t) -> c_int;
pub type UtimeFn =
    unsafe extern "C" fn(*const RawContext, *const c_char, *mut libc::utimbuf) -> c_int;
pub type FileInfoFn =
    unsafe extern "C" fn(*const RawContext, *const c_char, *mut RawFileInfo) -> c_int;
pub type ReadFn = unsafe extern "C" fn(
    *const RawContext,
    *const c_char,
    *mut c_char,
    size_t,
    off_t,
    *mut RawFileInfo,
) -> c_int;
pub type WriteFn = unsafe extern "C" fn(
    *const RawContext,
    *const c_char,
    *const c_char,
    size_t,
    off_t,
    *mut RawFileInfo,
) -> c_int;
pub type StatfsFn =
    unsafe extern "C" fn(*const RawContext, *const c_char, *mut libc::statvfs) -> c_int;
pub type FsyncFn =
    unsafe extern "C" fn(*const RawContext, *const c_char, c_int, *mut RawFileInfo) -> c_int;
pub type SetxattrFn = unsafe extern "C" fn(
    *const RawContext,
    *const c_char,
    *const c_char,
    *const c_char,
    size_t,
    c_int,
) -> c_int;
pub type GetxattrFn = unsafe extern "C" fn(
    *const RawContext,
    *const c_char,
    *const c_char,
    *mut c_char,
    size_t,
) -> c_int;
pub type ListxattrFn =
    unsafe extern "C" fn(*const RawContext, *const c_char, *mut c_char, size_t) -> c_int;
pub type ReaddirFn = unsafe extern "C" fn(
    *const RawContext,
    *const c_char,
    *mut c_void,
    Option<FillDirFn>,
    off_t,
    *mut RawFileInfo,
) -> c_int;
pub type InitFn = unsafe extern "C" fn(*const RawContext, *mut RawConnInfo) -> c_int;
pub type DestroyFn = unsafe extern "C" fn(*const RawContext);
pub type AccessFn = unsafe extern "C" fn(*const RawContext, *const c_char, c_int) -> c_int;
pub type CreateFn =
    unsafe extern "C" fn(*const RawContext, *const c_char, mode_t, *mut RawFileInfo) -> c_int;
pub type FtruncateFn =
    unsafe extern "C" fn(*const RawContext, *const c_char, off_t, *mut RawFileInfo) -> c_int;
pub type FgetattrFn = unsafe extern "C" fn(
    *const RawContext,
    *const c_char,
    *mut libc::stat,
    *mut RawFileInfo,
) -> c_int;
pub type LockFn = unsafe extern "C" fn(
    *const RawContext,
    *const c_char,
    *mut RawFileInfo,
    c_int,
    *mut libc::flock,
) -> c_int;
/// The times argument points at two entries: access then modification.
pub type UtimensFn =
    unsafe extern "C" fn(*const RawContext, *const c_char, *const libc::timespec) -> c_int;
pub type BmapFn = unsafe extern "C" fn(*const RawContext, *const c_char, size_t, *mut u64) -> c_int;

macro_rules! raw_operations {
    ($($field:ident: $ty:ty => $op:ident,)*) => {
        /// The C-ABI callback table registered with the driver.
        ///
        /// An empty slot means the operation is unsupported; the driver
        /// answers it with `ENOSYS` or its own default.
        #[repr(C)]
        #[derive(Clone, Copy, Default)]
        pub struct RawOperations {
            $(pub $field: Option<$ty>,)*
        }

        impl RawOperations {
            pub fn is_wired(&self, op: Operation) -> bool {
                match op {
                    $(Operation::$op => self.$field.is_some(),)*
                }
            }
        }
    };
}

raw_operations! {
    getattr: GetattrFn => Getattr,
    readlink: ReadlinkFn => Readlink,
    mknod: MknodFn => Mknod,
    mkdir: ModeFn => Mkdir,
    unlink: PathFn => Unlink,
    rmdir: PathFn => Rmdir,
    symlink: TwoPathFn => Symlink,
    rename: TwoPathFn => Rename,
    link: TwoPathFn => Link,
    chmod: ModeFn => Chmod,
    chown: ChownFn => Chown,
    truncate: TruncateFn => Truncate,
    utime: UtimeFn => Utime,
    open: FileInfoFn => Open,
    read: ReadFn => Read,
    write: WriteFn => Write,
    statfs: StatfsFn => Statfs,
    flush: FileInfoFn => Flush,
    release: FileInfoFn => Release,
    fsync: FsyncFn => Fsync,
    setxattr: SetxattrFn => Setxattr,
    getxattr: GetxattrFn => Getxattr,
    listxattr: ListxattrFn => Listxattr,
    removexattr: TwoPathFn => Removexattr,
    opendir: FileInfoFn => Opendir,
    readdir: ReaddirFn => Readdir,
    releasedir: FileInfoFn => Releasedir,
    fsyncdir: FsyncFn => Fsyncdir,
    init: InitFn => Init,
    destroy: DestroyFn => Destroy,
    access: AccessFn => Access,
    create: CreateFn => Create,
    ftruncate: FtruncateFn => Ftruncate,
    fgetattr: FgetattrFn => Fgetattr,
    lock: LockFn => Lock,
    utimens: UtimensFn => Utimens,
    bmap: BmapFn => Bmap,
}

impl fmt::Debug for RawOperations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(Operation::ALL.iter().filter(|op| self.is_wired(**op)).map(|op| op.name()))
            .finish()
    }
}

/// How a wired slot is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Forwarded to the implementation's handler.
    Handler,
    /// Served by the adapter itself (handle cleanup only).
    Builtin,
}

/// Which operations are wired for one mount. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationTable {
    bindings: BTreeMap<Operation, Binding>,
}

impl OperationTable {
    /// Wires every declared operation. A declared `open` or `create` without
    /// `release` gets a built-in release; `opendir` without `releasedir`
    /// gets a built-in releasedir.
    pub fn build(declared: OperationSet) -> Self {
        let mut bindings: BTreeMap<_, _> =
            declared.iter().map(|op| (op, Binding::Handler)).collect();

        let opens_files =
            declared.contains(Operation::Open) || declared.contains(Operation::Create);
        if opens_files && !declared.contains(Operation::Release) {
            bindings.insert(Operation::Release, Binding::Builtin);
        }
        if declared.contains(Operation::Opendir) && !declared.contains(Operation::Releasedir) {
            bindings.insert(Operation::Releasedir, Binding::Builtin);
        }

        debug!(
            target: "pathfs::dispatch",
            declared = declared.len(),
            wired = bindings.len(),
            "Built operation table"
        );
        Self { bindings }
    }

    pub fn binding(&self, op: Operation) -> Option<Binding> {
        self.bindings.get(&op).copied()
    }

    pub fn is_wired(&self, op: Operation) -> bool {
        self.bindings.contains_key(&op)
    }

    pub fn wired(&self) -> impl Iterator<Item = (Operation, Binding)> + '_ {
        self.bindings.iter().map(|(op, binding)| (*op, *binding))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// The native table whose trampolines dispatch to `F`.
    pub fn native<F: Filesystem>(&self) -> RawOperations {
        use trampolines as t;

        let mut ops = RawOperations::default();
        for (op, binding) in self.wired() {
            match (op, binding) {
                (Operation::Getattr, _) => ops.getattr = Some(t::getattr::<F>),
                (Operation::Readlink, _) => ops.readlink = Some(t::readlink::<F>),
                (Operation::Mknod, _) => ops.mknod = Some(t::mknod::<F>),
                (Operation::Mkdir, _) => ops.mkdir = Some(t::mkdir::<F>),
                (Operation::Unlink, _) => ops.unlink = Some(t::unlink::<F>),
                (Operation::Rmdir, _) => ops.rmdir = Some(t::rmdir::<F>),
                (Operation::Symlink, _) => ops.symlink = Some(t::symlink::<F>),
                (Operation::Rename, _) => ops.rename = Some(t::rename::<F>),
                (Operation::Link, _) => ops.link = Some(t::link::<F>),
                (Operation::Chmod, _) => ops.chmod = Some(t::chmod::<F>),
                (Operation::Chown, _) => ops.chown = Some(t::chown::<F>),
                (Operation::Truncate, _) => ops.truncate = Some(t::truncate::<F>),
                (Operation::Utime, _) => ops.utime = Some(t::utime::<F>),
                (Operation::Open, _) => ops.open = Some(t::open::<F>),
                (Operation::Read, _) => ops.read = Some(t::read::<F>),
                (Operation::Write, _) => ops.write = Some(t::write::<F>),
                (Operation::Statfs, _) => ops.statfs = Some(t::statfs::<F>),
                (Operation::Flush, _) => ops.flush = Some(t::flush::<F>),
                (Operation::Release, Binding::Handler) => ops.release = Some(t::release::<F>),
                (Operation::Release, Binding::Builtin) => {
                    ops.release = Some(t::release_builtin::<F>)
                }
                (Operation::Fsync, _) => ops.fsync = Some(t::fsync::<F>),
                (Operation::Setxattr, _) => ops.setxattr = Some(t::setxattr::<F>),
                (Operation::Getxattr, _) => ops.getxattr = Some(t::getxattr::<F>),
                (Operation::Listxattr, _) => ops.listxattr = Some(t::listxattr::<F>),
                (Operation::Removexattr, _) => ops.removexattr = Some(t::removexattr::<F>),
                (Operation::Opendir, _) => ops.opendir = Some(t::opendir::<F>),
                (Operation::Readdir, _) => ops.readdir = Some(t::readdir::<F>),
                (Operation::Releasedir, Binding::Handler) => {
                    ops.releasedir = Some(t::releasedir::<F>)
                }
                (Operation::Releasedir, Binding::Builtin) => {
                    ops.releasedir = Some(t::releasedir_builtin::<F>)
                }
                (Operation::Fsyncdir, _) => ops.fsyncdir = Some(t::fsyncdir::<F>),
                (Operation::Init, _) => ops.init = Some(t::init::<F>),
                (Operation::Destroy, _) => ops.destroy = Some(t::destroy::<F>),
                (Operation::Access, _) => ops.access = Some(t::access::<F>),
                (Operation::Create, _) => ops.create = Some(t::create::<F>),
                (Operation::Ftruncate, _) => ops.ftruncate = Some(t::ftruncate::<F>),
                (Operation::Fgetattr, _) => ops.fgetattr = Some(t::fgetattr::<F>),
                (Operation::Lock, _) => ops.lock = Some(t::lock::<F>),
                (Operation::Utimens, _) => ops.utimens = Some(t::utimens::<F>),
                (Operation::Bmap, _) => ops.bmap = Some(t::bmap::<F>),
            }
        }
        ops
    }
}

/// Everything a trampoline touches, guarded by [`Dispatch`]'s call lock.
pub(crate) struct DispatchState<F> {
    pub(crate) fs: F,
    pub(crate) handles: HandleRegistry,
    pub(crate) info: Arc<MountInfo>,
    pub(crate) translator: ErrorTranslator,
    pub(crate) trace_calls: bool,
    pub(crate) signals: SignalQueue,
    pub(crate) fatal: Option<MarshalError>,
    pub(crate) exit: Option<ExitHandle>,
}

impl<F> DispatchState<F> {
    /// Records a shape failure and ends the session; the driver gets `-EIO`.
    pub(crate) fn record_fatal(&mut self, op: Operation, err: MarshalError) -> c_int {
        error!(
            target: "pathfs::dispatch",
            operation = %op,
            error = %err,
            "Handler returned a malformed record; ending session"
        );
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
        if let Some(exit) = &self.exit {
            exit.exit();
        }
        -libc::EIO
    }
}

impl<F: Filesystem> DispatchState<F> {
    /// Hands every pending signal to the implementation; returns how many.
    pub(crate) fn deliver_signals(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(signal) = self.signals.pop() {
            self.deliver_signal(signal);
            delivered += 1;
        }
        delivered
    }

    fn deliver_signal(&mut self, signal: c_int) {
        if signal == TRACE_TOGGLE {
            self.trace_calls = !self.trace_calls;
            info!(
                target: "pathfs::dispatch",
                trace_calls = self.trace_calls,
                "Toggled call tracing"
            );
        }
        debug!(target: "pathfs::dispatch", signal, "Delivering signal");
        let fs = &mut self.fs;
        if panic::catch_unwind(AssertUnwindSafe(|| fs.signal(signal))).is_err() {
            warn!(target: "pathfs::dispatch", signal, "Signal handler panicked");
        }
    }
}

/// Per-mount dispatch state, handed to the driver as user data.
///
/// Every trampoline holds `call_lock` for its whole invocation, so at most
/// one handler runs at a time even when the driver dispatches from several
/// threads.
pub(crate) struct Dispatch<F> {
    call_lock: Mutex<()>,
    state: UnsafeCell<DispatchState<F>>,
}

// SAFETY: all access to `state` goes through `call_lock` (or `&mut self`);
// sharing across threads only requires that `F` may move between them.
unsafe impl<F: Send> Sync for Dispatch<F> {}
unsafe impl<F: Send> Send for Dispatch<F> {}

impl<F> Dispatch<F> {
    pub(crate) fn new(fs: F, translator: ErrorTranslator) -> Box<Self> {
        Box::new(Self {
            call_lock: Mutex::new(()),
            state: UnsafeCell::new(DispatchState {
                fs,
                handles: HandleRegistry::new(),
                info: Arc::new(MountInfo::default()),
                translator,
                trace_calls: false,
                signals: SignalQueue::new(),
                fatal: None,
                exit: None,
            }),
        })
    }

    /// The pointer the driver hands back in [`RawContext::private_data`].
    pub(crate) fn user_data(&self) -> UserData {
        UserData::new(self as *const Self as *mut c_void)
    }

    pub(crate) fn lock(&self) -> DispatchGuard<'_, F> {
        DispatchGuard {
            _guard: self.call_lock.lock().unwrap_or_else(PoisonError::into_inner),
            dispatch: self,
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut DispatchState<F> {
        self.state.get_mut()
    }

    pub(crate) fn into_filesystem(self: Box<Self>) -> F {
        self.state.into_inner().fs
    }
}

pub(crate) struct DispatchGuard<'a, F> {
    _guard: MutexGuard<'a, ()>,
    dispatch: &'a Dispatch<F>,
}

impl<F> Deref for DispatchGuard<'_, F> {
    type Target = DispatchState<F>;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the call lock is held for the guard's lifetime.
        unsafe { &*self.dispatch.state.get() }
    }
}

impl<F> DerefMut for DispatchGuard<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the call lock is held for the guard's lifetime.
        unsafe { &mut *self.dispatch.state.get() }
    }
}

#[cfg(test)]
mod tests;
