// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Native-signature trampolines.
//!
//! Each one recovers the mount's [`Dispatch`] from the context's user-data
//! pointer, marshals its arguments, runs the handler under the call lock
//! inside `catch_unwind`, and returns `0`, a byte count, or `-errno`.

use std::ffi::{c_void, CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use libc::{c_char, c_int, dev_t, gid_t, mode_t, off_t, size_t, uid_t};
use tracing::{error, info, trace, Level};

use super::{Dispatch, DispatchState};
use crate::attr::{ConnInfo, Flock, LockCommand, RawConnInfo, SetTime};
use crate::context::{Context, RawContext};
use crate::error::{FsError, FsResult, MarshalError};
use crate::filesystem::{Filesystem, Operation};
use crate::filler::{DirFiller, FillDirFn};
use crate::handle::{Handle, HandleId, RawFileInfo};

macro_rules! call_event {
    ($forced:expr, $($field:tt)+) => {
        if $forced {
            info!(target: "pathfs::dispatch", $($field)+)
        } else {
            trace!(target: "pathfs::dispatch", $($field)+)
        }
    };
}

/// Runs `body` for one native call and folds every outcome into a return code.
///
/// # Safety
///
/// `ctx` must be null or point at a valid [`RawContext`] whose
/// `private_data` is null or the `Dispatch<F>` registered for this mount.
unsafe fn invoke<F, B>(ctx: *const RawContext, op: Operation, path: *const c_char, body: B) -> c_int
where
    F: Filesystem,
    B: FnOnce(&mut DispatchState<F>, &Context<'_>) -> FsResult<c_int>,
{
    // SAFETY: guaranteed by the caller.
    let Some(raw) = (unsafe { ctx.as_ref() }) else {
        error!(target: "pathfs::dispatch", operation = %op, "Driver passed a null context");
        return -libc::EIO;
    };
    // SAFETY: guaranteed by the caller.
    let Some(dispatch) = (unsafe { (raw.private_data as *const Dispatch<F>).as_ref() }) else {
        error!(target: "pathfs::dispatch", operation = %op, "Context carries no mount");
        return -libc::EIO;
    };

    let mut guard = dispatch.lock();
    let state = &mut *guard;
    let info = Arc::clone(&state.info);
    let cx = Context::from_native(raw, &info);
    state.deliver_signals();
    // Forced tracing (`-d` or `SIGUSR1`) logs at info so the default filter
    // shows it; otherwise calls are traced only when the filter asks.
    let forced = state.trace_calls;
    let traced = forced || tracing::enabled!(target: "pathfs::dispatch", Level::TRACE);
    if traced {
        // SAFETY: guaranteed by the caller.
        let shown = unsafe { describe_path(path) };
        call_event!(
            forced,
            operation = %op,
            path = %shown,
            uid = cx.uid(),
            pid = cx.pid(),
            "==> call"
        );
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut *state, &cx)));
    let rc = match outcome {
        Ok(Ok(rc)) => rc,
        Ok(Err(FsError::Marshal(err))) => state.record_fatal(op, err),
        Ok(Err(err)) => state.translator.translate(op, &err),
        Err(payload) => state.translator.translate_panic(op, payload.as_ref()),
    };

    if traced {
        call_event!(forced, operation = %op, rc, "<== return");
    }
    rc
}

unsafe fn describe_path(path: *const c_char) -> String {
    if path.is_null() {
        return String::from("-");
    }
    // SAFETY: non-null paths from the driver are NUL-terminated.
    unsafe { CStr::from_ptr(path) }.to_string_lossy().into_owned()
}

unsafe fn path_arg<'p>(ptr: *const c_char) -> Result<&'p Path, MarshalError> {
    // SAFETY: forwarded from the trampoline's caller.
    unsafe { name_arg(ptr, "path") }.map(Path::new)
}

unsafe fn name_arg<'p>(ptr: *const c_char, what: &'static str) -> Result<&'p OsStr, MarshalError> {
    if ptr.is_null() {
        return Err(MarshalError::NullPointer(what));
    }
    // SAFETY: non-null strings from the driver are NUL-terminated.
    Ok(OsStr::from_bytes(unsafe { CStr::from_ptr(ptr) }.to_bytes()))
}

unsafe fn out_arg<'p, T>(ptr: *mut T, what: &'static str) -> Result<&'p mut T, MarshalError> {
    // SAFETY: non-null output pointers from the driver are valid and unaliased.
    unsafe { ptr.as_mut() }.ok_or(MarshalError::NullPointer(what))
}

unsafe fn bytes_arg<'p>(ptr: *const c_char, len: size_t) -> Result<&'p [u8], MarshalError> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(MarshalError::NullPointer("data buffer"));
    }
    // SAFETY: the driver guarantees `len` readable bytes at `ptr`.
    Ok(unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) })
}

unsafe fn handle_id(fi: *const RawFileInfo) -> Option<HandleId> {
    // SAFETY: non-null file-info pointers from the driver are valid.
    unsafe { fi.as_ref() }.and_then(RawFileInfo::handle_id)
}

fn offset_arg(offset: off_t) -> FsResult<u64> {
    u64::try_from(offset).map_err(|_| FsError::InvalidArgument)
}

fn length(len: usize) -> Result<c_int, MarshalError> {
    c_int::try_from(len).map_err(|_| MarshalError::OutOfRange {
        field: "reply length",
        value: len as i128,
    })
}

/// Copies `data` into a caller buffer of `size` bytes.
unsafe fn copy_out(data: &[u8], dst: *mut c_char) -> Result<(), MarshalError> {
    if data.is_empty() {
        return Ok(());
    }
    if dst.is_null() {
        return Err(MarshalError::NullPointer("reply buffer"));
    }
    // SAFETY: callers check that `data` fits the buffer.
    unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst.cast::<u8>(), data.len()) };
    Ok(())
}

/// xattr convention: a zero `size` asks for the length, a short buffer is `ERANGE`.
unsafe fn sized_reply(data: &[u8], dst: *mut c_char, size: size_t) -> FsResult<c_int> {
    let len = length(data.len())?;
    if size == 0 {
        return Ok(len);
    }
    if data.len() > size {
        return Err(FsError::Range);
    }
    // SAFETY: `data` fits in `size` bytes.
    unsafe { copy_out(data, dst)? };
    Ok(len)
}

pub(super) unsafe extern "C" fn getattr<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    stbuf: *mut libc::stat,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Getattr, path, |state, cx| {
            let path = path_arg(path)?;
            let stat = state.fs.getattr(cx, path)?.ok_or(FsError::NotFound)?;
            stat.to_native(out_arg(stbuf, "stat buffer")?)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn readlink<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    buf: *mut c_char,
    size: size_t,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Readlink, path, |state, cx| {
            let path = path_arg(path)?;
            let target = state.fs.readlink(cx, path)?;
            if size == 0 {
                return Ok(0);
            }
            if buf.is_null() {
                return Err(MarshalError::NullPointer("link buffer").into());
            }
            let bytes = target.as_bytes();
            let copied = bytes.len().min(size - 1);
            copy_out(&bytes[..copied], buf)?;
            *out_arg(buf.add(copied), "link buffer")? = 0;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn mknod<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    mode: mode_t,
    rdev: dev_t,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Mknod, path, |state, cx| {
            let path = path_arg(path)?;
            let rdev = u64::try_from(rdev).map_err(|_| FsError::InvalidArgument)?;
            state.fs.mknod(cx, path, mode.into(), rdev)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn mkdir<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    mode: mode_t,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Mkdir, path, |state, cx| {
            state.fs.mkdir(cx, path_arg(path)?, mode.into())?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn unlink<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Unlink, path, |state, cx| {
            state.fs.unlink(cx, path_arg(path)?)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn rmdir<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Rmdir, path, |state, cx| {
            state.fs.rmdir(cx, path_arg(path)?)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn symlink<F: Filesystem>(
    ctx: *const RawContext,
    target: *const c_char,
    link: *const c_char,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Symlink, link, |state, cx| {
            let target = Path::new(name_arg(target, "link target")?);
            state.fs.symlink(cx, target, path_arg(link)?)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn rename<F: Filesystem>(
    ctx: *const RawContext,
    from: *const c_char,
    to: *const c_char,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Rename, from, |state, cx| {
            state.fs.rename(cx, path_arg(from)?, path_arg(to)?)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn link<F: Filesystem>(
    ctx: *const RawContext,
    from: *const c_char,
    to: *const c_char,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Link, from, |state, cx| {
            state.fs.link(cx, path_arg(from)?, path_arg(to)?)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn chmod<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    mode: mode_t,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Chmod, path, |state, cx| {
            state.fs.chmod(cx, path_arg(path)?, mode.into())?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn chown<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    uid: uid_t,
    gid: gid_t,
) -> c_int {
    // `(uid_t)-1` leaves the id unchanged.
    let uid = (uid != uid_t::MAX).then_some(uid);
    let gid = (gid != gid_t::MAX).then_some(gid);
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Chown, path, |state, cx| {
            state.fs.chown(cx, path_arg(path)?, uid, gid)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn truncate<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    size: off_t,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Truncate, path, |state, cx| {
            let path = path_arg(path)?;
            state.fs.truncate(cx, path, offset_arg(size)?)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn utime<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    times: *mut libc::utimbuf,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Utime, path, |state, cx| {
            let path = path_arg(path)?;
            let (atime, mtime) = match times.as_ref() {
                Some(times) => (i64::from(times.actime), i64::from(times.modtime)),
                None => {
                    let now = crate::attr::Timespec::now().sec;
                    (now, now)
                }
            };
            state.fs.utime(cx, path, atime, mtime)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn open<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Open, path, |state, cx| {
            let path = path_arg(path)?;
            let fi = out_arg(fi, "file info")?;
            let mut handle = Handle::from_native(fi);
            state.fs.open(cx, path, &mut handle)?;
            register(state, fi, handle, path);
            Ok(0)
        })
    }
}

fn register<F>(state: &mut DispatchState<F>, fi: &mut RawFileInfo, handle: Handle, path: &Path) {
    handle.write_native(fi);
    let id = state.handles.register(handle);
    fi.fh = id.as_raw();
    trace!(
        target: "pathfs::handles",
        handle = %id,
        path = %path.display(),
        open = state.handles.len(),
        "Registered handle"
    );
}

pub(super) unsafe extern "C" fn read<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    buf: *mut c_char,
    size: size_t,
    offset: off_t,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Read, path, |state, cx| {
            let path = path_arg(path)?;
            let offset = offset_arg(offset)?;
            let handle = handle_id(fi).and_then(|id| state.handles.lookup_mut(id));
            let data = state.fs.read(cx, path, size, offset, handle)?;
            if data.len() > size {
                return Err(FsError::other(anyhow::anyhow!(
                    "read handler returned {} bytes for a {size} byte request on {}",
                    data.len(),
                    path.display()
                )));
            }
            copy_out(&data, buf)?;
            Ok(length(data.len())?)
        })
    }
}

pub(super) unsafe extern "C" fn write<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    buf: *const c_char,
    size: size_t,
    offset: off_t,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Write, path, |state, cx| {
            let path = path_arg(path)?;
            let offset = offset_arg(offset)?;
            let data = bytes_arg(buf, size)?;
            let handle = handle_id(fi).and_then(|id| state.handles.lookup_mut(id));
            let written = state.fs.write(cx, path, data, offset, handle)?;
            Ok(length(written)?)
        })
    }
}

pub(super) unsafe extern "C" fn statfs<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    stbuf: *mut libc::statvfs,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Statfs, path, |state, cx| {
            let path = path_arg(path)?;
            let vfs = state.fs.statfs(cx, path)?.ok_or(FsError::NotFound)?;
            vfs.to_native(out_arg(stbuf, "statvfs buffer")?)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn flush<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Flush, path, |state, cx| {
            let path = path_arg(path)?;
            let handle = handle_id(fi).and_then(|id| state.handles.lookup_mut(id));
            state.fs.flush(cx, path, handle)?;
            Ok(0)
        })
    }
}

/// Deregisters before the handler runs, so a failing or panicking handler
/// still releases the handle exactly once.
pub(super) unsafe extern "C" fn release<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Release, path, |state, cx| {
            let handle = take_handle(state, fi);
            state.fs.release(cx, path_arg(path)?, handle)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn release_builtin<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Release, path, |state, _cx| {
            take_handle(state, fi);
            Ok(0)
        })
    }
}

unsafe fn take_handle<F>(state: &mut DispatchState<F>, fi: *mut RawFileInfo) -> Option<Handle> {
    // SAFETY: forwarded from the trampoline's caller.
    let id = unsafe { handle_id(fi) }?;
    let handle = state.handles.deregister(id);
    trace!(
        target: "pathfs::handles",
        handle = %id,
        found = handle.is_some(),
        open = state.handles.len(),
        "Deregistered handle"
    );
    handle
}

pub(super) unsafe extern "C" fn fsync<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    datasync: c_int,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Fsync, path, |state, cx| {
            let path = path_arg(path)?;
            let handle = handle_id(fi).and_then(|id| state.handles.lookup_mut(id));
            state.fs.fsync(cx, path, datasync != 0, handle)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn setxattr<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    name: *const c_char,
    value: *const c_char,
    size: size_t,
    flags: c_int,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Setxattr, path, |state, cx| {
            let path = path_arg(path)?;
            let name = name_arg(name, "attribute name")?;
            let value = bytes_arg(value, size)?;
            state.fs.setxattr(cx, path, name, value, flags)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn getxattr<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    name: *const c_char,
    value: *mut c_char,
    size: size_t,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Getxattr, path, |state, cx| {
            let path = path_arg(path)?;
            let name = name_arg(name, "attribute name")?;
            let data = state.fs.getxattr(cx, path, name)?;
            sized_reply(&data, value, size)
        })
    }
}

pub(super) unsafe extern "C" fn listxattr<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    list: *mut c_char,
    size: size_t,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Listxattr, path, |state, cx| {
            let path = path_arg(path)?;
            let names = state.fs.listxattr(cx, path)?;
            let mut packed = Vec::new();
            for name in &names {
                let bytes = name.as_bytes();
                if bytes.contains(&0) {
                    return Err(MarshalError::InteriorNul("attribute name").into());
                }
                packed.extend_from_slice(bytes);
                packed.push(0);
            }
            sized_reply(&packed, list, size)
        })
    }
}

pub(super) unsafe extern "C" fn removexattr<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    name: *const c_char,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Removexattr, path, |state, cx| {
            let path = path_arg(path)?;
            state.fs.removexattr(cx, path, name_arg(name, "attribute name")?)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn opendir<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Opendir, path, |state, cx| {
            let path = path_arg(path)?;
            let fi = out_arg(fi, "file info")?;
            let mut handle = Handle::from_native(fi);
            state.fs.opendir(cx, path, &mut handle)?;
            register(state, fi, handle, path);
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn readdir<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    buf: *mut c_void,
    fill: Option<FillDirFn>,
    offset: off_t,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Readdir, path, |state, cx| {
            let path = path_arg(path)?;
            let offset = offset_arg(offset)?;
            let fill = fill.ok_or(MarshalError::NullPointer("fill callback"))?;
            let mut filler = DirFiller::new(fill, buf);
            let handle = handle_id(fi).and_then(|id| state.handles.lookup_mut(id));
            state.fs.readdir(cx, path, &mut filler, offset, handle)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn releasedir<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Releasedir, path, |state, cx| {
            let handle = take_handle(state, fi);
            state.fs.releasedir(cx, path_arg(path)?, handle)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn releasedir_builtin<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Releasedir, path, |state, _cx| {
            take_handle(state, fi);
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn fsyncdir<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    datasync: c_int,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Fsyncdir, path, |state, cx| {
            let path = path_arg(path)?;
            let handle = handle_id(fi).and_then(|id| state.handles.lookup_mut(id));
            state.fs.fsyncdir(cx, path, datasync != 0, handle)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn init<F: Filesystem>(
    ctx: *const RawContext,
    conn: *mut RawConnInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Init, ptr::null(), |state, cx| {
            let raw = out_arg(conn, "connection info")?;
            let mut info = ConnInfo::from_native(raw);
            state.fs.init(cx, &mut info)?;
            info.write_back(raw);
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn destroy<F: Filesystem>(ctx: *const RawContext) {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Destroy, ptr::null(), |state, cx| {
            state.fs.destroy(cx);
            Ok(0)
        });
    }
}

pub(super) unsafe extern "C" fn access<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    mask: c_int,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Access, path, |state, cx| {
            state.fs.access(cx, path_arg(path)?, mask)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn create<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    mode: mode_t,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Create, path, |state, cx| {
            let path = path_arg(path)?;
            let fi = out_arg(fi, "file info")?;
            let mut handle = Handle::from_native(fi);
            state.fs.create(cx, path, mode.into(), &mut handle)?;
            register(state, fi, handle, path);
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn ftruncate<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    size: off_t,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Ftruncate, path, |state, cx| {
            let path = path_arg(path)?;
            let size = offset_arg(size)?;
            let handle = handle_id(fi).and_then(|id| state.handles.lookup_mut(id));
            state.fs.ftruncate(cx, path, size, handle)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn fgetattr<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    stbuf: *mut libc::stat,
    fi: *mut RawFileInfo,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Fgetattr, path, |state, cx| {
            let path = path_arg(path)?;
            let handle = handle_id(fi).and_then(|id| state.handles.lookup_mut(id));
            let stat = state.fs.fgetattr(cx, path, handle)?.ok_or(FsError::NotFound)?;
            stat.to_native(out_arg(stbuf, "stat buffer")?)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn lock<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    fi: *mut RawFileInfo,
    cmd: c_int,
    lock: *mut libc::flock,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Lock, path, |state, cx| {
            let path = path_arg(path)?;
            let cmd = LockCommand::from_native(cmd).ok_or(FsError::InvalidArgument)?;
            let raw = out_arg(lock, "lock record")?;
            let mut record = Flock::from_native(raw)?;
            let handle = handle_id(fi).and_then(|id| state.handles.lookup_mut(id));
            state.fs.lock(cx, path, handle, cmd, &mut record)?;
            record.to_native(raw)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn utimens<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    times: *const libc::timespec,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Utimens, path, |state, cx| {
            let path = path_arg(path)?;
            let (atime, mtime) = if times.is_null() {
                (SetTime::Now, SetTime::Now)
            } else {
                let pair = std::slice::from_raw_parts(times, 2);
                (SetTime::from_native(&pair[0])?, SetTime::from_native(&pair[1])?)
            };
            state.fs.utimens(cx, path, atime, mtime)?;
            Ok(0)
        })
    }
}

pub(super) unsafe extern "C" fn bmap<F: Filesystem>(
    ctx: *const RawContext,
    path: *const c_char,
    blocksize: size_t,
    idx: *mut u64,
) -> c_int {
    // SAFETY: the driver upholds the callback contract for every argument.
    unsafe {
        invoke::<F, _>(ctx, Operation::Bmap, path, |state, cx| {
            let path = path_arg(path)?;
            let idx = out_arg(idx, "block index")?;
            *idx = state.fs.bmap(cx, path, blocksize, *idx)?;
            Ok(0)
        })
    }
}
