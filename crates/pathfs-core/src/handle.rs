// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open-file handles and the per-mount registry that owns them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use libc::c_int;

/// Native file-info block shared with the driver on handle-bearing calls.
///
/// The bit flags are stored as whole `c_uint`s rather than a packed bitfield.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFileInfo {
    pub flags: c_int,
    pub writepage: libc::c_uint,
    pub direct_io: libc::c_uint,
    pub keep_cache: libc::c_uint,
    pub flush: libc::c_uint,
    pub nonseekable: libc::c_uint,
    pub fh: u64,
    pub lock_owner: u64,
}

impl RawFileInfo {
    pub fn with_flags(flags: c_int) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    pub fn handle_id(&self) -> Option<HandleId> {
        HandleId::from_raw(self.fh)
    }
}

/// Identity of a registered handle: the address of its boxed wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Zero is never a valid identity.
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One open file or directory.
///
/// Created by the dispatcher before `open`/`create`/`opendir` runs, handed to
/// the handler to fill in, then owned by the [`HandleRegistry`] until release.
#[derive(Default)]
pub struct Handle {
    flags: c_int,
    writepage: bool,
    direct_io: bool,
    keep_cache: bool,
    nonseekable: bool,
    payload: Option<Box<dyn Any + Send>>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("flags", &self.flags)
            .field("writepage", &self.writepage)
            .field("direct_io", &self.direct_io)
            .field("keep_cache", &self.keep_cache)
            .field("nonseekable", &self.nonseekable)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

impl Handle {
    pub fn new(flags: c_int) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    pub(crate) fn from_native(fi: &RawFileInfo) -> Self {
        Self {
            flags: fi.flags,
            writepage: fi.writepage != 0,
            ..Self::default()
        }
    }

    /// Copies the handler-controlled output bits into the native block.
    pub(crate) fn write_native(&self, fi: &mut RawFileInfo) {
        fi.direct_io = self.direct_io.into();
        fi.keep_cache = self.keep_cache.into();
        fi.nonseekable = self.nonseekable.into();
    }

    /// Open flags (`O_RDONLY`, `O_APPEND`, ...).
    pub fn flags(&self) -> c_int {
        self.flags
    }

    pub fn access_mode(&self) -> c_int {
        self.flags & libc::O_ACCMODE
    }

    pub fn writepage(&self) -> bool {
        self.writepage
    }

    pub fn direct_io(&self) -> bool {
        self.direct_io
    }

    pub fn set_direct_io(&mut self, value: bool) {
        self.direct_io = value;
    }

    pub fn keep_cache(&self) -> bool {
        self.keep_cache
    }

    pub fn set_keep_cache(&mut self, value: bool) {
        self.keep_cache = value;
    }

    pub fn nonseekable(&self) -> bool {
        self.nonseekable
    }

    pub fn set_nonseekable(&mut self, value: bool) {
        self.nonseekable = value;
    }

    /// Stores an application payload, replacing any previous one.
    pub fn set_payload<T: Any + Send>(&mut self, payload: T) {
        self.payload = Some(Box::new(payload));
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref()
    }

    pub fn payload_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.as_mut()?.downcast_mut()
    }

    /// Removes the payload if it has type `T`; a payload of another type is kept.
    pub fn take_payload<T: Any>(&mut self) -> Option<T> {
        let payload = self.payload.take()?;
        match payload.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.payload = Some(other);
                None
            }
        }
    }
}

/// Owns every handle between its open-family call and the matching release.
///
/// The native side only ever sees the [`HandleId`]; the registry never turns
/// that identity back into a pointer.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    open: HashMap<HandleId, Box<Handle>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `handle` and returns its identity.
    pub fn register(&mut self, handle: Handle) -> HandleId {
        let boxed = Box::new(handle);
        let id = HandleId(std::ptr::addr_of!(*boxed) as u64);
        let previous = self.open.insert(id, boxed);
        debug_assert!(previous.is_none(), "handle identity {id} registered twice");
        id
    }

    pub fn lookup(&self, id: HandleId) -> Option<&Handle> {
        self.open.get(&id).map(Box::as_ref)
    }

    pub fn lookup_mut(&mut self, id: HandleId) -> Option<&mut Handle> {
        self.open.get_mut(&id).map(Box::as_mut)
    }

    /// Removes the handle; a second call with the same identity returns `None`.
    pub fn deregister(&mut self, id: HandleId) -> Option<Handle> {
        self.open.remove(&id).map(|boxed| *boxed)
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.open.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = HandleId> + '_ {
        self.open.keys().copied()
    }

    /// Drops every remaining handle and returns how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.open.len();
        self.open.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_deregister() {
        let mut registry = HandleRegistry::new();
        let mut handle = Handle::new(libc::O_RDWR);
        handle.set_payload(String::from("h1"));
        let id = registry.register(handle);

        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);
        let found = registry.lookup(id).unwrap();
        assert_eq!(found.payload::<String>().map(String::as_str), Some("h1"));
        assert_eq!(found.access_mode(), libc::O_RDWR);

        let released = registry.deregister(id).unwrap();
        assert_eq!(released.flags(), libc::O_RDWR);
        assert!(!registry.contains(id));
        assert!(registry.deregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn live_handles_have_distinct_identities() {
        let mut registry = HandleRegistry::new();
        let a = registry.register(Handle::new(0));
        let b = registry.register(Handle::new(0));
        assert_ne!(a, b);
        assert_ne!(a.as_raw(), 0);
        assert_eq!(registry.clear(), 2);
    }

    #[test]
    fn zero_is_not_an_identity() {
        assert!(HandleId::from_raw(0).is_none());
        assert!(RawFileInfo::default().handle_id().is_none());
    }

    #[test]
    fn payload_type_mismatch_keeps_payload() {
        let mut handle = Handle::default();
        handle.set_payload(7u32);
        assert!(handle.payload::<String>().is_none());
        assert!(handle.take_payload::<String>().is_none());
        *handle.payload_mut::<u32>().unwrap() += 1;
        assert_eq!(handle.take_payload::<u32>(), Some(8));
        assert!(!handle.has_payload());
    }

    #[test]
    fn output_bits_reach_native_block() {
        let mut fi = RawFileInfo::with_flags(libc::O_WRONLY);
        fi.writepage = 1;
        let mut handle = Handle::from_native(&fi);
        assert!(handle.writepage());
        handle.set_direct_io(true);
        handle.set_nonseekable(true);
        handle.write_native(&mut fi);
        assert_eq!(fi.direct_io, 1);
        assert_eq!(fi.keep_cache, 0);
        assert_eq!(fi.nonseekable, 1);
    }
}
