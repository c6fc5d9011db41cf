// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory filler handed to `readdir` handlers.

use std::ffi::{c_void, CString, OsStr};
use std::marker::PhantomData;
use std::os::unix::ffi::OsStrExt;

use libc::{c_char, c_int, off_t};

use crate::attr::Stat;
use crate::error::MarshalError;

/// Native fill callback: returns non-zero once `buf` has no room for the entry.
pub type FillDirFn = unsafe extern "C" fn(
    buf: *mut c_void,
    name: *const c_char,
    stbuf: *const libc::stat,
    off: off_t,
) -> c_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Added,
    Full,
}

/// Wraps the driver's fill callback and buffer for one `readdir` call.
pub struct DirFiller<'a> {
    fill: FillDirFn,
    buf: *mut c_void,
    full: bool,
    added: usize,
    _call: PhantomData<&'a mut c_void>,
}

impl<'a> DirFiller<'a> {
    /// # Safety
    ///
    /// `fill` and `buf` must be the pair the driver passed to the current
    /// `readdir` call and stay valid for `'a`.
    pub unsafe fn new(fill: FillDirFn, buf: *mut c_void) -> Self {
        Self {
            fill,
            buf,
            full: false,
            added: 0,
            _call: PhantomData,
        }
    }

    /// Writes one entry. Returns [`Fill::Full`] once the buffer rejects an
    /// entry; after that the native callback is not invoked again.
    pub fn push(
        &mut self,
        name: impl AsRef<OsStr>,
        stat: Option<&Stat>,
        next_offset: u64,
    ) -> Result<Fill, MarshalError> {
        if self.full {
            return Ok(Fill::Full);
        }
        let name = CString::new(name.as_ref().as_bytes())
            .map_err(|_| MarshalError::InteriorNul("directory entry name"))?;
        let native = stat.map(Stat::native).transpose()?;
        let offset = off_t::try_from(next_offset).map_err(|_| MarshalError::OutOfRange {
            field: "directory offset",
            value: next_offset.into(),
        })?;
        let stbuf = native
            .as_ref()
            .map_or(std::ptr::null(), |st| st as *const libc::stat);

        // SAFETY: the constructor contract keeps `fill`/`buf` valid; `name`
        // and `stbuf` outlive the call.
        let rc = unsafe { (self.fill)(self.buf, name.as_ptr(), stbuf, offset) };
        if rc != 0 {
            self.full = true;
            return Ok(Fill::Full);
        }
        self.added += 1;
        Ok(Fill::Added)
    }

    /// Pushes entries until one is rejected.
    pub fn add_all<I, N>(&mut self, entries: I) -> Result<Fill, MarshalError>
    where
        I: IntoIterator<Item = (N, Option<Stat>, u64)>,
        N: AsRef<OsStr>,
    {
        for (name, stat, offset) in entries {
            if self.push(name, stat.as_ref(), offset)? == Fill::Full {
                return Ok(Fill::Full);
            }
        }
        Ok(Fill::Added)
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Entries accepted so far.
    pub fn added(&self) -> usize {
        self.added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    struct Sink {
        capacity: usize,
        names: Vec<String>,
        with_stat: Vec<bool>,
        calls: usize,
    }

    unsafe extern "C" fn fill_sink(
        buf: *mut c_void,
        name: *const c_char,
        stbuf: *const libc::stat,
        _off: off_t,
    ) -> c_int {
        let sink = unsafe { &mut *(buf as *mut Sink) };
        sink.calls += 1;
        if sink.names.len() == sink.capacity {
            return 1;
        }
        let name = unsafe { CStr::from_ptr(name) };
        sink.names.push(name.to_string_lossy().into_owned());
        sink.with_stat.push(!stbuf.is_null());
        0
    }

    fn sink(capacity: usize) -> Sink {
        Sink {
            capacity,
            names: Vec::new(),
            with_stat: Vec::new(),
            calls: 0,
        }
    }

    #[test]
    fn full_is_reported_once_and_sink_not_called_again() {
        let mut sink = sink(2);
        let mut filler = unsafe { DirFiller::new(fill_sink, &mut sink as *mut Sink as *mut c_void) };
        assert_eq!(filler.push("a", None, 1).unwrap(), Fill::Added);
        assert_eq!(filler.push("b", None, 2).unwrap(), Fill::Added);
        assert_eq!(filler.push("c", None, 3).unwrap(), Fill::Full);
        assert_eq!(filler.push("d", None, 4).unwrap(), Fill::Full);
        assert!(filler.is_full());
        assert_eq!(filler.added(), 2);
        drop(filler);
        assert_eq!(sink.names, vec!["a", "b"]);
        assert_eq!(sink.calls, 3);
    }

    #[test]
    fn attributes_are_optional() {
        let mut sink = sink(8);
        let mut filler = unsafe { DirFiller::new(fill_sink, &mut sink as *mut Sink as *mut c_void) };
        let stat = Stat::directory(0o755);
        filler.push(".", Some(&stat), 1).unwrap();
        filler.push("..", None, 2).unwrap();
        drop(filler);
        assert_eq!(sink.with_stat, vec![true, false]);
    }

    #[test]
    fn add_all_stops_at_first_rejection() {
        let mut sink = sink(1);
        let mut filler = unsafe { DirFiller::new(fill_sink, &mut sink as *mut Sink as *mut c_void) };
        let entries = vec![("x", None, 1), ("y", None, 2), ("z", None, 3)];
        assert_eq!(filler.add_all(entries).unwrap(), Fill::Full);
        drop(filler);
        assert_eq!(sink.calls, 2);
    }

    #[test]
    fn interior_nul_is_a_marshal_error() {
        let mut sink = sink(1);
        let mut filler = unsafe { DirFiller::new(fill_sink, &mut sink as *mut Sink as *mut c_void) };
        assert_eq!(
            filler.push("bad\0name", None, 1),
            Err(MarshalError::InteriorNul("directory entry name"))
        );
    }
}
