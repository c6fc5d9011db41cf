// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inode numbers for paths.
//!
//! The kernel protocol names files by inode; the adapter names them by path.
//! The table hands out stable numbers per path and keeps them until the
//! kernel forgets every lookup it was given.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub const ROOT_INODE: u64 = 1;
/// Reported for listed entries the kernel has not looked up yet.
pub const UNKNOWN_INODE: u64 = 0xffff_ffff;

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    lookups: u64,
}

#[derive(Debug)]
pub struct InodeTable {
    entries: HashMap<u64, Entry>,
    by_path: HashMap<PathBuf, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let mut table = Self {
            entries: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INODE + 1,
        };
        table.by_path.insert(root.clone(), ROOT_INODE);
        table.entries.insert(
            ROOT_INODE,
            Entry {
                path: root,
                lookups: 1,
            },
        );
        table
    }

    pub fn path(&self, ino: u64) -> Option<&Path> {
        self.entries.get(&ino).map(|entry| entry.path.as_path())
    }

    /// The path of `name` inside directory `parent`.
    pub fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|dir| dir.join(name))
    }

    pub fn inode(&self, path: &Path) -> Option<u64> {
        self.by_path.get(path).copied()
    }

    /// The number to report for `path` in a directory listing. Listing
    /// never allocates; only lookups do, and forget releases them.
    pub fn listed(&self, path: &Path) -> u64 {
        self.inode(path).unwrap_or(UNKNOWN_INODE)
    }

    fn assign(&mut self, path: &Path) -> u64 {
        if let Some(ino) = self.inode(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_path.insert(path.to_path_buf(), ino);
        self.entries.insert(
            ino,
            Entry {
                path: path.to_path_buf(),
                lookups: 0,
            },
        );
        ino
    }

    /// The inode for `path`, allocated on first use, counting one kernel
    /// lookup.
    pub fn lookup(&mut self, path: &Path) -> u64 {
        let ino = self.assign(path);
        if let Some(entry) = self.entries.get_mut(&ino) {
            entry.lookups += 1;
        }
        ino
    }

    /// Drops `count` kernel lookups; the inode goes away at zero.
    pub fn forget(&mut self, ino: u64, count: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let Some(entry) = self.entries.get_mut(&ino) else {
            return;
        };
        entry.lookups = entry.lookups.saturating_sub(count);
        if entry.lookups == 0 {
            if let Some(entry) = self.entries.remove(&ino) {
                if self.by_path.get(&entry.path) == Some(&ino) {
                    self.by_path.remove(&entry.path);
                }
            }
        }
    }

    /// Unlinks `path`; an inode the kernel still references keeps its number
    /// until forgotten.
    pub fn remove(&mut self, path: &Path) {
        if let Some(ino) = self.by_path.remove(path) {
            if self.entries.get(&ino).is_some_and(|entry| entry.lookups == 0) {
                self.entries.remove(&ino);
            }
        }
    }

    /// Moves `from` and everything below it to `to`.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        self.remove(to);
        let moved: Vec<(PathBuf, u64)> = self
            .by_path
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            self.by_path.remove(&old);
            let new = match old.strip_prefix(from) {
                Ok(rest) if !rest.as_os_str().is_empty() => to.join(rest),
                _ => to.to_path_buf(),
            };
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.path = new.clone();
            }
            self.by_path.insert(new, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
