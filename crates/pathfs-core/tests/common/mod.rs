// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use pathfs_core::driver::loopback::{LoopbackClient, LoopbackDriver};
use pathfs_core::driver::request::{Reply, Request};
use pathfs_core::{
    ConnInfo, Context, DirFiller, Filesystem, FsError, FsResult, Handle, Mount, Operation,
    OperationSet, ProcessOutcome, Stat,
};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Flat in-memory tree: directories and regular files keyed by path.
#[derive(Debug, Default)]
pub struct Tree {
    pub entries: BTreeMap<PathBuf, (Stat, Vec<u8>)>,
    pub declared: OperationSet,
    pub init_calls: usize,
    pub destroy_calls: usize,
    pub released: Vec<String>,
    pub signals: Vec<i32>,
}

impl Tree {
    pub fn new(ops: &[Operation]) -> Self {
        let mut tree = Self {
            declared: OperationSet::of(ops),
            ..Self::default()
        };
        let mut root = Stat::directory(0o755);
        root.nlink = 2;
        root.uid = 1000;
        root.gid = 1000;
        tree.entries.insert(PathBuf::from("/"), (root, Vec::new()));
        tree
    }

    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        let mut stat = Stat::file(0o644);
        stat.size = data.len() as u64;
        self.entries
            .insert(PathBuf::from(path), (stat, data.to_vec()));
        self
    }

    fn node_mut(&mut self, path: &Path) -> FsResult<&mut (Stat, Vec<u8>)> {
        self.entries.get_mut(path).ok_or(FsError::NotFound)
    }
}

impl Filesystem for Tree {
    fn operations(&self) -> OperationSet {
        self.declared
    }

    fn init(&mut self, _cx: &Context<'_>, _conn: &mut ConnInfo) -> FsResult<()> {
        self.init_calls += 1;
        Ok(())
    }

    fn destroy(&mut self, _cx: &Context<'_>) {
        self.destroy_calls += 1;
    }

    fn signal(&mut self, signal: i32) {
        self.signals.push(signal);
    }

    fn getattr(&mut self, _cx: &Context<'_>, path: &Path) -> FsResult<Option<Stat>> {
        Ok(self.entries.get(path).map(|(stat, _)| *stat))
    }

    fn open(&mut self, _cx: &Context<'_>, path: &Path, handle: &mut Handle) -> FsResult<()> {
        let (stat, _) = self.node_mut(path)?;
        if stat.is_dir() {
            return Err(FsError::IsADirectory);
        }
        handle.set_payload(String::from("h1"));
        Ok(())
    }

    fn create(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        mode: u32,
        handle: &mut Handle,
    ) -> FsResult<()> {
        if self.entries.contains_key(path) {
            return Err(FsError::AlreadyExists);
        }
        self.entries
            .insert(path.to_path_buf(), (Stat::file(mode), Vec::new()));
        handle.set_payload(String::from("created"));
        Ok(())
    }

    fn read(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        size: usize,
        offset: u64,
        _handle: Option<&mut Handle>,
    ) -> FsResult<Vec<u8>> {
        let (_, data) = self.node_mut(path)?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        bytes: &[u8],
        offset: u64,
        _handle: Option<&mut Handle>,
    ) -> FsResult<usize> {
        let (stat, data) = self.node_mut(path)?;
        let start = offset as usize;
        if data.len() < start + bytes.len() {
            data.resize(start + bytes.len(), 0);
        }
        data[start..start + bytes.len()].copy_from_slice(bytes);
        stat.size = data.len() as u64;
        Ok(bytes.len())
    }

    fn release(&mut self, _cx: &Context<'_>, _path: &Path, handle: Option<Handle>) -> FsResult<()> {
        if let Some(payload) = handle.and_then(|mut h| h.take_payload::<String>()) {
            self.released.push(payload);
        }
        Ok(())
    }

    fn mkdir(&mut self, _cx: &Context<'_>, path: &Path, mode: u32) -> FsResult<()> {
        if self.entries.contains_key(path) {
            return Err(FsError::AlreadyExists);
        }
        self.entries
            .insert(path.to_path_buf(), (Stat::directory(mode), Vec::new()));
        Ok(())
    }

    fn opendir(&mut self, _cx: &Context<'_>, path: &Path, _handle: &mut Handle) -> FsResult<()> {
        match self.entries.get(path) {
            Some((stat, _)) if stat.is_dir() => Ok(()),
            Some(_) => Err(FsError::NotADirectory),
            None => Err(FsError::NotFound),
        }
    }

    fn readdir(
        &mut self,
        _cx: &Context<'_>,
        path: &Path,
        filler: &mut DirFiller<'_>,
        offset: u64,
        _handle: Option<&mut Handle>,
    ) -> FsResult<()> {
        let children = self
            .entries
            .iter()
            .filter(|(p, _)| p.parent() == Some(path))
            .filter_map(|(p, (stat, _))| Some((p.file_name()?.to_os_string(), *stat)));
        let dots = [".", ".."].map(|name| (OsString::from(name), Stat::directory(0o755)));
        let entries = dots
            .into_iter()
            .chain(children)
            .enumerate()
            .skip(offset as usize)
            .map(|(i, (name, stat))| (name, Some(stat), i as u64 + 1));
        filler.add_all(entries)?;
        Ok(())
    }
}

pub type TreeMount = Mount<Tree, LoopbackDriver>;

/// Mounts `tree` on a fresh temporary directory.
pub fn mount(tree: Tree, options: &[&str]) -> (TreeMount, LoopbackClient, tempfile::TempDir) {
    mount_with(LoopbackDriver::new().unwrap(), tree, options)
}

pub fn mount_with(
    driver: LoopbackDriver,
    tree: Tree,
    options: &[&str],
) -> (TreeMount, LoopbackClient, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let client = driver.client();
    let mut mount = Mount::new(driver, tree);
    mount.initialize(dir.path(), options).unwrap();
    (mount, client, dir)
}

/// Submits one request and serves it on the calling thread.
pub fn roundtrip(mount: &mut TreeMount, client: &LoopbackClient, request: Request) -> Reply {
    let reply = client.submit(request);
    assert_eq!(mount.process_one_event().unwrap(), ProcessOutcome::Dispatched);
    reply.recv().unwrap()
}

#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

pub struct LogGuard<'a>(MutexGuard<'a, Vec<u8>>);

impl Write for LogGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogGuard(self.0.lock().unwrap())
    }
}

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

/// Runs `f` under a scoped subscriber and returns its result and output.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, buffer.contents())
}

/// Like [`capture_logs`], but only what `directives` enables is recorded.
pub fn capture_filtered_logs<R>(directives: &str, f: impl FnOnce() -> R) -> (R, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_env_filter(EnvFilter::new(directives))
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, buffer.contents())
}
