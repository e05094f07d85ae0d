//! Host adapter
//!
//! The engine's VFS hooks address nodes and streams by identity; the
//! filesystems in this crate are path-addressed. [`MountAdapter`] keeps the
//! identity table, rebuilds paths on every call, and reduces every failure
//! to an [`Errno`] the hooks can hand back to the engine.

use crate::core::fs::{FileSystem, FsStats, WriteFileOptions};
use crate::core::node::{DIR_MODE, FILE_MODE};
use crate::core::wal::MkdirOptions;
use crate::error::{Errno, FsError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::trace;

/// File type bits of a mode
const S_IFMT: u32 = 0o170000;

/// Permission bits given to the mount root
const ROOT_PERMISSIONS: u32 = 0o777;

/// Error handed back to the engine: a bare errno
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("errno {}", .0.code())]
pub struct ErrnoError(pub Errno);

impl ErrnoError {
    pub fn errno(&self) -> i32 {
        self.0.code()
    }
}

impl From<FsError> for ErrnoError {
    fn from(err: FsError) -> Self {
        ErrnoError(err.code())
    }
}

pub type AdapterResult<T> = std::result::Result<T, ErrnoError>;

/// Run a filesystem call, reducing its error to an errno
pub fn try_fs<T>(f: impl FnOnce() -> Result<T>) -> AdapterResult<T> {
    f().map_err(|e| {
        trace!("filesystem call failed: {}", e);
        ErrnoError::from(e)
    })
}

pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == DIR_MODE
}

pub fn is_file(mode: u32) -> bool {
    mode & S_IFMT == FILE_MODE
}

/// Identity of a node in the adapter's table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub u64);

/// One engine-side node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsNode {
    /// The root is its own parent
    pub parent: NodeRef,
    pub name: String,
    pub mode: u32,
}

/// Attributes reported by `getattr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Attribute changes requested by `setattr`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    /// Milliseconds since the UNIX epoch, applied to atime and mtime
    pub timestamp: Option<u64>,
}

/// `llseek` origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    /// From the engine's `SEEK_*` value
    pub fn from_raw(whence: i32) -> Option<Self> {
        match whence {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// An open stream on a node
///
/// Streams produced by [`MountAdapter::dup`] share one fd and one reference
/// count; the fd is closed when the last of them closes.
#[derive(Debug, Clone)]
pub struct Stream {
    pub node: NodeRef,
    pub position: i64,
    fd: Option<i32>,
    refcount: Arc<AtomicUsize>,
}

impl Stream {
    /// Underlying fd; directories have none
    pub fn fd(&self) -> Option<i32> {
        self.fd
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }
}

/// Mounts a [`FileSystem`] under the engine's node/stream operations
pub struct MountAdapter<F: FileSystem> {
    fs: F,
    /// Path prefix every node path is built on
    root: String,
    nodes: HashMap<NodeRef, VfsNode>,
    /// `(parent, name)` to the one node standing for that entry
    children: HashMap<(NodeRef, String), NodeRef>,
    next_ref: u64,
}

impl<F: FileSystem> MountAdapter<F> {
    /// Adapter over `fs`, mounting the filesystem's `root` path
    pub fn new(fs: F, root: impl Into<String>) -> Self {
        MountAdapter {
            fs,
            root: root.into(),
            nodes: HashMap::new(),
            children: HashMap::new(),
            next_ref: 1,
        }
    }

    pub fn fs(&mut self) -> &mut F {
        &mut self.fs
    }

    pub fn into_inner(self) -> F {
        self.fs
    }

    pub fn node(&self, node: NodeRef) -> Option<&VfsNode> {
        self.nodes.get(&node)
    }

    /// Nodes currently held in the identity table
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Create the root node
    pub fn mount(&mut self) -> NodeRef {
        let root = NodeRef(self.next_ref);
        self.next_ref += 1;
        self.nodes.insert(
            root,
            VfsNode {
                parent: root,
                name: "/".to_string(),
                mode: DIR_MODE | ROOT_PERMISSIONS,
            },
        );
        root
    }

    /// Node for `name` under `parent`, reusing the existing one if any
    fn create_node(&mut self, parent: NodeRef, name: &str, mode: u32) -> AdapterResult<NodeRef> {
        if !is_dir(mode) && !is_file(mode) {
            return Err(ErrnoError(Errno::EINVAL));
        }
        let key = (parent, name.to_string());
        if let Some(&node) = self.children.get(&key) {
            if let Some(entry) = self.nodes.get_mut(&node) {
                entry.mode = mode;
            }
            return Ok(node);
        }
        let node = NodeRef(self.next_ref);
        self.next_ref += 1;
        self.nodes.insert(
            node,
            VfsNode {
                parent,
                name: name.to_string(),
                mode,
            },
        );
        self.children.insert(key, node);
        Ok(node)
    }

    /// Drop the node for `name` under `parent` from the table
    fn forget(&mut self, parent: NodeRef, name: &str) {
        if let Some(node) = self.children.remove(&(parent, name.to_string())) {
            self.nodes.remove(&node);
        }
    }

    fn entry(&self, node: NodeRef) -> AdapterResult<&VfsNode> {
        self.nodes.get(&node).ok_or(ErrnoError(Errno::ENOENT))
    }

    /// Path of `node`: its names up to the root, joined under the mount root
    pub fn real_path(&self, node: NodeRef) -> AdapterResult<String> {
        let mut names = Vec::new();
        let mut current = node;
        loop {
            let entry = self.entry(current)?;
            if entry.parent == current {
                break;
            }
            names.push(entry.name.as_str());
            current = entry.parent;
        }
        names.push(self.root.as_str());
        names.reverse();
        Ok(names.join("/"))
    }

    fn child_path(&self, parent: NodeRef, name: &str) -> AdapterResult<String> {
        Ok(format!("{}/{}", self.real_path(parent)?, name))
    }

    pub fn lookup(&mut self, parent: NodeRef, name: &str) -> AdapterResult<NodeRef> {
        let path = self.child_path(parent, name)?;
        trace!("lookup {}", path);
        let fs = &mut self.fs;
        let mode = try_fs(|| fs.lstat(&path))?.mode;
        self.create_node(parent, name, mode)
    }

    pub fn getattr(&mut self, node: NodeRef) -> AdapterResult<NodeAttr> {
        let path = self.real_path(node)?;
        trace!("getattr {}", path);
        let fs = &mut self.fs;
        let stats: FsStats = try_fs(|| fs.lstat(&path))?;
        Ok(NodeAttr {
            dev: 0,
            ino: node.0,
            mode: stats.mode,
            nlink: 1,
            uid: stats.uid,
            gid: stats.gid,
            rdev: 0,
            size: stats.size,
            blksize: stats.blksize,
            blocks: stats.blocks,
            atime: system_time(stats.atime),
            mtime: system_time(stats.mtime),
            ctime: system_time(stats.ctime),
        })
    }

    pub fn setattr(&mut self, node: NodeRef, attr: SetAttr) -> AdapterResult<()> {
        let path = self.real_path(node)?;
        trace!("setattr {} {:?}", path, attr);
        let fs = &mut self.fs;
        try_fs(|| {
            if let Some(mode) = attr.mode {
                fs.chmod(&path, mode)?;
            }
            if let Some(size) = attr.size {
                fs.truncate(&path, size)?;
            }
            if let Some(timestamp) = attr.timestamp {
                fs.utimes(&path, timestamp, timestamp)?;
            }
            Ok(())
        })
    }

    /// Create a file or directory under `parent`
    pub fn mknod(&mut self, parent: NodeRef, name: &str, mode: u32) -> AdapterResult<NodeRef> {
        let previous_mode = self
            .children
            .get(&(parent, name.to_string()))
            .and_then(|node| self.nodes.get(node))
            .map(|entry| entry.mode);
        let node = self.create_node(parent, name, mode)?;
        let path = self.real_path(node)?;
        trace!("mknod {} {:o}", path, mode);
        let fs = &mut self.fs;
        let created = try_fs(|| {
            if is_dir(mode) {
                fs.mkdir(
                    &path,
                    MkdirOptions {
                        recursive: false,
                        mode: Some(mode),
                    },
                )
            } else {
                fs.write_file(&path, &[], WriteFileOptions { mode: Some(mode) })
            }
        });
        if let Err(e) = created {
            match previous_mode {
                Some(mode) => {
                    if let Some(entry) = self.nodes.get_mut(&node) {
                        entry.mode = mode;
                    }
                }
                None => self.forget(parent, name),
            }
            return Err(e);
        }
        Ok(node)
    }

    pub fn rename(&mut self, node: NodeRef, new_dir: NodeRef, new_name: &str) -> AdapterResult<()> {
        let old_path = self.real_path(node)?;
        let new_path = self.child_path(new_dir, new_name)?;
        trace!("rename {} -> {}", old_path, new_path);
        let fs = &mut self.fs;
        try_fs(|| fs.rename(&old_path, &new_path))?;

        let Some(entry) = self.nodes.get_mut(&node) else {
            return Ok(());
        };
        let old_key = (entry.parent, std::mem::take(&mut entry.name));
        entry.name = new_name.to_string();
        entry.parent = new_dir;
        self.children.remove(&old_key);

        // An overwritten target no longer exists
        let new_key = (new_dir, new_name.to_string());
        if let Some(replaced) = self.children.insert(new_key, node) {
            if replaced != node {
                self.nodes.remove(&replaced);
            }
        }
        Ok(())
    }

    /// Failures are ignored; the engine unlinks speculatively
    pub fn unlink(&mut self, parent: NodeRef, name: &str) {
        let Ok(path) = self.child_path(parent, name) else {
            return;
        };
        trace!("unlink {}", path);
        match self.fs.unlink(&path) {
            Ok(()) => self.forget(parent, name),
            Err(e) => trace!("unlink {} ignored: {}", path, e),
        }
    }

    pub fn rmdir(&mut self, parent: NodeRef, name: &str) -> AdapterResult<()> {
        let path = self.child_path(parent, name)?;
        trace!("rmdir {}", path);
        let fs = &mut self.fs;
        try_fs(|| fs.rmdir(&path))?;
        self.forget(parent, name);
        Ok(())
    }

    pub fn readdir(&mut self, node: NodeRef) -> AdapterResult<Vec<String>> {
        let path = self.real_path(node)?;
        trace!("readdir {}", path);
        let fs = &mut self.fs;
        try_fs(|| fs.readdir(&path))
    }

    /// Links are not supported
    pub fn symlink(&mut self, _parent: NodeRef, _name: &str, _target: &str) -> AdapterResult<()> {
        Err(ErrnoError(Errno::EPERM))
    }

    pub fn readlink(&mut self, _node: NodeRef) -> AdapterResult<String> {
        Err(ErrnoError(Errno::EPERM))
    }

    /// Open a stream; files get an fd, directories none
    pub fn open(&mut self, node: NodeRef) -> AdapterResult<Stream> {
        let mode = self.entry(node)?.mode;
        let path = self.real_path(node)?;
        trace!("open stream {}", path);
        let fd = if is_file(mode) {
            let fs = &mut self.fs;
            Some(try_fs(|| fs.open(&path, None, None))?)
        } else {
            None
        };
        Ok(Stream {
            node,
            position: 0,
            fd,
            refcount: Arc::new(AtomicUsize::new(1)),
        })
    }

    pub fn dup(&mut self, stream: &Stream) -> Stream {
        stream.refcount.fetch_add(1, Ordering::SeqCst);
        stream.clone()
    }

    pub fn close(&mut self, stream: Stream) -> AdapterResult<()> {
        trace!("close stream {:?}", stream.node);
        let Some(fd) = stream.fd else {
            return Ok(());
        };
        if stream.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            let fs = &mut self.fs;
            try_fs(|| fs.close(fd))?;
        }
        Ok(())
    }

    fn stream_fd(stream: &Stream) -> AdapterResult<i32> {
        stream.fd.ok_or(ErrnoError(Errno::EISDIR))
    }

    pub fn read(
        &mut self,
        stream: &Stream,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> AdapterResult<usize> {
        trace!("read stream {:?} {}+{} at {}", stream.node, offset, length, position);
        if length == 0 {
            return Ok(0);
        }
        let fd = Self::stream_fd(stream)?;
        let fs = &mut self.fs;
        try_fs(|| fs.read(fd, buf, offset, length, position))
    }

    pub fn write(
        &mut self,
        stream: &Stream,
        buf: &[u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> AdapterResult<usize> {
        trace!("write stream {:?} {}+{} at {}", stream.node, offset, length, position);
        let fd = Self::stream_fd(stream)?;
        let fs = &mut self.fs;
        try_fs(|| fs.write(fd, buf, offset, length, position))
    }

    /// New stream position; the stream itself is not moved
    pub fn llseek(&mut self, stream: &Stream, offset: i64, whence: Whence) -> AdapterResult<i64> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => stream.position,
            Whence::End => match stream.fd {
                Some(fd) => {
                    let fs = &mut self.fs;
                    let size = try_fs(|| fs.fstat(fd))?.size;
                    i64::try_from(size).map_err(|_| ErrnoError(Errno::EINVAL))?
                }
                None => 0,
            },
        };
        let position = base
            .checked_add(offset)
            .ok_or(ErrnoError(Errno::EINVAL))?;
        if position < 0 {
            return Err(ErrnoError(Errno::EINVAL));
        }
        Ok(position)
    }

    /// Emulated mapping: `length` bytes at `position`, read eagerly
    ///
    /// Bytes past the end of the file read as zero.
    pub fn mmap(&mut self, stream: &Stream, length: usize, position: u64) -> AdapterResult<Vec<u8>> {
        let mode = self.entry(stream.node)?.mode;
        if !is_file(mode) {
            return Err(ErrnoError(Errno::ENODEV));
        }
        let mut mapped = vec![0u8; length];
        self.read(stream, &mut mapped, 0, length, position)?;
        Ok(mapped)
    }

    /// Write a mapping's first `length` bytes back at file `offset`
    pub fn msync(&mut self, stream: &Stream, mapped: &[u8], offset: u64, length: usize) -> AdapterResult<()> {
        self.write(stream, mapped, 0, length, offset)?;
        Ok(())
    }
}

fn system_time(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}
