//! Storage primitive contract
//!
//! The host offers an asynchronous, handle-based byte store: directories and
//! file entries are obtained asynchronously, but once a [`SyncAccessHandle`]
//! has been acquired it supports synchronous positioned reads and writes,
//! truncation and size queries. Everything above this module is written
//! against these traits only.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStorage`] - in-process tree, shared between clones so a test
//!   can "kill" a mount and remount the same bytes
//! - [`DiskStorage`] - a host directory

mod disk;
mod memory;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

use crate::core::path;
use crate::error::{Errno, FsError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Synchronous access to one backing file
///
/// A file admits at most one live handle; dropping the handle releases it.
pub trait SyncAccessHandle: Send {
    /// Read into `buf` starting at byte `at`, returning the bytes read
    ///
    /// Reads past the end return a short count (possibly zero).
    fn read_at(&mut self, buf: &mut [u8], at: u64) -> Result<usize>;

    /// Write `buf` at byte `at`, extending the file if needed
    fn write_at(&mut self, buf: &[u8], at: u64) -> Result<usize>;

    /// Resize the file, zero-filling on growth
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Current file size in bytes
    fn size(&self) -> Result<u64>;

    /// Make previous writes durable
    fn flush(&mut self) -> Result<()>;

    /// Release the handle; later calls fail
    fn close(&mut self) -> Result<()>;
}

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// File metadata available without a sync handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Size in bytes
    pub size: u64,
    /// Last modification (ms since UNIX epoch)
    pub last_modified: u64,
}

/// Asynchronous directory handle
#[async_trait]
pub trait StorageDirectory: Send + Sync {
    /// Entry name (empty for the root)
    fn name(&self) -> &str;

    /// Open (or create) a child directory
    async fn get_directory(&self, name: &str, create: bool)
        -> Result<Arc<dyn StorageDirectory>>;

    /// Open (or create) a child file entry
    async fn get_file(&self, name: &str, create: bool) -> Result<Arc<dyn StorageFile>>;

    /// Remove a child entry
    ///
    /// Non-empty directories require `recursive`.
    async fn remove_entry(&self, name: &str, recursive: bool) -> Result<()>;

    /// List children, sorted by name
    async fn entries(&self) -> Result<Vec<DirEntry>>;
}

/// Asynchronous file entry handle
#[async_trait]
pub trait StorageFile: Send + Sync {
    /// Entry name
    fn name(&self) -> &str;

    /// Acquire the exclusive synchronous access handle
    async fn create_sync_access_handle(&self) -> Result<Box<dyn SyncAccessHandle>>;

    /// Size and modification time
    async fn metadata(&self) -> Result<EntryMetadata>;
}

/// A resolved storage entry
#[derive(Clone)]
pub enum StorageEntry {
    File(Arc<dyn StorageFile>),
    Directory(Arc<dyn StorageDirectory>),
}

impl StorageEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            StorageEntry::File(_) => EntryKind::File,
            StorageEntry::Directory(_) => EntryKind::Directory,
        }
    }
}

/// Walk `path` from `root`, opening (and optionally creating) each directory
pub async fn resolve_directory(
    root: &Arc<dyn StorageDirectory>,
    path: &str,
    create: bool,
) -> Result<Arc<dyn StorageDirectory>> {
    let mut dir = Arc::clone(root);
    for part in path::parts(path) {
        dir = dir.get_directory(part, create).await?;
    }
    Ok(dir)
}

/// Resolve the directory containing `path` and the final component name
pub async fn resolve_parent<'a>(
    root: &Arc<dyn StorageDirectory>,
    path: &'a str,
    create: bool,
) -> Result<(Arc<dyn StorageDirectory>, &'a str)> {
    let (parents, name) = path::split_parent(path)
        .ok_or_else(|| FsError::with_message(Errno::EINVAL, "Root has no parent"))?;
    let mut dir = Arc::clone(root);
    for part in parents {
        dir = dir.get_directory(part, create).await?;
    }
    Ok((dir, name))
}

/// Resolve `path` to whichever kind of entry it names
pub async fn resolve_entry(root: &Arc<dyn StorageDirectory>, path: &str) -> Result<StorageEntry> {
    if path::parts(path).is_empty() {
        return Ok(StorageEntry::Directory(Arc::clone(root)));
    }
    let (dir, name) = resolve_parent(root, path, false).await?;
    let kind = dir
        .entries()
        .await?
        .into_iter()
        .find(|e| e.name == name)
        .map(|e| e.kind)
        .ok_or_else(|| FsError::with_message(Errno::ENOENT, format!("Path not found: {}", path)))?;

    match kind {
        EntryKind::File => Ok(StorageEntry::File(dir.get_file(name, false).await?)),
        EntryKind::Directory => Ok(StorageEntry::Directory(
            dir.get_directory(name, false).await?,
        )),
    }
}

/// Largest file a handle will grow to
pub const MAX_FILE_SIZE: u64 = 1 << 32;

/// End offset of a `len`-byte extent at `at`, bounded by [`MAX_FILE_SIZE`]
pub(crate) fn checked_extent(at: u64, len: usize) -> Result<u64> {
    at.checked_add(len as u64)
        .filter(|end| *end <= MAX_FILE_SIZE)
        .ok_or_else(|| {
            FsError::with_message(
                Errno::EINVAL,
                format!("File too large: {} bytes at {}", len, at),
            )
        })
}

pub(crate) fn not_found(name: &str) -> FsError {
    FsError::with_message(Errno::ENOENT, format!("Entry not found: {}", name))
}
