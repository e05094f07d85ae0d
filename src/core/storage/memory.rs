//! In-memory storage primitive
//!
//! Bytes live in a shared tree behind `Arc`, so cloning a [`MemoryStorage`]
//! (or keeping one around after a mount is dropped) preserves every write.
//! Crash tests rely on this: drop the filesystem without closing it, then
//! mount again on the same storage.

use super::{
    checked_extent, not_found, DirEntry, EntryKind, EntryMetadata, StorageDirectory, StorageFile,
    SyncAccessHandle,
};
use crate::core::node::now_millis;
use crate::error::{Errno, FsError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory storage root
#[derive(Clone)]
pub struct MemoryStorage {
    root: Arc<MemDirectory>,
}

impl MemoryStorage {
    /// Create an empty storage tree
    pub fn new() -> Self {
        MemoryStorage {
            root: Arc::new(MemDirectory::new("")),
        }
    }

    /// Root directory handle
    pub fn root(&self) -> Arc<dyn StorageDirectory> {
        Arc::clone(&self.root) as Arc<dyn StorageDirectory>
    }

    /// Total bytes stored across every file
    pub fn total_bytes(&self) -> u64 {
        self.root.total_bytes()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

enum MemEntry {
    File(Arc<MemFile>),
    Directory(Arc<MemDirectory>),
}

struct MemDirectory {
    name: String,
    entries: Mutex<BTreeMap<String, MemEntry>>,
}

impl MemDirectory {
    fn new(name: &str) -> Self {
        MemDirectory {
            name: name.to_string(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn has_open_handles(&self) -> bool {
        self.entries.lock().values().any(|entry| match entry {
            MemEntry::File(file) => file.cell.locked.load(Ordering::SeqCst),
            MemEntry::Directory(dir) => dir.has_open_handles(),
        })
    }

    fn total_bytes(&self) -> u64 {
        self.entries
            .lock()
            .values()
            .map(|entry| match entry {
                MemEntry::File(file) => file.cell.data.lock().len() as u64,
                MemEntry::Directory(dir) => dir.total_bytes(),
            })
            .sum()
    }
}

/// File contents shared between the entry and its live handle
struct FileCell {
    data: Mutex<Vec<u8>>,
    /// Set while a sync access handle is live
    locked: AtomicBool,
    last_modified: AtomicU64,
}

impl FileCell {
    fn touch(&self) {
        self.last_modified.store(now_millis(), Ordering::SeqCst);
    }
}

struct MemFile {
    name: String,
    cell: Arc<FileCell>,
}

impl MemFile {
    fn new(name: &str) -> Self {
        MemFile {
            name: name.to_string(),
            cell: Arc::new(FileCell {
                data: Mutex::new(Vec::new()),
                locked: AtomicBool::new(false),
                last_modified: AtomicU64::new(now_millis()),
            }),
        }
    }
}

#[async_trait]
impl StorageDirectory for MemDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_directory(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Arc<dyn StorageDirectory>> {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(MemEntry::Directory(dir)) => Ok(Arc::clone(dir) as Arc<dyn StorageDirectory>),
            Some(MemEntry::File(_)) => Err(FsError::with_message(
                Errno::ENOTDIR,
                format!("Not a directory: {}", name),
            )),
            None if create => {
                let dir = Arc::new(MemDirectory::new(name));
                entries.insert(name.to_string(), MemEntry::Directory(Arc::clone(&dir)));
                Ok(dir as Arc<dyn StorageDirectory>)
            }
            None => Err(not_found(name)),
        }
    }

    async fn get_file(&self, name: &str, create: bool) -> Result<Arc<dyn StorageFile>> {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(MemEntry::File(file)) => Ok(Arc::clone(file) as Arc<dyn StorageFile>),
            Some(MemEntry::Directory(_)) => Err(FsError::with_message(
                Errno::EISDIR,
                format!("Is a directory: {}", name),
            )),
            None if create => {
                let file = Arc::new(MemFile::new(name));
                entries.insert(name.to_string(), MemEntry::File(Arc::clone(&file)));
                Ok(file as Arc<dyn StorageFile>)
            }
            None => Err(not_found(name)),
        }
    }

    async fn remove_entry(&self, name: &str, recursive: bool) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            None => return Err(not_found(name)),
            Some(MemEntry::File(file)) => {
                if file.cell.locked.load(Ordering::SeqCst) {
                    return Err(FsError::Storage(format!(
                        "Cannot remove {}: access handle is open",
                        name
                    )));
                }
            }
            Some(MemEntry::Directory(dir)) => {
                if !recursive && !dir.is_empty() {
                    return Err(FsError::with_message(
                        Errno::ENOTEMPTY,
                        format!("Directory not empty: {}", name),
                    ));
                }
                if dir.has_open_handles() {
                    return Err(FsError::Storage(format!(
                        "Cannot remove {}: contains open access handles",
                        name
                    )));
                }
            }
        }
        entries.remove(name);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<DirEntry>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(name, entry)| DirEntry {
                name: name.clone(),
                kind: match entry {
                    MemEntry::File(_) => EntryKind::File,
                    MemEntry::Directory(_) => EntryKind::Directory,
                },
            })
            .collect())
    }
}

#[async_trait]
impl StorageFile for MemFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_sync_access_handle(&self) -> Result<Box<dyn SyncAccessHandle>> {
        if self
            .cell
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FsError::Storage(format!(
                "Access handle already open for {}",
                self.name
            )));
        }
        Ok(Box::new(MemHandle {
            cell: Arc::clone(&self.cell),
            name: self.name.clone(),
            closed: false,
        }))
    }

    async fn metadata(&self) -> Result<EntryMetadata> {
        Ok(EntryMetadata {
            size: self.cell.data.lock().len() as u64,
            last_modified: self.cell.last_modified.load(Ordering::SeqCst),
        })
    }
}

/// Exclusive handle onto a [`FileCell`]
struct MemHandle {
    cell: Arc<FileCell>,
    name: String,
    closed: bool,
}

impl MemHandle {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(FsError::Storage(format!("Handle for {} is closed", self.name)));
        }
        Ok(())
    }
}

impl SyncAccessHandle for MemHandle {
    fn read_at(&mut self, buf: &mut [u8], at: u64) -> Result<usize> {
        self.check_open()?;
        let data = self.cell.data.lock();
        let start = (at as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], at: u64) -> Result<usize> {
        self.check_open()?;
        let end = checked_extent(at, buf.len())? as usize;
        let start = end - buf.len();
        let mut data = self.cell.data.lock();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        drop(data);
        self.cell.touch();
        Ok(buf.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_open()?;
        let size = checked_extent(size, 0)? as usize;
        self.cell.data.lock().resize(size, 0);
        self.cell.touch();
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.cell.data.lock().len() as u64)
    }

    fn flush(&mut self) -> Result<()> {
        self.check_open()
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.cell.locked.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::{resolve_parent, MAX_FILE_SIZE};

    #[tokio::test]
    async fn test_handle_is_exclusive_until_closed() {
        let storage = MemoryStorage::new();
        let file = storage.root().get_file("a", true).await.unwrap();

        let mut handle = file.create_sync_access_handle().await.unwrap();
        assert!(file.create_sync_access_handle().await.is_err());

        handle.close().unwrap();
        assert!(handle.size().is_err());
        let handle = file.create_sync_access_handle().await.unwrap();
        drop(handle);
        assert!(file.create_sync_access_handle().await.is_ok());
    }

    #[tokio::test]
    async fn test_positioned_io() {
        let storage = MemoryStorage::new();
        let file = storage.root().get_file("a", true).await.unwrap();
        let mut handle = file.create_sync_access_handle().await.unwrap();

        handle.write_at(b"world", 6).unwrap();
        handle.write_at(b"hello ", 0).unwrap();
        assert_eq!(handle.size().unwrap(), 11);

        let mut buf = [0u8; 32];
        let n = handle.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(handle.read_at(&mut buf, 100).unwrap(), 0);

        handle.truncate(5).unwrap();
        assert_eq!(handle.size().unwrap(), 5);
        assert_eq!(storage.total_bytes(), 5);
    }

    #[tokio::test]
    async fn test_out_of_range_extents_are_rejected() {
        let storage = MemoryStorage::new();
        let file = storage.root().get_file("a", true).await.unwrap();
        let mut handle = file.create_sync_access_handle().await.unwrap();

        let err = handle.write_at(b"x", u64::MAX).unwrap_err();
        assert_eq!(err.code(), Errno::EINVAL);
        assert!(handle.write_at(b"x", MAX_FILE_SIZE).is_err());
        assert!(handle.truncate(MAX_FILE_SIZE + 1).is_err());
        assert_eq!(handle.size().unwrap(), 0);
        assert_eq!(storage.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_remove_rules() {
        let storage = MemoryStorage::new();
        let root = storage.root();
        let (dir, name) = resolve_parent(&root, "/d/f", true).await.unwrap();
        let file = dir.get_file(name, true).await.unwrap();
        let handle = file.create_sync_access_handle().await.unwrap();

        let err = root.remove_entry("d", false).await.unwrap_err();
        assert_eq!(err.code(), Errno::ENOTEMPTY);
        assert!(root.remove_entry("d", true).await.is_err());

        drop(handle);
        root.remove_entry("d", true).await.unwrap();
        assert!(root.entries().await.unwrap().is_empty());
        assert_eq!(
            root.remove_entry("d", true).await.unwrap_err().code(),
            Errno::ENOENT
        );
    }

    #[tokio::test]
    async fn test_wrong_kind_lookups() {
        let storage = MemoryStorage::new();
        let root = storage.root();
        root.get_file("f", true).await.unwrap();
        root.get_directory("d", true).await.unwrap();

        assert_eq!(
            root.get_directory("f", false).await.err().unwrap().code(),
            Errno::ENOTDIR
        );
        assert_eq!(
            root.get_file("d", false).await.err().unwrap().code(),
            Errno::EISDIR
        );
    }
}
