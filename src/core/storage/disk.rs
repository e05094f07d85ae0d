//! Host-directory storage primitive
//!
//! Entries map one-to-one onto a directory on the host filesystem. Acquiring
//! directories and files goes through `tokio::fs`; the sync access handle
//! wraps a plain `std::fs::File` and does positioned I/O with seek + read.

use super::{
    checked_extent, DirEntry, EntryKind, EntryMetadata, StorageDirectory, StorageFile,
    SyncAccessHandle,
};
use crate::error::{Errno, FsError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Paths with a live sync access handle, shared by every entry of one storage
type LockSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Storage rooted at a host directory
#[derive(Clone)]
pub struct DiskStorage {
    root: PathBuf,
    locks: LockSet,
}

impl DiskStorage {
    /// Use `root` as the storage root, creating it if needed
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(DiskStorage {
            root,
            locks: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Root directory handle
    pub fn root(&self) -> Arc<dyn StorageDirectory> {
        Arc::new(DiskDirectory {
            name: String::new(),
            path: self.root.clone(),
            locks: Arc::clone(&self.locks),
        })
    }

    /// Host path of the storage root
    pub fn path(&self) -> &Path {
        &self.root
    }
}

struct DiskDirectory {
    name: String,
    path: PathBuf,
    locks: LockSet,
}

struct DiskFile {
    name: String,
    path: PathBuf,
    locks: LockSet,
}

fn entry_error(err: std::io::Error, path: &Path) -> FsError {
    match err.kind() {
        std::io::ErrorKind::NotFound => FsError::with_message(
            Errno::ENOENT,
            format!("Entry not found: {}", path.display()),
        ),
        _ => FsError::Io(err),
    }
}

async fn kind_of(path: &Path) -> Result<Option<EntryKind>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(Some(EntryKind::Directory)),
        Ok(_) => Ok(Some(EntryKind::File)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StorageDirectory for DiskDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_directory(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Arc<dyn StorageDirectory>> {
        let path = self.path.join(name);
        match kind_of(&path).await? {
            Some(EntryKind::Directory) => {}
            Some(EntryKind::File) => {
                return Err(FsError::with_message(
                    Errno::ENOTDIR,
                    format!("Not a directory: {}", name),
                ))
            }
            None if create => tokio::fs::create_dir(&path).await?,
            None => return Err(super::not_found(name)),
        }
        Ok(Arc::new(DiskDirectory {
            name: name.to_string(),
            path,
            locks: Arc::clone(&self.locks),
        }))
    }

    async fn get_file(&self, name: &str, create: bool) -> Result<Arc<dyn StorageFile>> {
        let path = self.path.join(name);
        match kind_of(&path).await? {
            Some(EntryKind::File) => {}
            Some(EntryKind::Directory) => {
                return Err(FsError::with_message(
                    Errno::EISDIR,
                    format!("Is a directory: {}", name),
                ))
            }
            None if create => {
                tokio::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .await?;
            }
            None => return Err(super::not_found(name)),
        }
        Ok(Arc::new(DiskFile {
            name: name.to_string(),
            path,
            locks: Arc::clone(&self.locks),
        }))
    }

    async fn remove_entry(&self, name: &str, recursive: bool) -> Result<()> {
        let path = self.path.join(name);
        match kind_of(&path).await? {
            None => Err(super::not_found(name)),
            Some(EntryKind::File) => {
                if self.locks.lock().contains(&path) {
                    return Err(FsError::Storage(format!(
                        "Cannot remove {}: access handle is open",
                        name
                    )));
                }
                tokio::fs::remove_file(&path).await?;
                Ok(())
            }
            Some(EntryKind::Directory) => {
                if self.locks.lock().iter().any(|p| p.starts_with(&path)) {
                    return Err(FsError::Storage(format!(
                        "Cannot remove {}: contains open access handles",
                        name
                    )));
                }
                if recursive {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    let mut children = tokio::fs::read_dir(&path).await?;
                    if children.next_entry().await?.is_some() {
                        return Err(FsError::with_message(
                            Errno::ENOTEMPTY,
                            format!("Directory not empty: {}", name),
                        ));
                    }
                    tokio::fs::remove_dir(&path).await?;
                }
                Ok(())
            }
        }
    }

    async fn entries(&self) -> Result<Vec<DirEntry>> {
        let mut reader = tokio::fs::read_dir(&self.path)
            .await
            .map_err(|e| entry_error(e, &self.path))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let kind = if entry.file_type().await?.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[async_trait]
impl StorageFile for DiskFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_sync_access_handle(&self) -> Result<Box<dyn SyncAccessHandle>> {
        if !self.locks.lock().insert(self.path.clone()) {
            return Err(FsError::Storage(format!(
                "Access handle already open for {}",
                self.name
            )));
        }

        let opened = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await;
        let file = match opened {
            Ok(file) => file.into_std().await,
            Err(e) => {
                self.locks.lock().remove(&self.path);
                return Err(entry_error(e, &self.path));
            }
        };

        Ok(Box::new(DiskHandle {
            file: Some(file),
            path: self.path.clone(),
            locks: Arc::clone(&self.locks),
        }))
    }

    async fn metadata(&self) -> Result<EntryMetadata> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| entry_error(e, &self.path))?;
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(EntryMetadata {
            size: meta.len(),
            last_modified,
        })
    }
}

/// Positioned I/O over a host file
struct DiskHandle {
    file: Option<File>,
    path: PathBuf,
    locks: LockSet,
}

impl DiskHandle {
    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| {
            FsError::Storage(format!("Handle for {} is closed", self.path.display()))
        })
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        let path = &self.path;
        self.file
            .as_mut()
            .ok_or_else(|| FsError::Storage(format!("Handle for {} is closed", path.display())))
    }
}

impl SyncAccessHandle for DiskHandle {
    fn read_at(&mut self, buf: &mut [u8], at: u64) -> Result<usize> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(at))?;

        // Short reads only at end of file
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write_at(&mut self, buf: &[u8], at: u64) -> Result<usize> {
        checked_extent(at, buf.len())?;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(at))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        checked_extent(size, 0)?;
        self.file()?.set_len(size)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn flush(&mut self) -> Result<()> {
        let file = self.file_mut()?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.file.take().is_some() {
            self.locks.lock().remove(&self.path);
        }
        Ok(())
    }
}

impl Drop for DiskHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
