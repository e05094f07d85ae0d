//! Bridge worker: the side that owns the storage primitive
//!
//! The worker runs one call at a time on a current-thread tokio runtime and
//! keeps no tree of its own; every path is resolved against the storage
//! hierarchy when the call arrives.

use super::{Call, Response, SharedRegion, State, CALL_LENGTH, CHUNKED, FIRST_FD, RESPONSE_LENGTH};
use crate::core::fs::{buffer_range, FsStats, WriteFileOptions};
use crate::core::node::{DIR_MODE, FILE_MODE};
use crate::core::path;
use crate::core::storage::{
    resolve_directory, resolve_entry, resolve_parent, EntryKind, StorageDirectory, StorageEntry,
    StorageFile, SyncAccessHandle,
};
use crate::core::wal::MkdirOptions;
use crate::error::{Errno, FsError, Result};
use crossbeam::channel::Sender;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bytes moved per round when copying files during rename
const COPY_CHUNK: usize = 64 * 1024;

/// The one sync handle of a path, shared by every fd open on it
struct SharedHandle {
    file: Arc<dyn StorageFile>,
    handle: Box<dyn SyncAccessHandle>,
    refs: usize,
}

pub(crate) struct Worker {
    region: Arc<SharedRegion>,
    root: Arc<dyn StorageDirectory>,
    /// fd to normalized path
    fds: HashMap<i32, String>,
    /// normalized path to its live handle
    handles: HashMap<String, SharedHandle>,
    next_fd: i32,
}

/// Start the worker thread; returns once it is ready for calls
pub(crate) fn spawn(
    region: Arc<SharedRegion>,
    root: Arc<dyn StorageDirectory>,
) -> Result<std::thread::JoinHandle<()>> {
    let (ready_tx, ready_rx) = crossbeam::channel::bounded::<std::result::Result<(), String>>(1);
    let handle = std::thread::Builder::new()
        .name("poolfs-bridge".to_string())
        .spawn(move || run(region, root, ready_tx))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(FsError::Protocol(format!("bridge worker failed to start: {}", e))),
        Err(_) => Err(FsError::Protocol("bridge worker exited during start".into())),
    }
}

fn run(
    region: Arc<SharedRegion>,
    root: Arc<dyn StorageDirectory>,
    ready: Sender<std::result::Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    let mut worker = Worker {
        region,
        root,
        fds: HashMap::new(),
        handles: HashMap::new(),
        next_fd: FIRST_FD,
    };
    let _ = ready.send(Ok(()));
    runtime.block_on(worker.main_loop());
}

impl Worker {
    async fn main_loop(&mut self) {
        loop {
            self.region.wait_state(&[State::Call]);
            self.region.set_state(State::Process);

            let len = (self.region.load(CALL_LENGTH).max(0) as usize).min(self.region.call_capacity());
            let bytes = self.region.call_buffer()[..len].to_vec();
            let (response, exit) = match serde_json::from_slice::<Call>(&bytes) {
                Ok(Call::Exit) => {
                    self.release_all();
                    (Response::value(Value::Null), true)
                }
                Ok(call) => {
                    debug!("bridge call {}", call.method());
                    let response = match self.dispatch(call).await {
                        Ok(value) => Response::Value { value },
                        Err(e) => Response::error(&e),
                    };
                    (response, false)
                }
                Err(e) => (Response::error(&FsError::Protocol(e.to_string())), false),
            };

            self.respond(&response);
            if exit {
                debug!("bridge worker exiting");
                return;
            }
        }
    }

    fn respond(&self, response: &Response) {
        let mut bytes = serde_json::to_vec(response).unwrap_or_default();
        if bytes.len() > self.region.response_capacity() {
            let err = FsError::with_message(Errno::EINVAL, "Response too large");
            bytes = serde_json::to_vec(&Response::error(&err)).unwrap_or_default();
        }
        self.region.response_buffer()[..bytes.len()].copy_from_slice(&bytes);
        self.region.store(RESPONSE_LENGTH, bytes.len() as i32);
        self.region.set_state(State::Response);
    }

    async fn dispatch(&mut self, call: Call) -> Result<Value> {
        let value = match call {
            Call::Chmod { path, .. } | Call::Utimes { path, .. } => {
                // The primitive stores neither; the path must still exist
                resolve_entry(&self.root, &path).await?;
                Value::Null
            }
            Call::Close { fd } => {
                self.close(fd)?;
                Value::Null
            }
            Call::Fstat { fd } => to_value(self.fstat(fd).await?)?,
            Call::Lstat { path } => to_value(self.lstat(&path).await?)?,
            Call::Mkdir { path, options } => {
                self.mkdir(&path, options).await?;
                Value::Null
            }
            Call::Open { path, flags, .. } => to_value(self.open(&path, flags.as_deref()).await?)?,
            Call::Readdir { path } => {
                let dir = resolve_directory(&self.root, &path, false).await?;
                let names: Vec<String> = dir.entries().await?.into_iter().map(|e| e.name).collect();
                to_value(names)?
            }
            Call::Read {
                fd,
                buffer,
                offset,
                length,
                position,
            } => to_value(self.read(fd, buffer, offset, length, position)?)?,
            Call::Write {
                fd,
                buffer,
                offset,
                length,
                position,
            } => to_value(self.write(fd, buffer, offset, length, position)?)?,
            Call::Rename { old_path, new_path } => {
                self.rename(&old_path, &new_path).await?;
                Value::Null
            }
            Call::Rmdir { path } => {
                let (dir, name) = resolve_parent(&self.root, &path, false).await?;
                dir.get_directory(name, false).await?;
                dir.remove_entry(name, false).await?;
                Value::Null
            }
            Call::Truncate { path, len } => {
                self.with_handle(&path, false, |handle| handle.truncate(len))
                    .await?;
                Value::Null
            }
            Call::Unlink { path } => {
                let (dir, name) = resolve_parent(&self.root, &path, false).await?;
                dir.get_file(name, false).await?;
                let released = self.release_under(&path);
                self.forget(&released);
                dir.remove_entry(name, false).await?;
                Value::Null
            }
            Call::WriteFile { path, data, options } => {
                self.write_file(&path, &data, options).await?;
                Value::Null
            }
            Call::Exit => Value::Null,
        };
        Ok(value)
    }

    fn path_of(&self, fd: i32) -> Result<&str> {
        self.fds
            .get(&fd)
            .map(String::as_str)
            .ok_or_else(|| FsError::with_message(Errno::EBADF, format!("File descriptor not found: {}", fd)))
    }

    fn handle_of(&mut self, fd: i32) -> Result<&mut SharedHandle> {
        let path = self.path_of(fd)?.to_string();
        self.handles
            .get_mut(&path)
            .ok_or_else(|| FsError::with_message(Errno::EBADF, format!("File descriptor not found: {}", fd)))
    }

    async fn open(&mut self, path: &str, flags: Option<&str>) -> Result<i32> {
        let key = path::normalize(path);
        if let Some(shared) = self.handles.get_mut(&key) {
            shared.refs += 1;
        } else {
            let create = flags.is_some_and(|f| f.contains('w') || f.contains('a'));
            let (dir, name) = resolve_parent(&self.root, path, false).await?;
            let file = dir.get_file(name, create).await?;
            let handle = file.create_sync_access_handle().await?;
            self.handles.insert(
                key.clone(),
                SharedHandle {
                    file,
                    handle,
                    refs: 1,
                },
            );
        }

        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, key);
        Ok(fd)
    }

    fn close(&mut self, fd: i32) -> Result<()> {
        let path = self
            .fds
            .remove(&fd)
            .ok_or_else(|| FsError::with_message(Errno::EBADF, format!("File descriptor not found: {}", fd)))?;
        let last = match self.handles.get_mut(&path) {
            Some(shared) => {
                shared.refs -= 1;
                shared.refs == 0
            }
            None => false,
        };
        if last {
            if let Some(mut shared) = self.handles.remove(&path) {
                shared.handle.close()?;
            }
        }
        Ok(())
    }

    async fn fstat(&mut self, fd: i32) -> Result<FsStats> {
        let shared = self.handle_of(fd)?;
        let size = shared.handle.size()?;
        let last_modified = shared.file.metadata().await?.last_modified;
        Ok(FsStats::new(FILE_MODE, size, last_modified))
    }

    async fn lstat(&mut self, path: &str) -> Result<FsStats> {
        match resolve_entry(&self.root, path).await? {
            StorageEntry::File(file) => {
                let meta = file.metadata().await?;
                Ok(FsStats::new(FILE_MODE, meta.size, meta.last_modified))
            }
            StorageEntry::Directory(_) => Ok(FsStats::new(DIR_MODE, 0, 0)),
        }
    }

    async fn mkdir(&mut self, path: &str, options: MkdirOptions) -> Result<()> {
        let Some((parents, name)) = path::split_parent(path) else {
            if options.recursive {
                return Ok(());
            }
            return Err(FsError::with_message(Errno::EEXIST, "File exists: /"));
        };
        let dir = resolve_directory(&self.root, &path::join(&parents), options.recursive)
            .await
            .map_err(|e| match e.code() {
                Errno::ENOTDIR => e,
                _ => FsError::with_message(Errno::ENOENT, format!("Dir not found: {}", path)),
            })?;

        if let Some(existing) = dir.entries().await?.into_iter().find(|e| e.name == name) {
            if options.recursive && existing.kind == EntryKind::Directory {
                return Ok(());
            }
            return Err(FsError::with_message(Errno::EEXIST, format!("File exists: {}", path)));
        }
        dir.get_directory(name, true).await?;
        Ok(())
    }

    fn read(&mut self, fd: i32, buffer: i32, offset: usize, length: usize, position: u64) -> Result<usize> {
        let region = Arc::clone(&self.region);
        let shared = self.handle_of(fd)?;

        if buffer != CHUNKED {
            let mut bulk = shared_buffer(&region, buffer)?;
            let range = buffer_range(bulk.len(), offset, length)?;
            return shared.handle.read_at(&mut bulk[range], position);
        }

        // One response buffer per round until done or the file runs out
        let mut read = 0;
        while read < length {
            let chunk = region.response_capacity().min(length - read);
            let n = {
                let mut out = region.response_buffer();
                shared.handle.read_at(&mut out[..chunk], position.saturating_add(read as u64))?
            };
            region.store(RESPONSE_LENGTH, n as i32);
            read += n;
            region.set_state(State::AskNext);
            region.wait_state(&[State::SendNext]);
            if n < chunk {
                break;
            }
        }
        Ok(read)
    }

    fn write(&mut self, fd: i32, buffer: i32, offset: usize, length: usize, position: u64) -> Result<usize> {
        let region = Arc::clone(&self.region);
        let shared = self.handle_of(fd)?;

        if buffer != CHUNKED {
            let bulk = shared_buffer(&region, buffer)?;
            let range = buffer_range(bulk.len(), offset, length)?;
            return shared.handle.write_at(&bulk[range], position);
        }

        let mut written = 0;
        while written < length {
            region.set_state(State::AskNext);
            region.wait_state(&[State::SendNext]);
            let chunk = (region.load(CALL_LENGTH).max(0) as usize)
                .min(length - written)
                .min(region.call_capacity());
            if chunk == 0 {
                break;
            }
            let data = region.call_buffer()[..chunk].to_vec();
            written += shared.handle.write_at(&data, position.saturating_add(written as u64))?;
        }
        Ok(written)
    }

    /// Run `f` on the path's sync handle, borrowing an open one if any
    async fn with_handle<T>(
        &mut self,
        path: &str,
        create: bool,
        f: impl FnOnce(&mut dyn SyncAccessHandle) -> Result<T>,
    ) -> Result<T> {
        let key = path::normalize(path);
        if let Some(shared) = self.handles.get_mut(&key) {
            return f(shared.handle.as_mut());
        }
        let (dir, name) = resolve_parent(&self.root, path, false).await?;
        let file = dir.get_file(name, create).await?;
        let mut handle = file.create_sync_access_handle().await?;
        let result = f(handle.as_mut());
        let closed = handle.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    async fn write_file(&mut self, path: &str, data: &[u8], _options: WriteFileOptions) -> Result<()> {
        self.with_handle(path, true, |handle| {
            handle.truncate(0)?;
            if !data.is_empty() {
                handle.write_at(data, 0)?;
            }
            handle.flush()
        })
        .await
    }

    /// Close handles on `path` and below; their fds go dead
    fn release_under(&mut self, path: &str) -> Vec<String> {
        let prefix = path::normalize(path);
        let released: Vec<String> = self
            .handles
            .keys()
            .filter(|p| path::starts_with(p, &prefix))
            .cloned()
            .collect();
        for key in &released {
            if let Some(mut shared) = self.handles.remove(key) {
                if let Err(e) = shared.handle.close() {
                    warn!("Closing handle for {} failed: {}", key, e);
                }
            }
        }
        released
    }

    /// Drop the fds of released paths
    fn forget(&mut self, released: &[String]) {
        self.fds.retain(|_, path| !released.contains(path));
    }

    fn release_all(&mut self) {
        for (path, mut shared) in self.handles.drain() {
            if let Err(e) = shared.handle.close() {
                warn!("Closing handle for {} failed: {}", path, e);
            }
        }
        self.fds.clear();
    }

    /// Copy-then-remove; the primitive has no move
    async fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let old = path::normalize(old_path);
        let new = path::normalize(new_path);
        if old == new {
            return Ok(());
        }
        let source = resolve_entry(&self.root, &old).await?;
        let (old_dir, old_name) = resolve_parent(&self.root, &old, false).await?;
        let (new_dir, new_name) = resolve_parent(&self.root, &new, false).await?;

        if source.kind() == EntryKind::Directory && path::starts_with(&new, &old) {
            return Err(FsError::with_message(
                Errno::EINVAL,
                format!("Cannot move {} into itself", old),
            ));
        }
        if let Ok(target) = resolve_entry(&self.root, &new).await {
            match (source.kind(), &target) {
                (EntryKind::File, StorageEntry::Directory(_)) => {
                    return Err(FsError::with_message(Errno::EISDIR, format!("Is a directory: {}", new)))
                }
                (EntryKind::Directory, StorageEntry::File(_)) => {
                    return Err(FsError::with_message(Errno::ENOTDIR, format!("Not a directory: {}", new)))
                }
                (EntryKind::Directory, StorageEntry::Directory(dir)) => {
                    if !dir.entries().await?.is_empty() {
                        return Err(FsError::with_message(
                            Errno::ENOTEMPTY,
                            format!("Directory not empty: {}", new),
                        ));
                    }
                    new_dir.remove_entry(new_name, false).await?;
                }
                // An overwritten file keeps no fds
                (EntryKind::File, StorageEntry::File(_)) => {
                    let released = self.release_under(&new);
                    self.forget(&released);
                }
            }
        }

        // Handles under the source are reopened at their new paths
        let moved = self.release_under(&old);
        match source {
            StorageEntry::File(file) => {
                copy_file(file.as_ref(), new_dir.as_ref(), new_name).await?;
                old_dir.remove_entry(old_name, false).await?;
            }
            StorageEntry::Directory(dir) => {
                let target = new_dir.get_directory(new_name, true).await?;
                copy_directory(dir, target).await?;
                old_dir.remove_entry(old_name, true).await?;
            }
        }
        self.reopen_moved(&old, &new, moved).await
    }

    async fn reopen_moved(&mut self, old: &str, new: &str, moved: Vec<String>) -> Result<()> {
        let old_len = path::parts(old).len();
        for old_key in moved {
            let key_parts = path::parts(&old_key);
            let mut parts = path::parts(new);
            parts.extend_from_slice(&key_parts[old_len..]);
            let new_key = path::join(&parts);

            let (dir, name) = resolve_parent(&self.root, &new_key, false).await?;
            let file = dir.get_file(name, false).await?;
            let handle = file.create_sync_access_handle().await?;
            let refs = self.fds.values().filter(|p| **p == old_key).count();
            for path in self.fds.values_mut().filter(|p| **p == old_key) {
                *path = new_key.clone();
            }
            self.handles.insert(new_key, SharedHandle { file, handle, refs });
        }
        Ok(())
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn shared_buffer(region: &SharedRegion, index: i32) -> Result<parking_lot::MutexGuard<'_, Box<[u8]>>> {
    usize::try_from(index)
        .ok()
        .and_then(|i| region.shared_buffer(i))
        .ok_or_else(|| FsError::with_message(Errno::EINVAL, format!("Shared buffer not found: {}", index)))
}

async fn copy_file(source: &dyn StorageFile, dir: &dyn StorageDirectory, name: &str) -> Result<()> {
    let mut from = source.create_sync_access_handle().await?;
    let target = dir.get_file(name, true).await?;
    let mut to = target.create_sync_access_handle().await?;
    to.truncate(0)?;

    let mut buf = vec![0u8; COPY_CHUNK];
    let mut at = 0u64;
    loop {
        let n = from.read_at(&mut buf, at)?;
        if n == 0 {
            break;
        }
        to.write_at(&buf[..n], at)?;
        at += n as u64;
    }
    to.flush()?;
    to.close()?;
    from.close()
}

fn copy_directory(
    source: Arc<dyn StorageDirectory>,
    target: Arc<dyn StorageDirectory>,
) -> futures::future::BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        for entry in source.entries().await? {
            match entry.kind {
                EntryKind::File => {
                    let file = source.get_file(&entry.name, false).await?;
                    copy_file(file.as_ref(), target.as_ref(), &entry.name).await?;
                }
                EntryKind::Directory => {
                    let from = source.get_directory(&entry.name, false).await?;
                    let to = target.get_directory(&entry.name, true).await?;
                    copy_directory(from, to).await?;
                }
            }
        }
        Ok(())
    })
}
