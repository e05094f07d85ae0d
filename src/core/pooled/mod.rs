//! Pooled write-ahead-logged filesystem
//!
//! Logical files never own a storage entry named after their path. Each file
//! node points at a *backing file* drawn from a pool of pre-created entries
//! whose sync access handles were opened ahead of time, so creating, renaming
//! and deleting files are pointer moves in the in-memory tree and never wait
//! on the asynchronous storage API.
//!
//! Every tree mutation is appended to the write-ahead log before it is
//! applied; if applying fails the append is cut back off, so the log and the
//! tree never disagree. At mount the newest snapshot is loaded and the log
//! replayed through the same apply-only code.
//!
//! ```rust,no_run
//! use poolfs::{FileSystem, MemoryStorage, PoolConfig, PooledFs, WriteFileOptions};
//!
//! # async fn demo() -> poolfs::Result<()> {
//! let storage = MemoryStorage::new();
//! let mut fs = PooledFs::mount(storage.root(), PoolConfig::default()).await?;
//! fs.write_file("/hello.txt", b"hi", WriteFileOptions::default())?;
//! fs.sync_to_fs(false).await?;
//! fs.unmount()?;
//! # Ok(())
//! # }
//! ```

mod tree;

use crate::core::config::PoolConfig;
use crate::core::fs::{buffer_range, FileSystem, FsStats, WriteFileOptions};
use crate::core::node::{now_millis, Node, NodeId, SnapshotNode, FILE_MODE};
use crate::core::path;
use crate::core::storage::{EntryKind, StorageDirectory, SyncAccessHandle};
use crate::core::wal::{
    LogFile, MkdirOptions, Snapshot, StateLog, WalEntry, STATE_FILE, STATE_NEXT_FILE,
};
use crate::error::{Errno, FsError, Result};
use futures::future::{join_all, try_join_all};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use tree::Tree;

/// Offset subtracted from the clock in generated pool filenames
const POOL_NAME_EPOCH: u64 = 1_704_063_600;

/// Something `flush` has to make durable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SyncTarget {
    Log,
    Backing(String),
}

/// An fd's view of a file; the node id goes stale when the file is removed
#[derive(Debug, Clone)]
struct OpenFile {
    path: String,
    node: NodeId,
}

/// Filesystem whose files are backed by a pool of pre-opened storage handles
pub struct PooledFs {
    config: PoolConfig,
    data_dir: Arc<dyn StorageDirectory>,
    log: StateLog,
    tree: Tree,
    /// Backing filename to live handle
    handles: HashMap<String, Box<dyn SyncAccessHandle>>,
    open_files: HashMap<i32, OpenFile>,
    next_fd: i32,
    unsynced: HashSet<SyncTarget>,
    last_checkpoint: Instant,
    pool_counter: u64,
}

async fn open_log(root: &Arc<dyn StorageDirectory>, name: &str) -> Result<LogFile> {
    let file = root.get_file(name, true).await?;
    let handle = file.create_sync_access_handle().await?;
    Ok(LogFile::new(name, handle))
}

async fn open_backing(
    dir: Arc<dyn StorageDirectory>,
    name: String,
    create: bool,
) -> Result<(String, Box<dyn SyncAccessHandle>)> {
    let file = dir.get_file(&name, create).await?;
    let handle = file.create_sync_access_handle().await?;
    Ok((name, handle))
}

impl PooledFs {
    /// Mount the filesystem rooted at `root`
    ///
    /// Recovers the newest snapshot, replays the log, opens one handle per
    /// file and pool entry, then sizes the pool: `initial_pool_size` for a
    /// fresh mount, `maintained_pool_size` otherwise.
    pub async fn mount(root: Arc<dyn StorageDirectory>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = root.get_directory(&config.data_dir, true).await?;

        let primary = open_log(&root, STATE_FILE).await?;
        let secondary = open_log(&root, STATE_NEXT_FILE).await?;
        let (log, recovery) = StateLog::open(primary, secondary, config.corrupt_snapshot)?;

        let mut tree = Tree::from_snapshot(&recovery.snapshot)?;
        let mut skipped = 0;
        for entry in &recovery.entries {
            if let Err(e) = tree.apply(entry) {
                warn!("Skipping log entry {}: {}", entry.opp(), e);
                skipped += 1;
            }
        }

        let mut fs = PooledFs {
            config,
            data_dir,
            log,
            tree,
            handles: HashMap::new(),
            open_files: HashMap::new(),
            next_fd: 0,
            unsynced: HashSet::new(),
            last_checkpoint: Instant::now(),
            pool_counter: 0,
        };
        fs.open_backing_handles().await;
        fs.sweep_orphans().await?;

        let target = if recovery.fresh {
            fs.config.initial_pool_size
        } else {
            fs.config.maintained_pool_size
        };
        fs.maintain_pool_to(target).await?;

        info!(
            "Mounted pooled filesystem: generation {}, {} nodes, {} replayed ({} skipped), pool {}",
            fs.log.generation(),
            fs.tree.arena.len(),
            recovery.entries.len(),
            skipped,
            fs.tree.pool.len()
        );
        Ok(fs)
    }

    /// Open handles for every file node and pool entry, concurrently
    async fn open_backing_handles(&mut self) {
        let files = self.tree.arena.backing_filenames();
        let pool = self.tree.pool.clone();

        let file_results = join_all(
            files
                .into_iter()
                .map(|name| open_backing(Arc::clone(&self.data_dir), name, false)),
        );
        let pool_results = join_all(
            pool.into_iter()
                .map(|name| open_backing(Arc::clone(&self.data_dir), name, false)),
        );
        let (file_results, pool_results) = futures::join!(file_results, pool_results);

        for result in file_results {
            match result {
                Ok((name, handle)) => {
                    self.handles.insert(name, handle);
                }
                Err(e) => warn!("Cannot open backing file: {}", e),
            }
        }

        let mut lost = Vec::new();
        for (name, result) in self.tree.pool.clone().into_iter().zip(pool_results) {
            match result {
                Ok((name, mut handle)) => {
                    // Replay can return a file to the pool before its
                    // truncation reached storage
                    if handle.size().map(|s| s > 0).unwrap_or(false) {
                        if let Err(e) = handle.truncate(0) {
                            warn!("Cannot empty pool file {}: {}", name, e);
                        }
                    }
                    self.handles.insert(name, handle);
                }
                Err(e) => {
                    warn!("Dropping unusable pool file {}: {}", name, e);
                    lost.push(name);
                }
            }
        }
        for name in lost {
            // Logged so the pool stays consistent if we crash before a checkpoint
            let entry = WalEntry::DeletePoolFile { filename: name };
            if let Err(e) = self.with_wal(&entry, |fs| fs.tree.apply(&entry)) {
                warn!("Cannot log removal of pool file: {}", e);
            }
        }
    }

    /// Remove backing files nothing refers to
    ///
    /// They are left behind by a crash between creating a pool file and
    /// logging it.
    async fn sweep_orphans(&mut self) -> Result<()> {
        let referenced: HashSet<String> = self
            .tree
            .arena
            .backing_filenames()
            .into_iter()
            .chain(self.tree.pool.iter().cloned())
            .collect();
        let orphans: Vec<String> = self
            .data_dir
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.kind == EntryKind::File && !referenced.contains(&e.name))
            .map(|e| e.name)
            .collect();
        for name in orphans {
            debug!("Removing orphaned backing file {}", name);
            if let Err(e) = self.data_dir.remove_entry(&name, false).await {
                warn!("Cannot remove orphaned backing file {}: {}", name, e);
            }
        }
        Ok(())
    }

    fn next_pool_filename(&mut self) -> String {
        loop {
            self.pool_counter += 1;
            let name = format!(
                "{:08x}-{:08x}",
                now_millis().saturating_sub(POOL_NAME_EPOCH),
                self.pool_counter
            );
            if !self.handles.contains_key(&name) && !self.tree.pool.contains(&name) {
                return name;
            }
        }
    }

    /// Bring the pool back to `maintained_pool_size`
    pub async fn maintain_pool(&mut self) -> Result<()> {
        self.maintain_pool_to(self.config.maintained_pool_size).await
    }

    /// Grow or shrink the pool to `target` entries
    ///
    /// New handles are acquired together; every pool change is logged.
    pub async fn maintain_pool_to(&mut self, target: usize) -> Result<()> {
        let current = self.tree.pool.len();
        if target > current {
            let names: Vec<String> = (0..target - current)
                .map(|_| self.next_pool_filename())
                .collect();
            let opened = try_join_all(
                names
                    .into_iter()
                    .map(|name| open_backing(Arc::clone(&self.data_dir), name, true)),
            )
            .await?;

            for (name, handle) in opened {
                let entry = WalEntry::CreatePoolFile {
                    filename: name.clone(),
                };
                self.with_wal(&entry, |fs| fs.tree.apply(&entry))?;
                self.handles.insert(name, handle);
            }
            debug!("Grew pool from {} to {}", current, self.tree.pool.len());
        } else if target < current {
            let mut removed = Vec::with_capacity(current - target);
            for _ in target..current {
                let Some(name) = self.tree.pool.last().cloned() else {
                    break;
                };
                let entry = WalEntry::DeletePoolFile {
                    filename: name.clone(),
                };
                self.with_wal(&entry, |fs| fs.tree.apply(&entry))?;
                if let Some(mut handle) = self.handles.remove(&name) {
                    handle.close()?;
                }
                removed.push(name);
            }
            try_join_all(removed.iter().map(|name| self.data_dir.remove_entry(name, false))).await?;
            debug!("Shrank pool from {} to {}", current, self.tree.pool.len());
        }
        Ok(())
    }

    /// Checkpoint if the interval has elapsed since the last one
    pub fn maybe_checkpoint(&mut self) -> Result<bool> {
        if self.last_checkpoint.elapsed() >= self.config.checkpoint_interval {
            self.checkpoint()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Compact the log into a new snapshot
    pub fn checkpoint(&mut self) -> Result<()> {
        self.log
            .checkpoint(self.tree.snapshot_root(), self.tree.pool.clone())?;
        self.unsynced.remove(&SyncTarget::Log);
        self.last_checkpoint = Instant::now();
        info!(
            "Checkpoint generation {} written to {}",
            self.log.generation(),
            self.log.active_name()
        );
        Ok(())
    }

    /// Make every tracked write durable
    pub fn flush(&mut self) -> Result<()> {
        let targets: Vec<SyncTarget> = self.unsynced.drain().collect();
        for target in targets {
            match target {
                SyncTarget::Log => self.log.flush()?,
                SyncTarget::Backing(name) => {
                    // The handle may be gone if its pool entry was deleted
                    let Some(handle) = self.handles.get_mut(&name) else {
                        continue;
                    };
                    if let Err(e) = handle.flush() {
                        warn!("Flush of backing file {} failed: {}", name, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Durability hook: checkpoint when due, refill the pool, then flush
    /// unless `relaxed_durability`
    pub async fn sync_to_fs(&mut self, relaxed_durability: bool) -> Result<()> {
        self.maybe_checkpoint()?;
        self.maintain_pool().await?;
        if !relaxed_durability {
            self.flush()?;
        }
        Ok(())
    }

    /// Checkpoint, flush and release every handle
    ///
    /// Dropping a mount without closing it writes nothing; the next mount
    /// recovers by replay.
    pub fn unmount(mut self) -> Result<()> {
        self.checkpoint()?;
        self.flush()?;
        for (_, mut handle) in self.handles.drain() {
            handle.close()?;
        }
        self.log.close()?;
        info!("Closed pooled filesystem");
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of idle backing files
    pub fn pool_len(&self) -> usize {
        self.tree.pool.len()
    }

    /// Idle backing filenames, in pop order reversed
    pub fn pool(&self) -> &[String] {
        &self.tree.pool
    }

    /// Current tree and pool as a snapshot
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            root: self.tree.snapshot_root(),
            pool: self.tree.pool.clone(),
            generation: self.log.generation(),
        }
    }

    /// Number of handles awaiting `flush`
    pub fn unsynced_len(&self) -> usize {
        self.unsynced.len()
    }

    pub fn open_fd_count(&self) -> usize {
        self.open_files.len()
    }

    /// Append `entry`, then run `apply`; on failure cut the entry back off
    fn with_wal<T>(
        &mut self,
        entry: &WalEntry,
        apply: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let offset = self.log.append(entry)?;
        self.unsynced.insert(SyncTarget::Log);
        match apply(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(rollback) = self.log.rollback(offset) {
                    warn!("Log rollback of {} failed: {}", entry.opp(), rollback);
                }
                Err(e)
            }
        }
    }

    fn track(&mut self, path: &str, backing: &str) {
        if self.config.tracks(path) {
            self.unsynced.insert(SyncTarget::Backing(backing.to_string()));
        }
    }

    fn backing_handle(&mut self, backing: &str) -> Result<&mut Box<dyn SyncAccessHandle>> {
        self.handles.get_mut(backing).ok_or_else(|| {
            FsError::with_message(Errno::EBADF, format!("No open handle for backing file {}", backing))
        })
    }

    /// Empty a backing file that just went back to the pool
    /// Empty a backing file that just went back to the pool
    ///
    /// The log entry is already committed, so a failure is only logged;
    /// the next mount truncates any non-empty pool file.
    fn recycle(&mut self, backing: &str) {
        let Some(handle) = self.handles.get_mut(backing) else {
            return;
        };
        match handle.truncate(0) {
            Ok(()) => {
                self.unsynced.insert(SyncTarget::Backing(backing.to_string()));
            }
            Err(e) => warn!("failed to truncate recycled backing file {}: {}", backing, e),
        }
    }

    /// Forget fds whose file node is gone
    fn drop_stale_fds(&mut self) {
        let tree = &self.tree;
        self.open_files
            .retain(|_, open| tree.arena.get(open.node).is_some());
    }

    fn open_file(&self, fd: i32) -> Result<(&OpenFile, &Node)> {
        let open = self
            .open_files
            .get(&fd)
            .ok_or_else(|| FsError::with_message(Errno::EBADF, format!("Bad file descriptor: {}", fd)))?;
        let node = self.tree.arena.get(open.node).ok_or_else(|| {
            FsError::with_message(Errno::EBADF, format!("File behind fd {} was removed", fd))
        })?;
        Ok((open, node))
    }

    /// Path and backing filename of an fd's file
    fn fd_backing(&self, fd: i32) -> Result<(String, String)> {
        let (open, node) = self.open_file(fd)?;
        let backing = node
            .backing_filename()
            .ok_or_else(|| FsError::with_message(Errno::EISDIR, format!("Is a directory: {}", open.path)))?;
        Ok((open.path.clone(), backing.to_string()))
    }

    fn stats_for(&self, node: &Node) -> Result<FsStats> {
        let size = match node.backing_filename() {
            Some(backing) => match self.handles.get(backing) {
                Some(handle) => handle.size()?,
                None => 0,
            },
            None => 0,
        };
        Ok(FsStats::new(node.mode, size, node.last_modified))
    }

    fn allocate_fd(&mut self) -> i32 {
        loop {
            self.next_fd = self.next_fd.wrapping_add(1).max(1);
            if !self.open_files.contains_key(&self.next_fd) {
                return self.next_fd;
            }
        }
    }
}

impl FileSystem for PooledFs {
    fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        debug!("chmod {} {:o}", path, mode);
        let entry = WalEntry::Chmod {
            path: path.to_string(),
            mode,
        };
        self.with_wal(&entry, |fs| fs.tree.apply(&entry)).map(|_| ())
    }

    fn close(&mut self, fd: i32) -> Result<()> {
        debug!("close {}", fd);
        self.open_files
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| FsError::with_message(Errno::EBADF, format!("Bad file descriptor: {}", fd)))
    }

    fn fstat(&mut self, fd: i32) -> Result<FsStats> {
        let (_, node) = self.open_file(fd)?;
        self.stats_for(node)
    }

    fn lstat(&mut self, path: &str) -> Result<FsStats> {
        let id = self.tree.arena.resolve(path)?;
        let node = self
            .tree
            .arena
            .get(id)
            .ok_or_else(|| FsError::errno(Errno::ENOENT))?;
        self.stats_for(node)
    }

    fn mkdir(&mut self, path: &str, options: MkdirOptions) -> Result<()> {
        debug!("mkdir {} {:?}", path, options);
        let entry = WalEntry::Mkdir {
            path: path.to_string(),
            options,
        };
        self.with_wal(&entry, |fs| fs.tree.apply(&entry)).map(|_| ())
    }

    fn open(&mut self, path: &str, _flags: Option<&str>, _mode: Option<u32>) -> Result<i32> {
        let node = self.tree.arena.resolve(path)?;
        if !self.tree.arena.get(node).is_some_and(Node::is_file) {
            return Err(FsError::with_message(
                Errno::EISDIR,
                format!("Is a directory: {}", path),
            ));
        }
        let fd = self.allocate_fd();
        self.open_files.insert(
            fd,
            OpenFile {
                path: path::normalize(path),
                node,
            },
        );
        debug!("open {} -> {}", path, fd);
        Ok(fd)
    }

    fn readdir(&mut self, path: &str) -> Result<Vec<String>> {
        let id = self.tree.arena.resolve(path)?;
        let children = self.tree.arena.children(id).map_err(|_| {
            FsError::with_message(Errno::ENOTDIR, format!("Not a directory: {}", path))
        })?;
        Ok(children.keys().cloned().collect())
    }

    fn read(
        &mut self,
        fd: i32,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize> {
        let range = buffer_range(buf.len(), offset, length)?;
        let (_, backing) = self.fd_backing(fd)?;
        self.backing_handle(&backing)?.read_at(&mut buf[range], position)
    }

    fn write(
        &mut self,
        fd: i32,
        buf: &[u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize> {
        let range = buffer_range(buf.len(), offset, length)?;
        let (path, backing) = self.fd_backing(fd)?;
        let written = self.backing_handle(&backing)?.write_at(&buf[range], position)?;
        self.track(&path, &backing);
        Ok(written)
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        debug!("rename {} -> {}", old_path, new_path);
        let entry = WalEntry::Rename {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        };
        let released = self.with_wal(&entry, |fs| fs.tree.apply(&entry))?;
        if let Some(backing) = released {
            self.recycle(&backing);
            self.drop_stale_fds();
        }

        // Keep fd paths in step with the tree
        let old = path::normalize(old_path);
        let new = path::normalize(new_path);
        let old_len = path::parts(&old).len();
        for open in self.open_files.values_mut() {
            if path::starts_with(&open.path, &old) {
                let open_parts = path::parts(&open.path);
                let mut parts = path::parts(&new);
                parts.extend_from_slice(&open_parts[old_len..]);
                let moved = path::join(&parts);
                open.path = moved;
            }
        }
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        debug!("rmdir {}", path);
        let entry = WalEntry::Rmdir {
            path: path.to_string(),
        };
        self.with_wal(&entry, |fs| fs.tree.apply(&entry)).map(|_| ())
    }

    fn truncate(&mut self, path: &str, len: u64) -> Result<()> {
        debug!("truncate {} {}", path, len);
        let id = self.tree.arena.resolve(path)?;
        let backing = self
            .tree
            .arena
            .get(id)
            .and_then(Node::backing_filename)
            .map(str::to_string)
            .ok_or_else(|| FsError::with_message(Errno::EISDIR, format!("Is a directory: {}", path)))?;
        self.backing_handle(&backing)?.truncate(len)?;
        self.track(path, &backing);
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        debug!("unlink {}", path);
        let entry = WalEntry::Unlink {
            path: path.to_string(),
        };
        if let Some(backing) = self.with_wal(&entry, |fs| fs.tree.apply(&entry))? {
            self.recycle(&backing);
        }
        self.drop_stale_fds();
        Ok(())
    }

    fn utimes(&mut self, path: &str, atime: u64, mtime: u64) -> Result<()> {
        debug!("utimes {} {} {}", path, atime, mtime);
        let entry = WalEntry::Utimes {
            path: path.to_string(),
            atime,
            mtime,
        };
        self.with_wal(&entry, |fs| fs.tree.apply(&entry)).map(|_| ())
    }

    fn write_file(&mut self, path: &str, data: &[u8], options: WriteFileOptions) -> Result<()> {
        debug!("writeFile {} ({} bytes)", path, data.len());
        let (parent, name) = self.tree.arena.resolve_parent(path)?;
        let now = now_millis();

        let (entry, backing) = match self.tree.arena.child(parent, name)? {
            Some(id) => {
                let backing = self
                    .tree
                    .arena
                    .get(id)
                    .and_then(Node::backing_filename)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        FsError::with_message(Errno::EISDIR, format!("Is a directory: {}", path))
                    })?;
                let entry = WalEntry::SetLastModified {
                    path: path.to_string(),
                    last_modified: now,
                };
                (entry, backing)
            }
            None => {
                let backing = self.tree.pool.last().cloned().ok_or(FsError::PoolExhausted)?;
                let entry = WalEntry::CreateFileNode {
                    path: path.to_string(),
                    node: SnapshotNode::File {
                        last_modified: now,
                        mode: options.mode.filter(|m| *m != 0).unwrap_or(FILE_MODE),
                        backing_filename: backing.clone(),
                    },
                };
                (entry, backing)
            }
        };
        self.with_wal(&entry, |fs| fs.tree.apply(&entry))?;

        let handle = self.backing_handle(&backing)?;
        handle.truncate(data.len() as u64)?;
        if !data.is_empty() {
            handle.write_at(data, 0)?;
        }
        self.track(path, &backing);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::MemoryStorage;

    fn config(pool: usize) -> PoolConfig {
        PoolConfig::default().with_pool_size(pool)
    }

    async fn mount(storage: &MemoryStorage, pool: usize) -> PooledFs {
        PooledFs::mount(storage.root(), config(pool)).await.unwrap()
    }

    #[tokio::test]
    async fn test_fresh_mount_fills_pool() {
        let storage = MemoryStorage::new();
        let fs = mount(&storage, 4).await;
        assert_eq!(fs.pool_len(), 4);
        assert_eq!(fs.snapshot().generation, 0);

        let names: HashSet<_> = fs.pool().iter().cloned().collect();
        assert_eq!(names.len(), 4);
        for name in fs.pool() {
            assert_eq!(name.len(), name.find('-').unwrap() + 9);
        }
    }

    #[tokio::test]
    async fn test_write_read_stat() {
        let storage = MemoryStorage::new();
        let mut fs = mount(&storage, 4).await;
        fs.mkdir("/a", MkdirOptions::default()).unwrap();
        fs.write_file("/a/f", b"hello world", WriteFileOptions::default())
            .unwrap();
        assert_eq!(fs.pool_len(), 3);

        let stats = fs.lstat("/a/f").unwrap();
        assert_eq!(stats.size, 11);
        assert_eq!(stats.mode, FILE_MODE);
        assert_eq!(fs.lstat("/a").unwrap().size, 0);

        // Shorter content replaces, it does not overlay
        fs.write_file("/a/f", b"bye", WriteFileOptions::default()).unwrap();
        assert_eq!(fs.read_file("/a/f").unwrap(), b"bye");
        assert_eq!(fs.pool_len(), 3);

        let fd = fs.open("/a/f", None, None).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(fd, &mut buf, 2, 3, 0).unwrap(), 3);
        assert_eq!(&buf[2..5], b"bye");
        assert_eq!(fs.read(fd, &mut buf, 0, 9, 0).unwrap_err().code(), Errno::EINVAL);
        fs.close(fd).unwrap();
        assert_eq!(fs.close(fd).unwrap_err().code(), Errno::EBADF);
    }

    #[tokio::test]
    async fn test_failed_mutation_rolls_back_log() {
        let storage = MemoryStorage::new();
        let mut fs = mount(&storage, 2).await;
        let before = fs.log.size().unwrap();

        assert_eq!(fs.rmdir("/missing").unwrap_err().code(), Errno::ENOENT);
        assert_eq!(
            fs.mkdir("/x/y", MkdirOptions::default()).unwrap_err().code(),
            Errno::ENOENT
        );
        assert_eq!(fs.log.size().unwrap(), before);

        fs.mkdir("/x", MkdirOptions::default()).unwrap();
        assert!(fs.log.size().unwrap() > before);
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let storage = MemoryStorage::new();
        let mut fs = mount(&storage, 2).await;
        fs.write_file("/x", b"", WriteFileOptions::default()).unwrap();
        fs.write_file("/y", b"", WriteFileOptions::default()).unwrap();
        let err = fs.write_file("/z", b"", WriteFileOptions::default()).unwrap_err();
        assert!(matches!(err, FsError::PoolExhausted));
        assert_eq!(err.code(), Errno::EINVAL);

        fs.maintain_pool().await.unwrap();
        fs.write_file("/z", b"", WriteFileOptions::default()).unwrap();
    }

    #[tokio::test]
    async fn test_fd_survives_rename_and_dies_on_unlink() {
        let storage = MemoryStorage::new();
        let mut fs = mount(&storage, 4).await;
        fs.write_file("/a", b"data", WriteFileOptions::default()).unwrap();
        let fd = fs.open("/a", None, None).unwrap();

        fs.rename("/a", "/b").unwrap();
        assert_eq!(fs.fstat(fd).unwrap().size, 4);
        assert_eq!(fs.open_files[&fd].path, "/b");

        fs.unlink("/b").unwrap();
        assert_eq!(fs.fstat(fd).unwrap_err().code(), Errno::EBADF);
        assert_eq!(fs.pool_len(), 4);
    }

    #[tokio::test]
    async fn test_rename_over_file_closes_its_fds() {
        let storage = MemoryStorage::new();
        let mut fs = mount(&storage, 4).await;
        fs.write_file("/a", b"new", WriteFileOptions::default()).unwrap();
        fs.write_file("/b", b"old contents", WriteFileOptions::default()).unwrap();
        let kept = fs.open("/a", None, None).unwrap();
        let replaced = fs.open("/b", None, None).unwrap();

        fs.rename("/a", "/b").unwrap();
        assert_eq!(fs.open_fd_count(), 1);
        assert!(!fs.open_files.contains_key(&replaced));
        assert_eq!(fs.close(replaced).unwrap_err().code(), Errno::EBADF);

        assert_eq!(fs.open_files[&kept].path, "/b");
        assert_eq!(fs.fstat(kept).unwrap().size, 3);
        assert_eq!(fs.pool_len(), 3);
        assert!(fs.pool().iter().all(|name| fs.handles[name].size().unwrap() == 0));
    }

    #[tokio::test]
    async fn test_unlinked_file_returns_empty_to_pool() {
        let storage = MemoryStorage::new();
        let mut fs = mount(&storage, 1).await;
        fs.write_file("/a", b"secret", WriteFileOptions::default()).unwrap();
        fs.unlink("/a").unwrap();
        fs.write_file("/b", b"", WriteFileOptions::default()).unwrap();
        assert!(fs.read_file("/b").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_prefixes() {
        let storage = MemoryStorage::new();
        let mut fs = PooledFs::mount(
            storage.root(),
            config(4).with_sync_prefixes(["/pg_wal"]),
        )
        .await
        .unwrap();
        fs.flush().unwrap();
        assert_eq!(fs.unsynced_len(), 0);

        fs.mkdir("/pg_wal", MkdirOptions::default()).unwrap();
        fs.write_file("/base", b"x", WriteFileOptions::default()).unwrap();
        // Only the log
        assert_eq!(fs.unsynced_len(), 1);

        fs.write_file("/pg_wal/1", b"x", WriteFileOptions::default()).unwrap();
        assert_eq!(fs.unsynced_len(), 2);
        fs.flush().unwrap();
        assert_eq!(fs.unsynced_len(), 0);
    }

    #[tokio::test]
    async fn test_pool_shrinks_to_maintained_size() {
        let storage = MemoryStorage::new();
        let mut fs = PooledFs::mount(
            storage.root(),
            PoolConfig::default()
                .with_initial_pool_size(6)
                .with_maintained_pool_size(2),
        )
        .await
        .unwrap();
        assert_eq!(fs.pool_len(), 6);
        fs.sync_to_fs(false).await.unwrap();
        assert_eq!(fs.pool_len(), 2);

        let data = storage.root().get_directory("data", false).await.unwrap();
        assert_eq!(data.entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_readdir_and_kinds() {
        let storage = MemoryStorage::new();
        let mut fs = mount(&storage, 4).await;
        fs.mkdir("/d", MkdirOptions::default()).unwrap();
        fs.write_file("/d/b", b"", WriteFileOptions::default()).unwrap();
        fs.write_file("/d/a", b"", WriteFileOptions::default()).unwrap();

        assert_eq!(fs.readdir("/d").unwrap(), vec!["a", "b"]);
        assert_eq!(fs.readdir("/d/a").unwrap_err().code(), Errno::ENOTDIR);
        assert_eq!(fs.open("/d", None, None).unwrap_err().code(), Errno::EISDIR);
        assert_eq!(
            fs.write_file("/d", b"", WriteFileOptions::default()).unwrap_err().code(),
            Errno::EISDIR
        );
        assert_eq!(fs.truncate("/d", 0).unwrap_err().code(), Errno::EISDIR);
    }
}
