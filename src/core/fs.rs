//! Synchronous filesystem surface
//!
//! [`FileSystem`] is the call shape every concrete filesystem offers to the
//! host adapter: path-addressed metadata calls plus fd-addressed reads and
//! writes into caller buffers.

use crate::core::wal::MkdirOptions;
use crate::error::{Errno, FsError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

/// Block size reported by `lstat`/`fstat`
pub const BLOCK_SIZE: u64 = 4096;

/// File metadata in the engine's `stat` layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
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
    /// Milliseconds since the UNIX epoch
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl FsStats {
    /// Stats for a node with a single timestamp
    pub fn new(mode: u32, size: u64, last_modified: u64) -> Self {
        FsStats {
            mode,
            nlink: 1,
            size,
            blksize: BLOCK_SIZE,
            blocks: size.div_ceil(BLOCK_SIZE),
            atime: last_modified,
            mtime: last_modified,
            ctime: last_modified,
            ..Default::default()
        }
    }
}

/// Options accepted by `write_file`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteFileOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Validate `offset`/`length` against a caller buffer
pub fn buffer_range(buf_len: usize, offset: usize, length: usize) -> Result<Range<usize>> {
    let end = offset
        .checked_add(length)
        .filter(|end| *end <= buf_len)
        .ok_or_else(|| {
            FsError::with_message(
                Errno::EINVAL,
                format!(
                    "Range {}+{} exceeds buffer of {} bytes",
                    offset, length, buf_len
                ),
            )
        })?;
    Ok(offset..end)
}

/// Synchronous POSIX-like filesystem
pub trait FileSystem {
    fn chmod(&mut self, path: &str, mode: u32) -> Result<()>;

    /// Release an fd; never flushes
    fn close(&mut self, fd: i32) -> Result<()>;

    fn fstat(&mut self, fd: i32) -> Result<FsStats>;

    fn lstat(&mut self, path: &str) -> Result<FsStats>;

    fn mkdir(&mut self, path: &str, options: MkdirOptions) -> Result<()>;

    /// Open a file, returning an fd for `read`/`write`/`fstat`/`close`
    fn open(&mut self, path: &str, flags: Option<&str>, mode: Option<u32>) -> Result<i32>;

    fn readdir(&mut self, path: &str) -> Result<Vec<String>>;

    /// Read up to `length` bytes at file `position` into `buf[offset..]`
    fn read(
        &mut self,
        fd: i32,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize>;

    /// Write `buf[offset..offset + length]` at file `position`
    fn write(
        &mut self,
        fd: i32,
        buf: &[u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize>;

    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()>;

    fn rmdir(&mut self, path: &str) -> Result<()>;

    fn truncate(&mut self, path: &str, len: u64) -> Result<()>;

    fn unlink(&mut self, path: &str) -> Result<()>;

    fn utimes(&mut self, path: &str, atime: u64, mtime: u64) -> Result<()>;

    /// Create or replace a whole file
    fn write_file(&mut self, path: &str, data: &[u8], options: WriteFileOptions) -> Result<()>;

    /// Read a whole file
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let fd = self.open(path, None, None)?;
        let result = (|| -> Result<Vec<u8>> {
            let size = self.fstat(fd)?.size as usize;
            let mut buf = vec![0u8; size];
            let mut total = 0;
            while total < size {
                let n = self.read(fd, &mut buf, total, size - total, total as u64)?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            buf.truncate(total);
            Ok(buf)
        })();
        self.close(fd)?;
        result
    }
}

impl<F: FileSystem> FileSystem for Arc<Mutex<F>> {
    fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        self.lock().chmod(path, mode)
    }

    fn close(&mut self, fd: i32) -> Result<()> {
        self.lock().close(fd)
    }

    fn fstat(&mut self, fd: i32) -> Result<FsStats> {
        self.lock().fstat(fd)
    }

    fn lstat(&mut self, path: &str) -> Result<FsStats> {
        self.lock().lstat(path)
    }

    fn mkdir(&mut self, path: &str, options: MkdirOptions) -> Result<()> {
        self.lock().mkdir(path, options)
    }

    fn open(&mut self, path: &str, flags: Option<&str>, mode: Option<u32>) -> Result<i32> {
        self.lock().open(path, flags, mode)
    }

    fn readdir(&mut self, path: &str) -> Result<Vec<String>> {
        self.lock().readdir(path)
    }

    fn read(
        &mut self,
        fd: i32,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize> {
        self.lock().read(fd, buf, offset, length, position)
    }

    fn write(
        &mut self,
        fd: i32,
        buf: &[u8],
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize> {
        self.lock().write(fd, buf, offset, length, position)
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.lock().rename(old_path, new_path)
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        self.lock().rmdir(path)
    }

    fn truncate(&mut self, path: &str, len: u64) -> Result<()> {
        self.lock().truncate(path, len)
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        self.lock().unlink(path)
    }

    fn utimes(&mut self, path: &str, atime: u64, mtime: u64) -> Result<()> {
        self.lock().utimes(path, atime, mtime)
    }

    fn write_file(&mut self, path: &str, data: &[u8], options: WriteFileOptions) -> Result<()> {
        self.lock().write_file(path, data, options)
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        self.lock().read_file(path)
    }
}
