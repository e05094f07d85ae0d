use super::worker;
use super::{Call, Response, SharedRegion, State, CALL_LENGTH, CHUNKED, RESPONSE_LENGTH};
use crate::core::config::BridgeConfig;
use crate::core::fs::{buffer_range, FileSystem, FsStats, WriteFileOptions};
use crate::core::storage::StorageDirectory;
use crate::core::wal::MkdirOptions;
use crate::error::{Errno, FsError, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

const ARGS_TOO_LARGE: &str = "Arguments too large";

/// Bytes moved alongside a call through the chunked sub-protocol
enum Transfer<'a> {
    None,
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// Blocking filesystem whose calls run on a dedicated worker thread
///
/// Each call blocks the calling thread until the worker answers. One bridge
/// serves one caller; wrap it in a mutex to share it.
///
/// # Example
///
/// ```no_run
/// use poolfs::{BridgeConfig, FileSystem, MemoryStorage, SyncBridge, WriteFileOptions};
///
/// let storage = MemoryStorage::new();
/// let mut fs = SyncBridge::spawn(storage.root(), BridgeConfig::default())?;
/// fs.write_file("/hello", b"hi", WriteFileOptions::default())?;
/// assert_eq!(fs.read_file("/hello")?, b"hi");
/// fs.shutdown()?;
/// # Ok::<(), poolfs::FsError>(())
/// ```
pub struct SyncBridge {
    region: Arc<SharedRegion>,
    worker: Option<JoinHandle<()>>,
}

impl SyncBridge {
    /// Start a worker over `root` and wait until it is ready
    pub fn spawn(root: Arc<dyn StorageDirectory>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let region = Arc::new(SharedRegion::new(&config));
        let worker = worker::spawn(Arc::clone(&region), root)?;
        debug!(
            "bridge started (call {} bytes, response {} bytes, {} shared buffers)",
            config.call_buffer_size,
            config.response_buffer_size,
            config.shared_buffers.len()
        );
        Ok(SyncBridge {
            region,
            worker: Some(worker),
        })
    }

    /// The region shared with the worker
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Copy `data` into shared buffer `index` at `offset`
    pub fn fill_shared_buffer(&self, index: usize, offset: usize, data: &[u8]) -> Result<()> {
        let mut buffer = self.shared_buffer(index)?;
        let range = buffer_range(buffer.len(), offset, data.len())?;
        buffer[range].copy_from_slice(data);
        Ok(())
    }

    /// Copy `out.len()` bytes out of shared buffer `index` at `offset`
    pub fn copy_shared_buffer(&self, index: usize, offset: usize, out: &mut [u8]) -> Result<()> {
        let buffer = self.shared_buffer(index)?;
        let range = buffer_range(buffer.len(), offset, out.len())?;
        out.copy_from_slice(&buffer[range]);
        Ok(())
    }

    fn shared_buffer(&self, index: usize) -> Result<parking_lot::MutexGuard<'_, Box<[u8]>>> {
        self.region.shared_buffer(index).ok_or_else(|| {
            FsError::with_message(Errno::EINVAL, format!("Shared buffer not found: {}", index))
        })
    }

    /// Read from `fd` straight into shared buffer `index`, no chunking
    pub fn read_shared(
        &mut self,
        fd: i32,
        index: usize,
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize> {
        let call = Call::Read {
            fd,
            buffer: shared_index(index)?,
            offset,
            length,
            position,
        };
        self.call(&call, Transfer::None)
    }

    /// Write from shared buffer `index` to `fd`, no chunking
    pub fn write_shared(
        &mut self,
        fd: i32,
        index: usize,
        offset: usize,
        length: usize,
        position: u64,
    ) -> Result<usize> {
        let call = Call::Write {
            fd,
            buffer: shared_index(index)?,
            offset,
            length,
            position,
        };
        self.call(&call, Transfer::None)
    }

    /// Stop the worker and wait for it
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let result = self.exchange(&Call::Exit, Transfer::None).map(|_| ());
        if worker.join().is_err() {
            return Err(FsError::Protocol("bridge worker panicked".into()));
        }
        result
    }

    fn call<T: DeserializeOwned>(&mut self, call: &Call, transfer: Transfer<'_>) -> Result<T> {
        if self.worker.is_none() {
            return Err(FsError::Protocol("bridge is shut down".into()));
        }
        self.exchange(call, transfer)?.into_result()
    }

    /// Run one call to completion, driving any chunk rounds it needs
    fn exchange(&mut self, call: &Call, mut transfer: Transfer<'_>) -> Result<Response> {
        let region = &self.region;
        let bytes = serde_json::to_vec(call)?;
        if bytes.len() > region.call_capacity() {
            return Err(FsError::with_message(Errno::EINVAL, ARGS_TOO_LARGE));
        }
        region.call_buffer()[..bytes.len()].copy_from_slice(&bytes);
        region.store(CALL_LENGTH, bytes.len() as i32);
        region.set_state(State::Call);

        let mut moved = 0;
        loop {
            match region.wait_state(&[State::Response, State::AskNext]) {
                State::AskNext => {
                    match &mut transfer {
                        Transfer::Read(out) => {
                            let n = (region.load(RESPONSE_LENGTH).max(0) as usize)
                                .min(out.len() - moved);
                            out[moved..moved + n].copy_from_slice(&region.response_buffer()[..n]);
                            moved += n;
                        }
                        Transfer::Write(data) => {
                            let n = region.call_capacity().min(data.len() - moved);
                            region.call_buffer()[..n].copy_from_slice(&data[moved..moved + n]);
                            region.store(CALL_LENGTH, n as i32);
                            moved += n;
                        }
                        Transfer::None => {
                            warn!("worker asked for a chunk during {}", call.method());
                            region.store(CALL_LENGTH, 0);
                        }
                    }
                    region.set_state(State::SendNext);
                }
                _ => break,
            }
        }

        let len = (region.load(RESPONSE_LENGTH).max(0) as usize).min(region.response_capacity());
        let response = serde_json::from_slice::<Response>(&region.response_buffer()[..len]);
        region.set_state(State::Idle);
        Ok(response?)
    }
}

fn shared_index(index: usize) -> Result<i32> {
    i32::try_from(index)
        .map_err(|_| FsError::with_message(Errno::EINVAL, format!("Shared buffer not found: {}", index)))
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Stopping bridge worker failed: {}", e);
        }
    }
}

impl FileSystem for SyncBridge {
    fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        let call = Call::Chmod {
            path: path.to_string(),
            mode,
        };
        self.call(&call, Transfer::None)
    }

    fn close(&mut self, fd: i32) -> Result<()> {
        self.call(&Call::Close { fd }, Transfer::None)
    }

    fn fstat(&mut self, fd: i32) -> Result<FsStats> {
        self.call(&Call::Fstat { fd }, Transfer::None)
    }

    fn lstat(&mut self, path: &str) -> Result<FsStats> {
        let call = Call::Lstat {
            path: path.to_string(),
        };
        self.call(&call, Transfer::None)
    }

    fn mkdir(&mut self, path: &str, options: MkdirOptions) -> Result<()> {
        let call = Call::Mkdir {
            path: path.to_string(),
            options,
        };
        self.call(&call, Transfer::None)
    }

    fn open(&mut self, path: &str, flags: Option<&str>, mode: Option<u32>) -> Result<i32> {
        let call = Call::Open {
            path: path.to_string(),
            flags: flags.map(str::to_string),
            mode,
        };
        self.call(&call, Transfer::None)
    }

    fn readdir(&mut self, path: &str) -> Result<Vec<String>> {
        let call = Call::Readdir {
            path: path.to_string(),
        };
        self.call(&call, Transfer::None)
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
        let call = Call::Read {
            fd,
            buffer: CHUNKED,
            offset: 0,
            length,
            position,
        };
        self.call(&call, Transfer::Read(&mut buf[range]))
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
        let call = Call::Write {
            fd,
            buffer: CHUNKED,
            offset: 0,
            length,
            position,
        };
        self.call(&call, Transfer::Write(&buf[range]))
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let call = Call::Rename {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        };
        self.call(&call, Transfer::None)
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        let call = Call::Rmdir {
            path: path.to_string(),
        };
        self.call(&call, Transfer::None)
    }

    fn truncate(&mut self, path: &str, len: u64) -> Result<()> {
        let call = Call::Truncate {
            path: path.to_string(),
            len,
        };
        self.call(&call, Transfer::None)
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        let call = Call::Unlink {
            path: path.to_string(),
        };
        self.call(&call, Transfer::None)
    }

    fn utimes(&mut self, path: &str, atime: u64, mtime: u64) -> Result<()> {
        let call = Call::Utimes {
            path: path.to_string(),
            atime,
            mtime,
        };
        self.call(&call, Transfer::None)
    }

    /// Inline when the encoded call fits the call buffer, chunked otherwise
    fn write_file(&mut self, path: &str, data: &[u8], options: WriteFileOptions) -> Result<()> {
        let inline = Call::WriteFile {
            path: path.to_string(),
            data: data.to_vec(),
            options,
        };
        match self.call::<()>(&inline, Transfer::None) {
            Err(FsError::Errno { message, .. }) if message == ARGS_TOO_LARGE => {}
            other => return other,
        }

        let empty = Call::WriteFile {
            path: path.to_string(),
            data: Vec::new(),
            options,
        };
        self.call::<()>(&empty, Transfer::None)?;
        let fd = self.open(path, Some("w"), options.mode)?;
        let written = self.write(fd, data, 0, data.len(), 0);
        self.close(fd)?;
        let written = written?;
        if written != data.len() {
            return Err(FsError::Storage(format!(
                "short write to {}: {} of {} bytes",
                path,
                written,
                data.len()
            )));
        }
        Ok(())
    }
}
