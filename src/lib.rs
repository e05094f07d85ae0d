//! # poolfs - pooled write-ahead-logged filesystem
//!
//! `poolfs` gives an embedded database engine, whose VFS hooks are strictly
//! synchronous, a durable filesystem on top of a storage primitive that is
//! asynchronous to open but synchronous once a file handle is held.
//!
//! Two filesystems implement the same synchronous [`FileSystem`] surface:
//!
//! - [`PooledFs`] keeps the whole tree in memory, maps every logical file to
//!   a pre-opened backing file from a pool, and makes metadata durable
//!   through a JSON-lines write-ahead log with periodic checkpoints
//! - [`SyncBridge`] forwards every call to a worker thread that owns the
//!   storage primitive, blocking on a shared control slot until it answers
//!
//! [`MountAdapter`] turns either one into the node/stream callbacks the
//! engine's VFS layer calls, with failures reduced to an [`Errno`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use poolfs::{FileSystem, MemoryStorage, PoolConfig, PooledFs, WriteFileOptions};
//!
//! # async fn demo() -> poolfs::Result<()> {
//! let storage = MemoryStorage::new();
//! let mut fs = PooledFs::mount(storage.root(), PoolConfig::default().with_pool_size(16)).await?;
//!
//! fs.write_file("/PG_VERSION", b"16", WriteFileOptions::default())?;
//! assert_eq!(fs.read_file("/PG_VERSION")?, b"16");
//!
//! // Make backing writes and the log durable, then refill the pool
//! fs.sync_to_fs(false).await?;
//! fs.unmount()?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;

pub use crate::core::{
    adapter::{ErrnoError, MountAdapter, NodeAttr, NodeRef, SetAttr, Stream, VfsNode, Whence},
    bridge::{SharedRegion, SyncBridge},
    config::{BridgeConfig, CorruptSnapshotPolicy, PoolConfig},
    fs::{FileSystem, FsStats, WriteFileOptions},
    node::SnapshotNode,
    pooled::PooledFs,
    storage::{
        DiskStorage, EntryKind, MemoryStorage, StorageDirectory, StorageFile, SyncAccessHandle,
        MAX_FILE_SIZE,
    },
    wal::{MkdirOptions, Snapshot, WalEntry},
};
pub use crate::error::{Errno, FsError, Result};
