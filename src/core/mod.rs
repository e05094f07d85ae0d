//! Filesystem core
//!
//! - [`storage`] - the asynchronous storage primitive and its implementations
//! - [`node`] - the in-memory tree arena and its snapshot form
//! - [`wal`] - log entries and the two-slot durable log
//! - [`pooled`] - the pooled write-ahead-logged filesystem
//! - [`bridge`] - the synchronous cross-thread bridge
//! - [`adapter`] - identity-addressed hooks over any [`fs::FileSystem`]

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod fs;
pub mod node;
pub mod path;
pub mod pooled;
pub mod storage;
pub mod wal;
