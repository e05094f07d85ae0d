//! Crash recovery tests
//!
//! A crash is simulated by dropping a mount without `unmount`: nothing is
//! checkpointed or flushed, and the next mount over the same storage has to
//! rebuild the tree from the log.

use poolfs::core::wal::{parse_log, ParsedLog};
use poolfs::{
    CorruptSnapshotPolicy, Errno, FileSystem, FsError, MemoryStorage, MkdirOptions, PoolConfig,
    PooledFs, SnapshotNode, StorageDirectory, StorageFile, SyncAccessHandle, WriteFileOptions,
};

fn config() -> PoolConfig {
    PoolConfig::default().with_pool_size(8)
}

async fn mount(storage: &MemoryStorage) -> PooledFs {
    PooledFs::mount(storage.root(), config()).await.unwrap()
}

fn backing_of(fs: &PooledFs, path: &str) -> Option<String> {
    let mut node = fs.snapshot().root;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        node = match node {
            SnapshotNode::Directory { mut children, .. } => children.remove(part)?,
            SnapshotNode::File { .. } => return None,
        };
    }
    match node {
        SnapshotNode::File {
            backing_filename, ..
        } => Some(backing_filename),
        SnapshotNode::Directory { .. } => None,
    }
}

async fn read_raw(storage: &MemoryStorage, name: &str) -> Vec<u8> {
    let file = storage.root().get_file(name, false).await.unwrap();
    let mut handle = file.create_sync_access_handle().await.unwrap();
    let mut buf = vec![0u8; handle.size().unwrap() as usize];
    handle.read_at(&mut buf, 0).unwrap();
    handle.close().unwrap();
    buf
}

async fn write_raw(storage: &MemoryStorage, name: &str, bytes: &[u8], append: bool) {
    let file = storage.root().get_file(name, true).await.unwrap();
    let mut handle = file.create_sync_access_handle().await.unwrap();
    let at = if append {
        handle.size().unwrap()
    } else {
        handle.truncate(0).unwrap();
        0
    };
    handle.write_at(bytes, at).unwrap();
    handle.close().unwrap();
}

#[tokio::test]
async fn test_replay_after_crash() {
    let storage = MemoryStorage::new();
    let mut fs = mount(&storage).await;

    fs.mkdir(
        "/base/16384",
        MkdirOptions {
            recursive: true,
            mode: None,
        },
    )
    .unwrap();
    fs.write_file("/base/16384/PG_VERSION", b"16", WriteFileOptions::default())
        .unwrap();
    fs.write_file("/postmaster.pid", b"42", WriteFileOptions::default())
        .unwrap();
    fs.unlink("/postmaster.pid").unwrap();
    let before = fs.snapshot();
    drop(fs);

    let mut fs = mount(&storage).await;
    assert_eq!(fs.snapshot().root, before.root);
    assert_eq!(fs.read_file("/base/16384/PG_VERSION").unwrap(), b"16");
    assert_eq!(fs.lstat("/postmaster.pid").unwrap_err().code(), Errno::ENOENT);
    assert_eq!(fs.pool_len(), 8);
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let storage = MemoryStorage::new();
    let mut fs = mount(&storage).await;
    fs.write_file("/a", b"one", WriteFileOptions::default()).unwrap();
    fs.mkdir("/d", MkdirOptions::default()).unwrap();
    fs.rename("/a", "/d/a").unwrap();
    drop(fs);

    let first = mount(&storage).await.snapshot();
    let second = mount(&storage).await.snapshot();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_rename_over_file_then_crash() {
    let storage = MemoryStorage::new();
    let mut fs = mount(&storage).await;

    fs.write_file("/wal.tmp", b"new contents", WriteFileOptions::default())
        .unwrap();
    fs.write_file("/wal", b"old", WriteFileOptions::default()).unwrap();
    let moved = backing_of(&fs, "/wal.tmp").unwrap();
    let replaced = backing_of(&fs, "/wal").unwrap();

    fs.rename("/wal.tmp", "/wal").unwrap();
    assert!(fs.pool().contains(&replaced));
    drop(fs);

    let mut fs = mount(&storage).await;
    assert_eq!(backing_of(&fs, "/wal"), Some(moved));
    assert!(backing_of(&fs, "/wal.tmp").is_none());
    assert!(fs.pool().contains(&replaced));
    assert_eq!(fs.read_file("/wal").unwrap(), b"new contents");
}

#[tokio::test]
async fn test_torn_tail_is_truncated() {
    let storage = MemoryStorage::new();
    let mut fs = mount(&storage).await;
    fs.write_file("/kept", b"k", WriteFileOptions::default()).unwrap();
    let before = fs.snapshot();
    drop(fs);

    let intact = read_raw(&storage, "state.txt").await;
    write_raw(&storage, "state.txt", b"\n{\"opp\":\"unlink\",\"ar", true).await;

    let fs = mount(&storage).await;
    assert_eq!(fs.snapshot().root, before.root);
    drop(fs);

    let repaired = read_raw(&storage, "state.txt").await;
    assert!(repaired.starts_with(&intact));
    assert!(matches!(
        parse_log(&repaired),
        ParsedLog::Valid { torn: false, .. }
    ));
}

#[tokio::test]
async fn test_interrupted_checkpoint_recovers_new_slot() {
    let storage = MemoryStorage::new();
    let mut fs = mount(&storage).await;
    fs.write_file("/a", b"alpha", WriteFileOptions::default()).unwrap();
    fs.mkdir("/d", MkdirOptions::default()).unwrap();

    // The new snapshot reached the idle slot; the old slot was never cleared
    let mut next = fs.snapshot();
    next.generation += 1;
    drop(fs);
    write_raw(
        &storage,
        "state.next.txt",
        &serde_json::to_vec(&next).unwrap(),
        false,
    )
    .await;

    let mut fs = mount(&storage).await;
    assert_eq!(fs.snapshot().generation, next.generation);
    assert_eq!(fs.snapshot().root, next.root);
    assert_eq!(fs.read_file("/a").unwrap(), b"alpha");
    drop(fs);
    assert!(read_raw(&storage, "state.txt").await.is_empty());
}

#[tokio::test]
async fn test_checkpoint_then_crash() {
    let storage = MemoryStorage::new();
    let mut fs = mount(&storage).await;
    fs.write_file("/a", b"1", WriteFileOptions::default()).unwrap();
    fs.checkpoint().unwrap();
    fs.write_file("/b", b"2", WriteFileOptions::default()).unwrap();
    let before = fs.snapshot();
    drop(fs);

    let mut fs = mount(&storage).await;
    assert_eq!(fs.snapshot().root, before.root);
    assert_eq!(fs.snapshot().generation, 1);
    assert_eq!(fs.read_file("/b").unwrap(), b"2");
    fs.unmount().unwrap();

    // A clean unmount leaves one slot holding only a snapshot line
    let live = read_raw(&storage, "state.txt").await;
    assert!(!live.contains(&b'\n'));
    assert!(read_raw(&storage, "state.next.txt").await.is_empty());
}

#[tokio::test]
async fn test_corrupt_snapshot_policy() {
    let storage = MemoryStorage::new();
    let mut fs = mount(&storage).await;
    fs.write_file("/a", b"1", WriteFileOptions::default()).unwrap();
    drop(fs);
    write_raw(&storage, "state.txt", b"{\"root\": nope", false).await;

    match PooledFs::mount(storage.root(), config()).await {
        Err(FsError::CorruptSnapshot(_)) => {}
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("mounted over a corrupt snapshot"),
    }

    let reset = config().with_corrupt_snapshot(CorruptSnapshotPolicy::Reset);
    let mut fs = PooledFs::mount(storage.root(), reset).await.unwrap();
    assert!(fs.readdir("/").unwrap().is_empty());
    assert_eq!(fs.pool_len(), 8);
    assert_eq!(fs.snapshot().generation, 0);
}

#[tokio::test]
async fn test_failed_operation_leaves_no_log_entry() {
    let storage = MemoryStorage::new();
    let mut fs = mount(&storage).await;
    fs.mkdir("/d", MkdirOptions::default()).unwrap();

    assert_eq!(
        fs.mkdir("/d", MkdirOptions::default()).unwrap_err().code(),
        Errno::EEXIST
    );
    assert_eq!(fs.rmdir("/missing").unwrap_err().code(), Errno::ENOENT);
    drop(fs);

    let ParsedLog::Valid { entries, torn, .. } = parse_log(&read_raw(&storage, "state.txt").await)
    else {
        panic!("log does not parse");
    };
    assert!(!torn);
    let ops: Vec<&str> = entries.iter().map(|e| e.opp()).collect();
    assert_eq!(ops.iter().filter(|op| **op == "mkdir").count(), 1);
    assert!(!ops.contains(&"rmdir"));
}
