//! Both filesystems run the same workload through the shared surface
//!
//! The bridge talks to its worker through 256-byte buffers here, so every
//! bulk transfer goes through the chunked sub-protocol.

use poolfs::{
    BridgeConfig, DiskStorage, Errno, FileSystem, MemoryStorage, MkdirOptions, MountAdapter,
    PoolConfig, PooledFs, SyncBridge, Whence, WriteFileOptions,
};
use tempfile::TempDir;

fn small_buffers() -> BridgeConfig {
    BridgeConfig::default()
        .with_call_buffer_size(256)
        .with_response_buffer_size(256)
}

fn workload<F: FileSystem>(fs: &mut F) {
    fs.mkdir(
        "/db/base",
        MkdirOptions {
            recursive: true,
            mode: None,
        },
    )
    .unwrap();

    let relation: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
    fs.write_file("/db/base/1", &relation, WriteFileOptions::default())
        .unwrap();
    assert_eq!(fs.read_file("/db/base/1").unwrap(), relation);

    let fd = fs.open("/db/base/1", None, None).unwrap();
    assert_eq!(fs.write(fd, b"tail", 0, 4, 10_000).unwrap(), 4);
    assert_eq!(fs.fstat(fd).unwrap().size, 10_004);
    fs.close(fd).unwrap();

    fs.rename("/db/base/1", "/db/base/2").unwrap();
    assert_eq!(fs.readdir("/db/base").unwrap(), vec!["2".to_string()]);
    fs.truncate("/db/base/2", 5).unwrap();
    assert_eq!(fs.lstat("/db/base/2").unwrap().size, 5);

    assert_eq!(fs.rmdir("/db/base").unwrap_err().code(), Errno::ENOTEMPTY);
    assert_eq!(
        fs.mkdir("/db", MkdirOptions::default()).unwrap_err().code(),
        Errno::EEXIST
    );
    assert_eq!(fs.lstat("/db/base/1").unwrap_err().code(), Errno::ENOENT);
    assert_eq!(
        fs.open("/db/base/1", None, None).unwrap_err().code(),
        Errno::ENOENT
    );

    fs.unlink("/db/base/2").unwrap();
    fs.rmdir("/db/base").unwrap();
    fs.rmdir("/db").unwrap();
    assert!(fs.readdir("/").unwrap().is_empty());
}

#[tokio::test]
async fn test_workload_on_pooled_fs() {
    let storage = MemoryStorage::new();
    let mut fs = PooledFs::mount(storage.root(), PoolConfig::default().with_pool_size(4))
        .await
        .unwrap();
    workload(&mut fs);
}

#[test]
fn test_workload_on_bridge_over_memory() {
    let storage = MemoryStorage::new();
    let mut fs = SyncBridge::spawn(storage.root(), small_buffers()).unwrap();
    workload(&mut fs);
    fs.shutdown().unwrap();
}

#[test]
fn test_workload_on_bridge_over_disk() {
    let dir = TempDir::new().unwrap();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let storage = runtime.block_on(DiskStorage::open(dir.path())).unwrap();

    let mut fs = SyncBridge::spawn(storage.root(), small_buffers()).unwrap();
    workload(&mut fs);
    fs.write_file("/kept", b"on disk", WriteFileOptions::default())
        .unwrap();
    drop(fs);

    assert_eq!(std::fs::read(dir.path().join("kept")).unwrap(), b"on disk");
}

#[test]
fn test_adapter_over_bridge() {
    let storage = MemoryStorage::new();
    let bridge = SyncBridge::spawn(storage.root(), small_buffers()).unwrap();
    let mut vfs = MountAdapter::new(bridge, "");
    let root = vfs.mount();

    let dir = vfs.mknod(root, "pg_wal", 0o040755).unwrap();
    let file = vfs.mknod(dir, "000000010000000000000001", 0o100600).unwrap();
    let stream = vfs.open(file).unwrap();

    let segment = vec![0x5au8; 1000];
    assert_eq!(vfs.write(&stream, &segment, 0, 1000, 0).unwrap(), 1000);
    assert_eq!(vfs.llseek(&stream, 0, Whence::End).unwrap(), 1000);

    let mut back = vec![0u8; 1000];
    assert_eq!(vfs.read(&stream, &mut back, 0, 1000, 0).unwrap(), 1000);
    assert_eq!(back, segment);
    vfs.close(stream).unwrap();

    // The bridge keeps the engine's error codes
    assert_eq!(vfs.lookup(dir, "missing").unwrap_err().errno(), 44);
    assert_eq!(vfs.rmdir(root, "pg_wal").unwrap_err().errno(), 55);
    vfs.unlink(dir, "missing");

    vfs.into_inner().shutdown().unwrap();
}
