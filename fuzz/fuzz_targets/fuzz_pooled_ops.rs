#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use poolfs::{FileSystem, MemoryStorage, MkdirOptions, PoolConfig, PooledFs, WriteFileOptions};

const PATHS: [&str; 6] = ["/a", "/b", "/d", "/d/a", "/d/e", "/d/e/a"];

#[derive(Arbitrary, Debug)]
enum Op {
    WriteFile { path: u8, data: Vec<u8> },
    Mkdir { path: u8, recursive: bool },
    Rename { from: u8, to: u8 },
    Unlink { path: u8 },
    Rmdir { path: u8 },
    Truncate { path: u8, len: u16 },
    Checkpoint,
    Crash,
}

fn path(i: u8) -> &'static str {
    PATHS[i as usize % PATHS.len()]
}

// Random operations with random crashes; every remount must succeed
fuzz_target!(|ops: Vec<Op>| {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };
    let storage = MemoryStorage::new();
    let config = PoolConfig::default().with_pool_size(4);
    let mount = || {
        runtime
            .block_on(PooledFs::mount(storage.root(), config.clone()))
            .expect("remount failed")
    };

    let mut fs = mount();
    for op in ops.iter().take(64) {
        let _ = match op {
            Op::WriteFile { path: p, data } => {
                fs.write_file(path(*p), data, WriteFileOptions::default())
            }
            Op::Mkdir { path: p, recursive } => fs.mkdir(
                path(*p),
                MkdirOptions {
                    recursive: *recursive,
                    mode: None,
                },
            ),
            Op::Rename { from, to } => fs.rename(path(*from), path(*to)),
            Op::Unlink { path: p } => fs.unlink(path(*p)),
            Op::Rmdir { path: p } => fs.rmdir(path(*p)),
            Op::Truncate { path: p, len } => fs.truncate(path(*p), *len as u64),
            Op::Checkpoint => fs.checkpoint(),
            Op::Crash => {
                let before = fs.snapshot().root;
                drop(fs);
                fs = mount();
                assert_eq!(fs.snapshot().root, before);
                Ok(())
            }
        };
    }
});
