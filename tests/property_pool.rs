//! Property-based tests for backing-file ownership
//!
//! Whatever sequence of operations runs, every backing file belongs to
//! exactly one owner (a file node or the pool), none is lost, and a crash
//! followed by replay rebuilds the same tree.

use poolfs::{
    FileSystem, MemoryStorage, MkdirOptions, PoolConfig, PooledFs, SnapshotNode, WriteFileOptions,
};
use proptest::prelude::*;
use std::collections::HashSet;

const POOL: usize = 6;
const NAMES: [&str; 5] = ["/a", "/b", "/d/a", "/d/b", "/d/e/a"];

#[derive(Debug, Clone)]
enum Op {
    Write(usize, usize),
    Unlink(usize),
    Rename(usize, usize),
    Mkdir,
    Truncate(usize, u64),
}

fn op() -> impl Strategy<Value = Op> {
    let name = 0..NAMES.len();
    prop_oneof![
        (name.clone(), 0usize..64).prop_map(|(n, len)| Op::Write(n, len)),
        name.clone().prop_map(Op::Unlink),
        (name.clone(), name.clone()).prop_map(|(a, b)| Op::Rename(a, b)),
        Just(Op::Mkdir),
        (name, 0u64..32).prop_map(|(n, len)| Op::Truncate(n, len)),
    ]
}

fn run(fs: &mut PooledFs, op: &Op) {
    // Failures are part of the property: they must leave ownership intact
    let _ = match op {
        Op::Write(n, len) => fs.write_file(NAMES[*n], &vec![*n as u8; *len], WriteFileOptions::default()),
        Op::Unlink(n) => fs.unlink(NAMES[*n]),
        Op::Rename(a, b) => fs.rename(NAMES[*a], NAMES[*b]),
        Op::Mkdir => fs.mkdir(
            "/d/e",
            MkdirOptions {
                recursive: true,
                mode: None,
            },
        ),
        Op::Truncate(n, len) => fs.truncate(NAMES[*n], *len),
    };
}

fn file_backings(node: &SnapshotNode, out: &mut Vec<String>) {
    match node {
        SnapshotNode::File {
            backing_filename, ..
        } => out.push(backing_filename.clone()),
        SnapshotNode::Directory { children, .. } => {
            for child in children.values() {
                file_backings(child, out);
            }
        }
    }
}

fn check_ownership(fs: &PooledFs) -> Result<(), TestCaseError> {
    let snapshot = fs.snapshot();
    let mut owned = Vec::new();
    file_backings(&snapshot.root, &mut owned);
    owned.extend(snapshot.pool.iter().cloned());

    let distinct: HashSet<&String> = owned.iter().collect();
    prop_assert_eq!(distinct.len(), owned.len(), "a backing file has two owners");
    prop_assert_eq!(owned.len(), POOL, "a backing file was lost or invented");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_backing_files_have_one_owner(ops in prop::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let storage = MemoryStorage::new();
        let config = PoolConfig::default().with_pool_size(POOL);

        let mut fs = runtime
            .block_on(PooledFs::mount(storage.root(), config.clone()))
            .unwrap();
        for op in &ops {
            run(&mut fs, op);
            check_ownership(&fs)?;
        }
        let before = fs.snapshot();
        drop(fs);

        // Replay rebuilds the same tree; the pool may only grow back
        let fs = runtime
            .block_on(PooledFs::mount(storage.root(), config))
            .unwrap();
        let after = fs.snapshot();
        prop_assert_eq!(&after.root, &before.root);
        for name in &before.pool {
            prop_assert!(after.pool.contains(name));
        }
    }
}
