//! Apply-only mutations
//!
//! Everything here touches the node arena and the pool list and nothing
//! else, so the same code serves live calls and log replay. Backing-file
//! side effects are reported back to the caller instead of performed.

use crate::core::node::{now_millis, Node, NodeArena, NodeKind, SnapshotNode, DIR_MODE};
use crate::core::path;
use crate::core::wal::{MkdirOptions, Snapshot, WalEntry};
use crate::error::{Errno, FsError, Result};

/// Tree plus pool: the whole logged state of a mount
pub(crate) struct Tree {
    pub arena: NodeArena,
    pub pool: Vec<String>,
}

impl Tree {
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self> {
        let arena = NodeArena::from_snapshot(&snapshot.root)?;
        let mut tree = Tree {
            arena,
            pool: Vec::with_capacity(snapshot.pool.len()),
        };
        for name in &snapshot.pool {
            tree.create_pool_file(name);
        }
        Ok(tree)
    }

    pub fn snapshot_root(&self) -> SnapshotNode {
        self.arena.to_snapshot()
    }

    /// Apply one entry, returning a backing filename released to the pool
    pub fn apply(&mut self, entry: &WalEntry) -> Result<Option<String>> {
        match entry {
            WalEntry::Chmod { path, mode } => self.chmod(path, *mode).map(|_| None),
            WalEntry::Mkdir { path, options } => self.mkdir(path, options).map(|_| None),
            WalEntry::Rename { old_path, new_path } => self.rename(old_path, new_path),
            WalEntry::Rmdir { path } => self.rmdir(path).map(|_| None),
            WalEntry::Unlink { path } => self.unlink(path).map(Some),
            WalEntry::Utimes { path, mtime, .. } => self.set_last_modified(path, *mtime).map(|_| None),
            WalEntry::CreateFileNode { path, node } => self.create_file_node(path, node).map(|_| None),
            WalEntry::SetLastModified {
                path,
                last_modified,
            } => self.set_last_modified(path, *last_modified).map(|_| None),
            WalEntry::CreatePoolFile { filename } => {
                self.create_pool_file(filename);
                Ok(None)
            }
            WalEntry::DeletePoolFile { filename } => {
                self.delete_pool_file(filename);
                Ok(None)
            }
        }
    }

    fn node_mut(&mut self, path: &str) -> Result<&mut Node> {
        let id = self.arena.resolve(path)?;
        self.arena
            .get_mut(id)
            .ok_or_else(|| FsError::with_message(Errno::ENOENT, format!("No such file or directory: {}", path)))
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        self.node_mut(path)?.mode = mode;
        Ok(())
    }

    fn set_last_modified(&mut self, path: &str, last_modified: u64) -> Result<()> {
        self.node_mut(path)?.last_modified = last_modified;
        Ok(())
    }

    fn mkdir(&mut self, path: &str, options: &MkdirOptions) -> Result<()> {
        let parts = path::parts(path);
        let Some((name, parents)) = parts.split_last() else {
            if options.recursive {
                return Ok(());
            }
            return Err(FsError::with_message(Errno::EEXIST, "File exists: /"));
        };

        // Validate the whole chain before creating anything
        let mut dir = Some(self.arena.root());
        let mut missing_from = None;
        for (i, part) in parents.iter().enumerate() {
            let Some(current) = dir else { break };
            match self.arena.child(current, part)? {
                Some(child) if self.arena.get(child).is_some_and(Node::is_dir) => dir = Some(child),
                Some(_) => {
                    return Err(FsError::with_message(
                        Errno::ENOTDIR,
                        format!("Not a directory: {}", path),
                    ))
                }
                None if options.recursive => {
                    missing_from = Some(i);
                    dir = None;
                }
                None => {
                    return Err(FsError::with_message(
                        Errno::ENOENT,
                        format!("No such file or directory: {}", path),
                    ))
                }
            }
        }

        if let Some(parent) = dir {
            if let Some(existing) = self.arena.child(parent, name)? {
                let is_dir = self.arena.get(existing).is_some_and(Node::is_dir);
                if options.recursive && is_dir {
                    return Ok(());
                }
                return Err(FsError::with_message(
                    Errno::EEXIST,
                    format!("File exists: {}", path),
                ));
            }
        }

        let now = now_millis();
        let parent = match missing_from {
            None => dir.unwrap_or_else(|| self.arena.root()),
            Some(i) => {
                let mut parent = self.arena.resolve(&path::join(&parents[..i]))?;
                for part in &parents[i..] {
                    let child = self.arena.alloc(Node::directory(DIR_MODE, now));
                    self.arena.attach(parent, part, child)?;
                    parent = child;
                }
                parent
            }
        };
        let mode = options.mode.filter(|m| *m != 0).unwrap_or(DIR_MODE);
        let child = self.arena.alloc(Node::directory(mode, now));
        self.arena.attach(parent, name, child)?;
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.arena.resolve_parent(path)?;
        let id = self.arena.child(parent, name)?.ok_or_else(|| {
            FsError::with_message(Errno::ENOENT, format!("No such file or directory: {}", path))
        })?;
        if !self.arena.children(id).map_err(|_| {
            FsError::with_message(Errno::ENOTDIR, format!("Not a directory: {}", path))
        })?.is_empty()
        {
            return Err(FsError::with_message(
                Errno::ENOTEMPTY,
                format!("Directory not empty: {}", path),
            ));
        }
        self.arena.detach(parent, name)?;
        self.arena.free(id);
        Ok(())
    }

    /// Remove a file node, returning its backing filename to the pool
    fn unlink(&mut self, path: &str) -> Result<String> {
        let (parent, name) = self.arena.resolve_parent(path)?;
        let id = self.arena.child(parent, name)?.ok_or_else(|| {
            FsError::with_message(Errno::ENOENT, format!("No such file or directory: {}", path))
        })?;
        let backing = self
            .arena
            .get(id)
            .and_then(Node::backing_filename)
            .map(str::to_string)
            .ok_or_else(|| FsError::with_message(Errno::EISDIR, format!("Is a directory: {}", path)))?;

        self.arena.detach(parent, name)?;
        self.arena.free(id);
        self.pool.push(backing.clone());
        Ok(backing)
    }

    /// Move a node; an overwritten file's backing name goes back to the pool
    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<Option<String>> {
        let (old_parent, old_name) = self.arena.resolve_parent(old_path)?;
        let id = self.arena.child(old_parent, old_name)?.ok_or_else(|| {
            FsError::with_message(Errno::ENOENT, format!("No such file or directory: {}", old_path))
        })?;
        let (new_parent, new_name) = self.arena.resolve_parent(new_path)?;

        if path::normalize(old_path) == path::normalize(new_path) {
            return Ok(None);
        }
        let source_is_dir = self.arena.get(id).is_some_and(Node::is_dir);
        if source_is_dir && path::starts_with(new_path, old_path) {
            return Err(FsError::with_message(
                Errno::EINVAL,
                format!("Cannot move {} into itself", old_path),
            ));
        }

        let mut released = None;
        if let Some(target) = self.arena.child(new_parent, new_name)? {
            let target_node = self.arena.get(target).ok_or_else(|| {
                FsError::with_message(Errno::ENOENT, format!("No such file or directory: {}", new_path))
            })?;
            match (&target_node.kind, source_is_dir) {
                (NodeKind::Directory { .. }, false) => {
                    return Err(FsError::with_message(
                        Errno::EISDIR,
                        format!("Is a directory: {}", new_path),
                    ))
                }
                (NodeKind::File { .. }, true) => {
                    return Err(FsError::with_message(
                        Errno::ENOTDIR,
                        format!("Not a directory: {}", new_path),
                    ))
                }
                (NodeKind::Directory { children }, true) if !children.is_empty() => {
                    return Err(FsError::with_message(
                        Errno::ENOTEMPTY,
                        format!("Directory not empty: {}", new_path),
                    ))
                }
                (NodeKind::Directory { .. }, true) => {}
                (NodeKind::File { backing_filename }, false) => {
                    released = Some(backing_filename.clone());
                }
            }
            self.arena.detach(new_parent, new_name)?;
            self.arena.free(target);
        }

        self.arena.detach(old_parent, old_name)?;
        self.arena.attach(new_parent, new_name, id)?;
        if let Some(backing) = &released {
            self.pool.push(backing.clone());
        }
        Ok(released)
    }

    fn create_file_node(&mut self, path: &str, node: &SnapshotNode) -> Result<()> {
        let SnapshotNode::File {
            last_modified,
            mode,
            backing_filename,
        } = node
        else {
            return Err(FsError::with_message(
                Errno::EINVAL,
                format!("createFileNode for {} carries a directory", path),
            ));
        };
        let (parent, name) = self.arena.resolve_parent(path)?;
        if self.arena.child(parent, name)?.is_some() {
            return Err(FsError::with_message(
                Errno::EEXIST,
                format!("File exists: {}", path),
            ));
        }

        let id = self
            .arena
            .alloc(Node::file(*mode, *last_modified, backing_filename.clone()));
        self.arena.attach(parent, name, id)?;
        self.delete_pool_file(backing_filename);
        Ok(())
    }

    fn create_pool_file(&mut self, filename: &str) {
        if !self.pool.iter().any(|f| f == filename) {
            self.pool.push(filename.to_string());
        }
    }

    fn delete_pool_file(&mut self, filename: &str) {
        if let Some(index) = self.pool.iter().position(|f| f == filename) {
            self.pool.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::FILE_MODE;

    fn tree_with_pool(names: &[&str]) -> Tree {
        let mut snapshot = Snapshot::empty();
        snapshot.pool = names.iter().map(|s| s.to_string()).collect();
        Tree::from_snapshot(&snapshot).unwrap()
    }

    fn file_node(backing: &str) -> SnapshotNode {
        SnapshotNode::File {
            last_modified: 1,
            mode: FILE_MODE,
            backing_filename: backing.into(),
        }
    }

    fn apply(tree: &mut Tree, json: &str) -> Result<Option<String>> {
        let entry: WalEntry = serde_json::from_str(json).unwrap();
        tree.apply(&entry)
    }

    #[test]
    fn test_create_and_unlink_moves_backing_names() {
        let mut tree = tree_with_pool(&["p1", "p2"]);
        tree.apply(&WalEntry::CreateFileNode {
            path: "/f".into(),
            node: file_node("p2"),
        })
        .unwrap();
        assert_eq!(tree.pool, vec!["p1".to_string()]);

        let released = apply(&mut tree, r#"{"opp":"unlink","args":["/f"]}"#).unwrap();
        assert_eq!(released.as_deref(), Some("p2"));
        assert_eq!(tree.pool.len(), 2);
        assert_eq!(tree.arena.resolve("/f").unwrap_err().code(), Errno::ENOENT);
    }

    #[test]
    fn test_mkdir_rules() {
        let mut tree = tree_with_pool(&[]);
        let missing = apply(&mut tree, r#"{"opp":"mkdir","args":["/a/b",null]}"#);
        assert_eq!(missing.unwrap_err().code(), Errno::ENOENT);

        apply(&mut tree, r#"{"opp":"mkdir","args":["/a/b/c",{"recursive":true}]}"#).unwrap();
        assert!(tree.arena.resolve("/a/b/c").is_ok());

        let exists = apply(&mut tree, r#"{"opp":"mkdir","args":["/a",null]}"#);
        assert_eq!(exists.unwrap_err().code(), Errno::EEXIST);
        apply(&mut tree, r#"{"opp":"mkdir","args":["/a",{"recursive":true}]}"#).unwrap();

        let id = tree.arena.resolve("/a/b/c").unwrap();
        assert_eq!(tree.arena.get(id).unwrap().mode, DIR_MODE);
    }

    #[test]
    fn test_rename_overwrite_returns_backing() {
        let mut tree = tree_with_pool(&["p1", "p2"]);
        for (path, backing) in [("/a", "p1"), ("/b", "p2")] {
            tree.apply(&WalEntry::CreateFileNode {
                path: path.into(),
                node: file_node(backing),
            })
            .unwrap();
        }
        assert!(tree.pool.is_empty());

        let released = apply(&mut tree, r#"{"opp":"rename","args":["/a","/b"]}"#).unwrap();
        assert_eq!(released.as_deref(), Some("p2"));
        assert_eq!(tree.pool, vec!["p2".to_string()]);
        let b = tree.arena.resolve("/b").unwrap();
        assert_eq!(tree.arena.get(b).unwrap().backing_filename(), Some("p1"));
    }

    #[test]
    fn test_rename_kind_conflicts() {
        let mut tree = tree_with_pool(&["p1"]);
        tree.apply(&WalEntry::CreateFileNode {
            path: "/f".into(),
            node: file_node("p1"),
        })
        .unwrap();
        apply(&mut tree, r#"{"opp":"mkdir","args":["/d/e",{"recursive":true}]}"#).unwrap();
        apply(&mut tree, r#"{"opp":"mkdir","args":["/empty",null]}"#).unwrap();

        let cases = [
            (r#"{"opp":"rename","args":["/f","/d"]}"#, Errno::EISDIR),
            (r#"{"opp":"rename","args":["/d","/f"]}"#, Errno::ENOTDIR),
            (r#"{"opp":"rename","args":["/empty","/d"]}"#, Errno::ENOTEMPTY),
            (r#"{"opp":"rename","args":["/d","/d/e/x"]}"#, Errno::EINVAL),
            (r#"{"opp":"rename","args":["/nope","/x"]}"#, Errno::ENOENT),
        ];
        for (json, code) in cases {
            assert_eq!(apply(&mut tree, json).unwrap_err().code(), code, "{}", json);
        }

        // Same path is a no-op, a directory may replace an empty one
        assert_eq!(apply(&mut tree, r#"{"opp":"rename","args":["/f","//f"]}"#).unwrap(), None);
        apply(&mut tree, r#"{"opp":"rename","args":["/d","/empty"]}"#).unwrap();
        assert!(tree.arena.resolve("/empty/e").is_ok());
        assert!(tree.arena.resolve("/d").is_err());
    }

    #[test]
    fn test_rmdir_and_unlink_kinds() {
        let mut tree = tree_with_pool(&["p1"]);
        apply(&mut tree, r#"{"opp":"mkdir","args":["/d/e",{"recursive":true}]}"#).unwrap();
        tree.apply(&WalEntry::CreateFileNode {
            path: "/f".into(),
            node: file_node("p1"),
        })
        .unwrap();

        let cases = [
            (r#"{"opp":"rmdir","args":["/d"]}"#, Errno::ENOTEMPTY),
            (r#"{"opp":"rmdir","args":["/f"]}"#, Errno::ENOTDIR),
            (r#"{"opp":"unlink","args":["/d"]}"#, Errno::EISDIR),
            (r#"{"opp":"unlink","args":["/missing"]}"#, Errno::ENOENT),
        ];
        for (json, code) in cases {
            assert_eq!(apply(&mut tree, json).unwrap_err().code(), code, "{}", json);
        }
        apply(&mut tree, r#"{"opp":"rmdir","args":["/d/e"]}"#).unwrap();
        apply(&mut tree, r#"{"opp":"rmdir","args":["/d"]}"#).unwrap();
        assert!(tree.arena.children(tree.arena.root()).unwrap().contains_key("f"));
    }

    #[test]
    fn test_pool_entries_are_idempotent() {
        let mut tree = tree_with_pool(&[]);
        for _ in 0..2 {
            apply(&mut tree, r#"{"opp":"createPoolFile","args":["p9"]}"#).unwrap();
        }
        assert_eq!(tree.pool, vec!["p9".to_string()]);
        for _ in 0..2 {
            apply(&mut tree, r#"{"opp":"deletePoolFile","args":["p9"]}"#).unwrap();
        }
        assert!(tree.pool.is_empty());
    }
}
