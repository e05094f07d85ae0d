//! Logical tree model
//!
//! Nodes live in an arena and refer to each other by [`NodeId`], a slot index
//! paired with the slot's generation. Freeing a node bumps its slot's
//! generation, so ids held elsewhere (open handles) go stale instead of
//! silently aliasing whatever gets allocated into the slot next.

use crate::core::path;
use crate::error::{Errno, FsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default mode for directories (S_IFDIR)
pub const DIR_MODE: u32 = 16384;

/// Default mode for regular files (S_IFREG)
pub const FILE_MODE: u32 = 32768;

/// Milliseconds since the UNIX epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generation-checked arena index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// File or directory payload
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    File { backing_filename: String },
    Directory { children: BTreeMap<String, NodeId> },
}

/// A node of the logical tree
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub mode: u32,
    /// Milliseconds since the UNIX epoch
    pub last_modified: u64,
    pub kind: NodeKind,
}

impl Node {
    /// Create an empty directory node
    pub fn directory(mode: u32, last_modified: u64) -> Self {
        Node {
            mode,
            last_modified,
            kind: NodeKind::Directory {
                children: BTreeMap::new(),
            },
        }
    }

    /// Create a file node backed by `backing_filename`
    pub fn file(mode: u32, last_modified: u64, backing_filename: impl Into<String>) -> Self {
        Node {
            mode,
            last_modified,
            kind: NodeKind::File {
                backing_filename: backing_filename.into(),
            },
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    /// Backing filename for file nodes
    pub fn backing_filename(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { backing_filename } => Some(backing_filename),
            NodeKind::Directory { .. } => None,
        }
    }
}

/// Serialized form of a node, as stored in snapshots and `createFileNode`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SnapshotNode {
    File {
        #[serde(rename = "lastModified")]
        last_modified: u64,
        mode: u32,
        #[serde(rename = "backingFilename")]
        backing_filename: String,
    },
    Directory {
        #[serde(rename = "lastModified")]
        last_modified: u64,
        mode: u32,
        children: BTreeMap<String, SnapshotNode>,
    },
}

impl SnapshotNode {
    /// Fresh empty root directory
    pub fn empty_root() -> Self {
        SnapshotNode::Directory {
            last_modified: now_millis(),
            mode: DIR_MODE,
            children: BTreeMap::new(),
        }
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena holding every node of one tree
pub struct NodeArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
}

impl NodeArena {
    /// Create an arena holding only an empty root directory
    pub fn new() -> Self {
        let mut arena = NodeArena {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
        };
        arena.root = arena.alloc(Node::directory(DIR_MODE, now_millis()));
        arena
    }

    /// Rebuild an arena from a serialized tree
    ///
    /// The root must be a directory.
    pub fn from_snapshot(root: &SnapshotNode) -> Result<Self> {
        let SnapshotNode::Directory {
            last_modified,
            mode,
            children,
        } = root
        else {
            return Err(FsError::CorruptSnapshot(
                "root node is not a directory".to_string(),
            ));
        };

        let mut arena = NodeArena::new();
        let root_id = arena.root;
        if let Some(node) = arena.get_mut(root_id) {
            node.mode = *mode;
            node.last_modified = *last_modified;
        }
        for (name, child) in children {
            let child_id = arena.insert_snapshot(child);
            arena.attach(root_id, name, child_id)?;
        }
        Ok(arena)
    }

    /// Serialize the whole tree
    pub fn to_snapshot(&self) -> SnapshotNode {
        self.snapshot_of(self.root)
    }

    fn snapshot_of(&self, id: NodeId) -> SnapshotNode {
        // Ids reachable from the root are always live
        let Some(node) = self.get(id) else {
            return SnapshotNode::empty_root();
        };
        match &node.kind {
            NodeKind::File { backing_filename } => SnapshotNode::File {
                last_modified: node.last_modified,
                mode: node.mode,
                backing_filename: backing_filename.clone(),
            },
            NodeKind::Directory { children } => SnapshotNode::Directory {
                last_modified: node.last_modified,
                mode: node.mode,
                children: children
                    .iter()
                    .map(|(name, child)| (name.clone(), self.snapshot_of(*child)))
                    .collect(),
            },
        }
    }

    /// Allocate a detached subtree from its serialized form
    pub fn insert_snapshot(&mut self, node: &SnapshotNode) -> NodeId {
        match node {
            SnapshotNode::File {
                last_modified,
                mode,
                backing_filename,
            } => self.alloc(Node::file(*mode, *last_modified, backing_filename.clone())),
            SnapshotNode::Directory {
                last_modified,
                mode,
                children,
            } => {
                let child_ids: BTreeMap<String, NodeId> = children
                    .iter()
                    .map(|(name, child)| (name.clone(), self.insert_snapshot(child)))
                    .collect();
                self.alloc(Node {
                    mode: *mode,
                    last_modified: *last_modified,
                    kind: NodeKind::Directory {
                        children: child_ids,
                    },
                })
            }
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of live nodes, root included
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place a node in a free slot
    pub fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    /// Release a node's slot, returning the node
    ///
    /// Children of a freed directory are not released.
    pub fn free(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(node)
    }

    /// Look up a live node
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.get(id)
            .ok_or_else(|| FsError::with_message(Errno::ENOENT, "Stale node reference"))
    }

    /// Children of a directory node
    pub fn children(&self, id: NodeId) -> Result<&BTreeMap<String, NodeId>> {
        match &self.node(id)?.kind {
            NodeKind::Directory { children } => Ok(children),
            NodeKind::File { .. } => Err(FsError::errno(Errno::ENOTDIR)),
        }
    }

    fn children_mut(&mut self, id: NodeId) -> Result<&mut BTreeMap<String, NodeId>> {
        let node = self
            .get_mut(id)
            .ok_or_else(|| FsError::with_message(Errno::ENOENT, "Stale node reference"))?;
        match &mut node.kind {
            NodeKind::Directory { children } => Ok(children),
            NodeKind::File { .. } => Err(FsError::errno(Errno::ENOTDIR)),
        }
    }

    /// Link `child` into directory `parent` under `name`, returning the
    /// previous occupant
    pub fn attach(&mut self, parent: NodeId, name: &str, child: NodeId) -> Result<Option<NodeId>> {
        Ok(self.children_mut(parent)?.insert(name.to_string(), child))
    }

    /// Unlink `name` from directory `parent` without freeing it
    pub fn detach(&mut self, parent: NodeId, name: &str) -> Result<Option<NodeId>> {
        Ok(self.children_mut(parent)?.remove(name))
    }

    /// Child of directory `parent` named `name`, if any
    pub fn child(&self, parent: NodeId, name: &str) -> Result<Option<NodeId>> {
        Ok(self.children(parent)?.get(name).copied())
    }

    /// Resolve a path from the root
    pub fn resolve(&self, path: &str) -> Result<NodeId> {
        let mut id = self.root;
        for part in path::parts(path) {
            let children = self.children(id).map_err(|_| {
                FsError::with_message(Errno::ENOTDIR, format!("Not a directory: {}", path))
            })?;
            id = *children.get(part).ok_or_else(|| {
                FsError::with_message(
                    Errno::ENOENT,
                    format!("No such file or directory: {}", path),
                )
            })?;
        }
        Ok(id)
    }

    /// Resolve the directory that holds `path`, plus the final name
    pub fn resolve_parent<'p>(&self, path: &'p str) -> Result<(NodeId, &'p str)> {
        let (parents, name) = path::split_parent(path).ok_or_else(|| {
            FsError::with_message(Errno::EINVAL, "Operation not valid on the root")
        })?;
        let parent = self.resolve(&path::join(&parents))?;
        if !self.node(parent)?.is_dir() {
            return Err(FsError::with_message(
                Errno::ENOTDIR,
                format!("Not a directory: {}", path),
            ));
        }
        Ok((parent, name))
    }

    /// Backing filenames of every file reachable from the root
    pub fn backing_filenames(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            match self.get(id).map(|n| &n.kind) {
                Some(NodeKind::File { backing_filename }) => names.push(backing_filename.clone()),
                Some(NodeKind::Directory { children }) => stack.extend(children.values().copied()),
                None => {}
            }
        }
        names
    }

    /// Every reachable path with its node, depth-first in name order
    #[cfg(test)]
    pub fn walk(&self) -> Vec<(String, NodeId)> {
        let mut out = Vec::new();
        self.walk_from(self.root, &mut Vec::new(), &mut out);
        out
    }

    #[cfg(test)]
    fn walk_from<'a>(&'a self, id: NodeId, prefix: &mut Vec<&'a str>, out: &mut Vec<(String, NodeId)>) {
        out.push((path::join(prefix), id));
        if let Ok(children) = self.children(id) {
            for (name, child) in children {
                prefix.push(name);
                self.walk_from(*child, prefix, out);
                prefix.pop();
            }
        }
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> NodeArena {
        let mut arena = NodeArena::new();
        let root = arena.root();
        let dir = arena.alloc(Node::directory(DIR_MODE, 1));
        arena.attach(root, "a", dir).unwrap();
        let file = arena.alloc(Node::file(FILE_MODE, 2, "0000-0001"));
        arena.attach(dir, "f", file).unwrap();
        arena
    }

    #[test]
    fn test_resolve() {
        let arena = sample_tree();
        let f = arena.resolve("/a/f").unwrap();
        assert_eq!(arena.get(f).unwrap().backing_filename(), Some("0000-0001"));
        assert_eq!(arena.resolve("/").unwrap(), arena.root());

        assert_eq!(arena.resolve("/missing").unwrap_err().code(), Errno::ENOENT);
        assert_eq!(arena.resolve("/a/f/x").unwrap_err().code(), Errno::ENOTDIR);
        assert_eq!(arena.resolve_parent("/a/f/x").unwrap_err().code(), Errno::ENOTDIR);
        assert_eq!(arena.resolve_parent("/").unwrap_err().code(), Errno::EINVAL);
    }

    #[test]
    fn test_stale_ids_are_rejected() {
        let mut arena = sample_tree();
        let (parent, name) = arena.resolve_parent("/a/f").unwrap();
        let f = arena.detach(parent, name).unwrap().unwrap();
        assert!(arena.free(f).is_some());
        assert!(arena.get(f).is_none());
        assert!(arena.free(f).is_none());

        // Slot is reused under a new generation
        let g = arena.alloc(Node::file(FILE_MODE, 3, "0000-0002"));
        assert_ne!(f, g);
        assert!(arena.get(f).is_none());
        assert!(arena.get(g).is_some());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let arena = sample_tree();
        let json = serde_json::to_value(arena.to_snapshot()).unwrap();
        assert_eq!(json["type"], "directory");
        assert_eq!(json["children"]["a"]["type"], "directory");
        assert_eq!(json["children"]["a"]["children"]["f"]["backingFilename"], "0000-0001");
        assert_eq!(json["children"]["a"]["children"]["f"]["lastModified"], 2);
        assert_eq!(json["children"]["a"]["children"]["f"]["mode"], FILE_MODE);

        let restored = NodeArena::from_snapshot(&arena.to_snapshot()).unwrap();
        assert_eq!(restored.to_snapshot(), arena.to_snapshot());
        assert_eq!(restored.backing_filenames(), vec!["0000-0001".to_string()]);
    }

    #[test]
    fn test_file_root_is_corrupt() {
        let root = SnapshotNode::File {
            last_modified: 0,
            mode: FILE_MODE,
            backing_filename: "x".into(),
        };
        assert!(matches!(
            NodeArena::from_snapshot(&root),
            Err(FsError::CorruptSnapshot(_))
        ));
    }

    #[test]
    fn test_walk_order() {
        let arena = sample_tree();
        let paths: Vec<_> = arena.walk().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["/", "/a", "/a/f"]);
    }
}
