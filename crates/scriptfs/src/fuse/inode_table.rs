//! Bidirectional inode ↔ mounted path mapping
//!
//! The kernel addresses everything by 64-bit inode numbers while the
//! dispatcher works on paths. Inodes are handed out on first sight of a path,
//! counted per kernel lookup, and dropped again on `forget`. Paths are kept
//! as raw OS strings, so names that are not UTF-8 map like any other.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

#[derive(Debug)]
struct Node {
    path: PathBuf,
    lookups: u64,
}

/// Mapping between kernel inode numbers and mounted paths
#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<PathBuf, u64>,
    nodes: HashMap<u64, Node>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            nodes: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        table
            .path_to_inode
            .insert(PathBuf::from("/"), Self::ROOT_INODE);
        table.nodes.insert(
            Self::ROOT_INODE,
            Node {
                path: PathBuf::from("/"),
                lookups: 1,
            },
        );
        table
    }

    /// Inode for `path`, allocating one if the path is new
    pub fn get_or_create(&mut self, path: impl AsRef<Path>) -> u64 {
        let normalized = Self::normalize_path(path.as_ref());
        if let Some(&inode) = self.path_to_inode.get(&normalized) {
            return inode;
        }

        let inode = self.allocate();
        self.path_to_inode.insert(normalized.clone(), inode);
        self.nodes.insert(
            inode,
            Node {
                path: normalized,
                lookups: 0,
            },
        );
        inode
    }

    /// Inode number to report in a directory listing. Known paths keep
    /// theirs; others get a fresh number that is not remembered, so a
    /// listing never grows the table.
    pub fn inode_for_listing(&mut self, path: impl AsRef<Path>) -> u64 {
        match self.get_inode(path) {
            Some(inode) => inode,
            None => self.allocate(),
        }
    }

    /// Inode for `path`, counting one kernel lookup reference
    pub fn lookup(&mut self, path: impl AsRef<Path>) -> u64 {
        let inode = self.get_or_create(path);
        if let Some(node) = self.nodes.get_mut(&inode) {
            node.lookups += 1;
        }
        inode
    }

    /// Drop `count` lookup references; the inode is released at zero
    pub fn forget(&mut self, inode: u64, count: u64) {
        if inode == Self::ROOT_INODE {
            return;
        }
        let released = match self.nodes.get_mut(&inode) {
            Some(node) => {
                node.lookups = node.lookups.saturating_sub(count);
                node.lookups == 0
            }
            None => false,
        };
        if released {
            self.remove(inode);
        }
    }

    pub fn get_inode(&self, path: impl AsRef<Path>) -> Option<u64> {
        self.path_to_inode
            .get(&Self::normalize_path(path.as_ref()))
            .copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&Path> {
        self.nodes.get(&inode).map(|node| node.path.as_path())
    }

    pub fn remove(&mut self, inode: u64) -> Option<PathBuf> {
        let node = self.nodes.remove(&inode)?;
        self.path_to_inode.remove(&node.path);
        Some(node.path)
    }

    /// Forget the path mapping of an unlinked entry
    pub fn remove_by_path(&mut self, path: impl AsRef<Path>) -> Option<u64> {
        let inode = self
            .path_to_inode
            .remove(&Self::normalize_path(path.as_ref()))?;
        self.nodes.remove(&inode);
        Some(inode)
    }

    /// Move `old_path` and everything below it to `new_path`
    pub fn rename(&mut self, old_path: impl AsRef<Path>, new_path: impl AsRef<Path>) {
        let old = Self::normalize_path(old_path.as_ref());
        let new = Self::normalize_path(new_path.as_ref());

        // Whatever was at the destination is replaced
        self.remove_by_path(&new);

        let moved = self.take_subtree(&old);
        self.insert_subtree(moved, &new);
    }

    /// Swap the subtrees at `a` and `b`, as `RENAME_EXCHANGE` does on disk
    pub fn exchange(&mut self, a: impl AsRef<Path>, b: impl AsRef<Path>) {
        let a = Self::normalize_path(a.as_ref());
        let b = Self::normalize_path(b.as_ref());

        let from_a = self.take_subtree(&a);
        let from_b = self.take_subtree(&b);
        self.insert_subtree(from_a, &b);
        self.insert_subtree(from_b, &a);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn allocate(&mut self) -> u64 {
        let inode = self.next_inode;
        self.next_inode += 1;
        inode
    }

    /// Unmap `root` and its descendants, keeping their paths relative to it
    fn take_subtree(&mut self, root: &Path) -> Vec<(PathBuf, u64)> {
        let moved: Vec<(PathBuf, u64)> = self
            .path_to_inode
            .iter()
            .filter_map(|(path, inode)| {
                let rest = path.strip_prefix(root).ok()?;
                Some((rest.to_path_buf(), *inode))
            })
            .collect();
        for (rest, _) in &moved {
            self.path_to_inode.remove(&root.join(rest));
        }
        moved
    }

    fn insert_subtree(&mut self, moved: Vec<(PathBuf, u64)>, root: &Path) {
        for (rest, inode) in moved {
            let renamed = if rest.as_os_str().is_empty() {
                root.to_path_buf()
            } else {
                root.join(rest)
            };
            self.path_to_inode.insert(renamed.clone(), inode);
            if let Some(node) = self.nodes.get_mut(&inode) {
                node.path = renamed;
            }
        }
    }

    /// Leading slash, no trailing slash, no `.` components
    fn normalize_path(path: &Path) -> PathBuf {
        let mut normalized = PathBuf::from("/");
        for component in path.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::ParentDir => normalized.push(".."),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        normalized
    }

    /// Path of `name` inside the directory at `parent`
    pub fn child_path(parent: &Path, name: impl AsRef<Path>) -> PathBuf {
        Self::normalize_path(parent).join(name)
    }

    pub fn parent_path(path: &Path) -> PathBuf {
        let normalized = Self::normalize_path(path);
        match normalized.parent() {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("/"),
        }
    }
}
