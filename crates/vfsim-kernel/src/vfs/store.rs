//! The node tree.
//!
//! A flat arena of [`Node`]s keyed by [`NodeId`]. Lookups here are exact:
//! they never follow symlinks (see [`super::symlink`] for that). Every
//! mutating method validates fully before touching the arena, so a failed
//! call leaves the tree unchanged.

use chrono::Utc;
use std::collections::{HashMap, HashSet};

use super::error::{VfsError, VfsResult};
use super::mount::MountTable;
use super::path;
use super::types::{MAX_FILE_SIZE, Node, NodeId, NodeKind, Permissions};

/// Owns every node of the live tree.
#[derive(Debug, Clone)]
pub struct NodeStore {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
    /// Files whose persisted content failed verification at load.
    corrupted: HashSet<NodeId>,
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore {
    /// Create a tree holding only the root directory (root-owned, 755).
    pub fn new() -> Self {
        let mut root = Node::directory("", 0, 0);
        root.id = NodeId::ROOT;
        root.full_path = path::ROOT.to_string();
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::ROOT, root);
        Self {
            nodes,
            next_id: 1,
            corrupted: HashSet::new(),
        }
    }

    /// Rebuild a tree from rehydrated nodes.
    ///
    /// Child maps are rebuilt from each node's parent id and full paths are
    /// recomputed, so only ids, names and parents need to be trusted.
    pub fn from_nodes(nodes: Vec<Node>, next_id: u64) -> VfsResult<Self> {
        let mut map: HashMap<NodeId, Node> = HashMap::with_capacity(nodes.len());
        for mut node in nodes {
            if let NodeKind::Directory { children } = &mut node.kind {
                children.clear();
            }
            map.insert(node.id, node);
        }
        if !map.get(&NodeId::ROOT).is_some_and(Node::is_dir) {
            return Err(VfsError::codec("snapshot has no root directory"));
        }

        let links: Vec<(NodeId, NodeId, String)> = map
            .values()
            .filter_map(|n| n.parent.map(|p| (p, n.id, n.name.clone())))
            .collect();
        for (parent, child, name) in links {
            match map.get_mut(&parent).map(|p| &mut p.kind) {
                Some(NodeKind::Directory { children }) => {
                    if children.insert(name.clone(), child).is_some() {
                        return Err(VfsError::codec(format!(
                            "duplicate entry {name} under {parent}"
                        )));
                    }
                }
                _ => return Err(VfsError::codec(format!("{child} has invalid parent {parent}"))),
            }
        }

        let max_id = map.keys().map(|id| id.0).max().unwrap_or(0);
        let mut store = Self {
            nodes: map,
            next_id: next_id.max(max_id + 1),
            corrupted: HashSet::new(),
        };
        store.recompute_paths(NodeId::ROOT);

        // anything unreachable from the root is an orphan
        let reachable: HashSet<NodeId> = store.subtree_ids(NodeId::ROOT).into_iter().collect();
        if reachable.len() != store.nodes.len() {
            return Err(VfsError::codec(format!(
                "{} orphaned nodes in snapshot",
                store.nodes.len() - reachable.len()
            )));
        }
        Ok(store)
    }

    /// The root directory.
    pub fn root(&self) -> &Node {
        &self.nodes[&NodeId::ROOT]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    fn node(&self, id: NodeId) -> VfsResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| VfsError::other(format!("dangling node id {id}")))
    }

    fn node_mut(&mut self, id: NodeId) -> VfsResult<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| VfsError::other(format!("dangling node id {id}")))
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Next id that will be handed out.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// All nodes, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Resolve a canonical path to a node id without following symlinks.
    pub fn lookup_id(&self, canonical: &str) -> VfsResult<NodeId> {
        let mut current = NodeId::ROOT;
        for segment in path::segments(canonical) {
            let node = self.node(current)?;
            match &node.kind {
                NodeKind::Directory { children } => {
                    current = *children
                        .get(segment)
                        .ok_or_else(|| VfsError::not_found(canonical))?;
                }
                NodeKind::File { .. } => {
                    return Err(VfsError::not_a_directory(node.full_path.clone()));
                }
            }
        }
        Ok(current)
    }

    /// Resolve a canonical path to a node without following symlinks.
    pub fn lookup(&self, canonical: &str) -> VfsResult<&Node> {
        let id = self.lookup_id(canonical)?;
        self.node(id)
    }

    /// Child of `dir` named `name`, if `dir` is a directory holding one.
    pub fn child_id(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.nodes.get(&dir)?.children()?.get(name).copied()
    }

    /// Children of a directory, sorted by name.
    pub fn list(&self, canonical: &str) -> VfsResult<Vec<&Node>> {
        let dir = self.lookup(canonical)?;
        let children = dir
            .children()
            .ok_or_else(|| VfsError::not_a_directory(canonical))?;
        let mut out = children
            .values()
            .map(|id| self.node(*id))
            .collect::<VfsResult<Vec<_>>>()?;
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Insert a detached node under the directory at `parent_path`.
    ///
    /// The node's `id`, `parent` and `full_path` are assigned here.
    pub fn insert(&mut self, parent_path: &str, mut node: Node) -> VfsResult<NodeId> {
        path::validate_name(&node.name)?;
        let parent_id = self.lookup_id(parent_path)?;
        let parent = self.node(parent_id)?;
        let children = parent
            .children()
            .ok_or_else(|| VfsError::not_a_directory(parent_path))?;
        let full_path = path::join(&parent.full_path, &node.name);
        if children.contains_key(&node.name) {
            return Err(VfsError::already_exists(full_path));
        }

        let id = NodeId(self.next_id);
        self.next_id += 1;
        node.id = id;
        node.parent = Some(parent_id);
        node.full_path = full_path;
        if let NodeKind::Directory { children } = &mut node.kind {
            children.clear();
        }

        let name = node.name.clone();
        self.nodes.insert(id, node);
        let parent = self.node_mut(parent_id)?;
        if let NodeKind::Directory { children } = &mut parent.kind {
            children.insert(name, id);
        }
        parent.modified_at = Utc::now();
        Ok(id)
    }

    /// Remove the node at `canonical`.
    ///
    /// A non-empty directory is only removed when `recursive` is set.
    /// Returns the removed nodes, the target first.
    pub fn remove(&mut self, canonical: &str, recursive: bool) -> VfsResult<Vec<Node>> {
        let id = self.lookup_id(canonical)?;
        if id == NodeId::ROOT {
            return Err(VfsError::invalid_path("cannot remove /"));
        }
        let node = self.node(id)?;
        if let Some(children) = node.children() {
            if !children.is_empty() && !recursive {
                return Err(VfsError::directory_not_empty(canonical));
            }
        }
        let parent_id = node.parent;
        let name = node.name.clone();

        let ids = self.subtree_ids(id);
        let mut removed = Vec::with_capacity(ids.len());
        for victim in ids {
            self.corrupted.remove(&victim);
            if let Some(n) = self.nodes.remove(&victim) {
                removed.push(n);
            }
        }
        if let Some(parent) = parent_id.and_then(|p| self.nodes.get_mut(&p)) {
            if let NodeKind::Directory { children } = &mut parent.kind {
                children.remove(&name);
            }
            parent.modified_at = Utc::now();
        }
        Ok(removed)
    }

    /// Re-parent the node at `src` so that it lives at `dst`.
    ///
    /// `dst` is the full new path; its parent must be an existing directory
    /// and its name must be free. Fails with `CrossMount` when the two paths
    /// sit on different filesystem types. Full paths of the whole moved
    /// subtree are recomputed.
    pub fn move_node(&mut self, src: &str, dst: &str, mounts: &MountTable) -> VfsResult<()> {
        let id = self.lookup_id(src)?;
        if id == NodeId::ROOT {
            return Err(VfsError::invalid_path("cannot move /"));
        }
        if src == dst {
            return Ok(());
        }
        if path::is_within(dst, src) {
            return Err(VfsError::invalid_path(format!(
                "cannot move {src} into itself ({dst})"
            )));
        }
        if mounts.is_mount_point(src) || mounts.has_mounts_below(src) {
            return Err(VfsError::other(format!("mount point busy: {src}")));
        }
        mounts.check_same_type(src, dst)?;

        let (dst_parent_path, dst_name) =
            path::split_parent(dst).ok_or_else(|| VfsError::invalid_path(dst))?;
        path::validate_name(dst_name)?;
        let dst_parent = self.lookup_id(dst_parent_path)?;
        let dst_children = self
            .node(dst_parent)?
            .children()
            .ok_or_else(|| VfsError::not_a_directory(dst_parent_path))?;
        if dst_children.contains_key(dst_name) {
            return Err(VfsError::already_exists(dst));
        }

        // validated; from here on nothing can fail
        let now = Utc::now();
        let node = self.node(id)?;
        let old_parent = node.parent;
        let old_name = node.name.clone();
        if let Some(parent) = old_parent.and_then(|p| self.nodes.get_mut(&p)) {
            if let NodeKind::Directory { children } = &mut parent.kind {
                children.remove(&old_name);
            }
            parent.modified_at = now;
        }
        let parent = self.node_mut(dst_parent)?;
        if let NodeKind::Directory { children } = &mut parent.kind {
            children.insert(dst_name.to_string(), id);
        }
        parent.modified_at = now;

        let node = self.node_mut(id)?;
        node.name = dst_name.to_string();
        node.parent = Some(dst_parent);
        self.recompute_paths(id);
        Ok(())
    }

    /// Replace a file's content.
    pub fn write_content(&mut self, id: NodeId, data: Vec<u8>) -> VfsResult<()> {
        let node = self.node_mut(id)?;
        let size = data.len() as u64;
        if size > MAX_FILE_SIZE {
            return Err(VfsError::file_too_large(node.full_path.clone()));
        }
        match &mut node.kind {
            NodeKind::File {
                content,
                symlink_target: None,
                ..
            } => *content = data,
            NodeKind::File { .. } => return Err(VfsError::other("cannot write to symlink")),
            NodeKind::Directory { .. } => {
                return Err(VfsError::is_a_directory(node.full_path.clone()));
            }
        }
        node.size = size;
        node.modified_at = Utc::now();
        self.corrupted.remove(&id);
        Ok(())
    }

    /// Write `data` at `offset`, growing the file (zero-filled) as needed.
    pub fn write_at(&mut self, id: NodeId, offset: u64, data: &[u8]) -> VfsResult<usize> {
        let node = self.node_mut(id)?;
        match &mut node.kind {
            NodeKind::File {
                content,
                symlink_target: None,
                ..
            } => {
                let end = offset
                    .checked_add(data.len() as u64)
                    .filter(|end| *end <= MAX_FILE_SIZE)
                    .and_then(|end| usize::try_from(end).ok())
                    .ok_or_else(|| VfsError::file_too_large(node.full_path.clone()))?;
                let start = end - data.len();
                if end > content.len() {
                    content.resize(end, 0);
                }
                content[start..end].copy_from_slice(data);
                node.size = content.len() as u64;
                node.modified_at = Utc::now();
            }
            NodeKind::File { .. } => return Err(VfsError::other("cannot write to symlink")),
            NodeKind::Directory { .. } => {
                return Err(VfsError::is_a_directory(node.full_path.clone()));
            }
        }
        self.corrupted.remove(&id);
        Ok(data.len())
    }

    /// Read up to `len` bytes at `offset`. Fails for corrupted content.
    pub fn read_at(&self, id: NodeId, offset: u64, len: usize) -> VfsResult<&[u8]> {
        let node = self.node(id)?;
        if self.corrupted.contains(&id) {
            return Err(VfsError::Corruption(node.full_path.clone()));
        }
        match &node.kind {
            NodeKind::File { content, .. } => {
                let start = (offset as usize).min(content.len());
                let end = start.saturating_add(len).min(content.len());
                Ok(&content[start..end])
            }
            NodeKind::Directory { .. } => Err(VfsError::is_a_directory(node.full_path.clone())),
        }
    }

    /// Whole content of a file. Fails for corrupted content.
    pub fn read_all(&self, id: NodeId) -> VfsResult<&[u8]> {
        self.read_at(id, 0, usize::MAX)
    }

    /// Stamp the access time.
    pub fn touch_accessed(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.accessed_at = Utc::now();
        }
    }

    /// Change permission bits.
    pub fn set_permissions(&mut self, id: NodeId, perm: Permissions) -> VfsResult<()> {
        let node = self.node_mut(id)?;
        node.permissions = perm;
        node.modified_at = Utc::now();
        Ok(())
    }

    /// Change ownership.
    pub fn set_owner(&mut self, id: NodeId, owner_id: u32, group_id: u32) -> VfsResult<()> {
        let node = self.node_mut(id)?;
        node.owner_id = owner_id;
        node.group_id = group_id;
        node.modified_at = Utc::now();
        Ok(())
    }

    /// Flag a file whose persisted content failed verification.
    pub fn mark_corrupted(&mut self, id: NodeId) {
        if self.nodes.contains_key(&id) {
            self.corrupted.insert(id);
        }
    }

    pub fn is_corrupted(&self, id: NodeId) -> bool {
        self.corrupted.contains(&id)
    }

    /// Paths of all files currently flagged corrupt, sorted.
    pub fn corrupted_paths(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .corrupted
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|n| n.full_path.clone()))
            .collect();
        out.sort();
        out
    }

    /// Ids of `id` and all its descendants, pre-order.
    pub fn subtree_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                out.push(current);
                if let Some(children) = node.children() {
                    stack.extend(children.values().copied());
                }
            }
        }
        out
    }

    fn recompute_paths(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let parent_path = self
                .nodes
                .get(&current)
                .and_then(|n| n.parent)
                .and_then(|p| self.nodes.get(&p))
                .map(|p| p.full_path.clone());
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            node.full_path = match parent_path {
                Some(parent) => path::join(&parent, &node.name),
                None => path::ROOT.to_string(),
            };
            if let Some(children) = node.children() {
                stack.extend(children.values().copied());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::mount::{FileSystemType, MountPoint};

    fn tree() -> NodeStore {
        let mut store = NodeStore::new();
        store.insert("/", Node::directory("home", 0, 0)).unwrap();
        store.insert("/home", Node::directory("alice", 1000, 1000)).unwrap();
        store.insert("/", Node::directory("tmp", 0, 0)).unwrap();
        store
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut store = tree();
        let id = store
            .insert("/home/alice", Node::file("a.txt", 1000, 1000, b"hi".to_vec()))
            .unwrap();
        let node = store.lookup("/home/alice/a.txt").unwrap();
        assert_eq!(node.id, id);
        assert_eq!(node.full_path, "/home/alice/a.txt");
        assert_eq!(node.size, 2);
        assert_eq!(store.get(node.parent.unwrap()).unwrap().full_path, "/home/alice");
    }

    #[test]
    fn test_insert_errors() {
        let mut store = tree();
        store
            .insert("/tmp", Node::file("f", 0, 0, Vec::new()))
            .unwrap();

        let err = store.insert("/tmp", Node::file("f", 0, 0, Vec::new())).unwrap_err();
        assert!(matches!(err, VfsError::AlreadyExists(p) if p == "/tmp/f"));

        let err = store.insert("/tmp/f", Node::file("g", 0, 0, Vec::new())).unwrap_err();
        assert!(matches!(err, VfsError::NotADirectory(_)));

        let err = store.insert("/missing", Node::file("g", 0, 0, Vec::new())).unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
    }

    #[test]
    fn test_lookup_through_file_is_not_a_directory() {
        let mut store = tree();
        store.insert("/tmp", Node::file("f", 0, 0, Vec::new())).unwrap();
        assert!(matches!(store.lookup("/tmp/f/x"), Err(VfsError::NotADirectory(_))));
        assert!(matches!(store.lookup("/tmp/nope"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_remove() {
        let mut store = tree();
        store.insert("/tmp", Node::directory("nonempty", 0, 0)).unwrap();
        store
            .insert("/tmp/nonempty", Node::file("x", 0, 0, Vec::new()))
            .unwrap();

        let err = store.remove("/tmp/nonempty", false).unwrap_err();
        assert!(matches!(err, VfsError::DirectoryNotEmpty(_)));
        assert!(store.lookup("/tmp/nonempty/x").is_ok());

        let removed = store.remove("/tmp/nonempty", true).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].full_path, "/tmp/nonempty");
        assert!(store.lookup("/tmp/nonempty").is_err());
        assert!(store.list("/tmp").unwrap().is_empty());

        assert!(store.remove("/", true).is_err());
    }

    #[test]
    fn test_move_recomputes_subtree_paths() {
        let mut store = tree();
        let mounts = MountTable::new();
        store.insert("/home/alice", Node::directory("d", 0, 0)).unwrap();
        store.insert("/home/alice/d", Node::directory("c", 0, 0)).unwrap();
        store
            .insert("/home/alice/d/c", Node::file("leaf", 0, 0, Vec::new()))
            .unwrap();
        store.insert("/home", Node::directory("d2", 0, 0)).unwrap();

        store.move_node("/home/alice/d/c", "/home/d2/c", &mounts).unwrap();
        assert!(store.lookup("/home/alice/d/c").is_err());
        assert_eq!(store.lookup("/home/d2/c").unwrap().full_path, "/home/d2/c");
        assert_eq!(
            store.lookup("/home/d2/c/leaf").unwrap().full_path,
            "/home/d2/c/leaf"
        );
    }

    #[test]
    fn test_move_rename_in_place() {
        let mut store = tree();
        let mounts = MountTable::new();
        let id = store
            .insert("/tmp", Node::file("old.txt", 0, 0, b"x".to_vec()))
            .unwrap();
        store.move_node("/tmp/old.txt", "/tmp/new.txt", &mounts).unwrap();
        let node = store.lookup("/tmp/new.txt").unwrap();
        assert_eq!(node.id, id);
        assert_eq!(node.name, "new.txt");
    }

    #[test]
    fn test_move_errors() {
        let mut store = tree();
        let mounts = MountTable::with_defaults();
        store.insert("/tmp", Node::file("a", 0, 0, Vec::new())).unwrap();
        store.insert("/home/alice", Node::file("b", 0, 0, Vec::new())).unwrap();

        let err = store.move_node("/tmp/a", "/home/alice/a", &mounts).unwrap_err();
        assert!(matches!(err, VfsError::CrossMount { .. }));

        let err = store.move_node("/home", "/home/alice/inner", &mounts).unwrap_err();
        assert!(matches!(err, VfsError::InvalidPath(_)));

        store.insert("/home", Node::file("taken", 0, 0, Vec::new())).unwrap();
        let err = store.move_node("/home/alice/b", "/home/taken", &mounts).unwrap_err();
        assert!(matches!(err, VfsError::AlreadyExists(_)));

        // nothing moved
        assert!(store.lookup("/tmp/a").is_ok());
        assert!(store.lookup("/home/alice/b").is_ok());
    }

    #[test]
    fn test_move_mount_point_rejected() {
        let mut store = tree();
        let mut mounts = MountTable::new();
        mounts
            .mount(MountPoint::new("/home/alice", FileSystemType::RootFs, false))
            .unwrap();
        assert!(store.move_node("/home", "/users", &mounts).is_err());
        assert!(store.move_node("/home/alice", "/alice", &mounts).is_err());
    }

    #[test]
    fn test_write_and_read_at() {
        let mut store = tree();
        let id = store.insert("/tmp", Node::file("f", 0, 0, b"hello".to_vec())).unwrap();
        store.write_at(id, 7, b"xy").unwrap();
        assert_eq!(store.read_all(id).unwrap(), b"hello\0\0xy");
        assert_eq!(store.get(id).unwrap().size, 9);
        assert_eq!(store.read_at(id, 1, 3).unwrap(), b"ell");
        assert_eq!(store.read_at(id, 100, 3).unwrap(), b"");

        store.write_content(id, b"new".to_vec()).unwrap();
        assert_eq!(store.read_all(id).unwrap(), b"new");
        assert_eq!(store.get(id).unwrap().size, 3);
    }

    #[test]
    fn test_write_at_rejects_oversized_offsets() {
        let mut store = tree();
        let id = store.insert("/tmp", Node::file("f", 0, 0, b"hello".to_vec())).unwrap();
        for offset in [u64::MAX, 1 << 40, MAX_FILE_SIZE] {
            assert!(matches!(
                store.write_at(id, offset, b"x"),
                Err(VfsError::FileTooLarge(_))
            ));
        }
        assert_eq!(store.read_all(id).unwrap(), b"hello");
        assert_eq!(store.get(id).unwrap().size, 5);
    }

    #[test]
    fn test_corruption_isolated_until_rewrite() {
        let mut store = tree();
        let bad = store.insert("/tmp", Node::file("bad", 0, 0, b"?".to_vec())).unwrap();
        let good = store.insert("/tmp", Node::file("good", 0, 0, b"ok".to_vec())).unwrap();
        store.mark_corrupted(bad);

        assert!(matches!(store.read_all(bad), Err(VfsError::Corruption(_))));
        assert_eq!(store.read_all(good).unwrap(), b"ok");
        assert_eq!(store.corrupted_paths(), vec!["/tmp/bad".to_string()]);

        store.write_content(bad, b"fresh".to_vec()).unwrap();
        assert_eq!(store.read_all(bad).unwrap(), b"fresh");
        assert!(store.corrupted_paths().is_empty());
    }

    #[test]
    fn test_from_nodes_rebuilds_children() {
        let mut store = tree();
        store
            .insert("/home/alice", Node::file("a.txt", 1000, 1000, b"hi".to_vec()))
            .unwrap();
        let nodes: Vec<Node> = store.nodes().cloned().collect();
        let rebuilt = NodeStore::from_nodes(nodes, store.next_id()).unwrap();
        assert_eq!(rebuilt.len(), store.len());
        assert_eq!(
            rebuilt.lookup("/home/alice/a.txt").unwrap().content(),
            Some(&b"hi"[..])
        );
    }

    #[test]
    fn test_from_nodes_rejects_orphans() {
        let mut orphan = Node::file("lost", 0, 0, Vec::new());
        orphan.id = NodeId(9);
        orphan.parent = Some(NodeId(7));
        let root = NodeStore::new().root().clone();
        assert!(NodeStore::from_nodes(vec![root, orphan], 10).is_err());
    }
}
