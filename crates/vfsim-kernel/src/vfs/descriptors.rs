//! Open file handles.
//!
//! A descriptor pins a node id, so it keeps working after the file is
//! renamed. Deleting the file closes its descriptors.
//!
//! Concurrent descriptors on one file are last-writer-wins. A descriptor
//! opened with `lock` is exclusive: it cannot be opened while others exist,
//! and nothing else can be opened while it is held.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::error::{VfsError, VfsResult};
use super::types::{AccessMode, MAX_FILE_SIZE, NodeId};

/// Descriptor id.
pub type FdId = u64;

/// One open handle.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDescriptor {
    pub id: FdId,
    /// Path as opened.
    pub path: String,
    pub node_id: NodeId,
    pub mode: AccessMode,
    pub owner_pid: u32,
    pub position: u64,
    pub is_locked: bool,
    pub opened_at: DateTime<Utc>,
}

impl FileDescriptor {
    /// Move the cursor. Read-only handles stop at the end; writers may seek
    /// past it, up to [`MAX_FILE_SIZE`].
    pub fn seek(&mut self, pos: u64, size: u64) -> VfsResult<u64> {
        if !self.mode.writes() {
            self.position = pos.min(size);
        } else if pos > MAX_FILE_SIZE {
            return Err(VfsError::file_too_large(format!("seek to {pos}")));
        } else {
            self.position = pos;
        }
        Ok(self.position)
    }
}

/// All open descriptors.
#[derive(Debug)]
pub struct FileDescriptorTable {
    next_id: FdId,
    open: BTreeMap<FdId, FileDescriptor>,
}

impl Default for FileDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileDescriptorTable {
    /// Ids start at 3, after the conventional standard streams.
    pub fn new() -> Self {
        Self {
            next_id: 3,
            open: BTreeMap::new(),
        }
    }

    /// Issue a descriptor for an already authorized node.
    pub fn open(
        &mut self,
        path: impl Into<String>,
        node_id: NodeId,
        mode: AccessMode,
        owner_pid: u32,
        lock: bool,
    ) -> VfsResult<FdId> {
        let path = path.into();
        let conflict = self
            .open
            .values()
            .any(|fd| fd.node_id == node_id && (lock || fd.is_locked));
        if conflict {
            return Err(VfsError::FileLocked(path));
        }

        let id = self.next_id;
        self.next_id += 1;
        tracing::debug!(fd = id, path = %path, %mode, pid = owner_pid, lock, "opened");
        self.open.insert(
            id,
            FileDescriptor {
                id,
                path,
                node_id,
                mode,
                owner_pid,
                position: 0,
                is_locked: lock,
                opened_at: Utc::now(),
            },
        );
        Ok(id)
    }

    /// Release a descriptor owned by `owner_pid`.
    pub fn close(&mut self, id: FdId, owner_pid: u32) -> VfsResult<FileDescriptor> {
        self.get(id, owner_pid)?;
        self.open.remove(&id).ok_or(VfsError::BadDescriptor(id))
    }

    pub fn get(&self, id: FdId, owner_pid: u32) -> VfsResult<&FileDescriptor> {
        self.open
            .get(&id)
            .filter(|fd| fd.owner_pid == owner_pid)
            .ok_or(VfsError::BadDescriptor(id))
    }

    pub fn get_mut(&mut self, id: FdId, owner_pid: u32) -> VfsResult<&mut FileDescriptor> {
        self.open
            .get_mut(&id)
            .filter(|fd| fd.owner_pid == owner_pid)
            .ok_or(VfsError::BadDescriptor(id))
    }

    /// Drop every descriptor on any of `nodes`. Returns how many closed.
    pub fn close_all_for_nodes(&mut self, nodes: &[NodeId]) -> usize {
        let before = self.open.len();
        self.open.retain(|_, fd| !nodes.contains(&fd.node_id));
        before - self.open.len()
    }

    /// Drop every descriptor owned by a process.
    pub fn close_all_for_process(&mut self, owner_pid: u32) -> usize {
        let before = self.open.len();
        self.open.retain(|_, fd| fd.owner_pid != owner_pid);
        before - self.open.len()
    }

    /// Process holding an exclusive descriptor on `node_id`, if any.
    pub fn lock_holder(&self, node_id: NodeId) -> Option<u32> {
        self.open
            .values()
            .find(|fd| fd.node_id == node_id && fd.is_locked)
            .map(|fd| fd.owner_pid)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Open descriptors, by id.
    pub fn list(&self) -> Vec<FileDescriptor> {
        self.open.values().cloned().collect()
    }
}
