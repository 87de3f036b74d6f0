//! The public filesystem facade.
//!
//! Every call runs the same pipeline:
//!
//! 1. resolve the raw path against the caller's context,
//! 2. authorize through the [`PermissionEngine`],
//! 3. mutate or read the tree,
//! 4. record the outcome with the [`AuditLogger`], append pending audit
//!    lines to the log file and, for mutations, persist.
//!
//! A permission failure returns before the tree is touched. Tree work is
//! synchronous under a `parking_lot` lock that is never held across an
//! await point; only persistence suspends.
//!
//! Lock order: tree, then mounts, then descriptors.

use parking_lot::{Mutex, RwLock};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::{PersistenceMode, VfsConfig};

use super::audit::{AuditEventType, AuditLogEntry, AuditLogger, Severity};
use super::bootstrap;
use super::context::RequestContext;
use super::descriptors::{FdId, FileDescriptor, FileDescriptorTable};
use super::error::{VfsError, VfsResult};
use super::events::{ChangeType, EventBus, FsEvent, Subscription};
use super::mount::{FileSystemType, MountPoint, MountTable};
use super::path;
use super::permissions::PermissionEngine;
use super::persist::{LoadReport, PersistenceLayer, SnapshotStore, SqliteStore};
use super::store::NodeStore;
use super::symlink::SymlinkResolver;
use super::types::{Access, AccessMode, DirEntry, FileAttr, Node, NodeId, NodeKind, Permissions};

const EVENT_CAPACITY: usize = 1024;

/// Result of [`VirtualFileSystem::verify`].
#[derive(Debug, Clone, PartialEq)]
pub struct FsckReport {
    pub nodes: usize,
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub bytes: u64,
    /// Files whose content failed verification and has not been rewritten.
    pub corrupted: Vec<String>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty()
    }
}

/// Audit bookkeeping for one public call.
struct Op {
    operation: &'static str,
    event_type: AuditEventType,
    path: String,
    mutating: bool,
    context: Vec<(&'static str, String)>,
}

impl Op {
    fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    fn entry(&self, ctx: &RequestContext, severity: Severity) -> AuditLogEntry {
        let mut entry = AuditLogEntry::new(
            &ctx.identity,
            self.event_type,
            severity,
            &self.path,
            self.operation,
        )
        .with_context("session", ctx.session_id);
        for (key, value) in &self.context {
            entry = entry.with_context(*key, value);
        }
        entry
    }
}

/// Resolve `raw` for `ctx` and prepare the audit record. The record falls
/// back to the raw string when resolution fails.
fn begin(
    ctx: &RequestContext,
    operation: &'static str,
    raw: &str,
    event_type: AuditEventType,
    mutating: bool,
) -> (Op, VfsResult<String>) {
    let canonical = ctx.resolve(raw);
    let op = Op {
        operation,
        event_type,
        path: canonical.as_ref().map_or_else(|_| raw.to_string(), String::clone),
        mutating,
        context: Vec::new(),
    };
    (op, canonical)
}

fn split(concrete: &str) -> VfsResult<(&str, &str)> {
    path::split_parent(concrete)
        .ok_or_else(|| VfsError::invalid_path(format!("{concrete} has no parent")))
}

fn node(tree: &NodeStore, id: NodeId) -> VfsResult<&Node> {
    tree.get(id)
        .ok_or_else(|| VfsError::other(format!("dangling node id {id}")))
}

/// Append raw bytes to the audit log, recreating it if it was removed.
fn append_audit(tree: &mut NodeStore, audit_path: &str, bytes: &[u8]) -> VfsResult<()> {
    let id = match tree.lookup_id(audit_path) {
        Ok(id) => id,
        Err(VfsError::NotFound(_)) => {
            let (parent, name) = split(audit_path)?;
            bootstrap::create_dir_all(tree, parent)?;
            let log = Node::file(name, 0, 0, Vec::new()).with_permissions(Permissions::new(0o640)?);
            tree.insert(parent, log)?
        }
        Err(e) => return Err(e),
    };
    let size = node(tree, id)?.size;
    tree.write_at(id, size, bytes)?;
    Ok(())
}

/// The virtual filesystem.
pub struct VirtualFileSystem {
    tree: RwLock<NodeStore>,
    mounts: RwLock<MountTable>,
    fds: Mutex<FileDescriptorTable>,
    symlinks: SymlinkResolver,
    perms: PermissionEngine,
    audit: Arc<AuditLogger>,
    events: EventBus,
    persistence: Option<PersistenceLayer>,
    mode: PersistenceMode,
    checkpoint_interval: Duration,
    dirty: AtomicBool,
    /// Serializes saves so generations land in order.
    save_lock: tokio::sync::Mutex<()>,
    load_report: Option<LoadReport>,
}

impl std::fmt::Debug for VirtualFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFileSystem")
            .field("nodes", &self.tree.read().len())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl VirtualFileSystem {
    /// Open the filesystem described by `config`.
    ///
    /// Loads the last saved tree, or seeds the standard hierarchy when
    /// there is none.
    pub async fn open(config: VfsConfig) -> VfsResult<Self> {
        let store: Arc<dyn SnapshotStore> = match config.resolved_database_path() {
            Some(db) => Arc::new(SqliteStore::open(db)?),
            None => Arc::new(SqliteStore::in_memory()?),
        };
        Self::open_with_store(config, store).await
    }

    /// Open against an explicit backing store.
    pub async fn open_with_store(
        config: VfsConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> VfsResult<Self> {
        let audit_path = path::normalize(&config.audit_log_path)?;
        let audit = Arc::new(AuditLogger::new(
            config.audit_buffer_capacity,
            config.minimum_severity,
            audit_path.clone(),
        ));
        let persistence = (config.persistence != PersistenceMode::Disabled)
            .then(|| PersistenceLayer::new(store, config.save_retries, config.retry_backoff()));

        let loaded = match &persistence {
            Some(layer) => layer.load().await?,
            None => None,
        };
        let fresh = loaded.is_none();
        let (mut tree, load_report) = match loaded {
            Some((tree, report)) => (tree, Some(report)),
            None => {
                let mut tree = NodeStore::new();
                bootstrap::seed(&mut tree, &config.default_user.identity(), &audit_path)?;
                (tree, None)
            }
        };

        let mut mounts = MountTable::with_defaults();
        for extra in &config.mounts {
            let mut mp = extra.to_mount_point();
            mp.mount_path = path::normalize(&mp.mount_path)?;
            bootstrap::create_dir_all(&mut tree, &mp.mount_path)?;
            mounts.mount(mp)?;
        }

        let vfs = Self {
            tree: RwLock::new(tree),
            mounts: RwLock::new(mounts),
            fds: Mutex::new(FileDescriptorTable::new()),
            symlinks: SymlinkResolver::new(config.max_symlink_hops),
            perms: PermissionEngine::new(audit.clone()),
            audit,
            events: EventBus::new(EVENT_CAPACITY),
            persistence,
            mode: config.persistence,
            checkpoint_interval: config.checkpoint_interval(),
            dirty: AtomicBool::new(fresh),
            save_lock: tokio::sync::Mutex::new(()),
            load_report,
        };
        if fresh && vfs.mode == PersistenceMode::Sync {
            if let Err(e) = vfs.save_now().await {
                tracing::warn!(error = %e, "initial save failed, tree kept in memory");
            }
        }
        Ok(vfs)
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    async fn complete<T>(
        &self,
        ctx: &RequestContext,
        op: Op,
        result: VfsResult<T>,
    ) -> VfsResult<T> {
        match &result {
            Ok(_) if self.audit.is_audit_path(&op.path) => {}
            Ok(_) => self.audit.log(op.entry(ctx, Severity::Information)),
            // already recorded by the permission engine
            Err(e) if e.is_permission_denied() => {}
            Err(e) => self.audit.log(op.entry(ctx, Severity::Error).failed(e.to_string())),
        }
        let appended = self.drain_audit();
        if (op.mutating && result.is_ok()) || appended {
            if let Err(e) = self.persist().await {
                if result.is_ok() {
                    return Err(e);
                }
            }
        }
        result
    }

    /// Write queued audit lines straight into the log node. No permission
    /// check, no audit, no event.
    fn drain_audit(&self) -> bool {
        let pending = self.audit.take_pending();
        if pending.is_empty() {
            return false;
        }
        let mut text = String::new();
        for entry in &pending {
            let _ = writeln!(text, "{entry}");
        }
        let mut tree = self.tree.write();
        match append_audit(&mut tree, self.audit.audit_path(), text.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                drop(tree);
                tracing::warn!(
                    error = %e,
                    entries = pending.len(),
                    "audit append failed, entries requeued"
                );
                self.audit.restore_pending(pending);
                false
            }
        }
    }

    async fn persist(&self) -> VfsResult<()> {
        self.dirty.store(true, Ordering::SeqCst);
        if self.mode != PersistenceMode::Sync {
            return Ok(());
        }
        self.save_now().await.map(|_| ())
    }

    async fn save_now(&self) -> VfsResult<Option<u64>> {
        let Some(layer) = &self.persistence else {
            return Ok(None);
        };
        let _guard = self.save_lock.lock().await;
        self.dirty.store(false, Ordering::SeqCst);
        let encoded = {
            let tree = self.tree.read();
            PersistenceLayer::encode(&tree)
        };
        let saved = match encoded {
            Ok(encoded) => layer.save_encoded(encoded).await,
            Err(e) => Err(e),
        };
        if saved.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        saved.map(Some)
    }

    fn ensure_writable(&self, concrete: &str) -> VfsResult<()> {
        if self.mounts.read().is_read_only(concrete) {
            return Err(VfsError::read_only(concrete));
        }
        Ok(())
    }

    /// Fail if another process holds an exclusive descriptor on any of `ids`.
    fn ensure_unlocked(
        &self,
        ctx: &RequestContext,
        ids: &[NodeId],
        concrete: &str,
    ) -> VfsResult<()> {
        let fds = self.fds.lock();
        let locked = ids
            .iter()
            .any(|id| fds.lock_holder(*id).is_some_and(|pid| pid != ctx.process_id));
        if locked {
            return Err(VfsError::FileLocked(concrete.to_string()));
        }
        Ok(())
    }

    fn publish(&self, ctx: &RequestContext, path: impl Into<String>, change: ChangeType) {
        self.events
            .publish(FsEvent::new(path, change, ctx.identity.user_id));
    }

    // ------------------------------------------------------------------
    // Files and directories
    // ------------------------------------------------------------------

    /// Create a regular file. Fails if the name is taken.
    pub async fn create_file(
        &self,
        ctx: &RequestContext,
        path: &str,
        content: Option<&[u8]>,
    ) -> VfsResult<FileAttr> {
        let (op, canonical) = begin(ctx, "create_file", path, AuditEventType::Modification, true);
        let content = content.unwrap_or_default().to_vec();
        let result = canonical.and_then(|p| {
            self.create_node(ctx, &p, |name, uid, gid| Node::file(name, uid, gid, content))
        });
        self.complete(ctx, op, result).await
    }

    /// Create one directory. The parent must exist.
    pub async fn create_directory(&self, ctx: &RequestContext, path: &str) -> VfsResult<FileAttr> {
        let (op, canonical) =
            begin(ctx, "create_directory", path, AuditEventType::Modification, true);
        let result = canonical.and_then(|p| {
            self.create_node(ctx, &p, |name, uid, gid| Node::directory(name, uid, gid))
        });
        self.complete(ctx, op, result).await
    }

    /// Create a symbolic link at `link` pointing at `target`.
    ///
    /// The target is stored as given and may dangle.
    pub async fn create_symlink(
        &self,
        ctx: &RequestContext,
        link: &str,
        target: &str,
    ) -> VfsResult<FileAttr> {
        let (op, canonical) = begin(ctx, "symlink", link, AuditEventType::Modification, true);
        let op = op.with("target", target);
        let result = if target.is_empty() || target.contains('\0') {
            Err(VfsError::invalid_path(format!("bad symlink target {target:?}")))
        } else {
            canonical.and_then(|p| {
                self.create_node(ctx, &p, |name, uid, gid| Node::symlink(name, uid, gid, target))
            })
        };
        self.complete(ctx, op, result).await
    }

    fn create_node(
        &self,
        ctx: &RequestContext,
        canonical: &str,
        make: impl FnOnce(&str, u32, u32) -> Node,
    ) -> VfsResult<FileAttr> {
        let who = &ctx.identity;
        let mut tree = self.tree.write();
        let concrete = self.symlinks.resolve(&tree, canonical, false)?;
        let (parent_path, name) = split(&concrete)?;
        path::validate_name(name)?;
        self.ensure_writable(&concrete)?;
        let parent = tree.lookup(parent_path)?;
        if !parent.is_dir() {
            return Err(VfsError::not_a_directory(parent_path));
        }
        self.perms.check_access(parent, who, Access::Write, "create")?;

        let id = tree.insert(parent_path, make(name, who.user_id, who.group_id))?;
        let attr = node(&tree, id)?.attr();
        drop(tree);
        tracing::debug!(path = %concrete, kind = ?attr.kind, user = %who.username, "created");
        self.publish(ctx, &concrete, ChangeType::Created);
        Ok(attr)
    }

    /// `mkdir -p`: create every missing directory along `path`.
    pub async fn create_dir_all(&self, ctx: &RequestContext, path: &str) -> VfsResult<FileAttr> {
        let (op, canonical) =
            begin(ctx, "create_dir_all", path, AuditEventType::Modification, true);
        let result = canonical.and_then(|p| self.create_dir_all_inner(ctx, &p));
        self.complete(ctx, op, result).await
    }

    fn create_dir_all_inner(&self, ctx: &RequestContext, canonical: &str) -> VfsResult<FileAttr> {
        let who = &ctx.identity;
        let mut tree = self.tree.write();
        let concrete = self.symlinks.resolve(&tree, canonical, true)?;

        // deepest existing ancestor, then the missing tail
        let segments: Vec<&str> = path::segments(&concrete).collect();
        let mut existing = NodeId::ROOT;
        let mut depth = 0;
        for segment in &segments {
            let Some(child) = tree.child_id(existing, segment) else {
                break;
            };
            if !node(&tree, child)?.is_dir() {
                return Err(VfsError::not_a_directory(path::from_segments(&segments[..=depth])));
            }
            existing = child;
            depth += 1;
        }
        if depth == segments.len() {
            return Ok(node(&tree, existing)?.attr());
        }

        for segment in &segments[depth..] {
            path::validate_name(segment)?;
        }
        let first_missing = path::from_segments(&segments[..=depth]);
        self.ensure_writable(&first_missing)?;
        self.perms
            .check_access(node(&tree, existing)?, who, Access::Write, "create")?;

        let mut created = Vec::new();
        for i in depth..segments.len() {
            let parent = path::from_segments(&segments[..i]);
            tree.insert(&parent, Node::directory(segments[i], who.user_id, who.group_id))?;
            created.push(path::from_segments(&segments[..=i]));
        }
        let attr = tree.lookup(&concrete)?.attr();
        drop(tree);
        for dir in created {
            self.publish(ctx, dir, ChangeType::Created);
        }
        Ok(attr)
    }

    /// Delete a node. Non-empty directories need `recursive`.
    pub async fn delete(&self, ctx: &RequestContext, path: &str, recursive: bool) -> VfsResult<()> {
        let (op, canonical) = begin(ctx, "delete", path, AuditEventType::Modification, true);
        let op = op.with("recursive", recursive);
        let result = canonical.and_then(|p| self.delete_inner(ctx, &p, recursive));
        self.complete(ctx, op, result).await
    }

    fn delete_inner(
        &self,
        ctx: &RequestContext,
        canonical: &str,
        recursive: bool,
    ) -> VfsResult<()> {
        let mut tree = self.tree.write();
        let concrete = self.symlinks.resolve(&tree, canonical, false)?;
        if concrete == path::ROOT {
            return Err(VfsError::invalid_path("cannot remove /"));
        }
        let id = tree.lookup_id(&concrete)?;
        self.ensure_writable(&concrete)?;
        {
            let mounts = self.mounts.read();
            if mounts.is_mount_point(&concrete) || mounts.has_mounts_below(&concrete) {
                return Err(VfsError::other(format!("mount point busy: {concrete}")));
            }
        }
        let (parent_path, _) = split(&concrete)?;
        self.perms
            .check_access(tree.lookup(parent_path)?, &ctx.identity, Access::Write, "delete")?;

        let ids = tree.subtree_ids(id);
        self.ensure_unlocked(ctx, &ids, &concrete)?;
        let removed = tree.remove(&concrete, recursive)?;
        let closed = self.fds.lock().close_all_for_nodes(&ids);
        drop(tree);
        tracing::debug!(path = %concrete, nodes = removed.len(), closed, "deleted");
        self.publish(ctx, &concrete, ChangeType::Deleted);
        Ok(())
    }

    /// Whether `path` names an existing node (following symlinks).
    pub async fn exists(&self, ctx: &RequestContext, path: &str) -> VfsResult<bool> {
        let (op, canonical) = begin(ctx, "exists", path, AuditEventType::Access, false);
        let result = canonical.map(|p| {
            let tree = self.tree.read();
            self.symlinks
                .resolve(&tree, &p, true)
                .and_then(|concrete| tree.lookup_id(&concrete))
                .is_ok()
        });
        self.complete(ctx, op, result).await
    }

    /// Entries of a directory, sorted by name.
    pub async fn list_directory(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> VfsResult<Vec<DirEntry>> {
        let (op, canonical) = begin(ctx, "list", path, AuditEventType::Access, false);
        let result = canonical.and_then(|p| self.list_inner(ctx, &p));
        self.complete(ctx, op, result).await
    }

    fn list_inner(&self, ctx: &RequestContext, canonical: &str) -> VfsResult<Vec<DirEntry>> {
        let tree = self.tree.read();
        let concrete = self.symlinks.resolve(&tree, canonical, true)?;
        let dir = tree.lookup(&concrete)?;
        if !dir.is_dir() {
            return Err(VfsError::not_a_directory(concrete));
        }
        self.perms.check_access(dir, &ctx.identity, Access::Read, "list")?;
        let id = dir.id;
        let entries = tree
            .list(&concrete)?
            .into_iter()
            .map(|n| DirEntry::new(&n.name, n.file_type()))
            .collect();
        drop(tree);
        self.tree.write().touch_accessed(id);
        Ok(entries)
    }

    /// Whole content of a file.
    pub async fn read_file(&self, ctx: &RequestContext, path: &str) -> VfsResult<Vec<u8>> {
        let (op, canonical) = begin(ctx, "read", path, AuditEventType::Access, false);
        let result = canonical.and_then(|p| self.read_inner(ctx, &p));
        self.complete(ctx, op, result).await
    }

    fn read_inner(&self, ctx: &RequestContext, canonical: &str) -> VfsResult<Vec<u8>> {
        let tree = self.tree.read();
        let concrete = self.symlinks.resolve(&tree, canonical, true)?;
        let file = tree.lookup(&concrete)?;
        if file.is_dir() {
            return Err(VfsError::is_a_directory(concrete));
        }
        self.perms.check_access(file, &ctx.identity, Access::Read, "read")?;
        let id = file.id;
        let data = tree.read_all(id)?.to_vec();
        drop(tree);
        self.tree.write().touch_accessed(id);
        Ok(data)
    }

    /// Replace a file's content, creating the file if it is missing.
    pub async fn write_file(
        &self,
        ctx: &RequestContext,
        path: &str,
        data: &[u8],
    ) -> VfsResult<FileAttr> {
        let (op, canonical) = begin(ctx, "write", path, AuditEventType::Modification, true);
        let op = op.with("bytes", data.len());
        let result = canonical.and_then(|p| self.write_inner(ctx, &p, data));
        self.complete(ctx, op, result).await
    }

    fn write_inner(
        &self,
        ctx: &RequestContext,
        canonical: &str,
        data: &[u8],
    ) -> VfsResult<FileAttr> {
        let who = &ctx.identity;
        let mut tree = self.tree.write();
        let concrete = self.symlinks.resolve(&tree, canonical, true)?;
        self.ensure_writable(&concrete)?;

        let existing = match tree.lookup_id(&concrete) {
            Ok(id) => Some(id),
            Err(VfsError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let (id, change) = match existing {
            Some(id) => {
                let file = node(&tree, id)?;
                if file.is_dir() {
                    return Err(VfsError::is_a_directory(concrete));
                }
                self.perms.check_access(file, who, Access::Write, "write")?;
                self.ensure_unlocked(ctx, &[id], &concrete)?;
                tree.write_content(id, data.to_vec())?;
                (id, ChangeType::Modified)
            }
            None => {
                let (parent_path, name) = split(&concrete)?;
                self.perms
                    .check_access(tree.lookup(parent_path)?, who, Access::Write, "create")?;
                let file = Node::file(name, who.user_id, who.group_id, data.to_vec());
                (tree.insert(parent_path, file)?, ChangeType::Created)
            }
        };
        let attr = node(&tree, id)?.attr();
        drop(tree);
        self.publish(ctx, &concrete, change);
        Ok(attr)
    }

    /// Metadata of the node at `path`, following symlinks.
    pub async fn get_node(&self, ctx: &RequestContext, path: &str) -> VfsResult<FileAttr> {
        let (op, canonical) = begin(ctx, "stat", path, AuditEventType::Access, false);
        let result = canonical.and_then(|p| self.stat_inner(&p, true));
        self.complete(ctx, op, result).await
    }

    /// Metadata of the node at `path` without following a final symlink.
    pub async fn symlink_metadata(&self, ctx: &RequestContext, path: &str) -> VfsResult<FileAttr> {
        let (op, canonical) = begin(ctx, "lstat", path, AuditEventType::Access, false);
        let result = canonical.and_then(|p| self.stat_inner(&p, false));
        self.complete(ctx, op, result).await
    }

    fn stat_inner(&self, canonical: &str, follow: bool) -> VfsResult<FileAttr> {
        let tree = self.tree.read();
        let concrete = self.symlinks.resolve(&tree, canonical, follow)?;
        Ok(tree.lookup(&concrete)?.attr())
    }

    /// Target of the symlink at `path`.
    pub async fn read_link(&self, ctx: &RequestContext, path: &str) -> VfsResult<String> {
        let (op, canonical) = begin(ctx, "readlink", path, AuditEventType::Access, false);
        let result = canonical.and_then(|p| {
            let tree = self.tree.read();
            let concrete = self.symlinks.resolve(&tree, &p, false)?;
            tree.lookup(&concrete)?
                .symlink_target()
                .map(str::to_string)
                .ok_or(VfsError::NotASymlink(concrete))
        });
        self.complete(ctx, op, result).await
    }

    /// Rename or re-parent `src` to `dst`.
    ///
    /// If `dst` is an existing directory the source moves into it. An
    /// existing non-directory destination is never overwritten.
    pub async fn move_path(
        &self,
        ctx: &RequestContext,
        src: &str,
        dst: &str,
    ) -> VfsResult<FileAttr> {
        let (op, src) = begin(ctx, "move", src, AuditEventType::Modification, true);
        let dst = ctx.resolve(dst);
        let op = op.with("to", dst.as_deref().unwrap_or("?"));
        let result = src.and_then(|s| dst.and_then(|d| self.move_inner(ctx, &s, &d)));
        self.complete(ctx, op, result).await
    }

    fn move_inner(
        &self,
        ctx: &RequestContext,
        src_canonical: &str,
        dst_canonical: &str,
    ) -> VfsResult<FileAttr> {
        let who = &ctx.identity;
        let mut tree = self.tree.write();
        let src = self.symlinks.resolve(&tree, src_canonical, false)?;
        let mut dst = self.symlinks.resolve(&tree, dst_canonical, false)?;
        let id = tree.lookup_id(&src)?;
        if dst != src && tree.lookup(&dst).is_ok_and(Node::is_dir) {
            dst = path::join(&dst, &node(&tree, id)?.name);
        }

        self.ensure_writable(&src)?;
        self.ensure_writable(&dst)?;
        let (src_parent, _) = split(&src)?;
        let (dst_parent, _) = split(&dst)?;
        self.perms
            .check_access(tree.lookup(src_parent)?, who, Access::Write, "move")?;
        self.perms
            .check_access(tree.lookup(dst_parent)?, who, Access::Write, "move")?;

        {
            let mounts = self.mounts.read();
            tree.move_node(&src, &dst, &mounts)?;
        }
        let attr = node(&tree, id)?.attr();
        drop(tree);
        tracing::debug!(from = %src, to = %dst, "moved");
        self.publish(ctx, &dst, ChangeType::Renamed { from: src });
        Ok(attr)
    }

    /// Copy `src` (recursively for directories) to `dst`.
    ///
    /// Copies belong to the caller and keep the source's mode bits. Copying
    /// across mounts is allowed.
    pub async fn copy_path(
        &self,
        ctx: &RequestContext,
        src: &str,
        dst: &str,
    ) -> VfsResult<FileAttr> {
        let (op, src) = begin(ctx, "copy", src, AuditEventType::Modification, true);
        let dst = ctx.resolve(dst);
        let op = op.with("to", dst.as_deref().unwrap_or("?"));
        let result = src.and_then(|s| dst.and_then(|d| self.copy_inner(ctx, &s, &d)));
        self.complete(ctx, op, result).await
    }

    fn copy_inner(
        &self,
        ctx: &RequestContext,
        src_canonical: &str,
        dst_canonical: &str,
    ) -> VfsResult<FileAttr> {
        let who = &ctx.identity;
        let mut tree = self.tree.write();
        let src = self.symlinks.resolve(&tree, src_canonical, true)?;
        let mut dst = self.symlinks.resolve(&tree, dst_canonical, false)?;
        let src_id = tree.lookup_id(&src)?;
        if src_id == NodeId::ROOT {
            return Err(VfsError::invalid_path("cannot copy /"));
        }
        if tree.lookup(&dst).is_ok_and(Node::is_dir) {
            dst = path::join(&dst, &node(&tree, src_id)?.name);
        }
        if path::is_within(&dst, &src) {
            return Err(VfsError::invalid_path(format!("cannot copy {src} into itself")));
        }
        let (dst_parent, dst_name) = split(&dst)?;
        path::validate_name(dst_name)?;
        if tree.lookup_id(&dst).is_ok() {
            return Err(VfsError::already_exists(dst));
        }
        self.ensure_writable(&dst)?;

        // authorize the whole subtree before touching anything
        let ids = tree.subtree_ids(src_id);
        for id in &ids {
            let n = node(&tree, *id)?;
            self.perms.check_access(n, who, Access::Read, "copy")?;
            if tree.is_corrupted(*id) {
                return Err(VfsError::Corruption(n.full_path.clone()));
            }
        }
        let parent = tree.lookup(dst_parent)?;
        if !parent.is_dir() {
            return Err(VfsError::not_a_directory(dst_parent));
        }
        self.perms.check_access(parent, who, Access::Write, "copy")?;

        let plan = ids
            .iter()
            .map(|id| -> VfsResult<(String, Node)> {
                let n = node(&tree, *id)?;
                let target = format!("{dst}{}", &n.full_path[src.len()..]);
                let (_, name) = split(&target)?;
                let copy = match &n.kind {
                    NodeKind::Directory { .. } => Node::directory(name, who.user_id, who.group_id),
                    NodeKind::File {
                        symlink_target: Some(link),
                        ..
                    } => Node::symlink(name, who.user_id, who.group_id, link.clone()),
                    NodeKind::File { content, .. } => {
                        Node::file(name, who.user_id, who.group_id, content.clone())
                    }
                };
                Ok((target, copy.with_permissions(n.permissions)))
            })
            .collect::<VfsResult<Vec<_>>>()?;
        // pre-order: every parent lands before its children
        for (target, copy) in plan {
            let (parent, _) = split(&target)?;
            tree.insert(parent, copy)?;
        }
        let attr = tree.lookup(&dst)?.attr();
        drop(tree);
        tracing::debug!(from = %src, to = %dst, nodes = ids.len(), "copied");
        self.publish(ctx, &dst, ChangeType::Created);
        Ok(attr)
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    /// Change mode bits. Owner or superuser.
    pub async fn chmod(
        &self,
        ctx: &RequestContext,
        path: &str,
        mode: Permissions,
    ) -> VfsResult<FileAttr> {
        let (op, canonical) = begin(ctx, "chmod", path, AuditEventType::PermissionChange, true);
        let op = op.with("mode", mode.to_octal());
        let result = canonical.and_then(|p| {
            self.change_attr(ctx, &p, "chmod", false, |tree, id| tree.set_permissions(id, mode))
        });
        self.complete(ctx, op, result).await
    }

    /// Change ownership. Superuser only.
    pub async fn chown(
        &self,
        ctx: &RequestContext,
        path: &str,
        owner_id: u32,
        group_id: u32,
    ) -> VfsResult<FileAttr> {
        let (op, canonical) = begin(ctx, "chown", path, AuditEventType::PermissionChange, true);
        let op = op.with("owner", format!("{owner_id}:{group_id}"));
        let result = canonical.and_then(|p| {
            self.change_attr(ctx, &p, "chown", true, |tree, id| {
                tree.set_owner(id, owner_id, group_id)
            })
        });
        self.complete(ctx, op, result).await
    }

    fn change_attr(
        &self,
        ctx: &RequestContext,
        canonical: &str,
        operation: &str,
        superuser_only: bool,
        apply: impl FnOnce(&mut NodeStore, NodeId) -> VfsResult<()>,
    ) -> VfsResult<FileAttr> {
        let mut tree = self.tree.write();
        let concrete = self.symlinks.resolve(&tree, canonical, true)?;
        let id = tree.lookup_id(&concrete)?;
        self.ensure_writable(&concrete)?;
        self.perms
            .check_change(node(&tree, id)?, &ctx.identity, operation, superuser_only)?;
        apply(&mut *tree, id)?;
        let attr = node(&tree, id)?.attr();
        drop(tree);
        self.publish(ctx, &concrete, ChangeType::AttributesChanged);
        Ok(attr)
    }

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    /// Open a file. Descriptors belong to `ctx.process_id`.
    pub async fn open_file(
        &self,
        ctx: &RequestContext,
        path: &str,
        mode: AccessMode,
        lock: bool,
    ) -> VfsResult<FdId> {
        let (op, canonical) = begin(ctx, "open", path, AuditEventType::Access, false);
        let op = op.with("mode", mode).with("lock", lock);
        let result = canonical.and_then(|p| self.open_inner(ctx, &p, mode, lock));
        self.complete(ctx, op, result).await
    }

    fn open_inner(
        &self,
        ctx: &RequestContext,
        canonical: &str,
        mode: AccessMode,
        lock: bool,
    ) -> VfsResult<FdId> {
        let tree = self.tree.read();
        let concrete = self.symlinks.resolve(&tree, canonical, true)?;
        let file = tree.lookup(&concrete)?;
        if file.is_dir() {
            return Err(VfsError::is_a_directory(concrete));
        }
        if mode.writes() {
            self.ensure_writable(&concrete)?;
            self.perms.check_access(file, &ctx.identity, Access::Write, "open")?;
        }
        if mode.reads() {
            self.perms.check_access(file, &ctx.identity, Access::Read, "open")?;
        }
        let id = file.id;
        self.fds
            .lock()
            .open(concrete, id, mode, ctx.process_id, lock)
    }

    fn fd_path(&self, ctx: &RequestContext, fd: FdId) -> String {
        self.fds
            .lock()
            .get(fd, ctx.process_id)
            .map_or_else(|_| format!("fd:{fd}"), |d| d.path.clone())
    }

    fn fd_op(
        &self,
        ctx: &RequestContext,
        fd: FdId,
        operation: &'static str,
        event_type: AuditEventType,
        mutating: bool,
    ) -> Op {
        Op {
            operation,
            event_type,
            path: self.fd_path(ctx, fd),
            mutating,
            context: Vec::new(),
        }
        .with("fd", fd)
    }

    /// Read up to `len` bytes at the descriptor's position.
    pub async fn read_fd(&self, ctx: &RequestContext, fd: FdId, len: usize) -> VfsResult<Vec<u8>> {
        let op = self.fd_op(ctx, fd, "read_fd", AuditEventType::Access, false);
        let result = (|| -> VfsResult<Vec<u8>> {
            let tree = self.tree.read();
            let mut fds = self.fds.lock();
            let desc = fds.get_mut(fd, ctx.process_id)?;
            if !desc.mode.reads() {
                return Err(VfsError::BadDescriptor(fd));
            }
            let data = tree.read_at(desc.node_id, desc.position, len)?.to_vec();
            desc.position += data.len() as u64;
            Ok(data)
        })();
        self.complete(ctx, op, result).await
    }

    /// Write at the descriptor's position (at the end for `Append`).
    pub async fn write_fd(&self, ctx: &RequestContext, fd: FdId, data: &[u8]) -> VfsResult<usize> {
        let op = self.fd_op(ctx, fd, "write_fd", AuditEventType::Modification, true);
        let result = self.write_fd_inner(ctx, fd, data);
        self.complete(ctx, op, result).await
    }

    fn write_fd_inner(&self, ctx: &RequestContext, fd: FdId, data: &[u8]) -> VfsResult<usize> {
        let mut tree = self.tree.write();
        let (node_id, position) = {
            let fds = self.fds.lock();
            let desc = fds.get(fd, ctx.process_id)?;
            if !desc.mode.writes() {
                return Err(VfsError::BadDescriptor(fd));
            }
            (desc.node_id, desc.position)
        };
        let file = tree.get(node_id).ok_or(VfsError::BadDescriptor(fd))?;
        let concrete = file.full_path.clone();
        let size = file.size;
        self.ensure_writable(&concrete)?;

        let mut fds = self.fds.lock();
        let desc = fds.get_mut(fd, ctx.process_id)?;
        let at = if desc.mode == AccessMode::Append { size } else { position };
        let written = tree.write_at(node_id, at, data)?;
        desc.position = at + written as u64;
        drop(fds);
        drop(tree);
        self.publish(ctx, concrete, ChangeType::Modified);
        Ok(written)
    }

    /// Reposition a descriptor. Returns the new position.
    pub async fn seek_fd(&self, ctx: &RequestContext, fd: FdId, pos: u64) -> VfsResult<u64> {
        let op = self.fd_op(ctx, fd, "seek_fd", AuditEventType::Access, false);
        let result = (|| -> VfsResult<u64> {
            let tree = self.tree.read();
            let mut fds = self.fds.lock();
            let desc = fds.get_mut(fd, ctx.process_id)?;
            let size = tree.get(desc.node_id).map_or(0, |n| n.size);
            desc.seek(pos, size)
        })();
        self.complete(ctx, op, result).await
    }

    /// Release a descriptor.
    pub async fn close_fd(&self, ctx: &RequestContext, fd: FdId) -> VfsResult<()> {
        let op = self.fd_op(ctx, fd, "close_fd", AuditEventType::Access, false);
        let result = self.fds.lock().close(fd, ctx.process_id).map(|_| ());
        self.complete(ctx, op, result).await
    }

    /// Close every descriptor owned by `ctx.process_id`.
    pub fn release_process(&self, ctx: &RequestContext) -> usize {
        self.fds.lock().close_all_for_process(ctx.process_id)
    }

    /// Snapshot of all open descriptors.
    pub fn open_descriptors(&self) -> Vec<FileDescriptor> {
        self.fds.lock().list()
    }

    // ------------------------------------------------------------------
    // Mounts
    // ------------------------------------------------------------------

    /// Attach a filesystem at an existing directory. Superuser only.
    pub async fn mount(
        &self,
        ctx: &RequestContext,
        path: &str,
        fs_type: FileSystemType,
        options: Option<&str>,
        read_only: bool,
    ) -> VfsResult<()> {
        let (op, canonical) = begin(ctx, "mount", path, AuditEventType::Administrative, false);
        let op = op.with("fs_type", fs_type).with("read_only", read_only);
        let result = canonical.and_then(|p| {
            let tree = self.tree.write();
            let concrete = self.symlinks.resolve(&tree, &p, true)?;
            self.perms.check_admin(&ctx.identity, &concrete, "mount")?;
            if !tree.lookup(&concrete)?.is_dir() {
                return Err(VfsError::not_a_directory(concrete));
            }
            let mut mp = MountPoint::new(&concrete, fs_type, read_only);
            if let Some(options) = options {
                mp = mp.with_options(options);
            }
            self.mounts.write().mount(mp)?;
            tracing::info!(path = %concrete, %fs_type, read_only, "mounted");
            Ok(())
        });
        self.complete(ctx, op, result).await
    }

    /// Detach the mount at `path`. Superuser only; `/` stays.
    pub async fn unmount(&self, ctx: &RequestContext, path: &str) -> VfsResult<MountPoint> {
        let (op, canonical) = begin(ctx, "unmount", path, AuditEventType::Administrative, false);
        let result = canonical.and_then(|p| {
            let _tree = self.tree.write();
            self.perms.check_admin(&ctx.identity, &p, "unmount")?;
            let removed = self.mounts.write().unmount(&p)?;
            tracing::info!(path = %p, "unmounted");
            Ok(removed)
        });
        self.complete(ctx, op, result).await
    }

    pub fn list_mounts(&self) -> Vec<MountPoint> {
        self.mounts.read().list()
    }

    // ------------------------------------------------------------------
    // Persistence and integrity
    // ------------------------------------------------------------------

    /// Save now, whatever the persistence mode. `None` when disabled.
    pub async fn sync(&self) -> VfsResult<Option<u64>> {
        self.save_now().await
    }

    /// True if the tree changed since the last successful save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        self.mode
    }

    /// Background saver for [`PersistenceMode::Checkpoint`].
    ///
    /// Saves every checkpoint interval while dirty and stops once the
    /// filesystem is dropped.
    pub fn spawn_checkpointer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.checkpoint_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(vfs) = weak.upgrade() else {
                    break;
                };
                if vfs.is_dirty() {
                    match vfs.save_now().await {
                        Ok(generation) => tracing::debug!(?generation, "checkpoint"),
                        Err(e) => tracing::warn!(error = %e, "checkpoint failed"),
                    }
                }
            }
            tracing::debug!("checkpointer stopped");
        })
    }

    /// What the initial load found, if the tree came from storage.
    pub fn load_report(&self) -> Option<&LoadReport> {
        self.load_report.as_ref()
    }

    /// Integrity report over the live tree.
    pub fn verify(&self) -> FsckReport {
        let tree = self.tree.read();
        let mut report = FsckReport {
            nodes: tree.len(),
            files: 0,
            directories: 0,
            symlinks: 0,
            bytes: 0,
            corrupted: tree.corrupted_paths(),
        };
        for n in tree.nodes() {
            if n.is_dir() {
                report.directories += 1;
            } else if n.is_symlink() {
                report.symlinks += 1;
            } else {
                report.files += 1;
                report.bytes += n.size;
            }
        }
        report
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Change notifications at or below `prefix`.
    pub fn subscribe(&self, prefix: &str) -> Subscription {
        self.events.subscribe(prefix)
    }

    /// Buffered audit entries, oldest first.
    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.audit.entries()
    }

    pub fn recent_audit(&self, n: usize) -> Vec<AuditLogEntry> {
        self.audit.recent(n)
    }

    /// Live feed of every audit entry.
    pub fn subscribe_audit(&self) -> tokio::sync::broadcast::Receiver<AuditLogEntry> {
        self.audit.subscribe()
    }

    pub fn audit_log_path(&self) -> &str {
        self.audit.audit_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::context::Identity;
    use crate::vfs::types::MAX_FILE_SIZE;

    async fn fs() -> VirtualFileSystem {
        let mut config = VfsConfig::default().with_persistence(PersistenceMode::Disabled);
        config.default_user.name = "alice".to_string();
        VirtualFileSystem::open(config).await.unwrap()
    }

    fn alice() -> RequestContext {
        RequestContext::new(Identity::new("alice", 1000, 1000))
    }

    fn bob() -> RequestContext {
        RequestContext::new(Identity::new("bob", 1001, 1001))
    }

    #[tokio::test]
    async fn test_relative_paths_use_cwd() {
        let vfs = fs().await;
        let ctx = alice();
        vfs.create_file(&ctx, "notes.txt", Some(b"x".as_slice())).await.unwrap();
        assert!(vfs.exists(&ctx, "/home/alice/notes.txt").await.unwrap());
        assert!(vfs.exists(&ctx, "~/notes.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_requires_parent_write() {
        let vfs = fs().await;
        let err = vfs
            .create_file(&bob(), "/home/alice/intruder", None)
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
        assert!(!vfs.exists(&alice(), "/home/alice/intruder").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_creates_then_modifies() {
        let vfs = fs().await;
        let ctx = alice();
        let mut sub = vfs.subscribe("/home/alice");

        let attr = vfs.write_file(&ctx, "a.md", b"one").await.unwrap();
        assert_eq!(attr.mime_type.as_deref(), Some("text/markdown"));
        vfs.write_file(&ctx, "a.md", b"two!").await.unwrap();
        assert_eq!(vfs.read_file(&ctx, "a.md").await.unwrap(), b"two!");
        assert_eq!(vfs.get_node(&ctx, "a.md").await.unwrap().size, 4);

        assert_eq!(sub.try_recv().unwrap().change, ChangeType::Created);
        assert_eq!(sub.try_recv().unwrap().change, ChangeType::Modified);
    }

    #[tokio::test]
    async fn test_read_only_mount_applies_to_root() {
        let vfs = fs().await;
        let root = RequestContext::root();
        let err = vfs.create_file(&root, "/proc/x", None).await.unwrap_err();
        assert!(matches!(err, VfsError::ReadOnly(_)));
        let err = vfs.write_file(&root, "/dev/null", b"x").await.unwrap_err();
        assert!(matches!(err, VfsError::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_symlink_follow_and_lstat() {
        let vfs = fs().await;
        let ctx = alice();
        vfs.write_file(&ctx, "real.txt", b"data").await.unwrap();
        vfs.create_symlink(&ctx, "link", "real.txt").await.unwrap();

        assert_eq!(vfs.read_file(&ctx, "link").await.unwrap(), b"data");
        assert_eq!(vfs.read_link(&ctx, "link").await.unwrap(), "real.txt");
        assert!(vfs.symlink_metadata(&ctx, "link").await.unwrap().is_symlink());
        assert!(vfs.get_node(&ctx, "link").await.unwrap().is_file());
        assert!(matches!(
            vfs.read_link(&ctx, "real.txt").await,
            Err(VfsError::NotASymlink(_))
        ));

        // deleting the link leaves the target
        vfs.delete(&ctx, "link", false).await.unwrap();
        assert!(vfs.exists(&ctx, "real.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_chmod_and_chown_rules() {
        let vfs = fs().await;
        let ctx = alice();
        vfs.write_file(&ctx, "f", b"").await.unwrap();
        let attr = vfs
            .chmod(&ctx, "f", Permissions::new(0o600).unwrap())
            .await
            .unwrap();
        assert_eq!(attr.permissions.to_rwx(), "rw-------");

        assert!(vfs.chmod(&bob(), "/home/alice/f", Permissions::FILE_DEFAULT).await.is_err());
        assert!(vfs.chown(&ctx, "f", 1001, 1001).await.unwrap_err().is_permission_denied());

        let attr = vfs
            .chown(&RequestContext::root(), "/home/alice/f", 1001, 1001)
            .await
            .unwrap();
        assert_eq!((attr.owner_id, attr.group_id), (1001, 1001));
    }

    #[tokio::test]
    async fn test_create_dir_all() {
        let vfs = fs().await;
        let ctx = alice();
        let attr = vfs.create_dir_all(&ctx, "a/b/c").await.unwrap();
        assert_eq!(attr.path, "/home/alice/a/b/c");
        assert_eq!(attr.owner_id, 1000);
        // idempotent
        vfs.create_dir_all(&ctx, "a/b/c").await.unwrap();

        vfs.write_file(&ctx, "a/file", b"").await.unwrap();
        assert!(matches!(
            vfs.create_dir_all(&ctx, "a/file/x").await,
            Err(VfsError::NotADirectory(_))
        ));
        assert!(vfs.create_dir_all(&bob(), "/home/alice/z/y").await.is_err());
        assert!(!vfs.exists(&ctx, "z").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_tree() {
        let vfs = fs().await;
        let ctx = alice();
        vfs.create_dir_all(&ctx, "src/inner").await.unwrap();
        vfs.write_file(&ctx, "src/inner/f.txt", b"payload").await.unwrap();
        vfs.create_symlink(&ctx, "src/ln", "inner/f.txt").await.unwrap();

        vfs.copy_path(&ctx, "src", "/tmp/dst").await.unwrap();
        assert_eq!(vfs.read_file(&ctx, "/tmp/dst/inner/f.txt").await.unwrap(), b"payload");
        assert_eq!(vfs.read_link(&ctx, "/tmp/dst/ln").await.unwrap(), "inner/f.txt");
        // source untouched
        assert!(vfs.exists(&ctx, "src/inner/f.txt").await.unwrap());

        assert!(matches!(
            vfs.copy_path(&ctx, "src", "src/inner").await,
            Err(VfsError::InvalidPath(_))
        ));
        assert!(matches!(
            vfs.copy_path(&ctx, "src/inner/f.txt", "/tmp/dst/inner/f.txt").await,
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_move_into_directory_and_cross_mount() {
        let vfs = fs().await;
        let ctx = alice();
        vfs.create_directory(&ctx, "box").await.unwrap();
        vfs.write_file(&ctx, "item", b"1").await.unwrap();

        let attr = vfs.move_path(&ctx, "item", "box").await.unwrap();
        assert_eq!(attr.path, "/home/alice/box/item");

        let err = vfs.move_path(&ctx, "box/item", "/tmp/item").await.unwrap_err();
        assert!(matches!(err, VfsError::CrossMount { .. }));
        assert!(vfs.exists(&ctx, "box/item").await.unwrap());
    }

    #[tokio::test]
    async fn test_descriptors() {
        let vfs = fs().await;
        let ctx = alice();
        vfs.write_file(&ctx, "log", b"abc").await.unwrap();

        let fd = vfs.open_file(&ctx, "log", AccessMode::ReadWrite, false).await.unwrap();
        assert_eq!(vfs.read_fd(&ctx, fd, 2).await.unwrap(), b"ab");
        vfs.write_fd(&ctx, fd, b"XYZ").await.unwrap();
        assert_eq!(vfs.read_file(&ctx, "log").await.unwrap(), b"abXYZ");
        assert_eq!(vfs.seek_fd(&ctx, fd, 0).await.unwrap(), 0);
        assert_eq!(vfs.read_fd(&ctx, fd, 100).await.unwrap(), b"abXYZ");
        vfs.close_fd(&ctx, fd).await.unwrap();
        assert!(matches!(vfs.close_fd(&ctx, fd).await, Err(VfsError::BadDescriptor(_))));

        let app = vfs.open_file(&ctx, "log", AccessMode::Append, false).await.unwrap();
        vfs.write_file(&ctx, "log", b"12").await.unwrap();
        vfs.write_fd(&ctx, app, b"3").await.unwrap();
        assert_eq!(vfs.read_file(&ctx, "log").await.unwrap(), b"123");
        // write-only descriptors cannot read
        assert!(matches!(vfs.read_fd(&ctx, app, 1).await, Err(VfsError::BadDescriptor(_))));
    }

    #[tokio::test]
    async fn test_seek_past_size_limit_is_an_error() {
        let vfs = fs().await;
        let ctx = alice();
        vfs.write_file(&ctx, "big", b"abc").await.unwrap();
        let fd = vfs.open_file(&ctx, "big", AccessMode::Write, false).await.unwrap();

        assert!(matches!(
            vfs.seek_fd(&ctx, fd, u64::MAX).await,
            Err(VfsError::FileTooLarge(_))
        ));
        assert_eq!(vfs.seek_fd(&ctx, fd, MAX_FILE_SIZE).await.unwrap(), MAX_FILE_SIZE);
        assert!(matches!(
            vfs.write_fd(&ctx, fd, b"x").await,
            Err(VfsError::FileTooLarge(_))
        ));
        assert_eq!(vfs.read_file(&ctx, "big").await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_exclusive_lock_blocks_other_process() {
        let vfs = fs().await;
        let owner = alice().with_process_id(10);
        let other = alice().with_process_id(11);
        vfs.write_file(&owner, "locked", b"v1").await.unwrap();

        let fd = vfs.open_file(&owner, "locked", AccessMode::Write, true).await.unwrap();
        assert!(matches!(
            vfs.open_file(&other, "locked", AccessMode::Read, false).await,
            Err(VfsError::FileLocked(_))
        ));
        assert!(matches!(
            vfs.write_file(&other, "locked", b"v2").await,
            Err(VfsError::FileLocked(_))
        ));
        // descriptors are per process
        assert!(matches!(vfs.write_fd(&other, fd, b"x").await, Err(VfsError::BadDescriptor(_))));
        vfs.write_file(&owner, "locked", b"v3").await.unwrap();

        assert_eq!(vfs.release_process(&owner), 1);
        vfs.write_file(&other, "locked", b"v4").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_closes_descriptors() {
        let vfs = fs().await;
        let ctx = alice();
        vfs.write_file(&ctx, "gone", b"").await.unwrap();
        vfs.open_file(&ctx, "gone", AccessMode::Read, false).await.unwrap();
        vfs.delete(&ctx, "gone", false).await.unwrap();
        assert!(vfs.open_descriptors().is_empty());
    }

    #[tokio::test]
    async fn test_mount_admin() {
        let vfs = fs().await;
        let root = RequestContext::root();
        vfs.create_directory(&root, "/mnt/data").await.unwrap();

        assert!(vfs
            .mount(&alice(), "/mnt/data", FileSystemType::TmpFs, None, false)
            .await
            .unwrap_err()
            .is_permission_denied());
        vfs.mount(&root, "/mnt/data", FileSystemType::TmpFs, Some("size=1m"), true)
            .await
            .unwrap();
        assert!(vfs.list_mounts().iter().any(|m| m.mount_path == "/mnt/data" && m.read_only));
        assert!(matches!(
            vfs.create_file(&root, "/mnt/data/x", None).await,
            Err(VfsError::ReadOnly(_))
        ));
        assert!(vfs.delete(&root, "/mnt", true).await.is_err());

        vfs.unmount(&root, "/mnt/data").await.unwrap();
        vfs.create_file(&root, "/mnt/data/x", None).await.unwrap();
        assert!(vfs.unmount(&root, "/").await.is_err());

        let admin: Vec<_> = vfs
            .audit_entries()
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::Administrative)
            .collect();
        assert!(admin.iter().any(|e| !e.success && e.username == "alice"));
    }

    #[tokio::test]
    async fn test_failures_reach_audit_log_file() {
        let vfs = fs().await;
        let ctx = alice();
        assert!(vfs.read_file(&ctx, "missing.txt").await.is_err());

        let log = vfs
            .read_file(&RequestContext::root(), "/var/log/audit.log")
            .await
            .unwrap();
        let text = String::from_utf8(log).unwrap();
        assert!(text.contains(
            "[ERROR] Access user=alice(1000) op=read path=/home/alice/missing.txt success=false"
        ));
        assert_eq!(text.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_verify_counts() {
        let vfs = fs().await;
        let report = vfs.verify();
        assert!(report.is_clean());
        assert!(report.directories > 20);
        assert_eq!(report.symlinks, 0);
        assert!(vfs.load_report().is_none());
    }
}
