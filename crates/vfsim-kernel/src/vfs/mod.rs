//! Virtual filesystem.
//!
//! A Unix-like tree of files, directories and symlinks kept in memory and
//! persisted to SQLite. Key components:
//!
//! - [`VirtualFileSystem`] - the facade every caller goes through
//! - [`NodeStore`] - arena of nodes, exact lookups only
//! - [`SymlinkResolver`] - turns a canonical path into a concrete one
//! - [`PermissionEngine`] - owner/group/other checks, superuser bypass
//! - [`FileDescriptorTable`] - open handles and exclusive locks
//! - [`MountTable`] - longest-prefix mount routing, read-only enforcement
//! - [`PersistenceLayer`] - checksummed generations over a [`SnapshotStore`]
//! - [`AuditLogger`] - security trail, mirrored into a log file in the tree
//!
//! ## Design Decisions
//!
//! - **Arena, not pointers**: nodes refer to each other by [`NodeId`], so
//!   the tree has a single owner and no reference cycles.
//! - **Authorize first**: a denied call never touches the tree.
//! - **Sync core, async edges**: tree work happens under a short lock;
//!   only persistence awaits.

mod audit;
mod bootstrap;
mod context;
mod descriptors;
mod error;
mod events;
mod filesystem;
mod mount;
pub mod path;
mod permissions;
pub mod persist;
mod store;
mod symlink;
mod types;

pub use audit::{
    AuditEventType, AuditLogEntry, AuditLogger, DEFAULT_AUDIT_PATH,
    DEFAULT_CAPACITY as DEFAULT_AUDIT_CAPACITY, Severity,
};
pub use bootstrap::STANDARD_DIRS;
pub use context::{Identity, ROOT_UID, RequestContext};
pub use descriptors::{FdId, FileDescriptor, FileDescriptorTable};
pub use error::{VfsError, VfsResult};
pub use events::{ChangeType, EventBus, FsEvent, Subscription};
pub use filesystem::{FsckReport, VirtualFileSystem};
pub use mount::{FileSystemType, MountPoint, MountTable};
pub use permissions::{Decision, PermissionEngine};
pub use persist::{LoadReport, PersistenceLayer, SnapshotStore, SqliteStore};
pub use store::NodeStore;
pub use symlink::{DEFAULT_MAX_HOPS, SymlinkResolver};
pub use types::{
    Access, AccessMode, DirEntry, FileAttr, FileType, MAX_FILE_SIZE, Node, NodeId, NodeKind,
    PermissionClass, Permissions,
};
