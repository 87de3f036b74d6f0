//! # vfsim-kernel
//!
//! The filesystem core of the vfsim OS simulator.
//!
//! Everything a simulated shell or program touches goes through one
//! [`VirtualFileSystem`]:
//! - a Unix-like tree with owners, groups and `rwx` permission bits
//! - symbolic links with loop detection
//! - mount points, some of them read-only
//! - file descriptors with optional exclusive locks
//! - a persistent audit trail, itself a file in the tree
//! - checksummed persistence to SQLite that survives partial corruption

pub mod config;
pub mod vfs;

pub use config::{ConfigError, MountConfig, PersistenceMode, UserConfig, VfsConfig};
pub use vfs::{
    AccessMode, AuditEventType, AuditLogEntry, ChangeType, DirEntry, FileAttr, FileSystemType,
    FileType, FsEvent, FsckReport, Identity, MountPoint, Permissions, RequestContext, Severity,
    VfsError, VfsResult, VirtualFileSystem,
};
