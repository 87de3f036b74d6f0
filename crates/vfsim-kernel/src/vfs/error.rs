//! VFS error types.

use std::io;
use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Path string could not be normalized (forbidden character, empty input).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// A sibling with the same name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Symlink resolution exceeded its hop limit.
    #[error("too many levels of symbolic links: {path} ({hops} hops)")]
    SymlinkLoop { path: String, hops: usize },

    /// File is held by an exclusive descriptor.
    #[error("file is locked: {0}")]
    FileLocked(String),

    /// Stored content failed checksum verification.
    #[error("content corrupted: {0}")]
    Corruption(String),

    /// Source and destination live on different filesystem types.
    #[error("cross-mount move: {from} -> {to}")]
    CrossMount { from: String, to: String },

    /// Target lives on a read-only mount.
    #[error("read-only filesystem: {0}")]
    ReadOnly(String),

    /// File name too long.
    #[error("file name too long: {0}")]
    NameTooLong(String),

    /// Unknown descriptor, wrong owner, or wrong access mode.
    #[error("bad file descriptor: {0}")]
    BadDescriptor(u64),

    /// Write or seek would grow a file past `MAX_FILE_SIZE`.
    #[error("file too large: {0}")]
    FileTooLarge(String),

    /// Not a symbolic link.
    #[error("not a symbolic link: {0}")]
    NotASymlink(String),

    /// The save did not reach durable storage; the in-memory change stands.
    #[error("changes not persisted: {0}")]
    Durability(String),

    /// Embedded store failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Snapshot encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a ReadOnly error.
    pub fn read_only(path: impl Into<String>) -> Self {
        Self::ReadOnly(path.into())
    }

    /// Create a FileTooLarge error.
    pub fn file_too_large(what: impl Into<String>) -> Self {
        Self::FileTooLarge(what.into())
    }

    /// Create a Codec error.
    pub fn codec(msg: impl std::fmt::Display) -> Self {
        Self::Codec(msg.to_string())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Returns true for a permission denial.
    ///
    /// Denials are audited by the permission engine at decision time, so
    /// callers use this to avoid recording the same failure twice.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// Returns true for a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_path() {
        let err = VfsError::not_found("/home/alice/missing.txt");
        assert_eq!(err.to_string(), "not found: /home/alice/missing.txt");

        let err = VfsError::SymlinkLoop {
            path: "/a".into(),
            hops: 41,
        };
        assert!(err.to_string().contains("41 hops"));
    }

    #[test]
    fn test_classification() {
        assert!(VfsError::permission_denied("/etc").is_permission_denied());
        assert!(!VfsError::not_found("/etc").is_permission_denied());
        assert!(VfsError::not_found("/etc").is_not_found());
    }
}
