//! Core VFS types.
//!
//! Nodes live in a flat arena keyed by [`NodeId`]. A directory owns the ids
//! of its children; a child only stores its parent's id, so the tree never
//! forms an ownership cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::error::{VfsError, VfsResult};

/// Largest file size. Blob headers store content length as a `u32`.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Arena index of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The root directory always has id 0.
    pub const ROOT: NodeId = NodeId(0);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which permission triplet applies to a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PermissionClass {
    Owner,
    Group,
    Other,
}

/// Access being requested of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// Unix permission bits: owner/group/other × r/w/x.
///
/// Always within `0..=0o777`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Permissions(u16);

impl Permissions {
    /// Highest valid value (`rwxrwxrwx`).
    pub const MAX: u16 = 0o777;
    /// Default for new regular files.
    pub const FILE_DEFAULT: Permissions = Permissions(0o644);
    /// Default for new directories.
    pub const DIR_DEFAULT: Permissions = Permissions(0o755);
    /// Symbolic links carry full permissions; access is decided by the target.
    pub const SYMLINK: Permissions = Permissions(0o777);

    /// Create from raw bits, rejecting anything above `0o777`.
    pub fn new(bits: u32) -> VfsResult<Self> {
        if bits > Self::MAX as u32 {
            return Err(VfsError::other(format!(
                "permission bits out of range: {:o}",
                bits
            )));
        }
        Ok(Self(bits as u16))
    }

    /// Create from raw bits, dropping anything above the low nine.
    pub const fn from_bits_truncate(bits: u16) -> Self {
        Self(bits & Self::MAX)
    }

    /// Raw bits.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Parse an octal string such as `"644"`, `"0644"` or `"0o644"`.
    pub fn from_octal(s: &str) -> VfsResult<Self> {
        let digits = s.trim_start_matches("0o");
        let bits = u32::from_str_radix(digits, 8)
            .map_err(|_| VfsError::other(format!("invalid octal mode: {s}")))?;
        Self::new(bits)
    }

    /// Three-digit octal form, e.g. `"644"`.
    pub fn to_octal(self) -> String {
        format!("{:03o}", self.0)
    }

    /// Parse a nine-character `rwxrwxrwx` string (`-` for unset bits).
    pub fn from_rwx(s: &str) -> VfsResult<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 9 {
            return Err(VfsError::other(format!("invalid mode string: {s}")));
        }
        let mut bits = 0u16;
        for (i, &b) in bytes.iter().enumerate() {
            let expected = b"rwx"[i % 3];
            bits <<= 1;
            if b == expected {
                bits |= 1;
            } else if b != b'-' {
                return Err(VfsError::other(format!("invalid mode string: {s}")));
            }
        }
        Ok(Self(bits))
    }

    /// `rwxrwxrwx`-style rendering.
    pub fn to_rwx(self) -> String {
        let mut out = String::with_capacity(9);
        for shift in (0..9).rev() {
            let set = self.0 & (1 << shift) != 0;
            out.push(if set { b"rwx"[2 - shift % 3] as char } else { '-' });
        }
        out
    }

    /// Whether the triplet for `class` grants `access`.
    pub fn allows(self, class: PermissionClass, access: Access) -> bool {
        let shift = match class {
            PermissionClass::Owner => 6,
            PermissionClass::Group => 3,
            PermissionClass::Other => 0,
        };
        let bit = match access {
            Access::Read => 0o4,
            Access::Write => 0o2,
            Access::Execute => 0o1,
        };
        (self.0 >> shift) & bit != 0
    }
}

impl TryFrom<u16> for Permissions {
    type Error = VfsError;

    fn try_from(bits: u16) -> VfsResult<Self> {
        Self::new(bits as u32)
    }
}

impl From<Permissions> for u16 {
    fn from(p: Permissions) -> u16 {
        p.0
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rwx())
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permissions({:#o} {})", self.0, self.to_rwx())
    }
}

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// Payload of a node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A file. With `symlink_target` set it is a symbolic link and
    /// `content` stays empty.
    File {
        content: Vec<u8>,
        mime_type: String,
        symlink_target: Option<String>,
    },
    /// A directory: child name -> child id.
    Directory { children: HashMap<String, NodeId> },
}

/// A file or directory in the tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Cached absolute path, recomputed when the node or an ancestor moves.
    pub full_path: String,
    pub parent: Option<NodeId>,
    pub owner_id: u32,
    pub group_id: u32,
    pub permissions: Permissions,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub kind: NodeKind,
}

impl Node {
    fn new(
        name: impl Into<String>,
        owner_id: u32,
        group_id: u32,
        perm: Permissions,
        kind: NodeKind,
    ) -> Self {
        let now = Utc::now();
        let size = match &kind {
            NodeKind::File { content, .. } => content.len() as u64,
            NodeKind::Directory { .. } => 0,
        };
        Self {
            id: NodeId::ROOT,
            name: name.into(),
            full_path: String::new(),
            parent: None,
            owner_id,
            group_id,
            permissions: perm,
            size,
            created_at: now,
            modified_at: now,
            accessed_at: now,
            kind,
        }
    }

    /// A detached regular file. Id, parent and path are assigned on insert.
    pub fn file(name: impl Into<String>, owner_id: u32, group_id: u32, content: Vec<u8>) -> Self {
        let name = name.into();
        let mime_type = mime_for(&name).to_string();
        Self::new(
            name,
            owner_id,
            group_id,
            Permissions::FILE_DEFAULT,
            NodeKind::File {
                content,
                mime_type,
                symlink_target: None,
            },
        )
    }

    /// A detached empty directory.
    pub fn directory(name: impl Into<String>, owner_id: u32, group_id: u32) -> Self {
        Self::new(
            name,
            owner_id,
            group_id,
            Permissions::DIR_DEFAULT,
            NodeKind::Directory {
                children: HashMap::new(),
            },
        )
    }

    /// A detached symbolic link pointing at `target`.
    pub fn symlink(
        name: impl Into<String>,
        owner_id: u32,
        group_id: u32,
        target: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            owner_id,
            group_id,
            Permissions::SYMLINK,
            NodeKind::File {
                content: Vec::new(),
                mime_type: "inode/symlink".to_string(),
                symlink_target: Some(target.into()),
            },
        )
    }

    /// Builder: override permissions.
    pub fn with_permissions(mut self, perm: Permissions) -> Self {
        self.permissions = perm;
        self
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    /// Regular file (not a symlink).
    pub fn is_file(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::File {
                symlink_target: None,
                ..
            }
        )
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink_target().is_some()
    }

    pub fn symlink_target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { symlink_target, .. } => symlink_target.as_deref(),
            NodeKind::Directory { .. } => None,
        }
    }

    pub fn file_type(&self) -> FileType {
        match &self.kind {
            NodeKind::Directory { .. } => FileType::Directory,
            NodeKind::File {
                symlink_target: Some(_),
                ..
            } => FileType::Symlink,
            NodeKind::File { .. } => FileType::File,
        }
    }

    /// File content, or `None` for directories.
    pub fn content(&self) -> Option<&[u8]> {
        match &self.kind {
            NodeKind::File { content, .. } => Some(content),
            NodeKind::Directory { .. } => None,
        }
    }

    pub fn children(&self) -> Option<&HashMap<String, NodeId>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { mime_type, .. } => Some(mime_type),
            NodeKind::Directory { .. } => None,
        }
    }

    /// Snapshot of this node's metadata.
    pub fn attr(&self) -> FileAttr {
        FileAttr {
            path: self.full_path.clone(),
            name: self.name.clone(),
            kind: self.file_type(),
            size: self.size,
            permissions: self.permissions,
            owner_id: self.owner_id,
            group_id: self.group_id,
            created_at: self.created_at,
            modified_at: self.modified_at,
            accessed_at: self.accessed_at,
            mime_type: self.mime_type().map(str::to_string),
            symlink_target: self.symlink_target().map(str::to_string),
        }
    }
}

/// File attributes (metadata) as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttr {
    pub path: String,
    pub name: String,
    pub kind: FileType,
    pub size: u64,
    pub permissions: Permissions,
    pub owner_id: u32,
    pub group_id: u32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub mime_type: Option<String>,
    pub symlink_target: Option<String>,
}

impl FileAttr {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Descriptor access mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
    Append,
}

impl AccessMode {
    pub fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// Guess a MIME type from a file name's extension.
pub fn mime_for(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return "application/octet-stream",
    };
    match ext.as_str() {
        "txt" | "log" | "conf" | "cfg" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "sh" => "application/x-sh",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_octal_and_rwx() {
        let p = Permissions::from_octal("640").unwrap();
        assert_eq!(p.bits(), 0o640);
        assert_eq!(p.to_octal(), "640");
        assert_eq!(p.to_rwx(), "rw-r-----");
        assert_eq!(Permissions::from_rwx("rw-r-----").unwrap(), p);

        assert_eq!(Permissions::from_octal("0o755").unwrap().to_rwx(), "rwxr-xr-x");
        assert_eq!(Permissions::from_bits_truncate(0).to_rwx(), "---------");
        assert_eq!(Permissions::from_bits_truncate(0o777).to_rwx(), "rwxrwxrwx");
    }

    #[test]
    fn test_permissions_range() {
        assert!(Permissions::new(0o777).is_ok());
        assert!(Permissions::new(512).is_err());
        assert!(Permissions::from_octal("1777").is_err());
        assert!(Permissions::from_octal("9").is_err());
        assert!(Permissions::from_rwx("rwxrwx").is_err());
        assert!(Permissions::from_rwx("rwxrwxrwz").is_err());
        assert_eq!(Permissions::from_bits_truncate(0o1777).bits(), 0o777);
    }

    #[test]
    fn test_permissions_allows() {
        let p = Permissions::from_bits_truncate(0o640);
        assert!(p.allows(PermissionClass::Owner, Access::Read));
        assert!(p.allows(PermissionClass::Owner, Access::Write));
        assert!(!p.allows(PermissionClass::Owner, Access::Execute));
        assert!(p.allows(PermissionClass::Group, Access::Read));
        assert!(!p.allows(PermissionClass::Group, Access::Write));
        assert!(!p.allows(PermissionClass::Other, Access::Read));
    }

    #[test]
    fn test_node_constructors() {
        let file = Node::file("notes.txt", 1000, 1000, b"hi".to_vec());
        assert!(file.is_file());
        assert_eq!(file.size, 2);
        assert_eq!(file.mime_type(), Some("text/plain"));
        assert_eq!(file.file_type(), FileType::File);

        let dir = Node::directory("docs", 1000, 1000);
        assert!(dir.is_dir());
        assert_eq!(dir.permissions, Permissions::DIR_DEFAULT);

        let link = Node::symlink("latest", 1000, 1000, "/var/log/audit.log");
        assert!(link.is_symlink());
        assert!(!link.is_file());
        assert_eq!(link.file_type(), FileType::Symlink);
        assert_eq!(link.attr().symlink_target.as_deref(), Some("/var/log/audit.log"));
    }

    #[test]
    fn test_access_mode() {
        assert!(AccessMode::Read.reads());
        assert!(!AccessMode::Read.writes());
        assert!(AccessMode::ReadWrite.reads() && AccessMode::ReadWrite.writes());
        assert!(!AccessMode::Append.reads());
        assert_eq!("readwrite".parse::<AccessMode>().unwrap(), AccessMode::ReadWrite);
    }

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for("index.HTML"), "text/html");
        assert_eq!(mime_for(".bashrc"), "application/octet-stream");
        assert_eq!(mime_for("Makefile"), "application/octet-stream");
    }
}
