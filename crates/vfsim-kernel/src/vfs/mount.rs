//! VFS mount table with longest-prefix routing.
//!
//! Maps canonical path prefixes to the filesystem type backing them. The
//! table is read-mostly; the facade only changes it while holding the tree
//! write lock, so mount changes are serialized with structural writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{VfsError, VfsResult};
use super::path;

/// Kind of filesystem attached at a mount point.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileSystemType {
    /// Durable root filesystem.
    RootFs,
    /// Scratch space.
    TmpFs,
    /// Process information stubs.
    ProcFs,
    /// Inert device stubs.
    DevFs,
}

/// Information about a mount point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountPoint {
    /// Canonical mount path (e.g., "/tmp").
    pub mount_path: String,
    pub fs_type: FileSystemType,
    /// Free-form option string, e.g. `"nosuid,nodev"`.
    pub options: String,
    pub read_only: bool,
    pub mounted_at: DateTime<Utc>,
}

impl MountPoint {
    /// Create a mount point description mounted now.
    pub fn new(mount_path: impl Into<String>, fs_type: FileSystemType, read_only: bool) -> Self {
        Self {
            mount_path: mount_path.into(),
            fs_type,
            options: if read_only { "ro" } else { "rw" }.to_string(),
            read_only,
            mounted_at: Utc::now(),
        }
    }

    /// Builder: set the option string.
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }
}

/// Routes paths to mount points.
///
/// Mount points are matched by longest prefix. For example, if `/` and
/// `/tmp` are both mounted, `/tmp/build/out.o` belongs to the `/tmp` mount.
/// The root mount always exists.
#[derive(Debug, Clone)]
pub struct MountTable {
    /// Mount points, keyed by canonical path.
    mounts: BTreeMap<String, MountPoint>,
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    /// Create a table holding only a writable root filesystem.
    pub fn new() -> Self {
        let mut mounts = BTreeMap::new();
        mounts.insert(
            path::ROOT.to_string(),
            MountPoint::new(path::ROOT, FileSystemType::RootFs, false),
        );
        Self { mounts }
    }

    /// Standard layout: `/` rootfs, `/tmp` tmpfs, `/proc` and `/dev` read-only.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        for mp in [
            MountPoint::new("/tmp", FileSystemType::TmpFs, false).with_options("rw,nosuid,nodev"),
            MountPoint::new("/proc", FileSystemType::ProcFs, true),
            MountPoint::new("/dev", FileSystemType::DevFs, true),
        ] {
            table.mounts.insert(mp.mount_path.clone(), mp);
        }
        table
    }

    /// Add a mount point.
    ///
    /// Fails if something is already mounted at the same canonical path.
    pub fn mount(&mut self, mut mp: MountPoint) -> VfsResult<()> {
        mp.mount_path = path::normalize(&mp.mount_path)?;
        if self.mounts.contains_key(&mp.mount_path) {
            return Err(VfsError::already_exists(mp.mount_path));
        }
        tracing::debug!(path = %mp.mount_path, fs_type = %mp.fs_type, "mounted");
        self.mounts.insert(mp.mount_path.clone(), mp);
        Ok(())
    }

    /// Remove the mount at `mount_path`. The root cannot be unmounted.
    pub fn unmount(&mut self, mount_path: &str) -> VfsResult<MountPoint> {
        let mount_path = path::normalize(mount_path)?;
        if mount_path == path::ROOT {
            return Err(VfsError::invalid_path("cannot unmount /"));
        }
        let removed = self
            .mounts
            .remove(&mount_path)
            .ok_or_else(|| VfsError::not_found(mount_path.clone()))?;
        tracing::debug!(path = %mount_path, "unmounted");
        Ok(removed)
    }

    /// Find the mount owning a canonical path.
    pub fn find(&self, canonical: &str) -> &MountPoint {
        self.mounts
            .iter()
            .filter(|(prefix, _)| path::is_within(canonical, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, mp)| mp)
            .unwrap_or_else(|| self.root())
    }

    fn root(&self) -> &MountPoint {
        // The root entry is inserted by every constructor and never removed.
        &self.mounts[path::ROOT]
    }

    /// Filesystem type backing a canonical path.
    pub fn fs_type(&self, canonical: &str) -> FileSystemType {
        self.find(canonical).fs_type
    }

    /// True if the path lives on a read-only mount.
    pub fn is_read_only(&self, canonical: &str) -> bool {
        self.find(canonical).read_only
    }

    /// True if `canonical` is itself a mount point.
    pub fn is_mount_point(&self, canonical: &str) -> bool {
        self.mounts.contains_key(canonical)
    }

    /// True if any mount point lies strictly beneath `canonical`.
    pub fn has_mounts_below(&self, canonical: &str) -> bool {
        self.mounts
            .keys()
            .any(|p| p != canonical && path::is_within(p, canonical))
    }

    /// Fail with `CrossMount` unless both paths sit on the same filesystem type.
    pub fn check_same_type(&self, from: &str, to: &str) -> VfsResult<()> {
        if self.fs_type(from) != self.fs_type(to) {
            return Err(VfsError::CrossMount {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// List all current mounts, ordered by path.
    pub fn list(&self) -> Vec<MountPoint> {
        self.mounts.values().cloned().collect()
    }
}
