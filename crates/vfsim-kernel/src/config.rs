//! Filesystem configuration.
//!
//! Loaded from RON. Every field has a default, so an empty `()` document
//! is a valid config:
//!
//! ```ron
//! (
//!     default_user: (name: "alice", uid: 1000, gid: 1000),
//!     database_path: Some("~/.local/share/vfsim/fs.db"),
//!     persistence: Checkpoint,
//!     checkpoint_interval_secs: 10,
//!     minimum_severity: Information,
//!     mounts: [(path: "/mnt/scratch", fs_type: tmpfs)],
//! )
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::vfs::{
    DEFAULT_AUDIT_CAPACITY, DEFAULT_AUDIT_PATH, DEFAULT_MAX_HOPS, FileSystemType, Identity,
    MountPoint, Severity,
};

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// When the tree is written to durable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PersistenceMode {
    /// Save after every successful mutation.
    #[default]
    Sync,
    /// Save in the background when dirty.
    Checkpoint,
    /// Never save.
    Disabled,
}

/// User whose home directory is seeded on first run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: "user".to_string(),
            uid: 1000,
            gid: 1000,
        }
    }
}

impl UserConfig {
    pub fn identity(&self) -> Identity {
        Identity::new(&self.name, self.uid, self.gid)
    }
}

/// An extra mount point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountConfig {
    pub path: String,
    pub fs_type: FileSystemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl MountConfig {
    pub fn to_mount_point(&self) -> MountPoint {
        let mp = MountPoint::new(&self.path, self.fs_type, self.read_only);
        match &self.options {
            Some(options) => mp.with_options(options),
            None => mp,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    pub default_user: UserConfig,
    /// SQLite file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    pub persistence: PersistenceMode,
    pub checkpoint_interval_secs: u64,
    pub save_retries: u32,
    pub retry_backoff_ms: u64,
    pub audit_log_path: String,
    pub audit_buffer_capacity: usize,
    pub minimum_severity: Severity,
    pub max_symlink_hops: usize,
    pub mounts: Vec<MountConfig>,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            default_user: UserConfig::default(),
            database_path: None,
            persistence: PersistenceMode::Sync,
            checkpoint_interval_secs: 30,
            save_retries: 3,
            retry_backoff_ms: 25,
            audit_log_path: DEFAULT_AUDIT_PATH.to_string(),
            audit_buffer_capacity: DEFAULT_AUDIT_CAPACITY,
            minimum_severity: Severity::Warning,
            max_symlink_hops: DEFAULT_MAX_HOPS,
            mounts: Vec::new(),
        }
    }
}

impl VfsConfig {
    /// Read and parse a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_ron_str(&text)
    }

    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// Builder: use a database file.
    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_persistence(mut self, mode: PersistenceMode) -> Self {
        self.persistence = mode;
        self
    }

    /// Database path with a leading `~` expanded.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .as_ref()
            .map(|p| PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned()))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
