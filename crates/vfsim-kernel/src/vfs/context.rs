//! Caller identity and per-request context.
//!
//! Every facade call takes an explicit [`RequestContext`]; there is no
//! ambient "current user" or working directory.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::path;

/// Superuser id. Bypasses permission checks.
pub const ROOT_UID: u32 = 0;

/// Security identity of a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: u32,
    pub username: String,
    /// Primary group.
    pub group_id: u32,
    /// Supplementary groups.
    #[serde(default)]
    pub groups: Vec<u32>,
}

impl Identity {
    pub fn new(username: impl Into<String>, user_id: u32, group_id: u32) -> Self {
        Self {
            user_id,
            username: username.into(),
            group_id,
            groups: Vec::new(),
        }
    }

    /// The superuser.
    pub fn root() -> Self {
        Self::new("root", ROOT_UID, 0)
    }

    /// Builder: add supplementary groups.
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = u32>) -> Self {
        self.groups.extend(groups);
        self
    }

    pub fn is_superuser(&self) -> bool {
        self.user_id == ROOT_UID
    }

    /// Primary or supplementary membership.
    pub fn in_group(&self, gid: u32) -> bool {
        self.group_id == gid || self.groups.contains(&gid)
    }

    /// `/root` for the superuser, `/home/<name>` for everyone else.
    pub fn home(&self) -> String {
        if self.is_superuser() {
            "/root".to_string()
        } else {
            path::join("/home", &self.username)
        }
    }
}

/// Who is asking, from where.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: Identity,
    /// Canonical working directory for relative paths.
    pub cwd: String,
    /// Owner recorded on descriptors opened by this request.
    pub process_id: u32,
    /// Groups audit entries of one caller session.
    pub session_id: Uuid,
}

impl RequestContext {
    /// A fresh session for `identity`, starting in its home directory.
    pub fn new(identity: Identity) -> Self {
        let cwd = identity.home();
        Self {
            identity,
            cwd,
            process_id: 1,
            session_id: Uuid::new_v4(),
        }
    }

    /// A superuser session rooted at `/`.
    pub fn root() -> Self {
        Self::new(Identity::root()).with_cwd(path::ROOT)
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_process_id(mut self, pid: u32) -> Self {
        self.process_id = pid;
        self
    }

    /// Resolve a raw path for this caller.
    pub fn resolve(&self, raw: &str) -> super::VfsResult<String> {
        path::resolve(raw, &self.cwd, &self.identity.home())
    }
}
