//! First-run seeding of the standard hierarchy.

use super::context::Identity;
use super::error::{VfsError, VfsResult};
use super::path;
use super::store::NodeStore;
use super::types::{Node, NodeId, Permissions};

/// Root-owned 755 directories created on first run.
pub const STANDARD_DIRS: &[&str] = &[
    "/bin",
    "/boot",
    "/dev",
    "/etc",
    "/home",
    "/lib",
    "/media",
    "/mnt",
    "/opt",
    "/proc",
    "/sbin",
    "/srv",
    "/sys",
    "/usr",
    "/usr/bin",
    "/usr/lib",
    "/usr/local",
    "/usr/share",
    "/var",
    "/var/log",
    "/var/mail",
];

/// Seed an empty tree.
///
/// Creates the standard directories, the default user's home, the audit
/// log file and a few inert stubs. Existing nodes are left alone, so
/// seeding twice is harmless.
pub fn seed(store: &mut NodeStore, user: &Identity, audit_path: &str) -> VfsResult<()> {
    let mode = |bits: u32| Permissions::new(bits);

    for dir in STANDARD_DIRS {
        ensure_dir(store, dir, 0, 0, mode(0o755)?)?;
    }
    ensure_dir(store, "/root", 0, 0, mode(0o700)?)?;
    ensure_dir(store, "/tmp", 0, 0, mode(0o777)?)?;
    ensure_dir(store, "/var/tmp", 0, 0, mode(0o777)?)?;
    if !user.is_superuser() {
        ensure_dir(store, &user.home(), user.user_id, user.group_id, mode(0o755)?)?;
    }

    let (log_dir, _) =
        path::split_parent(audit_path).ok_or_else(|| VfsError::invalid_path(audit_path))?;
    create_dir_all(store, log_dir)?;
    ensure_file(store, audit_path, Vec::new(), mode(0o640)?)?;

    ensure_file(store, "/dev/null", Vec::new(), mode(0o666)?)?;
    ensure_file(store, "/dev/zero", Vec::new(), mode(0o666)?)?;
    ensure_file(store, "/etc/hostname", b"vfsim\n".to_vec(), mode(0o644)?)?;

    tracing::info!(nodes = store.len(), user = %user.username, "seeded standard hierarchy");
    Ok(())
}

/// Root-owned `mkdir -p`.
pub(crate) fn create_dir_all(store: &mut NodeStore, canonical: &str) -> VfsResult<()> {
    let mut current = String::from(path::ROOT);
    for segment in path::segments(canonical) {
        current = path::join(&current, segment);
        ensure_dir(store, &current, 0, 0, Permissions::DIR_DEFAULT)?;
    }
    Ok(())
}

fn ensure_dir(
    store: &mut NodeStore,
    canonical: &str,
    uid: u32,
    gid: u32,
    perm: Permissions,
) -> VfsResult<NodeId> {
    match store.lookup(canonical) {
        Ok(node) if node.is_dir() => return Ok(node.id),
        Ok(_) => return Err(VfsError::not_a_directory(canonical)),
        Err(VfsError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    let (parent, name) =
        path::split_parent(canonical).ok_or_else(|| VfsError::invalid_path(canonical))?;
    store.insert(parent, Node::directory(name, uid, gid).with_permissions(perm))
}

fn ensure_file(
    store: &mut NodeStore,
    canonical: &str,
    content: Vec<u8>,
    perm: Permissions,
) -> VfsResult<()> {
    if store.lookup(canonical).is_ok() {
        return Ok(());
    }
    let (parent, name) =
        path::split_parent(canonical).ok_or_else(|| VfsError::invalid_path(canonical))?;
    store.insert(parent, Node::file(name, 0, 0, content).with_permissions(perm))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::audit::DEFAULT_AUDIT_PATH;

    #[test]
    fn test_seed_layout() {
        let mut store = NodeStore::new();
        let alice = Identity::new("alice", 1000, 1000);
        seed(&mut store, &alice, DEFAULT_AUDIT_PATH).unwrap();

        for dir in STANDARD_DIRS {
            assert!(store.lookup(dir).unwrap().is_dir(), "{dir}");
        }
        let home = store.lookup("/home/alice").unwrap();
        assert_eq!((home.owner_id, home.group_id), (1000, 1000));
        assert_eq!(store.lookup("/root").unwrap().permissions.bits(), 0o700);
        assert_eq!(store.lookup("/tmp").unwrap().permissions.bits(), 0o777);
        assert_eq!(store.lookup("/var/tmp").unwrap().permissions.bits(), 0o777);

        let log = store.lookup(DEFAULT_AUDIT_PATH).unwrap();
        assert_eq!(log.owner_id, 0);
        assert_eq!(log.permissions.bits(), 0o640);
        assert!(store.lookup("/dev/null").unwrap().is_file());
    }

    #[test]
    fn test_seed_is_idempotent() {
        let mut store = NodeStore::new();
        let alice = Identity::new("alice", 1000, 1000);
        seed(&mut store, &alice, DEFAULT_AUDIT_PATH).unwrap();
        let count = store.len();
        seed(&mut store, &alice, DEFAULT_AUDIT_PATH).unwrap();
        assert_eq!(store.len(), count);
    }

    #[test]
    fn test_custom_audit_location() {
        let mut store = NodeStore::new();
        seed(&mut store, &Identity::root(), "/srv/audit/trail.log").unwrap();
        assert!(store.lookup("/srv/audit").unwrap().is_dir());
        assert!(store.lookup("/srv/audit/trail.log").unwrap().is_file());
    }
}
