//! Owner/group/other permission checks.
//!
//! The superuser (uid 0) bypasses every check. This is the single most
//! dangerous rule in the filesystem and it lives here and nowhere else.
//!
//! Every decision is reported to the [`AuditLogger`]: `Information` when
//! allowed, `Warning` when denied. Allowed access to the audit log itself is
//! not reported; denials on it always are.

use std::sync::Arc;

use super::audit::{AuditEventType, AuditLogEntry, AuditLogger, Severity};
use super::context::Identity;
use super::error::{VfsError, VfsResult};
use super::types::{Access, Node, PermissionClass};

/// Outcome of a permission evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Evaluates access requests and reports them to the audit trail.
#[derive(Debug, Clone)]
pub struct PermissionEngine {
    audit: Arc<AuditLogger>,
}

impl PermissionEngine {
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self { audit }
    }

    /// Triplet that applies to `who` for `node`.
    ///
    /// Ownership wins over group membership, which wins over "other".
    pub fn class_for(node: &Node, who: &Identity) -> PermissionClass {
        if node.owner_id == who.user_id {
            PermissionClass::Owner
        } else if who.in_group(node.group_id) {
            PermissionClass::Group
        } else {
            PermissionClass::Other
        }
    }

    /// Pure evaluation, no audit.
    pub fn evaluate(node: &Node, who: &Identity, access: Access) -> Decision {
        if who.is_superuser() {
            return Decision::Allowed;
        }
        let class = Self::class_for(node, who);
        if node.permissions.allows(class, access) {
            Decision::Allowed
        } else {
            Decision::Denied(format!(
                "{class} lacks {access} on {} ({})",
                node.full_path, node.permissions
            ))
        }
    }

    /// Check `access` on `node` for `who`, audited as `Access`.
    pub fn check_access(
        &self,
        node: &Node,
        who: &Identity,
        access: Access,
        operation: &str,
    ) -> VfsResult<()> {
        let decision = Self::evaluate(node, who, access);
        self.report(&node.full_path, who, AuditEventType::Access, operation, &decision, |e| {
            e.with_context("access", access)
        });
        match decision {
            Decision::Allowed => Ok(()),
            Decision::Denied(_) => Err(VfsError::permission_denied(node.full_path.clone())),
        }
    }

    /// Check whether `who` may change `node`'s mode or ownership.
    ///
    /// Mode changes are open to the owner; ownership changes only to the
    /// superuser. Audited as `PermissionChange`.
    pub fn check_change(
        &self,
        node: &Node,
        who: &Identity,
        operation: &str,
        superuser_only: bool,
    ) -> VfsResult<()> {
        let decision = if who.is_superuser() || (!superuser_only && node.owner_id == who.user_id) {
            Decision::Allowed
        } else if superuser_only {
            Decision::Denied(format!("{operation} on {} requires superuser", node.full_path))
        } else {
            Decision::Denied(format!(
                "{} is not the owner of {}",
                who.username, node.full_path
            ))
        };
        self.report(
            &node.full_path,
            who,
            AuditEventType::PermissionChange,
            operation,
            &decision,
            |e| e.with_context("mode", node.permissions.to_octal()),
        );
        match decision {
            Decision::Allowed => Ok(()),
            Decision::Denied(_) => Err(VfsError::permission_denied(node.full_path.clone())),
        }
    }

    /// Superuser-only administrative actions such as mounting.
    pub fn check_admin(&self, who: &Identity, path: &str, operation: &str) -> VfsResult<()> {
        let decision = if who.is_superuser() {
            Decision::Allowed
        } else {
            Decision::Denied(format!("{operation} requires superuser"))
        };
        self.report(path, who, AuditEventType::Administrative, operation, &decision, |e| e);
        match decision {
            Decision::Allowed => Ok(()),
            Decision::Denied(_) => Err(VfsError::permission_denied(path)),
        }
    }

    fn report(
        &self,
        path: &str,
        who: &Identity,
        event_type: AuditEventType,
        operation: &str,
        decision: &Decision,
        decorate: impl FnOnce(AuditLogEntry) -> AuditLogEntry,
    ) {
        if decision.is_allowed() && self.audit.is_audit_path(path) {
            return;
        }
        let severity = if decision.is_allowed() {
            Severity::Information
        } else {
            Severity::Warning
        };
        let mut entry = decorate(AuditLogEntry::new(who, event_type, severity, path, operation));
        if who.is_superuser() {
            entry = entry.with_context("superuser", true);
        }
        if let Decision::Denied(reason) = decision {
            tracing::debug!(user = %who.username, path = %path, %reason, "permission denied");
            entry = entry.failed(reason.clone());
        }
        self.audit.log(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::audit::DEFAULT_AUDIT_PATH;
    use crate::vfs::types::Permissions;

    const STAFF: u32 = 50;

    fn alice_file(mode: u32) -> Node {
        let mut node = Node::file("report.txt", 1000, STAFF, b"q3".to_vec())
            .with_permissions(Permissions::new(mode).unwrap());
        node.full_path = "/home/alice/report.txt".to_string();
        node
    }

    fn engine() -> (PermissionEngine, Arc<AuditLogger>) {
        let audit = Arc::new(AuditLogger::new(64, Severity::Warning, DEFAULT_AUDIT_PATH));
        (PermissionEngine::new(audit.clone()), audit)
    }

    #[test]
    fn test_class_selection() {
        let node = alice_file(0o640);
        let alice = Identity::new("alice", 1000, 1000);
        let carol = Identity::new("carol", 1002, 1002).with_groups([STAFF]);
        let bob = Identity::new("bob", 1001, 1001);
        assert_eq!(PermissionEngine::class_for(&node, &alice), PermissionClass::Owner);
        assert_eq!(PermissionEngine::class_for(&node, &carol), PermissionClass::Group);
        assert_eq!(PermissionEngine::class_for(&node, &bob), PermissionClass::Other);
    }

    #[test]
    fn test_mode_640() {
        let node = alice_file(0o640);
        let alice = Identity::new("alice", 1000, 1000);
        let carol = Identity::new("carol", 1002, STAFF);
        let bob = Identity::new("bob", 1001, 1001);

        assert!(PermissionEngine::evaluate(&node, &alice, Access::Write).is_allowed());
        assert!(PermissionEngine::evaluate(&node, &carol, Access::Read).is_allowed());
        assert!(!PermissionEngine::evaluate(&node, &carol, Access::Write).is_allowed());
        assert!(!PermissionEngine::evaluate(&node, &bob, Access::Read).is_allowed());
    }

    #[test]
    fn test_owner_bits_do_not_fall_through() {
        // owner has nothing, others have everything: the owner is still denied
        let node = alice_file(0o007);
        let alice = Identity::new("alice", 1000, 1000);
        assert!(!PermissionEngine::evaluate(&node, &alice, Access::Read).is_allowed());
    }

    #[test]
    fn test_superuser_bypass() {
        let node = alice_file(0o000);
        assert!(PermissionEngine::evaluate(&node, &Identity::root(), Access::Write).is_allowed());
    }

    #[test]
    fn test_other_never_gains_owner_bits() {
        let stranger = Identity::new("mallory", 4242, 4242);
        for bits in 0..=0o777u32 {
            let node = alice_file(bits);
            let perm = node.permissions;
            for access in [Access::Read, Access::Write, Access::Execute] {
                let allowed = PermissionEngine::evaluate(&node, &stranger, access).is_allowed();
                assert_eq!(allowed, perm.allows(PermissionClass::Other, access), "mode {bits:o}");
            }
        }
    }

    #[test]
    fn test_denial_logged_once_as_warning() {
        let (engine, audit) = engine();
        let node = alice_file(0o640);
        let bob = Identity::new("bob", 1001, 1001);

        let err = engine
            .check_access(&node, &bob, Access::Write, "write")
            .unwrap_err();
        assert!(err.is_permission_denied());

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Warning);
        assert!(!entries[0].success);
        assert_eq!(entries[0].event_type, AuditEventType::Access);
        assert_eq!(audit.take_pending().len(), 1);
    }

    #[test]
    fn test_allow_logged_as_information() {
        let (engine, audit) = engine();
        let node = alice_file(0o640);
        engine
            .check_access(&node, &Identity::root(), Access::Read, "read")
            .unwrap();
        let entries = audit.entries();
        assert_eq!(entries[0].severity, Severity::Information);
        assert_eq!(entries[0].context["superuser"], "true");
        // below threshold, not queued for the log file
        assert!(audit.take_pending().is_empty());
    }

    #[test]
    fn test_audit_log_denials_still_reported() {
        let (engine, audit) = engine();
        let mut node = alice_file(0o640);
        node.full_path = DEFAULT_AUDIT_PATH.to_string();
        let alice = Identity::new("alice", 1000, 1000);
        let bob = Identity::new("bob", 1001, 1001);

        assert!(engine.check_access(&node, &alice, Access::Read, "read").is_ok());
        assert!(audit.is_empty());

        assert!(engine.check_access(&node, &bob, Access::Write, "write").is_err());
        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Warning);
        assert!(!entries[0].success);
    }

    #[test]
    fn test_change_rules() {
        let (engine, audit) = engine();
        let node = alice_file(0o640);
        let alice = Identity::new("alice", 1000, 1000);
        let bob = Identity::new("bob", 1001, 1001);

        assert!(engine.check_change(&node, &alice, "chmod", false).is_ok());
        assert!(engine.check_change(&node, &bob, "chmod", false).is_err());
        assert!(engine.check_change(&node, &alice, "chown", true).is_err());
        assert!(engine.check_change(&node, &Identity::root(), "chown", true).is_ok());

        let entries = audit.entries();
        assert!(entries.iter().all(|e| e.event_type == AuditEventType::PermissionChange));
        assert_eq!(entries.iter().filter(|e| !e.success).count(), 2);
    }

    #[test]
    fn test_admin_requires_superuser() {
        let (engine, audit) = engine();
        let alice = Identity::new("alice", 1000, 1000);
        assert!(engine.check_admin(&alice, "/mnt", "mount").unwrap_err().is_permission_denied());
        assert!(engine.check_admin(&Identity::root(), "/mnt", "mount").is_ok());
        let entries = audit.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.event_type == AuditEventType::Administrative));
    }
}
