//! Security audit trail.
//!
//! Entries land in three places:
//!
//! - a bounded in-memory ring buffer (oldest evicted first),
//! - a broadcast channel for live observers (every entry),
//! - a FIFO queue of lines waiting to be appended to the persisted audit
//!   log. Only entries at or above the minimum severity, plus every
//!   failure, are queued.
//!
//! The logger never writes the audit file itself. The facade drains the
//! queue into the file through its own bypass path, which keeps a single
//! global order: two events from one session are never persisted out of
//! order.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Write as _};
use tokio::sync::broadcast;

use super::context::Identity;

/// Default persisted log location inside the VFS.
pub const DEFAULT_AUDIT_PATH: &str = "/var/log/audit.log";

/// Default ring buffer size.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Category of an audited event.
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
pub enum AuditEventType {
    Access,
    Modification,
    PermissionChange,
    Authentication,
    Quota,
    Policy,
    Configuration,
    Administrative,
}

/// Severity, ordered from least to most severe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Severity {
    Information,
    Warning,
    Error,
    Critical,
}

/// One audited event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub username: String,
    pub user_id: u32,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub path: String,
    pub operation: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl AuditLogEntry {
    /// A successful event attributed to `who`.
    pub fn new(
        who: &Identity,
        event_type: AuditEventType,
        severity: Severity,
        path: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            username: who.username.clone(),
            user_id: who.user_id,
            event_type,
            severity,
            path: path.into(),
            operation: operation.into(),
            success: true,
            failure_reason: None,
            context: BTreeMap::new(),
        }
    }

    /// Mark as failed with a reason.
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.success = false;
        self.failure_reason = Some(reason.into());
        self
    }

    /// Attach a context key/value.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }
}

/// Writes a field with control characters escaped (`\n`, `\u{1b}`) so one
/// entry is always exactly one line.
struct Field<'a>(&'a str);

impl fmt::Display for Field<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                c if c.is_control() => write!(f, "{}", c.escape_default())?,
                c => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for AuditLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} user={}({}) op={} path={} success={} reason=\"{}\"",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.severity,
            self.event_type,
            Field(&self.username),
            self.user_id,
            Field(&self.operation),
            Field(&self.path),
            self.success,
            Field(&self.failure_reason.as_deref().unwrap_or("-").replace('"', "'")),
        )?;
        for (key, value) in &self.context {
            write!(f, " {}={}", Field(key), Field(value))?;
        }
        Ok(())
    }
}

/// Records audit entries.
#[derive(Debug)]
pub struct AuditLogger {
    minimum_severity: Severity,
    capacity: usize,
    audit_path: String,
    ring: Mutex<VecDeque<AuditLogEntry>>,
    pending: Mutex<VecDeque<AuditLogEntry>>,
    tx: broadcast::Sender<AuditLogEntry>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, Severity::Warning, DEFAULT_AUDIT_PATH)
    }
}

impl AuditLogger {
    pub fn new(capacity: usize, minimum_severity: Severity, audit_path: impl Into<String>) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            minimum_severity,
            capacity,
            audit_path: audit_path.into(),
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            pending: Mutex::new(VecDeque::new()),
            tx,
        }
    }

    /// Canonical path of the persisted log.
    pub fn audit_path(&self) -> &str {
        &self.audit_path
    }

    /// True for the audit log's own path. Successful operations on it are
    /// not audited; denials and failures are.
    pub fn is_audit_path(&self, canonical: &str) -> bool {
        canonical == self.audit_path
    }

    pub fn minimum_severity(&self) -> Severity {
        self.minimum_severity
    }

    /// Failures always persist; successes only at or above the threshold.
    pub fn should_persist(&self, entry: &AuditLogEntry) -> bool {
        !entry.success || entry.severity >= self.minimum_severity
    }

    /// Record an entry.
    pub fn log(&self, entry: AuditLogEntry) {
        if self.should_persist(&entry) {
            self.pending.lock().push_back(entry.clone());
        }
        {
            let mut ring = self.ring.lock();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        // no receivers is fine
        let _ = self.tx.send(entry);
    }

    /// Every buffered entry, oldest first.
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.ring.lock().iter().cloned().collect()
    }

    /// The newest `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AuditLogEntry> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Live feed of every entry, regardless of severity.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditLogEntry> {
        self.tx.subscribe()
    }

    /// Take all entries waiting to be persisted, in log order.
    pub fn take_pending(&self) -> Vec<AuditLogEntry> {
        self.pending.lock().drain(..).collect()
    }

    /// Put entries back at the front of the queue after a failed append.
    ///
    /// The queue is bounded by the ring capacity; overflow drops the oldest
    /// entries with an error log.
    pub fn restore_pending(&self, entries: Vec<AuditLogEntry>) {
        let mut pending = self.pending.lock();
        for entry in entries.into_iter().rev() {
            pending.push_front(entry);
        }
        while pending.len() > self.capacity {
            if let Some(dropped) = pending.pop_front() {
                tracing::error!(entry = %dropped, "audit queue overflow, entry dropped");
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("alice", 1000, 1000)
    }

    fn entry(sev: Severity) -> AuditLogEntry {
        AuditLogEntry::new(&alice(), AuditEventType::Access, sev, "/x", "read")
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let logger = AuditLogger::new(3, Severity::Warning, DEFAULT_AUDIT_PATH);
        for i in 0..5 {
            logger.log(entry(Severity::Information).with_context("i", i));
        }
        let entries = logger.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].context["i"], "2");
        assert_eq!(entries[2].context["i"], "4");
        assert_eq!(logger.recent(2)[0].context["i"], "3");
    }

    #[test]
    fn test_severity_filter_applies_to_persistence_only() {
        let logger = AuditLogger::new(16, Severity::Warning, DEFAULT_AUDIT_PATH);
        logger.log(entry(Severity::Information));
        logger.log(entry(Severity::Warning));
        logger.log(entry(Severity::Error));

        assert_eq!(logger.len(), 3);
        let pending = logger.take_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].severity, Severity::Warning);
        assert_eq!(logger.pending_len(), 0);
    }

    #[test]
    fn test_failures_always_persist() {
        let logger = AuditLogger::new(16, Severity::Critical, DEFAULT_AUDIT_PATH);
        logger.log(entry(Severity::Information).failed("not found"));
        logger.log(entry(Severity::Error));
        let pending = logger.take_pending();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].success);
    }

    #[test]
    fn test_restore_pending_keeps_order() {
        let logger = AuditLogger::new(16, Severity::Information, DEFAULT_AUDIT_PATH);
        logger.log(entry(Severity::Information).with_context("n", 1));
        logger.log(entry(Severity::Information).with_context("n", 2));
        let taken = logger.take_pending();
        logger.log(entry(Severity::Information).with_context("n", 3));
        logger.restore_pending(taken);

        let order: Vec<_> = logger
            .take_pending()
            .into_iter()
            .map(|e| e.context["n"].clone())
            .collect();
        assert_eq!(order, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_line_format() {
        let line = entry(Severity::Warning)
            .failed("permission denied: \"/x\"")
            .with_context("mode", "read")
            .to_string();
        assert!(line.contains("[WARNING] Access user=alice(1000) op=read path=/x success=false"));
        assert!(line.contains("reason=\"permission denied: '/x'\""));
        assert!(line.ends_with(" mode=read"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_control_characters_escaped() {
        let forged =
            "/tmp/x\n2026-01-01T00:00:00.000Z [CRITICAL] Administrative user=root(0) op=forged";
        let mut forged_entry = entry(Severity::Error);
        forged_entry.path = forged.to_string();
        let line = forged_entry
            .failed(format!("not found: {forged}"))
            .with_context("note\r", "a\tb\u{1b}[2J")
            .to_string();
        assert_eq!(line.lines().count(), 1);
        assert!(line.contains("path=/tmp/x\\n2026-01-01T00:00:00.000Z [CRITICAL]"));
        assert!(line.contains(" note\\r=a\\tb\\u{1b}[2J"));
        assert!(!line.contains('\u{1b}'));
    }

    #[tokio::test]
    async fn test_live_observers_see_filtered_entries() {
        let logger = AuditLogger::new(16, Severity::Critical, DEFAULT_AUDIT_PATH);
        let mut rx = logger.subscribe();
        logger.log(entry(Severity::Information));
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.severity, Severity::Information);
        assert_eq!(logger.pending_len(), 0);
    }

    #[test]
    fn test_severity_parsing_and_order() {
        assert!(Severity::Critical > Severity::Warning);
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warning);
        assert_eq!(Severity::Information.to_string(), "INFORMATION");
    }
}
