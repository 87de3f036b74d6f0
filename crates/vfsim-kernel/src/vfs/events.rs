//! Filesystem change notifications.
//!
//! Every successful mutation publishes an [`FsEvent`] on an [`EventBus`].
//! Watchers subscribe with a path prefix and only see events at or below it.
//!
//! ```ignore
//! let mut sub = vfs.subscribe("/home/alice");
//! while let Some(ev) = sub.recv().await {
//!     println!("{} {:?}", ev.path, ev.change);
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::path;

/// What happened to a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
    Renamed { from: String },
    AttributesChanged,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsEvent {
    pub path: String,
    pub change: ChangeType,
    pub timestamp: DateTime<Utc>,
    /// Uid of the caller that caused the change.
    pub user_id: u32,
}

impl FsEvent {
    pub fn new(path: impl Into<String>, change: ChangeType, user_id: u32) -> Self {
        Self {
            path: path.into(),
            change,
            timestamp: Utc::now(),
            user_id,
        }
    }

    /// True if the event touches `prefix` or anything below it. Renames
    /// match on either end.
    pub fn touches(&self, prefix: &str) -> bool {
        path::is_within(&self.path, prefix)
            || matches!(&self.change, ChangeType::Renamed { from } if path::is_within(from, prefix))
    }
}

/// Broadcast hub for [`FsEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FsEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to all subscribers. Returns how many received it.
    pub fn publish(&self, event: FsEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Watch `prefix` and everything below it. `/` sees everything.
    pub fn subscribe(&self, prefix: &str) -> Subscription {
        Subscription {
            prefix: path::normalize(prefix).unwrap_or_else(|_| path::ROOT.to_string()),
            rx: self.tx.subscribe(),
        }
    }
}

/// A prefix-filtered event stream.
#[derive(Debug)]
pub struct Subscription {
    prefix: String,
    rx: broadcast::Receiver<FsEvent>,
}

impl Subscription {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Next matching event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<FsEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if ev.touches(&self.prefix) => return Some(ev),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        prefix = %self.prefix,
                        lagged = n,
                        "fs event subscription lagged behind"
                    );
                }
            }
        }
    }

    /// Next matching event without waiting.
    pub fn try_recv(&mut self) -> Option<FsEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) if ev.touches(&self.prefix) => return Some(ev),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        prefix = %self.prefix,
                        lagged = n,
                        "fs event subscription lagged behind"
                    );
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_filter() {
        let bus = EventBus::new(16);
        let mut home = bus.subscribe("/home/alice");
        let mut all = bus.subscribe("/");

        bus.publish(FsEvent::new("/tmp/x", ChangeType::Created, 0));
        bus.publish(FsEvent::new("/home/alice/a.txt", ChangeType::Modified, 1000));

        let ev = home.recv().await.unwrap();
        assert_eq!(ev.path, "/home/alice/a.txt");
        assert_eq!(all.recv().await.unwrap().path, "/tmp/x");
        assert_eq!(all.recv().await.unwrap().change, ChangeType::Modified);
    }

    #[test]
    fn test_rename_matches_either_side() {
        let ev = FsEvent::new(
            "/tmp/b",
            ChangeType::Renamed {
                from: "/home/alice/b".to_string(),
            },
            1000,
        );
        assert!(ev.touches("/home/alice"));
        assert!(ev.touches("/tmp"));
        assert!(!ev.touches("/var"));
    }

    #[test]
    fn test_try_recv_skips_unrelated() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe("/var");
        bus.publish(FsEvent::new("/tmp/x", ChangeType::Deleted, 0));
        assert!(sub.try_recv().is_none());
        bus.publish(FsEvent::new("/var/log/x", ChangeType::Deleted, 0));
        assert_eq!(sub.try_recv().unwrap().path, "/var/log/x");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(FsEvent::new("/x", ChangeType::Created, 0)), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
