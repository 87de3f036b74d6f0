//! Durable storage for the tree.
//!
//! A save produces one generation: a postcard-encoded [`TreeSnapshot`] of
//! all node metadata plus one checksummed blob per regular file, keyed by
//! node id. The backing [`SnapshotStore`] writes the whole generation and
//! only then swaps its head pointer, so a failed save never disturbs the
//! previous generation.
//!
//! Blob layout:
//!
//! ```text
//! b"VFSB" | u32 LE content length | u16 LE checksum length | BLAKE3 | content
//! ```
//!
//! On load a blob that fails any check marks only its own file corrupt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::error::{VfsError, VfsResult};
use super::store::NodeStore;
use super::types::{Node, NodeId, NodeKind, Permissions};

/// Blob header magic.
pub const BLOB_MAGIC: &[u8; 4] = b"VFSB";

/// Format version of [`TreeSnapshot`].
pub const SNAPSHOT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 2;

/// Hex BLAKE3 digest of some content.
pub fn checksum_hex(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Wrap content in a checksummed blob.
pub fn encode_blob(content: &[u8]) -> VfsResult<Vec<u8>> {
    let len = u32::try_from(content.len()).map_err(|_| VfsError::codec("file too large for blob"))?;
    let hash = blake3::hash(content);
    let digest = hash.as_bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + digest.len() + content.len());
    out.extend_from_slice(BLOB_MAGIC);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&(digest.len() as u16).to_le_bytes());
    out.extend_from_slice(digest);
    out.extend_from_slice(content);
    Ok(out)
}

/// Verify a blob and return its content.
///
/// The error string says which check failed.
pub fn decode_blob(blob: &[u8]) -> Result<Vec<u8>, String> {
    if blob.len() < HEADER_LEN || &blob[..4] != BLOB_MAGIC {
        return Err("bad blob header".to_string());
    }
    let len = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]) as usize;
    let sum_len = u16::from_le_bytes([blob[8], blob[9]]) as usize;
    let body = &blob[HEADER_LEN..];
    if body.len() != sum_len + len {
        return Err(format!(
            "length mismatch: header says {}, blob holds {}",
            sum_len + len,
            body.len()
        ));
    }
    let (stored, content) = body.split_at(sum_len);
    if stored != blake3::hash(content).as_bytes() {
        return Err(format!(
            "checksum mismatch: stored {}, computed {}",
            hex::encode(stored),
            checksum_hex(content)
        ));
    }
    Ok(content.to_vec())
}

/// Persisted form of a node's payload. Content lives in blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordKind {
    File { mime_type: String },
    Symlink { target: String },
    Directory,
}

/// Persisted node metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u64,
    pub parent: Option<u64>,
    pub name: String,
    pub owner_id: u32,
    pub group_id: u32,
    pub permissions: Permissions,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub kind: RecordKind,
}

impl NodeRecord {
    fn from_node(node: &Node) -> Self {
        let kind = match &node.kind {
            NodeKind::Directory { .. } => RecordKind::Directory,
            NodeKind::File {
                symlink_target: Some(target),
                ..
            } => RecordKind::Symlink {
                target: target.clone(),
            },
            NodeKind::File { mime_type, .. } => RecordKind::File {
                mime_type: mime_type.clone(),
            },
        };
        Self {
            id: node.id.0,
            parent: node.parent.map(|p| p.0),
            name: node.name.clone(),
            owner_id: node.owner_id,
            group_id: node.group_id,
            permissions: node.permissions,
            size: node.size,
            created_at: node.created_at,
            modified_at: node.modified_at,
            accessed_at: node.accessed_at,
            kind,
        }
    }

    fn into_node(self, content: Vec<u8>) -> Node {
        let kind = match self.kind {
            RecordKind::Directory => NodeKind::Directory {
                children: HashMap::new(),
            },
            RecordKind::Symlink { target } => NodeKind::File {
                content: Vec::new(),
                mime_type: "inode/symlink".to_string(),
                symlink_target: Some(target),
            },
            RecordKind::File { mime_type } => NodeKind::File {
                content,
                mime_type,
                symlink_target: None,
            },
        };
        Node {
            id: NodeId(self.id),
            name: self.name,
            full_path: String::new(),
            parent: self.parent.map(NodeId),
            owner_id: self.owner_id,
            group_id: self.group_id,
            permissions: self.permissions,
            size: self.size,
            created_at: self.created_at,
            modified_at: self.modified_at,
            accessed_at: self.accessed_at,
            kind,
        }
    }
}

/// Tree metadata of one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub version: u32,
    pub next_id: u64,
    pub saved_at: DateTime<Utc>,
    pub nodes: Vec<NodeRecord>,
}

/// A fully encoded generation, ready to hand to a store.
#[derive(Debug, Clone)]
pub struct EncodedTree {
    pub tree: Vec<u8>,
    pub blobs: Vec<(u64, Vec<u8>)>,
}

/// Raw contents of the current generation.
#[derive(Debug, Clone)]
pub struct StoredGeneration {
    pub generation: u64,
    pub tree: Vec<u8>,
    pub blobs: Vec<(u64, Vec<u8>)>,
}

/// What a load found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub generation: u64,
    pub nodes: usize,
    /// Files whose blob was missing or failed verification.
    pub corrupted: Vec<String>,
}

/// Backing store for generations.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Write a complete generation and make it current. Returns its number.
    async fn write_generation(&self, encoded: EncodedTree) -> VfsResult<u64>;

    /// The current generation, or `None` if nothing was ever saved.
    async fn read_head(&self) -> VfsResult<Option<StoredGeneration>>;
}

const SCHEMA: &str = r#"
-- Tree metadata, one row per generation
CREATE TABLE IF NOT EXISTS snapshots (
    generation INTEGER PRIMARY KEY,
    tree BLOB NOT NULL,
    created_at INTEGER DEFAULT (unixepoch())
);

-- File content, keyed by generation and node id
CREATE TABLE IF NOT EXISTS blobs (
    generation INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (generation, node_id)
);

-- Single-row pointer to the current generation
CREATE TABLE IF NOT EXISTS head (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    generation INTEGER NOT NULL
);
"#;

/// SQLite-backed [`SnapshotStore`].
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> VfsResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database.
    pub fn in_memory() -> VfsResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn write_sync(conn: &mut Connection, encoded: &EncodedTree) -> VfsResult<u64> {
        let tx = conn.transaction()?;
        let generation: i64 = tx.query_row(
            "SELECT COALESCE(MAX(generation), 0) + 1 FROM snapshots",
            [],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO snapshots (generation, tree) VALUES (?1, ?2)",
            params![generation, encoded.tree],
        )?;
        {
            let mut insert =
                tx.prepare("INSERT INTO blobs (generation, node_id, data) VALUES (?1, ?2, ?3)")?;
            for (node_id, data) in &encoded.blobs {
                insert.execute(params![generation, *node_id as i64, data])?;
            }
        }
        // swap, then drop everything older
        tx.execute(
            "INSERT INTO head (id, generation) VALUES (0, ?1)
             ON CONFLICT(id) DO UPDATE SET generation = excluded.generation",
            params![generation],
        )?;
        tx.execute("DELETE FROM blobs WHERE generation < ?1", params![generation])?;
        tx.execute("DELETE FROM snapshots WHERE generation < ?1", params![generation])?;
        tx.commit()?;
        Ok(generation as u64)
    }

    fn read_sync(conn: &Connection) -> VfsResult<Option<StoredGeneration>> {
        let generation: Option<i64> = conn
            .query_row("SELECT generation FROM head WHERE id = 0", [], |row| row.get(0))
            .optional()?;
        let Some(generation) = generation else {
            return Ok(None);
        };
        let tree: Vec<u8> = conn.query_row(
            "SELECT tree FROM snapshots WHERE generation = ?1",
            params![generation],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare("SELECT node_id, data FROM blobs WHERE generation = ?1")?;
        let blobs = stmt
            .query_map(params![generation], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(StoredGeneration {
            generation: generation as u64,
            tree,
            blobs,
        }))
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn write_generation(&self, encoded: EncodedTree) -> VfsResult<u64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || Self::write_sync(&mut conn.lock(), &encoded))
            .await
            .map_err(|e| VfsError::other(format!("spawn_blocking: {e}")))?
    }

    async fn read_head(&self) -> VfsResult<Option<StoredGeneration>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || Self::read_sync(&conn.lock()))
            .await
            .map_err(|e| VfsError::other(format!("spawn_blocking: {e}")))?
    }
}

/// Saves and rehydrates trees through a [`SnapshotStore`].
#[derive(Clone)]
pub struct PersistenceLayer {
    store: Arc<dyn SnapshotStore>,
    retries: u32,
    backoff: Duration,
}

impl std::fmt::Debug for PersistenceLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceLayer")
            .field("retries", &self.retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl PersistenceLayer {
    pub fn new(store: Arc<dyn SnapshotStore>, retries: u32, backoff: Duration) -> Self {
        Self {
            store,
            retries,
            backoff,
        }
    }

    /// Serialize a tree. Synchronous so it can run under the tree read lock.
    pub fn encode(tree: &NodeStore) -> VfsResult<EncodedTree> {
        let mut records = Vec::with_capacity(tree.len());
        let mut blobs = Vec::new();
        for node in tree.nodes() {
            records.push(NodeRecord::from_node(node));
            // corrupt files stay blob-less so they reload as corrupt
            if node.is_file() && !tree.is_corrupted(node.id) {
                let content = node.content().unwrap_or_default();
                blobs.push((node.id.0, encode_blob(content)?));
            }
        }
        records.sort_by_key(|r| r.id);
        let snapshot = TreeSnapshot {
            version: SNAPSHOT_VERSION,
            next_id: tree.next_id(),
            saved_at: Utc::now(),
            nodes: records,
        };
        let tree = postcard::to_allocvec(&snapshot).map_err(VfsError::codec)?;
        Ok(EncodedTree { tree, blobs })
    }

    /// Save a tree, retrying with exponential backoff.
    pub async fn save(&self, tree: &NodeStore) -> VfsResult<u64> {
        let encoded = Self::encode(tree)?;
        self.save_encoded(encoded).await
    }

    /// Write an already encoded tree, retrying with exponential backoff.
    ///
    /// Fails with [`VfsError::Durability`] once the retries are spent.
    pub async fn save_encoded(&self, encoded: EncodedTree) -> VfsResult<u64> {
        let mut delay = self.backoff;
        let attempts = self.retries + 1;
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.store.write_generation(encoded.clone()).await {
                Ok(generation) => {
                    tracing::debug!(generation, attempt, blobs = encoded.blobs.len(), "tree saved");
                    return Ok(generation);
                }
                Err(e) => {
                    last = e.to_string();
                    if attempt < attempts {
                        tracing::warn!(
                            attempt,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "save failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        tracing::error!(attempts, error = %last, "save failed, changes not durable");
        Err(VfsError::Durability(format!("save failed after {attempts} attempts: {last}")))
    }

    /// Rehydrate the current generation, or `None` when nothing was saved.
    pub async fn load(&self) -> VfsResult<Option<(NodeStore, LoadReport)>> {
        let Some(stored) = self.store.read_head().await? else {
            return Ok(None);
        };
        let snapshot: TreeSnapshot = postcard::from_bytes(&stored.tree).map_err(VfsError::codec)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(VfsError::codec(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut blobs: HashMap<u64, Vec<u8>> = stored.blobs.into_iter().collect();
        let mut nodes = Vec::with_capacity(snapshot.nodes.len());
        let mut bad: Vec<NodeId> = Vec::new();
        for record in snapshot.nodes {
            let id = record.id;
            let content = match (&record.kind, blobs.remove(&id)) {
                (RecordKind::File { .. }, Some(blob)) => match decode_blob(&blob) {
                    Ok(content) => content,
                    Err(reason) => {
                        tracing::warn!(
                            node = id,
                            name = %record.name,
                            %reason,
                            "corrupt content blob"
                        );
                        bad.push(NodeId(id));
                        Vec::new()
                    }
                },
                (RecordKind::File { .. }, None) => {
                    tracing::warn!(node = id, name = %record.name, "missing content blob");
                    bad.push(NodeId(id));
                    Vec::new()
                }
                _ => Vec::new(),
            };
            nodes.push(record.into_node(content));
        }

        let mut tree = NodeStore::from_nodes(nodes, snapshot.next_id)?;
        for id in bad {
            tree.mark_corrupted(id);
        }
        let report = LoadReport {
            generation: stored.generation,
            nodes: tree.len(),
            corrupted: tree.corrupted_paths(),
        };
        tracing::info!(
            generation = report.generation,
            nodes = report.nodes,
            corrupted = report.corrupted.len(),
            "tree loaded"
        );
        Ok(Some((tree, report)))
    }
}
