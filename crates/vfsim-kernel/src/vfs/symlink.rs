//! Symbolic link resolution with a hop limit.
//!
//! A symlink is a file node carrying a target path. Resolution walks the
//! canonical path segment by segment; whenever a segment names a link, the
//! link's target is spliced in front of the remaining segments and the walk
//! restarts from the root. Every splice costs one hop, so cycles terminate.

use std::collections::VecDeque;

use super::error::{VfsError, VfsResult};
use super::path;
use super::store::NodeStore;
use super::types::NodeId;

/// Default hop limit (matches Linux `MAXSYMLINKS`).
pub const DEFAULT_MAX_HOPS: usize = 40;

/// Resolves symlinks in canonical paths.
#[derive(Debug, Clone, Copy)]
pub struct SymlinkResolver {
    max_hops: usize,
}

impl Default for SymlinkResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HOPS)
    }
}

impl SymlinkResolver {
    pub fn new(max_hops: usize) -> Self {
        Self { max_hops }
    }

    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// Produce the concrete path `canonical` refers to.
    ///
    /// Intermediate links are always followed; the final segment only when
    /// `follow_final` is set. Segments that do not exist are kept verbatim,
    /// so the result can name a node about to be created.
    pub fn resolve(
        &self,
        store: &NodeStore,
        canonical: &str,
        follow_final: bool,
    ) -> VfsResult<String> {
        let mut pending: VecDeque<String> = path::segments(canonical).map(str::to_string).collect();
        let mut resolved: Vec<String> = Vec::new();
        let mut dir = NodeId::ROOT;
        let mut hops = 0usize;

        while let Some(segment) = pending.pop_front() {
            let Some(child) = store.child_id(dir, &segment) else {
                resolved.push(segment);
                resolved.extend(pending.drain(..));
                break;
            };
            let target = store.get(child).and_then(|n| n.symlink_target());
            match target {
                Some(target) if !pending.is_empty() || follow_final => {
                    hops += 1;
                    if hops > self.max_hops {
                        tracing::debug!(path = %canonical, hops, "symlink hop limit exhausted");
                        return Err(VfsError::SymlinkLoop {
                            path: canonical.to_string(),
                            hops,
                        });
                    }
                    let joined = if target.starts_with('/') {
                        target.to_string()
                    } else {
                        path::join(&path::from_segments(&resolved), target)
                    };
                    let target_path = path::normalize(&joined)?;
                    let mut next: VecDeque<String> =
                        path::segments(&target_path).map(str::to_string).collect();
                    next.extend(pending.drain(..));
                    pending = next;
                    resolved.clear();
                    dir = NodeId::ROOT;
                }
                _ => {
                    resolved.push(segment);
                    dir = child;
                }
            }
        }

        Ok(path::from_segments(&resolved))
    }
}
