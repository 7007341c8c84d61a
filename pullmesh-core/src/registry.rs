//! In-memory index of which peers are currently pulling which layers.
//!
//! The registry is derived by folding the cluster's broadcast event stream:
//! a STARTED event adds a `(digest, node)` pair, an ENDED event removes it.
//! Both operations are idempotent and commutative per pair, which is what
//! makes unordered and duplicated event delivery safe. The view is
//! best-effort only; a stale entry costs a redundant origin fetch, never
//! correctness.

use std::collections::HashMap;
use std::sync::Mutex;

/// Per-process map from layer digest to the peers known to be fetching it.
///
/// A single mutex guards every read and write. Lock hold time is bounded by
/// the map operation itself; nothing under the lock touches the network or
/// the disk. The event consumption loop is the sole writer, request handlers
/// are concurrent readers.
#[derive(Debug, Default)]
pub struct DigestRegistry {
    by_digest: Mutex<HashMap<String, Vec<String>>>,
}

impl DigestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `node` as an active downloader of `digest`. Re-adding a node
    /// that is already present is a no-op.
    pub fn record_start(&self, digest: &str, node: &str) {
        let mut by_digest = self
            .by_digest
            .lock()
            .expect("digest registry mutex poisoned");
        let nodes = by_digest.entry(digest.to_string()).or_default();
        if !nodes.iter().any(|existing| existing == node) {
            nodes.push(node.to_string());
        }
    }

    /// Removes `node` from the downloader set of `digest`. Removing an
    /// absent pair is a no-op.
    pub fn record_end(&self, digest: &str, node: &str) {
        let mut by_digest = self
            .by_digest
            .lock()
            .expect("digest registry mutex poisoned");
        if let Some(nodes) = by_digest.get_mut(digest) {
            nodes.retain(|existing| existing != node);
            if nodes.is_empty() {
                by_digest.remove(digest);
            }
        }
    }

    /// Snapshot of the peers currently downloading `digest`. The returned
    /// vector is detached from the registry; callers may mutate it freely.
    pub fn endpoints(&self, digest: &str) -> Vec<String> {
        let by_digest = self
            .by_digest
            .lock()
            .expect("digest registry mutex poisoned");
        by_digest.get(digest).cloned().unwrap_or_default()
    }
}
