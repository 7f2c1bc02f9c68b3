//! # Upload Queue
//!
//! Dirty nodes are not encoded and written the moment the tree produces
//! them. It frequently happens that a node is modified or deleted again
//! shortly after it is created - a leaf shadowed by an insert is often
//! re-shadowed by the next insert - so dirty nodes wait here instead.
//! Nodes that leave the queue before it overflows never reach the encoder
//! at all.
//!
//! The queue is an LRU map capped at a fixed length. Putting a node that
//! is already queued replaces the entry in place at the hot end. When the
//! queue overflows, the coldest node is evicted and handed back to the
//! caller to encode and stage for write. Because a put always lands at
//! the hot end, a node the tree is still growing past `node_size` (a leaf
//! about to be split) is never the eviction victim.

use std::sync::Arc;

use crate::node::{Node, NodeId};
use crate::store::cache::LruCache;

#[derive(Debug)]
pub struct UploadQueue {
    lru: LruCache<NodeId, Arc<Node>>,
}

impl UploadQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            lru: LruCache::new(max_len),
        }
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    /// Park a dirty node. Returns the evicted node when the queue
    /// overflows; the caller must write it out.
    pub fn put(&mut self, node: Arc<Node>) -> Option<(NodeId, Arc<Node>)> {
        self.lru.insert(node.id(), node)
    }

    pub fn get(&mut self, id: NodeId) -> Option<Arc<Node>> {
        self.lru.get(&id).cloned()
    }

    /// Forget a queued node. Returns true when the node was queued.
    pub fn remove(&mut self, id: NodeId) -> bool {
        self.lru.take(&id).is_some()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.lru.keys().copied().collect()
    }

    /// Drain every queued node, coldest first.
    pub fn drain(&mut self) -> Vec<(NodeId, Arc<Node>)> {
        let mut out = Vec::with_capacity(self.lru.len());
        while let Some(entry) = self.lru.pop_oldest() {
            out.push(entry);
        }
        out
    }
}
