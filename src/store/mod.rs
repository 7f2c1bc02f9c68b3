//! # Node Stores
//!
//! A node store keeps B-tree nodes by id and owns everything persistent
//! about a forest: node blocks, reference counts, metadata, and the commit
//! machinery. The tree and forest layers are written against the
//! [`NodeStore`] trait only, so the same algorithms run over the on-disk
//! store and the in-memory one used by tests.
//!
//! ## Disk Store Data Flow
//!
//! ```text
//! get_node:  read cache ──> upload queue ──> journal read + decode
//! put_node:  read cache + upload queue (dirty, not yet encoded)
//! eviction:  encode ──> journal shadow write
//! commit:    drain queue ──> flush refcounts ──> metadata ──> journal commit
//! ```
//!
//! The upload queue is the interesting part: nodes that are created and
//! superseded within one tree operation usually leave the queue before
//! they are ever encoded, which is most of them during heavy mutation.
//!
//! ## Module Organization
//!
//! - `cache`: LRU map used for the read cache and the upload queue
//! - `upload_queue`: dirty-node buffer with encode-on-evict
//! - `refcount`: bucketed persistent refcounts
//! - `journal`: atomic multi-file commit
//! - `id_path`: node id to sharded path mapping
//! - `metadata`: INI-style metadata file
//! - `disk`, `memory`: the two store implementations

pub mod cache;
pub mod disk;
pub mod id_path;
pub mod journal;
pub mod memory;
pub mod metadata;
pub mod refcount;
pub mod upload_queue;

pub use disk::DiskNodeStore;
pub use memory::MemoryNodeStore;

use std::sync::Arc;

use crate::config::{DEFAULT_LRU_SIZE, DEFAULT_UPLOAD_QUEUE_SIZE};
use crate::error::{Error, Result};
use crate::node::{Node, NodeId};

/// One step up in a refcount. The u16 ceiling is an error, never a wrap;
/// every store and the refcount files share this one rule.
pub(crate) fn raised_refcount(id: NodeId, count: u16) -> Result<u16> {
    if count == u16::MAX {
        return Err(Error::RefcountOverflow(id));
    }
    Ok(count + 1)
}

/// One step down in a refcount, saturating at zero.
pub(crate) fn lowered_refcount(count: u16) -> u16 {
    count.saturating_sub(1)
}

/// Whether a store may be mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn is_read_only(self) -> bool {
        matches!(self, OpenMode::ReadOnly)
    }
}

/// Parameters for opening a store.
///
/// `key_size` and `node_size` are structural: once a store exists on disk
/// they are fixed by its metadata. A `key_size` mismatch on open is an
/// error; a `node_size` mismatch is silently resolved in favor of the
/// stored value. The cache sizes are per-open tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// Exact length of every key, in bytes.
    pub key_size: usize,
    /// Upper bound on an encoded node, in bytes.
    pub node_size: usize,
    /// Capacity of the dirty-node upload queue.
    pub upload_queue_size: usize,
    /// Capacity of the decoded-node read cache.
    pub lru_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            key_size: 16,
            node_size: 65536,
            upload_queue_size: DEFAULT_UPLOAD_QUEUE_SIZE,
            lru_size: DEFAULT_LRU_SIZE,
        }
    }
}

/// Storage capability set the tree and forest layers are written against.
///
/// Mutating calls on a read-only store fail with `Error::ReadOnly`.
/// `get_node` hands out shared nodes; mutation always goes through
/// cloning and `put_node`, which is what makes copy-on-write safe.
pub trait NodeStore {
    fn key_size(&self) -> usize;
    fn node_size(&self) -> usize;

    /// Largest value a leaf pair may carry.
    fn max_value_size(&self) -> usize;

    /// Most entries an index node may hold.
    fn max_index_pairs(&self) -> usize;

    fn read_only(&self) -> bool;

    /// Highest node id handed out so far.
    fn last_id(&self) -> u64;

    /// Allocate the next node id. Ids are monotonic and never reused;
    /// the new `last_id` is persisted by the next commit.
    fn new_id(&mut self) -> Result<NodeId>;

    /// Fetch a node, decoding from storage if needed.
    fn get_node(&mut self, id: NodeId) -> Result<Arc<Node>>;

    /// Park a dirty node for upload. A later put of the same id replaces
    /// the parked entry.
    fn put_node(&mut self, node: Node) -> Result<()>;

    /// Drop a node: from the upload queue if it never hit storage,
    /// otherwise schedule the stored block for deletion at commit.
    fn remove_node(&mut self, id: NodeId) -> Result<()>;

    /// Ids of every live node, parked or stored.
    fn list_node_ids(&mut self) -> Result<Vec<NodeId>>;

    fn get_refcount(&mut self, id: NodeId) -> Result<u16>;
    fn set_refcount(&mut self, id: NodeId, count: u16) -> Result<()>;

    /// Raise a refcount by one. Fails with `RefcountOverflow` at the u16
    /// ceiling instead of wrapping. Returns the new value.
    fn increment_refcount(&mut self, id: NodeId) -> Result<u16>;

    /// Lower a refcount by one, saturating at zero. Returns the new value.
    fn decrement_refcount(&mut self, id: NodeId) -> Result<u16>;

    /// Every id with a refcount above zero.
    fn nonzero_refcounts(&mut self) -> Result<Vec<(NodeId, u16)>>;

    fn get_metadata(&self, key: &str) -> Option<String>;
    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove_metadata(&mut self, key: &str) -> Result<Option<String>>;
    fn metadata_keys(&self) -> Vec<String>;

    /// Make every change since the previous commit durable, atomically.
    fn commit(&mut self) -> Result<()>;
}
