//! # In-Memory Node Store
//!
//! Keeps everything in maps. Nothing persists: `commit` only marks the
//! current state as the baseline. This store exists for tests, examples,
//! and benchmarks that want tree behavior without touching a filesystem;
//! the contract is identical to the disk store's.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::codec::NodeCodec;
use crate::error::{Error, Result};
use crate::node::{Node, NodeId};
use crate::store::{lowered_refcount, raised_refcount, NodeStore, OpenMode, StoreSettings};

#[derive(Debug)]
pub struct MemoryNodeStore {
    codec: NodeCodec,
    node_size: usize,
    read_only: bool,
    last_id: u64,
    nodes: HashMap<NodeId, Arc<Node>>,
    refcounts: HashMap<NodeId, u16>,
    metadata: BTreeMap<String, String>,
}

impl MemoryNodeStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self::with_mode(settings, OpenMode::ReadWrite)
    }

    pub fn with_mode(settings: StoreSettings, mode: OpenMode) -> Self {
        Self {
            codec: NodeCodec::new(settings.key_size),
            node_size: settings.node_size,
            read_only: mode.is_read_only(),
            last_id: 0,
            nodes: HashMap::new(),
            refcounts: HashMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl NodeStore for MemoryNodeStore {
    fn key_size(&self) -> usize {
        self.codec.key_size()
    }

    fn node_size(&self) -> usize {
        self.node_size
    }

    fn max_value_size(&self) -> usize {
        self.codec.max_value_size(self.node_size)
    }

    fn max_index_pairs(&self) -> usize {
        self.codec.max_index_pairs(self.node_size)
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn last_id(&self) -> u64 {
        self.last_id
    }

    fn new_id(&mut self) -> Result<NodeId> {
        self.check_writable()?;
        self.last_id += 1;
        Ok(self.last_id)
    }

    fn get_node(&mut self, id: NodeId) -> Result<Arc<Node>> {
        self.nodes.get(&id).cloned().ok_or(Error::NodeMissing(id))
    }

    fn put_node(&mut self, node: Node) -> Result<()> {
        self.check_writable()?;
        self.nodes.insert(node.id(), Arc::new(node));
        Ok(())
    }

    fn remove_node(&mut self, id: NodeId) -> Result<()> {
        self.check_writable()?;
        self.nodes.remove(&id).ok_or(Error::NodeMissing(id))?;
        Ok(())
    }

    fn list_node_ids(&mut self) -> Result<Vec<NodeId>> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn get_refcount(&mut self, id: NodeId) -> Result<u16> {
        Ok(self.refcounts.get(&id).copied().unwrap_or(0))
    }

    fn set_refcount(&mut self, id: NodeId, count: u16) -> Result<()> {
        self.check_writable()?;
        if count == 0 {
            self.refcounts.remove(&id);
        } else {
            self.refcounts.insert(id, count);
        }
        Ok(())
    }

    fn increment_refcount(&mut self, id: NodeId) -> Result<u16> {
        self.check_writable()?;
        let next = raised_refcount(id, self.get_refcount(id)?)?;
        self.set_refcount(id, next)?;
        Ok(next)
    }

    fn decrement_refcount(&mut self, id: NodeId) -> Result<u16> {
        self.check_writable()?;
        let next = lowered_refcount(self.get_refcount(id)?);
        self.set_refcount(id, next)?;
        Ok(next)
    }

    fn nonzero_refcounts(&mut self) -> Result<Vec<(NodeId, u16)>> {
        let mut out: Vec<(NodeId, u16)> =
            self.refcounts.iter().map(|(&id, &c)| (id, c)).collect();
        out.sort_unstable();
        Ok(out)
    }

    fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.get(key).cloned()
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_metadata(&mut self, key: &str) -> Result<Option<String>> {
        self.check_writable()?;
        Ok(self.metadata.remove(key))
    }

    fn metadata_keys(&self) -> Vec<String> {
        self.metadata.keys().cloned().collect()
    }

    fn commit(&mut self) -> Result<()> {
        self.check_writable()
    }
}
