//! # Node Codec
//!
//! Encodes and decodes B-tree nodes to and from their fixed binary format.
//! Every node serializes into a single block of at most `node_size` bytes;
//! the codec itself is size-agnostic, size policing happens in the store.
//!
//! ## Leaf Format
//!
//! ```text
//! +-------+----------------+------------------+
//! | ORBL  | node id (u64)  | pair count (u32) |   16-byte header
//! +-------+----------------+------------------+
//! | keys, concatenated (count * key_size)     |
//! +-------------------------------------------+
//! | value lengths, count * u32                |
//! +-------------------------------------------+
//! | values, concatenated                      |
//! +-------------------------------------------+
//! ```
//!
//! ## Index Format
//!
//! ```text
//! +-------+----------------+-------------------+
//! | ORBI  | node id (u64)  | entry count (u32) |   16-byte header
//! +-------+----------------+-------------------+
//! | keys, concatenated (count * key_size)      |
//! +--------------------------------------------+
//! | child ids, count * u64                     |
//! +--------------------------------------------+
//! ```
//!
//! All integers are big-endian. Node ids are never 0; a decoded id of 0
//! means the buffer is corrupt.
//!
//! ## Incremental Sizes
//!
//! Encoded size is a simple sum over pairs, so nodes keep a running total
//! and adjust it by [`leaf_pair_size`] / [`index_entry_size`] on every
//! mutation instead of re-measuring the whole node. [`NodeCodec`] exposes
//! the same arithmetic for callers that only have raw pairs.

use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};
use crate::node::{IndexNode, Key, LeafNode, Node, NodeId};

pub const LEAF_MAGIC: &[u8; 4] = b"ORBL";
pub const INDEX_MAGIC: &[u8; 4] = b"ORBI";

/// Shared header size of both node kinds: magic + id + count.
pub const NODE_HEADER_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    magic: [u8; 4],
    node_id: U64<BigEndian>,
    count: U32<BigEndian>,
}

impl NodeHeader {
    fn new(magic: &[u8; 4], node_id: NodeId, count: usize) -> Self {
        Self {
            magic: *magic,
            node_id: U64::new(node_id),
            count: U32::new(count as u32),
        }
    }
}

/// Encoded bytes one leaf pair contributes beyond the header.
#[inline]
pub fn leaf_pair_size(key: &[u8], value: &[u8]) -> usize {
    key.len() + 4 + value.len()
}

/// Encoded bytes one index entry contributes beyond the header.
#[inline]
pub fn index_entry_size(key: &[u8]) -> usize {
    key.len() + 8
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptNode(msg.into())
}

/// Encoder/decoder for a fixed key size.
#[derive(Debug, Clone, Copy)]
pub struct NodeCodec {
    key_size: usize,
}

impl NodeCodec {
    pub fn new(key_size: usize) -> Self {
        Self { key_size }
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Number of index entries that fit in a node of `node_size` bytes.
    pub fn max_index_pairs(&self, node_size: usize) -> usize {
        (node_size - NODE_HEADER_SIZE) / (self.key_size + 8)
    }

    /// Largest value a leaf accepts: half a node minus the header.
    pub fn max_value_size(&self, node_size: usize) -> usize {
        node_size / 2 - NODE_HEADER_SIZE
    }

    /// Encoded size of a leaf with the given pairs.
    pub fn leaf_size<'a, I>(&self, pairs: I) -> usize
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        NODE_HEADER_SIZE
            + pairs
                .into_iter()
                .map(|(k, v)| leaf_pair_size(k, v))
                .sum::<usize>()
    }

    /// Encoded size of an index node with `entries` entries.
    pub fn index_size(&self, entries: usize) -> usize {
        NODE_HEADER_SIZE + entries * (self.key_size + 8)
    }

    pub fn encode(&self, node: &Node) -> Vec<u8> {
        match node {
            Node::Leaf(leaf) => self.encode_leaf(leaf),
            Node::Index(index) => self.encode_index(index),
        }
    }

    pub fn encode_leaf(&self, leaf: &LeafNode) -> Vec<u8> {
        let pairs = leaf.pairs();
        let mut out = Vec::with_capacity(leaf.encoded_size());
        let header = NodeHeader::new(LEAF_MAGIC, leaf.id(), pairs.len());
        out.extend_from_slice(header.as_bytes());
        for (key, _) in pairs {
            out.extend_from_slice(key);
        }
        for (_, value) in pairs {
            out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        }
        for (_, value) in pairs {
            out.extend_from_slice(value);
        }
        out
    }

    pub fn encode_index(&self, index: &IndexNode) -> Vec<u8> {
        let entries = index.entries();
        let mut out = Vec::with_capacity(index.encoded_size());
        let header = NodeHeader::new(INDEX_MAGIC, index.id(), entries.len());
        out.extend_from_slice(header.as_bytes());
        for (key, _) in entries {
            out.extend_from_slice(key);
        }
        for (_, child_id) in entries {
            out.extend_from_slice(&child_id.to_be_bytes());
        }
        out
    }

    pub fn decode(&self, encoded: &[u8]) -> Result<Node> {
        if encoded.len() < NODE_HEADER_SIZE {
            return Err(corrupt(format!(
                "buffer of {} bytes is shorter than a node header",
                encoded.len()
            )));
        }
        let header = NodeHeader::ref_from_bytes(&encoded[..NODE_HEADER_SIZE])
            .map_err(|e| corrupt(format!("unreadable node header: {e:?}")))?;
        let node_id = header.node_id.get();
        if node_id == 0 {
            return Err(corrupt("node id 0 is reserved"));
        }
        let count = header.count.get() as usize;
        match &header.magic {
            m if m == LEAF_MAGIC => self.decode_leaf(encoded, node_id, count),
            m if m == INDEX_MAGIC => self.decode_index(encoded, node_id, count),
            m => Err(corrupt(format!("unknown magic cookie {m:?}"))),
        }
    }

    fn decode_leaf(&self, encoded: &[u8], node_id: NodeId, count: usize) -> Result<Node> {
        let keys_start = NODE_HEADER_SIZE;
        let lens_start = keys_start + count * self.key_size;
        let values_start = lens_start + count * 4;
        if values_start > encoded.len() {
            return Err(corrupt(format!(
                "leaf {node_id:#x} declares {count} pairs but buffer is {} bytes",
                encoded.len()
            )));
        }

        let mut pairs = Vec::with_capacity(count);
        let mut offset = values_start;
        for i in 0..count {
            let key_at = keys_start + i * self.key_size;
            let key = Key::from_slice(&encoded[key_at..key_at + self.key_size]);
            let len_at = lens_start + i * 4;
            let len_bytes: [u8; 4] = encoded[len_at..len_at + 4].try_into().unwrap();
            let value_len = u32::from_be_bytes(len_bytes) as usize;
            if offset + value_len > encoded.len() {
                return Err(corrupt(format!(
                    "leaf {node_id:#x}: value {i} overruns the buffer"
                )));
            }
            let value = encoded[offset..offset + value_len].to_vec();
            offset += value_len;
            pairs.push((key, value));
        }
        Ok(Node::Leaf(LeafNode::from_pairs(node_id, pairs)))
    }

    fn decode_index(&self, encoded: &[u8], node_id: NodeId, count: usize) -> Result<Node> {
        let keys_start = NODE_HEADER_SIZE;
        let children_start = keys_start + count * self.key_size;
        let end = children_start + count * 8;
        if end > encoded.len() {
            return Err(corrupt(format!(
                "index {node_id:#x} declares {count} entries but buffer is {} bytes",
                encoded.len()
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let key_at = keys_start + i * self.key_size;
            let key = Key::from_slice(&encoded[key_at..key_at + self.key_size]);
            let child_at = children_start + i * 8;
            let child_bytes: [u8; 8] = encoded[child_at..child_at + 8].try_into().unwrap();
            let child_id = u64::from_be_bytes(child_bytes);
            if child_id == 0 {
                return Err(corrupt(format!(
                    "index {node_id:#x}: entry {i} points at reserved id 0"
                )));
            }
            entries.push((key, child_id));
        }
        Ok(Node::Index(IndexNode::from_entries(node_id, entries)))
    }
}
