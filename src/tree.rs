//! # Copy-on-Write B-Tree
//!
//! The tree maps fixed-size keys to byte values and never mutates a node
//! that anything else can see. A node may be modified only while its
//! refcount is exactly 1; every other node is *shadowed* first - cloned
//! under a fresh id - and the parent re-pointed at the clone. Shadowing a
//! shared index node bumps the refcount of each of its children, since
//! the clone is a second parent for all of them.
//!
//! ## Shape
//!
//! The root is always an index node (possibly with zero entries for an
//! empty tree); all keys live in leaves at the bottom. An index entry
//! `(k, child)` promises that the smallest key reachable through `child`
//! is exactly `k`, so any operation that changes a subtree's first key
//! re-pins the parent entry. The CoW descent makes that cheap: the
//! parent has already been shadowed by the time the child changes.
//!
//! ## Mutation Pattern
//!
//! Insert and remove are written recursively: each level shadows its
//! node, recurses, then replaces its child entry with whatever node(s)
//! the recursion returned - one node normally, two after a split. The
//! caller at the root turns two returned nodes into a new, taller root.
//! Splits are byte-size-based for leaves (values vary in size) and
//! count-based for index nodes (entries are uniform).
//!
//! Removal merges an emptied or shrunken node with a neighbor sibling
//! when the result fits, borrows entries from the neighbor when an index
//! node is underfull but a merge would overflow, and finally *shallows*
//! the tree: a root with a single index-node child is replaced by that
//! child, repeatedly.
//!
//! ## Refcount Discipline
//!
//! All count arithmetic goes through the store's `increment_refcount` /
//! `decrement_refcount`, which refuse to wrap past `u16::MAX` (cloning a
//! tree that many times is an error, not a wraparound). The tree adds
//! only the structural part: dropping the last reference deletes the
//! node and walks an explicit stack down the subtree, so tree teardown
//! never recurses on the call stack.
//!
//! Range reads are materialized into a `Vec` rather than streamed; the
//! caller may freely mutate the tree between uses of the result.

use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::node::{IndexNode, Key, LeafNode, Node, NodeId};
use crate::store::NodeStore;

/// A B-tree bound to node ids in some store. The tree itself is tiny:
/// algorithms plus a root pointer; all state lives in the store.
#[derive(Debug, Clone)]
pub struct BTree {
    root: Option<NodeId>,
}

impl BTree {
    pub fn new(root: Option<NodeId>) -> Self {
        Self { root }
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.root
    }

    /// Value stored for `key`, or `KeyNotFound`.
    pub fn lookup<S: NodeStore>(&self, store: &mut S, key: &[u8]) -> Result<Vec<u8>> {
        check_key_size(store, key)?;
        let Some(root_id) = self.root else {
            return Err(Error::KeyNotFound);
        };
        let mut node = store.get_node(root_id)?;
        loop {
            let next = match &*node {
                Node::Leaf(leaf) => {
                    return leaf
                        .get(key)
                        .map(|value| value.to_vec())
                        .ok_or(Error::KeyNotFound)
                }
                Node::Index(index) => {
                    let (_, child) = index.find_child(key).ok_or(Error::KeyNotFound)?;
                    child
                }
            };
            node = store.get_node(next)?;
        }
    }

    /// All pairs with `lo <= key <= hi`, in ascending key order.
    pub fn lookup_range<S: NodeStore>(
        &self,
        store: &mut S,
        lo: &[u8],
        hi: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        check_key_size(store, lo)?;
        check_key_size(store, hi)?;
        let mut pairs = Vec::new();
        let Some(root_id) = self.root else {
            return Ok(pairs);
        };
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            match &*store.get_node(id)? {
                Node::Leaf(leaf) => {
                    for (key, value) in leaf.find_pairs(lo, hi) {
                        pairs.push((key.to_vec(), value.clone()));
                    }
                }
                Node::Index(index) => {
                    // reversed so the leftmost child is popped first
                    stack.extend(index.children_in_range(lo, hi).into_iter().rev());
                }
            }
        }
        Ok(pairs)
    }

    /// Number of keys in `[lo, hi]`, without materializing values.
    pub fn count_range<S: NodeStore>(&self, store: &mut S, lo: &[u8], hi: &[u8]) -> Result<u64> {
        check_key_size(store, lo)?;
        check_key_size(store, hi)?;
        let mut count = 0;
        let Some(root_id) = self.root else {
            return Ok(count);
        };
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            match &*store.get_node(id)? {
                Node::Leaf(leaf) => count += leaf.find_pairs(lo, hi).len() as u64,
                Node::Index(index) => stack.extend(index.children_in_range(lo, hi)),
            }
        }
        Ok(count)
    }

    /// Is `[lo, hi]` free of keys? Cheaper than a range lookup: stops at
    /// the first hit.
    pub fn range_is_empty<S: NodeStore>(
        &self,
        store: &mut S,
        lo: &[u8],
        hi: &[u8],
    ) -> Result<bool> {
        check_key_size(store, lo)?;
        check_key_size(store, hi)?;
        let Some(root_id) = self.root else {
            return Ok(true);
        };
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            match &*store.get_node(id)? {
                Node::Leaf(leaf) => {
                    if !leaf.find_pairs(lo, hi).is_empty() {
                        return Ok(false);
                    }
                }
                Node::Index(index) => stack.extend(index.children_in_range(lo, hi)),
            }
        }
        Ok(true)
    }

    /// Insert a pair. An existing value for the key is silently replaced.
    pub fn insert<S: NodeStore>(&mut self, store: &mut S, key: &[u8], value: &[u8]) -> Result<()> {
        check_key_size(store, key)?;
        check_value_size(store, value)?;

        let root = match self.root {
            Some(id) => Some(store.get_node(id)?),
            None => None,
        };

        // An empty tree is special-cased so the recursive path can assume
        // a populated index node above it.
        let new_root = match &root {
            None => {
                let leaf = new_leaf(store, key, value)?;
                store.put_node(Node::Leaf(leaf.clone()))?;
                new_index(store, vec![(Key::from_slice(key), leaf.id())])?
            }
            Some(node) if node.is_empty() => {
                let index = as_index(node)?;
                let leaf = new_leaf(store, key, value)?;
                store.put_node(Node::Leaf(leaf.clone()))?;
                let mut new_root = shadow_index(store, index)?;
                new_root.add(Key::from_slice(key), leaf.id());
                store.increment_refcount(leaf.id())?;
                new_root
            }
            Some(node) => {
                let index = as_index(node)?;
                let mut kids = self.insert_into_index(store, index, key, value)?;
                if kids.len() == 1 {
                    kids.swap_remove(0)
                } else {
                    // the old root split; grow the tree by one level
                    let mut entries = Vec::with_capacity(kids.len());
                    for kid in &kids {
                        entries.push((index_first_key(kid)?.clone(), kid.id()));
                    }
                    new_index(store, entries)?
                }
            }
        };

        self.set_root(store, Node::Index(new_root))
    }

    /// Insert into the subtree under `old_index`, returning its
    /// replacement node(s): one normally, two siblings after a split.
    /// Never grows the tree; the caller handles a splitting root.
    fn insert_into_index<S: NodeStore>(
        &mut self,
        store: &mut S,
        old_index: &IndexNode,
        key: &[u8],
        value: &[u8],
    ) -> Result<Vec<IndexNode>> {
        let mut new_index = shadow_index(store, old_index)?;

        // A key below every entry still descends into the first child;
        // the leftmost entry key gets re-pinned on the way back up.
        let (child_key, child_id) = match new_index.find_child(key) {
            Some((k, child)) => (k.clone(), child),
            None => {
                let (k, child) = first_entry(&new_index)?;
                (k, child)
            }
        };

        let child = store.get_node(child_id)?;
        let kids: Vec<Node> = match &*child {
            Node::Index(child_index) => self
                .insert_into_index(store, child_index, key, value)?
                .into_iter()
                .map(Node::Index)
                .collect(),
            Node::Leaf(child_leaf) => self
                .insert_into_leaf(store, child_leaf, key, value)?
                .into_iter()
                .map(Node::Leaf)
                .collect(),
        };

        new_index.remove(&child_key);
        let mut kept_original = false;
        for kid in &kids {
            new_index.add(node_first_key(kid)?.clone(), kid.id());
            if kid.id() == child_id {
                kept_original = true;
            } else {
                store.increment_refcount(kid.id())?;
            }
        }
        if !kept_original {
            decrement(store, child_id)?;
        }

        if new_index.len() > store.max_index_pairs() {
            let split_at = new_index.len() / 2;
            let upper = new_index.split_off(split_at);
            let sibling = IndexNode::from_entries(store.new_id()?, upper);
            trace!(left = new_index.id(), right = sibling.id(), "split index node");
            store.put_node(Node::Index(new_index.clone()))?;
            store.put_node(Node::Index(sibling.clone()))?;
            Ok(vec![new_index, sibling])
        } else {
            store.put_node(Node::Index(new_index.clone()))?;
            Ok(vec![new_index])
        }
    }

    fn insert_into_leaf<S: NodeStore>(
        &mut self,
        store: &mut S,
        old_leaf: &LeafNode,
        key: &[u8],
        value: &[u8],
    ) -> Result<Vec<LeafNode>> {
        let mut new = shadow_leaf(store, old_leaf)?;
        new.insert(Key::from_slice(key), value.to_vec());

        let max_size = store.node_size();
        let leaves = if new.encoded_size() <= max_size {
            vec![new]
        } else {
            // Split at the count midpoint, then rebalance by encoded
            // size: with lopsided value sizes one half can still be over
            // the limit.
            let split_at = new.len() / 2;
            let upper = new.split_off(split_at);
            let mut sibling = LeafNode::from_pairs(store.new_id()?, upper);
            if sibling.encoded_size() > max_size {
                while sibling.encoded_size() > max_size {
                    if let Some((k, v)) = sibling.pop_first() {
                        new.insert(k, v);
                    }
                }
            } else if new.encoded_size() > max_size {
                while new.encoded_size() > max_size {
                    if let Some((k, v)) = new.pop_last() {
                        sibling.insert(k, v);
                    }
                }
            }
            trace!(left = new.id(), right = sibling.id(), "split leaf node");
            vec![new, sibling]
        };

        for leaf in &leaves {
            store.put_node(Node::Leaf(leaf.clone()))?;
        }
        Ok(leaves)
    }

    /// Remove a key, or fail with `KeyNotFound`. Removing the same key
    /// twice fails on the second call.
    pub fn remove<S: NodeStore>(&mut self, store: &mut S, key: &[u8]) -> Result<()> {
        check_key_size(store, key)?;
        // Presence check with a read-only descent: a miss must not leave
        // freshly shadowed nodes behind.
        self.lookup(store, key)?;

        let Some(root_id) = self.root else {
            return Err(Error::KeyNotFound);
        };
        let root = store.get_node(root_id)?;
        let new_root = self.remove_from_index(store, as_index(&root)?, key)?;
        self.set_root(store, Node::Index(new_root))?;
        self.reduce_height(store)
    }

    fn remove_from_index<S: NodeStore>(
        &mut self,
        store: &mut S,
        old_index: &IndexNode,
        key: &[u8],
    ) -> Result<IndexNode> {
        let (child_key, child_id) = old_index
            .find_child(key)
            .map(|(k, child)| (k.clone(), child))
            .ok_or(Error::KeyNotFound)?;
        let mut new_index = shadow_index(store, old_index)?;
        let child = store.get_node(child_id)?;

        match &*child {
            Node::Index(child_index) => {
                let new_kid = self.remove_from_index(store, child_index, key)?;
                new_index.remove(&child_key);
                if !new_kid.is_empty() {
                    self.add_or_merge(store, &mut new_index, Node::Index(new_kid))?;
                } else if new_kid.id() != child_id {
                    decrement(store, new_kid.id())?;
                }
                decrement(store, child_id)?;
            }
            Node::Leaf(child_leaf) => {
                let mut leaf = shadow_leaf(store, child_leaf)?;
                if leaf.remove(key).is_none() {
                    return Err(Error::KeyNotFound);
                }
                let leaf_id = leaf.id();
                let leaf_is_empty = leaf.is_empty();
                store.put_node(Node::Leaf(leaf.clone()))?;
                new_index.remove(&child_key);
                if !leaf_is_empty {
                    self.add_or_merge(store, &mut new_index, Node::Leaf(leaf))?;
                } else if leaf_id != child_id {
                    decrement(store, leaf_id)?;
                }
                decrement(store, child_id)?;
            }
        }

        store.put_node(Node::Index(new_index.clone()))?;
        Ok(new_index)
    }

    /// Hang `node` back under `parent`, merging it with a neighbor
    /// sibling when the result fits in one node, or borrowing entries
    /// from the neighbor when `node` is an underfull index node.
    fn add_or_merge<S: NodeStore>(
        &mut self,
        store: &mut S,
        parent: &mut IndexNode,
        node: Node,
    ) -> Result<()> {
        let original_id = node.id();
        let key = node_first_key(&node)?.clone();
        let pos = parent
            .entries()
            .partition_point(|(k, _)| k.as_slice() < key.as_slice());

        let mut merged = None;
        if pos > 0 {
            merged = self.try_merge(store, parent, &node, pos - 1)?;
        }
        if merged.is_none() && pos < parent.len() {
            merged = self.try_merge(store, parent, &node, pos)?;
        }
        let new_node = merged.unwrap_or(node);

        store.put_node(new_node.clone())?;
        parent.add(node_first_key(&new_node)?.clone(), new_node.id());
        store.increment_refcount(new_node.id())?;
        if new_node.id() != original_id {
            // merging shadowed the node again; retire the intermediate
            decrement(store, original_id)?;
        }
        Ok(())
    }

    fn try_merge<S: NodeStore>(
        &mut self,
        store: &mut S,
        parent: &mut IndexNode,
        node: &Node,
        sibling_pos: usize,
    ) -> Result<Option<Node>> {
        let (sibling_key, sibling_id) = parent.entries()[sibling_pos].clone();
        let sibling = store.get_node(sibling_id)?;

        match (node, &*sibling) {
            (Node::Leaf(leaf), Node::Leaf(sibling_leaf)) => {
                if leaf.encoded_size() + sibling_leaf.encoded_size() > store.node_size() {
                    return Ok(None);
                }
                trace!(node = leaf.id(), sibling = sibling_id, "merging leaf nodes");
                let mut combined = shadow_leaf(store, leaf)?;
                for (k, v) in sibling_leaf.pairs() {
                    combined.insert(k.clone(), v.clone());
                }
                store.put_node(Node::Leaf(combined.clone()))?;
                parent.remove(&sibling_key);
                decrement(store, sibling_id)?;
                Ok(Some(Node::Leaf(combined)))
            }
            (Node::Index(index), Node::Index(sibling_index)) => {
                let max_len = store.max_index_pairs();
                if index.len() + sibling_index.len() <= max_len {
                    trace!(node = index.id(), sibling = sibling_id, "merging index nodes");
                    let mut combined = shadow_index(store, index)?;
                    for (k, child) in sibling_index.entries() {
                        combined.add(k.clone(), *child);
                        store.increment_refcount(*child)?;
                    }
                    store.put_node(Node::Index(combined.clone()))?;
                    parent.remove(&sibling_key);
                    decrement(store, sibling_id)?;
                    Ok(Some(Node::Index(combined)))
                } else if index.len() < max_len / 2 {
                    self.redistribute(store, parent, index, sibling_index, sibling_pos)
                        .map(Some)
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    /// The merge would overflow but `index` is underfull: borrow entries
    /// from the sibling until `index` meets the minimum fill, leaving the
    /// sibling at or above it too. Moving an entry does not change its
    /// child's parent count, so no refcounts move with the entries.
    fn redistribute<S: NodeStore>(
        &mut self,
        store: &mut S,
        parent: &mut IndexNode,
        index: &IndexNode,
        sibling_index: &IndexNode,
        sibling_pos: usize,
    ) -> Result<Node> {
        let min_len = store.max_index_pairs() / 2;
        let (sibling_key, sibling_id) = parent.entries()[sibling_pos].clone();
        let sibling_is_left = sibling_key.as_slice() < index_first_key(index)?.as_slice();

        let mut node = shadow_index(store, index)?;
        let mut sibling = shadow_index(store, sibling_index)?;
        trace!(
            node = node.id(),
            sibling = sibling.id(),
            "redistributing index entries"
        );
        while node.len() < min_len && sibling.len() > min_len {
            let entry = if sibling_is_left {
                sibling.pop_last_entry()
            } else {
                sibling.pop_first_entry()
            };
            let Some((k, child)) = entry else { break };
            node.add(k, child);
        }

        store.put_node(Node::Index(sibling.clone()))?;
        parent.remove(&sibling_key);
        parent.add(index_first_key(&sibling)?.clone(), sibling.id());
        if sibling.id() != sibling_id {
            store.increment_refcount(sibling.id())?;
            decrement(store, sibling_id)?;
        }
        Ok(Node::Index(node))
    }

    /// Collapse single-entry index roots into their child, repeatedly.
    /// Stops at a leaf child or one that is shared with another tree.
    fn reduce_height<S: NodeStore>(&mut self, store: &mut S) -> Result<()> {
        loop {
            let Some(root_id) = self.root else {
                return Ok(());
            };
            let root = store.get_node(root_id)?;
            let Node::Index(index) = &*root else {
                return Ok(());
            };
            if index.len() != 1 {
                return Ok(());
            }
            let child_id = index.entries()[0].1;
            if store.get_refcount(child_id)? != 1 {
                return Ok(());
            }
            let child = store.get_node(child_id)?;
            if child.is_leaf() {
                return Ok(());
            }
            trace!(old_root = root_id, new_root = child_id, "shallowing tree");
            // Hold an extra count across set_root: retiring the old root
            // decrements the child once, and set_root then pins it at 1.
            store.set_refcount(child_id, 2)?;
            let child = (*child).clone();
            self.set_root(store, child)?;
        }
    }

    /// Remove every key in `[lo, hi]`, both bounds inclusive.
    ///
    /// Deliberately a loop of point removes: O(k log n), but each step
    /// reuses the well-tested single-key path and every intermediate
    /// state is a valid tree. A bulk subtree-pruning traversal would be
    /// faster and is a known future improvement.
    pub fn remove_range<S: NodeStore>(&mut self, store: &mut S, lo: &[u8], hi: &[u8]) -> Result<()> {
        check_key_size(store, lo)?;
        check_key_size(store, hi)?;
        loop {
            let Some(key) = self.first_key_at_least(store, lo)? else {
                return Ok(());
            };
            if key.as_slice() > hi {
                return Ok(());
            }
            self.remove(store, &key)?;
        }
    }

    /// Smallest key `>= lo`, if any.
    fn first_key_at_least<S: NodeStore>(&self, store: &mut S, lo: &[u8]) -> Result<Option<Key>> {
        let Some(root_id) = self.root else {
            return Ok(None);
        };
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            match &*store.get_node(id)? {
                Node::Leaf(leaf) => {
                    if let Some((key, _)) =
                        leaf.pairs().iter().find(|(k, _)| k.as_slice() >= lo)
                    {
                        return Ok(Some(key.clone()));
                    }
                }
                Node::Index(index) => {
                    stack.extend(index.children_from(lo).into_iter().rev());
                }
            }
        }
        Ok(None)
    }

    /// Replace the tree's root, retiring the old one and pinning the new
    /// root's refcount at 1.
    pub(crate) fn set_root<S: NodeStore>(&mut self, store: &mut S, new_root: Node) -> Result<()> {
        let new_id = new_root.id();
        if let Some(old_id) = self.root {
            if old_id != new_id {
                decrement(store, old_id)?;
            }
        }
        store.put_node(new_root)?;
        self.root = Some(new_id);
        store.set_refcount(new_id, 1)
    }
}

fn check_key_size<S: NodeStore>(store: &S, key: &[u8]) -> Result<()> {
    if key.len() != store.key_size() {
        return Err(Error::WrongKeySize {
            got: key.len(),
            wanted: store.key_size(),
        });
    }
    Ok(())
}

fn check_value_size<S: NodeStore>(store: &S, value: &[u8]) -> Result<()> {
    if value.len() > store.max_value_size() {
        return Err(Error::ValueTooLarge {
            got: value.len(),
            max: store.max_value_size(),
        });
    }
    Ok(())
}

fn as_index(node: &Arc<Node>) -> Result<&IndexNode> {
    node.as_index().ok_or_else(|| {
        Error::CorruptNode(format!("node {:#x} should be an index node", node.id()))
    })
}

fn node_first_key(node: &Node) -> Result<&Key> {
    node.first_key()
        .ok_or_else(|| Error::CorruptNode(format!("node {:#x} is unexpectedly empty", node.id())))
}

fn index_first_key(index: &IndexNode) -> Result<&Key> {
    index.first_key().ok_or_else(|| {
        Error::CorruptNode(format!("index node {:#x} is unexpectedly empty", index.id()))
    })
}

fn first_entry(index: &IndexNode) -> Result<(Key, NodeId)> {
    index
        .entries()
        .first()
        .cloned()
        .ok_or_else(|| {
            Error::CorruptNode(format!("index node {:#x} is unexpectedly empty", index.id()))
        })
}

fn new_leaf<S: NodeStore>(store: &mut S, key: &[u8], value: &[u8]) -> Result<LeafNode> {
    let id = store.new_id()?;
    Ok(LeafNode::from_pairs(
        id,
        vec![(Key::from_slice(key), value.to_vec())],
    ))
}

/// Build an index node over `entries`, bumping each child's refcount:
/// the new node is one more parent for all of them.
pub(crate) fn new_index<S: NodeStore>(
    store: &mut S,
    entries: Vec<(Key, NodeId)>,
) -> Result<IndexNode> {
    let id = store.new_id()?;
    let node = IndexNode::from_entries(id, entries);
    let children: Vec<NodeId> = node.child_ids().collect();
    for child in children {
        store.increment_refcount(child)?;
    }
    Ok(node)
}

/// Make a leaf safe to modify: itself when uniquely owned, otherwise a
/// clone under a fresh id.
fn shadow_leaf<S: NodeStore>(store: &mut S, leaf: &LeafNode) -> Result<LeafNode> {
    if store.get_refcount(leaf.id())? == 1 {
        Ok(leaf.clone())
    } else {
        let clone = leaf.with_id(store.new_id()?);
        trace!(original = leaf.id(), clone = clone.id(), "shadowed leaf");
        Ok(clone)
    }
}

/// Make an index node safe to modify. A clone is a second parent for
/// every child, so their refcounts are bumped.
fn shadow_index<S: NodeStore>(store: &mut S, index: &IndexNode) -> Result<IndexNode> {
    if store.get_refcount(index.id())? == 1 {
        Ok(index.clone())
    } else {
        let clone = index.with_id(store.new_id()?);
        let children: Vec<NodeId> = clone.child_ids().collect();
        for child in children {
            store.increment_refcount(child)?;
        }
        trace!(original = index.id(), clone = clone.id(), "shadowed index node");
        Ok(clone)
    }
}

/// Drop one reference to a node. At the last reference the node is
/// deleted and the walk continues into its children with an explicit
/// stack, so arbitrarily tall subtrees cannot overflow the call stack.
/// The count arithmetic itself lives in the store.
pub(crate) fn decrement<S: NodeStore>(store: &mut S, id: NodeId) -> Result<()> {
    let mut stack = vec![id];
    while let Some(id) = stack.pop() {
        if store.get_refcount(id)? > 1 {
            store.decrement_refcount(id)?;
        } else {
            if let Node::Index(index) = &*store.get_node(id)? {
                stack.extend(index.child_ids());
            }
            store.remove_node(id)?;
            store.set_refcount(id, 0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryNodeStore, StoreSettings};

    fn small_store() -> MemoryNodeStore {
        MemoryNodeStore::new(StoreSettings {
            key_size: 4,
            node_size: 128,
            ..StoreSettings::default()
        })
    }

    fn key(i: u32) -> [u8; 4] {
        i.to_be_bytes()
    }

    #[test]
    fn lookup_on_empty_tree_fails() {
        let mut store = small_store();
        let tree = BTree::new(None);
        assert!(matches!(
            tree.lookup(&mut store, &key(1)),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn insert_then_lookup() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        tree.insert(&mut store, &key(1), b"one").unwrap();
        assert_eq!(tree.lookup(&mut store, &key(1)).unwrap(), b"one");
        assert!(matches!(
            tree.lookup(&mut store, &key(2)),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn insert_replaces_value() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        tree.insert(&mut store, &key(1), b"first").unwrap();
        tree.insert(&mut store, &key(1), b"second").unwrap();
        assert_eq!(tree.lookup(&mut store, &key(1)).unwrap(), b"second");
        assert_eq!(tree.count_range(&mut store, &key(0), &key(9)).unwrap(), 1);
    }

    #[test]
    fn wrong_key_size_is_rejected() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        assert!(matches!(
            tree.insert(&mut store, b"toolong!", b"v"),
            Err(Error::WrongKeySize { got: 8, wanted: 4 })
        ));
        assert!(matches!(
            tree.lookup(&mut store, b"xy"),
            Err(Error::WrongKeySize { .. })
        ));
        assert!(matches!(
            tree.remove(&mut store, b"xy"),
            Err(Error::WrongKeySize { .. })
        ));
    }

    #[test]
    fn oversized_value_is_rejected_and_tree_unchanged() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        tree.insert(&mut store, &key(1), b"keep").unwrap();
        let before = tree.root_id();
        let big = vec![0xAB; 200];
        assert!(matches!(
            tree.insert(&mut store, &key(2), &big),
            Err(Error::ValueTooLarge { .. })
        ));
        assert_eq!(tree.root_id(), before);
        assert_eq!(tree.lookup(&mut store, &key(1)).unwrap(), b"keep");
        assert_eq!(tree.count_range(&mut store, &key(0), &key(9)).unwrap(), 1);
    }

    #[test]
    fn thousand_inserts_then_full_scan() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in 0..1024u32 {
            tree.insert(&mut store, &key(i), i.to_string().as_bytes())
                .unwrap();
        }
        let pairs = tree
            .lookup_range(&mut store, &key(0), &u32::MAX.to_be_bytes())
            .unwrap();
        assert_eq!(pairs.len(), 1024);
        for (i, (k, v)) in pairs.iter().enumerate() {
            assert_eq!(k.as_slice(), &key(i as u32));
            assert_eq!(v.as_slice(), i.to_string().as_bytes());
        }
    }

    #[test]
    fn descending_inserts_stay_sorted() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in (0..300u32).rev() {
            tree.insert(&mut store, &key(i), b"x").unwrap();
        }
        let pairs = tree.lookup_range(&mut store, &key(0), &key(299)).unwrap();
        assert_eq!(pairs.len(), 300);
        assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn lookup_range_is_inclusive_on_both_bounds() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in [10u32, 20, 30, 40] {
            tree.insert(&mut store, &key(i), b"v").unwrap();
        }
        let pairs = tree.lookup_range(&mut store, &key(20), &key(30)).unwrap();
        let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&key(20)[..], &key(30)[..]]);
    }

    #[test]
    fn count_and_emptiness_agree_with_lookup_range() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in 0..100u32 {
            tree.insert(&mut store, &key(i * 2), b"even").unwrap();
        }
        assert_eq!(tree.count_range(&mut store, &key(0), &key(198)).unwrap(), 100);
        assert_eq!(tree.count_range(&mut store, &key(51), &key(59)).unwrap(), 4);
        assert!(!tree.range_is_empty(&mut store, &key(0), &key(198)).unwrap());
        assert!(tree.range_is_empty(&mut store, &key(51), &key(51)).unwrap());
        assert!(BTree::new(None)
            .range_is_empty(&mut store, &key(0), &key(9))
            .unwrap());
    }

    #[test]
    fn remove_then_lookup_fails() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        tree.insert(&mut store, &key(1), b"v").unwrap();
        tree.remove(&mut store, &key(1)).unwrap();
        assert!(matches!(
            tree.lookup(&mut store, &key(1)),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn double_remove_fails_the_second_time() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        tree.insert(&mut store, &key(1), b"v").unwrap();
        tree.remove(&mut store, &key(1)).unwrap();
        assert!(matches!(
            tree.remove(&mut store, &key(1)),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn remove_half_after_splits() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in 0..300u32 {
            tree.insert(&mut store, &key(i), i.to_string().as_bytes())
                .unwrap();
        }
        for i in (0..300u32).step_by(2) {
            tree.remove(&mut store, &key(i)).unwrap();
        }
        for i in 0..300u32 {
            let found = tree.lookup(&mut store, &key(i));
            if i % 2 == 0 {
                assert!(matches!(found, Err(Error::KeyNotFound)), "key {i}");
            } else {
                assert_eq!(found.unwrap(), i.to_string().as_bytes(), "key {i}");
            }
        }
    }

    #[test]
    fn remove_everything_leaves_an_empty_tree() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in 0..200u32 {
            tree.insert(&mut store, &key(i), b"v").unwrap();
        }
        for i in 0..200u32 {
            tree.remove(&mut store, &key(i)).unwrap();
        }
        assert_eq!(
            tree.count_range(&mut store, &key(0), &u32::MAX.to_be_bytes())
                .unwrap(),
            0
        );
        // the tree is usable again afterwards
        tree.insert(&mut store, &key(7), b"back").unwrap();
        assert_eq!(tree.lookup(&mut store, &key(7)).unwrap(), b"back");
    }

    #[test]
    fn removal_shrinks_to_minimal_node_count() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in 0..200u32 {
            tree.insert(&mut store, &key(i), b"value").unwrap();
        }
        for i in 1..200u32 {
            tree.remove(&mut store, &key(i)).unwrap();
        }
        assert_eq!(tree.lookup(&mut store, &key(0)).unwrap(), b"value");

        // only the root index and its single leaf remain live
        let root_id = tree.root_id().unwrap();
        let root = store.get_node(root_id).unwrap();
        let root = root.as_index().unwrap();
        assert_eq!(root.len(), 1);
        let child = store.get_node(root.entries()[0].1).unwrap();
        assert!(child.is_leaf());

        let mut live = 0;
        for id in store.list_node_ids().unwrap() {
            if store.get_refcount(id).unwrap() > 0 {
                live += 1;
            }
        }
        assert_eq!(live, 2);
    }

    #[test]
    fn remove_range_is_inclusive() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in 0..50u32 {
            tree.insert(&mut store, &key(i), b"v").unwrap();
        }
        tree.remove_range(&mut store, &key(10), &key(19)).unwrap();
        assert_eq!(tree.count_range(&mut store, &key(0), &key(49)).unwrap(), 40);
        assert!(tree.range_is_empty(&mut store, &key(10), &key(19)).unwrap());
        assert_eq!(tree.lookup(&mut store, &key(9)).unwrap(), b"v");
        assert_eq!(tree.lookup(&mut store, &key(20)).unwrap(), b"v");
    }

    #[test]
    fn remove_range_on_empty_range_is_a_no_op() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        tree.insert(&mut store, &key(5), b"v").unwrap();
        tree.remove_range(&mut store, &key(10), &key(19)).unwrap();
        assert_eq!(tree.lookup(&mut store, &key(5)).unwrap(), b"v");
    }

    #[test]
    fn new_minimum_key_updates_leftmost_pin() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in 100..200u32 {
            tree.insert(&mut store, &key(i), b"v").unwrap();
        }
        // a key below every existing one
        tree.insert(&mut store, &key(1), b"min").unwrap();
        assert_eq!(tree.lookup(&mut store, &key(1)).unwrap(), b"min");
        let pairs = tree
            .lookup_range(&mut store, &key(0), &u32::MAX.to_be_bytes())
            .unwrap();
        assert_eq!(pairs[0].0.as_slice(), &key(1));
        assert_eq!(pairs.len(), 101);

        // the root's first entry key must equal the tree's smallest key
        let root = store.get_node(tree.root_id().unwrap()).unwrap();
        let first = root.first_key().unwrap().clone();
        assert_eq!(first.as_slice(), &key(1));
    }

    #[test]
    fn refcounts_track_parent_counts_in_a_single_tree() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in 0..500u32 {
            tree.insert(&mut store, &key(i), b"some value").unwrap();
        }
        // every live node in a single un-cloned tree has refcount 1
        let root_id = tree.root_id().unwrap();
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            assert_eq!(store.get_refcount(id).unwrap(), 1, "node {id}");
            if let Node::Index(index) = &*store.get_node(id).unwrap() {
                stack.extend(index.child_ids());
            }
        }
    }

    #[test]
    fn no_leaked_nodes_after_heavy_churn() {
        let mut store = small_store();
        let mut tree = BTree::new(None);
        for i in 0..300u32 {
            tree.insert(&mut store, &key(i), b"v").unwrap();
        }
        for i in 0..300u32 {
            if i % 3 != 0 {
                tree.remove(&mut store, &key(i)).unwrap();
            }
        }
        // every stored node is reachable from the root
        let mut reachable = std::collections::HashSet::new();
        let mut stack = vec![tree.root_id().unwrap()];
        while let Some(id) = stack.pop() {
            reachable.insert(id);
            if let Node::Index(index) = &*store.get_node(id).unwrap() {
                stack.extend(index.child_ids());
            }
        }
        for id in store.list_node_ids().unwrap() {
            assert!(reachable.contains(&id), "node {id} is unreachable garbage");
        }
    }
}
