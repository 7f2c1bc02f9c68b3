//! Index nodes: sorted keys paired with child node ids.

use crate::codec::{index_entry_size, NODE_HEADER_SIZE};
use crate::node::{Key, NodeId};

/// An index node.
///
/// Each entry `(key, child_id)` covers the key range from `key` up to but
/// excluding the next entry's key. The first key stored under `child_id`
/// is exactly `key` (the leftmost-key invariant); the tree re-pins parent
/// keys whenever a child's first key changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    id: NodeId,
    entries: Vec<(Key, NodeId)>,
    encoded_size: usize,
}

impl IndexNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            entries: Vec::new(),
            encoded_size: NODE_HEADER_SIZE,
        }
    }

    /// Build from entries that are already sorted by key.
    pub fn from_entries(id: NodeId, entries: Vec<(Key, NodeId)>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        let encoded_size = NODE_HEADER_SIZE
            + entries
                .iter()
                .map(|(k, _)| index_entry_size(k))
                .sum::<usize>();
        Self {
            id,
            entries,
            encoded_size,
        }
    }

    /// Copy of this node under a different id.
    pub fn with_id(&self, id: NodeId) -> Self {
        Self {
            id,
            entries: self.entries.clone(),
            encoded_size: self.encoded_size,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encoded_size(&self) -> usize {
        self.encoded_size
    }

    pub fn entries(&self) -> &[(Key, NodeId)] {
        &self.entries
    }

    pub fn first_key(&self) -> Option<&Key> {
        self.entries.first().map(|(k, _)| k)
    }

    pub fn child_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|(_, id)| *id)
    }

    fn position(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key))
    }

    pub fn get(&self, key: &[u8]) -> Option<NodeId> {
        self.position(key).ok().map(|i| self.entries[i].1)
    }

    /// Add an entry, replacing the child of an existing equal key.
    pub fn add(&mut self, key: Key, child_id: NodeId) {
        match self.position(&key) {
            Ok(i) => self.entries[i].1 = child_id,
            Err(i) => {
                self.encoded_size += index_entry_size(&key);
                self.entries.insert(i, (key, child_id));
            }
        }
    }

    /// Remove the entry for an exactly matching key.
    pub fn remove(&mut self, key: &[u8]) -> Option<NodeId> {
        match self.position(key) {
            Ok(i) => {
                let (k, child) = self.entries.remove(i);
                self.encoded_size -= index_entry_size(&k);
                Some(child)
            }
            Err(_) => None,
        }
    }

    /// The child that would contain `key`: the entry with the greatest
    /// key `<= key`. `None` when every entry key is greater (or the node
    /// is empty); mutation paths then descend into the first child, read
    /// paths report the key as absent.
    pub fn find_child(&self, key: &[u8]) -> Option<(&Key, NodeId)> {
        let i = match self.position(key) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let (k, child) = &self.entries[i];
        Some((k, *child))
    }

    /// Children whose subtrees may hold keys in `[lo, hi]`, in key order.
    ///
    /// Entry `i` covers keys from its own key up to the next entry's key,
    /// so it is included when its key is `<= hi` and the next entry's key
    /// (or +infinity for the last entry) is `> lo`.
    pub fn children_in_range(&self, lo: &[u8], hi: &[u8]) -> Vec<NodeId> {
        let mut hits = Vec::new();
        for (i, (key, child)) in self.entries.iter().enumerate() {
            if key.as_slice() > hi {
                break;
            }
            let next_covers = match self.entries.get(i + 1) {
                Some((next_key, _)) => next_key.as_slice() > lo,
                None => true,
            };
            if next_covers {
                hits.push(*child);
            }
        }
        hits
    }

    /// Children whose subtrees may hold keys `>= lo`, in key order.
    pub fn children_from(&self, lo: &[u8]) -> Vec<NodeId> {
        let mut hits = Vec::new();
        for (i, (_, child)) in self.entries.iter().enumerate() {
            let next_covers = match self.entries.get(i + 1) {
                Some((next_key, _)) => next_key.as_slice() > lo,
                None => true,
            };
            if next_covers {
                hits.push(*child);
            }
        }
        hits
    }

    /// Remove and return the smallest entry.
    pub fn pop_first_entry(&mut self) -> Option<(Key, NodeId)> {
        if self.entries.is_empty() {
            return None;
        }
        let (k, child) = self.entries.remove(0);
        self.encoded_size -= index_entry_size(&k);
        Some((k, child))
    }

    /// Remove and return the largest entry.
    pub fn pop_last_entry(&mut self) -> Option<(Key, NodeId)> {
        let (k, child) = self.entries.pop()?;
        self.encoded_size -= index_entry_size(&k);
        Some((k, child))
    }

    /// Move the entries from index `at` onward out of this node.
    pub fn split_off(&mut self, at: usize) -> Vec<(Key, NodeId)> {
        let tail = self.entries.split_off(at);
        self.encoded_size -= tail.iter().map(|(k, _)| index_entry_size(k)).sum::<usize>();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(bytes: &[u8]) -> Key {
        Key::from_slice(bytes)
    }

    fn node() -> IndexNode {
        IndexNode::from_entries(
            1,
            vec![(key(b"bbb"), 10), (key(b"ddd"), 20), (key(b"fff"), 30)],
        )
    }

    #[test]
    fn find_child_picks_greatest_key_at_most_target() {
        let index = node();
        assert_eq!(index.find_child(b"bbb").map(|(_, c)| c), Some(10));
        assert_eq!(index.find_child(b"ccc").map(|(_, c)| c), Some(10));
        assert_eq!(index.find_child(b"ddd").map(|(_, c)| c), Some(20));
        assert_eq!(index.find_child(b"zzz").map(|(_, c)| c), Some(30));
    }

    #[test]
    fn find_child_below_first_key_is_none() {
        let index = node();
        assert_eq!(index.find_child(b"aaa"), None);
        assert_eq!(IndexNode::new(1).find_child(b"aaa"), None);
    }

    #[test]
    fn children_in_range_gates_on_neighbor_keys() {
        let index = node();
        // [ccc, eee] can touch the subtrees starting at bbb and ddd.
        assert_eq!(index.children_in_range(b"ccc", b"eee"), vec![10, 20]);
        // [bbb, bbb] only the first.
        assert_eq!(index.children_in_range(b"bbb", b"bbb"), vec![10]);
        // Everything.
        assert_eq!(index.children_in_range(b"aaa", b"zzz"), vec![10, 20, 30]);
        // Past the last key still lands in the last subtree.
        assert_eq!(index.children_in_range(b"ggg", b"zzz"), vec![30]);
        // Entirely below the first key touches nothing.
        assert_eq!(index.children_in_range(b"aaa", b"aaz"), Vec::<NodeId>::new());
    }

    #[test]
    fn add_replaces_child_for_equal_key() {
        let mut index = node();
        index.add(key(b"ddd"), 99);
        assert_eq!(index.get(b"ddd"), Some(99));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn encoded_size_tracks_add_and_remove() {
        let mut index = IndexNode::new(1);
        assert_eq!(index.encoded_size(), NODE_HEADER_SIZE);
        index.add(key(b"abc"), 5);
        assert_eq!(index.encoded_size(), NODE_HEADER_SIZE + 3 + 8);
        index.remove(b"abc");
        assert_eq!(index.encoded_size(), NODE_HEADER_SIZE);
    }

    #[test]
    fn children_from_starts_at_covering_child() {
        let index = node();
        assert_eq!(index.children_from(b"aaa"), vec![10, 20, 30]);
        assert_eq!(index.children_from(b"ccc"), vec![10, 20, 30]);
        assert_eq!(index.children_from(b"ddd"), vec![20, 30]);
        assert_eq!(index.children_from(b"ggg"), vec![30]);
    }

    #[test]
    fn split_off_moves_upper_entries() {
        let mut index = node();
        let tail = index.split_off(1);
        assert_eq!(index.len(), 1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].1, 20);
    }
}
