//! # Forest
//!
//! A forest is an ordered collection of B-trees over one node store.
//! Trees in the same forest share every node they have in common, which
//! is what makes cloning a tree cheap: the clone gets a fresh root node
//! with the same entries, each direct child gains one parent, and
//! copy-on-write takes over from there. Up to 65535 clones of a tree can
//! coexist before a shared node's refcount would overflow.
//!
//! Trees are addressed through stable [`TreeId`] handles; the handles
//! are per-session, while the on-disk identity of a tree is its root
//! node id in the `root_ids` metadata list.
//!
//! ## Durability
//!
//! Nothing a forest does is durable until [`Forest::commit`] returns:
//! it flushes the store's upload queue and refcounts, rewrites the
//! metadata (including `root_ids` and `last_id`), and commits the
//! journal. A crash between commits falls back to the previous committed
//! state on the next open.
//!
//! ## Poisoning
//!
//! A journal replay failure, a corrupt node, or a missing node leaves
//! the in-memory state untrustworthy. After any of those the forest
//! refuses further work with `ForestUnusable` until it is re-opened.

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::node::{Node, NodeId};
use crate::store::NodeStore;
use crate::tree::{self, BTree};

/// Stable per-session handle to a tree in a forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(u64);

#[derive(Debug)]
pub struct Forest<S: NodeStore> {
    store: S,
    trees: Vec<(TreeId, BTree)>,
    next_handle: u64,
    poisoned: bool,
}

impl<S: NodeStore> Forest<S> {
    /// Open the forest recorded in the store's metadata. A store without
    /// metadata yields an empty forest.
    pub fn open(store: S) -> Result<Self> {
        let mut forest = Self {
            store,
            trees: Vec::new(),
            next_handle: 0,
            poisoned: false,
        };
        if let Some(raw) = forest.store.get_metadata("root_ids") {
            for piece in raw.split(',') {
                let piece = piece.trim();
                if piece.is_empty() {
                    continue;
                }
                let root: NodeId = piece.parse().map_err(|_| {
                    Error::FormatProblem(format!("bad root id in metadata: {piece:?}"))
                })?;
                let handle = forest.next_tree_handle();
                forest.trees.push((handle, BTree::new(Some(root))));
            }
        }
        debug!(trees = forest.trees.len(), "opened forest");
        Ok(forest)
    }

    fn next_tree_handle(&mut self) -> TreeId {
        self.next_handle += 1;
        TreeId(self.next_handle)
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            Err(Error::ForestUnusable)
        } else {
            Ok(())
        }
    }

    /// Flag the forest unusable after errors that invalidate in-memory
    /// state.
    fn note<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.poisoned = true;
            }
        }
        result
    }

    /// Trees in creation order.
    pub fn tree_ids(&self) -> Vec<TreeId> {
        self.trees.iter().map(|(id, _)| *id).collect()
    }

    /// Root node id of a tree.
    pub fn root_id(&self, tree: TreeId) -> Result<Option<NodeId>> {
        Ok(self.tree_ref(tree)?.root_id())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn tree_index(&self, tree: TreeId) -> Result<usize> {
        self.trees
            .iter()
            .position(|(id, _)| *id == tree)
            .ok_or(Error::KeyNotFound)
    }

    fn tree_ref(&self, tree: TreeId) -> Result<&BTree> {
        let i = self.tree_index(tree)?;
        Ok(&self.trees[i].1)
    }

    /// Create a new, empty tree.
    pub fn new_tree(&mut self) -> Result<TreeId> {
        self.check_usable()?;
        let root = tree::new_index(&mut self.store, Vec::new())?;
        let mut btree = BTree::new(None);
        btree.set_root(&mut self.store, Node::Index(root))?;
        let handle = self.next_tree_handle();
        trace!(root = ?btree.root_id(), "created empty tree");
        self.trees.push((handle, btree));
        Ok(handle)
    }

    /// Clone a tree. Only the root is copied; everything below is shared
    /// until one side mutates it. Fails with `RefcountOverflow` when any
    /// direct child already has 65535 parents, leaving the forest
    /// untouched.
    pub fn clone_tree(&mut self, source: TreeId) -> Result<TreeId> {
        self.check_usable()?;
        let source_root = self
            .tree_ref(source)?
            .root_id()
            .ok_or(Error::KeyNotFound)?;
        let result = self.clone_tree_inner(source_root);
        self.note(result)
    }

    fn clone_tree_inner(&mut self, source_root: NodeId) -> Result<TreeId> {
        let root = self.store.get_node(source_root)?;
        let Node::Index(root) = &*root else {
            return Err(Error::CorruptNode(format!(
                "tree root {source_root:#x} is not an index node"
            )));
        };
        // refuse cleanly before bumping anything
        for child in root.child_ids() {
            if self.store.get_refcount(child)? == u16::MAX {
                return Err(Error::RefcountOverflow(child));
            }
        }
        let entries = root.entries().to_vec();
        let new_root = tree::new_index(&mut self.store, entries)?;
        let mut btree = BTree::new(None);
        btree.set_root(&mut self.store, Node::Index(new_root))?;
        let handle = self.next_tree_handle();
        trace!(
            source = source_root,
            clone = ?btree.root_id(),
            "cloned tree"
        );
        self.trees.push((handle, btree));
        Ok(handle)
    }

    /// Remove a tree, releasing every node that only it referenced.
    /// Physical deletion of node files happens at commit.
    pub fn remove_tree(&mut self, tree: TreeId) -> Result<()> {
        self.check_usable()?;
        let i = self.tree_index(tree)?;
        let root = self.trees[i].1.root_id();
        if let Some(root) = root {
            let result = tree::decrement(&mut self.store, root);
            self.note(result)?;
        }
        self.trees.remove(i);
        trace!(?root, "removed tree");
        Ok(())
    }

    pub fn insert(&mut self, tree: TreeId, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_usable()?;
        let i = self.tree_index(tree)?;
        let result = self.trees[i].1.insert(&mut self.store, key, value);
        self.note(result)
    }

    pub fn lookup(&mut self, tree: TreeId, key: &[u8]) -> Result<Vec<u8>> {
        self.check_usable()?;
        let i = self.tree_index(tree)?;
        let result = self.trees[i].1.lookup(&mut self.store, key);
        self.note(result)
    }

    pub fn lookup_range(
        &mut self,
        tree: TreeId,
        lo: &[u8],
        hi: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_usable()?;
        let i = self.tree_index(tree)?;
        let result = self.trees[i].1.lookup_range(&mut self.store, lo, hi);
        self.note(result)
    }

    pub fn count_range(&mut self, tree: TreeId, lo: &[u8], hi: &[u8]) -> Result<u64> {
        self.check_usable()?;
        let i = self.tree_index(tree)?;
        let result = self.trees[i].1.count_range(&mut self.store, lo, hi);
        self.note(result)
    }

    pub fn range_is_empty(&mut self, tree: TreeId, lo: &[u8], hi: &[u8]) -> Result<bool> {
        self.check_usable()?;
        let i = self.tree_index(tree)?;
        let result = self.trees[i].1.range_is_empty(&mut self.store, lo, hi);
        self.note(result)
    }

    pub fn remove(&mut self, tree: TreeId, key: &[u8]) -> Result<()> {
        self.check_usable()?;
        let i = self.tree_index(tree)?;
        let result = self.trees[i].1.remove(&mut self.store, key);
        self.note(result)
    }

    pub fn remove_range(&mut self, tree: TreeId, lo: &[u8], hi: &[u8]) -> Result<()> {
        self.check_usable()?;
        let i = self.tree_index(tree)?;
        let result = self.trees[i].1.remove_range(&mut self.store, lo, hi);
        self.note(result)
    }

    /// Persist everything: after a successful commit the on-disk state
    /// matches memory and satisfies every structural invariant.
    pub fn commit(&mut self) -> Result<()> {
        self.check_usable()?;
        let root_ids: Vec<String> = self
            .trees
            .iter()
            .filter_map(|(_, t)| t.root_id())
            .map(|id| id.to_string())
            .collect();
        self.store.set_metadata("root_ids", &root_ids.join(","))?;
        debug!(trees = root_ids.len(), "committing forest");
        let result = self.store.commit();
        self.note(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryNodeStore, StoreSettings};

    fn forest() -> Forest<MemoryNodeStore> {
        Forest::open(MemoryNodeStore::new(StoreSettings {
            key_size: 4,
            node_size: 128,
            ..StoreSettings::default()
        }))
        .unwrap()
    }

    fn key(i: u32) -> [u8; 4] {
        i.to_be_bytes()
    }

    #[test]
    fn new_tree_starts_empty() {
        let mut forest = forest();
        let t = forest.new_tree().unwrap();
        assert!(matches!(
            forest.lookup(t, &key(1)),
            Err(Error::KeyNotFound)
        ));
        assert_eq!(forest.count_range(t, &key(0), &key(100)).unwrap(), 0);
    }

    #[test]
    fn trees_are_independent() {
        let mut forest = forest();
        let a = forest.new_tree().unwrap();
        let b = forest.new_tree().unwrap();
        forest.insert(a, &key(1), b"in a").unwrap();
        assert!(matches!(forest.lookup(b, &key(1)), Err(Error::KeyNotFound)));
        assert_eq!(forest.lookup(a, &key(1)).unwrap(), b"in a");
    }

    #[test]
    fn clone_shares_until_mutation() {
        let mut forest = forest();
        let a = forest.new_tree().unwrap();
        for i in 0..100u32 {
            forest.insert(a, &key(i), b"original").unwrap();
        }
        let b = forest.clone_tree(a).unwrap();

        // clone sees everything
        assert_eq!(forest.count_range(b, &key(0), &key(99)).unwrap(), 100);

        // mutating the clone leaves the original bit-identical
        for i in 0..50u32 {
            forest.insert(b, &key(i), b"changed").unwrap();
        }
        forest.remove(b, &key(99)).unwrap();
        assert_eq!(forest.lookup(a, &key(0)).unwrap(), b"original");
        assert_eq!(forest.lookup(a, &key(99)).unwrap(), b"original");
        assert_eq!(forest.count_range(a, &key(0), &key(99)).unwrap(), 100);
        assert_eq!(forest.lookup(b, &key(0)).unwrap(), b"changed");

        // and vice versa
        forest.insert(a, &key(7), b"back").unwrap();
        assert_eq!(forest.lookup(b, &key(7)).unwrap(), b"changed");
    }

    #[test]
    fn remove_tree_releases_unique_nodes() {
        let mut forest = forest();
        let a = forest.new_tree().unwrap();
        for i in 0..100u32 {
            forest.insert(a, &key(i), b"v").unwrap();
        }
        let b = forest.clone_tree(a).unwrap();
        forest.remove_tree(a).unwrap();
        // the clone still works
        assert_eq!(forest.count_range(b, &key(0), &key(99)).unwrap(), 100);
        forest.remove_tree(b).unwrap();
        // with both trees gone, every node has been released
        assert!(forest.store_mut().list_node_ids().unwrap().is_empty());
    }

    #[test]
    fn removed_tree_handle_is_rejected() {
        let mut forest = forest();
        let a = forest.new_tree().unwrap();
        forest.remove_tree(a).unwrap();
        assert!(forest.lookup(a, &key(1)).is_err());
        assert!(forest.remove_tree(a).is_err());
    }

    #[test]
    fn clone_chain_preserves_each_generation() {
        let mut forest = forest();
        let a = forest.new_tree().unwrap();
        for i in 0..64u32 {
            forest.insert(a, &key(i), b"v").unwrap();
        }
        let b = forest.clone_tree(a).unwrap();
        for i in 0..64u32 {
            if i % 2 == 1 {
                forest.remove(b, &key(i)).unwrap();
            }
        }
        let c = forest.clone_tree(b).unwrap();
        for i in 0..64u32 {
            if i % 2 == 1 {
                forest.insert(c, &key(i), b"v").unwrap();
            }
        }
        let d = forest.clone_tree(c).unwrap();
        for i in 0..64u32 {
            if i % 2 == 0 {
                forest.remove(d, &key(i)).unwrap();
            }
        }

        assert_eq!(forest.count_range(a, &key(0), &key(63)).unwrap(), 64);
        assert_eq!(forest.count_range(b, &key(0), &key(63)).unwrap(), 32);
        assert_eq!(forest.count_range(c, &key(0), &key(63)).unwrap(), 64);
        assert_eq!(forest.count_range(d, &key(0), &key(63)).unwrap(), 32);
    }

    #[test]
    fn refcount_overflow_fails_cleanly() {
        let mut forest = forest();
        let a = forest.new_tree().unwrap();
        forest.insert(a, &key(1), b"v").unwrap();
        // push the root's only child to the refcount ceiling by hand
        let root = forest.root_id(a).unwrap().unwrap();
        let child = {
            let node = forest.store_mut().get_node(root).unwrap();
            node.as_index().unwrap().entries()[0].1
        };
        forest.store_mut().set_refcount(child, u16::MAX).unwrap();

        assert!(matches!(
            forest.clone_tree(a),
            Err(Error::RefcountOverflow(_))
        ));
        // the forest stays usable; overflow is not a fatal error
        assert_eq!(forest.lookup(a, &key(1)).unwrap(), b"v");
    }

    #[test]
    fn fatal_error_poisons_the_forest() {
        let mut forest = forest();
        let a = forest.new_tree().unwrap();
        forest.insert(a, &key(1), b"v").unwrap();
        // sabotage: drop the root node behind the forest's back
        let root = forest.root_id(a).unwrap().unwrap();
        forest.store_mut().remove_node(root).unwrap();

        assert!(matches!(
            forest.lookup(a, &key(1)),
            Err(Error::NodeMissing(_))
        ));
        assert!(matches!(
            forest.lookup(a, &key(1)),
            Err(Error::ForestUnusable)
        ));
        assert!(matches!(forest.commit(), Err(Error::ForestUnusable)));
    }
}
