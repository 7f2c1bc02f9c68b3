//! # Consistency Checker
//!
//! Walks every tree in a forest and verifies the structural invariants
//! that hold at commit boundaries:
//!
//! 1. every reachable node decodes and is present in the store
//! 2. encoded size of every node is within `node_size`
//! 3. index nodes are within the entry-count bounds (root exempt)
//! 4. each index entry's key equals the first key of its child subtree
//! 5. every key has the forest's key size
//! 6. refcounts equal the observed parent count plus the is-root flag
//! 7. stored node files and nonzero refcounts match one-to-one
//! 8. `last_id` is at least every id in use
//!
//! Shared subtrees are walked once but contribute a parent count on
//! every edge, mirroring how the trees maintain refcounts.
//!
//! The checker reports problems, it does not stop at the first one. The
//! separate repair pass ([`fix_dangling`]) drops index entries whose
//! child is missing - the one corruption that can be patched without
//! guessing at data - by rewriting the damaged nodes directly.

use std::collections::HashSet;
use std::fmt;

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::forest::Forest;
use crate::node::{Node, NodeId};
use crate::store::NodeStore;

/// One detected inconsistency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    MissingNode {
        id: NodeId,
        referenced_by: Option<NodeId>,
    },
    OversizedNode {
        id: NodeId,
        size: usize,
        limit: usize,
    },
    IndexEntryCount {
        id: NodeId,
        len: usize,
        min: usize,
        max: usize,
    },
    LeftmostKeyMismatch {
        parent: NodeId,
        child: NodeId,
    },
    WrongKeySize {
        id: NodeId,
        got: usize,
        wanted: usize,
    },
    RefcountMismatch {
        id: NodeId,
        stored: u16,
        expected: u64,
    },
    UnreferencedNode {
        id: NodeId,
    },
    MissingNodeFile {
        id: NodeId,
        refcount: u16,
    },
    StaleLastId {
        last_id: u64,
        seen: NodeId,
    },
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::MissingNode { id, referenced_by } => match referenced_by {
                Some(parent) => {
                    write!(f, "node {id:#x} referenced by {parent:#x} is missing")
                }
                None => write!(f, "tree root {id:#x} is missing"),
            },
            Problem::OversizedNode { id, size, limit } => {
                write!(f, "node {id:#x} encodes to {size} bytes, limit {limit}")
            }
            Problem::IndexEntryCount { id, len, min, max } => {
                write!(f, "index node {id:#x} has {len} entries, expected {min}..={max}")
            }
            Problem::LeftmostKeyMismatch { parent, child } => write!(
                f,
                "index entry in {parent:#x} does not match first key of child {child:#x}"
            ),
            Problem::WrongKeySize { id, got, wanted } => {
                write!(f, "node {id:#x} holds a {got}-byte key, forest uses {wanted}")
            }
            Problem::RefcountMismatch {
                id,
                stored,
                expected,
            } => write!(
                f,
                "node {id:#x} has refcount {stored}, {expected} parent(s) observed"
            ),
            Problem::UnreferencedNode { id } => {
                write!(f, "stored node {id:#x} has refcount 0")
            }
            Problem::MissingNodeFile { id, refcount } => {
                write!(f, "refcount {refcount} for node {id:#x} but no stored node")
            }
            Problem::StaleLastId { last_id, seen } => {
                write!(f, "last_id is {last_id} but node {seen:#x} exists")
            }
        }
    }
}

/// Check every invariant. Returns one entry per violation; an empty
/// vector means the forest is clean.
pub fn check<S: NodeStore>(forest: &mut Forest<S>) -> Result<Vec<Problem>> {
    let mut problems = Vec::new();
    let mut expected: HashMap<NodeId, u64> = HashMap::new();
    let roots: Vec<NodeId> = forest
        .tree_ids()
        .into_iter()
        .filter_map(|t| forest.root_id(t).ok().flatten())
        .collect();
    let root_set: HashSet<NodeId> = roots.iter().copied().collect();

    let store = forest.store_mut();
    let node_size = store.node_size();
    let key_size = store.key_size();
    let max_len = store.max_index_pairs();
    let min_len = max_len / 2;

    // Walk each shared subtree once; count every referencing edge.
    let mut stack: Vec<(NodeId, Option<NodeId>)> = Vec::new();
    for &root in &roots {
        let seen = expected.contains_key(&root);
        *expected.entry(root).or_default() += 1;
        if !seen {
            stack.push((root, None));
        }
    }

    while let Some((id, parent)) = stack.pop() {
        trace!(id, "checking node");
        let node = match store.get_node(id) {
            Ok(node) => node,
            Err(Error::NodeMissing(_)) => {
                problems.push(Problem::MissingNode {
                    id,
                    referenced_by: parent,
                });
                continue;
            }
            Err(e) => return Err(e),
        };

        if node.encoded_size() > node_size {
            problems.push(Problem::OversizedNode {
                id,
                size: node.encoded_size(),
                limit: node_size,
            });
        }

        match &*node {
            Node::Leaf(leaf) => {
                for (key, _) in leaf.pairs() {
                    if key.len() != key_size {
                        problems.push(Problem::WrongKeySize {
                            id,
                            got: key.len(),
                            wanted: key_size,
                        });
                    }
                }
            }
            Node::Index(index) => {
                let is_root = root_set.contains(&id);
                let len_ok = if is_root {
                    index.len() <= max_len
                } else {
                    (min_len..=max_len).contains(&index.len())
                };
                if !len_ok {
                    problems.push(Problem::IndexEntryCount {
                        id,
                        len: index.len(),
                        min: if is_root { 0 } else { min_len },
                        max: max_len,
                    });
                }
                for (key, child_id) in index.entries() {
                    if key.len() != key_size {
                        problems.push(Problem::WrongKeySize {
                            id,
                            got: key.len(),
                            wanted: key_size,
                        });
                    }
                    let seen = expected.contains_key(child_id);
                    *expected.entry(*child_id).or_default() += 1;
                    if !seen {
                        stack.push((*child_id, Some(id)));
                    }
                    // leftmost-key pinning
                    if let Ok(child) = store.get_node(*child_id) {
                        match child.first_key() {
                            Some(first) if first == key => {}
                            _ => problems.push(Problem::LeftmostKeyMismatch {
                                parent: id,
                                child: *child_id,
                            }),
                        }
                    }
                }
            }
        }
    }

    // Refcounts must equal observed parents plus the is-root flag.
    for (&id, &count) in &expected {
        let stored = store.get_refcount(id)?;
        if u64::from(stored) != count {
            problems.push(Problem::RefcountMismatch {
                id,
                stored,
                expected: count,
            });
        }
    }

    // Stored nodes and nonzero refcounts must match one-to-one.
    let stored_ids: HashSet<NodeId> = store.list_node_ids()?.into_iter().collect();
    let mut counted_ids = HashSet::new();
    for (id, refcount) in store.nonzero_refcounts()? {
        counted_ids.insert(id);
        if !stored_ids.contains(&id) {
            problems.push(Problem::MissingNodeFile { id, refcount });
        }
    }
    let last_id = store.last_id();
    for &id in &stored_ids {
        if !counted_ids.contains(&id) {
            problems.push(Problem::UnreferencedNode { id });
        }
        if id > last_id {
            problems.push(Problem::StaleLastId { last_id, seen: id });
        }
    }

    problems.sort_by_key(problem_order);
    debug!(problems = problems.len(), "forest check finished");
    Ok(problems)
}

fn problem_order(problem: &Problem) -> (u8, NodeId) {
    match problem {
        Problem::MissingNode { id, .. } => (0, *id),
        Problem::OversizedNode { id, .. } => (1, *id),
        Problem::IndexEntryCount { id, .. } => (2, *id),
        Problem::LeftmostKeyMismatch { parent, .. } => (3, *parent),
        Problem::WrongKeySize { id, .. } => (4, *id),
        Problem::RefcountMismatch { id, .. } => (5, *id),
        Problem::UnreferencedNode { id } => (6, *id),
        Problem::MissingNodeFile { id, .. } => (7, *id),
        Problem::StaleLastId { seen, .. } => (8, *seen),
    }
}

/// Drop index entries whose child node is missing, rewriting the
/// damaged index nodes in place. Returns the problems that were fixed.
pub fn fix_dangling<S: NodeStore>(forest: &mut Forest<S>) -> Result<Vec<Problem>> {
    let roots: Vec<NodeId> = forest
        .tree_ids()
        .into_iter()
        .filter_map(|t| forest.root_id(t).ok().flatten())
        .collect();
    let store = forest.store_mut();
    let mut fixed = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<NodeId> = roots;

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Ok(node) = store.get_node(id) else {
            continue;
        };
        let Node::Index(index) = &*node else {
            continue;
        };

        let mut patched = index.clone();
        let mut dropped = Vec::new();
        for (key, child_id) in index.entries() {
            match store.get_node(*child_id) {
                Ok(_) => stack.push(*child_id),
                Err(Error::NodeMissing(_)) => {
                    dropped.push((key.clone(), *child_id));
                }
                Err(e) => return Err(e),
            }
        }
        if !dropped.is_empty() {
            for (key, child_id) in &dropped {
                patched.remove(key);
                fixed.push(Problem::MissingNode {
                    id: *child_id,
                    referenced_by: Some(id),
                });
            }
            store.put_node(Node::Index(patched))?;
        }
    }
    Ok(fixed)
}
