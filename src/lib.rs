//! # Tamarack - Copy-on-Write B-Tree Forest
//!
//! Tamarack is a persistent key/value storage engine built around
//! copy-on-write B-trees, in the style of Rodeh's "B-trees, Shadowing,
//! and Clones". Several trees live together in a **forest** and share
//! unchanged nodes; cloning a tree copies only its root.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tamarack::{DiskNodeStore, Forest, OpenMode, StoreSettings};
//!
//! let settings = StoreSettings {
//!     key_size: 8,
//!     node_size: 4096,
//!     ..StoreSettings::default()
//! };
//! let store = DiskNodeStore::open("./mydb", settings, OpenMode::ReadWrite)?;
//! let mut forest = Forest::open(store)?;
//!
//! let t = forest.new_tree()?;
//! forest.insert(t, b"19740919", b"first value")?;
//! let snapshot = forest.clone_tree(t)?;
//! forest.insert(t, b"19740919", b"second value")?;
//! forest.commit()?;
//!
//! assert_eq!(forest.lookup(snapshot, b"19740919")?, b"first value");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Forest (trees, commit)       │
//! ├─────────────────────────────────────┤
//! │     BTree (CoW insert/remove/scan)  │
//! ├─────────────────────────────────────┤
//! │  NodeStore trait                    │
//! │  ├── MemoryNodeStore                │
//! │  └── DiskNodeStore                  │
//! │      ├── LRU read cache             │
//! │      ├── Upload queue (dirty nodes) │
//! │      ├── RefcountStore              │
//! │      └── Journal (atomic commits)   │
//! ├─────────────────────────────────────┤
//! │   NodeCodec (fixed binary format)   │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! database_dir/
//! ├── metadata                  # INI-style forest metadata
//! ├── journal.commit            # transient commit record
//! ├── nodes/
//! │   └── 000/000/000/<hex-id>  # one file per node, sharded by id
//! └── refcounts/
//!     └── refcount-<bucket>     # 32768 big-endian u16 counts each
//! ```
//!
//! ## Durability Model
//!
//! Every mutation between two `Forest::commit` calls is volatile. Commit
//! pushes dirty nodes and refcounts through a file journal that stages
//! shadow files, publishes a commit record, and then rotates shadows into
//! place; a crash at any point recovers to either the previous or the new
//! committed state, never a mixture.
//!
//! ## Module Overview
//!
//! - [`codec`]: binary node encode/decode
//! - [`node`]: in-memory leaf and index nodes
//! - [`store`]: node store trait, disk and memory backends, journal
//! - [`tree`]: copy-on-write B-tree algorithms
//! - [`forest`]: tree collection, cloning, commit
//! - [`fsck`]: consistency checker

pub mod codec;
pub mod config;
mod error;
pub mod forest;
pub mod fsck;
pub mod node;
pub mod store;
pub mod tree;

pub use codec::NodeCodec;
pub use error::{Error, Result};
pub use forest::{Forest, TreeId};
pub use node::{IndexNode, Key, LeafNode, Node, NodeId};
pub use store::{DiskNodeStore, MemoryNodeStore, NodeStore, OpenMode, StoreSettings};
pub use tree::BTree;
