//! # Id Path Sharding
//!
//! Every node is stored in its own file. With millions of nodes a flat
//! directory becomes unmanageable, so node files are sharded into nested
//! directories derived from the id.
//!
//! The id is formatted as 16 hex digits (big-endian, zero padded). The
//! top `ID_PATH_SKIP_HEX` digits are skipped - they are zero for any
//! realistic forest - and the next `ID_PATH_LEVELS` groups of
//! `ID_PATH_LEVEL_HEX` digits become directory names. The file itself is
//! named with the full 16-digit id, so the mapping round-trips from the
//! file name alone:
//!
//! ```text
//! id 0x1a2b3c  ->  nodes/000/000/1a2/00000000001a2b3c
//! ```

use std::path::{Path, PathBuf};

use crate::config::{ID_PATH_LEVELS, ID_PATH_LEVEL_HEX, ID_PATH_SKIP_HEX};
use crate::node::NodeId;

#[derive(Debug, Clone)]
pub struct IdPath {
    base: PathBuf,
}

impl IdPath {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the node file for `id`.
    pub fn convert(&self, id: NodeId) -> PathBuf {
        let hex = format!("{id:016x}");
        let mut path = self.base.clone();
        for level in 0..ID_PATH_LEVELS {
            let start = ID_PATH_SKIP_HEX + level * ID_PATH_LEVEL_HEX;
            path.push(&hex[start..start + ID_PATH_LEVEL_HEX]);
        }
        path.push(&hex);
        path
    }

    /// Recover the id from a node file path. `None` for paths that were
    /// not produced by `convert`.
    pub fn parse(path: &Path) -> Option<NodeId> {
        let name = path.file_name()?.to_str()?;
        if name.len() != 16 {
            return None;
        }
        NodeId::from_str_radix(name, 16).ok()
    }
}
