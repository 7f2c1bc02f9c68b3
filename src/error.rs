//! Error types for tamarack.

use std::path::PathBuf;

use thiserror::Error;

use crate::node::NodeId;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in a forest.
///
/// Most variants are per-call and leave the forest usable. The fatal ones
/// (`NodeMissing`, `CorruptNode`, `JournalReplayFailed`) poison the forest:
/// subsequent calls fail with `ForestUnusable` until it is re-opened.
#[derive(Error, Debug)]
pub enum Error {
    /// Key length does not match the forest's key size
    #[error("key is {got} bytes, forest uses {wanted}-byte keys")]
    WrongKeySize { got: usize, wanted: usize },

    /// Value does not fit in half a node
    #[error("value is {got} bytes, at most {max} fit in a node")]
    ValueTooLarge { got: usize, max: usize },

    /// Lookup or remove on a key that is not in the tree
    #[error("key not found")]
    KeyNotFound,

    /// Refcounts say a node is alive but storage has no trace of it
    #[error("node {0:#x} cannot be found in the node store")]
    NodeMissing(NodeId),

    /// Encoded node rejected by the codec
    #[error("corrupt node: {0}")]
    CorruptNode(String),

    /// Node grew past the configured node size
    #[error("node {id:#x} is too big ({size} bytes, limit {limit})")]
    NodeTooBig { id: NodeId, size: usize, limit: usize },

    /// Cloning would push a refcount past u16::MAX
    #[error("refcount for node {0:#x} would overflow")]
    RefcountOverflow(NodeId),

    /// Metadata missing, unknown format, or inconsistent open parameters
    #[error("store format problem: {0}")]
    FormatProblem(String),

    /// I/O error while recovering the journal; do not open writable
    #[error("journal replay failed: {0}")]
    JournalReplayFailed(String),

    /// Mutating call on a store opened read-only
    #[error("store is opened read-only")]
    ReadOnly,

    /// A fatal error was seen earlier; the forest must be re-opened
    #[error("forest is unusable after a fatal error; re-open it")]
    ForestUnusable,

    /// Underlying filesystem error
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors after which a forest may not be used without re-opening.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::NodeMissing(_) | Error::CorruptNode(_) | Error::JournalReplayFailed(_)
        )
    }
}
