//! Numeric and naming constants for the storage layer.
//!
//! Interdependencies:
//!
//! - `REFCOUNT_BUCKET_SIZE` fixes both the number of counts per refcount
//!   file and the bucket fan-out; refcount files are always exactly
//!   `REFCOUNT_BUCKET_SIZE * 2` bytes.
//! - `ID_PATH_LEVELS * ID_PATH_LEVEL_HEX + ID_PATH_SKIP_HEX` must not
//!   exceed 16, the number of hex digits in a u64 node id.
//! - `DEFAULT_UPLOAD_QUEUE_SIZE` should stay well above the number of
//!   nodes a single tree operation can dirty (tree height times two), so
//!   a split never forces its own halves out of the queue mid-operation.

/// Counts per refcount bucket file.
pub const REFCOUNT_BUCKET_SIZE: u64 = 32768;

/// Maximum dirty nodes parked in the upload queue before eviction.
pub const DEFAULT_UPLOAD_QUEUE_SIZE: usize = 1024;

/// Decoded nodes kept in the read cache.
pub const DEFAULT_LRU_SIZE: usize = 500;

/// Hex digits of a node id skipped before the sharded directory levels.
pub const ID_PATH_SKIP_HEX: usize = 4;

/// Number of nested shard directories under `nodes/`.
pub const ID_PATH_LEVELS: usize = 3;

/// Hex digits per shard directory name (4096-way fan-out per level).
pub const ID_PATH_LEVEL_HEX: usize = 3;

/// Store format version, `<store>/<codec>`.
pub const FORMAT_VERSION: &str = "1/1";

/// Name of the metadata file inside the store directory.
pub const METADATA_NAME: &str = "metadata";

/// Directory for node files inside the store directory.
pub const NODE_DIR: &str = "nodes";

/// Directory for refcount bucket files inside the store directory.
pub const REFCOUNT_DIR: &str = "refcounts";

/// Commit record published by the journal between its two phases.
pub const COMMIT_RECORD_NAME: &str = "journal.commit";

/// Suffix appended to a target path to form its journal shadow.
pub const SHADOW_SUFFIX: &str = ".new";
