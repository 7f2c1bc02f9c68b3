//! # Refcount Store
//!
//! Every node has a 16-bit reference count: the number of index entries
//! pointing at it across all trees, plus one if it is itself a tree root.
//! A count of zero means the node does not exist; the store deletes the
//! node file when a count drops to zero.
//!
//! Counts are persisted in buckets so one file never holds more than
//! `REFCOUNT_BUCKET_SIZE` counts. An id maps to bucket `id % bucket_size`
//! and to slot `id / bucket_size` within the bucket's file, which is a
//! flat array of big-endian u16 values. A file that would be all zeros is
//! deleted at flush instead of written, so sparse forests stay sparse on
//! disk.
//!
//! Buckets load lazily and stay cached. Loading never clobbers counts
//! that were changed in memory since the last flush.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use hashbrown::{HashMap, HashSet};
use tracing::trace;

use crate::config::REFCOUNT_BUCKET_SIZE;
use crate::error::{Error, Result};
use crate::node::NodeId;
use crate::store::journal::Journal;
use crate::store::{lowered_refcount, raised_refcount};

#[derive(Debug)]
pub struct RefcountStore {
    dir: PathBuf,
    counts: HashMap<NodeId, u16>,
    dirty: HashSet<NodeId>,
    loaded_buckets: HashSet<u64>,
}

impl RefcountStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counts: HashMap::new(),
            dirty: HashSet::new(),
            loaded_buckets: HashSet::new(),
        }
    }

    fn bucket_of(id: NodeId) -> u64 {
        id % REFCOUNT_BUCKET_SIZE
    }

    fn slot_of(id: NodeId) -> usize {
        (id / REFCOUNT_BUCKET_SIZE) as usize
    }

    fn bucket_path(&self, bucket: u64) -> PathBuf {
        self.dir.join(format!("refcount-{bucket}"))
    }

    fn parse_bucket_name(path: &Path) -> Option<u64> {
        path.file_name()?
            .to_str()?
            .strip_prefix("refcount-")?
            .parse()
            .ok()
    }

    pub fn get(&mut self, journal: &Journal, id: NodeId) -> Result<u16> {
        self.load_bucket(journal, Self::bucket_of(id))?;
        Ok(self.counts.get(&id).copied().unwrap_or(0))
    }

    pub fn set(&mut self, id: NodeId, count: u16) {
        if count == 0 {
            self.counts.remove(&id);
        } else {
            self.counts.insert(id, count);
        }
        self.dirty.insert(id);
    }

    pub fn incr(&mut self, journal: &Journal, id: NodeId) -> Result<u16> {
        let next = raised_refcount(id, self.get(journal, id)?)?;
        self.set(id, next);
        Ok(next)
    }

    pub fn decr(&mut self, journal: &Journal, id: NodeId) -> Result<u16> {
        let next = lowered_refcount(self.get(journal, id)?);
        self.set(id, next);
        Ok(next)
    }

    fn load_bucket(&mut self, journal: &Journal, bucket: u64) -> Result<()> {
        if !self.loaded_buckets.insert(bucket) {
            return Ok(());
        }
        let path = self.bucket_path(bucket);
        if !journal.exists(&path) {
            return Ok(());
        }
        let raw = journal.read(&path)?;
        let expected = REFCOUNT_BUCKET_SIZE as usize * 2;
        if raw.len() != expected {
            return Err(Error::FormatProblem(format!(
                "refcount bucket {} is {} bytes, expected {expected}",
                path.display(),
                raw.len()
            )));
        }
        for slot in 0..REFCOUNT_BUCKET_SIZE as usize {
            let count = u16::from_be_bytes([raw[slot * 2], raw[slot * 2 + 1]]);
            if count == 0 {
                continue;
            }
            let id = slot as u64 * REFCOUNT_BUCKET_SIZE + bucket;
            // in-memory changes win over what the file says
            if !self.dirty.contains(&id) {
                self.counts.insert(id, count);
            }
        }
        Ok(())
    }

    /// Write every bucket with dirty counts through the journal.
    pub fn flush(&mut self, journal: &mut Journal) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let buckets: BTreeSet<u64> = self.dirty.iter().map(|&id| Self::bucket_of(id)).collect();
        trace!(buckets = buckets.len(), "flushing refcounts");
        for bucket in buckets {
            // merge with what is already on disk before rewriting the file
            self.load_bucket(journal, bucket)?;
            let mut raw = vec![0u8; REFCOUNT_BUCKET_SIZE as usize * 2];
            let mut any = false;
            for slot in 0..REFCOUNT_BUCKET_SIZE as usize {
                let id = slot as u64 * REFCOUNT_BUCKET_SIZE + bucket;
                if let Some(&count) = self.counts.get(&id) {
                    raw[slot * 2..slot * 2 + 2].copy_from_slice(&count.to_be_bytes());
                    any = true;
                }
            }
            let path = self.bucket_path(bucket);
            if any {
                journal.write(&path, &raw)?;
            } else if journal.exists(&path) {
                journal.remove(&path)?;
            }
        }
        self.dirty.clear();
        Ok(())
    }

    /// Every id with a nonzero count, loading all buckets present on disk.
    pub fn nonzero_ids(&mut self, journal: &Journal) -> Result<Vec<(NodeId, u16)>> {
        for path in journal.list_files(&self.dir.clone())? {
            if let Some(bucket) = Self::parse_bucket_name(&path) {
                self.load_bucket(journal, bucket)?;
            }
        }
        let mut out: Vec<(NodeId, u16)> = self.counts.iter().map(|(&id, &c)| (id, c)).collect();
        out.sort_unstable();
        Ok(out)
    }
}
