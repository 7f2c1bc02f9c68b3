//! # On-Disk Node Store
//!
//! Stores each node in its own file under a sharded directory tree, with
//! refcounts in bucketed files and forest metadata in an INI-style file.
//! Every write goes through the journal, so the on-disk state only ever
//! changes at commit, atomically.
//!
//! ## Read Path
//!
//! `get_node` checks the read cache, then the upload queue, then decodes
//! the node file. Decoded nodes enter the read cache; queue hits do not,
//! the queue itself is the faster tier.
//!
//! ## Write Path
//!
//! `put_node` parks the node in the upload queue. Only when the queue
//! overflows, or at commit, is a node encoded and staged with the
//! journal. A node that is superseded or removed while queued never
//! reaches the encoder; with copy-on-write shadowing creating short-lived
//! nodes constantly, this elision carries most of the write-path savings.
//!
//! ## Opening
//!
//! An existing store is recognized by its metadata file. The stored
//! `format` must match exactly and the stored `key_size` must equal the
//! caller's; a differing `node_size` is accepted silently and the stored
//! value wins (long-standing behavior callers rely on). `open_existing`
//! skips the size arguments entirely and adopts whatever the store has.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashSet;
use tracing::{debug, trace};

use crate::codec::NodeCodec;
use crate::config::{FORMAT_VERSION, METADATA_NAME, NODE_DIR, REFCOUNT_DIR};
use crate::error::{Error, Result};
use crate::node::{Node, NodeId};
use crate::store::cache::LruCache;
use crate::store::id_path::IdPath;
use crate::store::journal::Journal;
use crate::store::metadata::Metadata;
use crate::store::refcount::RefcountStore;
use crate::store::upload_queue::UploadQueue;
use crate::store::{NodeStore, OpenMode, StoreSettings};

#[derive(Debug)]
pub struct DiskNodeStore {
    dirname: PathBuf,
    codec: NodeCodec,
    node_size: usize,
    read_only: bool,
    last_id: u64,
    metadata: Metadata,
    journal: Journal,
    id_path: IdPath,
    refcounts: RefcountStore,
    cache: LruCache<NodeId, Arc<Node>>,
    queue: UploadQueue,
}

impl DiskNodeStore {
    /// Open or create a store at `dirname` with explicit sizes.
    pub fn open(
        dirname: impl AsRef<Path>,
        settings: StoreSettings,
        mode: OpenMode,
    ) -> Result<Self> {
        Self::open_with(dirname.as_ref(), Some(settings), mode)
    }

    /// Open an existing store, adopting its stored sizes.
    pub fn open_existing(dirname: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        Self::open_with(dirname.as_ref(), None, mode)
    }

    fn open_with(
        dirname: &Path,
        settings: Option<StoreSettings>,
        mode: OpenMode,
    ) -> Result<Self> {
        let read_only = mode.is_read_only();
        if !read_only {
            std::fs::create_dir_all(dirname).map_err(|e| Error::io(dirname, e))?;
        }

        let journal = Journal::open(dirname, !read_only)?;
        let metadata_path = dirname.join(METADATA_NAME);

        let mut metadata = Metadata::new();
        let mut stored_key_size = None;
        let mut stored_node_size = None;
        let mut last_id = 0;
        if journal.exists(&metadata_path) {
            let raw = journal.read(&metadata_path)?;
            let text = String::from_utf8(raw).map_err(|_| {
                Error::FormatProblem(format!(
                    "metadata at {} is not UTF-8",
                    metadata_path.display()
                ))
            })?;
            metadata = Metadata::parse(&text)?;
            match metadata.get("format") {
                None => {
                    return Err(Error::FormatProblem(format!(
                        "store format missing (old version?): {}",
                        dirname.display()
                    )))
                }
                Some(format) if format != FORMAT_VERSION => {
                    return Err(Error::FormatProblem(format!(
                        "store format is incompatible (is {format}, should be {FORMAT_VERSION}): {}",
                        dirname.display()
                    )))
                }
                Some(_) => {}
            }
            stored_key_size = metadata.get_u64("key_size")?;
            stored_node_size = metadata.get_u64("node_size")?;
            last_id = metadata.get_u64("last_id")?.unwrap_or(0);
        } else if read_only {
            return Err(Error::FormatProblem(format!(
                "no store at {}",
                dirname.display()
            )));
        }

        let (key_size, node_size) = match (stored_key_size, &settings) {
            (Some(stored), Some(given)) => {
                if stored != given.key_size as u64 {
                    return Err(Error::FormatProblem(format!(
                        "store has key size {stored}, caller wanted {}",
                        given.key_size
                    )));
                }
                // a differing node_size is accepted; the stored value wins
                let node_size = stored_node_size.unwrap_or(given.node_size as u64);
                (stored as usize, node_size as usize)
            }
            (Some(stored), None) => match stored_node_size {
                Some(node_size) => (stored as usize, node_size as usize),
                None => {
                    return Err(Error::FormatProblem(format!(
                        "store metadata is missing node_size: {}",
                        dirname.display()
                    )))
                }
            },
            (None, Some(given)) => (given.key_size, given.node_size),
            (None, None) => {
                return Err(Error::FormatProblem(format!(
                    "no store at {} and no sizes were given",
                    dirname.display()
                )))
            }
        };

        let (queue_size, lru_size) = match settings {
            Some(s) => (s.upload_queue_size, s.lru_size),
            None => {
                let d = StoreSettings::default();
                (d.upload_queue_size, d.lru_size)
            }
        };

        debug!(
            dir = %dirname.display(),
            key_size,
            node_size,
            last_id,
            read_only,
            "opened node store"
        );

        Ok(Self {
            dirname: dirname.to_path_buf(),
            codec: NodeCodec::new(key_size),
            node_size,
            read_only,
            last_id,
            metadata,
            journal,
            id_path: IdPath::new(dirname.join(NODE_DIR)),
            refcounts: RefcountStore::new(dirname.join(REFCOUNT_DIR)),
            cache: LruCache::new(lru_size),
            queue: UploadQueue::new(queue_size),
        })
    }

    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn metadata_path(&self) -> PathBuf {
        self.dirname.join(METADATA_NAME)
    }

    /// Encode a node and stage it with the journal.
    fn write_out(&mut self, node: &Node) -> Result<()> {
        let encoded = self.codec.encode(node);
        if encoded.len() > self.node_size {
            return Err(Error::NodeTooBig {
                id: node.id(),
                size: encoded.len(),
                limit: self.node_size,
            });
        }
        let path = self.id_path.convert(node.id());
        trace!(id = node.id(), path = %path.display(), "writing node");
        self.journal.write(&path, &encoded)
    }
}

impl NodeStore for DiskNodeStore {
    fn key_size(&self) -> usize {
        self.codec.key_size()
    }

    fn node_size(&self) -> usize {
        self.node_size
    }

    fn max_value_size(&self) -> usize {
        self.codec.max_value_size(self.node_size)
    }

    fn max_index_pairs(&self) -> usize {
        self.codec.max_index_pairs(self.node_size)
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn last_id(&self) -> u64 {
        self.last_id
    }

    fn new_id(&mut self) -> Result<NodeId> {
        self.check_writable()?;
        self.last_id += 1;
        Ok(self.last_id)
    }

    fn get_node(&mut self, id: NodeId) -> Result<Arc<Node>> {
        if let Some(node) = self.cache.get(&id) {
            return Ok(node.clone());
        }
        if let Some(node) = self.queue.get(id) {
            return Ok(node);
        }

        let path = self.id_path.convert(id);
        if !self.journal.exists(&path) {
            return Err(Error::NodeMissing(id));
        }
        let encoded = self.journal.read(&path).map_err(|_| Error::NodeMissing(id))?;
        let node = self.codec.decode(&encoded)?;
        if node.id() != id {
            return Err(Error::CorruptNode(format!(
                "file for node {id:#x} contains node {:#x}",
                node.id()
            )));
        }
        let node = Arc::new(node);
        self.cache.insert(id, node.clone());
        Ok(node)
    }

    fn put_node(&mut self, node: Node) -> Result<()> {
        self.check_writable()?;
        let node = Arc::new(node);
        self.cache.insert(node.id(), node.clone());
        if let Some((_, evicted)) = self.queue.put(node) {
            self.write_out(&evicted)?;
        }
        Ok(())
    }

    fn remove_node(&mut self, id: NodeId) -> Result<()> {
        self.check_writable()?;
        self.cache.take(&id);
        let was_queued = self.queue.remove(id);
        let path = self.id_path.convert(id);
        if self.journal.exists(&path) {
            self.journal.remove(&path)?;
        } else if !was_queued {
            return Err(Error::NodeMissing(id));
        }
        Ok(())
    }

    fn list_node_ids(&mut self) -> Result<Vec<NodeId>> {
        let mut ids: HashSet<NodeId> = self.queue.ids().into_iter().collect();
        for path in self.journal.list_files(self.id_path.base())? {
            if let Some(id) = IdPath::parse(&path) {
                ids.insert(id);
            }
        }
        let mut ids: Vec<NodeId> = ids.into_iter().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn get_refcount(&mut self, id: NodeId) -> Result<u16> {
        self.refcounts.get(&self.journal, id)
    }

    fn set_refcount(&mut self, id: NodeId, count: u16) -> Result<()> {
        self.check_writable()?;
        self.refcounts.set(id, count);
        Ok(())
    }

    fn increment_refcount(&mut self, id: NodeId) -> Result<u16> {
        self.check_writable()?;
        self.refcounts.incr(&self.journal, id)
    }

    fn decrement_refcount(&mut self, id: NodeId) -> Result<u16> {
        self.check_writable()?;
        self.refcounts.decr(&self.journal, id)
    }

    fn nonzero_refcounts(&mut self) -> Result<Vec<(NodeId, u16)>> {
        self.refcounts.nonzero_ids(&self.journal)
    }

    fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(str::to_string)
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.metadata.set(key, value);
        Ok(())
    }

    fn remove_metadata(&mut self, key: &str) -> Result<Option<String>> {
        self.check_writable()?;
        Ok(self.metadata.remove(key))
    }

    fn metadata_keys(&self) -> Vec<String> {
        self.metadata.keys()
    }

    fn commit(&mut self) -> Result<()> {
        self.check_writable()?;
        trace!(
            queued = self.queue.len(),
            cache_hits = self.cache.hits(),
            cache_misses = self.cache.misses(),
            "committing node store"
        );

        for (_, node) in self.queue.drain() {
            self.write_out(&node)?;
        }
        self.refcounts.flush(&mut self.journal)?;

        self.metadata.set("format", FORMAT_VERSION);
        self.metadata.set("key_size", &self.codec.key_size().to_string());
        self.metadata.set("node_size", &self.node_size.to_string());
        self.metadata.set("last_id", &self.last_id.to_string());
        self.journal
            .write(&self.metadata_path(), self.metadata.serialize().as_bytes())?;

        self.journal.commit()
    }
}
