//! # File Journal
//!
//! Makes a batch of file writes, overwrites, and deletes atomic across
//! crashes. The store funnels every file operation through the journal;
//! nothing under the store directory is touched directly.
//!
//! ## Staging
//!
//! - A write to `P` lands in the shadow file `P.new`, fsync'd immediately.
//!   Repeated writes to the same path collapse into the latest shadow.
//! - A delete of `P` is recorded in a tombstone list. Deleting a path
//!   with a staged shadow discards the shadow (write-then-delete never
//!   touches disk); writing a tombstoned path clears the tombstone.
//!
//! ## Commit
//!
//! ```text
//! 1. every shadow is already durable (fsync at write time)
//! 2. publish the commit record: stage journal.commit.new, fsync, rename
//! 3. rotate: rename each P.new -> P, unlink each tombstone
//! 4. remove the commit record
//! ```
//!
//! The record's presence is the durability point. It lists the tombstone
//! paths (shadows are rediscovered by scanning for `*.new`) and carries a
//! CRC-64 so a torn record is detected instead of trusted.
//!
//! ## Recovery
//!
//! On a writable open: if a commit record exists, phase 3 is replayed -
//! it is idempotent, renames of already-rotated shadows and unlinks of
//! already-deleted tombstones are no-ops. Without a record, every `*.new`
//! file is unlinked, rolling the transaction back. Any I/O or checksum
//! error during recovery fails with `JournalReplayFailed` and the store
//! must not be opened writable.
//!
//! A read-only open skips recovery entirely: shadows, tombstones, and the
//! record are invisible and reads see only the last committed state.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use tracing::trace;

use crate::config::{COMMIT_RECORD_NAME, SHADOW_SUFFIX};
use crate::error::{Error, Result};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
const RECORD_MAGIC: &[u8; 4] = b"ORBJ";

#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    allow_writes: bool,
    shadows: BTreeSet<PathBuf>,
    tombstones: BTreeSet<PathBuf>,
}

impl Journal {
    /// Open the journal for a store directory, running recovery first
    /// when writes are allowed.
    pub fn open(dir: impl Into<PathBuf>, allow_writes: bool) -> Result<Self> {
        let journal = Self {
            dir: dir.into(),
            allow_writes,
            shadows: BTreeSet::new(),
            tombstones: BTreeSet::new(),
        };
        if allow_writes {
            journal.recover()?;
        }
        Ok(journal)
    }

    pub fn allow_writes(&self) -> bool {
        self.allow_writes
    }

    fn shadow_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(SHADOW_SUFFIX);
        PathBuf::from(name)
    }

    fn is_shadow(path: &Path) -> bool {
        path.to_string_lossy().ends_with(SHADOW_SUFFIX)
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(COMMIT_RECORD_NAME)
    }

    /// Does `path` exist, as seen through any staged state?
    pub fn exists(&self, path: &Path) -> bool {
        if self.allow_writes {
            if self.tombstones.contains(path) {
                return false;
            }
            if self.shadows.contains(path) {
                return true;
            }
        }
        path.is_file()
    }

    /// Read a file, preferring its staged shadow.
    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let physical = if self.allow_writes && self.shadows.contains(path) {
            Self::shadow_path(path)
        } else {
            path.to_path_buf()
        };
        fs::read(&physical).map_err(|e| Error::io(physical, e))
    }

    /// Stage a write. Contents become visible to `read` at once and
    /// durable at the next commit.
    pub fn write(&mut self, path: &Path, contents: &[u8]) -> Result<()> {
        if !self.allow_writes {
            return Err(Error::ReadOnly);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let shadow = Self::shadow_path(path);
        let mut file = fs::File::create(&shadow).map_err(|e| Error::io(&shadow, e))?;
        file.write_all(contents).map_err(|e| Error::io(&shadow, e))?;
        file.sync_all().map_err(|e| Error::io(&shadow, e))?;
        self.shadows.insert(path.to_path_buf());
        self.tombstones.remove(path);
        Ok(())
    }

    /// Stage a delete. Fails when the path neither exists nor has a
    /// staged shadow.
    pub fn remove(&mut self, path: &Path) -> Result<()> {
        if !self.allow_writes {
            return Err(Error::ReadOnly);
        }
        let had_shadow = self.shadows.remove(path);
        if had_shadow {
            let shadow = Self::shadow_path(path);
            fs::remove_file(&shadow).map_err(|e| Error::io(shadow, e))?;
        }
        if path.is_file() {
            self.tombstones.insert(path.to_path_buf());
        } else if !had_shadow {
            return Err(Error::io(
                path,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        Ok(())
    }

    /// Files under `subdir`, as seen through staged state. Shadows show
    /// up under their final names; tombstoned files are omitted.
    pub fn list_files(&self, subdir: &Path) -> Result<Vec<PathBuf>> {
        let mut found = BTreeSet::new();
        if subdir.is_dir() {
            let mut pending = vec![subdir.to_path_buf()];
            while let Some(dir) = pending.pop() {
                let entries = fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))?;
                for entry in entries {
                    let entry = entry.map_err(|e| Error::io(&dir, e))?;
                    let path = entry.path();
                    if path.is_dir() {
                        pending.push(path);
                    } else if Self::is_shadow(&path) {
                        if self.allow_writes {
                            if let Some(target) = path.to_str().and_then(|s| {
                                s.strip_suffix(SHADOW_SUFFIX).map(PathBuf::from)
                            }) {
                                if self.shadows.contains(&target) {
                                    found.insert(target);
                                }
                            }
                        }
                    } else {
                        found.insert(path);
                    }
                }
            }
        }
        if self.allow_writes {
            for tombstone in &self.tombstones {
                found.remove(tombstone);
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Publish every staged change atomically.
    pub fn commit(&mut self) -> Result<()> {
        if !self.allow_writes {
            return Err(Error::ReadOnly);
        }
        trace!(
            shadows = self.shadows.len(),
            tombstones = self.tombstones.len(),
            "committing journal"
        );

        // Phase 2: the commit record marks the transaction durable.
        let record = encode_record(&self.dir, &self.tombstones);
        let record_path = self.record_path();
        let staged = Self::shadow_path(&record_path);
        let mut file = fs::File::create(&staged).map_err(|e| Error::io(&staged, e))?;
        file.write_all(&record).map_err(|e| Error::io(&staged, e))?;
        file.sync_all().map_err(|e| Error::io(&staged, e))?;
        fs::rename(&staged, &record_path).map_err(|e| Error::io(&record_path, e))?;

        // Phase 3: rotate shadows into place, drop tombstones.
        for target in std::mem::take(&mut self.shadows) {
            let shadow = Self::shadow_path(&target);
            fs::rename(&shadow, &target).map_err(|e| Error::io(target.clone(), e))?;
        }
        for tombstone in std::mem::take(&mut self.tombstones) {
            match fs::remove_file(&tombstone) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(tombstone, e)),
            }
        }

        // Phase 4: the record has served its purpose.
        fs::remove_file(&record_path).map_err(|e| Error::io(record_path.clone(), e))?;
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let record_path = self.record_path();
        match fs::metadata(&record_path) {
            Ok(_) => self.roll_forward(&record_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.roll_back(),
            Err(e) => Err(Error::JournalReplayFailed(format!(
                "cannot stat commit record: {e}"
            ))),
        }
    }

    /// The previous writer published its record but died mid-rotation;
    /// finish the rotation. Every step is idempotent.
    fn roll_forward(&self, record_path: &Path) -> Result<()> {
        trace!(dir = %self.dir.display(), "journal replay: rolling forward");
        let raw = fs::read(record_path)
            .map_err(|e| Error::JournalReplayFailed(format!("cannot read commit record: {e}")))?;
        let tombstones = decode_record(&self.dir, &raw)?;

        for shadow in self.scan_shadows()? {
            let target = PathBuf::from(
                shadow
                    .to_str()
                    .and_then(|s| s.strip_suffix(SHADOW_SUFFIX))
                    .ok_or_else(|| {
                        Error::JournalReplayFailed(format!(
                            "shadow path is not unicode: {}",
                            shadow.display()
                        ))
                    })?,
            );
            fs::rename(&shadow, &target).map_err(|e| {
                Error::JournalReplayFailed(format!("cannot rotate {}: {e}", shadow.display()))
            })?;
        }
        for tombstone in tombstones {
            match fs::remove_file(&tombstone) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::JournalReplayFailed(format!(
                        "cannot unlink {}: {e}",
                        tombstone.display()
                    )))
                }
            }
        }
        fs::remove_file(record_path)
            .map_err(|e| Error::JournalReplayFailed(format!("cannot drop commit record: {e}")))?;
        Ok(())
    }

    /// No record was published: the previous transaction never became
    /// durable. Drop its shadows.
    fn roll_back(&self) -> Result<()> {
        let shadows = self.scan_shadows()?;
        if !shadows.is_empty() {
            trace!(
                dir = %self.dir.display(),
                count = shadows.len(),
                "journal replay: rolling back"
            );
        }
        for shadow in shadows {
            fs::remove_file(&shadow).map_err(|e| {
                Error::JournalReplayFailed(format!("cannot unlink {}: {e}", shadow.display()))
            })?;
        }
        Ok(())
    }

    fn scan_shadows(&self) -> Result<Vec<PathBuf>> {
        let mut shadows = Vec::new();
        if !self.dir.is_dir() {
            return Ok(shadows);
        }
        let mut pending = vec![self.dir.clone()];
        while let Some(dir) = pending.pop() {
            let entries = fs::read_dir(&dir)
                .map_err(|e| Error::JournalReplayFailed(format!("cannot scan {}: {e}", dir.display())))?;
            for entry in entries {
                let entry = entry.map_err(|e| {
                    Error::JournalReplayFailed(format!("cannot scan {}: {e}", dir.display()))
                })?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if Self::is_shadow(&path) {
                    shadows.push(path);
                }
            }
        }
        Ok(shadows)
    }
}

/// Record layout: magic, u32 count, (u16 length + relative path) per
/// tombstone, u64 CRC-64 over everything before it. Big-endian.
fn encode_record(dir: &Path, tombstones: &BTreeSet<PathBuf>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(RECORD_MAGIC);
    out.extend_from_slice(&(tombstones.len() as u32).to_be_bytes());
    for tombstone in tombstones {
        let relative = tombstone
            .strip_prefix(dir)
            .unwrap_or(tombstone)
            .to_string_lossy();
        let bytes = relative.as_bytes();
        out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(bytes);
    }
    let crc = CRC64.checksum(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

fn decode_record(dir: &Path, raw: &[u8]) -> Result<Vec<PathBuf>> {
    let fail = |msg: &str| Error::JournalReplayFailed(format!("bad commit record: {msg}"));
    if raw.len() < 4 + 4 + 8 {
        return Err(fail("too short"));
    }
    let (body, crc_bytes) = raw.split_at(raw.len() - 8);
    let expected = u64::from_be_bytes(crc_bytes.try_into().unwrap());
    if CRC64.checksum(body) != expected {
        return Err(fail("checksum mismatch"));
    }
    if &body[..4] != RECORD_MAGIC {
        return Err(fail("unknown magic"));
    }
    let count = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
    let mut tombstones = Vec::with_capacity(count);
    let mut offset = 8;
    for _ in 0..count {
        if offset + 2 > body.len() {
            return Err(fail("truncated entry"));
        }
        let len = u16::from_be_bytes(body[offset..offset + 2].try_into().unwrap()) as usize;
        offset += 2;
        if offset + len > body.len() {
            return Err(fail("truncated path"));
        }
        let relative = std::str::from_utf8(&body[offset..offset + len])
            .map_err(|_| fail("non-utf8 path"))?;
        offset += len;
        tombstones.push(dir.join(relative));
    }
    Ok(tombstones)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn writable(dir: &Path) -> Journal {
        Journal::open(dir, true).unwrap()
    }

    #[test]
    fn staged_write_is_visible_but_not_published() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file");
        let mut journal = writable(dir.path());

        journal.write(&target, b"contents").unwrap();
        assert!(journal.exists(&target));
        assert_eq!(journal.read(&target).unwrap(), b"contents");
        assert!(!target.exists());

        journal.commit().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"contents");
        assert!(!Journal::shadow_path(&target).exists());
    }

    #[test]
    fn later_write_overrides_earlier() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file");
        let mut journal = writable(dir.path());

        journal.write(&target, b"first").unwrap();
        journal.write(&target, b"second").unwrap();
        journal.commit().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
    }

    #[test]
    fn write_then_delete_skips_the_write() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file");
        let mut journal = writable(dir.path());

        journal.write(&target, b"doomed").unwrap();
        journal.remove(&target).unwrap();
        assert!(!journal.exists(&target));
        journal.commit().unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn delete_then_write_revives_the_path() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file");
        let mut journal = writable(dir.path());
        journal.write(&target, b"old").unwrap();
        journal.commit().unwrap();

        journal.remove(&target).unwrap();
        assert!(!journal.exists(&target));
        journal.write(&target, b"new").unwrap();
        assert!(journal.exists(&target));
        journal.commit().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
    }

    #[test]
    fn staged_delete_hides_committed_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file");
        let mut journal = writable(dir.path());
        journal.write(&target, b"x").unwrap();
        journal.commit().unwrap();

        journal.remove(&target).unwrap();
        assert!(!journal.exists(&target));
        assert!(target.exists());
        journal.commit().unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn remove_of_unknown_path_fails() {
        let dir = tempdir().unwrap();
        let mut journal = writable(dir.path());
        assert!(journal.remove(&dir.path().join("ghost")).is_err());
    }

    #[test]
    fn list_files_sees_through_staging() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("nodes");
        let mut journal = writable(dir.path());

        journal.write(&sub.join("a"), b"1").unwrap();
        journal.commit().unwrap();
        journal.write(&sub.join("b"), b"2").unwrap();
        journal.remove(&sub.join("a")).unwrap();

        let files = journal.list_files(&sub).unwrap();
        assert_eq!(files, vec![sub.join("b")]);
    }

    #[test]
    fn uncommitted_state_rolls_back_on_reopen() {
        let dir = tempdir().unwrap();
        let committed = dir.path().join("committed");
        let staged = dir.path().join("staged");
        {
            let mut journal = writable(dir.path());
            journal.write(&committed, b"keep").unwrap();
            journal.commit().unwrap();
            journal.write(&staged, b"drop").unwrap();
            // no commit: simulated crash
        }
        let journal = writable(dir.path());
        assert!(journal.exists(&committed));
        assert!(!journal.exists(&staged));
        assert!(!Journal::shadow_path(&staged).exists());
    }

    #[test]
    fn published_record_rolls_forward_on_reopen() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("file");
        let doomed = dir.path().join("doomed");
        {
            let mut journal = writable(dir.path());
            journal.write(&doomed, b"x").unwrap();
            journal.commit().unwrap();
            journal.write(&target, b"contents").unwrap();
            journal.remove(&doomed).unwrap();
            // Simulate a crash after phase 2: publish the record by hand,
            // leaving the rotation undone.
            let record = encode_record(dir.path(), &journal.tombstones);
            fs::write(dir.path().join(COMMIT_RECORD_NAME), record).unwrap();
        }
        let journal = writable(dir.path());
        assert_eq!(journal.read(&target).unwrap(), b"contents");
        assert!(!doomed.exists());
        assert!(!dir.path().join(COMMIT_RECORD_NAME).exists());
    }

    #[test]
    fn corrupt_record_fails_replay() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(COMMIT_RECORD_NAME), b"garbage").unwrap();
        assert!(matches!(
            Journal::open(dir.path(), true),
            Err(Error::JournalReplayFailed(_))
        ));
    }

    #[test]
    fn read_only_open_ignores_staged_state() {
        let dir = tempdir().unwrap();
        let committed = dir.path().join("committed");
        let staged = dir.path().join("staged");
        {
            let mut journal = writable(dir.path());
            journal.write(&committed, b"keep").unwrap();
            journal.commit().unwrap();
            journal.write(&staged, b"pending").unwrap();
        }
        let journal = Journal::open(dir.path(), false).unwrap();
        assert!(journal.exists(&committed));
        assert!(!journal.exists(&staged));
        // the shadow survives for the next writable open
        assert!(Journal::shadow_path(&staged).exists());
    }

    #[test]
    fn read_only_journal_rejects_mutation() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::open(dir.path(), false).unwrap();
        assert!(matches!(
            journal.write(&dir.path().join("f"), b"x"),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(journal.commit(), Err(Error::ReadOnly)));
    }

    #[test]
    fn record_round_trips() {
        let dir = Path::new("/store");
        let mut tombstones = BTreeSet::new();
        tombstones.insert(dir.join("nodes/000/dead"));
        tombstones.insert(dir.join("refcounts/refcount-3"));
        let raw = encode_record(dir, &tombstones);
        let decoded = decode_record(dir, &raw).unwrap();
        assert_eq!(decoded, tombstones.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn record_detects_bit_rot() {
        let dir = Path::new("/store");
        let mut tombstones = BTreeSet::new();
        tombstones.insert(dir.join("nodes/dead"));
        let mut raw = encode_record(dir, &tombstones);
        raw[6] ^= 1;
        assert!(decode_record(dir, &raw).is_err());
    }
}
