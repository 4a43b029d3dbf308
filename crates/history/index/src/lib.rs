//! Durable, height-keyed index of network history segments.
//!
//! Maps the *upper* bound of a segment's height range to its
//! [`SegmentIndexEntry`]; callers must query with `height_to`. Entries are
//! created when a segment is locally produced or fetched from a peer (the
//! index cannot distinguish origin) and removed only by retention GC.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Path, PathBuf},
};
use tessera_history_types::{BlockHeight, Segment, SegmentIndexEntry};
use tracing::debug;

/// File the index entries are persisted into, inside the index directory.
const ENTRIES_FILE: &str = "entries.json";

/// Errors that can occur while reading or mutating the segment index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// No entry exists with the given `height_to`. Recoverable; callers
    /// branch on this explicitly.
    #[error("no index entry for height {0}")]
    EntryNotFound(BlockHeight),

    /// The index holds no entries at all.
    #[error("index is empty")]
    Empty,

    /// The index directory or entries file could not be read or written.
    /// Fatal at node startup.
    #[error("index storage at {path}: {source}")]
    Storage {
        /// Index path the operation failed on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The persisted entries file is not valid JSON.
    #[error("corrupt index entries file at {path}: {source}")]
    Corrupt {
        /// Entries file path.
        path: PathBuf,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// Durable record store mapping `height_to` to a [`SegmentIndexEntry`].
///
/// All mutations are persisted before returning; the on-disk format is a
/// JSON array rewritten atomically (write-then-rename), so a crash mid-write
/// leaves the previous state intact.
#[derive(Debug)]
pub struct SegmentIndex {
    path: PathBuf,
    entries: BTreeMap<BlockHeight, SegmentIndexEntry>,
}

impl SegmentIndex {
    /// Opens the index at `path`, creating the directory if needed and
    /// loading any previously persisted entries.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        fs::create_dir_all(&path)
            .map_err(|source| IndexError::Storage { path: path.clone(), source })?;

        let entries_file = path.join(ENTRIES_FILE);
        let entries = match fs::read(&entries_file) {
            Ok(bytes) => {
                let list: Vec<SegmentIndexEntry> = serde_json::from_slice(&bytes)
                    .map_err(|source| IndexError::Corrupt { path: entries_file, source })?;
                list.into_iter().map(|entry| (entry.meta.height_to, entry)).collect()
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(IndexError::Storage { path: entries_file, source }),
        };

        debug!(target: "history::index", path = %path.display(), entries = entries.len(), "Opened segment index");

        Ok(Self { path, entries })
    }

    /// Returns the entry whose range ends exactly at `height_to`.
    pub fn get(&self, height_to: BlockHeight) -> Result<&SegmentIndexEntry, IndexError> {
        self.entries.get(&height_to).ok_or(IndexError::EntryNotFound(height_to))
    }

    /// Returns the entry with the greatest `height_to`.
    pub fn get_highest(&self) -> Result<&SegmentIndexEntry, IndexError> {
        self.entries.values().next_back().ok_or(IndexError::Empty)
    }

    /// Adds `entry`, keyed by its `height_to`. Idempotent under retry: an
    /// entry with the same key overwrites the previous one.
    pub fn add(&mut self, entry: SegmentIndexEntry) -> Result<(), IndexError> {
        self.entries.insert(entry.meta.height_to, entry);
        self.persist()
    }

    /// Removes `entry`, keyed by its `height_to`. Removing an absent entry
    /// is a no-op.
    pub fn remove(&mut self, entry: &SegmentIndexEntry) -> Result<(), IndexError> {
        self.entries.remove(&entry.meta.height_to);
        self.persist()
    }

    /// Returns all entries sorted ascending by `height_from`.
    ///
    /// The sort is an explicit post-sort, not an ordering guarantee of the
    /// underlying storage.
    pub fn list_all_oldest_first(&self) -> Vec<SegmentIndexEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.height_from());
        entries
    }

    /// Number of entries currently indexed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<(), IndexError> {
        let entries_file = self.path.join(ENTRIES_FILE);
        let entries: Vec<_> = self.entries.values().collect();
        let bytes = serde_json::to_vec_pretty(&entries)
            .map_err(|source| IndexError::Corrupt { path: entries_file.clone(), source })?;

        let tmp_file = self.path.join(format!("{ENTRIES_FILE}.tmp"));
        write_and_rename(&tmp_file, &entries_file, &bytes)
            .map_err(|source| IndexError::Storage { path: entries_file, source })
    }
}

fn write_and_rename(tmp: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    fs::write(tmp, bytes)?;
    fs::rename(tmp, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tessera_history_types::SegmentMeta;

    fn entry(from: BlockHeight, to: BlockHeight) -> SegmentIndexEntry {
        SegmentIndexEntry {
            meta: SegmentMeta {
                chain_id: "chain".to_owned(),
                height_from: from,
                height_to: to,
                previous_segment_id: String::new(),
                schema_version: 1,
            },
            content_id: format!("cid-{to}"),
        }
    }

    #[test]
    fn get_is_keyed_by_height_to() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SegmentIndex::open(dir.path()).unwrap();
        index.add(entry(0, 1000)).unwrap();

        assert_eq!(index.get(1000).unwrap().content_id, "cid-1000");
        assert_matches!(index.get(0), Err(IndexError::EntryNotFound(0)));
    }

    #[test]
    fn add_with_same_key_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SegmentIndex::open(dir.path()).unwrap();
        index.add(entry(0, 1000)).unwrap();

        let mut replacement = entry(0, 1000);
        replacement.content_id = "cid-replaced".to_owned();
        index.add(replacement).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(1000).unwrap().content_id, "cid-replaced");
    }

    #[test]
    fn highest_entry_and_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SegmentIndex::open(dir.path()).unwrap();
        assert_matches!(index.get_highest(), Err(IndexError::Empty));

        index.add(entry(0, 1000)).unwrap();
        index.add(entry(2001, 3000)).unwrap();
        index.add(entry(1001, 2000)).unwrap();

        assert_eq!(index.get_highest().unwrap().meta.height_to, 3000);
    }

    #[test]
    fn listing_is_sorted_by_height_from() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SegmentIndex::open(dir.path()).unwrap();
        index.add(entry(2001, 3000)).unwrap();
        index.add(entry(0, 1000)).unwrap();
        index.add(entry(1001, 2000)).unwrap();

        let froms: Vec<_> =
            index.list_all_oldest_first().iter().map(|e| e.meta.height_from).collect();
        assert_eq!(froms, vec![0, 1001, 2001]);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut index = SegmentIndex::open(dir.path()).unwrap();
            index.add(entry(0, 1000)).unwrap();
            index.add(entry(1001, 2000)).unwrap();
        }

        let index = SegmentIndex::open(dir.path()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get_highest().unwrap().meta.height_to, 2000);
    }

    #[test]
    fn remove_deletes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SegmentIndex::open(dir.path()).unwrap();
        let first = entry(0, 1000);
        index.add(first.clone()).unwrap();
        index.add(entry(1001, 2000)).unwrap();

        index.remove(&first).unwrap();
        assert_matches!(index.get(1000), Err(IndexError::EntryNotFound(1000)));

        let index = SegmentIndex::open(dir.path()).unwrap();
        assert_eq!(index.len(), 1);
    }
}
