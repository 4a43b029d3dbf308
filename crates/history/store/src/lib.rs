//! Content-addressed storage and replication surface for history segments.
//!
//! The [`SegmentStore`] owns the durable segment index, a local blob backend
//! keyed by content id, and a staging area of segment archives awaiting
//! load. Remote retrieval goes through the [`SegmentTransport`] seam; the
//! store never dials peers itself.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod archive;
mod blob;
mod swarm;
mod transport;

pub use blob::{content_id, BlobError};
pub use swarm::{swarm_key, swarm_key_seed, write_swarm_key_file, SWARM_KEY_FILE};
pub use transport::{SegmentTransport, TransportError};

use archive::ArchiveError;
use blob::BlobStore;
use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tessera_history_index::{IndexError, SegmentIndex};
use tessera_history_types::{
    BlockHeight, ContiguousHistory, CurrentStateSnapshot, HistorySnapshot, Segment,
    SegmentIndexEntry, SegmentMeta,
};
use tracing::{debug, info};

const INDEX_DIR: &str = "index";
const STAGING_DIR: &str = "staging";

/// Segment store result type.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the segment store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Segment index failure.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Blob backend failure.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// Segment archive failure.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A segment could not be fetched from the network. Lists the peers that
    /// were connected at the time, so an operator can see who was asked.
    #[error("failed to fetch segment {content_id} (connected peers: {peers:?}): {source}")]
    FetchFailed {
        /// Content id of the segment that was requested.
        content_id: String,
        /// Peers connected when the fetch failed.
        peers: Vec<String>,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },

    /// Fetched bytes do not hash to the content id they were requested by.
    #[error("fetched segment hashes to {actual}, expected {expected}")]
    ContentIdMismatch {
        /// Content id the fetch was issued for.
        expected: String,
        /// Content id of the bytes actually received.
        actual: String,
    },

    /// A snapshot artifact expected on disk is missing.
    #[error("snapshot artifact not found at {0}")]
    MissingArtifact(PathBuf),

    /// An indexed segment has no archive staged on disk.
    #[error("segment {content_id} is not staged at {path}")]
    NotStaged {
        /// Content id of the segment.
        content_id: String,
        /// Path the archive was expected at.
        path: PathBuf,
    },

    /// Store directory I/O failure.
    #[error("store storage at {path}: {source}")]
    Storage {
        /// Path the operation failed on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Segment store settings.
#[derive(Debug, Clone)]
pub struct SegmentStoreConfig {
    /// How many blocks behind the most recent segment a segment may fall
    /// before retention GC removes it.
    pub history_retention_block_span: u64,
    /// Operator override for the swarm key seed. Defaults to the chain id.
    pub swarm_key_override: Option<String>,
    /// Wipe all stored segments and index state on open.
    pub wipe_on_startup: bool,
}

impl Default for SegmentStoreConfig {
    fn default() -> Self {
        Self {
            history_retention_block_span: 604_800,
            swarm_key_override: None,
            wipe_on_startup: false,
        }
    }
}

/// An indexed segment whose archive is present in the staging area, ready to
/// be extracted and loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSegment {
    /// The index entry the archive belongs to.
    pub entry: SegmentIndexEntry,
    /// Path of the staged archive.
    pub path: PathBuf,
}

impl Segment for StagedSegment {
    fn height_from(&self) -> BlockHeight {
        self.entry.height_from()
    }

    fn height_to(&self) -> BlockHeight {
        self.entry.height_to()
    }

    fn segment_id(&self) -> &str {
        self.entry.segment_id()
    }

    fn previous_segment_id(&self) -> &str {
        self.entry.previous_segment_id()
    }
}

/// Store of history segments for one chain.
///
/// All mutating operations take `&mut self`, so publication, fetching and
/// retention GC are serialized by construction; concurrent access goes
/// through whatever lock the caller wraps the store in.
#[derive(Debug)]
pub struct SegmentStore {
    path: PathBuf,
    chain_id: String,
    config: SegmentStoreConfig,
    index: SegmentIndex,
    blobs: BlobStore,
    transport: Arc<dyn SegmentTransport>,
    swarm_key_seed: String,
}

impl SegmentStore {
    /// Opens the store at `path` for `chain_id`, creating the directory
    /// layout on first use and wiping any previous state if configured to.
    pub fn open(
        path: impl Into<PathBuf>,
        chain_id: impl Into<String>,
        config: SegmentStoreConfig,
        transport: Arc<dyn SegmentTransport>,
    ) -> StoreResult<Self> {
        let path = path.into();
        let chain_id = chain_id.into();

        if config.wipe_on_startup && path.exists() {
            info!(target: "history::store", path = %path.display(), "Wiping segment store");
            fs::remove_dir_all(&path)
                .map_err(|source| StoreError::Storage { path: path.clone(), source })?;
        }

        let staging = path.join(STAGING_DIR);
        fs::create_dir_all(&staging)
            .map_err(|source| StoreError::Storage { path: staging, source })?;

        let index = SegmentIndex::open(path.join(INDEX_DIR))?;
        let blobs = BlobStore::open(&path)?;

        let swarm_key_seed =
            swarm::swarm_key_seed(&chain_id, config.swarm_key_override.as_deref());
        swarm::write_swarm_key_file(&path, &swarm_key_seed)
            .map_err(|source| StoreError::Storage { path: path.join(SWARM_KEY_FILE), source })?;

        debug!(
            target: "history::store",
            path = %path.display(),
            %chain_id,
            segments = index.len(),
            "Opened segment store"
        );

        Ok(Self { path, chain_id, config, index, blobs, transport, swarm_key_seed })
    }

    /// Seed the swarm key is derived from.
    pub fn swarm_key_seed(&self) -> &str {
        &self.swarm_key_seed
    }

    /// Hex-encoded pre-shared swarm key.
    pub fn swarm_key(&self) -> String {
        swarm::swarm_key(&self.swarm_key_seed)
    }

    /// Addresses of the currently connected peers.
    pub async fn connected_peers(&self) -> Vec<String> {
        self.transport.connected_peers().await
    }

    /// Returns the index entry whose range ends exactly at `height_to`.
    pub fn get_entry(&self, height_to: BlockHeight) -> StoreResult<&SegmentIndexEntry> {
        Ok(self.index.get(height_to)?)
    }

    /// Returns the index entry with the greatest `height_to`.
    pub fn get_highest_entry(&self) -> StoreResult<&SegmentIndexEntry> {
        Ok(self.index.get_highest()?)
    }

    /// Returns all index entries sorted ascending by `height_from`.
    pub fn list_all_entries_oldest_first(&self) -> Vec<SegmentIndexEntry> {
        self.index.list_all_oldest_first()
    }

    /// Returns `true` if no segments are indexed.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Packs the given snapshot artifact pair into a segment archive,
    /// publishes it under its content id and indexes it, then applies
    /// retention GC. Returns the new entry.
    ///
    /// The new segment is back-linked to the entry ending exactly one block
    /// below its range; a missing predecessor leaves the link empty rather
    /// than failing, since the earliest retained segment legitimately has
    /// none.
    pub fn add_snapshot_data(
        &mut self,
        history: &HistorySnapshot,
        current_state: &CurrentStateSnapshot,
        schema_version: i64,
        source_dir: &Path,
    ) -> StoreResult<SegmentIndexEntry> {
        let history_file = source_dir.join(history.file_name());
        let current_state_file = source_dir.join(current_state.file_name());
        for file in [&history_file, &current_state_file] {
            if !file.exists() {
                return Err(StoreError::MissingArtifact(file.clone()))
            }
        }

        let previous_segment_id = self.previous_segment_id(history.height_from)?;
        let meta = SegmentMeta {
            chain_id: self.chain_id.clone(),
            height_from: history.height_from,
            height_to: history.height_to,
            previous_segment_id,
            schema_version,
        };

        let bytes = archive::pack_segment(&meta, &[&history_file, &current_state_file])?;
        let content_id = self.blobs.add_pinned(&bytes)?;
        self.write_staged_archive(&meta, &bytes)?;

        let entry = SegmentIndexEntry { meta, content_id };
        self.index.add(entry.clone())?;

        info!(
            target: "history::store",
            content_id = %entry.content_id,
            height_from = entry.meta.height_from,
            height_to = entry.meta.height_to,
            "Published history segment"
        );

        let removed = self.remove_old_history_segments()?;
        if !removed.is_empty() {
            info!(target: "history::store", removed = removed.len(), "Removed segments past retention");
        }

        Ok(entry)
    }

    /// Fetches the segment archive published under `content_id`, stages it,
    /// pins it locally and indexes it.
    ///
    /// Bytes already held locally are reused without touching the network.
    /// Fetched bytes are verified against the requested content id before
    /// anything is trusted, metadata included.
    pub async fn fetch_history_segment(
        &mut self,
        content_id: &str,
    ) -> StoreResult<SegmentIndexEntry> {
        let bytes = self.fetch_bytes(content_id).await?;

        let actual = blob::content_id(&bytes);
        if actual != content_id {
            return Err(StoreError::ContentIdMismatch {
                expected: content_id.to_owned(),
                actual,
            })
        }

        let meta = archive::read_metadata(&bytes)?;
        self.write_staged_archive(&meta, &bytes)?;
        self.blobs.add_pinned(&bytes)?;

        let entry = SegmentIndexEntry { meta, content_id: content_id.to_owned() };
        self.index.add(entry.clone())?;

        debug!(
            target: "history::store",
            %content_id,
            height_from = entry.meta.height_from,
            height_to = entry.meta.height_to,
            "Fetched history segment"
        );

        Ok(entry)
    }

    /// Copies the raw archive published under `content_id` to `target`,
    /// fetching it from peers if it is not held locally. Admin surface; the
    /// segment is neither staged nor indexed.
    pub async fn copy_history_segment_to_file(
        &self,
        content_id: &str,
        target: &Path,
    ) -> StoreResult<()> {
        let bytes = self.fetch_bytes(content_id).await?;
        fs::write(target, bytes)
            .map_err(|source| StoreError::Storage { path: target.to_path_buf(), source })
    }

    /// Removes every segment that has fallen past the retention span,
    /// oldest first, and collects the freed blobs. Returns the removed
    /// entries.
    ///
    /// With `N` the greatest indexed `height_to`, a segment is past
    /// retention when its `height_to` is below `N - retention span`. The
    /// whole pass runs under the store's exclusive borrow, so no publish or
    /// fetch can interleave with the collection.
    pub fn remove_old_history_segments(&mut self) -> StoreResult<Vec<SegmentIndexEntry>> {
        let highest = match self.index.get_highest() {
            Ok(entry) => entry.meta.height_to,
            Err(IndexError::Empty) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let cutoff = highest.saturating_sub(self.config.history_retention_block_span);

        let mut removed = Vec::new();
        for entry in self.index.list_all_oldest_first() {
            if entry.meta.height_to >= cutoff {
                break
            }

            self.blobs.unpin(&entry.content_id)?;
            self.index.remove(&entry)?;
            self.remove_staged_archive(&entry.meta)?;
            debug!(
                target: "history::store",
                content_id = %entry.content_id,
                height_to = entry.meta.height_to,
                "Removed segment past retention"
            );
            removed.push(entry);
        }

        if !removed.is_empty() {
            self.blobs.gc()?;
        }

        Ok(removed)
    }

    /// Resolves `entry` to its staged archive on disk.
    pub fn staged_segment(&self, entry: &SegmentIndexEntry) -> StoreResult<StagedSegment> {
        let path = self.staging_path().join(entry.meta.archive_file_name());
        if !path.exists() {
            return Err(StoreError::NotStaged { content_id: entry.content_id.clone(), path })
        }

        Ok(StagedSegment { entry: entry.clone(), path })
    }

    /// Resolves every segment of a contiguous run to its staged archive,
    /// oldest first. Fails on the first segment with no archive on disk.
    pub fn staged_contiguous_history(
        &self,
        history: &ContiguousHistory<SegmentIndexEntry>,
    ) -> StoreResult<Vec<StagedSegment>> {
        history.segments.iter().map(|entry| self.staged_segment(entry)).collect()
    }

    /// Extracts the snapshot artifacts of a staged segment into `dest`.
    pub fn extract_staged_segment(&self, staged: &StagedSegment, dest: &Path) -> StoreResult<()> {
        let bytes = fs::read(&staged.path)
            .map_err(|source| StoreError::Storage { path: staged.path.clone(), source })?;
        Ok(archive::unpack(&bytes, dest)?)
    }

    /// Content id of the segment ending exactly one block below
    /// `height_from`, or an empty string if no such segment is indexed.
    fn previous_segment_id(&self, height_from: BlockHeight) -> StoreResult<String> {
        let Some(previous_to) = height_from.checked_sub(1) else { return Ok(String::new()) };

        match self.index.get(previous_to) {
            Ok(entry) => Ok(entry.content_id.clone()),
            Err(IndexError::EntryNotFound(_)) => {
                debug!(
                    target: "history::store",
                    height_from,
                    "No previous segment to link, starting a new chain"
                );
                Ok(String::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn fetch_bytes(&self, content_id: &str) -> StoreResult<Vec<u8>> {
        match self.blobs.read(content_id) {
            Ok(bytes) => return Ok(bytes),
            Err(BlobError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        match self.transport.fetch(content_id).await {
            Ok(bytes) => Ok(bytes),
            Err(source) => Err(StoreError::FetchFailed {
                content_id: content_id.to_owned(),
                peers: self.transport.connected_peers().await,
                source,
            }),
        }
    }

    fn staging_path(&self) -> PathBuf {
        self.path.join(STAGING_DIR)
    }

    fn write_staged_archive(&self, meta: &SegmentMeta, bytes: &[u8]) -> StoreResult<()> {
        let path = self.staging_path().join(meta.archive_file_name());
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|source| StoreError::Storage { path, source })
    }

    fn remove_staged_archive(&self, meta: &SegmentMeta) -> StoreResult<()> {
        let path = self.staging_path().join(meta.archive_file_name());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Storage { path, source }),
        }
    }
}
