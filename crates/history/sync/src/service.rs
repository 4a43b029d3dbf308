//! The node-facing history service.

use crate::{SyncError, SyncResult};
use rusqlite::Connection;
use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};
use tessera_history_snapshot::{
    catalog::{self, BlockSpan},
    HistoryToLoad, LoadResult, SnapshotLoader,
};
use tessera_history_store::SegmentStore;
use tessera_history_types::{
    ContiguousHistory, CurrentStateSnapshot, HistorySnapshot, SegmentIndexEntry,
};
use tracing::debug;

/// Everything bootstrap needs from the node: its local block span, its
/// segment holdings and the ability to fetch and load more.
///
/// Split out as a trait so the synchronization protocol can be exercised
/// against fakes.
#[async_trait::async_trait]
pub trait HistoryService: fmt::Debug + Send + Sync {
    /// The span of blocks the database currently holds.
    async fn datanode_block_span(&self) -> SyncResult<BlockSpan>;

    /// Seed this node derives its swarm key from.
    fn swarm_key_seed(&self) -> String;

    /// Fetches, stages and indexes the segment published under
    /// `content_id`.
    async fn fetch_history_segment(&self, content_id: &str) -> SyncResult<SegmentIndexEntry>;

    /// All locally indexed segments, oldest first.
    async fn list_all_history_segments(&self) -> SyncResult<Vec<SegmentIndexEntry>>;

    /// Loads a contiguous run of locally staged segments into the database.
    async fn load_history_into_datanode(
        &self,
        history: &ContiguousHistory<SegmentIndexEntry>,
    ) -> SyncResult<LoadResult>;
}

/// The real [`HistoryService`], wiring the segment store and the snapshot
/// loader to the database.
#[derive(Debug)]
pub struct NetworkHistoryService {
    conn: Arc<Mutex<Connection>>,
    store: Arc<tokio::sync::Mutex<SegmentStore>>,
    loader: SnapshotLoader,
    snapshots_path: PathBuf,
    swarm_key_seed: String,
    // The chain id lives in the database but never changes, so it is read
    // once on first use.
    chain_id: Mutex<Option<String>>,
}

impl NetworkHistoryService {
    /// Creates the service.
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        store: Arc<tokio::sync::Mutex<SegmentStore>>,
        loader: SnapshotLoader,
        snapshots_path: impl Into<PathBuf>,
        swarm_key_seed: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            store,
            loader,
            snapshots_path: snapshots_path.into(),
            swarm_key_seed: swarm_key_seed.into(),
            chain_id: Mutex::new(None),
        }
    }

    /// The chain id the database belongs to, cached after the first read.
    pub fn chain_id(&self) -> SyncResult<String> {
        let mut cached = self.chain_id.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(chain_id) = &*cached {
            return Ok(chain_id.clone())
        }

        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let chain_id = catalog::chain_id(&conn)?.ok_or(SyncError::ChainIdMissing)?;
        debug!(target: "history::sync", %chain_id, "Resolved chain id");
        *cached = Some(chain_id.clone());
        Ok(chain_id)
    }
}

#[async_trait::async_trait]
impl HistoryService for NetworkHistoryService {
    async fn datanode_block_span(&self) -> SyncResult<BlockSpan> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(catalog::block_span(&conn)?)
    }

    fn swarm_key_seed(&self) -> String {
        self.swarm_key_seed.clone()
    }

    async fn fetch_history_segment(&self, content_id: &str) -> SyncResult<SegmentIndexEntry> {
        Ok(self.store.lock().await.fetch_history_segment(content_id).await?)
    }

    async fn list_all_history_segments(&self) -> SyncResult<Vec<SegmentIndexEntry>> {
        Ok(self.store.lock().await.list_all_entries_oldest_first())
    }

    async fn load_history_into_datanode(
        &self,
        history: &ContiguousHistory<SegmentIndexEntry>,
    ) -> SyncResult<LoadResult> {
        let (history_to_load, current_state) = {
            let store = self.store.lock().await;
            let staged = store.staged_contiguous_history(history)?;

            let mut history_to_load = Vec::with_capacity(staged.len());
            for segment in &staged {
                store.extract_staged_segment(segment, &self.snapshots_path)?;
                history_to_load.push(HistoryToLoad {
                    snapshot: HistorySnapshot {
                        chain_id: segment.entry.meta.chain_id.clone(),
                        height_from: segment.entry.meta.height_from,
                        height_to: segment.entry.meta.height_to,
                    },
                    schema_version: segment.entry.meta.schema_version,
                });
            }

            let Some(newest) = staged.last().map(|segment| &segment.entry.meta) else {
                return Err(SyncError::NoHistoryAvailable)
            };
            let current_state = CurrentStateSnapshot {
                chain_id: newest.chain_id.clone(),
                height: newest.height_to,
            };
            (history_to_load, current_state)
        };

        Ok(self.loader.load_snapshot_data(&current_state, &history_to_load, &self.snapshots_path)?)
    }
}
