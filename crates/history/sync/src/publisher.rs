//! Periodic publication of completed snapshots.
//!
//! Snapshot creation and publication are decoupled: the creator drops
//! artifact pairs into the snapshots directory, and this task periodically
//! sweeps them into the segment store. A crash between the two simply
//! leaves the pair for the next sweep.

use crate::{SyncError, SyncResult};
use std::{fs, sync::Arc, time::Duration};
use tessera_history_snapshot::{unpublished_snapshots, SnapshotCreator};
use tessera_history_store::SegmentStore;
use tessera_history_types::{BlockHeight, SegmentIndexEntry};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sweeps unpublished snapshot pairs into the segment store.
#[derive(Debug)]
pub struct SnapshotPublisher {
    creator: Arc<SnapshotCreator>,
    store: Arc<tokio::sync::Mutex<SegmentStore>>,
    publish_lock: tokio::sync::Mutex<()>,
    interval: Duration,
}

impl SnapshotPublisher {
    /// Creates the publisher sweeping every `interval`.
    pub fn new(
        creator: Arc<SnapshotCreator>,
        store: Arc<tokio::sync::Mutex<SegmentStore>>,
        interval: Duration,
    ) -> Self {
        Self { creator, store, publish_lock: tokio::sync::Mutex::new(()), interval }
    }

    /// Publishes every complete unpublished pair once, oldest first,
    /// returning the new index entries. A pair that fails to publish is
    /// left on disk for the next sweep.
    pub async fn publish_unpublished(&self) -> SyncResult<Vec<SegmentIndexEntry>> {
        let _guard = self.publish_lock.lock().await;

        let schema_version = self.creator.current_schema_version().map_err(SyncError::Snapshot)?;
        let snapshots_path = self.creator.snapshots_path().to_path_buf();
        let unpublished =
            unpublished_snapshots(&snapshots_path).map_err(SyncError::Snapshot)?;

        let mut published = Vec::new();
        for snapshot in unpublished {
            let mut store = self.store.lock().await;
            match store.add_snapshot_data(
                &snapshot.history,
                &snapshot.current_state,
                schema_version,
                &snapshots_path,
            ) {
                Ok(entry) => {
                    info!(
                        target: "history::sync",
                        content_id = %entry.content_id,
                        height_from = entry.meta.height_from,
                        height_to = entry.meta.height_to,
                        "Published snapshot as history segment"
                    );
                    // The artifacts are consumed; the next sweep must not
                    // see them again.
                    for name in
                        [snapshot.history.file_name(), snapshot.current_state.file_name()]
                    {
                        let path = snapshots_path.join(name);
                        if let Err(err) = fs::remove_file(&path) {
                            warn!(
                                target: "history::sync",
                                path = %path.display(),
                                %err,
                                "Failed to remove published snapshot artifact"
                            );
                        }
                    }
                    published.push(entry);
                }
                Err(err) => {
                    warn!(
                        target: "history::sync",
                        height_to = snapshot.history.height_to,
                        %err,
                        "Failed to publish snapshot, will retry next sweep"
                    );
                }
            }
        }

        Ok(published)
    }

    /// Whether a segment ending exactly at `height_to` is in the store.
    pub async fn is_published(&self, height_to: BlockHeight) -> bool {
        self.store.lock().await.get_entry(height_to).is_ok()
    }

    /// Runs the periodic sweep until `stop` is cancelled.
    pub async fn run(&self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(target: "history::sync", "Snapshot publisher stopping");
                    return
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.publish_unpublished().await {
                        warn!(target: "history::sync", %err, "Publish sweep failed");
                    }
                }
            }
        }
    }
}
