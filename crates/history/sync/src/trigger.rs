//! Turning consensus events into snapshots.

use crate::{SnapshotPublisher, SyncConfig, SyncError, SyncResult};
use std::{sync::Arc, time::Duration};
use tessera_history_snapshot::{CreatedSnapshot, SnapshotCreator, SnapshotError};
use tessera_history_types::BlockHeight;
use tracing::{error, info, warn};

/// Snapshots may not be taken more often than this many blocks apart,
/// whatever the configuration says.
const MIN_SNAPSHOT_INTERVAL_BLOCKS: u64 = 10;

/// How often a failed creation is retried before the trigger gives up.
const CREATE_RETRY_MAX: usize = 5;

/// Drives snapshot creation from block commits and protocol upgrades.
///
/// Failures are retried with a constant pause; exhausting the retries is
/// surfaced as [`SyncError::SnapshotRetriesExhausted`], which the embedding
/// node must treat as fatal. Commit-triggered snapshots are published by the
/// periodic sweep; the upgrade path publishes inline instead, since the node
/// must not cross the upgrade boundary before its segment is in the store.
#[derive(Debug)]
pub struct SnapshotTrigger {
    creator: Arc<SnapshotCreator>,
    publisher: Arc<SnapshotPublisher>,
    interval: u64,
    retry_delay: Duration,
}

impl SnapshotTrigger {
    /// Creates the trigger. The configured interval is clamped to the
    /// minimum floor.
    pub fn new(
        creator: Arc<SnapshotCreator>,
        publisher: Arc<SnapshotPublisher>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            creator,
            publisher,
            interval: config.snapshot_interval_block_span.max(MIN_SNAPSHOT_INTERVAL_BLOCKS),
            retry_delay: config.retry_timeout,
        }
    }

    /// Called after every committed block; takes a snapshot when `height`
    /// lands on the interval. Returns what was created, or `None` when the
    /// height was off-interval or already snapshotted.
    pub async fn on_block_committed(
        &self,
        chain_id: &str,
        height: BlockHeight,
    ) -> SyncResult<Option<CreatedSnapshot>> {
        if height == 0 || height % self.interval != 0 {
            return Ok(None)
        }

        self.create_with_retry(chain_id, height).await
    }

    /// Called when a protocol upgrade halts the chain at `last_height`.
    /// Everything up to the upgrade block must be snapshotted and published
    /// before the node restarts, so the interval does not apply and the
    /// periodic sweep is not waited for. A successful return is the
    /// readiness acknowledgement: the segment ending at `last_height` is in
    /// the store and the node may cross the upgrade boundary.
    pub async fn on_protocol_upgrade(
        &self,
        chain_id: &str,
        last_height: BlockHeight,
    ) -> SyncResult<Option<CreatedSnapshot>> {
        info!(target: "history::sync", last_height, "Snapshotting for protocol upgrade");
        let created = self.create_with_retry(chain_id, last_height).await?;

        self.publisher.publish_unpublished().await?;
        if !self.publisher.is_published(last_height).await {
            return Err(SyncError::UpgradeSnapshotNotPublished { height: last_height })
        }

        info!(target: "history::sync", last_height, "Ready for protocol upgrade");
        Ok(created)
    }

    async fn create_with_retry(
        &self,
        chain_id: &str,
        height: BlockHeight,
    ) -> SyncResult<Option<CreatedSnapshot>> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.creator.create_snapshot(chain_id, height).await {
                Ok(created) => {
                    info!(
                        target: "history::sync",
                        height_from = created.history.height_from,
                        height_to = created.history.height_to,
                        "Snapshot created"
                    );
                    return Ok(Some(created))
                }
                // A snapshot that already covers this height means an
                // earlier attempt got through.
                Err(SnapshotError::SnapshotExists { .. }) => return Ok(None),
                Err(err) if attempts <= CREATE_RETRY_MAX => {
                    warn!(
                        target: "history::sync",
                        height,
                        attempt = attempts,
                        %err,
                        "Snapshot creation failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => {
                    error!(
                        target: "history::sync",
                        height,
                        %err,
                        "Snapshot creation failed after retries, giving up"
                    );
                    return Err(SyncError::SnapshotRetriesExhausted { height, attempts })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{seed_blocks, test_conn, NoTransport};
    use assert_matches::assert_matches;
    use std::sync::Mutex;
    use tessera_history_store::{SegmentStore, SegmentStoreConfig};

    fn trigger_with_db(
        interval: u64,
        dir: &std::path::Path,
    ) -> (
        SnapshotTrigger,
        Arc<Mutex<rusqlite::Connection>>,
        Arc<tokio::sync::Mutex<SegmentStore>>,
    ) {
        let conn = Arc::new(Mutex::new(test_conn()));
        let creator = Arc::new(
            SnapshotCreator::new(conn.clone(), dir, Duration::from_millis(200)).unwrap(),
        );
        let store = Arc::new(tokio::sync::Mutex::new(
            SegmentStore::open(
                dir.join("store"),
                "test-chain",
                SegmentStoreConfig::default(),
                Arc::new(NoTransport),
            )
            .unwrap(),
        ));
        let publisher = Arc::new(SnapshotPublisher::new(
            creator.clone(),
            store.clone(),
            Duration::from_secs(5),
        ));
        let config = SyncConfig {
            snapshot_interval_block_span: interval,
            retry_timeout: Duration::from_millis(1),
            ..Default::default()
        };
        (SnapshotTrigger::new(creator, publisher, &config), conn, store)
    }

    #[tokio::test]
    async fn off_interval_heights_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (trigger, conn, _store) = trigger_with_db(10, dir.path());
        seed_blocks(&conn.lock().unwrap(), 1, 15);

        assert_eq!(trigger.on_block_committed("test-chain", 15).await.unwrap(), None);
        assert_eq!(trigger.on_block_committed("test-chain", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn interval_heights_produce_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (trigger, conn, _store) = trigger_with_db(10, dir.path());
        seed_blocks(&conn.lock().unwrap(), 1, 10);

        let created = trigger.on_block_committed("test-chain", 10).await.unwrap().unwrap();
        assert_eq!(created.history.height_to, 10);
        assert!(dir.path().join(created.history.file_name()).exists());

        // The same height triggered again is already covered.
        assert_eq!(trigger.on_block_committed("test-chain", 10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn upgrade_snapshot_ignores_the_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (trigger, conn, _store) = trigger_with_db(1000, dir.path());
        seed_blocks(&conn.lock().unwrap(), 1, 7);

        let created = trigger.on_protocol_upgrade("test-chain", 7).await.unwrap().unwrap();
        assert_eq!(created.history.height_to, 7);
    }

    #[tokio::test]
    async fn upgrade_snapshot_is_published_before_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let (trigger, conn, store) = trigger_with_db(1000, dir.path());
        seed_blocks(&conn.lock().unwrap(), 1, 7);

        let created = trigger.on_protocol_upgrade("test-chain", 7).await.unwrap().unwrap();

        // Returning is the readiness signal, so the segment must already be
        // in the store, with its artifacts consumed.
        let store = store.lock().await;
        assert_eq!(store.get_entry(7).unwrap().meta.height_to, 7);
        assert!(!dir.path().join(created.history.file_name()).exists());
        assert!(!dir.path().join(created.current_state.file_name()).exists());
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        // No blocks seeded, so every attempt fails.
        let (trigger, _conn, _store) = trigger_with_db(10, dir.path());

        assert_matches!(
            trigger.on_block_committed("test-chain", 10).await,
            Err(SyncError::SnapshotRetriesExhausted { height: 10, attempts: 6 })
        );
    }
}
