use tessera_history_snapshot::SnapshotError;
use tessera_history_store::StoreError;
use tessera_history_types::{BlockHeight, ContiguousHistoryError};

/// Sync result type.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors from synchronization and publication.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Segment store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Snapshot engine failure.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// No contiguous history covers the needed span.
    #[error(transparent)]
    Contiguous(#[from] ContiguousHistoryError),

    /// No peer responded to the bootstrap query at all.
    #[error("no peers with network history available")]
    NoPeersAvailable,

    /// Peers responded, but none shares this node's swarm key.
    #[error("no peer shares this node's swarm key")]
    NoEligiblePeers,

    /// Nothing could be reconstructed to load.
    #[error("no network history available to load")]
    NoHistoryAvailable,

    /// A segment fetch exceeded its deadline.
    #[error("timed out fetching segment {0}")]
    FetchTimeout(String),

    /// The bootstrap run as a whole exceeded its deadline.
    #[error("network history initialisation exceeded its deadline")]
    InitialiseDeadlineExceeded,

    /// The upgrade snapshot could not be published before the upgrade
    /// boundary.
    #[error("segment ending at height {height} was not published for the protocol upgrade")]
    UpgradeSnapshotNotPublished {
        /// Last height before the upgrade.
        height: BlockHeight,
    },

    /// Snapshot creation kept failing after a block commit. Fatal: the node
    /// must stop rather than silently publish history with a hole in it.
    #[error("snapshot at height {height} failed after {attempts} attempts")]
    SnapshotRetriesExhausted {
        /// Height the snapshot was triggered at.
        height: BlockHeight,
        /// Attempts made before giving up.
        attempts: usize,
    },

    /// The database has no chain id recorded yet.
    #[error("chain id not yet known")]
    ChainIdMissing,
}
