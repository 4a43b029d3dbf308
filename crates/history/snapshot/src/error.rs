use std::{io, path::PathBuf};
use tessera_history_types::BlockHeight;

/// Snapshot result type.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors from snapshot creation and loading.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The create lock could not be acquired within the configured timeout.
    /// Loud by design: a silently skipped snapshot would leave a hole in
    /// published history.
    #[error("timed out waiting for the snapshot create lock")]
    CreateLockTimeout,

    /// A snapshot covering exactly this span was already created.
    /// Recoverable; a retried trigger treats this as "already done".
    #[error("snapshot for span {from} to {to} already exists")]
    SnapshotExists {
        /// Start of the already covered span.
        from: BlockHeight,
        /// End of the already covered span.
        to: BlockHeight,
    },

    /// The requested height is below the end of the last snapshot.
    #[error("cannot snapshot to height {to_height}, last snapshot already ends at {last_to}")]
    HeightBelowLastSnapshot {
        /// Requested end height.
        to_height: BlockHeight,
        /// End height of the last snapshot.
        last_to: BlockHeight,
    },

    /// The database holds no blocks to snapshot.
    #[error("no block data to snapshot")]
    NoBlockData,

    /// Nothing was passed to load.
    #[error("no history to load")]
    NothingToLoad,

    /// The history passed to load has height gaps.
    #[error("history to load is not contiguous at height {at}")]
    HistoryNotContiguous {
        /// First height not covered by the preceding snapshot.
        at: BlockHeight,
    },

    /// The history to load starts below the locally held span; loading it
    /// would rewrite blocks the node already has.
    #[error("history from height {from} starts before existing history at {existing_from}")]
    SpanBeforeExistingHistory {
        /// Start of the history to load.
        from: BlockHeight,
        /// Start of the existing local span.
        existing_from: BlockHeight,
    },

    /// The history to load starts above the next needed block; loading it
    /// would leave a gap.
    #[error("history from height {from} would leave a gap after existing history ending at {existing_to}")]
    SpanLeavesGap {
        /// Start of the history to load.
        from: BlockHeight,
        /// End of the existing local span.
        existing_to: BlockHeight,
    },

    /// The history to load lies wholly within the locally held span.
    #[error("history from {from} to {to} is already covered by existing history")]
    SpanAlreadyCovered {
        /// Start of the history to load.
        from: BlockHeight,
        /// End of the history to load.
        to: BlockHeight,
    },

    /// A snapshot artifact names a table absent from the table catalog.
    #[error("snapshot contains unknown table {0}")]
    UnknownTable(String),

    /// Snapshot pairs from more than one chain were found together.
    #[error("snapshots for multiple chains found: {0} and {1}")]
    MixedChainIds(String, String),

    /// The schema versions of the history to load are not ascending.
    #[error("history to load has out of order schema versions ({previous} then {next})")]
    SchemaVersionOutOfOrder {
        /// Version of the preceding snapshot.
        previous: i64,
        /// Version of the following snapshot.
        next: i64,
    },

    /// The migrator returned without bringing the schema to the requested
    /// version.
    #[error("schema migration ended at version {actual}, expected {expected}")]
    MigrationVersionMismatch {
        /// Version the migration was asked for.
        expected: i64,
        /// Version the schema is actually at.
        actual: i64,
    },

    /// The schema migrator failed.
    #[error("schema migration to version {version} failed: {source}")]
    Migration {
        /// Version the migration was asked for.
        version: i64,
        /// Underlying migrator error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Database failure.
    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    /// Table dump encoding or decoding failure.
    #[error(transparent)]
    Csv(#[from] csv::Error),

    /// Snapshot file I/O failure.
    #[error("snapshot I/O at {path}: {source}")]
    Io {
        /// Path the operation failed on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
