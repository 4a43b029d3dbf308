//! Network history synchronization, publication and bootstrap.
//!
//! Ties the snapshot engines and the segment store together into the
//! node-facing surface: [`SnapshotTrigger`] turns block commits and
//! protocol upgrades into snapshots, [`SnapshotPublisher`] sweeps finished
//! pairs into the store, and [`initialise_from_network_history`] bootstraps
//! an empty or lagging node from its peers.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod client;
mod config;
mod error;
mod initialise;
mod publisher;
mod selection;
mod service;
mod trigger;

pub use client::{HistoryPeerClient, PeerQueryError, PeerSegment, PeerSegmentResponse};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use initialise::initialise_from_network_history;
pub use publisher::SnapshotPublisher;
pub use selection::select_most_recent_segment;
pub use service::{HistoryService, NetworkHistoryService};
pub use trigger::SnapshotTrigger;

#[cfg(test)]
pub(crate) mod test_utils {
    use rusqlite::Connection;
    use tessera_history_store::{SegmentTransport, TransportError};
    use tessera_history_types::BlockHeight;

    const SCHEMA: &str = "
        CREATE TABLE blocks (height INTEGER PRIMARY KEY, created_at INTEGER NOT NULL);
        CREATE TABLE positions (party TEXT PRIMARY KEY, size INTEGER NOT NULL);

        CREATE TABLE snapshot_table_catalog (
            table_name TEXT PRIMARY KEY,
            sort_order TEXT NOT NULL,
            partition_column TEXT,
            version_key TEXT
        );
        CREATE TABLE snapshot_aggregate_catalog (
            name TEXT PRIMARY KEY,
            refresh_sql TEXT NOT NULL
        );
        CREATE TABLE last_snapshot_span (
            onerow INTEGER PRIMARY KEY DEFAULT 0 CHECK (onerow = 0),
            from_height INTEGER NOT NULL,
            to_height INTEGER NOT NULL
        );
        CREATE TABLE chain_info (chain_id TEXT NOT NULL);

        INSERT INTO snapshot_table_catalog VALUES
            ('blocks', 'height', 'created_at', NULL),
            ('positions', 'party', NULL, NULL);
        INSERT INTO chain_info VALUES ('test-chain');
        PRAGMA user_version = 1;
    ";

    /// An in-memory database with just enough schema to snapshot.
    pub(crate) fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn
    }

    /// Appends blocks `from..=to`.
    pub(crate) fn seed_blocks(conn: &Connection, from: BlockHeight, to: BlockHeight) {
        for height in from..=to {
            conn.execute(
                "INSERT INTO blocks (height, created_at) VALUES (?1, ?2)",
                (height, height as i64 * 1000),
            )
            .unwrap();
        }
    }

    /// A transport with no peers and nothing to fetch.
    #[derive(Debug)]
    pub(crate) struct NoTransport;

    #[async_trait::async_trait]
    impl SegmentTransport for NoTransport {
        async fn fetch(&self, content_id: &str) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::NotAvailable(content_id.to_owned()))
        }

        async fn connected_peers(&self) -> Vec<String> {
            Vec::new()
        }
    }
}
