//! The catalog contract between the schema layer and the snapshot engines.
//!
//! The snapshot engines never hard-code table knowledge; everything they
//! need is read from catalog tables the schema layer maintains:
//!
//! * `snapshot_table_catalog(table_name, sort_order, partition_column,
//!   version_key)`, one row per replicated table. A non-null
//!   `partition_column` marks a *history* table (append-only, partitioned by
//!   that time column); a null one marks a *current-state* table dumped and
//!   reloaded whole. `sort_order` is the `ORDER BY` fragment that makes the
//!   dump deterministic. A non-null `version_key` marks a history table
//!   carrying a `current` flag, corrected after loading.
//! * `snapshot_aggregate_catalog(name, refresh_sql)`, derived tables
//!   recomputed from raw history after a load.
//! * `last_snapshot_span(onerow, from_height, to_height)`, a single-row
//!   record of the last created snapshot span.
//! * `blocks(height, created_at)`, the canonical block table; it must itself
//!   be in the table catalog as a history table.
//! * `chain_info(chain_id)`, the chain the database belongs to.
//!
//! The schema version is `PRAGMA user_version`.

use crate::SnapshotResult;
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use tessera_history_types::BlockHeight;

/// Quotes an identifier read from the catalog for interpolation into SQL.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Catalog record of one replicated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    /// Table name.
    pub name: String,
    /// `ORDER BY` fragment making dumps of the table deterministic.
    pub sort_order: String,
    /// Time column the table is partitioned by, if it is a history table.
    pub partition_column: Option<String>,
    /// Key column rows are versioned by, if the table carries a `current`
    /// flag.
    pub version_key: Option<String>,
}

impl TableMeta {
    /// Whether the table holds append-only history rather than current
    /// state.
    pub fn is_history(&self) -> bool {
        self.partition_column.is_some()
    }
}

/// Everything the snapshot engines need to know about the schema, read once
/// per operation.
#[derive(Debug, Clone)]
pub struct DatabaseMetadata {
    /// Schema version the database is at.
    pub schema_version: i64,
    /// Replicated tables by name.
    pub tables: BTreeMap<String, TableMeta>,
}

impl DatabaseMetadata {
    /// Loads the catalog and schema version.
    pub fn load(conn: &Connection) -> SnapshotResult<Self> {
        let mut stmt = conn.prepare(
            "SELECT table_name, sort_order, partition_column, version_key \
             FROM snapshot_table_catalog",
        )?;
        let tables = stmt
            .query_map([], |row| {
                Ok(TableMeta {
                    name: row.get(0)?,
                    sort_order: row.get(1)?,
                    partition_column: row.get(2)?,
                    version_key: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|table| (table.name.clone(), table))
            .collect();

        Ok(Self { schema_version: schema_version(conn)?, tables })
    }

    /// History tables, ordered by name.
    pub fn history_tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.values().filter(|table| table.is_history())
    }

    /// Current-state tables, ordered by name.
    pub fn current_state_tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.values().filter(|table| !table.is_history())
    }
}

/// The span of blocks the database currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockSpan {
    /// Whether the database holds any blocks at all. The heights are only
    /// meaningful when set.
    pub has_data: bool,
    /// Lowest held block height.
    pub from_height: BlockHeight,
    /// Highest held block height.
    pub to_height: BlockHeight,
}

/// Reads the span of blocks the database currently holds.
pub fn block_span(conn: &Connection) -> SnapshotResult<BlockSpan> {
    let (min, max): (Option<BlockHeight>, Option<BlockHeight>) =
        conn.query_row("SELECT min(height), max(height) FROM blocks", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;

    Ok(match (min, max) {
        (Some(from_height), Some(to_height)) => {
            BlockSpan { has_data: true, from_height, to_height }
        }
        _ => BlockSpan::default(),
    })
}

/// Reads the span of the last created snapshot, if any.
pub fn last_snapshot_span(
    conn: &Connection,
) -> SnapshotResult<Option<(BlockHeight, BlockHeight)>> {
    Ok(conn
        .query_row("SELECT from_height, to_height FROM last_snapshot_span", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?)
}

/// Records the span of the snapshot being created.
pub fn set_last_snapshot_span(
    conn: &Connection,
    from: BlockHeight,
    to: BlockHeight,
) -> SnapshotResult<()> {
    conn.execute(
        "INSERT INTO last_snapshot_span (onerow, from_height, to_height) VALUES (0, ?1, ?2) \
         ON CONFLICT (onerow) DO UPDATE SET \
           from_height = excluded.from_height, to_height = excluded.to_height",
        (from, to),
    )?;
    Ok(())
}

/// Reads the derived-table refresh statements, ordered by name.
pub fn aggregates(conn: &Connection) -> SnapshotResult<Vec<(String, String)>> {
    let mut stmt =
        conn.prepare("SELECT name, refresh_sql FROM snapshot_aggregate_catalog ORDER BY name")?;
    let aggregates = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(aggregates)
}

/// Reads the chain id the database belongs to, if one is recorded yet.
pub fn chain_id(conn: &Connection) -> SnapshotResult<Option<String>> {
    Ok(conn
        .query_row("SELECT chain_id FROM chain_info LIMIT 1", [], |row| row.get(0))
        .optional()?)
}

/// Reads the schema version (`PRAGMA user_version`).
pub fn schema_version(conn: &Connection) -> SnapshotResult<i64> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_conn;

    #[test]
    fn metadata_splits_history_and_current_state_tables() {
        let conn = test_conn();
        let metadata = DatabaseMetadata::load(&conn).unwrap();

        assert_eq!(metadata.schema_version, 1);
        let history: Vec<_> = metadata.history_tables().map(|t| t.name.as_str()).collect();
        let current: Vec<_> = metadata.current_state_tables().map(|t| t.name.as_str()).collect();
        assert_eq!(history, vec!["blocks", "orders", "trades"]);
        assert_eq!(current, vec!["positions"]);
    }

    #[test]
    fn block_span_reflects_stored_blocks() {
        let conn = test_conn();
        assert_eq!(block_span(&conn).unwrap(), BlockSpan::default());

        conn.execute_batch(
            "INSERT INTO blocks (height, created_at) VALUES (5, 5000), (9, 9000);",
        )
        .unwrap();
        let span = block_span(&conn).unwrap();
        assert!(span.has_data);
        assert_eq!((span.from_height, span.to_height), (5, 9));
    }

    #[test]
    fn last_snapshot_span_is_a_single_updatable_row() {
        let conn = test_conn();
        assert_eq!(last_snapshot_span(&conn).unwrap(), None);

        set_last_snapshot_span(&conn, 1, 1000).unwrap();
        set_last_snapshot_span(&conn, 1001, 2000).unwrap();
        assert_eq!(last_snapshot_span(&conn).unwrap(), Some((1001, 2000)));
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("trades"), "\"trades\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
