//! Snapshot loading.
//!
//! Loads a current-state artifact plus a contiguous run of history
//! artifacts into the database. Indexes and triggers are dropped for the
//! duration of the bulk copy and replayed afterwards from their captured
//! definitions; derived tables are recomputed from raw history at the end
//! rather than copied. The loader assumes exclusive use of the database
//! while it runs; in-process access is serialized by the shared connection
//! lock.

use crate::{
    catalog::{self, quote_ident, DatabaseMetadata, TableMeta},
    compress,
    dump,
    SnapshotError,
    SnapshotResult,
};
use rusqlite::{params_from_iter, types::Value, Connection};
use std::{
    collections::HashMap,
    fmt,
    fs,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};
use tessera_history_types::{BlockHeight, CurrentStateSnapshot, HistorySnapshot};
use tracing::{debug, info};

/// Applies schema migrations between history chunks produced under older
/// schema versions.
pub trait SchemaMigrator: fmt::Debug + Send + Sync {
    /// Brings the schema to exactly `version`. The full schema, indexes and
    /// triggers included, is in place when this is called.
    fn migrate_to(
        &self,
        conn: &mut Connection,
        version: i64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Migrator for deployments whose schema version never changes.
#[derive(Debug)]
pub struct NoMigrations;

impl SchemaMigrator for NoMigrations {
    fn migrate_to(
        &self,
        _conn: &mut Connection,
        version: i64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err(format!("no migration available to schema version {version}").into())
    }
}

/// A history artifact to load, with the schema version it was produced
/// under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryToLoad {
    /// The history artifact.
    pub snapshot: HistorySnapshot,
    /// Schema version the artifact was dumped under.
    pub schema_version: i64,
}

/// What a load actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadResult {
    /// First height newly covered by the load.
    pub loaded_from_height: BlockHeight,
    /// Last height covered by the load.
    pub loaded_to_height: BlockHeight,
    /// Rows written into the database.
    pub rows_loaded: u64,
}

/// Loads snapshot artifacts into the database.
#[derive(Debug)]
pub struct SnapshotLoader {
    conn: Arc<Mutex<Connection>>,
    migrator: Arc<dyn SchemaMigrator>,
}

impl SnapshotLoader {
    /// Creates a loader over the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>, migrator: Arc<dyn SchemaMigrator>) -> Self {
        Self { conn, migrator }
    }

    /// Loads `history`, oldest first, plus the final current state from the
    /// artifacts in `source_dir`.
    ///
    /// The run must be contiguous in heights and non-decreasing in schema
    /// version, and must extend what the database already holds: starting
    /// below the existing span, past its end plus one, or wholly inside it
    /// is rejected before anything is touched. Rows the database already
    /// has, judged by each history table's newest partition time captured
    /// before the load, are skipped, so resuming an interrupted load is
    /// safe.
    pub fn load_snapshot_data(
        &self,
        current_state: &CurrentStateSnapshot,
        history: &[HistoryToLoad],
        source_dir: &Path,
    ) -> SnapshotResult<LoadResult> {
        let (from, to) = validate_history(history)?;

        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let span = catalog::block_span(&conn)?;
        if span.has_data {
            if from < span.from_height {
                return Err(SnapshotError::SpanBeforeExistingHistory {
                    from,
                    existing_from: span.from_height,
                })
            }
            if from > span.to_height + 1 {
                return Err(SnapshotError::SpanLeavesGap { from, existing_to: span.to_height })
            }
            if to <= span.to_height {
                return Err(SnapshotError::SpanAlreadyCovered { from, to })
            }
        }
        let loaded_from_height = if span.has_data { span.to_height + 1 } else { from };

        let metadata = DatabaseMetadata::load(&conn)?;
        let latest_partitions = latest_partition_times(&conn, &metadata)?;

        conn.pragma_update(None, "foreign_keys", false)?;
        let mut schema = SchemaObjects::capture(&conn)?;
        schema.drop_all(&conn)?;

        let mut rows_loaded = 0;
        let mut current_version = metadata.schema_version;
        for (version, chunk) in group_by_version(history) {
            if version != current_version {
                // Migrations expect the full schema, so the dropped objects
                // come back for their duration.
                schema.recreate(&conn)?;
                self.migrator
                    .migrate_to(&mut conn, version)
                    .map_err(|source| SnapshotError::Migration { version, source })?;
                let actual = catalog::schema_version(&conn)?;
                if actual != version {
                    return Err(SnapshotError::MigrationVersionMismatch {
                        expected: version,
                        actual,
                    })
                }
                current_version = version;
                schema = SchemaObjects::capture(&conn)?;
                schema.drop_all(&conn)?;
            }

            let metadata = DatabaseMetadata::load(&conn)?;
            let tx = conn.transaction()?;
            for item in chunk {
                rows_loaded +=
                    load_history_artifact(&tx, &metadata, &item.snapshot, source_dir, &latest_partitions)?;
            }
            tx.commit()?;
        }

        let metadata = DatabaseMetadata::load(&conn)?;
        let tx = conn.transaction()?;
        rows_loaded += load_current_state_artifact(&tx, &metadata, current_state, source_dir)?;
        tx.commit()?;

        schema.recreate(&conn)?;
        conn.pragma_update(None, "foreign_keys", true)?;

        refresh_aggregates(&conn)?;
        correct_current_flags(&conn, &metadata)?;

        info!(
            target: "history::snapshot",
            loaded_from_height,
            loaded_to_height = to,
            rows_loaded,
            "Loaded history into database"
        );

        Ok(LoadResult { loaded_from_height, loaded_to_height: to, rows_loaded })
    }
}

/// Checks contiguity and version ordering, returning the overall span.
fn validate_history(history: &[HistoryToLoad]) -> SnapshotResult<(BlockHeight, BlockHeight)> {
    let (Some(first), Some(last)) = (history.first(), history.last()) else {
        return Err(SnapshotError::NothingToLoad)
    };

    for pair in history.windows(2) {
        let expected = pair[0].snapshot.height_to + 1;
        if pair[1].snapshot.height_from != expected {
            return Err(SnapshotError::HistoryNotContiguous { at: expected })
        }
        if pair[1].schema_version < pair[0].schema_version {
            return Err(SnapshotError::SchemaVersionOutOfOrder {
                previous: pair[0].schema_version,
                next: pair[1].schema_version,
            })
        }
    }

    Ok((first.snapshot.height_from, last.snapshot.height_to))
}

fn group_by_version(history: &[HistoryToLoad]) -> Vec<(i64, Vec<&HistoryToLoad>)> {
    let mut groups: Vec<(i64, Vec<&HistoryToLoad>)> = Vec::new();
    for item in history {
        match groups.last_mut() {
            Some((version, chunk)) if *version == item.schema_version => chunk.push(item),
            _ => groups.push((item.schema_version, vec![item])),
        }
    }
    groups
}

/// Newest partition time per history table, captured before a load so rows
/// the database already holds can be recognized and skipped.
fn latest_partition_times(
    conn: &Connection,
    metadata: &DatabaseMetadata,
) -> SnapshotResult<HashMap<String, Option<i64>>> {
    let mut latest = HashMap::new();
    for table in metadata.history_tables() {
        let Some(partition) = &table.partition_column else { continue };
        let max: Option<i64> = conn.query_row(
            &format!(
                "SELECT max({partition}) FROM {name}",
                partition = quote_ident(partition),
                name = quote_ident(&table.name)
            ),
            [],
            |row| row.get(0),
        )?;
        latest.insert(table.name.clone(), max);
    }
    Ok(latest)
}

/// Index and trigger definitions captured from the live schema, so they can
/// be dropped for the bulk copy and replayed verbatim afterwards.
#[derive(Debug)]
struct SchemaObjects {
    indexes: Vec<(String, String)>,
    triggers: Vec<(String, String)>,
}

impl SchemaObjects {
    fn capture(conn: &Connection) -> SnapshotResult<Self> {
        let read = |kind: &str| -> SnapshotResult<Vec<(String, String)>> {
            let mut stmt = conn.prepare(
                "SELECT name, sql FROM sqlite_master WHERE type = ?1 AND sql IS NOT NULL",
            )?;
            let objects = stmt
                .query_map([kind], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(objects)
        };

        Ok(Self { indexes: read("index")?, triggers: read("trigger")? })
    }

    fn drop_all(&self, conn: &Connection) -> SnapshotResult<()> {
        for (name, _) in &self.indexes {
            conn.execute_batch(&format!("DROP INDEX IF EXISTS {}", quote_ident(name)))?;
        }
        for (name, _) in &self.triggers {
            conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(name)))?;
        }
        Ok(())
    }

    fn recreate(&self, conn: &Connection) -> SnapshotResult<()> {
        for (_, sql) in self.indexes.iter().chain(&self.triggers) {
            conn.execute_batch(sql)?;
        }
        Ok(())
    }
}

fn load_history_artifact(
    conn: &Connection,
    metadata: &DatabaseMetadata,
    snapshot: &HistorySnapshot,
    source_dir: &Path,
    latest_partitions: &HashMap<String, Option<i64>>,
) -> SnapshotResult<u64> {
    let artifact = source_dir.join(snapshot.file_name());
    let data_dir = source_dir.join(snapshot.data_dir());
    compress::decompress_file(&artifact, &data_dir)?;

    let mut rows = 0;
    for (table_name, path) in table_files(&data_dir)? {
        let table = metadata
            .tables
            .get(&table_name)
            .ok_or_else(|| SnapshotError::UnknownTable(table_name.clone()))?;
        let newer_than = latest_partitions.get(&table.name).copied().flatten();
        rows += load_table_file(conn, table, &path, newer_than)?;
    }

    fs::remove_dir_all(&data_dir).map_err(|source| SnapshotError::io(&data_dir, source))?;
    debug!(
        target: "history::snapshot",
        height_from = snapshot.height_from,
        height_to = snapshot.height_to,
        rows,
        "Loaded history artifact"
    );
    Ok(rows)
}

fn load_current_state_artifact(
    conn: &Connection,
    metadata: &DatabaseMetadata,
    snapshot: &CurrentStateSnapshot,
    source_dir: &Path,
) -> SnapshotResult<u64> {
    let artifact = source_dir.join(snapshot.file_name());
    let data_dir = source_dir.join(snapshot.data_dir());
    compress::decompress_file(&artifact, &data_dir)?;

    let mut rows = 0;
    for (table_name, path) in table_files(&data_dir)? {
        let table = metadata
            .tables
            .get(&table_name)
            .ok_or_else(|| SnapshotError::UnknownTable(table_name.clone()))?;
        // Current state is replaced whole, not merged.
        conn.execute_batch(&format!("DELETE FROM {}", quote_ident(&table.name)))?;
        rows += load_table_file(conn, table, &path, None)?;
    }

    fs::remove_dir_all(&data_dir).map_err(|source| SnapshotError::io(&data_dir, source))?;
    Ok(rows)
}

/// Per-table dump files under `dir`, sorted by table name.
fn table_files(dir: &Path) -> SnapshotResult<Vec<(String, std::path::PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|source| SnapshotError::io(dir, source))? {
        let entry = entry.map_err(|source| SnapshotError::io(dir, source))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if let Some(table) = name.strip_suffix(".csv") {
            files.push((table.to_owned(), path.clone()));
        }
    }
    files.sort();
    Ok(files)
}

fn load_table_file(
    conn: &Connection,
    table: &TableMeta,
    path: &Path,
    newer_than: Option<i64>,
) -> SnapshotResult<u64> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(ToOwned::to_owned).collect();
    let partition_idx = table
        .partition_column
        .as_ref()
        .and_then(|partition| headers.iter().position(|header| header == partition));

    let columns =
        headers.iter().map(|header| quote_ident(header)).collect::<Vec<_>>().join(", ");
    let placeholders =
        (1..=headers.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {name} ({columns}) VALUES ({placeholders})",
        name = quote_ident(&table.name)
    ))?;

    let mut rows = 0;
    for record in reader.records() {
        let record = record?;

        if let (Some(idx), Some(newer_than)) = (partition_idx, newer_than) {
            if let Ok(partition_time) = record[idx].parse::<i64>() {
                if partition_time <= newer_than {
                    continue
                }
            }
        }

        let values: Vec<Value> = record.iter().map(dump::value_from_field).collect();
        stmt.execute(params_from_iter(values))?;
        rows += 1;
    }

    Ok(rows)
}

fn refresh_aggregates(conn: &Connection) -> SnapshotResult<()> {
    for (name, refresh_sql) in catalog::aggregates(conn)? {
        conn.execute_batch(&refresh_sql)?;
        debug!(target: "history::snapshot", aggregate = %name, "Recomputed derived table");
    }
    Ok(())
}

/// Re-derives the `current` flag on version-tracked tables: exactly the
/// newest version of each key, by partition time, is current.
fn correct_current_flags(conn: &Connection, metadata: &DatabaseMetadata) -> SnapshotResult<()> {
    for table in metadata.tables.values() {
        let (Some(key), Some(partition)) = (&table.version_key, &table.partition_column) else {
            continue
        };

        let name = quote_ident(&table.name);
        conn.execute_batch(&format!(
            "UPDATE {name} SET current = CASE WHEN rowid IN ( \
                SELECT rowid FROM ( \
                    SELECT rowid, row_number() OVER ( \
                        PARTITION BY {key} ORDER BY {partition} DESC, rowid DESC \
                    ) AS rn FROM {name} \
                ) WHERE rn = 1 \
            ) THEN 1 ELSE 0 END",
            key = quote_ident(key),
            partition = quote_ident(partition),
        ))?;
    }
    Ok(())
}
