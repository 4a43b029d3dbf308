//! Snapshot creation.
//!
//! A snapshot is a pair of compressed artifacts: an incremental *history*
//! dump of the append-only tables over one block span, and a full *current
//! state* dump of the mutable tables as of the span's end. Both are produced
//! from a single read transaction so they describe one consistent point in
//! time, and both are byte-deterministic so every node snapshotting the same
//! span publishes the same bytes.

use crate::{
    catalog::{self, quote_ident, DatabaseMetadata, TableMeta},
    compress,
    dump,
    SnapshotError,
    SnapshotResult,
};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tessera_history_types::{
    in_progress_file_name, BlockHeight, CurrentStateSnapshot, HistorySnapshot,
    SNAPSHOT_IN_PROGRESS_EXTENSION,
};
use tracing::{info, warn};

/// A snapshot pair that was just created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSnapshot {
    /// The history artifact.
    pub history: HistorySnapshot,
    /// The current-state artifact.
    pub current_state: CurrentStateSnapshot,
    /// Schema version the dump was taken under.
    pub schema_version: i64,
    /// Hex sha256 over both artifacts, history first. Identical across
    /// nodes snapshotting the same span.
    pub digest: String,
    /// Total rows written into the dumps.
    pub rows_copied: u64,
}

/// A snapshot pair sitting on disk that has not been published yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpublishedSnapshot {
    /// The history artifact.
    pub history: HistorySnapshot,
    /// The current-state artifact.
    pub current_state: CurrentStateSnapshot,
}

/// Produces snapshot pairs into a snapshots directory.
///
/// Creation is serialized through an internal lock with a bounded wait, so
/// overlapping triggers fail loudly instead of queueing without limit.
#[derive(Debug)]
pub struct SnapshotCreator {
    conn: Arc<Mutex<Connection>>,
    create_lock: tokio::sync::Mutex<()>,
    snapshots_path: PathBuf,
    lock_timeout: Duration,
}

impl SnapshotCreator {
    /// Creates a snapshot creator writing into `snapshots_path`.
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        snapshots_path: impl Into<PathBuf>,
        lock_timeout: Duration,
    ) -> SnapshotResult<Self> {
        let snapshots_path = snapshots_path.into();
        fs::create_dir_all(&snapshots_path)
            .map_err(|source| SnapshotError::io(&snapshots_path, source))?;

        Ok(Self { conn, create_lock: tokio::sync::Mutex::new(()), snapshots_path, lock_timeout })
    }

    /// Directory snapshot pairs are written into.
    pub fn snapshots_path(&self) -> &Path {
        &self.snapshots_path
    }

    /// Schema version the database is currently at.
    pub fn current_schema_version(&self) -> SnapshotResult<i64> {
        catalog::schema_version(&self.conn())
    }

    /// Creates the snapshot pair ending at `to_height`.
    ///
    /// The span starts one block after the last created snapshot, or at the
    /// oldest held block if none was created yet. Asking for the height the
    /// last snapshot already ends at yields [`SnapshotError::SnapshotExists`],
    /// which retried triggers treat as success.
    pub async fn create_snapshot(
        &self,
        chain_id: &str,
        to_height: BlockHeight,
    ) -> SnapshotResult<CreatedSnapshot> {
        let _guard = tokio::time::timeout(self.lock_timeout, self.create_lock.lock())
            .await
            .map_err(|_| SnapshotError::CreateLockTimeout)?;

        let mut conn = self.conn();
        let metadata = DatabaseMetadata::load(&conn)?;
        let (from, to) = next_span(&conn, to_height)?;

        let history = HistorySnapshot {
            chain_id: chain_id.to_owned(),
            height_from: from,
            height_to: to,
        };
        let current_state = CurrentStateSnapshot { chain_id: chain_id.to_owned(), height: to };

        // The marker goes down before any data is written and comes back up
        // only on full success, so a crash mid-creation leaves the pair
        // visibly incomplete.
        let marker = self.snapshots_path.join(in_progress_file_name(chain_id, to));
        fs::write(&marker, []).map_err(|source| SnapshotError::io(&marker, source))?;

        match self.dump_and_compress(&mut conn, &metadata, &history, &current_state) {
            Ok((digest, rows_copied)) => {
                fs::remove_file(&marker).map_err(|source| SnapshotError::io(&marker, source))?;
                info!(
                    target: "history::snapshot",
                    height_from = from,
                    height_to = to,
                    rows_copied,
                    %digest,
                    "Created snapshot"
                );

                Ok(CreatedSnapshot {
                    history,
                    current_state,
                    schema_version: metadata.schema_version,
                    digest,
                    rows_copied,
                })
            }
            Err(err) => {
                warn!(target: "history::snapshot", height_to = to, %err, "Snapshot creation failed");
                self.cleanup_partial(&history, &current_state);
                Err(err)
            }
        }
    }

    fn dump_and_compress(
        &self,
        conn: &mut Connection,
        metadata: &DatabaseMetadata,
        history: &HistorySnapshot,
        current_state: &CurrentStateSnapshot,
    ) -> SnapshotResult<(String, u64)> {
        let history_dir = self.snapshots_path.join(history.data_dir());
        let current_dir = self.snapshots_path.join(current_state.data_dir());
        for dir in [&history_dir, &current_dir] {
            fs::create_dir_all(dir).map_err(|source| SnapshotError::io(dir, source))?;
        }

        let tx = conn.transaction()?;
        catalog::set_last_snapshot_span(&tx, history.height_from, history.height_to)?;
        // Establishes the transaction's read view before copying begins.
        let _: i64 = tx.query_row("SELECT count(*) FROM blocks", [], |row| row.get(0))?;

        let mut rows_copied = 0;
        for table in metadata.current_state_tables() {
            rows_copied += dump_table(&tx, table, None, &current_dir)?;
        }
        for table in metadata.history_tables() {
            rows_copied += dump_table(
                &tx,
                table,
                Some((history.height_from, history.height_to)),
                &history_dir,
            )?;
        }
        tx.commit()?;

        let history_file = self.snapshots_path.join(history.file_name());
        let current_file = self.snapshots_path.join(current_state.file_name());
        compress::compress_dir(&history_dir, &history_file)?;
        compress::compress_dir(&current_dir, &current_file)?;
        for dir in [&history_dir, &current_dir] {
            fs::remove_dir_all(dir).map_err(|source| SnapshotError::io(dir, source))?;
        }

        Ok((artifact_digest(&[&history_file, &current_file])?, rows_copied))
    }

    /// Removes whatever a failed creation left behind. The in-progress
    /// marker is deliberately left in place.
    fn cleanup_partial(&self, history: &HistorySnapshot, current_state: &CurrentStateSnapshot) {
        let leftovers = [
            self.snapshots_path.join(history.file_name()),
            self.snapshots_path.join(current_state.file_name()),
            self.snapshots_path.join(history.data_dir()),
            self.snapshots_path.join(current_state.data_dir()),
        ];
        for path in leftovers {
            let result = if path.is_dir() { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
            if let Err(err) = result {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(target: "history::snapshot", path = %path.display(), %err, "Failed to clean up partial snapshot");
                }
            }
        }
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Computes the span the next snapshot must cover to end at `to_height`.
fn next_span(
    conn: &Connection,
    to_height: BlockHeight,
) -> SnapshotResult<(BlockHeight, BlockHeight)> {
    match catalog::last_snapshot_span(conn)? {
        Some((last_from, last_to)) => {
            if to_height < last_to {
                Err(SnapshotError::HeightBelowLastSnapshot { to_height, last_to })
            } else if to_height == last_to {
                Err(SnapshotError::SnapshotExists { from: last_from, to: last_to })
            } else {
                Ok((last_to + 1, to_height))
            }
        }
        None => {
            let span = catalog::block_span(conn)?;
            if !span.has_data {
                return Err(SnapshotError::NoBlockData)
            }
            Ok((span.from_height, to_height))
        }
    }
}

/// Dumps one table into `{dir}/{table}.csv`, returning the row count.
///
/// History tables are filtered to rows whose partition time falls inside
/// the span's block range; current-state tables are dumped whole. The
/// catalog's sort order makes the file deterministic.
fn dump_table(
    conn: &Connection,
    table: &TableMeta,
    span: Option<(BlockHeight, BlockHeight)>,
    dir: &Path,
) -> SnapshotResult<u64> {
    let name = quote_ident(&table.name);
    let (sql, params) = match (&table.partition_column, span) {
        (Some(partition), Some((from, to))) => (
            format!(
                "SELECT * FROM {name} \
                 WHERE {partition} >= (SELECT created_at FROM blocks WHERE height = ?1) \
                 AND {partition} <= (SELECT created_at FROM blocks WHERE height = ?2) \
                 ORDER BY {sort}",
                partition = quote_ident(partition),
                sort = table.sort_order,
            ),
            vec![from, to],
        ),
        _ => (format!("SELECT * FROM {name} ORDER BY {sort}", sort = table.sort_order), vec![]),
    };

    let mut stmt = conn.prepare(&sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| (*c).to_owned()).collect();

    let path = dir.join(format!("{}.csv", table.name));
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(&columns)?;

    let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
    let mut count = 0;
    while let Some(row) = rows.next()? {
        let record: Vec<String> = (0..columns.len())
            .map(|i| row.get_ref(i).map(dump::field_from_value))
            .collect::<Result<_, _>>()?;
        writer.write_record(&record)?;
        count += 1;
    }
    writer.flush().map_err(|source| SnapshotError::io(&path, source))?;

    Ok(count)
}

/// Hex sha256 over the given files, in order.
fn artifact_digest(files: &[&Path]) -> SnapshotResult<String> {
    let mut hasher = Sha256::new();
    for file in files {
        let bytes = fs::read(file).map_err(|source| SnapshotError::io(*file, source))?;
        hasher.update(&bytes);
    }
    Ok(hasher.finalize().iter().map(|byte| format!("{byte:02x}")).collect())
}

/// Scans `dir` for snapshot pairs that are complete but not yet published.
///
/// A pair qualifies when both artifacts are present and no in-progress
/// marker exists for its end height. Pairs from more than one chain in the
/// same directory are an operator error and rejected outright. Results are
/// ordered oldest first.
pub fn unpublished_snapshots(dir: &Path) -> SnapshotResult<Vec<UnpublishedSnapshot>> {
    let mut in_progress: HashSet<(String, BlockHeight)> = HashSet::new();
    let mut histories: Vec<HistorySnapshot> = Vec::new();
    let mut current_states: HashMap<(String, BlockHeight), CurrentStateSnapshot> = HashMap::new();

    for entry in fs::read_dir(dir).map_err(|source| SnapshotError::io(dir, source))? {
        let entry = entry.map_err(|source| SnapshotError::io(dir, source))?;
        let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else { continue };

        if let Some(stem) = name.strip_suffix(&format!(".{SNAPSHOT_IN_PROGRESS_EXTENSION}")) {
            if let Some((chain_id, height)) = stem.rsplit_once('-') {
                if let Ok(height) = height.parse() {
                    in_progress.insert((chain_id.to_owned(), height));
                }
            }
        } else if let Some(history) = HistorySnapshot::from_file_name(&name) {
            histories.push(history);
        } else if let Some(current_state) = CurrentStateSnapshot::from_file_name(&name) {
            current_states.insert((current_state.chain_id.clone(), current_state.height), current_state);
        }
    }

    let mut chain_ids: Vec<&str> = histories
        .iter()
        .map(|h| h.chain_id.as_str())
        .chain(current_states.values().map(|c| c.chain_id.as_str()))
        .collect();
    chain_ids.sort_unstable();
    chain_ids.dedup();
    if chain_ids.len() > 1 {
        return Err(SnapshotError::MixedChainIds(
            chain_ids[0].to_owned(),
            chain_ids[1].to_owned(),
        ))
    }

    let mut unpublished: Vec<UnpublishedSnapshot> = histories
        .into_iter()
        .filter(|history| {
            !in_progress.contains(&(history.chain_id.clone(), history.height_to))
        })
        .filter_map(|history| {
            let current_state =
                current_states.get(&(history.chain_id.clone(), history.height_to))?.clone();
            Some(UnpublishedSnapshot { history, current_state })
        })
        .collect();
    unpublished.sort_by_key(|snapshot| snapshot.history.height_from);

    Ok(unpublished)
}
