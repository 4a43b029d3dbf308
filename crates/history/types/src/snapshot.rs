//! Snapshot artifact naming.
//!
//! The archive names are part of the external interface and must round-trip
//! exactly: peers and operators identify artifacts by file name alone.

use crate::BlockHeight;
use serde::{Deserialize, Serialize};

const HISTORY_SNAPSHOT_SUFFIX: &str = "historysnapshot.tar.gz";
const CURRENT_STATE_SNAPSHOT_SUFFIX: &str = "currentstatesnapshot.tar.gz";

/// Extension of the marker file written before a snapshot copy starts and
/// removed only on full success. Its mere presence excludes the
/// corresponding artifacts from any directory scan.
pub const SNAPSHOT_IN_PROGRESS_EXTENSION: &str = "snapshotinprogress";

/// Incremental dump of append-only rows whose partition time falls within
/// the block range `[height_from, height_to]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    /// Chain the snapshot belongs to.
    pub chain_id: String,
    /// First block height covered, inclusive.
    pub height_from: BlockHeight,
    /// Last block height covered, inclusive.
    pub height_to: BlockHeight,
}

impl HistorySnapshot {
    /// Compressed artifact file name, `{chain}-{from}-{to}-historysnapshot.tar.gz`.
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}-{HISTORY_SNAPSHOT_SUFFIX}",
            self.chain_id, self.height_from, self.height_to
        )
    }

    /// Directory the artifact's per-table files are unpacked into.
    pub fn data_dir(&self) -> String {
        format!("{}-{}-{}-historysnapshot", self.chain_id, self.height_from, self.height_to)
    }

    /// Parses a file name produced by [`Self::file_name`].
    ///
    /// The chain id may itself contain hyphens, so the heights are taken
    /// from the right.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let rest = name.strip_suffix(HISTORY_SNAPSHOT_SUFFIX)?.strip_suffix('-')?;
        let (rest, to) = rest.rsplit_once('-')?;
        let (chain_id, from) = rest.rsplit_once('-')?;
        if chain_id.is_empty() {
            return None
        }

        Some(Self {
            chain_id: chain_id.to_owned(),
            height_from: from.parse().ok()?,
            height_to: to.parse().ok()?,
        })
    }
}

/// Full dump of all mutable ("latest row wins") tables as of `height`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentStateSnapshot {
    /// Chain the snapshot belongs to.
    pub chain_id: String,
    /// Block height the dump was taken at.
    pub height: BlockHeight,
}

impl CurrentStateSnapshot {
    /// Compressed artifact file name, `{chain}-{height}-currentstatesnapshot.tar.gz`.
    pub fn file_name(&self) -> String {
        format!("{}-{}-{CURRENT_STATE_SNAPSHOT_SUFFIX}", self.chain_id, self.height)
    }

    /// Directory the artifact's per-table files are unpacked into.
    pub fn data_dir(&self) -> String {
        format!("{}-{}-currentstatesnapshot", self.chain_id, self.height)
    }

    /// Parses a file name produced by [`Self::file_name`].
    pub fn from_file_name(name: &str) -> Option<Self> {
        let rest = name.strip_suffix(CURRENT_STATE_SNAPSHOT_SUFFIX)?.strip_suffix('-')?;
        let (chain_id, height) = rest.rsplit_once('-')?;
        if chain_id.is_empty() {
            return None
        }

        Some(Self { chain_id: chain_id.to_owned(), height: height.parse().ok()? })
    }
}

/// In-progress marker file name, `{chain}-{height}.snapshotinprogress`.
pub fn in_progress_file_name(chain_id: &str, height: BlockHeight) -> String {
    format!("{chain_id}-{height}.{SNAPSHOT_IN_PROGRESS_EXTENSION}")
}
