//! Segment archive packing and unpacking.
//!
//! A segment archive is a plain tar holding the two compressed snapshot
//! artifacts plus a `metadata.json` record. Packing is deterministic: fixed
//! header fields and entries sorted by name, so every node producing a
//! segment from the same artifacts arrives at the same bytes and therefore
//! the same content id.

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};
use tar::{Archive, Builder, EntryType, Header};
use tessera_history_types::SegmentMeta;

/// Name of the metadata record inside a segment archive.
pub const METADATA_FILE: &str = "metadata.json";

/// Errors while packing or unpacking a segment archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// A snapshot artifact to pack, or the destination to unpack into, could
    /// not be accessed.
    #[error("segment archive I/O at {path}: {source}")]
    Io {
        /// Path the operation failed on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The archive bytes could not be read as a tar stream.
    #[error("malformed segment archive: {0}")]
    Malformed(#[source] io::Error),

    /// The archive holds no `metadata.json` entry.
    #[error("segment archive has no {METADATA_FILE} entry")]
    MissingMetadata,

    /// The `metadata.json` entry is not a valid metadata record.
    #[error("invalid segment metadata: {0}")]
    InvalidMetadata(#[source] serde_json::Error),
}

/// Packs `meta` and the given artifact files into a deterministic segment
/// archive, returned as raw bytes ready for content addressing.
pub fn pack_segment(meta: &SegmentMeta, artifacts: &[&Path]) -> Result<Vec<u8>, ArchiveError> {
    let metadata_bytes =
        serde_json::to_vec(meta).map_err(ArchiveError::InvalidMetadata)?;

    let mut entries: Vec<(String, Vec<u8>)> = vec![(METADATA_FILE.to_owned(), metadata_bytes)];
    for path in artifacts {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToOwned::to_owned)
            .ok_or_else(|| ArchiveError::Io {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "artifact has no file name"),
            })?;
        let bytes = fs::read(path)
            .map_err(|source| ArchiveError::Io { path: path.to_path_buf(), source })?;
        entries.push((name, bytes));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut builder = Builder::new(Vec::new());
    for (name, bytes) in &entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        builder
            .append_data(&mut header, name, bytes.as_slice())
            .map_err(ArchiveError::Malformed)?;
    }

    builder.into_inner().map_err(ArchiveError::Malformed)
}

/// Reads the metadata record out of a segment archive without unpacking it.
pub fn read_metadata(bytes: &[u8]) -> Result<SegmentMeta, ArchiveError> {
    let mut archive = Archive::new(bytes);
    for entry in archive.entries().map_err(ArchiveError::Malformed)? {
        let mut entry = entry.map_err(ArchiveError::Malformed)?;
        let is_metadata = entry
            .path()
            .map(|path| path.as_ref() == Path::new(METADATA_FILE))
            .unwrap_or(false);
        if !is_metadata {
            continue
        }

        let mut metadata_bytes = Vec::new();
        entry.read_to_end(&mut metadata_bytes).map_err(ArchiveError::Malformed)?;
        return serde_json::from_slice(&metadata_bytes).map_err(ArchiveError::InvalidMetadata)
    }

    Err(ArchiveError::MissingMetadata)
}

/// Unpacks every entry of a segment archive into `dest`.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(dest)
        .map_err(|source| ArchiveError::Io { path: dest.to_path_buf(), source })?;
    Archive::new(bytes).unpack(dest).map_err(ArchiveError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn meta() -> SegmentMeta {
        SegmentMeta {
            chain_id: "chain".to_owned(),
            height_from: 1001,
            height_to: 2000,
            previous_segment_id: "cid-prev".to_owned(),
            schema_version: 2,
        }
    }

    #[test]
    fn packing_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let history = dir.path().join("b-history.tar.gz");
        let current = dir.path().join("a-currentstate.tar.gz");
        fs::write(&history, b"history bytes").unwrap();
        fs::write(&current, b"current state bytes").unwrap();

        let first = pack_segment(&meta(), &[&history, &current]).unwrap();
        let second = pack_segment(&meta(), &[&current, &history]).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn metadata_round_trips_through_archive() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("artifact.tar.gz");
        fs::write(&artifact, b"bytes").unwrap();

        let bytes = pack_segment(&meta(), &[&artifact]).unwrap();
        assert_eq!(read_metadata(&bytes).unwrap(), meta());
    }

    #[test]
    fn unpack_restores_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("artifact.tar.gz");
        fs::write(&artifact, b"artifact bytes").unwrap();

        let bytes = pack_segment(&meta(), &[&artifact]).unwrap();
        let dest = dir.path().join("out");
        unpack(&bytes, &dest).unwrap();

        assert_eq!(fs::read(dest.join("artifact.tar.gz")).unwrap(), b"artifact bytes");
        assert!(dest.join(METADATA_FILE).exists());
    }

    #[test]
    fn archive_without_metadata_is_rejected() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "other.bin", &b"bytes"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        assert_matches!(read_metadata(&bytes), Err(ArchiveError::MissingMetadata));
    }
}
