//! Local content-addressed blob backend.
//!
//! Blobs are stored under their sha256 hex digest, so storing the same bytes
//! twice is a no-op and a fetched blob can be verified against the id it was
//! requested by. Pins protect blobs from [`BlobStore::gc`]; the pin set is
//! persisted so it survives restarts.

use sha2::{Digest, Sha256};
use std::{collections::BTreeSet, fs, io, path::PathBuf};
use tracing::trace;

const BLOBS_DIR: &str = "blobs";
const PINS_FILE: &str = "pins.json";

/// Errors from the blob backend.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// No blob is stored under the given content id.
    #[error("no blob stored for content id {0}")]
    NotFound(String),

    /// The backend directory or one of its files could not be read or
    /// written.
    #[error("blob storage at {path}: {source}")]
    Storage {
        /// Path the operation failed on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The persisted pin set is not valid JSON.
    #[error("corrupt pin set at {path}: {source}")]
    CorruptPins {
        /// Pin set file path.
        path: PathBuf,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// Returns the content id (sha256 hex digest) of `bytes`.
pub fn content_id(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Flat directory of blobs keyed by content id, with a persisted pin set.
#[derive(Debug)]
pub(crate) struct BlobStore {
    path: PathBuf,
    pinned: BTreeSet<String>,
}

impl BlobStore {
    /// Opens the backend at `path`, creating the blob directory if needed
    /// and loading any previously persisted pin set.
    pub(crate) fn open(path: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let path = path.into();
        let blobs_dir = path.join(BLOBS_DIR);
        fs::create_dir_all(&blobs_dir)
            .map_err(|source| BlobError::Storage { path: blobs_dir, source })?;

        let pins_file = path.join(PINS_FILE);
        let pinned = match fs::read(&pins_file) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|source| BlobError::CorruptPins { path: pins_file, source })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(source) => return Err(BlobError::Storage { path: pins_file, source }),
        };

        Ok(Self { path, pinned })
    }

    /// Stores `bytes` under their content id and pins them, returning the
    /// id. Storing already present bytes only adds the pin.
    pub(crate) fn add_pinned(&mut self, bytes: &[u8]) -> Result<String, BlobError> {
        let id = content_id(bytes);
        let blob_path = self.blob_path(&id);
        if !blob_path.exists() {
            let tmp = blob_path.with_extension("tmp");
            fs::write(&tmp, bytes)
                .and_then(|()| fs::rename(&tmp, &blob_path))
                .map_err(|source| BlobError::Storage { path: blob_path, source })?;
        }

        self.pinned.insert(id.clone());
        self.persist_pins()?;
        trace!(target: "history::store", content_id = %id, len = bytes.len(), "Stored pinned blob");
        Ok(id)
    }

    /// Reads the blob stored under `id`.
    pub(crate) fn read(&self, id: &str) -> Result<Vec<u8>, BlobError> {
        let blob_path = self.blob_path(id);
        match fs::read(&blob_path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(id.to_owned()))
            }
            Err(source) => Err(BlobError::Storage { path: blob_path, source }),
        }
    }

    /// Removes the pin for `id`. The blob itself stays until the next
    /// [`Self::gc`]. Unpinning an unknown id is a no-op.
    pub(crate) fn unpin(&mut self, id: &str) -> Result<(), BlobError> {
        if self.pinned.remove(id) {
            self.persist_pins()?;
        }
        Ok(())
    }

    /// Deletes every stored blob without a pin, returning how many were
    /// removed.
    pub(crate) fn gc(&mut self) -> Result<usize, BlobError> {
        let blobs_dir = self.path.join(BLOBS_DIR);
        let entries = fs::read_dir(&blobs_dir)
            .map_err(|source| BlobError::Storage { path: blobs_dir.clone(), source })?;

        let mut removed = 0;
        for entry in entries {
            let entry =
                entry.map_err(|source| BlobError::Storage { path: blobs_dir.clone(), source })?;
            let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else { continue };
            if self.pinned.contains(&name) {
                continue
            }

            fs::remove_file(entry.path())
                .map_err(|source| BlobError::Storage { path: entry.path(), source })?;
            removed += 1;
        }

        trace!(target: "history::store", removed, "Collected unpinned blobs");
        Ok(removed)
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.path.join(BLOBS_DIR).join(id)
    }

    fn persist_pins(&self) -> Result<(), BlobError> {
        let pins_file = self.path.join(PINS_FILE);
        let bytes = serde_json::to_vec_pretty(&self.pinned)
            .map_err(|source| BlobError::CorruptPins { path: pins_file.clone(), source })?;

        let tmp = self.path.join(format!("{PINS_FILE}.tmp"));
        fs::write(&tmp, bytes)
            .and_then(|()| fs::rename(&tmp, &pins_file))
            .map_err(|source| BlobError::Storage { path: pins_file, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn content_id_is_stable_sha256_hex() {
        assert_eq!(
            content_id(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn add_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut blobs = BlobStore::open(dir.path()).unwrap();

        let id = blobs.add_pinned(b"segment bytes").unwrap();
        assert_eq!(blobs.read(&id).unwrap(), b"segment bytes");
        assert_matches!(blobs.read("missing"), Err(BlobError::NotFound(_)));
    }

    #[test]
    fn gc_only_removes_unpinned_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut blobs = BlobStore::open(dir.path()).unwrap();

        let kept = blobs.add_pinned(b"kept").unwrap();
        let dropped = blobs.add_pinned(b"dropped").unwrap();
        blobs.unpin(&dropped).unwrap();

        assert_eq!(blobs.gc().unwrap(), 1);
        assert!(blobs.read(&kept).is_ok());
        assert_matches!(blobs.read(&dropped), Err(BlobError::NotFound(_)));
    }

    #[test]
    fn pins_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let dropped = {
            let mut blobs = BlobStore::open(dir.path()).unwrap();
            blobs.add_pinned(b"kept").unwrap();
            let dropped = blobs.add_pinned(b"dropped").unwrap();
            blobs.unpin(&dropped).unwrap();
            dropped
        };

        let mut blobs = BlobStore::open(dir.path()).unwrap();
        assert_eq!(blobs.gc().unwrap(), 1);
        assert_matches!(blobs.read(&dropped), Err(BlobError::NotFound(_)));
    }
}
