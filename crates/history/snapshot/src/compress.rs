//! Deterministic compression of snapshot staging directories.
//!
//! Artifacts must be byte-identical across nodes dumping the same data, so
//! segment content ids agree: entries are added in sorted order with fixed
//! header fields, and the gzip header carries no timestamp.

use crate::{SnapshotError, SnapshotResult};
use flate2::{read::GzDecoder, Compression, GzBuilder};
use std::{
    fs::{self, File},
    path::Path,
};
use tar::{Archive, Builder, EntryType, Header};

/// Compresses every file directly under `src` into a tar.gz at `dest`.
pub(crate) fn compress_dir(src: &Path, dest: &Path) -> SnapshotResult<()> {
    let mut names = Vec::new();
    for entry in fs::read_dir(src).map_err(|source| SnapshotError::io(src, source))? {
        let entry = entry.map_err(|source| SnapshotError::io(src, source))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    names.sort();

    let file = File::create(dest).map_err(|source| SnapshotError::io(dest, source))?;
    let encoder = GzBuilder::new().mtime(0).write(file, Compression::default());
    let mut builder = Builder::new(encoder);

    for name in names {
        let path = src.join(&name);
        let bytes = fs::read(&path).map_err(|source| SnapshotError::io(&path, source))?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        builder
            .append_data(&mut header, &name, bytes.as_slice())
            .map_err(|source| SnapshotError::io(dest, source))?;
    }

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|source| SnapshotError::io(dest, source))?;
    Ok(())
}

/// Unpacks a tar.gz artifact into `dest`, creating it if needed.
pub(crate) fn decompress_file(src: &Path, dest: &Path) -> SnapshotResult<()> {
    fs::create_dir_all(dest).map_err(|source| SnapshotError::io(dest, source))?;
    let file = File::open(src).map_err(|source| SnapshotError::io(src, source))?;
    Archive::new(GzDecoder::new(file))
        .unpack(dest)
        .map_err(|source| SnapshotError::io(src, source))
}
