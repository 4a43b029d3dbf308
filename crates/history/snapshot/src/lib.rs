//! Creation and loading of relational history snapshots.
//!
//! The schema layer declares what to replicate through catalog tables (see
//! [`catalog`]); the engines here turn that into deterministic artifact
//! pairs and back. [`SnapshotCreator`] dumps one block span into a history
//! artifact plus a full current-state artifact; [`SnapshotLoader`] applies a
//! contiguous run of such pairs to an empty or partially synced database.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod catalog;
mod compress;
mod creator;
mod dump;
mod error;
mod loader;

pub use creator::{
    unpublished_snapshots, CreatedSnapshot, SnapshotCreator, UnpublishedSnapshot,
};
pub use error::{SnapshotError, SnapshotResult};
pub use loader::{
    HistoryToLoad, LoadResult, NoMigrations, SchemaMigrator, SnapshotLoader,
};
