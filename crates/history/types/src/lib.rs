//! Commonly used types for network history segments.
//!
//! A *segment* is an immutable, content-addressed pair of archives covering
//! one block-height range plus a link to the previous segment. Everything
//! that behaves like a segment, whether a durable index entry, a
//! peer-announced segment or a test double, implements the [`Segment`]
//! capability; the contiguous-history reconstructor operates only on that.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod contiguous;
mod segment;
mod snapshot;

pub use contiguous::{
    contiguous_histories, contiguous_history_for_span, most_recent_contiguous_history,
    ContiguousHistory, ContiguousHistoryError,
};
pub use segment::{Segment, SegmentIndexEntry, SegmentMeta};
pub use snapshot::{
    in_progress_file_name, CurrentStateSnapshot, HistorySnapshot, SNAPSHOT_IN_PROGRESS_EXTENSION,
};

/// A block height.
pub type BlockHeight = u64;
