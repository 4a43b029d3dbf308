use crate::BlockHeight;
use serde::{Deserialize, Serialize};

/// Structural capability shared by everything that behaves like a history
/// segment: a height range, a content id and a back-link to the previous
/// segment in the chain.
pub trait Segment {
    /// First block height covered by the segment, inclusive.
    fn height_from(&self) -> BlockHeight;
    /// Last block height covered by the segment, inclusive.
    fn height_to(&self) -> BlockHeight;
    /// Content id of the segment archive.
    fn segment_id(&self) -> &str;
    /// Content id of the segment immediately preceding this one, empty for
    /// the earliest known segment.
    fn previous_segment_id(&self) -> &str;
}

/// Immutable description of a produced segment, written into the segment
/// archive as `metadata.json` and embedded in every index entry.
///
/// Ranges for the same chain must never overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Chain the segment belongs to.
    pub chain_id: String,
    /// First block height covered, inclusive.
    pub height_from: BlockHeight,
    /// Last block height covered, inclusive.
    pub height_to: BlockHeight,
    /// Content id of the previous segment, empty if this is the earliest.
    pub previous_segment_id: String,
    /// Relational schema version the segment was produced under.
    pub schema_version: i64,
}

impl SegmentMeta {
    /// File name the segment archive is staged under,
    /// `{chain}-{from}-{to}-segment.tar`.
    pub fn archive_file_name(&self) -> String {
        format!("{}-{}-{}-segment.tar", self.chain_id, self.height_from, self.height_to)
    }
}

/// A [`SegmentMeta`] together with the content id it was published under.
///
/// Created when a segment is locally produced or successfully fetched from a
/// peer; never mutated; removed only by retention GC. Must be stable across
/// process restarts, so the serialized shape is part of the on-disk format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndexEntry {
    /// Segment metadata.
    #[serde(flatten)]
    pub meta: SegmentMeta,
    /// Content id handle into the content-addressed store.
    pub content_id: String,
}

impl Segment for SegmentIndexEntry {
    fn height_from(&self) -> BlockHeight {
        self.meta.height_from
    }

    fn height_to(&self) -> BlockHeight {
        self.meta.height_to
    }

    fn segment_id(&self) -> &str {
        &self.content_id
    }

    fn previous_segment_id(&self) -> &str {
        &self.meta.previous_segment_id
    }
}

impl<S: Segment> Segment for &S {
    fn height_from(&self) -> BlockHeight {
        (*self).height_from()
    }

    fn height_to(&self) -> BlockHeight {
        (*self).height_to()
    }

    fn segment_id(&self) -> &str {
        (*self).segment_id()
    }

    fn previous_segment_id(&self) -> &str {
        (*self).previous_segment_id()
    }
}
