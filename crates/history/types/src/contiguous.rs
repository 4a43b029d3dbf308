//! Stitching segments into maximal contiguous height runs.

use crate::{BlockHeight, Segment};
use std::collections::HashMap;

/// A maximal run of segments with no height gaps, oldest first.
///
/// Derived, never persisted; rebuilt on demand from whatever set of segments
/// the caller holds. Consecutive members satisfy
/// `segments[i].height_to() + 1 == segments[i + 1].height_from()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContiguousHistory<S> {
    /// First height covered by the run, inclusive.
    pub height_from: BlockHeight,
    /// Last height covered by the run, inclusive.
    pub height_to: BlockHeight,
    /// Member segments, ascending by `height_from`.
    pub segments: Vec<S>,
}

/// Error returned when a requested span cannot be satisfied by any run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContiguousHistoryError {
    /// No run covers the span with segment boundaries exactly at `from` and
    /// `to`. A span that is covered in height but whose bounds fall inside a
    /// segment is a hard failure, not a best-effort partial answer.
    #[error("no contiguous history found for span {from} to {to}")]
    NoContiguousHistory {
        /// Requested start height.
        from: BlockHeight,
        /// Requested end height.
        to: BlockHeight,
    },
}

impl<S: Segment> ContiguousHistory<S> {
    /// Starts a new run from a single segment.
    pub fn new(segment: S) -> Self {
        Self {
            height_from: segment.height_from(),
            height_to: segment.height_to(),
            segments: vec![segment],
        }
    }

    /// Adds `segment` to the run if it is adjacent to either end, returning
    /// `false` if it is not.
    pub fn try_add(&mut self, segment: S) -> bool {
        if self.segments.is_empty() {
            self.height_from = segment.height_from();
            self.height_to = segment.height_to();
            self.segments.push(segment);
            return true
        }

        if segment.height_from() == self.height_to + 1 {
            self.height_to = segment.height_to();
            self.segments.push(segment);
            return true
        }

        if segment.height_to() + 1 == self.height_from {
            self.height_from = segment.height_from();
            self.segments.insert(0, segment);
            return true
        }

        false
    }
}

/// Stitches `segments` into maximal contiguous runs.
///
/// Segments are sorted ascending by `height_from` and merged left to right;
/// a segment that is not adjacent to any existing run starts a new one. An
/// empty input yields an empty result. The order of the returned runs is not
/// guaranteed; callers needing a specific run must search.
pub fn contiguous_histories<S: Segment>(mut segments: Vec<S>) -> Vec<ContiguousHistory<S>> {
    segments.sort_by_key(|s| s.height_from());

    let mut runs: Vec<ContiguousHistory<S>> = Vec::new();
    // Tail height of each run, for O(1) adjacency lookups during the scan.
    let mut tail_to_run: HashMap<BlockHeight, usize> = HashMap::new();
    let mut head_to_run: HashMap<BlockHeight, usize> = HashMap::new();

    for segment in segments {
        if let Some(&idx) =
            segment.height_from().checked_sub(1).and_then(|h| tail_to_run.get(&h))
        {
            tail_to_run.remove(&runs[idx].height_to);
            let added = runs[idx].try_add(segment);
            debug_assert!(added);
            tail_to_run.insert(runs[idx].height_to, idx);
            continue
        }

        if let Some(&idx) = head_to_run.get(&(segment.height_to() + 1)) {
            head_to_run.remove(&runs[idx].height_from);
            let added = runs[idx].try_add(segment);
            debug_assert!(added);
            head_to_run.insert(runs[idx].height_from, idx);
            continue
        }

        let run = ContiguousHistory::new(segment);
        tail_to_run.insert(run.height_to, runs.len());
        head_to_run.insert(run.height_from, runs.len());
        runs.push(run);
    }

    runs
}

/// Returns the run whose segment boundaries align exactly with
/// `[from, to]`, truncated to the segments lying within that span.
///
/// A run qualifies only if it covers the span *and* some member starts
/// exactly at `from` and some member ends exactly at `to`; this protects the
/// load engine from silently loading a wrong-shaped slice.
pub fn contiguous_history_for_span<S: Segment>(
    runs: Vec<ContiguousHistory<S>>,
    from: BlockHeight,
    to: BlockHeight,
) -> Result<ContiguousHistory<S>, ContiguousHistoryError> {
    for run in runs {
        if run.height_from > from || run.height_to < to {
            continue
        }

        let starts_at_from = run.segments.iter().any(|s| s.height_from() == from);
        let ends_at_to = run.segments.iter().any(|s| s.height_to() == to);
        if !starts_at_from || !ends_at_to {
            continue
        }

        let segments = run
            .segments
            .into_iter()
            .filter(|s| s.height_from() >= from && s.height_to() <= to)
            .collect();

        return Ok(ContiguousHistory { height_from: from, height_to: to, segments })
    }

    Err(ContiguousHistoryError::NoContiguousHistory { from, to })
}

/// Returns the run with the greatest `height_to`, used to decide how far
/// existing data can be extended.
pub fn most_recent_contiguous_history<S: Segment>(
    runs: Vec<ContiguousHistory<S>>,
) -> Option<ContiguousHistory<S>> {
    runs.into_iter().max_by_key(|run| run.height_to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SegmentIndexEntry, SegmentMeta};
    use assert_matches::assert_matches;

    fn entry(from: BlockHeight, to: BlockHeight) -> SegmentIndexEntry {
        SegmentIndexEntry {
            meta: SegmentMeta {
                chain_id: "chain".to_owned(),
                height_from: from,
                height_to: to,
                previous_segment_id: String::new(),
                schema_version: 1,
            },
            content_id: format!("cid-{from}-{to}"),
        }
    }

    #[test]
    fn empty_input_yields_no_runs() {
        let runs = contiguous_histories(Vec::<SegmentIndexEntry>::new());
        assert!(runs.is_empty());
    }

    #[test]
    fn adjacent_segments_merge_into_one_run() {
        let runs =
            contiguous_histories(vec![entry(1001, 2000), entry(0, 1000), entry(2001, 3000)]);

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].height_from, 0);
        assert_eq!(runs[0].height_to, 3000);
        assert_eq!(
            runs[0].segments.iter().map(|s| s.height_from()).collect::<Vec<_>>(),
            vec![0, 1001, 2001]
        );
    }

    #[test]
    fn gap_splits_runs() {
        let runs = contiguous_histories(vec![
            entry(0, 1000),
            entry(1001, 2000),
            entry(3001, 4000),
            entry(4001, 5000),
        ]);

        assert_eq!(runs.len(), 2);
        let mut bounds =
            runs.iter().map(|run| (run.height_from, run.height_to)).collect::<Vec<_>>();
        bounds.sort_unstable();
        assert_eq!(bounds, vec![(0, 2000), (3001, 5000)]);
    }

    #[test]
    fn run_bounds_match_union_of_members() {
        let runs = contiguous_histories(vec![entry(500, 999), entry(1000, 1499)]);

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].height_from, runs[0].segments.first().unwrap().height_from());
        assert_eq!(runs[0].height_to, runs[0].segments.last().unwrap().height_to());
    }

    #[test]
    fn span_with_aligned_boundaries_is_found_and_truncated() {
        let runs =
            contiguous_histories(vec![entry(0, 1000), entry(1001, 2000), entry(2001, 3000)]);

        let run = contiguous_history_for_span(runs, 1001, 3000).unwrap();
        assert_eq!(run.height_from, 1001);
        assert_eq!(run.height_to, 3000);
        assert_eq!(run.segments.len(), 2);
    }

    #[test]
    fn span_covering_whole_run_returns_all_segments() {
        let runs =
            contiguous_histories(vec![entry(0, 1000), entry(1001, 2000), entry(2001, 3000)]);

        let run = contiguous_history_for_span(runs, 0, 3000).unwrap();
        assert_eq!(run.segments.len(), 3);
    }

    #[test]
    fn span_with_misaligned_boundaries_is_rejected() {
        let runs =
            contiguous_histories(vec![entry(0, 1000), entry(1001, 2000), entry(2001, 3000)]);

        assert_matches!(
            contiguous_history_for_span(runs.clone(), 1000, 3000),
            Err(ContiguousHistoryError::NoContiguousHistory { from: 1000, to: 3000 })
        );
        assert_matches!(
            contiguous_history_for_span(runs, 0, 2001),
            Err(ContiguousHistoryError::NoContiguousHistory { from: 0, to: 2001 })
        );
    }

    #[test]
    fn most_recent_run_has_greatest_height_to() {
        let runs = contiguous_histories(vec![
            entry(2001, 3000),
            entry(3001, 4000),
            entry(5001, 6000),
            entry(6001, 7000),
        ]);

        let most_recent = most_recent_contiguous_history(runs).unwrap();
        assert_eq!(most_recent.height_from, 5001);
        assert_eq!(most_recent.height_to, 7000);
    }

    #[test]
    fn most_recent_of_no_runs_is_none() {
        assert!(most_recent_contiguous_history(Vec::<ContiguousHistory<SegmentIndexEntry>>::new())
            .is_none());
    }
}
