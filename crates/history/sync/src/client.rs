//! Peer query seam for bootstrap.

use std::fmt;
use tessera_history_types::{BlockHeight, Segment};

/// A peer's answer to "what is your most recent history segment".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSegmentResponse {
    /// Address the peer answered from.
    pub peer_addr: String,
    /// Seed the peer derives its swarm key from. Peers on a different seed
    /// belong to a different replication network and are ignored.
    pub swarm_key_seed: String,
    /// The peer's most recent segment.
    pub segment: PeerSegment,
}

/// A segment as announced by a peer; not yet fetched or verified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSegment {
    /// First block height covered, inclusive.
    pub height_from: BlockHeight,
    /// Last block height covered, inclusive.
    pub height_to: BlockHeight,
    /// Content id of the segment archive.
    pub history_segment_id: String,
    /// Content id of the preceding segment, empty for the earliest.
    pub previous_history_segment_id: String,
}

impl Segment for PeerSegment {
    fn height_from(&self) -> BlockHeight {
        self.height_from
    }

    fn height_to(&self) -> BlockHeight {
        self.height_to
    }

    fn segment_id(&self) -> &str {
        &self.history_segment_id
    }

    fn previous_segment_id(&self) -> &str {
        &self.previous_history_segment_id
    }
}

/// Failure to query one peer. Per-peer failures are tolerated during
/// bootstrap; a peer that does not answer is simply not a candidate.
#[derive(Debug, thiserror::Error)]
#[error("peer query to {peer_addr} failed: {reason}")]
pub struct PeerQueryError {
    /// Peer that was queried.
    pub peer_addr: String,
    /// What went wrong.
    pub reason: String,
}

/// Queries bootstrap peers for their most recent segment.
#[async_trait::async_trait]
pub trait HistoryPeerClient: fmt::Debug + Send + Sync {
    /// Addresses of the peers to bootstrap from.
    async fn bootstrap_peers(&self) -> Vec<String>;

    /// Asks one peer for its most recent segment.
    async fn most_recent_segment(
        &self,
        peer_addr: &str,
    ) -> Result<PeerSegmentResponse, PeerQueryError>;
}
