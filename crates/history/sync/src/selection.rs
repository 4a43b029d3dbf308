//! Choosing which peer's history to bootstrap from.

use crate::client::PeerSegmentResponse;
use rand::seq::SliceRandom;
use tracing::debug;

/// Selects the response to bootstrap from: the highest announced
/// `height_to` among peers sharing `swarm_key_seed`, with ties broken
/// uniformly at random so repeated bootstraps spread load across peers.
///
/// Returns `None` if no response matches the seed.
pub fn select_most_recent_segment(
    responses: &[PeerSegmentResponse],
    swarm_key_seed: &str,
) -> Option<PeerSegmentResponse> {
    let eligible: Vec<&PeerSegmentResponse> = responses
        .iter()
        .filter(|response| {
            let matches = response.swarm_key_seed == swarm_key_seed;
            if !matches {
                debug!(
                    target: "history::sync",
                    peer = %response.peer_addr,
                    "Ignoring peer on a different swarm key seed"
                );
            }
            matches
        })
        .collect();

    let best_height = eligible.iter().map(|response| response.segment.height_to).max()?;
    let tied: Vec<&&PeerSegmentResponse> = eligible
        .iter()
        .filter(|response| response.segment.height_to == best_height)
        .collect();

    tied.choose(&mut rand::thread_rng()).map(|response| (**response).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PeerSegment;

    fn response(peer: &str, seed: &str, height_to: u64) -> PeerSegmentResponse {
        PeerSegmentResponse {
            peer_addr: peer.to_owned(),
            swarm_key_seed: seed.to_owned(),
            segment: PeerSegment {
                height_from: 0,
                height_to,
                history_segment_id: format!("cid-{peer}-{height_to}"),
                previous_history_segment_id: String::new(),
            },
        }
    }

    #[test]
    fn highest_announced_height_wins() {
        let responses = [
            response("peer-a", "chain", 2000),
            response("peer-b", "chain", 3000),
            response("peer-c", "chain", 1000),
        ];

        let selected = select_most_recent_segment(&responses, "chain").unwrap();
        assert_eq!(selected.peer_addr, "peer-b");
    }

    #[test]
    fn peers_on_other_swarm_keys_are_ignored() {
        let responses = [
            response("peer-a", "other-chain", 9000),
            response("peer-b", "chain", 3000),
        ];

        let selected = select_most_recent_segment(&responses, "chain").unwrap();
        assert_eq!(selected.peer_addr, "peer-b");

        assert!(select_most_recent_segment(&responses, "third-chain").is_none());
        assert!(select_most_recent_segment(&[], "chain").is_none());
    }

    #[test]
    fn ties_select_one_of_the_tied_peers() {
        let responses = [
            response("peer-a", "chain", 3000),
            response("peer-b", "chain", 3000),
            response("peer-c", "chain", 1000),
        ];

        for _ in 0..10 {
            let selected = select_most_recent_segment(&responses, "chain").unwrap();
            assert_eq!(selected.segment.height_to, 3000);
            assert!(["peer-a", "peer-b"].contains(&selected.peer_addr.as_str()));
        }
    }
}
