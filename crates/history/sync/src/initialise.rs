//! Bootstrapping a node from network history.
//!
//! An empty or lagging node asks its bootstrap peers for their most recent
//! segment, picks the best answer, walks the segment chain backwards via
//! the previous-segment links until it has enough, reconstructs the longest
//! contiguous run from everything it now holds and loads it. The cycle
//! repeats until the node has caught up with what the network announces.

use crate::{
    client::{HistoryPeerClient, PeerSegment, PeerSegmentResponse},
    selection,
    HistoryService,
    SyncConfig,
    SyncError,
    SyncResult,
};
use backon::{ConstantBuilder, Retryable};
use futures_util::future::join_all;
use tessera_history_snapshot::{catalog::BlockSpan, LoadResult};
use tessera_history_types::{
    contiguous_histories, most_recent_contiguous_history, Segment, SegmentIndexEntry,
};
use tracing::{info, warn};

/// Upper bound on bootstrap peers queried in one selection round.
const MAX_PEERS_TO_CONTACT: usize = 10;

/// Brings the node's history in line with the network.
///
/// With `to_segment` configured the peer query is bypassed entirely and
/// exactly that segment's chain is loaded, in a single pass. Otherwise the
/// fetch-and-load cycle repeats until the best peer announcement no longer
/// exceeds the local span. The whole run is bounded by the configured
/// overall deadline; individual fetches carry their own deadlines and
/// retries underneath it.
pub async fn initialise_from_network_history<S, C>(
    config: &SyncConfig,
    service: &S,
    client: &C,
) -> SyncResult<()>
where
    S: HistoryService + ?Sized,
    C: HistoryPeerClient + ?Sized,
{
    tokio::time::timeout(config.initialise_timeout, catch_up_with_network(config, service, client))
        .await
        .map_err(|_| SyncError::InitialiseDeadlineExceeded)?
}

async fn catch_up_with_network<S, C>(
    config: &SyncConfig,
    service: &S,
    client: &C,
) -> SyncResult<()>
where
    S: HistoryService + ?Sized,
    C: HistoryPeerClient + ?Sized,
{
    if let Some(segment_id) = &config.to_segment {
        let span = service.datanode_block_span().await?;
        let target = fetch_segment_with_retry(config, service, segment_id).await?;
        fetch_chain(config, service, &span, target).await?;
        load_reconstructed(service).await?;
        return Ok(())
    }

    let mut previously_loaded_to = None;
    loop {
        let span = service.datanode_block_span().await?;
        let target = select_target(config, service, client).await?;

        if span.has_data && target.height_to <= span.to_height {
            info!(
                target: "history::sync",
                to_height = span.to_height,
                "Local history is up to date with the network"
            );
            return Ok(())
        }

        // A pass that made no progress means the announced history cannot
        // actually be assembled; looping again would spin forever.
        if span.has_data && previously_loaded_to == Some(span.to_height) {
            return Err(SyncError::NoHistoryAvailable)
        }

        let target_entry =
            fetch_segment_with_retry(config, service, &target.history_segment_id).await?;
        fetch_chain(config, service, &span, target_entry).await?;
        let loaded = load_reconstructed(service).await?;
        previously_loaded_to = Some(loaded.loaded_to_height);
    }
}

/// Queries every bootstrap peer and picks the segment to sync towards.
async fn select_target<S, C>(
    config: &SyncConfig,
    service: &S,
    client: &C,
) -> SyncResult<PeerSegment>
where
    S: HistoryService + ?Sized,
    C: HistoryPeerClient + ?Sized,
{
    let peers = client.bootstrap_peers().await;
    if peers.is_empty() {
        return Err(SyncError::NoPeersAvailable)
    }

    let queries = peers.iter().take(MAX_PEERS_TO_CONTACT).map(|peer| async move {
        match tokio::time::timeout(config.retry_timeout, client.most_recent_segment(peer)).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(err)) => {
                warn!(target: "history::sync", %err, "Peer query failed");
                None
            }
            Err(_) => {
                warn!(target: "history::sync", peer = %peer, "Peer query timed out");
                None
            }
        }
    });
    let responses: Vec<PeerSegmentResponse> =
        join_all(queries).await.into_iter().flatten().collect();

    if responses.is_empty() {
        return Err(SyncError::NoPeersAvailable)
    }

    let selected = selection::select_most_recent_segment(&responses, &service.swarm_key_seed())
        .ok_or(SyncError::NoEligiblePeers)?;
    info!(
        target: "history::sync",
        peer = %selected.peer_addr,
        height_to = selected.segment.height_to,
        "Selected peer history to sync towards"
    );
    Ok(selected.segment)
}

/// Walks the previous-segment links backwards from `entry` until the chain
/// runs out, the local span is reached, or enough blocks are covered.
async fn fetch_chain<S>(
    config: &SyncConfig,
    service: &S,
    span: &BlockSpan,
    mut entry: SegmentIndexEntry,
) -> SyncResult<()>
where
    S: HistoryService + ?Sized,
{
    let target_to = entry.height_to();
    loop {
        if entry.previous_segment_id().is_empty() {
            return Ok(())
        }
        if span.has_data && entry.height_from() <= span.to_height + 1 {
            return Ok(())
        }
        if !span.has_data && target_to - entry.height_from() + 1 >= config.minimum_block_count {
            return Ok(())
        }

        let previous_id = entry.previous_segment_id().to_owned();
        entry = fetch_segment_with_retry(config, service, &previous_id).await?;
    }
}

/// One segment fetch under a deadline, retried a bounded number of times
/// with a constant pause.
async fn fetch_segment_with_retry<S>(
    config: &SyncConfig,
    service: &S,
    content_id: &str,
) -> SyncResult<SegmentIndexEntry>
where
    S: HistoryService + ?Sized,
{
    let backoff = ConstantBuilder::default()
        .with_delay(config.retry_timeout)
        .with_max_times(config.fetch_retry_max);

    (|| async {
        match tokio::time::timeout(config.timeout, service.fetch_history_segment(content_id)).await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::FetchTimeout(content_id.to_owned())),
        }
    })
    .retry(&backoff)
    .notify(|err, _| {
        warn!(target: "history::sync", %content_id, %err, "Retrying segment fetch")
    })
    .await
}

/// Reconstructs the most recent contiguous run from everything held locally
/// and loads it.
async fn load_reconstructed<S>(service: &S) -> SyncResult<LoadResult>
where
    S: HistoryService + ?Sized,
{
    let segments = service.list_all_history_segments().await?;
    let history =
        most_recent_contiguous_history(contiguous_histories(segments))
            .ok_or(SyncError::NoHistoryAvailable)?;

    let result = service.load_history_into_datanode(&history).await?;
    info!(
        target: "history::sync",
        loaded_from = result.loaded_from_height,
        loaded_to = result.loaded_to_height,
        rows = result.rows_loaded,
        "Loaded network history"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PeerQueryError;
    use assert_matches::assert_matches;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use tessera_history_store::{StoreError, TransportError};
    use tessera_history_types::SegmentMeta;

    fn entry(from: u64, to: u64, id: &str, previous: &str) -> SegmentIndexEntry {
        SegmentIndexEntry {
            meta: SegmentMeta {
                chain_id: "chain".to_owned(),
                height_from: from,
                height_to: to,
                previous_segment_id: previous.to_owned(),
                schema_version: 1,
            },
            content_id: id.to_owned(),
        }
    }

    /// Three-segment chain covering heights 0 to 3000.
    fn network_segments() -> HashMap<String, SegmentIndexEntry> {
        [
            entry(0, 1000, "cid-1", ""),
            entry(1001, 2000, "cid-2", "cid-1"),
            entry(2001, 3000, "cid-3", "cid-2"),
        ]
        .into_iter()
        .map(|entry| (entry.content_id.clone(), entry))
        .collect()
    }

    #[derive(Debug)]
    struct MockService {
        span: Mutex<BlockSpan>,
        network: HashMap<String, SegmentIndexEntry>,
        held: Mutex<Vec<SegmentIndexEntry>>,
        loads: Mutex<Vec<(u64, u64)>>,
        fetch_failures: AtomicUsize,
        fetch_delay: Duration,
    }

    impl MockService {
        fn new(span: BlockSpan, network: HashMap<String, SegmentIndexEntry>) -> Self {
            Self {
                span: Mutex::new(span),
                network,
                held: Mutex::new(Vec::new()),
                loads: Mutex::new(Vec::new()),
                fetch_failures: AtomicUsize::new(0),
                fetch_delay: Duration::ZERO,
            }
        }

        fn with_data(from: u64, to: u64) -> BlockSpan {
            BlockSpan { has_data: true, from_height: from, to_height: to }
        }

        fn fetched_ids(&self) -> Vec<String> {
            self.held.lock().unwrap().iter().map(|e| e.content_id.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl HistoryService for MockService {
        async fn datanode_block_span(&self) -> SyncResult<BlockSpan> {
            Ok(*self.span.lock().unwrap())
        }

        fn swarm_key_seed(&self) -> String {
            "chain".to_owned()
        }

        async fn fetch_history_segment(&self, content_id: &str) -> SyncResult<SegmentIndexEntry> {
            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            if self.fetch_failures.load(Ordering::SeqCst) > 0 {
                self.fetch_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(SyncError::Store(StoreError::FetchFailed {
                    content_id: content_id.to_owned(),
                    peers: vec![],
                    source: TransportError::Transport("flaky".to_owned()),
                }))
            }

            let entry = self.network.get(content_id).cloned().ok_or_else(|| {
                SyncError::Store(StoreError::FetchFailed {
                    content_id: content_id.to_owned(),
                    peers: vec![],
                    source: TransportError::NotAvailable(content_id.to_owned()),
                })
            })?;
            self.held.lock().unwrap().push(entry.clone());
            Ok(entry)
        }

        async fn list_all_history_segments(&self) -> SyncResult<Vec<SegmentIndexEntry>> {
            Ok(self.held.lock().unwrap().clone())
        }

        async fn load_history_into_datanode(
            &self,
            history: &tessera_history_types::ContiguousHistory<SegmentIndexEntry>,
        ) -> SyncResult<LoadResult> {
            self.loads.lock().unwrap().push((history.height_from, history.height_to));

            let mut span = self.span.lock().unwrap();
            if !span.has_data {
                span.from_height = history.height_from;
            }
            span.has_data = true;
            span.to_height = history.height_to;

            Ok(LoadResult {
                loaded_from_height: history.height_from,
                loaded_to_height: history.height_to,
                rows_loaded: 1,
            })
        }
    }

    #[derive(Debug, Default)]
    struct MockClient {
        responses: Vec<PeerSegmentResponse>,
    }

    impl MockClient {
        fn announcing(segment: &SegmentIndexEntry, seed: &str) -> Self {
            Self {
                responses: vec![PeerSegmentResponse {
                    peer_addr: "peer-a:3007".to_owned(),
                    swarm_key_seed: seed.to_owned(),
                    segment: PeerSegment {
                        height_from: segment.meta.height_from,
                        height_to: segment.meta.height_to,
                        history_segment_id: segment.content_id.clone(),
                        previous_history_segment_id: segment.meta.previous_segment_id.clone(),
                    },
                }],
            }
        }
    }

    #[async_trait::async_trait]
    impl HistoryPeerClient for MockClient {
        async fn bootstrap_peers(&self) -> Vec<String> {
            self.responses.iter().map(|r| r.peer_addr.clone()).collect()
        }

        async fn most_recent_segment(
            &self,
            peer_addr: &str,
        ) -> Result<PeerSegmentResponse, PeerQueryError> {
            self.responses
                .iter()
                .find(|r| r.peer_addr == peer_addr)
                .cloned()
                .ok_or_else(|| PeerQueryError {
                    peer_addr: peer_addr.to_owned(),
                    reason: "unknown peer".to_owned(),
                })
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            minimum_block_count: 10_000,
            fetch_retry_max: 2,
            retry_timeout: Duration::from_millis(10),
            timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_node_walks_the_whole_chain_and_loads_it() {
        let network = network_segments();
        let service = MockService::new(BlockSpan::default(), network.clone());
        let client = MockClient::announcing(&network["cid-3"], "chain");

        initialise_from_network_history(&config(), &service, &client).await.unwrap();

        assert_eq!(service.fetched_ids(), vec!["cid-3", "cid-2", "cid-1"]);
        assert_eq!(*service.loads.lock().unwrap(), vec![(0, 3000)]);
    }

    #[tokio::test]
    async fn small_minimum_block_count_stops_the_walk_early() {
        let network = network_segments();
        let service = MockService::new(BlockSpan::default(), network.clone());
        let client = MockClient::announcing(&network["cid-3"], "chain");
        let config = SyncConfig { minimum_block_count: 1, ..config() };

        initialise_from_network_history(&config, &service, &client).await.unwrap();

        assert_eq!(service.fetched_ids(), vec!["cid-3"]);
        assert_eq!(*service.loads.lock().unwrap(), vec![(2001, 3000)]);
    }

    #[tokio::test]
    async fn partially_synced_node_fetches_only_the_missing_tail() {
        let network = network_segments();
        let service = MockService::new(MockService::with_data(0, 2000), network.clone());
        let client = MockClient::announcing(&network["cid-3"], "chain");

        initialise_from_network_history(&config(), &service, &client).await.unwrap();

        assert_eq!(service.fetched_ids(), vec!["cid-3"]);
        assert_eq!(*service.loads.lock().unwrap(), vec![(2001, 3000)]);
    }

    #[tokio::test]
    async fn up_to_date_node_fetches_nothing() {
        let network = network_segments();
        let service = MockService::new(MockService::with_data(0, 3000), network.clone());
        let client = MockClient::announcing(&network["cid-3"], "chain");

        initialise_from_network_history(&config(), &service, &client).await.unwrap();

        assert!(service.fetched_ids().is_empty());
        assert!(service.loads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_peers_is_an_error() {
        let service = MockService::new(BlockSpan::default(), network_segments());
        let client = MockClient::default();

        assert_matches!(
            initialise_from_network_history(&config(), &service, &client).await,
            Err(SyncError::NoPeersAvailable)
        );
    }

    #[tokio::test]
    async fn peers_on_another_swarm_key_are_no_candidates() {
        let network = network_segments();
        let service = MockService::new(BlockSpan::default(), network.clone());
        let client = MockClient::announcing(&network["cid-3"], "another-chain");

        assert_matches!(
            initialise_from_network_history(&config(), &service, &client).await,
            Err(SyncError::NoEligiblePeers)
        );
    }

    #[tokio::test]
    async fn to_segment_bypasses_peer_selection() {
        let network = network_segments();
        let service = MockService::new(BlockSpan::default(), network);
        // No peers configured at all; the client must never be needed.
        let client = MockClient::default();
        let config = SyncConfig {
            to_segment: Some("cid-2".to_owned()),
            minimum_block_count: 2000,
            ..config()
        };

        initialise_from_network_history(&config, &service, &client).await.unwrap();

        assert_eq!(service.fetched_ids(), vec!["cid-2", "cid-1"]);
        assert_eq!(*service.loads.lock().unwrap(), vec![(0, 2000)]);
    }

    #[tokio::test]
    async fn transient_fetch_failures_are_retried() {
        let network = network_segments();
        let service = MockService::new(MockService::with_data(0, 2000), network.clone());
        service.fetch_failures.store(2, Ordering::SeqCst);
        let client = MockClient::announcing(&network["cid-3"], "chain");

        initialise_from_network_history(&config(), &service, &client).await.unwrap();

        assert_eq!(service.fetched_ids(), vec!["cid-3"]);
    }

    #[tokio::test]
    async fn overall_deadline_bounds_the_whole_run() {
        let network = network_segments();
        let mut service = MockService::new(BlockSpan::default(), network.clone());
        // Each fetch is slow but comfortably inside its own deadline; only
        // the run as a whole runs out of time.
        service.fetch_delay = Duration::from_millis(50);
        let client = MockClient::announcing(&network["cid-3"], "chain");
        let config =
            SyncConfig { initialise_timeout: Duration::from_millis(20), ..config() };

        assert_matches!(
            initialise_from_network_history(&config, &service, &client).await,
            Err(SyncError::InitialiseDeadlineExceeded)
        );
    }

    #[tokio::test]
    async fn exhausted_fetch_retries_fail_the_bootstrap() {
        let network = network_segments();
        let service = MockService::new(MockService::with_data(0, 2000), network.clone());
        service.fetch_failures.store(10, Ordering::SeqCst);
        let client = MockClient::announcing(&network["cid-3"], "chain");

        assert_matches!(
            initialise_from_network_history(&config(), &service, &client).await,
            Err(SyncError::Store(StoreError::FetchFailed { .. }))
        );
    }
}
