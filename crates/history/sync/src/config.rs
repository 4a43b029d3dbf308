//! Synchronization settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for history publication and bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Whether history replication runs at all.
    pub enabled: bool,
    /// Wipe all locally stored history on startup.
    pub wipe_on_startup: bool,
    /// Publish the segments this node produces.
    pub publish: bool,
    /// How many blocks behind the newest segment a segment may fall before
    /// retention removes it.
    pub history_retention_block_span: u64,
    /// Every how many committed blocks a snapshot is taken.
    pub snapshot_interval_block_span: u64,
    /// Minimum number of blocks to fetch when bootstrapping an empty node.
    pub minimum_block_count: u64,
    /// Bootstrap from this exact segment instead of asking peers.
    pub to_segment: Option<String>,
    /// Ports to try when querying a peer for its most recent segment.
    pub grpc_api_ports: Vec<u16>,
    /// How many times a failed segment fetch is retried.
    pub fetch_retry_max: usize,
    /// Pause between fetch retries.
    #[serde(with = "humantime_serde")]
    pub retry_timeout: Duration,
    /// Deadline for a single segment fetch.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Overall deadline for one full bootstrap run, independent of the
    /// per-fetch deadline.
    #[serde(with = "humantime_serde")]
    pub initialise_timeout: Duration,
    /// How often unpublished snapshots are scanned for and published.
    #[serde(with = "humantime_serde")]
    pub publish_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wipe_on_startup: false,
            publish: true,
            history_retention_block_span: 604_800,
            snapshot_interval_block_span: 1000,
            minimum_block_count: 1,
            to_segment: None,
            grpc_api_ports: vec![3007],
            fetch_retry_max: 3,
            retry_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            initialise_timeout: Duration::from_secs(60 * 60),
            publish_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_use_humantime_strings() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"retry_timeout": "250ms", "timeout": "1m", "initialise_timeout": "4h", "minimum_block_count": 500}"#,
        )
        .unwrap();

        assert_eq!(config.retry_timeout, Duration::from_millis(250));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.initialise_timeout, Duration::from_secs(4 * 60 * 60));
        assert_eq!(config.minimum_block_count, 500);
        assert!(config.enabled);
    }

    #[test]
    fn config_round_trips() {
        let config = SyncConfig { to_segment: Some("cid".to_owned()), ..Default::default() };
        let encoded = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<SyncConfig>(&encoded).unwrap(), config);
    }
}
