//! Transport seam for fetching segments from peers.

use std::fmt;

/// Errors a transport implementation can surface.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No connected peer provides the requested content id.
    #[error("content id {0} not available from any connected peer")]
    NotAvailable(String),

    /// The transport itself failed.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Retrieval of segment archives from the peer network.
///
/// The store only speaks content ids; where the bytes come from, and how
/// peers are dialled, is entirely the implementation's concern. Fetches may
/// take a long time, so callers are expected to impose their own deadlines.
#[async_trait::async_trait]
pub trait SegmentTransport: fmt::Debug + Send + Sync {
    /// Fetches the archive bytes published under `content_id`.
    async fn fetch(&self, content_id: &str) -> Result<Vec<u8>, TransportError>;

    /// Addresses of the currently connected peers, for diagnostics.
    async fn connected_peers(&self) -> Vec<String>;
}
