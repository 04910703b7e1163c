//! # Peer Routing
//!
//! Interface to the cluster scheduler that knows which peer node already
//! holds a file. The accelerator only consumes it; routing is advisory and
//! any failure means "no peer available".

use async_trait::async_trait;

use crate::BlobCacheError;
use crate::identity::RepoType;

/// Range a router is asked about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteQuery {
    pub repo_type: RepoType,
    pub org: String,
    pub repo: String,
    pub file_name: String,
    pub etag: String,
    pub start: u64,
    pub end: u64,
    pub file_size: u64,
}

/// A peer that accepted responsibility for a range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRoute {
    /// Base endpoint of the peer, e.g. `http://10.0.0.7:9000`
    pub addr: String,
    /// The peer can serve bytes up to this offset (exclusive)
    pub max_offset: u64,
}

/// A trait for routing collaborators that can delegate ranges to peers
#[async_trait]
pub trait PeerRouter: Send + Sync {
    /// Ask whether a peer should serve `query`. `Ok(None)` declines.
    async fn route(&self, query: &RouteQuery) -> Result<Option<PeerRoute>, BlobCacheError>;
}
