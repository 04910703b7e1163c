//! # Range Planner
//!
//! Partitions a requested byte range into an ordered list of maximal
//! contiguous sub-ranges that are either fully cached or must be fetched.
//! Fetched sub-ranges are split into bounded chunks and, in cluster mode,
//! may be delegated to a peer that already holds the file.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::BlobCacheError;
use crate::identity::FileIdentity;
use crate::routing::{PeerRouter, RouteQuery};

/// Read-only view of which blocks of a file are present
pub trait BlockPresence: Send + Sync {
    fn block_size(&self) -> u64;
    fn file_size(&self) -> u64;
    fn has_block(&self, index: u64) -> bool;
}

/// Where a remote sub-range is fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSource {
    /// The configured origin endpoint
    Origin,
    /// A peer node that accepted the range
    Peer { addr: String },
    /// The origin, for the tail a peer could not cover
    FallbackOrigin,
}

impl RemoteSource {
    pub fn label(&self) -> &'static str {
        match self {
            RemoteSource::Origin => "origin",
            RemoteSource::Peer { .. } => "peer",
            RemoteSource::FallbackOrigin => "fallback-origin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeKind {
    Cached,
    Remote(RemoteSource),
}

/// One planned sub-range `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRange {
    pub start: u64,
    pub end: u64,
    pub kind: RangeKind,
}

impl PlannedRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.kind, RangeKind::Cached)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionAnalysis {
    pub fully_present: bool,
    /// Start offset of the first absent block in the range
    pub first_missing: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub start: u64,
    pub end: u64,
    pub identity: &'a FileIdentity,
    /// Requests forwarded by a peer are never routed again
    pub internal: bool,
}

pub struct RangePlanner {
    max_remote_range_size: u64,
    router: Option<Arc<dyn PeerRouter>>,
    routing_timeout: Duration,
}

impl RangePlanner {
    pub fn new(max_remote_range_size: u64) -> Self {
        Self {
            max_remote_range_size,
            router: None,
            routing_timeout: Duration::from_secs(2),
        }
    }

    /// Enable peer routing.
    pub fn with_router(mut self, router: Arc<dyn PeerRouter>, timeout: Duration) -> Self {
        self.router = Some(router);
        self.routing_timeout = timeout;
        self
    }

    pub fn max_remote_range_size(&self) -> u64 {
        self.max_remote_range_size
    }

    /// Check how much of `[start, end)` is cached. `(0, 0)` means the whole
    /// file and always reports fully present.
    pub fn analyze_position(
        &self,
        presence: &dyn BlockPresence,
        start: u64,
        end: u64,
    ) -> Result<PositionAnalysis, BlobCacheError> {
        if start == 0 && end == 0 {
            return Ok(PositionAnalysis {
                fully_present: true,
                first_missing: None,
            });
        }
        validate_range(presence, start, end)?;

        let block_size = presence.block_size();
        let first_block = start / block_size;
        let last_block = (end - 1) / block_size;
        for block in first_block..=last_block {
            if !presence.has_block(block) {
                return Ok(PositionAnalysis {
                    fully_present: false,
                    first_missing: Some(block * block_size),
                });
            }
        }
        Ok(PositionAnalysis {
            fully_present: true,
            first_missing: None,
        })
    }

    /// Plan a request, consulting the peer router when one is configured.
    pub async fn plan(
        &self,
        presence: &dyn BlockPresence,
        request: &PlanRequest<'_>,
    ) -> Result<Vec<PlannedRange>, BlobCacheError> {
        let (start, end) = resolve_bounds(presence, request.start, request.end)?;
        if start == end {
            return Ok(Vec::new());
        }

        if let Some(router) = &self.router
            && !request.internal
            && let Some(ranges) = self
                .plan_with_peer(router.as_ref(), presence, request.identity, start, end)
                .await?
        {
            return Ok(ranges);
        }

        self.plan_local(presence, start, end)
    }

    /// Split `[start, end)` into maximal runs of cached and missing blocks,
    /// in file order, with no gaps or overlaps.
    pub fn plan_local(
        &self,
        presence: &dyn BlockPresence,
        start: u64,
        end: u64,
    ) -> Result<Vec<PlannedRange>, BlobCacheError> {
        let (start, end) = resolve_bounds(presence, start, end)?;
        let mut ranges = Vec::new();
        if start == end {
            return Ok(ranges);
        }

        let block_size = presence.block_size();
        let mut run_start = start;
        let mut run_present = presence.has_block(start / block_size);
        let mut block = start / block_size + 1;

        while block * block_size < end {
            let present = presence.has_block(block);
            if present != run_present {
                let boundary = block * block_size;
                self.close_run(&mut ranges, run_start, boundary, block_size, run_present);
                run_start = boundary;
                run_present = present;
            }
            block += 1;
        }
        self.close_run(&mut ranges, run_start, end, block_size, run_present);

        debug!(
            start,
            end,
            cached = ranges.iter().filter(|r| r.is_cached()).count(),
            remote = ranges.iter().filter(|r| !r.is_cached()).count(),
            "Planned range"
        );
        Ok(ranges)
    }

    /// One remote range, or consecutive chunks of at most
    /// `max_remote_range_size` bytes when a maximum is set.
    ///
    /// Chunk boundaries fall on the `block_size` grid. The first chunk ends
    /// early when `start` is unaligned and the last one takes the remainder.
    pub fn split_remote(
        &self,
        start: u64,
        end: u64,
        block_size: u64,
        source: RemoteSource,
    ) -> Vec<PlannedRange> {
        if start >= end {
            return Vec::new();
        }
        let chunk = aligned_chunk(self.max_remote_range_size, block_size);
        if chunk == 0 || end - start <= chunk {
            return vec![PlannedRange {
                start,
                end,
                kind: RangeKind::Remote(source),
            }];
        }

        let grid = block_size.max(1);
        let mut ranges = Vec::with_capacity((end - start).div_ceil(chunk) as usize + 1);
        let mut cursor = start;
        while cursor < end {
            let next = (cursor.saturating_add(chunk) / grid * grid).min(end);
            ranges.push(PlannedRange {
                start: cursor,
                end: next,
                kind: RangeKind::Remote(source.clone()),
            });
            cursor = next;
        }
        ranges
    }

    fn close_run(
        &self,
        ranges: &mut Vec<PlannedRange>,
        start: u64,
        end: u64,
        block_size: u64,
        present: bool,
    ) {
        if present {
            ranges.push(PlannedRange {
                start,
                end,
                kind: RangeKind::Cached,
            });
        } else {
            ranges.extend(self.split_remote(start, end, block_size, RemoteSource::Origin));
        }
    }

    /// `Ok(None)` means routing declined or failed and local planning applies.
    async fn plan_with_peer(
        &self,
        router: &dyn PeerRouter,
        presence: &dyn BlockPresence,
        identity: &FileIdentity,
        start: u64,
        end: u64,
    ) -> Result<Option<Vec<PlannedRange>>, BlobCacheError> {
        let analysis = self.analyze_position(presence, start, end)?;
        let Some(first_missing) = analysis.first_missing else {
            return Ok(None);
        };
        let cursor = first_missing.max(start);

        let query = RouteQuery {
            repo_type: identity.repo_type,
            org: identity.org.clone(),
            repo: identity.repo.clone(),
            file_name: identity.file_name.clone(),
            etag: identity.etag.clone(),
            start: cursor,
            end,
            file_size: presence.file_size(),
        };

        let route = match tokio::time::timeout(self.routing_timeout, router.route(&query)).await {
            Ok(Ok(Some(route))) if route.max_offset > cursor => route,
            Ok(Ok(_)) => {
                debug!(start = cursor, end, "No peer accepted the range");
                return Ok(None);
            }
            Ok(Err(e)) => {
                warn!(start = cursor, end, error = %e, "Peer routing failed, using origin");
                return Ok(None);
            }
            Err(_) => {
                warn!(
                    start = cursor,
                    end,
                    timeout_ms = self.routing_timeout.as_millis() as u64,
                    "Peer routing timed out, using origin"
                );
                return Ok(None);
            }
        };

        let peer_end = route.max_offset.min(end);
        let mut ranges = Vec::new();
        if cursor > start {
            ranges.push(PlannedRange {
                start,
                end: cursor,
                kind: RangeKind::Cached,
            });
        }
        let block_size = presence.block_size();
        ranges.extend(self.split_remote(
            cursor,
            peer_end,
            block_size,
            RemoteSource::Peer {
                addr: route.addr.clone(),
            },
        ));
        ranges.extend(self.split_remote(
            peer_end,
            end,
            block_size,
            RemoteSource::FallbackOrigin,
        ));

        debug!(
            start,
            end,
            peer = %route.addr,
            peer_end,
            ranges = ranges.len(),
            "Planned range through peer"
        );
        Ok(Some(ranges))
    }
}

/// Largest multiple of `block_size` not above `max`, and at least one block.
fn aligned_chunk(max: u64, block_size: u64) -> u64 {
    if max == 0 || block_size == 0 {
        return max;
    }
    (max / block_size * block_size).max(block_size)
}

/// Map the `(0, 0)` sentinel to the whole file and validate the rest.
fn resolve_bounds(
    presence: &dyn BlockPresence,
    start: u64,
    end: u64,
) -> Result<(u64, u64), BlobCacheError> {
    if start == 0 && end == 0 {
        return Ok((0, presence.file_size()));
    }
    validate_range(presence, start, end)?;
    Ok((start, end))
}

fn validate_range(presence: &dyn BlockPresence, start: u64, end: u64) -> Result<(), BlobCacheError> {
    let file_size = presence.file_size();
    if start >= end || end > file_size || presence.block_size() == 0 {
        return Err(BlobCacheError::InvalidRange {
            start,
            end,
            file_size,
        });
    }
    Ok(())
}
