//! # Remote Range Fetcher
//!
//! Streams one `[start, end)` range from the origin or a peer, forwards the
//! bytes as they arrive and persists every block that becomes whole into
//! the shared cache file.

use std::io::Read;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use flate2::read::{GzDecoder, ZlibDecoder};
use futures::StreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_LENGTH, ETAG, RANGE};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::BlobCacheError;
use crate::cache::{BlockCacheFile, WriteOutcome};
use crate::identity::FileIdentity;
use crate::planner::RemoteSource;

/// Marks a request as forwarded by another node, so it is never re-routed
pub const INTERNAL_REQUEST_HEADER: &str = "x-blobcache-internal";

const LINKED_SIZE_HEADER: &str = "x-linked-size";
const LINKED_ETAG_HEADER: &str = "x-linked-etag";

/// One remote range to fetch
#[derive(Debug, Clone, Copy)]
pub struct RemoteJob<'a> {
    pub identity: &'a FileIdentity,
    pub file_size: u64,
    pub start: u64,
    pub end: u64,
    pub source: &'a RemoteSource,
}

/// Size and content tag reported by the origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub file_size: u64,
    pub etag: Option<String>,
}

/// Regroups a stream of arbitrary chunks into whole cache blocks.
///
/// Bytes of a block whose beginning was not part of the stream are dropped,
/// as is a trailing block the stream ends in the middle of. The file's final
/// block is zero-padded to the block size.
#[derive(Debug)]
pub struct BlockAssembler {
    block_size: u64,
    file_size: u64,
    offset: u64,
    aligned: bool,
    buffer: BytesMut,
}

impl BlockAssembler {
    pub fn new(start: u64, block_size: u64, file_size: u64) -> Self {
        Self {
            block_size,
            file_size,
            offset: start,
            aligned: block_size > 0 && start % block_size == 0,
            buffer: BytesMut::new(),
        }
    }

    /// Feed the next chunk, returning every block it completed.
    pub fn push(&mut self, mut chunk: Bytes) -> Vec<(u64, Bytes)> {
        let mut completed = Vec::new();
        if self.block_size == 0 {
            return completed;
        }

        while !chunk.is_empty() && self.offset < self.file_size {
            let index = self.offset / self.block_size;
            let block_end = ((index + 1) * self.block_size).min(self.file_size);
            let take = ((block_end - self.offset) as usize).min(chunk.len());

            let part = chunk.split_to(take);
            if self.aligned {
                self.buffer.extend_from_slice(&part);
            }
            self.offset += take as u64;

            if self.offset == block_end {
                if self.aligned {
                    let mut block = self.buffer.split();
                    block.resize(self.block_size as usize, 0);
                    completed.push((index, block.freeze()));
                }
                self.buffer.clear();
                self.aligned = true;
            }
        }
        completed
    }

    /// Bytes of an incomplete block that will never be persisted.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

pub struct RemoteRangeFetcher {
    client: Client,
    endpoint: String,
}

impl RemoteRangeFetcher {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url_for(&self, job: &RemoteJob<'_>) -> Result<Url, BlobCacheError> {
        match job.source {
            RemoteSource::Peer { addr } => job.identity.resolve_url(addr),
            RemoteSource::Origin | RemoteSource::FallbackOrigin => {
                job.identity.resolve_url(&self.endpoint)
            }
        }
    }

    /// Fetch `job`, sending the body to `sink` in order and persisting whole
    /// blocks into `cache` when one is given. Returns the bytes delivered.
    #[instrument(skip_all, fields(start = job.start, end = job.end, source = job.source.label()))]
    pub async fn fetch(
        &self,
        job: &RemoteJob<'_>,
        cache: Option<&Arc<BlockCacheFile>>,
        sink: &mpsc::UnboundedSender<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<u64, BlobCacheError> {
        if cancel.is_cancelled() {
            return Err(BlobCacheError::Cancelled);
        }
        if job.start >= job.end || job.end > job.file_size {
            return Err(BlobCacheError::InvalidRange {
                start: job.start,
                end: job.end,
                file_size: job.file_size,
            });
        }

        let url = self.url_for(job)?;
        let mut request = self
            .client
            .get(url.clone())
            .header(RANGE, format!("bytes={}-{}", job.start, job.end - 1));
        if let Some(token) = &job.identity.auth {
            request = request.bearer_auth(token);
        }
        if matches!(job.source, RemoteSource::Peer { .. }) {
            request = request.header(INTERNAL_REQUEST_HEADER, "1");
        }

        debug!(url = %url, "Requesting remote range");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BlobCacheError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        let whole_file = job.start == 0 && job.end == job.file_size;
        if status != StatusCode::PARTIAL_CONTENT && !(status == StatusCode::OK && whole_file) {
            warn!(url = %url, %status, "Unexpected status for range request");
            return Err(BlobCacheError::StatusCode(status));
        }

        let content_length = response.content_length();
        let encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty() && v != "identity");

        let mut sink = RangeSink::new(job, cache, sink);
        let mut body = response.bytes_stream();

        let raw_received = match encoding {
            None => {
                let mut received = 0u64;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(BlobCacheError::Cancelled),
                        next = body.next() => next,
                    };
                    match next {
                        Some(Ok(chunk)) => {
                            received += chunk.len() as u64;
                            sink.accept(chunk).await?;
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    }
                }
                received
            }
            Some(encoding) => {
                let mut raw = BytesMut::new();
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(BlobCacheError::Cancelled),
                        next = body.next() => next,
                    };
                    match next {
                        Some(Ok(chunk)) => raw.extend_from_slice(&chunk),
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    }
                }
                let received = raw.len() as u64;
                let raw = raw.freeze();
                let decoded =
                    tokio::task::spawn_blocking(move || decode_body(&encoding, &raw)).await??;
                trace!(encoded = received, decoded = decoded.len(), "Decoded response body");
                sink.accept(decoded).await?;
                received
            }
        };

        let delivered = sink.delivered();
        let expected = job.end - job.start;
        if let Some(declared) = content_length
            && declared != raw_received
        {
            warn!(
                url = %url,
                declared,
                received = raw_received,
                "Response body length differs from Content-Length"
            );
        }
        if sink.seen() != expected {
            warn!(
                url = %url,
                expected,
                received = sink.seen(),
                "Remote range size mismatch"
            );
        }
        if sink.pending_len() > 0 {
            trace!(bytes = sink.pending_len(), "Dropped incomplete trailing block");
        }

        debug!(bytes = delivered, "Remote range finished");
        Ok(delivered)
    }

    /// Size of the remote file, from a HEAD request.
    pub async fn probe_size(&self, identity: &FileIdentity) -> Result<u64, BlobCacheError> {
        Ok(self.probe(identity).await?.file_size)
    }

    /// Size and content tag of the remote file, from a HEAD request.
    pub async fn probe(&self, identity: &FileIdentity) -> Result<RemoteMetadata, BlobCacheError> {
        let url = identity.resolve_url(&self.endpoint)?;
        let mut request = self.client.head(url.clone());
        if let Some(token) = &identity.auth {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BlobCacheError::StatusCode(response.status()));
        }

        let headers = response.headers();
        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let file_size = header_str(LINKED_SIZE_HEADER)
            .or_else(|| header_str(CONTENT_LENGTH.as_str()))
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                BlobCacheError::Internal(format!("{url} did not report a content length"))
            })?;
        let etag = header_str(LINKED_ETAG_HEADER)
            .or_else(|| header_str(ETAG.as_str()))
            .map(|v| v.trim_start_matches("W/").trim_matches('"').to_owned());

        debug!(url = %url, file_size, ?etag, "Probed remote file");
        Ok(RemoteMetadata { file_size, etag })
    }
}

/// Forwards a response body and persists the blocks it completes.
struct RangeSink<'a> {
    out: &'a mpsc::UnboundedSender<Bytes>,
    cache: Option<(Arc<BlockCacheFile>, BlockAssembler)>,
    remaining: u64,
    seen: u64,
    delivered: u64,
}

impl<'a> RangeSink<'a> {
    fn new(
        job: &RemoteJob<'_>,
        cache: Option<&Arc<BlockCacheFile>>,
        out: &'a mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        let cache = cache.map(|file| {
            let assembler = BlockAssembler::new(job.start, file.block_size(), job.file_size);
            (Arc::clone(file), assembler)
        });
        Self {
            out,
            cache,
            remaining: job.end - job.start,
            seen: 0,
            delivered: 0,
        }
    }

    async fn accept(&mut self, mut chunk: Bytes) -> Result<(), BlobCacheError> {
        self.seen += chunk.len() as u64;
        if chunk.len() as u64 > self.remaining {
            chunk.truncate(self.remaining as usize);
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.remaining -= chunk.len() as u64;
        self.delivered += chunk.len() as u64;

        self.out
            .send(chunk.clone())
            .map_err(|_| BlobCacheError::Cancelled)?;

        let Some((file, assembler)) = self.cache.as_mut() else {
            return Ok(());
        };
        let blocks = assembler.push(chunk);
        if blocks.is_empty() {
            return Ok(());
        }

        let file = Arc::clone(file);
        let result = tokio::task::spawn_blocking(move || persist_blocks(&file, blocks)).await?;
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist block, continuing without cache");
            self.cache = None;
        }
        Ok(())
    }

    fn seen(&self) -> u64 {
        self.seen
    }

    fn delivered(&self) -> u64 {
        self.delivered
    }

    fn pending_len(&self) -> usize {
        self.cache
            .as_ref()
            .map(|(_, assembler)| assembler.pending_len())
            .unwrap_or(0)
    }
}

fn persist_blocks(file: &BlockCacheFile, blocks: Vec<(u64, Bytes)>) -> Result<(), BlobCacheError> {
    for (index, block) in blocks {
        if file.has_block(index) {
            continue;
        }
        match file.write_block(index, &block)? {
            WriteOutcome::Written => trace!(block = index, "Persisted block"),
            WriteOutcome::AlreadyPresent => trace!(block = index, "Block persisted concurrently"),
        }
    }
    Ok(())
}

fn decode_body(encoding: &str, raw: &[u8]) -> Result<Bytes, BlobCacheError> {
    let mut decoded = Vec::with_capacity(raw.len() * 2);
    match encoding {
        "gzip" | "x-gzip" => {
            GzDecoder::new(raw).read_to_end(&mut decoded)?;
        }
        "deflate" => {
            ZlibDecoder::new(raw).read_to_end(&mut decoded)?;
        }
        other => return Err(BlobCacheError::UnsupportedEncoding(other.to_owned())),
    }
    Ok(Bytes::from(decoded))
}
