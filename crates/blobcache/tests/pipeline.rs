use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use blobcache_engine::{
    AcceleratorConfig, BlobAccelerator, BlobCacheError, BlockCacheFile, ByteStream, CacheFileOptions,
    CacheFileRegistry, CacheTask, ChannelProgressReporter, FetchRequest, FileIdentity,
    INTERNAL_REQUEST_HEADER, PeerRoute, PeerRouter, ProgressReporter, RangeStatus,
    RemoteRangeFetcher, RepoType, RouteQuery, Task, TaskContext, TracingProgressReporter,
};
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use std::io::Write;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const BLOCK: u64 = 1024;
const SIZE: usize = 10_000;

fn test_client() -> reqwest::Client {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    reqwest::Client::builder().build().unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
struct Seen {
    method: Method,
    path: String,
    range: Option<(u64, u64)>,
    internal: bool,
    auth: Option<String>,
}

struct BlobServer {
    data: Bytes,
    gzip: bool,
    status: Option<StatusCode>,
    /// Send this many body bytes, then hold the connection open
    stall_after: Option<usize>,
    /// Drop this many bytes from the end of every ranged body
    truncate: usize,
    /// Ignore the range end and send through to the end of the file
    overlong: bool,
    seen: Mutex<Vec<Seen>>,
}

impl BlobServer {
    fn new(data: Bytes) -> Self {
        Self {
            data,
            gzip: false,
            status: None,
            stall_after: None,
            truncate: 0,
            overlong: false,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn gets(&self) -> Vec<Seen> {
        self.seen
            .lock()
            .iter()
            .filter(|s| s.method == Method::GET)
            .cloned()
            .collect()
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn serve(
    State(server): State<Arc<BlobServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);
    server.seen.lock().push(Seen {
        method: method.clone(),
        path: uri.path().to_owned(),
        range,
        internal: headers.contains_key(INTERNAL_REQUEST_HEADER),
        auth: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
    });

    if let Some(status) = server.status {
        return status.into_response();
    }

    let total = server.data.len() as u64;
    if method == Method::HEAD {
        let mut response = StatusCode::OK.into_response();
        response
            .headers_mut()
            .insert("x-linked-size", HeaderValue::from(total));
        response
            .headers_mut()
            .insert("x-linked-etag", HeaderValue::from_static("\"blob-etag\""));
        return response;
    }

    let (status, mut body) = match range {
        Some((start, end)) if start < total => {
            let end = if server.overlong {
                total - 1
            } else {
                end.min(total - 1)
            };
            (
                StatusCode::PARTIAL_CONTENT,
                server.data.slice(start as usize..=end as usize),
            )
        }
        _ => (StatusCode::OK, server.data.clone()),
    };
    body.truncate(body.len().saturating_sub(server.truncate));

    if let Some(sent) = server.stall_after {
        let head = body.slice(..sent.min(body.len()));
        let stalled = stream::once(async move { Ok::<_, Infallible>(head) })
            .chain(stream::pending::<Result<Bytes, Infallible>>());
        return (status, Body::from_stream(stalled)).into_response();
    }

    if server.gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&body).unwrap();
        let encoded = encoder.finish().unwrap();
        return (
            status,
            [(header::CONTENT_ENCODING, "gzip")],
            Bytes::from(encoded),
        )
            .into_response();
    }
    (status, body).into_response()
}

async fn spawn_server(server: Arc<BlobServer>) -> String {
    let app = Router::new().fallback(serve).with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn blob() -> Bytes {
    Bytes::from((0..SIZE).map(|i| (i % 251) as u8).collect::<Vec<_>>())
}

fn identity() -> FileIdentity {
    FileIdentity::new(RepoType::Model, "acme", "llm", "weights/model.bin")
        .with_commit("c0ffee")
        .with_etag("blob-etag")
}

struct Harness {
    _dir: TempDir,
    accelerator: BlobAccelerator,
}

fn harness(
    endpoint: &str,
    max_range: u64,
    router: Option<Arc<dyn PeerRouter>>,
    progress: Arc<dyn ProgressReporter>,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = AcceleratorConfig::builder()
        .with_cache_dir(dir.path())
        .with_endpoint(endpoint)
        .with_block_size(BLOCK)
        .with_bitmask_capacity(64)
        .with_max_remote_range_size(max_range)
        .with_max_concurrency_per_file(3)
        .with_cluster_enabled(router.is_some())
        .with_routing_timeout(Duration::from_secs(1))
        .build();
    let registry = CacheFileRegistry::new((&config).into());
    let accelerator =
        BlobAccelerator::with_client(config, test_client(), registry, router, progress)
            .unwrap();
    Harness {
        _dir: dir,
        accelerator,
    }
}

fn cache_options() -> CacheFileOptions {
    CacheFileOptions {
        block_size: BLOCK,
        bitmask_capacity: 64,
        ..Default::default()
    }
}

fn cache_path(h: &Harness) -> std::path::PathBuf {
    identity()
        .cache_path(&h.accelerator.config().cache_dir)
        .unwrap()
}

async fn read_all(mut stream: ByteStream) -> Result<Vec<u8>, BlobCacheError> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

async fn fetch(h: &Harness, start: u64, end: u64) -> Result<Vec<u8>, BlobCacheError> {
    let request = FetchRequest::new(identity(), SIZE as u64).with_range(start, end);
    let stream = h.accelerator.fetch(request, CancellationToken::new()).await?;
    read_all(stream).await
}

#[tokio::test]
async fn test_cold_then_warm_fetch() {
    init_tracing();
    let server = Arc::new(BlobServer::new(blob()));
    let endpoint = spawn_server(server.clone()).await;
    let h = harness(&endpoint, 0, None, Arc::new(TracingProgressReporter));

    let cold = fetch(&h, 0, 0).await.unwrap();
    assert_eq!(cold, blob());
    let gets = server.gets();
    assert_eq!(gets.len(), 1);
    assert_eq!(gets[0].path, "/acme/llm/resolve/c0ffee/weights/model.bin");
    assert_eq!(gets[0].range, Some((0, SIZE as u64 - 1)));

    let warm = fetch(&h, 0, 0).await.unwrap();
    assert_eq!(warm, blob());
    assert_eq!(server.gets().len(), 1, "warm fetch is served from cache");

    let registry = h.accelerator.registry();
    assert_eq!(registry.stats().open_entries, 0);
    assert_eq!(registry.stats().closed_total, 2);
}

#[tokio::test]
async fn test_partial_cache_fetches_only_missing_tail() {
    init_tracing();
    let server = Arc::new(BlobServer::new(blob()));
    let endpoint = spawn_server(server.clone()).await;
    let h = harness(&endpoint, 0, None, Arc::new(TracingProgressReporter));

    let head = fetch(&h, 0, 3 * BLOCK).await.unwrap();
    assert_eq!(head, blob()[..3 * BLOCK as usize]);

    let tail = fetch(&h, 500, SIZE as u64).await.unwrap();
    assert_eq!(tail, blob()[500..]);

    let gets = server.gets();
    assert_eq!(gets.len(), 2);
    assert_eq!(gets[1].range, Some((3 * BLOCK, SIZE as u64 - 1)));
}

#[tokio::test]
async fn test_chunked_remote_ranges_stay_ordered() {
    init_tracing();
    let server = Arc::new(BlobServer::new(blob()));
    let endpoint = spawn_server(server.clone()).await;
    let (progress, mut reports) = ChannelProgressReporter::new(64);
    let h = harness(&endpoint, 2 * BLOCK, None, Arc::new(progress));

    let bytes = fetch(&h, 100, 9_900).await.unwrap();
    assert_eq!(bytes, blob()[100..9_900]);

    let mut ranges: Vec<_> = server.gets().iter().filter_map(|s| s.range).collect();
    ranges.sort();
    assert_eq!(
        ranges,
        vec![(100, 2047), (2048, 4095), (4096, 6143), (6144, 8191), (8192, 9899)]
    );

    let mut completed = 0;
    while let Ok(report) = reports.try_recv() {
        assert_eq!(report.status, RangeStatus::Completed);
        assert_eq!(report.source, "origin");
        completed += 1;
    }
    assert_eq!(completed, 5);
}

#[tokio::test]
async fn test_repeated_chunked_fetch_refetches_only_edge_blocks() {
    init_tracing();
    let server = Arc::new(BlobServer::new(blob()));
    let endpoint = spawn_server(server.clone()).await;
    let h = harness(&endpoint, 2 * BLOCK, None, Arc::new(TracingProgressReporter));

    assert_eq!(fetch(&h, 100, 9_900).await.unwrap(), blob()[100..9_900]);
    let cold = server.gets().len();
    assert_eq!(cold, 5);

    // Only the partially covered first and last blocks go back to the origin.
    assert_eq!(fetch(&h, 100, 9_900).await.unwrap(), blob()[100..9_900]);
    let mut ranges: Vec<_> = server.gets()[cold..]
        .iter()
        .filter_map(|s| s.range)
        .collect();
    ranges.sort();
    assert_eq!(ranges, vec![(100, BLOCK - 1), (9 * BLOCK, 9_899)]);

    let stats = BlockCacheFile::inspect(cache_path(&h)).unwrap();
    assert_eq!(stats.present_blocks, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_cache_file() {
    init_tracing();
    let server = Arc::new(BlobServer::new(blob()));
    let endpoint = spawn_server(server.clone()).await;
    let h = Arc::new(harness(&endpoint, 0, None, Arc::new(TracingProgressReporter)));

    let ranges = [(0u64, 4_000u64), (1_000, 7_000), (3_000, 10_000), (0, 0)];
    let handles: Vec<_> = ranges
        .iter()
        .map(|&(start, end)| {
            let h = h.clone();
            tokio::spawn(async move { (start, end, fetch(&h, start, end).await) })
        })
        .collect();

    for handle in handles {
        let (start, end, result) = handle.await.unwrap();
        let end = if end == 0 { SIZE as u64 } else { end };
        assert_eq!(result.unwrap(), blob()[start as usize..end as usize]);
    }

    let stats = h.accelerator.registry().stats();
    assert_eq!(stats.open_entries, 0);

    let before = server.gets().len();
    assert_eq!(fetch(&h, 0, 0).await.unwrap(), blob());
    assert_eq!(server.gets().len(), before, "every block was persisted");
}

#[tokio::test]
async fn test_origin_error_ends_stream_with_error() {
    init_tracing();
    let server = Arc::new(BlobServer {
        status: Some(StatusCode::NOT_FOUND),
        ..BlobServer::new(blob())
    });
    let endpoint = spawn_server(server.clone()).await;
    let h = harness(&endpoint, 0, None, Arc::new(TracingProgressReporter));

    let request = FetchRequest::new(identity(), SIZE as u64);
    let mut stream = h.accelerator.fetch(request, CancellationToken::new()).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.is_empty(), "stream is primed before any remote byte");
    match stream.next().await {
        Some(Err(BlobCacheError::StatusCode(status))) => assert_eq!(status, StatusCode::NOT_FOUND),
        other => panic!("expected status error, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_cancel_mid_fetch_keeps_only_whole_blocks() {
    init_tracing();
    let sent = 2 * BLOCK as usize + 512;
    let server = Arc::new(BlobServer {
        stall_after: Some(sent),
        ..BlobServer::new(blob())
    });
    let endpoint = spawn_server(server.clone()).await;
    let h = harness(&endpoint, 0, None, Arc::new(TracingProgressReporter));

    let cancel = CancellationToken::new();
    let request = FetchRequest::new(identity(), SIZE as u64);
    let mut stream = h.accelerator.fetch(request, cancel.clone()).await.unwrap();

    let mut received = Vec::new();
    while received.len() < sent {
        let chunk = stream.next().await.unwrap().unwrap();
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, blob()[..sent]);

    cancel.cancel();
    let rest = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(item) = stream.next().await {
            assert!(matches!(item, Ok(_) | Err(BlobCacheError::Cancelled)));
        }
    })
    .await;
    assert!(rest.is_ok(), "stream ends after cancellation");
    assert_eq!(h.accelerator.registry().stats().open_entries, 0);

    let stats = BlockCacheFile::inspect(cache_path(&h)).unwrap();
    assert_eq!(stats.present_blocks, 2);
    let file = BlockCacheFile::open(cache_path(&h), &cache_options()).unwrap();
    assert!(file.has_block(0));
    assert!(file.has_block(1));
    assert!(!file.has_block(2), "incomplete block is never written");
}

#[tokio::test]
async fn test_short_body_ends_stream_without_error() {
    init_tracing();
    let server = Arc::new(BlobServer {
        truncate: 300,
        ..BlobServer::new(blob())
    });
    let endpoint = spawn_server(server.clone()).await;
    let h = harness(&endpoint, 0, None, Arc::new(TracingProgressReporter));

    let bytes = fetch(&h, 0, 4 * BLOCK).await.unwrap();
    assert_eq!(bytes, blob()[..4 * BLOCK as usize - 300]);

    // The three whole blocks that did arrive were kept.
    assert_eq!(fetch(&h, 0, 3 * BLOCK).await.unwrap(), blob()[..3 * BLOCK as usize]);
    assert_eq!(server.gets().len(), 1);
    assert_eq!(BlockCacheFile::inspect(cache_path(&h)).unwrap().present_blocks, 3);
}

#[tokio::test]
async fn test_overlong_body_is_cut_at_range_end() {
    init_tracing();
    let server = Arc::new(BlobServer {
        overlong: true,
        ..BlobServer::new(blob())
    });
    let endpoint = spawn_server(server.clone()).await;
    let h = harness(&endpoint, 0, None, Arc::new(TracingProgressReporter));

    let bytes = fetch(&h, 0, 2 * BLOCK).await.unwrap();
    assert_eq!(bytes, blob()[..2 * BLOCK as usize]);
    assert_eq!(BlockCacheFile::inspect(cache_path(&h)).unwrap().present_blocks, 2);

    assert_eq!(fetch(&h, 0, 2 * BLOCK).await.unwrap(), blob()[..2 * BLOCK as usize]);
    assert_eq!(server.gets().len(), 1);

    let next = fetch(&h, 2 * BLOCK, 3 * BLOCK).await.unwrap();
    assert_eq!(next, blob()[2 * BLOCK as usize..3 * BLOCK as usize]);
    assert_eq!(server.gets().len(), 2, "bytes past the range are not cached");
}

#[tokio::test]
async fn test_unreadable_cache_file_is_served_uncached() {
    init_tracing();
    let server = Arc::new(BlobServer::new(blob()));
    let endpoint = spawn_server(server.clone()).await;
    let h = harness(&endpoint, 0, None, Arc::new(TracingProgressReporter));
    let path = cache_path(&h);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();

    let newer_version = {
        let file = BlockCacheFile::open(&path, &cache_options()).unwrap();
        file.resize(SIZE as u64).unwrap();
        file.close().unwrap();
        let mut raw = std::fs::read(&path).unwrap();
        raw[4..12].copy_from_slice(&2u64.to_le_bytes());
        raw
    };
    let junk = vec![0x5au8; 4096];

    for contents in [junk, newer_version] {
        std::fs::write(&path, &contents).unwrap();
        let before = server.gets().len();

        assert_eq!(fetch(&h, 0, 2 * BLOCK).await.unwrap(), blob()[..2 * BLOCK as usize]);
        assert_eq!(fetch(&h, 0, 2 * BLOCK).await.unwrap(), blob()[..2 * BLOCK as usize]);

        assert_eq!(server.gets().len(), before + 2, "nothing was cached");
        assert_eq!(std::fs::read(&path).unwrap(), contents);
        assert_eq!(h.accelerator.registry().stats().open_entries, 0);
    }
}

fn task_context(endpoint: &str, cache: Arc<BlockCacheFile>) -> Arc<TaskContext> {
    Arc::new(TaskContext {
        fetcher: Arc::new(RemoteRangeFetcher::new(test_client(), endpoint)),
        identity: identity(),
        file_size: SIZE as u64,
        cache: Some(cache),
        progress: Arc::new(TracingProgressReporter),
    })
}

fn cache_with_head(dir: &TempDir, blocks: u64) -> Arc<BlockCacheFile> {
    let file = BlockCacheFile::open(dir.path().join("head.blk"), &cache_options()).unwrap();
    file.resize(SIZE as u64).unwrap();
    let data = blob();
    for index in 0..blocks {
        let start = (index * BLOCK) as usize;
        file.write_block(index, &data[start..start + BLOCK as usize])
            .unwrap();
    }
    Arc::new(file)
}

async fn run_task(task: &dyn Task) -> (RangeStatus, Vec<u8>) {
    let cancel = CancellationToken::new();
    let status = task.execute(&cancel).await;
    let (tx, mut rx) = mpsc::channel(1024);
    task.emit(&tx, &cancel).await.unwrap();
    drop(tx);
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    (status, out)
}

#[tokio::test]
async fn test_cache_task_fetches_absent_block() {
    init_tracing();
    let server = Arc::new(BlobServer::new(blob()));
    let endpoint = spawn_server(server.clone()).await;
    let dir = TempDir::new().unwrap();
    let cache = cache_with_head(&dir, 1);

    let task = CacheTask::new(0, 2 * BLOCK, task_context(&endpoint, cache.clone()));
    let (status, bytes) = run_task(&task).await;

    assert_eq!(status, RangeStatus::Completed);
    assert_eq!(bytes, blob()[..2 * BLOCK as usize]);
    let ranges: Vec<_> = server.gets().iter().filter_map(|s| s.range).collect();
    assert_eq!(ranges, vec![(BLOCK, 2 * BLOCK - 1)]);
    assert!(cache.has_block(1), "fetched block is persisted");
}

#[tokio::test]
async fn test_cache_task_fetches_directly_when_cache_read_fails() {
    init_tracing();
    let server = Arc::new(BlobServer::new(blob()));
    let endpoint = spawn_server(server.clone()).await;
    let dir = TempDir::new().unwrap();
    let cache = cache_with_head(&dir, 2);
    cache.close().unwrap();

    let task = CacheTask::new(0, 2 * BLOCK, task_context(&endpoint, cache));
    let (status, bytes) = run_task(&task).await;

    assert_eq!(status, RangeStatus::Completed);
    assert_eq!(bytes, blob()[..2 * BLOCK as usize]);
    let ranges: Vec<_> = server.gets().iter().filter_map(|s| s.range).collect();
    assert_eq!(ranges, vec![(0, 2 * BLOCK - 1)]);
}

#[tokio::test]
async fn test_gzip_encoded_body_is_decoded_and_cached() {
    init_tracing();
    let server = Arc::new(BlobServer {
        gzip: true,
        ..BlobServer::new(blob())
    });
    let endpoint = spawn_server(server.clone()).await;
    let h = harness(&endpoint, 0, None, Arc::new(TracingProgressReporter));

    assert_eq!(fetch(&h, 0, 4 * BLOCK).await.unwrap(), blob()[..4 * BLOCK as usize]);
    assert_eq!(fetch(&h, 10, 4 * BLOCK).await.unwrap(), blob()[10..4 * BLOCK as usize]);
    assert_eq!(server.gets().len(), 1);
}

#[tokio::test]
async fn test_auth_token_is_forwarded() {
    init_tracing();
    let server = Arc::new(BlobServer::new(blob()));
    let endpoint = spawn_server(server.clone()).await;
    let h = harness(&endpoint, 0, None, Arc::new(TracingProgressReporter));

    let request = FetchRequest::new(identity().with_auth("hf_token"), SIZE as u64)
        .with_range(0, BLOCK);
    let stream = h.accelerator.fetch(request, CancellationToken::new()).await.unwrap();
    read_all(stream).await.unwrap();

    assert_eq!(server.gets()[0].auth.as_deref(), Some("Bearer hf_token"));
}

#[tokio::test]
async fn test_probe_reads_linked_headers() {
    init_tracing();
    let server = Arc::new(BlobServer::new(blob()));
    let endpoint = spawn_server(server).await;
    let fetcher = RemoteRangeFetcher::new(test_client(), endpoint);

    assert_eq!(fetcher.probe_size(&identity()).await.unwrap(), SIZE as u64);
    let metadata = fetcher.probe(&identity()).await.unwrap();
    assert_eq!(metadata.etag.as_deref(), Some("blob-etag"));
}

struct StaticRouter {
    addr: String,
    max_offset: u64,
}

#[async_trait]
impl PeerRouter for StaticRouter {
    async fn route(&self, query: &RouteQuery) -> Result<Option<PeerRoute>, BlobCacheError> {
        assert_eq!(query.etag, "blob-etag");
        assert_eq!(query.file_size, SIZE as u64);
        Ok(Some(PeerRoute {
            addr: self.addr.clone(),
            max_offset: self.max_offset,
        }))
    }
}

#[tokio::test]
async fn test_peer_serves_head_and_origin_serves_tail() {
    init_tracing();
    let origin = Arc::new(BlobServer::new(blob()));
    let peer = Arc::new(BlobServer::new(blob()));
    let origin_url = spawn_server(origin.clone()).await;
    let peer_url = spawn_server(peer.clone()).await;

    let router = Arc::new(StaticRouter {
        addr: peer_url,
        max_offset: 6 * BLOCK,
    });
    let h = harness(&origin_url, 0, Some(router), Arc::new(TracingProgressReporter));

    assert_eq!(fetch(&h, 0, 0).await.unwrap(), blob());

    let peer_gets = peer.gets();
    assert_eq!(peer_gets.len(), 1);
    assert!(peer_gets[0].internal);
    assert_eq!(peer_gets[0].range, Some((0, 6 * BLOCK - 1)));

    let origin_gets = origin.gets();
    assert_eq!(origin_gets.len(), 1);
    assert!(!origin_gets[0].internal);
    assert_eq!(origin_gets[0].range, Some((6 * BLOCK, SIZE as u64 - 1)));

    // Internal requests are planned locally and never routed.
    let request = FetchRequest::new(identity(), SIZE as u64).with_internal(true);
    let stream = h.accelerator.fetch(request, CancellationToken::new()).await.unwrap();
    assert_eq!(read_all(stream).await.unwrap(), blob());
    assert_eq!(peer.gets().len(), 1);
    assert_eq!(origin.gets().len(), 1);
}

#[tokio::test]
async fn test_invalid_range_is_rejected_up_front() {
    init_tracing();
    let h = harness("http://127.0.0.1:9", 0, None, Arc::new(TracingProgressReporter));
    let request = FetchRequest::new(identity(), SIZE as u64).with_range(10, SIZE as u64 + 1);
    assert!(matches!(
        h.accelerator.fetch(request, CancellationToken::new()).await,
        Err(BlobCacheError::InvalidRange { .. })
    ));
}

#[tokio::test]
async fn test_identity_outside_cache_root_is_rejected() {
    init_tracing();
    let h = harness("http://127.0.0.1:9", 0, None, Arc::new(TracingProgressReporter));
    let escaping = FileIdentity::new(RepoType::Model, "../..", "llm", "model.bin");
    let request = FetchRequest::new(escaping, SIZE as u64);
    assert!(matches!(
        h.accelerator.fetch(request, CancellationToken::new()).await,
        Err(BlobCacheError::ConfigError(_))
    ));
    assert_eq!(h.accelerator.registry().stats().open_entries, 0);
}
