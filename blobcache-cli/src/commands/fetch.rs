use std::sync::Arc;
use std::time::{Duration, Instant};

use blobcache_engine::{
    AcceleratorConfig, BlobAccelerator, CacheFileRegistry, FetchRequest, FileIdentity, RepoType,
    TracingProgressReporter,
};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::FetchArgs;
use crate::error::AppError;
use crate::utils::{format_bytes, parse_headers, parse_range, parse_size};

fn build_config(args: &FetchArgs) -> Result<AcceleratorConfig, AppError> {
    let mut builder = AcceleratorConfig::builder()
        .with_endpoint(&args.endpoint)
        .with_block_size(parse_size(&args.block_size)?)
        .with_max_remote_range_size(parse_size(&args.max_range)?)
        .with_max_concurrency_per_file(args.concurrency)
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_read_timeout(Duration::from_secs(args.read_timeout))
        .with_headers(parse_headers(&args.headers));
    if let Some(dir) = &args.cache_dir {
        builder = builder.with_cache_dir(dir);
    }
    let config = builder.build();
    config.validate()?;
    Ok(config)
}

pub async fn run_fetch(args: FetchArgs) -> Result<(), AppError> {
    let repo_type: RepoType = args
        .repo_type
        .parse()
        .map_err(|e: blobcache_engine::BlobCacheError| AppError::InvalidInput(e.to_string()))?;
    let mut identity = FileIdentity::from_repo_id(repo_type, &args.repo, &args.file)
        .map_err(|e| AppError::InvalidInput(e.to_string()))?
        .with_commit(&args.revision);
    if let Some(token) = &args.token {
        identity = identity.with_auth(token);
    }

    let config = build_config(&args)?;
    info!(
        "Cache: dir={}, block={}, max range={}, concurrency={}",
        config.cache_dir.display(),
        format_bytes(config.block_size),
        if config.max_remote_range_size == 0 {
            "unlimited".to_string()
        } else {
            format_bytes(config.max_remote_range_size)
        },
        config.max_concurrency_per_file
    );

    let registry = CacheFileRegistry::new((&config).into());
    let accelerator =
        BlobAccelerator::new(config, registry, None, Arc::new(TracingProgressReporter))?;

    let file_size = match &args.size {
        Some(size) => {
            if let Some(etag) = &args.etag {
                identity = identity.with_etag(etag);
            }
            parse_size(size)?
        }
        None => {
            let metadata = accelerator.fetcher().probe(&identity).await?;
            if let Some(etag) = args.etag.clone().or(metadata.etag) {
                identity = identity.with_etag(etag);
            }
            metadata.file_size
        }
    };
    if identity.etag.is_empty() {
        warn!("No content tag known, cache entries are keyed by revision");
    }

    let mut request = FetchRequest::new(identity, file_size);
    if let Some(range) = &args.range {
        let (start, end) = parse_range(range)?;
        request = request.with_range(start, end);
    }
    let (start, end) = request.bounds()?;
    info!(
        "Fetching {} [{start}, {end}) of {} ({})",
        request.identity,
        format_bytes(file_size),
        format_bytes(end - start)
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let mut writer: Box<dyn AsyncWrite + Unpin + Send> = match &args.output {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };

    let started = Instant::now();
    let mut stream = accelerator.fetch(request, cancel.clone()).await?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.flush().await?;

    if cancel.is_cancelled() {
        return Err(blobcache_engine::BlobCacheError::Cancelled.into());
    }
    if written != end - start {
        return Err(AppError::InvalidInput(format!(
            "stream ended after {written} of {} bytes",
            end - start
        )));
    }

    let elapsed = started.elapsed();
    let rate = written as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        "Done: {} in {:.2}s ({}/s)",
        format_bytes(written),
        elapsed.as_secs_f64(),
        format_bytes(rate as u64)
    );
    Ok(())
}
