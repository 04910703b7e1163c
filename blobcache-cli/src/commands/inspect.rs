use std::path::PathBuf;

use blobcache_engine::{BlockCacheFile, CacheFileStats};
use serde::Serialize;

use crate::cli::InspectArgs;
use crate::error::AppError;
use crate::utils::format_bytes;

#[derive(Debug, Serialize)]
struct InspectReport {
    path: PathBuf,
    #[serde(flatten)]
    stats: CacheFileStats,
    fill_rate: f64,
    complete: bool,
}

fn render(report: &InspectReport) -> String {
    let stats = &report.stats;
    format!(
        "{}\n  version:      {}\n  block size:   {}\n  file size:    {} ({} bytes)\n  blocks:       {}/{} present ({:.1}%)\n  capacity:     {} blocks",
        report.path.display(),
        stats.version,
        format_bytes(stats.block_size),
        format_bytes(stats.file_size),
        stats.file_size,
        stats.present_blocks,
        stats.block_count,
        report.fill_rate,
        stats.bitmask_capacity,
    )
}

pub fn run_inspect(args: InspectArgs) -> Result<(), AppError> {
    let stats = BlockCacheFile::inspect(&args.path)?;
    let report = InspectReport {
        path: args.path,
        fill_rate: stats.fill_rate(),
        complete: stats.is_complete(),
        stats,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", render(&report));
    }
    Ok(())
}
