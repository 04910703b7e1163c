use std::path::PathBuf;

use blobcache_engine::config::DEFAULT_ENDPOINT;
use clap::{Args, Parser, Subcommand};

/// Define CLI arguments
#[derive(Parser)]
#[command(
    version,
    about = "Block-cache accelerator for hub-hosted model and dataset files",
    long_about = "Fetches byte ranges of files hosted on a model hub, keeping every block\n\
                  it downloads in a local sparse cache file. Later requests for the same\n\
                  file content are served from disk and only missing blocks go upstream."
)]
pub struct CliArgs {
    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Fetch a file or byte range through the cache
    Fetch(FetchArgs),
    /// Print the header and fill state of a cache file
    Inspect(InspectArgs),
}

#[derive(Args)]
pub struct FetchArgs {
    /// Repository as ORG/REPO
    #[arg(long)]
    pub repo: String,

    /// Path of the file inside the repository
    #[arg(long)]
    pub file: String,

    #[arg(long, default_value = "model", help = "Repository type: model, dataset or space")]
    pub repo_type: String,

    #[arg(long, default_value = "main")]
    pub revision: String,

    /// Content tag; probed from the origin when omitted
    #[arg(long)]
    pub etag: Option<String>,

    /// Bearer token forwarded to the origin
    #[arg(long)]
    pub token: Option<String>,

    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    #[arg(
        short,
        long,
        help = "Half-open byte range START-END with optional units, e.g. \"0-8MB\". Whole file when omitted."
    )]
    pub range: Option<String>,

    /// Total file size; probed from the origin when omitted
    #[arg(long)]
    pub size: Option<String>,

    #[arg(long, help = "Cache root directory (default: <tmp>/blobcache)")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, default_value = "8MB", help = "Block size for newly created cache files")]
    pub block_size: String,

    #[arg(
        long,
        default_value = "0",
        help = "Largest single upstream request with optional unit, a multiple of the block size. Use 0 for unlimited."
    )]
    pub max_range: String,

    #[arg(short = 'c', long, default_value_t = 4, help = "Ranges fetched at once per request")]
    pub concurrency: usize,

    #[arg(long, default_value_t = 10, help = "Connection timeout in seconds")]
    pub connect_timeout: u64,

    #[arg(long, default_value_t = 60, help = "Read timeout in seconds")]
    pub read_timeout: u64,

    #[arg(
        short = 'H',
        long = "header",
        help = "Add custom HTTP header (can be used multiple times). Format: 'Name: Value'"
    )]
    pub headers: Vec<String>,

    /// Write the bytes here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Cache file to read
    pub path: PathBuf,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}
