//! Command-line arguments for the demo binary

use clap::Parser;
use std::path::PathBuf;

/// Run a write / flush / cold-read cycle against an in-process canister
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "canistore - local asset cache with chunked canister commits")]
pub struct Args {
    /// TOML config file; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of transfer workers (0 = auto)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Number of assets to write
    #[arg(short = 'n', long, default_value_t = 8)]
    pub assets: usize,

    /// Size of each asset in bytes
    #[arg(short = 's', long, default_value_t = 4 * 1024 * 1024)]
    pub asset_size: usize,

    /// Simulated remote round-trip latency in ms
    #[arg(long, default_value_t = 0)]
    pub latency_ms: u64,

    /// Per-chunk RPC deadline in ms (0 = none)
    #[arg(long)]
    pub rpc_timeout_ms: Option<u64>,

    /// Commit journal (JSONL)
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Text event log
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Print every committed item
    #[arg(short, long)]
    pub verbose: bool,

    /// No progress bar
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides_parse() {
        let args = Args::parse_from(["canistore"]);
        assert_eq!(args.assets, 8);
        assert!(args.workers.is_none());

        let args = Args::parse_from(["canistore", "-w", "3", "--chunk-size", "1024", "-n", "2", "--latency-ms", "5"]);
        assert_eq!(args.workers, Some(3));
        assert_eq!(args.chunk_size, Some(1024));
        assert_eq!(args.assets, 2);
        assert_eq!(args.latency_ms, 5);
    }
}
