use super::app_config::LogLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "pixcache",
    version,
    about = "A two-tier HTTP image cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Memory budget in bytes.
    #[arg(long, value_name = "BYTES", global = true)]
    pub memory_budget: Option<u64>,

    /// Disk budget in bytes.
    #[arg(long, value_name = "BYTES", global = true)]
    pub disk_budget: Option<u64>,

    /// Disk cache directory.
    #[arg(long, value_name = "PATH", env = "PIXCACHE_CACHE_DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Request timeout in seconds.
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Serve URLs from the cache, downloading and storing on a miss.
    Get {
        /// Image URLs.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Write the payload to this file (single URL only).
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Look a URL up without touching the network.
    Lookup {
        /// Image URL.
        url: String,
    },
    /// Remove a URL from both tiers.
    Invalidate {
        /// Image URL.
        url: String,
    },
    /// Remove expired entries from both tiers.
    Purge,
    /// Empty both tiers.
    Clear,
    /// Print cache statistics.
    Stats,
}
