use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Mount ILIAS as a read-only filesystem
#[derive(Parser, Debug, Clone)]
#[command(name = "ilias-fuse", version, about)]
pub struct Cli {
    /// Directory to mount the filesystem at
    pub mount_dir: PathBuf,

    /// Mount a single course instead of the personal desktop
    #[arg(long, conflicts_with = "personal_desktop")]
    pub course_id: Option<u64>,

    /// Mount the personal desktop (the default)
    #[arg(long)]
    pub personal_desktop: bool,

    /// Base URL of the ILIAS gateway
    #[arg(long, env = "ILIAS_FUSE_BASE_URL")]
    pub base_url: Option<Url>,

    /// File holding the session cookie
    #[arg(long)]
    pub cookie_file: Option<PathBuf>,

    /// Detach from the terminal and log to a file
    #[arg(long)]
    pub background: bool,

    /// Ask the kernel to unmount when the process exits
    #[arg(long)]
    pub auto_unmount: bool,

    /// Seconds a directory listing stays valid
    #[arg(long)]
    pub cache_ttl: Option<u64>,

    /// Seconds after which untouched nodes are dropped from memory
    #[arg(long)]
    pub idle_evict: Option<u64>,

    /// Seconds before a single remote request is abandoned
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Config file (defaults to <config dir>/ilias-fuse/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for log files in background mode
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}
