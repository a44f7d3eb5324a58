//! Mount configuration
//!
//! Values come from three layers: command-line flags, an optional TOML
//! file and built-in defaults, in that order of precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::cache::CacheConfig;
use common::fs::FsConfig;
use common::handle::{HandleConfig, RewindPolicy};
use common::provider::NodeId;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cli::Cli;

pub const DEFAULT_BASE_URL: &str = "https://ilias.studium.kit.edu/";
pub const DEFAULT_COOKIE_FILE: &str = "cookies.txt";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config file selects both a course and the personal desktop")]
    ConflictingRoot,
    #[error("invalid base url: {0}")]
    BaseUrl(#[from] url::ParseError),
    #[error("cannot determine the working directory: {0}")]
    WorkingDir(std::io::Error),
}

/// Contents of `config.toml`; every key is optional
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub cookie_file: Option<PathBuf>,
    pub course_id: Option<u64>,
    pub personal_desktop: Option<bool>,
    pub auto_unmount: Option<bool>,
    pub cache_ttl: Option<u64>,
    pub idle_evict: Option<u64>,
    pub request_timeout: Option<u64>,
    pub max_retries: Option<u32>,
    pub retain_mb: Option<usize>,
    pub rewind: Option<RewindPolicy>,
    pub max_concurrent_ops: Option<usize>,
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl FileConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ilias-fuse").join("config.toml"))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the file named on the command line, or the default one if present
    ///
    /// An explicitly named file must exist; the default one may not.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }
}

/// Fully resolved settings for one mount
#[derive(Debug, Clone)]
pub struct Config {
    pub mount_dir: PathBuf,
    pub root: NodeId,
    pub base_url: Url,
    pub cookie_file: PathBuf,
    pub background: bool,
    pub auto_unmount: bool,
    pub fs: FsConfig,
    pub log_level: String,
    pub log_dir: PathBuf,
}

impl Config {
    /// Read the config file and merge it with the command line
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file = FileConfig::discover(cli.config.as_deref())?;
        let cwd = std::env::current_dir().map_err(ConfigError::WorkingDir)?;
        Self::resolve(cli, file, &cwd)
    }

    /// Merge flags over file values over defaults
    ///
    /// Relative paths are anchored at `cwd` so the result stays valid after
    /// the process detaches.
    pub fn resolve(cli: &Cli, file: FileConfig, cwd: &Path) -> Result<Self, ConfigError> {
        let root = Self::root(cli, &file)?;

        let base_url = match (&cli.base_url, &file.base_url) {
            (Some(url), _) => url.clone(),
            (None, Some(raw)) => Url::parse(raw)?,
            (None, None) => Url::parse(DEFAULT_BASE_URL)?,
        };

        let cookie_file = cli
            .cookie_file
            .clone()
            .or(file.cookie_file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_COOKIE_FILE));

        let defaults = CacheConfig::default();
        let ttl = cli.cache_ttl.or(file.cache_ttl).unwrap_or(defaults.ttl.as_secs());
        let idle_evict = cli
            .idle_evict
            .or(file.idle_evict)
            .unwrap_or(defaults.idle_evict.as_secs());
        let request_timeout = Duration::from_secs(
            cli.request_timeout
                .or(file.request_timeout)
                .unwrap_or(defaults.request_timeout.as_secs())
                .max(1),
        );

        let mut cache = CacheConfig::from_basic(ttl, idle_evict);
        cache.request_timeout = request_timeout;
        if let Some(max_retries) = file.max_retries {
            cache.max_retries = max_retries;
        }

        let mut handles = HandleConfig {
            request_timeout,
            ..HandleConfig::default()
        };
        if let Some(retain_mb) = file.retain_mb {
            handles.retain_bytes = retain_mb.saturating_mul(1024 * 1024);
        }
        if let Some(rewind) = file.rewind {
            handles.rewind = rewind;
        }

        let mut fs = FsConfig {
            cache,
            handles,
            ..FsConfig::default()
        };
        if let Some(max_concurrent_ops) = file.max_concurrent_ops {
            fs.max_concurrent_ops = max_concurrent_ops.max(1);
        }

        let log_dir = cli
            .log_dir
            .clone()
            .or(file.log_dir)
            .unwrap_or_else(default_log_dir);

        Ok(Self {
            mount_dir: absolute(cwd, &cli.mount_dir),
            root,
            base_url: with_trailing_slash(base_url),
            cookie_file: absolute(cwd, &cookie_file),
            background: cli.background,
            auto_unmount: cli.auto_unmount || file.auto_unmount.unwrap_or(false),
            fs,
            log_level: cli
                .log_level
                .clone()
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_dir: absolute(cwd, &log_dir),
        })
    }

    fn root(cli: &Cli, file: &FileConfig) -> Result<NodeId, ConfigError> {
        if cli.personal_desktop {
            return Ok(NodeId::personal_desktop());
        }
        if let Some(course_id) = cli.course_id {
            return Ok(NodeId::course(course_id));
        }
        match (file.course_id, file.personal_desktop.unwrap_or(false)) {
            (Some(_), true) => Err(ConfigError::ConflictingRoot),
            (Some(course_id), false) => Ok(NodeId::course(course_id)),
            (None, _) => Ok(NodeId::personal_desktop()),
        }
    }
}

fn default_log_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("ilias-fuse").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

fn absolute(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Base URLs are kept in their directory form, ending in a slash
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
