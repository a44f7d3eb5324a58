//! Path-based read-only filesystem surface
//!
//! [`RemoteFs`] is what an OS binding talks to. It resolves paths through
//! the [`PathResolver`], reads through the [`FileHandleManager`] and folds
//! every component error into one [`FsError`] whose [`ErrorKind`] the
//! binding maps to its own error codes.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::cache::{CacheConfig, CacheError, CacheStats, NodeCache};
use crate::handle::{FileHandleManager, HandleConfig, HandleId, OpenError, ReadError};
use crate::node::{Node, NodeKind};
use crate::provider::{NodeId, ProviderError, RemoteTreeProvider};
use crate::resolver::{PathResolver, ResolveError};

/// Block size reported in attributes
pub const BLOCK_SIZE: u32 = 512;

#[derive(Debug, Clone)]
pub struct FsConfig {
    pub cache: CacheConfig,
    pub handles: HandleConfig,
    /// Filesystem requests served concurrently by a binding
    pub max_concurrent_ops: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            handles: HandleConfig::default(),
            max_concurrent_ops: 64,
        }
    }
}

/// Coarse error classes a binding maps to OS error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    NotADirectory,
    IsADirectory,
    UpstreamUnavailable,
    UnsupportedSeek,
    ReadOnly,
    NotSupported,
    BadHandle,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(ProviderError),
    #[error("cannot seek back to offset {offset}")]
    UnsupportedSeek { offset: u64 },
    #[error("read-only filesystem: {0} not permitted")]
    ReadOnly(&'static str),
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("bad file handle: {0}")]
    BadHandle(HandleId),
}

impl FsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotFound(_) => ErrorKind::NotFound,
            FsError::NotADirectory(_) => ErrorKind::NotADirectory,
            FsError::IsADirectory(_) => ErrorKind::IsADirectory,
            FsError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            FsError::UnsupportedSeek { .. } => ErrorKind::UnsupportedSeek,
            FsError::ReadOnly(_) => ErrorKind::ReadOnly,
            FsError::NotSupported(_) => ErrorKind::NotSupported,
            FsError::BadHandle(_) => ErrorKind::BadHandle,
        }
    }

    /// Retry hint from the provider, if it sent one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FsError::UpstreamUnavailable(source) => source.retry_after(),
            _ => None,
        }
    }
}

impl From<ResolveError> for FsError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound(path) => FsError::NotFound(path),
            ResolveError::NotADirectory(path) => FsError::NotADirectory(path),
            ResolveError::UpstreamUnavailable { source, .. } => FsError::UpstreamUnavailable(source),
        }
    }
}

impl From<CacheError> for FsError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound { name, .. } => FsError::NotFound(name),
            CacheError::NotADirectory(id) => FsError::NotADirectory(id.to_string()),
            CacheError::Upstream(source) => FsError::UpstreamUnavailable(source),
        }
    }
}

impl From<OpenError> for FsError {
    fn from(err: OpenError) -> Self {
        match err {
            OpenError::IsADirectory(id) => FsError::IsADirectory(id.to_string()),
            OpenError::Upstream(source) => FsError::UpstreamUnavailable(source),
        }
    }
}

impl From<ReadError> for FsError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::BadHandle(id) => FsError::BadHandle(id),
            ReadError::UnsupportedSeek { offset, .. } => FsError::UnsupportedSeek { offset },
            ReadError::Upstream(source) => FsError::UpstreamUnavailable(source),
        }
    }
}

/// Attribute record for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub kind: NodeKind,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub perm: u16,
    pub nlink: u32,
    pub mtime: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// Access requested by an open call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn is_mutating(&self) -> bool {
        self.write || self.append || self.create || self.truncate
    }
}

/// Read-only filesystem over a remote tree
#[derive(Debug)]
pub struct RemoteFs {
    resolver: PathResolver,
    handles: FileHandleManager,
    config: FsConfig,
    mounted_at: SystemTime,
}

impl RemoteFs {
    pub fn new(provider: Arc<dyn RemoteTreeProvider>, root: NodeId, config: FsConfig) -> Self {
        let cache = NodeCache::new(provider.clone(), root, config.cache.clone());
        Self {
            resolver: PathResolver::new(cache),
            handles: FileHandleManager::new(provider, config.handles.clone()),
            config,
            mounted_at: SystemTime::now(),
        }
    }

    pub fn cache(&self) -> &NodeCache {
        self.resolver.cache()
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn handles(&self) -> &FileHandleManager {
        &self.handles
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// List the root before exposing the mount, so a dead session fails early
    pub async fn prefetch_root(&self) -> Result<(), FsError> {
        self.cache().populate(self.cache().root()).await?;
        Ok(())
    }

    pub async fn getattr(&self, path: &str) -> Result<FileAttributes, FsError> {
        let node = self.resolver.resolve(path).await?;
        self.attributes(&node).await
    }

    /// Attributes of an already resolved node
    pub async fn attributes(&self, node: &Arc<Node>) -> Result<FileAttributes, FsError> {
        let attrs = node.attrs();
        let mtime = attrs
            .modified
            .map(SystemTime::from)
            .unwrap_or(self.mounted_at);

        Ok(match node.kind() {
            NodeKind::Directory => FileAttributes {
                kind: NodeKind::Directory,
                size: 0,
                blocks: 0,
                blksize: BLOCK_SIZE,
                perm: 0o555,
                nlink: 2,
                mtime,
            },
            NodeKind::File => {
                let size = match attrs.size {
                    Some(size) => size,
                    None => self.cache().fetch_size(node).await?,
                };
                FileAttributes {
                    kind: NodeKind::File,
                    size,
                    blocks: size.div_ceil(BLOCK_SIZE as u64),
                    blksize: BLOCK_SIZE,
                    perm: 0o444,
                    nlink: 1,
                    mtime,
                }
            }
        })
    }

    /// Children of a directory, in the provider's order
    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let pin = self.resolver.resolve_pinned(path).await?;
        if !pin.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        self.cache().populate(pin.node()).await?;

        Ok(pin
            .children()
            .iter()
            .map(|(name, child)| DirEntry {
                name: name.clone(),
                kind: child.kind(),
            })
            .collect())
    }

    pub async fn open(&self, path: &str, flags: OpenFlags) -> Result<HandleId, FsError> {
        if flags.is_mutating() {
            return Err(FsError::ReadOnly("open for writing"));
        }
        let node = self.resolver.resolve(path).await?;
        if node.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        Ok(self.handles.open(node).await?)
    }

    pub async fn read(&self, fh: HandleId, offset: u64, len: usize) -> Result<Bytes, FsError> {
        Ok(self.handles.read(fh, offset, len).await?)
    }

    pub fn release(&self, fh: HandleId) {
        self.handles.release(fh);
    }

    pub fn write(&self, _fh: HandleId, _offset: u64, _data: &[u8]) -> Result<usize, FsError> {
        Err(FsError::ReadOnly("write"))
    }

    pub fn create(&self, _path: &str) -> Result<HandleId, FsError> {
        Err(FsError::ReadOnly("create"))
    }

    pub fn mkdir(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::ReadOnly("mkdir"))
    }

    pub fn rmdir(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::ReadOnly("rmdir"))
    }

    pub fn unlink(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::ReadOnly("unlink"))
    }

    pub fn rename(&self, _from: &str, _to: &str) -> Result<(), FsError> {
        Err(FsError::ReadOnly("rename"))
    }

    pub fn truncate(&self, _path: &str, _size: u64) -> Result<(), FsError> {
        Err(FsError::ReadOnly("truncate"))
    }

    pub fn chmod(&self, _path: &str, _mode: u32) -> Result<(), FsError> {
        Err(FsError::ReadOnly("chmod"))
    }

    pub fn symlink(&self, _target: &str, _path: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported("symlink"))
    }

    pub fn link(&self, _from: &str, _to: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported("link"))
    }

    /// Release every handle and forget the cached tree
    pub fn teardown(&self) -> CacheStats {
        let stats = self.cache().stats();
        let released = self.handles.release_all();
        self.cache().clear();
        tracing::info!(released, nodes = stats.nodes, fetches = stats.fetches, "filesystem torn down");
        stats
    }
}
