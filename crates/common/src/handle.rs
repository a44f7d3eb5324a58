//! Open file handles
//!
//! Every handle owns its own provider byte source and cursor; nothing is
//! shared between handles except the read-only node they point at.
//!
//! Range-capable sources are read directly. Sequential sources are read
//! through a bounded window of recently fetched bytes: forward jumps discard
//! bytes up to the requested offset, backward jumps inside the window are
//! served locally, and backward jumps past it either reopen the source from
//! the start or fail, depending on [`RewindPolicy`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::provider::{ContentSource, NodeId, ProviderError, RemoteTreeProvider};

pub type HandleId = u64;

/// What to do when a read lands before the retained window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewindPolicy {
    /// Reopen the source and discard forward to the offset (slow path)
    Reopen,
    /// Fail with [`ReadError::UnsupportedSeek`]
    Refuse,
}

#[derive(Debug, Clone)]
pub struct HandleConfig {
    /// Upper bound for opening a source or fetching one chunk
    pub request_timeout: Duration,
    /// Bytes kept behind the cursor of a sequential source
    pub retain_bytes: usize,
    pub rewind: RewindPolicy,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retain_bytes: 8 * 1024 * 1024,
            rewind: RewindPolicy::Reopen,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OpenError {
    #[error("{0} is a directory")]
    IsADirectory(NodeId),
    #[error("upstream unavailable: {0}")]
    Upstream(#[from] ProviderError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReadError {
    #[error("unknown file handle {0}")]
    BadHandle(HandleId),
    #[error("cannot seek back to offset {offset}, buffered data starts at {buffered_from}")]
    UnsupportedSeek { offset: u64, buffered_from: u64 },
    #[error("upstream unavailable: {0}")]
    Upstream(#[from] ProviderError),
}

/// Table of open handles
pub struct FileHandleManager {
    provider: Arc<dyn RemoteTreeProvider>,
    config: HandleConfig,
    handles: RwLock<HashMap<HandleId, Arc<FileHandle>>>,
    next_id: AtomicU64,
}

struct FileHandle {
    node: Arc<Node>,
    reader: tokio::sync::Mutex<HandleReader>,
}

impl FileHandleManager {
    pub fn new(provider: Arc<dyn RemoteTreeProvider>, config: HandleConfig) -> Self {
        Self {
            provider,
            config,
            handles: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    /// Open `node` for reading without downloading it
    pub async fn open(&self, node: Arc<Node>) -> Result<HandleId, OpenError> {
        if node.is_dir() {
            return Err(OpenError::IsADirectory(node.id().clone()));
        }

        let mut reader = match node.attrs().inline {
            Some(content) => HandleReader::inline(content),
            None => HandleReader::remote(),
        };
        if !reader.is_inline() {
            reader
                .reopen(self.provider.as_ref(), node.id(), &self.config)
                .await
                .inspect_err(|err| self.on_upstream_error(err))?;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        node.acquire_handle();
        tracing::debug!(handle = id, node = %node.id(), "opened");
        self.handles.write().insert(
            id,
            Arc::new(FileHandle {
                node,
                reader: tokio::sync::Mutex::new(reader),
            }),
        );
        Ok(id)
    }

    /// Read up to `len` bytes at `offset`; short or empty past end of file
    pub async fn read(&self, id: HandleId, offset: u64, len: usize) -> Result<Bytes, ReadError> {
        let handle = self.get(id)?;
        let mut reader = handle.reader.lock().await;
        let result = reader
            .read(self.provider.as_ref(), handle.node.id(), &self.config, offset, len)
            .await;
        if let Err(ReadError::Upstream(err)) = &result {
            self.on_upstream_error(err);
        }
        result
    }

    /// A rejected session is dropped so the next request authenticates again
    fn on_upstream_error(&self, err: &ProviderError) {
        if let ProviderError::Auth(_) = err {
            tracing::info!(error = %err, "session rejected while reading, invalidating");
            self.provider.invalidate_session();
        }
    }

    /// Close a handle; releasing an unknown or already released handle is a no-op
    pub fn release(&self, id: HandleId) {
        let handle = self.handles.write().remove(&id);
        if let Some(handle) = handle {
            handle.node.release_handle();
            tracing::debug!(handle = id, node = %handle.node.id(), "released");
        }
    }

    /// Close every handle
    pub fn release_all(&self) -> usize {
        let drained: Vec<_> = self.handles.write().drain().collect();
        for (_, handle) in &drained {
            handle.node.release_handle();
        }
        drained.len()
    }

    /// Node behind an open handle
    pub fn node(&self, id: HandleId) -> Option<Arc<Node>> {
        self.handles.read().get(&id).map(|handle| handle.node.clone())
    }

    pub fn open_count(&self) -> usize {
        self.handles.read().len()
    }

    fn get(&self, id: HandleId) -> Result<Arc<FileHandle>, ReadError> {
        self.handles
            .read()
            .get(&id)
            .cloned()
            .ok_or(ReadError::BadHandle(id))
    }
}

impl std::fmt::Debug for FileHandleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandleManager")
            .field("config", &self.config)
            .field("open", &self.open_count())
            .finish()
    }
}

/// Per-handle read state
struct HandleReader {
    inline: Option<Bytes>,
    source: Option<Box<dyn ContentSource>>,
    /// Bytes pulled from the source so far
    cursor: u64,
    /// Retained bytes, covering `[window_start, cursor)`
    window: BytesMut,
    window_start: u64,
    eof: bool,
    /// Set while awaiting the source; still set on entry means the previous
    /// read was cancelled mid-fetch and the source position is unknown
    fetching: bool,
}

impl HandleReader {
    fn inline(content: Bytes) -> Self {
        Self {
            inline: Some(content),
            ..Self::remote()
        }
    }

    fn remote() -> Self {
        Self {
            inline: None,
            source: None,
            cursor: 0,
            window: BytesMut::new(),
            window_start: 0,
            eof: false,
            fetching: false,
        }
    }

    fn is_inline(&self) -> bool {
        self.inline.is_some()
    }

    async fn reopen(
        &mut self,
        provider: &dyn RemoteTreeProvider,
        id: &NodeId,
        config: &HandleConfig,
    ) -> Result<(), ProviderError> {
        self.source = None;
        self.cursor = 0;
        self.window.clear();
        self.window_start = 0;
        self.eof = false;

        let source = match tokio::time::timeout(config.request_timeout, provider.open_content(id)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProviderError::Timeout(config.request_timeout)),
        };
        self.source = Some(source);
        Ok(())
    }

    async fn read(
        &mut self,
        provider: &dyn RemoteTreeProvider,
        id: &NodeId,
        config: &HandleConfig,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, ReadError> {
        if let Some(content) = &self.inline {
            let start = offset.min(content.len() as u64) as usize;
            let end = offset.saturating_add(len as u64).min(content.len() as u64) as usize;
            return Ok(content.slice(start..end));
        }
        if len == 0 {
            return Ok(Bytes::new());
        }

        if self.fetching {
            tracing::debug!(node = %id, "previous read was abandoned, reopening source");
            self.fetching = false;
            self.source = None;
        }
        if self.source.is_none() {
            self.reopen(provider, id, config).await?;
        }

        if self.source.as_ref().is_some_and(|source| source.supports_range()) {
            return self.read_range(id, config, offset, len).await;
        }

        if offset < self.window_start {
            match config.rewind {
                RewindPolicy::Refuse => {
                    return Err(ReadError::UnsupportedSeek {
                        offset,
                        buffered_from: self.window_start,
                    })
                }
                RewindPolicy::Reopen => {
                    tracing::debug!(node = %id, offset, buffered_from = self.window_start, "rewinding by reopening source");
                    self.reopen(provider, id, config).await?;
                }
            }
        }

        let end = offset.saturating_add(len as u64);
        while self.cursor < end && !self.eof {
            match self.next_chunk(config).await? {
                Some(chunk) => self.append(chunk, offset, config.retain_bytes),
                None => self.eof = true,
            }
        }

        if offset >= self.cursor {
            return Ok(Bytes::new());
        }
        let from = (offset - self.window_start) as usize;
        let to = (end.min(self.cursor) - self.window_start) as usize;
        Ok(Bytes::copy_from_slice(&self.window[from..to]))
    }

    async fn read_range(
        &mut self,
        id: &NodeId,
        config: &HandleConfig,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, ReadError> {
        let Some(source) = self.source.as_mut() else {
            return Ok(Bytes::new());
        };
        self.fetching = true;
        let result = tokio::time::timeout(config.request_timeout, source.read_range(offset, len as u64)).await;
        self.fetching = false;
        match result {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => {
                tracing::debug!(node = %id, offset, error = %err, "range read failed");
                self.source = None;
                Err(err.into())
            }
            Err(_) => {
                self.source = None;
                Err(ProviderError::Timeout(config.request_timeout).into())
            }
        }
    }

    async fn next_chunk(&mut self, config: &HandleConfig) -> Result<Option<Bytes>, ProviderError> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        self.fetching = true;
        let result = tokio::time::timeout(config.request_timeout, source.next_chunk()).await;
        self.fetching = false;
        match result {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(err)) => {
                self.source = None;
                Err(err)
            }
            Err(_) => {
                self.source = None;
                Err(ProviderError::Timeout(config.request_timeout))
            }
        }
    }

    /// Append a chunk and trim the window, never dropping bytes at or after
    /// `keep_from`
    fn append(&mut self, chunk: Bytes, keep_from: u64, retain: usize) {
        self.window.extend_from_slice(&chunk);
        self.cursor += chunk.len() as u64;

        let floor = keep_from.min(self.cursor.saturating_sub(retain as u64));
        if floor > self.window_start {
            let excess = (floor - self.window_start) as usize;
            self.window.advance(excess);
            self.window_start = floor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, NodeCache};
    use crate::provider::{MemoryProvider, RemoteEntry};

    fn content() -> Vec<u8> {
        (0..=255u8).cycle().take(4096).collect()
    }

    async fn setup(
        provider: MemoryProvider,
        config: HandleConfig,
    ) -> (Arc<MemoryProvider>, FileHandleManager, NodeCache) {
        let provider = Arc::new(provider);
        provider.set_children(
            "crs_1",
            vec![
                RemoteEntry::file("file_1", "data.bin", Some(4096)),
                RemoteEntry::directory("fold_1", "Folder"),
                RemoteEntry::link("lnk_1", "Homepage", "https://example.org"),
            ],
        );
        provider.set_content("file_1", content());
        let cache = NodeCache::new(provider.clone(), NodeId::course(1), CacheConfig::default());
        cache.populate(cache.root()).await.unwrap();
        let manager = FileHandleManager::new(provider.clone(), config);
        (provider, manager, cache)
    }

    fn child(cache: &NodeCache, name: &str) -> Arc<Node> {
        cache.root().child(name).unwrap()
    }

    #[tokio::test]
    async fn test_sequential_reads() {
        let (_, manager, cache) = setup(MemoryProvider::new().with_chunk_size(100), HandleConfig::default()).await;
        let node = child(&cache, "data.bin");
        let fh = manager.open(node.clone()).await.unwrap();
        assert_eq!(node.open_handles(), 1);

        let first = manager.read(fh, 0, 100).await.unwrap();
        assert_eq!(&first[..], &content()[..100]);

        let skipped = manager.read(fh, 1000, 50).await.unwrap();
        assert_eq!(&skipped[..], &content()[1000..1050]);

        // Backwards, still inside the retained window
        let again = manager.read(fh, 10, 20).await.unwrap();
        assert_eq!(&again[..], &content()[10..30]);
    }

    #[tokio::test]
    async fn test_read_past_end_is_short_not_error() {
        let (_, manager, cache) = setup(MemoryProvider::new(), HandleConfig::default()).await;
        let node = child(&cache, "data.bin");
        let fh = manager.open(node).await.unwrap();

        let tail = manager.read(fh, 4000, 500).await.unwrap();
        assert_eq!(tail.len(), 96);
        assert!(manager.read(fh, 9000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rewind_reopens_source() {
        let config = HandleConfig {
            retain_bytes: 64,
            ..HandleConfig::default()
        };
        let (provider, manager, cache) = setup(MemoryProvider::new().with_chunk_size(64), config).await;
        let node = child(&cache, "data.bin");
        let fh = manager.open(node).await.unwrap();

        manager.read(fh, 3000, 10).await.unwrap();
        let start = manager.read(fh, 0, 10).await.unwrap();
        assert_eq!(&start[..], &content()[..10]);
        assert_eq!(provider.open_calls(&"file_1".into()), 2);
    }

    #[tokio::test]
    async fn test_rewind_refused() {
        let config = HandleConfig {
            retain_bytes: 64,
            rewind: RewindPolicy::Refuse,
            ..HandleConfig::default()
        };
        let (_, manager, cache) = setup(MemoryProvider::new().with_chunk_size(64), config).await;
        let node = child(&cache, "data.bin");
        let fh = manager.open(node).await.unwrap();

        manager.read(fh, 3000, 10).await.unwrap();
        assert!(matches!(
            manager.read(fh, 0, 10).await,
            Err(ReadError::UnsupportedSeek { offset: 0, .. })
        ));
        // Data still in the window is served
        assert_eq!(&manager.read(fh, 3005, 10).await.unwrap()[..], &content()[3005..3015]);
    }

    #[tokio::test]
    async fn test_range_source_reads_directly() {
        let (provider, manager, cache) = setup(MemoryProvider::new().with_range_reads(true), HandleConfig::default()).await;
        let node = child(&cache, "data.bin");
        let fh = manager.open(node).await.unwrap();

        assert_eq!(&manager.read(fh, 2048, 16).await.unwrap()[..], &content()[2048..2064]);
        assert_eq!(&manager.read(fh, 0, 16).await.unwrap()[..], &content()[..16]);
        assert!(manager.read(fh, 5000, 16).await.unwrap().is_empty());
        assert_eq!(provider.open_calls(&"file_1".into()), 1);
    }

    #[tokio::test]
    async fn test_independent_handles() {
        let (provider, manager, cache) = setup(MemoryProvider::new(), HandleConfig::default()).await;
        let node = child(&cache, "data.bin");
        let a = manager.open(node.clone()).await.unwrap();
        let b = manager.open(node.clone()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(node.open_handles(), 2);
        assert_eq!(provider.open_calls(&"file_1".into()), 2);

        manager.read(a, 3000, 10).await.unwrap();
        assert_eq!(&manager.read(b, 0, 10).await.unwrap()[..], &content()[..10]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_, manager, cache) = setup(MemoryProvider::new(), HandleConfig::default()).await;
        let node = child(&cache, "data.bin");
        let fh = manager.open(node.clone()).await.unwrap();

        manager.release(fh);
        manager.release(fh);
        assert_eq!(node.open_handles(), 0);
        assert!(matches!(manager.read(fh, 0, 1).await, Err(ReadError::BadHandle(_))));
    }

    #[tokio::test]
    async fn test_open_directory_fails() {
        let (_, manager, cache) = setup(MemoryProvider::new(), HandleConfig::default()).await;
        let dir = child(&cache, "Folder");
        assert!(matches!(manager.open(dir).await, Err(OpenError::IsADirectory(_))));
    }

    #[tokio::test]
    async fn test_link_is_served_inline() {
        let (provider, manager, cache) = setup(MemoryProvider::new(), HandleConfig::default()).await;
        let link = child(&cache, "Link - Homepage");
        let fh = manager.open(link).await.unwrap();

        assert_eq!(&manager.read(fh, 0, 100).await.unwrap()[..], b"https://example.org");
        assert_eq!(provider.open_calls(&"lnk_1".into()), 0);
    }

    #[tokio::test]
    async fn test_rejected_session_is_invalidated() {
        let (provider, manager, cache) = setup(MemoryProvider::new(), HandleConfig::default()).await;
        let node = child(&cache, "data.bin");

        provider.fail_next("file_1", ProviderError::Auth("expired".into()));
        assert!(matches!(
            manager.open(node.clone()).await,
            Err(OpenError::Upstream(ProviderError::Auth(_)))
        ));
        assert_eq!(provider.session_invalidations(), 1);
        assert_eq!(node.open_handles(), 0);

        // Reopening mid-read fails the same way
        let fh = manager.open(node).await.unwrap();
        manager.read(fh, 0, 10).await.unwrap();
        {
            let handle = manager.get(fh).unwrap();
            handle.reader.lock().await.source = None;
        }
        provider.fail_next("file_1", ProviderError::Auth("expired".into()));
        assert!(matches!(
            manager.read(fh, 0, 10).await,
            Err(ReadError::Upstream(ProviderError::Auth(_)))
        ));
        assert_eq!(provider.session_invalidations(), 2);

        // Transient failures leave the session alone
        provider.fail_next("file_1", ProviderError::Network("reset".into()));
        {
            let handle = manager.get(fh).unwrap();
            handle.reader.lock().await.source = None;
        }
        assert!(manager.read(fh, 0, 10).await.is_err());
        assert_eq!(provider.session_invalidations(), 2);
        assert_eq!(&manager.read(fh, 0, 10).await.unwrap()[..], &content()[..10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_read_reopens_source() {
        let (provider, manager, cache) = setup(MemoryProvider::new().with_chunk_size(100), HandleConfig::default()).await;
        let node = child(&cache, "data.bin");

        provider.set_content_delay(Some(Duration::from_secs(5)));
        let fh = manager.open(node).await.unwrap();
        let abandoned = tokio::time::timeout(Duration::from_secs(1), manager.read(fh, 0, 10)).await;
        assert!(abandoned.is_err());
        assert_eq!(provider.open_calls(&"file_1".into()), 1);

        provider.set_content_delay(None);
        let bytes = manager.read(fh, 50, 10).await.unwrap();
        assert_eq!(&bytes[..], &content()[50..60]);
        assert_eq!(provider.open_calls(&"file_1".into()), 2);
    }

    #[tokio::test]
    async fn test_lost_source_is_reopened_on_next_read() {
        let (provider, manager, cache) = setup(MemoryProvider::new(), HandleConfig::default()).await;
        let node = child(&cache, "data.bin");
        let fh = manager.open(node).await.unwrap();
        provider.fail_next("file_1", ProviderError::Network("reset".into()));

        manager.read(fh, 0, 10).await.unwrap();
        assert_eq!(provider.open_calls(&"file_1".into()), 1);
        let err = {
            let handle = manager.get(fh).unwrap();
            let mut reader = handle.reader.lock().await;
            reader.source = None;
            drop(reader);
            manager.read(fh, 0, 10).await
        };
        assert!(matches!(err, Err(ReadError::Upstream(ProviderError::Network(_)))));
        assert_eq!(&manager.read(fh, 0, 10).await.unwrap()[..], &content()[..10]);
    }
}
