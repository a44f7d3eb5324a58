//! In-memory provider for tests and fixtures

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{ContentSource, NodeId, ProviderError, RemoteEntry, RemoteTreeProvider};

const DEFAULT_CHUNK_SIZE: usize = 64;

/// Provider backed by maps of listings and contents
///
/// Every call is counted per node, failures can be queued per node and
/// listings can be slowed down, which makes it suitable for exercising
/// retry, deduplication and timeout behavior.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    listings: HashMap<NodeId, Vec<RemoteEntry>>,
    contents: HashMap<NodeId, Bytes>,
    failures: HashMap<NodeId, VecDeque<ProviderError>>,
    list_calls: HashMap<NodeId, usize>,
    open_calls: HashMap<NodeId, usize>,
    list_delay: Option<Duration>,
    content_delay: Option<Duration>,
    range_reads: bool,
    chunk_size: Option<usize>,
    session_invalidations: usize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve file content through range requests instead of a stream
    pub fn with_range_reads(self, enabled: bool) -> Self {
        self.state.lock().range_reads = enabled;
        self
    }

    /// Size of the chunks handed out by sequential sources
    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        self.state.lock().chunk_size = Some(chunk_size.max(1));
        self
    }

    /// Replace the listing of a directory
    pub fn set_children(&self, id: impl Into<NodeId>, children: Vec<RemoteEntry>) {
        self.state.lock().listings.insert(id.into(), children);
    }

    /// Replace the content of a file
    pub fn set_content(&self, id: impl Into<NodeId>, content: impl Into<Bytes>) {
        self.state.lock().contents.insert(id.into(), content.into());
    }

    /// Queue a failure for the next call touching `id`
    pub fn fail_next(&self, id: impl Into<NodeId>, error: ProviderError) {
        self.state
            .lock()
            .failures
            .entry(id.into())
            .or_default()
            .push_back(error);
    }

    /// Delay every listing by `delay` before answering
    pub fn set_list_delay(&self, delay: Option<Duration>) {
        self.state.lock().list_delay = delay;
    }

    /// Delay every chunk or range served by sources opened from now on
    pub fn set_content_delay(&self, delay: Option<Duration>) {
        self.state.lock().content_delay = delay;
    }

    pub fn list_calls(&self, id: &NodeId) -> usize {
        self.state.lock().list_calls.get(id).copied().unwrap_or(0)
    }

    pub fn open_calls(&self, id: &NodeId) -> usize {
        self.state.lock().open_calls.get(id).copied().unwrap_or(0)
    }

    pub fn session_invalidations(&self) -> usize {
        self.state.lock().session_invalidations
    }

    fn take_failure(&self, id: &NodeId) -> Option<ProviderError> {
        self.state
            .lock()
            .failures
            .get_mut(id)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl RemoteTreeProvider for MemoryProvider {
    async fn list_children(&self, id: &NodeId) -> Result<Vec<RemoteEntry>, ProviderError> {
        let delay = {
            let mut state = self.state.lock();
            *state.list_calls.entry(id.clone()).or_default() += 1;
            state.list_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.take_failure(id) {
            return Err(error);
        }

        self.state
            .lock()
            .listings
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.clone()))
    }

    async fn open_content(&self, id: &NodeId) -> Result<Box<dyn ContentSource>, ProviderError> {
        *self
            .state
            .lock()
            .open_calls
            .entry(id.clone())
            .or_default() += 1;

        if let Some(error) = self.take_failure(id) {
            return Err(error);
        }

        let state = self.state.lock();
        let content = state
            .contents
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.clone()))?;

        Ok(Box::new(MemorySource {
            content,
            position: 0,
            chunk_size: state.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            range_reads: state.range_reads,
            delay: state.content_delay,
        }))
    }

    async fn content_length(&self, id: &NodeId) -> Result<Option<u64>, ProviderError> {
        Ok(self
            .state
            .lock()
            .contents
            .get(id)
            .map(|content| content.len() as u64))
    }

    fn invalidate_session(&self) {
        self.state.lock().session_invalidations += 1;
    }
}

struct MemorySource {
    content: Bytes,
    position: usize,
    chunk_size: usize,
    range_reads: bool,
    delay: Option<Duration>,
}

impl MemorySource {
    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProviderError> {
        self.pause().await;
        if self.position >= self.content.len() {
            return Ok(None);
        }
        let end = (self.position + self.chunk_size).min(self.content.len());
        let chunk = self.content.slice(self.position..end);
        self.position = end;
        Ok(Some(chunk))
    }

    fn supports_range(&self) -> bool {
        self.range_reads
    }

    async fn read_range(&mut self, offset: u64, len: u64) -> Result<Bytes, ProviderError> {
        if !self.range_reads {
            return Err(ProviderError::Unsupported("range reads"));
        }
        self.pause().await;
        let total = self.content.len() as u64;
        let start = offset.min(total);
        let end = offset.saturating_add(len).min(total);
        Ok(self.content.slice(start as usize..end as usize))
    }
}
