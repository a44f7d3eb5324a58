//! Lazily populated node cache
//!
//! The cache owns the mirrored portion of the remote tree. Directories are
//! listed on first use, refreshed once their TTL has elapsed, and dropped
//! again after a longer idle window.
//!
//! # Population
//!
//! Concurrent [`NodeCache::populate`] calls on the same directory share a
//! single in-flight fetch. Transient provider failures are retried with
//! exponential backoff before the error reaches callers.
//!
//! # Reconciliation
//!
//! A fresh listing is merged into the existing child map by stable remote
//! identifier: surviving children keep their `Arc<Node>` and get their
//! attributes refreshed, vanished children are dropped (or flagged orphaned
//! when a handle still references them) and new children start out
//! `Unfetched`. The merged map is swapped in as one snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::names::{display_name, NameAllocator};
use crate::node::{Children, FetchState, Node, NodeKind, NodePin};
use crate::provider::{NodeId, ProviderError, RemoteEntry, RemoteTreeProvider};

/// Configuration for the node cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a listing stays valid
    pub ttl: Duration,
    /// Nodes untouched for this long may be dropped
    pub idle_evict: Duration,
    /// Upper bound for a single provider call
    pub request_timeout: Duration,
    /// Retries for transient failures within one populate
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each further one
    pub retry_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            idle_evict: Duration::from_secs(600),
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl CacheConfig {
    /// Create config from basic parameters, keeping default retry behavior
    pub fn from_basic(ttl_secs: u64, idle_evict_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            idle_evict: Duration::from_secs(idle_evict_secs.max(ttl_secs)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("no entry named {name:?} in {parent}")]
    NotFound { parent: NodeId, name: String },
    #[error("{0} is not a directory")]
    NotADirectory(NodeId),
    #[error("upstream unavailable: {0}")]
    Upstream(#[from] ProviderError),
}

type SharedFetch = Shared<BoxFuture<'static, Result<(), CacheError>>>;

/// In-memory mirror of the visited part of the remote tree
#[derive(Clone)]
pub struct NodeCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    provider: Arc<dyn RemoteTreeProvider>,
    config: CacheConfig,
    root: Arc<Node>,
    next_key: AtomicU64,
    inflight: Mutex<HashMap<u64, SharedFetch>>,
    fetches: AtomicU64,
}

impl NodeCache {
    /// Create a cache rooted at `root_id`; nothing is fetched yet
    pub fn new(provider: Arc<dyn RemoteTreeProvider>, root_id: NodeId, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                provider,
                config,
                root: Node::new_root(1, root_id),
                next_key: AtomicU64::new(2),
                inflight: Mutex::new(HashMap::new()),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.inner.root
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Existing child of a populated directory
    ///
    /// Does not fetch: callers populate `parent` first.
    pub fn get_or_create_child(&self, parent: &Arc<Node>, name: &str) -> Result<Arc<Node>, CacheError> {
        self.pin_child(parent, name).map(NodePin::into_node)
    }

    /// Like [`NodeCache::get_or_create_child`], with the child pinned
    /// against eviction before the parent's lock is released
    pub fn pin_child(&self, parent: &Arc<Node>, name: &str) -> Result<NodePin, CacheError> {
        if !parent.is_dir() {
            return Err(CacheError::NotADirectory(parent.id().clone()));
        }
        let pin = {
            let dir = parent.dir.read();
            dir.children.get(name).cloned().map(NodePin::new)
        };
        match pin {
            Some(pin) => {
                pin.touch();
                Ok(pin)
            }
            None => Err(CacheError::NotFound {
                parent: parent.id().clone(),
                name: name.to_string(),
            }),
        }
    }

    /// Make sure `node`'s child map is populated and within its TTL
    pub async fn populate(&self, node: &Arc<Node>) -> Result<(), CacheError> {
        if !node.is_dir() {
            return Err(CacheError::NotADirectory(node.id().clone()));
        }
        node.touch();

        let fetch = {
            let mut inflight = self.inner.inflight.lock();
            match inflight.get(&node.key()) {
                Some(fetch) => fetch.clone(),
                None => {
                    if node.is_fresh(self.inner.config.ttl) {
                        return Ok(());
                    }
                    let fetch = Self::fetch_and_reconcile(self.inner.clone(), node.clone())
                        .boxed()
                        .shared();
                    inflight.insert(node.key(), fetch.clone());
                    fetch
                }
            }
        };

        fetch.await
    }

    /// Force the next populate of `node` to fetch regardless of TTL
    pub fn invalidate(&self, node: &Arc<Node>) {
        let mut dir = node.dir.write();
        if dir.state == FetchState::Populated {
            dir.state = FetchState::Stale;
            tracing::debug!(node = %node.id(), "listing invalidated");
        }
    }

    /// Fetch a file's size when the listing did not report one
    ///
    /// The provider is asked once per node; an unknown size is remembered
    /// as 0.
    pub async fn fetch_size(&self, node: &Arc<Node>) -> Result<u64, CacheError> {
        if let Some(size) = node.size() {
            return Ok(size);
        }
        let timeout = self.inner.config.request_timeout;
        let size = match tokio::time::timeout(timeout, self.inner.provider.content_length(node.id())).await {
            Ok(Err(err)) => {
                if let ProviderError::Auth(_) = err {
                    tracing::warn!(node = %node.id(), error = %err, "provider rejected session");
                    self.inner.provider.invalidate_session();
                }
                return Err(err.into());
            }
            Ok(Ok(size)) => size.unwrap_or(0),
            Err(_) => return Err(ProviderError::Timeout(timeout).into()),
        };
        node.set_size(size);
        Ok(size)
    }

    /// Drop nodes that have been idle longer than the eviction window
    ///
    /// Nodes with live handles, pinned by an in-progress lookup, or with
    /// such a descendant, are kept. A directory that lost children is
    /// marked stale so the next lookup lists it again. Returns the number
    /// of nodes dropped.
    pub fn evict_idle(&self) -> usize {
        let dropped = self.evict_under(&self.inner.root, Instant::now());
        if dropped > 0 {
            tracing::debug!(dropped, "evicted idle nodes");
        }
        dropped
    }

    fn evict_under(&self, dir: &Arc<Node>, now: Instant) -> usize {
        let idle_evict = self.inner.config.idle_evict;
        let is_idle = |node: &Arc<Node>| now.duration_since(node.last_access()) >= idle_evict;

        let snapshot = dir.children();
        let mut dropped = 0;
        let mut candidates = Vec::new();
        for (name, child) in snapshot.iter() {
            if is_idle(child) && !child.subtree_in_use() {
                candidates.push(name.as_str());
            } else if child.is_dir() {
                dropped += self.evict_under(child, now);
            }
        }

        if candidates.is_empty() {
            return dropped;
        }

        let mut state = dir.dir.write();
        // The listing may have been replaced since the snapshot was taken
        if !Arc::ptr_eq(&state.children, &snapshot) {
            return dropped;
        }
        let mut next: Children = (*state.children).clone();
        for name in candidates {
            let still_unused = next
                .get(name)
                .map(|child| is_idle(child) && !child.subtree_in_use())
                .unwrap_or(false);
            if still_unused {
                if let Some(child) = next.shift_remove(name) {
                    dropped += child.subtree_len();
                }
            }
        }
        state.children = Arc::new(next);
        if state.state == FetchState::Populated {
            state.state = FetchState::Stale;
        }
        dropped
    }

    /// Forget everything below the root
    pub fn clear(&self) {
        self.inner.inflight.lock().clear();
        let root = &self.inner.root;
        let mut dir = root.dir.write();
        for child in dir.children.values() {
            if child.subtree_in_use() {
                child.mark_orphaned();
            }
        }
        *dir = crate::node::DirState::unfetched();
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            nodes: 0,
            directories: 0,
            populated: 0,
            open_handles: 0,
            fetches: self.inner.fetches.load(Ordering::SeqCst),
            ttl_secs: self.inner.config.ttl.as_secs(),
            idle_evict_secs: self.inner.config.idle_evict.as_secs(),
        };
        Self::collect_stats(&self.inner.root, &mut stats);
        stats
    }

    fn collect_stats(node: &Arc<Node>, stats: &mut CacheStats) {
        stats.nodes += 1;
        stats.open_handles += node.open_handles() as u64;
        if node.is_dir() {
            stats.directories += 1;
            if node.fetch_state() == FetchState::Populated {
                stats.populated += 1;
            }
            for child in node.children().values() {
                Self::collect_stats(child, stats);
            }
        }
    }

    async fn fetch_and_reconcile(inner: Arc<CacheInner>, node: Arc<Node>) -> Result<(), CacheError> {
        let result = match Self::fetch_with_retry(&inner, node.id()).await {
            Ok(entries) => {
                Self::reconcile(&inner, &node, entries);
                Ok(())
            }
            Err(err) => Err(CacheError::Upstream(err)),
        };
        inner.inflight.lock().remove(&node.key());
        result
    }

    async fn fetch_with_retry(inner: &CacheInner, id: &NodeId) -> Result<Vec<RemoteEntry>, ProviderError> {
        let config = &inner.config;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            inner.fetches.fetch_add(1, Ordering::SeqCst);

            let result = match tokio::time::timeout(config.request_timeout, inner.provider.list_children(id)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(config.request_timeout)),
            };

            let err = match result {
                Ok(entries) => {
                    tracing::debug!(node = %id, attempt, children = entries.len(), "listing fetched");
                    return Ok(entries);
                }
                Err(err) => err,
            };

            if let ProviderError::Auth(_) = err {
                tracing::warn!(node = %id, error = %err, "provider rejected session");
                inner.provider.invalidate_session();
                return Err(err);
            }

            let backoff = config.retry_backoff.saturating_mul(1 << (attempt - 1).min(16));
            let delay = err.retry_after().unwrap_or(backoff);
            if !err.is_transient() || attempt > config.max_retries || delay > config.request_timeout {
                tracing::warn!(node = %id, attempt, error = %err, "listing failed");
                return Err(err);
            }

            tracing::debug!(node = %id, attempt, error = %err, ?delay, "listing failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    fn reconcile(inner: &CacheInner, node: &Arc<Node>, entries: Vec<RemoteEntry>) {
        let mut dir = node.dir.write();

        let mut previous: HashMap<NodeId, Arc<Node>> = dir
            .children
            .values()
            .map(|child| (child.id().clone(), child.clone()))
            .collect();

        let mut names = NameAllocator::new();
        let mut next = Children::with_capacity(entries.len());
        let (mut kept, mut added) = (0usize, 0usize);

        for entry in &entries {
            let kind = NodeKind::from(&entry.kind);
            let name = names.allocate(&display_name(entry), kind == NodeKind::File);

            let child = match previous.remove(&entry.id) {
                Some(existing) if existing.kind() == kind => {
                    existing.update_from(name.clone(), entry);
                    kept += 1;
                    existing
                }
                replaced => {
                    if let Some(replaced) = replaced {
                        Self::retire(&replaced);
                    }
                    added += 1;
                    let key = inner.next_key.fetch_add(1, Ordering::SeqCst);
                    Node::new_child(key, node, name.clone(), entry)
                }
            };
            next.insert(name, child);
        }

        let removed = previous.len();
        for gone in previous.values() {
            Self::retire(gone);
        }

        dir.children = Arc::new(next);
        dir.state = FetchState::Populated;
        dir.populated_at = Some(Instant::now());

        tracing::debug!(node = %node.id(), kept, added, removed, "listing reconciled");
    }

    fn retire(node: &Arc<Node>) {
        if node.subtree_in_use() {
            tracing::debug!(node = %node.id(), "removed upstream while in use, orphaning");
            node.mark_orphaned();
        }
    }
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("config", &self.inner.config)
            .field("root", self.inner.root.id())
            .field("inflight", &self.inner.inflight.lock().len())
            .field("fetches", &self.inner.fetches.load(Ordering::SeqCst))
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub nodes: u64,
    pub directories: u64,
    pub populated: u64,
    pub open_handles: u64,
    pub fetches: u64,
    pub ttl_secs: u64,
    pub idle_evict_secs: u64,
}
