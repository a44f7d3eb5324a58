//! In-memory mirror of remote entities
//!
//! A [`Node`] is owned by its parent's child map (the root by the cache).
//! Parents are only reachable through a weak back-reference, so the graph
//! never forms ownership cycles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::{Duration, Instant};

use crate::provider::{NodeId, RemoteEntry, RemoteKind};

/// Child map of a directory, in provider order, keyed by exposed name
pub type Children = IndexMap<String, Arc<Node>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

impl From<&RemoteKind> for NodeKind {
    fn from(kind: &RemoteKind) -> Self {
        match kind {
            RemoteKind::Directory => NodeKind::Directory,
            RemoteKind::File | RemoteKind::Link { .. } | RemoteKind::Forum { .. } => NodeKind::File,
        }
    }
}

/// Population state of a directory's child map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Unfetched,
    Populated,
    Stale,
}

/// Mutable metadata of a node, refreshed on every reconciliation
#[derive(Debug, Clone)]
pub struct NodeAttrs {
    /// Name exposed to the filesystem (sanitized, disambiguated)
    pub name: String,
    /// Name as reported by the provider
    pub remote_name: String,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    /// Content served locally instead of through the provider
    pub inline: Option<Bytes>,
}

#[derive(Debug)]
pub(crate) struct DirState {
    pub(crate) state: FetchState,
    pub(crate) populated_at: Option<Instant>,
    pub(crate) children: Arc<Children>,
}

/// One remote entity: a course, folder or file
#[derive(Debug)]
pub struct Node {
    key: u64,
    id: NodeId,
    kind: NodeKind,
    parent: Weak<Node>,
    attrs: RwLock<NodeAttrs>,
    pub(crate) dir: RwLock<DirState>,
    last_access: Mutex<Instant>,
    open_handles: AtomicUsize,
    pins: AtomicUsize,
    orphaned: AtomicBool,
}

impl Node {
    pub(crate) fn new_root(key: u64, id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            key,
            id: id.clone(),
            kind: NodeKind::Directory,
            parent: Weak::new(),
            attrs: RwLock::new(NodeAttrs {
                name: String::new(),
                remote_name: id.to_string(),
                size: None,
                modified: None,
                inline: None,
            }),
            dir: RwLock::new(DirState::unfetched()),
            last_access: Mutex::new(Instant::now()),
            open_handles: AtomicUsize::new(0),
            pins: AtomicUsize::new(0),
            orphaned: AtomicBool::new(false),
        })
    }

    pub(crate) fn new_child(key: u64, parent: &Arc<Node>, name: String, entry: &RemoteEntry) -> Arc<Self> {
        Arc::new(Self {
            key,
            id: entry.id.clone(),
            kind: NodeKind::from(&entry.kind),
            parent: Arc::downgrade(parent),
            attrs: RwLock::new(NodeAttrs::from_entry(name, entry)),
            dir: RwLock::new(DirState::unfetched()),
            last_access: Mutex::new(Instant::now()),
            open_handles: AtomicUsize::new(0),
            pins: AtomicUsize::new(0),
            orphaned: AtomicBool::new(false),
        })
    }

    /// Cache-local key, unique for the lifetime of the cache
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn name(&self) -> String {
        self.attrs.read().name.clone()
    }

    pub fn attrs(&self) -> NodeAttrs {
        self.attrs.read().clone()
    }

    pub fn size(&self) -> Option<u64> {
        self.attrs.read().size
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.upgrade()
    }

    pub fn fetch_state(&self) -> FetchState {
        self.dir.read().state
    }

    /// Snapshot of the child map as of the last reconciliation
    pub fn children(&self) -> Arc<Children> {
        self.dir.read().children.clone()
    }

    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.dir.read().children.get(name).cloned()
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Removed upstream while a handle still referenced it
    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::SeqCst)
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    pub(crate) fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.attrs.write().size = Some(size);
    }

    pub(crate) fn update_from(&self, name: String, entry: &RemoteEntry) {
        *self.attrs.write() = NodeAttrs::from_entry(name, entry);
    }

    pub(crate) fn mark_orphaned(&self) {
        self.orphaned.store(true, Ordering::SeqCst);
    }

    pub(crate) fn acquire_handle(&self) {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_handle(&self) {
        let _ = self
            .open_handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::SeqCst) > 0
    }

    /// Whether the node is populated and younger than `ttl`
    ///
    /// A populated node past its TTL is moved to `Stale` on observation.
    pub(crate) fn is_fresh(&self, ttl: Duration) -> bool {
        let now = Instant::now();
        {
            let dir = self.dir.read();
            match (dir.state, dir.populated_at) {
                (FetchState::Populated, Some(at)) if now.duration_since(at) < ttl => return true,
                (FetchState::Populated, _) => {}
                _ => return false,
            }
        }
        let mut dir = self.dir.write();
        if dir.state == FetchState::Populated {
            dir.state = FetchState::Stale;
        }
        false
    }

    /// Any live handle or in-progress lookup in this subtree
    pub(crate) fn subtree_in_use(&self) -> bool {
        if self.open_handles() > 0 || self.is_pinned() {
            return true;
        }
        self.children().values().any(|child| child.subtree_in_use())
    }

    /// Number of nodes in this subtree, the node included
    pub(crate) fn subtree_len(&self) -> usize {
        1 + self
            .children()
            .values()
            .map(|child| child.subtree_len())
            .sum::<usize>()
    }
}

impl DirState {
    pub(crate) fn unfetched() -> Self {
        Self {
            state: FetchState::Unfetched,
            populated_at: None,
            children: Arc::new(Children::new()),
        }
    }
}

impl NodeAttrs {
    fn from_entry(name: String, entry: &RemoteEntry) -> Self {
        let inline = match &entry.kind {
            RemoteKind::Link { url } | RemoteKind::Forum { url } => {
                Some(Bytes::from(url.clone().into_bytes()))
            }
            RemoteKind::Directory | RemoteKind::File => None,
        };
        let size = match &inline {
            Some(content) => Some(content.len() as u64),
            None => entry.size,
        };
        Self {
            name,
            remote_name: entry.name.clone(),
            size,
            modified: entry.modified,
            inline,
        }
    }
}

/// Keeps a node from being evicted while a lookup walks through it
#[derive(Debug)]
pub struct NodePin {
    node: Arc<Node>,
}

impl NodePin {
    pub fn new(node: Arc<Node>) -> Self {
        node.pins.fetch_add(1, Ordering::SeqCst);
        Self { node }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn into_node(self) -> Arc<Node> {
        self.node.clone()
    }
}

impl std::ops::Deref for NodePin {
    type Target = Arc<Node>;

    fn deref(&self) -> &Self::Target {
        &self.node
    }
}

impl Drop for NodePin {
    fn drop(&mut self) {
        self.node.pins.fetch_sub(1, Ordering::SeqCst);
    }
}
