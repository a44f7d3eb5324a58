//! Remote tree provider interface
//!
//! The core never talks to the learning platform directly. Everything it
//! knows about the remote tree arrives through a [`RemoteTreeProvider`]:
//! ordered child listings for directories and byte sources for files.
//!
//! Implementations live outside this crate (the daemon ships an HTTP
//! gateway provider); [`MemoryProvider`] is an in-memory implementation
//! used by tests and fixtures.

mod memory;

pub use memory::MemoryProvider;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Stable identifier of a remote entity
///
/// Opaque to the core. Two listings reporting the same identifier refer to
/// the same remote entity, which is what lets reconciliation keep node
/// identity across refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Root identifier for a course (`crs_<id>`)
    pub fn course(course_id: u64) -> Self {
        Self(format!("crs_{}", course_id))
    }

    /// Root identifier for the user's personal desktop
    pub fn personal_desktop() -> Self {
        Self("desktop".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What a remote entry is, as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteKind {
    Directory,
    File,
    /// External link; exposed as a small file holding the URL
    Link { url: String },
    /// Forum; exposed as a small file holding the forum URL
    Forum { url: String },
}

/// One child as reported by [`RemoteTreeProvider::list_children`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: NodeId,
    pub name: String,
    pub kind: RemoteKind,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    pub fn directory(id: impl Into<NodeId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: RemoteKind::Directory,
            size: None,
            modified: None,
        }
    }

    pub fn file(id: impl Into<NodeId>, name: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: RemoteKind::File,
            size,
            modified: None,
        }
    }

    pub fn link(id: impl Into<NodeId>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: RemoteKind::Link { url: url.into() },
            size: None,
            modified: None,
        }
    }

    pub fn forum(id: impl Into<NodeId>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: RemoteKind::Forum { url: url.into() },
            size: None,
            modified: None,
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }
}

/// Failures reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("remote entity not found: {0}")]
    NotFound(NodeId),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("not supported by this provider: {0}")]
    Unsupported(&'static str),
}

impl ProviderError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_) | ProviderError::Timeout(_) | ProviderError::RateLimited { .. }
        )
    }

    /// Server-provided hint for when to try again
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// An open byte stream for one remote file
///
/// Every source supports sequential reads. Sources that can serve arbitrary
/// byte ranges report so through [`ContentSource::supports_range`], and the
/// handle manager then skips its local buffering entirely.
#[async_trait]
pub trait ContentSource: Send {
    /// Next chunk of the stream, `None` at end of content
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProviderError>;

    fn supports_range(&self) -> bool {
        false
    }

    /// Read up to `len` bytes at `offset`; short or empty past end of content
    async fn read_range(&mut self, _offset: u64, _len: u64) -> Result<Bytes, ProviderError> {
        Err(ProviderError::Unsupported("range reads"))
    }
}

/// Source of the remote hierarchy backing a mount
#[async_trait]
pub trait RemoteTreeProvider: Send + Sync + fmt::Debug + 'static {
    /// Children of a directory, in the provider's display order
    async fn list_children(&self, id: &NodeId) -> Result<Vec<RemoteEntry>, ProviderError>;

    /// Open the content of a file for reading
    async fn open_content(&self, id: &NodeId) -> Result<Box<dyn ContentSource>, ProviderError>;

    /// Size of a file when the listing did not include it
    async fn content_length(&self, _id: &NodeId) -> Result<Option<u64>, ProviderError> {
        Ok(None)
    }

    /// Drop any cached session state so the next call authenticates again
    fn invalidate_session(&self) {}
}
