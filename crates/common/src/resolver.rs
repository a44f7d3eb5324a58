//! Path resolution against the node cache
//!
//! Paths are always relative to the mount root. Each segment populates the
//! current directory on demand (first visit or stale listing) before the
//! child is looked up, so resolution is where remote fetches happen.

use std::sync::Arc;

use crate::cache::{CacheError, NodeCache};
use crate::node::{FetchState, Node, NodePin};
use crate::provider::ProviderError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("upstream unavailable while resolving {path}: {source}")]
    UpstreamUnavailable { path: String, source: ProviderError },
}

impl ResolveError {
    fn from_cache(err: CacheError, path: &str) -> Self {
        match err {
            CacheError::NotFound { .. } => ResolveError::NotFound(path.to_string()),
            CacheError::NotADirectory(_) => ResolveError::NotADirectory(path.to_string()),
            CacheError::Upstream(source) => ResolveError::UpstreamUnavailable {
                path: path.to_string(),
                source,
            },
        }
    }
}

/// Maps mount-relative paths to cache nodes
#[derive(Debug, Clone)]
pub struct PathResolver {
    cache: NodeCache,
}

impl PathResolver {
    pub fn new(cache: NodeCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    /// Resolve `path` to its node, fetching listings along the way
    pub async fn resolve(&self, path: &str) -> Result<Arc<Node>, ResolveError> {
        self.resolve_pinned(path).await.map(NodePin::into_node)
    }

    /// Resolve `path`, keeping the final node pinned against eviction
    ///
    /// Every node on the way stays pinned while the walk is past it, so an
    /// eviction pass running concurrently cannot drop the lookup's ancestors.
    pub async fn resolve_pinned(&self, path: &str) -> Result<NodePin, ResolveError> {
        let mut current = NodePin::new(self.cache.root().clone());
        current.touch();
        let mut walked = String::new();

        for segment in Self::segments(path) {
            match segment {
                "." => continue,
                ".." => {
                    if let Some(parent) = current.parent() {
                        current = NodePin::new(parent);
                    }
                    walked = parent_path(&walked);
                    continue;
                }
                _ => {}
            }

            if !current.is_dir() {
                return Err(ResolveError::NotADirectory(display(&walked)));
            }

            walked.push('/');
            walked.push_str(segment);

            self.cache
                .populate(&current)
                .await
                .map_err(|err| ResolveError::from_cache(err, &walked))?;

            let child = self
                .child_of(&current, segment)
                .await
                .map_err(|err| ResolveError::from_cache(err, &walked))?;
            current = child;
        }

        Ok(current)
    }

    /// Pin `name` under the populated directory `parent`
    ///
    /// An eviction pass may drop an idle child after `populate` returned and
    /// before it is pinned; the parent is then stale and listed again once.
    pub async fn child_of(&self, parent: &Arc<Node>, name: &str) -> Result<NodePin, CacheError> {
        match self.cache.pin_child(parent, name) {
            Err(CacheError::NotFound { .. }) if parent.fetch_state() == FetchState::Stale => {
                tracing::debug!(node = %parent.id(), name, "child evicted during lookup, listing again");
                self.cache.populate(parent).await?;
                self.cache.pin_child(parent, name)
            }
            result => result,
        }
    }

    /// Path segments, with empty segments (leading, doubled or trailing
    /// slashes) dropped
    pub fn segments(path: &str) -> impl Iterator<Item = &str> {
        path.split('/').filter(|segment| !segment.is_empty())
    }
}

fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) => path[..pos].to_string(),
        None => String::new(),
    }
}

fn display(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::node::NodeKind;
    use crate::provider::{MemoryProvider, NodeId, RemoteEntry};
    use std::time::Duration;

    fn setup() -> (Arc<MemoryProvider>, PathResolver) {
        let provider = Arc::new(MemoryProvider::new());
        provider.set_children(
            "crs_1",
            vec![
                RemoteEntry::directory("fold_1", "Lecture Notes"),
                RemoteEntry::file("file_1", "syllabus.pdf", Some(2048)),
            ],
        );
        provider.set_children(
            "fold_1",
            vec![RemoteEntry::file("file_2", "week1.pdf", Some(10))],
        );
        let cache = NodeCache::new(provider.clone(), NodeId::course(1), CacheConfig::default());
        (provider, PathResolver::new(cache))
    }

    #[tokio::test]
    async fn test_empty_path_is_root() {
        let (provider, resolver) = setup();

        for path in ["", "/", "//"] {
            let node = resolver.resolve(path).await.unwrap();
            assert!(Arc::ptr_eq(&node, resolver.cache().root()));
        }
        // Resolving the root alone fetches nothing
        assert_eq!(provider.list_calls(&"crs_1".into()), 0);
    }

    #[tokio::test]
    async fn test_nested_path_and_trailing_slash() {
        let (_, resolver) = setup();

        let file = resolver.resolve("/Lecture Notes/week1.pdf").await.unwrap();
        assert_eq!(file.kind(), NodeKind::File);
        assert_eq!(file.id().as_str(), "file_2");

        let dir = resolver.resolve("/Lecture Notes/").await.unwrap();
        assert_eq!(dir.id().as_str(), "fold_1");
    }

    #[tokio::test]
    async fn test_dot_segments() {
        let (_, resolver) = setup();

        let node = resolver
            .resolve("/Lecture Notes/./../syllabus.pdf")
            .await
            .unwrap();
        assert_eq!(node.id().as_str(), "file_1");

        let root = resolver.resolve("/..").await.unwrap();
        assert!(Arc::ptr_eq(&root, resolver.cache().root()));
    }

    #[tokio::test]
    async fn test_not_found_and_not_a_directory() {
        let (_, resolver) = setup();

        match resolver.resolve("/missing.txt").await {
            Err(ResolveError::NotFound(path)) => assert_eq!(path, "/missing.txt"),
            other => panic!("expected NotFound, got {:?}", other),
        }

        match resolver.resolve("/syllabus.pdf/inner").await {
            Err(ResolveError::NotADirectory(path)) => assert_eq!(path, "/syllabus.pdf"),
            other => panic!("expected NotADirectory, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provider_failure_is_upstream_unavailable() {
        let (provider, resolver) = setup();
        provider.fail_next("crs_1", ProviderError::Auth("expired".into()));

        match resolver.resolve("/syllabus.pdf").await {
            Err(ResolveError::UpstreamUnavailable { source, .. }) => {
                assert!(matches!(source, ProviderError::Auth(_)))
            }
            other => panic!("expected UpstreamUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exact_byte_match() {
        let (_, resolver) = setup();
        assert!(matches!(
            resolver.resolve("/lecture notes").await,
            Err(ResolveError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_evicted_between_populate_and_pin() {
        let provider = Arc::new(MemoryProvider::new());
        provider.set_children(
            "crs_1",
            vec![RemoteEntry::file("file_1", "syllabus.pdf", Some(2048))],
        );
        let config = CacheConfig {
            ttl: Duration::from_secs(3600),
            idle_evict: Duration::from_secs(10),
            ..CacheConfig::default()
        };
        let cache = NodeCache::new(provider.clone(), NodeId::course(1), config);
        let resolver = PathResolver::new(cache);
        let root = resolver.cache().root().clone();

        resolver.resolve("/syllabus.pdf").await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        // Same steps as one resolve segment, with an eviction pass in between
        resolver.cache().populate(&root).await.unwrap();
        assert_eq!(provider.list_calls(&"crs_1".into()), 1);
        assert_eq!(resolver.cache().evict_idle(), 1);

        let pin = resolver.child_of(&root, "syllabus.pdf").await.unwrap();
        assert_eq!(pin.node().id().as_str(), "file_1");
        assert_eq!(provider.list_calls(&"crs_1".into()), 2);
    }

    #[tokio::test]
    async fn test_missing_child_of_fresh_parent_is_not_refetched() {
        let (provider, resolver) = setup();
        let root = resolver.cache().root().clone();
        resolver.cache().populate(&root).await.unwrap();

        assert!(matches!(
            resolver.child_of(&root, "missing.txt").await,
            Err(CacheError::NotFound { .. })
        ));
        assert_eq!(provider.list_calls(&"crs_1".into()), 1);
    }

    #[tokio::test]
    async fn test_pinned_resolution_holds_pin() {
        let (_, resolver) = setup();
        let pin = resolver.resolve_pinned("/Lecture Notes").await.unwrap();
        assert!(pin.node().subtree_in_use());
        let node = pin.into_node();
        assert!(!node.subtree_in_use());
    }
}
