//! JSON shapes spoken by the ILIAS gateway

use chrono::{DateTime, Utc};
use common::provider::{NodeId, ProviderError, RemoteEntry, RemoteKind};
use serde::{Deserialize, Serialize};

/// Body of `GET api/v0/tree/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeResponse {
    pub children: Vec<WireEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    Directory,
    File,
    Link,
    Forum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEntry {
    pub id: String,
    pub name: String,
    pub kind: WireKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl TryFrom<WireEntry> for RemoteEntry {
    type Error = ProviderError;

    fn try_from(entry: WireEntry) -> Result<Self, Self::Error> {
        let kind = match (entry.kind, entry.url) {
            (WireKind::Directory, _) => RemoteKind::Directory,
            (WireKind::File, _) => RemoteKind::File,
            (WireKind::Link, Some(url)) => RemoteKind::Link { url },
            (WireKind::Forum, Some(url)) => RemoteKind::Forum { url },
            (WireKind::Link | WireKind::Forum, None) => {
                return Err(ProviderError::Network(format!(
                    "gateway sent {} without a url",
                    entry.id
                )))
            }
        };
        Ok(RemoteEntry {
            id: NodeId::new(entry.id),
            name: entry.name,
            kind,
            size: entry.size,
            modified: entry.modified,
        })
    }
}
