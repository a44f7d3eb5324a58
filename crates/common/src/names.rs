//! Exposed names for remote entries
//!
//! Remote display names are not filesystem names: they may contain path
//! separators or NUL bytes, be empty, or collide with a sibling. Names are
//! rewritten deterministically here; the cache keys children by the
//! rewritten name and keeps the remote name on the node, so resolution
//! never has to reverse the mapping by hand.

use std::collections::HashSet;
use std::path::Path;

use crate::provider::{RemoteEntry, RemoteKind};

/// Replacement for characters that cannot appear in a file name
pub const REPLACEMENT: char = '_';

/// Rewrite a remote name into a legal file name
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\0' { REPLACEMENT } else { c })
        .collect();

    match cleaned.as_str() {
        "" => REPLACEMENT.to_string(),
        "." | ".." => format!("{}{}", REPLACEMENT, cleaned),
        _ => cleaned,
    }
}

/// Name a remote entry is exposed under, before sibling disambiguation
pub fn display_name(entry: &RemoteEntry) -> String {
    match &entry.kind {
        RemoteKind::Link { .. } => sanitize(&format!("Link - {}", entry.name)),
        RemoteKind::Forum { .. } => sanitize(&format!("Forum - {}", entry.name)),
        RemoteKind::Directory | RemoteKind::File => sanitize(&entry.name),
    }
}

/// Hands out unique sibling names in listing order
///
/// The first entry with a given name keeps it. Later duplicates get a
/// numeric suffix starting at 2 (`notes-2.pdf`, `notes-3.pdf`), inserted
/// before the extension for files. Suffixes skip names already taken, so
/// the outcome only depends on the order of the listing.
#[derive(Debug, Default)]
pub struct NameAllocator {
    taken: HashSet<String>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, name: &str, keep_extension: bool) -> String {
        if self.taken.insert(name.to_string()) {
            return name.to_string();
        }

        let (stem, ext) = if keep_extension {
            split_extension(name)
        } else {
            (name, None)
        };

        let mut counter = 2u64;
        loop {
            let candidate = match ext {
                Some(ext) => format!("{}-{}.{}", stem, counter, ext),
                None => format!("{}-{}", stem, counter),
            };
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            counter += 1;
        }
    }
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    let path = Path::new(name);
    match (
        path.file_stem().and_then(|s| s.to_str()),
        path.extension().and_then(|e| e.to_str()),
    ) {
        (Some(stem), Some(ext)) => (stem, Some(ext)),
        _ => (name, None),
    }
}
