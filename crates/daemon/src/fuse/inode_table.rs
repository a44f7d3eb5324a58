//! Bidirectional inode ↔ path mapping for the FUSE binding
//!
//! The core is addressed by path, the kernel by inode number. Inodes are
//! handed out per path and live until the kernel forgets every lookup it
//! was given for them, so a path that disappears upstream and comes back
//! later may get a fresh number.

use std::collections::{HashMap, HashSet};

#[derive(Debug)]
struct Slot {
    path: String,
    /// Lookups the kernel still holds on this inode
    lookups: u64,
}

/// Bidirectional mapping between inodes and mount-relative paths
#[derive(Debug)]
pub struct InodeTable {
    by_path: HashMap<String, u64>,
    slots: HashMap<u64, Slot>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            by_path: HashMap::new(),
            slots: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        table.register_root();
        table
    }

    fn register_root(&mut self) {
        self.by_path.insert("/".to_string(), Self::ROOT_INODE);
        self.slots.insert(
            Self::ROOT_INODE,
            Slot {
                path: "/".to_string(),
                lookups: 0,
            },
        );
    }

    /// Inode for `path`, allocating one if needed, without counting a lookup
    ///
    /// Used for directory listings, which the kernel does not reference-count.
    pub fn assign(&mut self, path: &str) -> u64 {
        let normalized = Self::normalize_path(path);
        if let Some(&inode) = self.by_path.get(&normalized) {
            return inode;
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        self.by_path.insert(normalized.clone(), inode);
        self.slots.insert(
            inode,
            Slot {
                path: normalized,
                lookups: 0,
            },
        );
        inode
    }

    /// Inode for `path`, counting one kernel lookup on it
    pub fn lookup(&mut self, path: &str) -> u64 {
        let inode = self.assign(path);
        if let Some(slot) = self.slots.get_mut(&inode) {
            slot.lookups += 1;
        }
        inode
    }

    /// Drop `nlookup` references; the mapping goes away once none are left
    ///
    /// Returns true if the inode was removed. The root is never removed.
    pub fn forget(&mut self, inode: u64, nlookup: u64) -> bool {
        if inode == Self::ROOT_INODE {
            return false;
        }
        let Some(slot) = self.slots.get_mut(&inode) else {
            return false;
        };
        slot.lookups = slot.lookups.saturating_sub(nlookup);
        if slot.lookups > 0 {
            return false;
        }
        if let Some(slot) = self.slots.remove(&inode) {
            self.by_path.remove(&slot.path);
        }
        true
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.by_path.get(&Self::normalize_path(path)).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.slots.get(&inode).map(|slot| slot.path.as_str())
    }

    /// Path of `name` inside the directory `parent`
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let parent_path = self.get_path(parent)?;
        Some(Self::join(parent_path, name))
    }

    /// Inode of the directory containing `inode` (root for the root)
    pub fn parent_inode(&self, inode: u64) -> u64 {
        self.get_path(inode)
            .map(Self::parent_path)
            .and_then(|parent| self.get_inode(&parent))
            .unwrap_or(Self::ROOT_INODE)
    }

    /// Inodes currently mapped, the root included
    pub fn inode_count(&self) -> usize {
        self.slots.len()
    }

    /// Drop unreferenced children of `parent` missing from its latest listing
    ///
    /// Returns how many inodes were released.
    pub fn retain_listed(&mut self, parent: &str, listed: &HashSet<String>) -> usize {
        let parent = Self::normalize_path(parent);
        self.release_where(|path| {
            Self::parent_path(path) == parent
                && path
                    .rsplit('/')
                    .next()
                    .map_or(true, |name| !listed.contains(name))
        })
    }

    /// Drop every inode the kernel holds no lookup on, the root excepted
    ///
    /// Listings hand out inodes without references; they are reassigned on
    /// the next lookup or listing.
    pub fn prune_unreferenced(&mut self) -> usize {
        self.release_where(|_| true)
    }

    fn release_where(&mut self, mut matches: impl FnMut(&str) -> bool) -> usize {
        let released: Vec<u64> = self
            .slots
            .iter()
            .filter(|(inode, slot)| {
                **inode != Self::ROOT_INODE && slot.lookups == 0 && matches(&slot.path)
            })
            .map(|(inode, _)| *inode)
            .collect();
        for inode in &released {
            if let Some(slot) = self.slots.remove(inode) {
                self.by_path.remove(&slot.path);
            }
        }
        released.len()
    }

    pub fn join(parent: &str, name: &str) -> String {
        if parent == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent, name)
        }
    }

    /// Leading slash, no trailing slash
    fn normalize_path(path: &str) -> String {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return "/".to_string();
        }
        if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        }
    }

    pub fn parent_path(path: &str) -> String {
        let normalized = Self::normalize_path(path);
        match normalized.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(pos) => normalized[..pos].to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_inode() {
        let table = InodeTable::new();
        assert_eq!(table.get_inode("/"), Some(InodeTable::ROOT_INODE));
        assert_eq!(table.get_path(InodeTable::ROOT_INODE), Some("/"));
        assert_eq!(table.parent_inode(InodeTable::ROOT_INODE), InodeTable::ROOT_INODE);
    }

    #[test]
    fn test_same_path_same_inode() {
        let mut table = InodeTable::new();
        let a = table.lookup("/Lecture Notes");
        let b = table.assign("/Lecture Notes/");
        let c = table.lookup("/syllabus.pdf");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, InodeTable::ROOT_INODE);
    }

    #[test]
    fn test_child_and_parent() {
        let mut table = InodeTable::new();
        let dir = table.lookup("/Lecture Notes");
        let path = table.child_path(dir, "week1.pdf").unwrap();
        assert_eq!(path, "/Lecture Notes/week1.pdf");

        let file = table.lookup(&path);
        assert_eq!(table.parent_inode(file), dir);
        assert_eq!(table.child_path(InodeTable::ROOT_INODE, "a").unwrap(), "/a");
        assert!(table.child_path(999, "a").is_none());
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(InodeTable::parent_path("/"), "/");
        assert_eq!(InodeTable::parent_path("/foo"), "/");
        assert_eq!(InodeTable::parent_path("/foo/bar/"), "/foo");
    }

    #[test]
    fn test_forget_counts_lookups() {
        let mut table = InodeTable::new();
        let inode = table.lookup("/syllabus.pdf");
        table.lookup("/syllabus.pdf");

        assert!(!table.forget(inode, 1));
        assert_eq!(table.get_path(inode), Some("/syllabus.pdf"));
        assert!(table.forget(inode, 1));
        assert!(table.get_path(inode).is_none());
        assert!(table.get_inode("/syllabus.pdf").is_none());

        assert!(!table.forget(InodeTable::ROOT_INODE, 10));
        assert!(table.get_path(InodeTable::ROOT_INODE).is_some());
    }

    #[test]
    fn test_listing_drops_vanished_entries() {
        let mut table = InodeTable::new();
        let notes = table.lookup("/Lecture Notes");
        table.assign("/Lecture Notes/week1.pdf");
        let held = table.lookup("/Lecture Notes/week2.pdf");
        table.assign("/Lecture Notes/week3.pdf");
        table.assign("/syllabus.pdf");

        let listed: HashSet<String> = ["week1.pdf".to_string()].into_iter().collect();
        assert_eq!(table.retain_listed("/Lecture Notes", &listed), 1);

        assert!(table.get_inode("/Lecture Notes/week1.pdf").is_some());
        assert!(table.get_inode("/Lecture Notes/week3.pdf").is_none());
        // Still referenced by the kernel, or outside the listed directory
        assert_eq!(table.get_path(held), Some("/Lecture Notes/week2.pdf"));
        assert!(table.get_inode("/syllabus.pdf").is_some());
        assert_eq!(table.get_path(notes), Some("/Lecture Notes"));
    }

    #[test]
    fn test_prune_keeps_referenced_and_root() {
        let mut table = InodeTable::new();
        let held = table.lookup("/Lecture Notes");
        for i in 0..1000 {
            table.assign(&format!("/Lecture Notes/file{}.pdf", i));
        }
        assert_eq!(table.inode_count(), 1002);

        assert_eq!(table.prune_unreferenced(), 1000);
        assert_eq!(table.inode_count(), 2);
        assert_eq!(table.get_path(held), Some("/Lecture Notes"));
        assert_eq!(table.get_inode("/"), Some(InodeTable::ROOT_INODE));

        // A pruned path gets a fresh inode when seen again
        let again = table.assign("/Lecture Notes/file7.pdf");
        assert_eq!(table.get_path(again), Some("/Lecture Notes/file7.pdf"));
    }
}
