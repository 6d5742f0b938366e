//! Attribute freshness and directory listing caches.
//!
//! Two windows govern how long locally cached metadata is trusted: a short
//! one for individual stat results and a longer one for whole-directory
//! listings. The kernel-facing TTLs are hints only and live here so all
//! cache timing sits in one place.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use dav_client::Dnode;

use super::node::{Ino, NodeTree};

/// How long a successful remote stat stays authoritative.
pub const STAT_CACHE_TIME: Duration = Duration::from_secs(1);

/// How long a whole-directory listing may answer lookups.
pub const DIR_CACHE_TIME: Duration = Duration::from_secs(10);

/// Attribute TTL reported to the kernel.
pub const ATTR_VALID_TIME: Duration = Duration::from_secs(60);

/// Directory entry TTL reported to the kernel.
pub const ENTRY_VALID_TIME: Duration = Duration::from_secs(60);

/// Snapshot of a directory's children, taken atomically by one readdir.
#[derive(Debug, Clone)]
pub struct DirListing {
    entries: HashMap<String, Dnode>,
    taken_at: SystemTime,
}

impl DirListing {
    pub fn new(entries: impl IntoIterator<Item = Dnode>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            taken_at: SystemTime::now(),
        }
    }

    fn fresh(&self) -> bool {
        SystemTime::now()
            .duration_since(self.taken_at)
            .map_or(false, |age| age < DIR_CACHE_TIME)
    }

    fn get(&self, name: &str) -> Option<Dnode> {
        self.entries.get(name).cloned()
    }
}

/// Answer from a directory's listing cache, dropping it when stale.
fn listing_lookup(dir: &mut crate::fs::node::Node, name: &str) -> Option<Dnode> {
    let listing = dir.dir_cache.as_ref()?;
    if !listing.fresh() {
        dir.dir_cache = None;
        return None;
    }
    listing.get(name)
}

fn stat_fresh(last_stat: Option<SystemTime>) -> bool {
    last_stat.is_some_and(|t| {
        SystemTime::now()
            .duration_since(t)
            .map_or(false, |age| age < STAT_CACHE_TIME)
    })
}

impl NodeTree {
    /// A still-authoritative snapshot of a child, by name: a fresh child
    /// node first, then this directory's listing cache. Lookup's shortcut;
    /// getattr never answers from a listing.
    pub fn cached_child(&self, parent: Ino, name: &str) -> Option<Dnode> {
        let mut inner = self.lock();
        let dir = inner.nodes.get(&parent)?;
        if let Some(&child) = dir.children.as_ref().and_then(|c| c.get(name)) {
            if let Some(node) = inner.nodes.get(&child) {
                if stat_fresh(node.last_stat) {
                    return Some(node.dnode.clone());
                }
            }
        }
        listing_lookup(inner.nodes.get_mut(&parent)?, name)
    }

    /// Replace the directory's listing cache with a fresh snapshot.
    pub fn store_listing(&self, ino: Ino, entries: impl IntoIterator<Item = Dnode>) {
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(&ino) {
            node.dir_cache = Some(DirListing::new(entries));
        }
    }

    /// Drop the directory's listing cache (after any namespace mutation).
    pub fn clear_listing(&self, ino: Ino) {
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(&ino) {
            node.dir_cache = None;
        }
    }

    /// Whether the node's own stat is still inside the freshness window.
    pub fn stat_fresh(&self, ino: Ino) -> bool {
        self.with_node(ino, |n| stat_fresh(n.last_stat))
            .unwrap_or(false)
    }

    /// Record a successful remote stat of `ino` at the current instant.
    pub fn touch_last_stat(&self, ino: Ino) {
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(&ino) {
            node.last_stat = Some(SystemTime::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::node::ROOT_INO;
    use std::time::UNIX_EPOCH;

    fn file(name: &str, size: u64) -> Dnode {
        Dnode {
            name: name.to_owned(),
            target: None,
            is_dir: false,
            is_link: false,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            size,
        }
    }

    #[test]
    fn stat_window_opens_on_add_and_closes_on_expiry() {
        let tree = NodeTree::new();
        let f = tree.add_node(ROOT_INO, file("f", 5), true);
        // add_node stamps last_stat.
        assert!(tree.stat_fresh(f));
        tree.with_node_mut(f, |n| n.last_stat = None).unwrap();
        assert!(!tree.stat_fresh(f));
    }

    #[test]
    fn stale_child_lookup_falls_back_to_parent_listing() {
        let tree = NodeTree::new();
        let f = tree.add_node(ROOT_INO, file("f", 5), true);
        tree.with_node_mut(f, |n| n.last_stat = None).unwrap();

        assert!(tree.cached_child(ROOT_INO, "f").is_none());

        tree.store_listing(ROOT_INO, [file("f", 9)]);
        let cached = tree.cached_child(ROOT_INO, "f").unwrap();
        assert_eq!(cached.size, 9);
    }

    #[test]
    fn listing_answers_lookups_for_unmaterialized_names() {
        let tree = NodeTree::new();
        tree.store_listing(ROOT_INO, [file("ghost", 3)]);
        let cached = tree.cached_child(ROOT_INO, "ghost").unwrap();
        assert_eq!(cached.size, 3);
        assert!(tree.cached_child(ROOT_INO, "missing").is_none());
    }

    #[test]
    fn cleared_listing_stops_answering() {
        let tree = NodeTree::new();
        tree.store_listing(ROOT_INO, [file("f", 1)]);
        tree.clear_listing(ROOT_INO);
        assert!(tree.cached_child(ROOT_INO, "f").is_none());
    }
}
