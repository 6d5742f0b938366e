//! The in-memory node tree mirroring the remote namespace.
//!
//! One global mutex protects every structural field (child maps, parent
//! links, refcounts, tombstone flags). The mutex is only ever held for
//! short critical sections, never across an HTTP round trip or any other
//! await point. Waiting for refcount admission is done on a
//! [`Notify`] that is signalled whenever a reference is released, so
//! blocked operations wake exactly when the exclusion state can have
//! changed.
//!
//! Two reference counters per node implement the asymmetric exclusion
//! between plain IO (read/write/getattr/lookup/readdir, freely parallel)
//! and metadata operations (create/mkdir/remove/rename/truncate, exclusive
//! against IO in their subtree and against other metadata on their
//! root path).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use dav_client::Dnode;
use tokio::sync::Notify;
use tracing::{trace, warn};

use super::cache::DirListing;

/// Inode number; also the node's key in the tree arena.
pub type Ino = u64;

/// The root inode.
pub const ROOT_INO: Ino = 1;

/// Derive a stable inode for `name` under `parent`. FNV-1a over the parent
/// inode and the name bytes; 0 (invalid) and 1 (root) are never produced.
pub fn dynamic_inode(parent: Ino, name: &str) -> Ino {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in parent.to_le_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    if hash <= ROOT_INO {
        hash = hash.wrapping_add(2);
    }
    hash
}

/// One element of the tree. Owned by the arena; linked to its parent and
/// children by inode number, which sidesteps the parent/child ownership
/// cycle.
#[derive(Debug)]
pub struct Node {
    /// Remote metadata snapshot. `dnode.name` is the node's current name
    /// in its parent's child map.
    pub dnode: Dnode,
    /// Last local access time. Not persisted server-side.
    pub atime: SystemTime,
    /// Wall clock of the most recent successful remote stat.
    pub last_stat: Option<SystemTime>,
    /// This node's inode number.
    pub ino: Ino,
    /// Enclosing directory; `None` only for the root.
    pub parent: Option<Ino>,
    /// Child name → inode. Present exactly when this node is a directory.
    pub children: Option<HashMap<String, Ino>>,
    /// Tombstone: once set, every operation on this node fails with
    /// ESTALE. Monotonic.
    pub deleted: bool,
    /// Materialised by a real lookup/create, as opposed to a speculative
    /// readdir entry. Controls eviction in `invalidate`.
    pub in_use: bool,
    /// Whole-listing cache, for directories.
    pub dir_cache: Option<DirListing>,
    io_refs: u32,
    meta_refs: u32,
}

impl Node {
    fn new(ino: Ino, parent: Option<Ino>, dnode: Dnode, in_use: bool) -> Self {
        let children = dnode.is_dir.then(HashMap::new);
        Self {
            dnode,
            atime: SystemTime::UNIX_EPOCH,
            last_stat: None,
            ino,
            parent,
            children,
            deleted: false,
            in_use,
            dir_cache: None,
            io_refs: 0,
            meta_refs: 0,
        }
    }

    /// Size in bytes from the embedded snapshot.
    pub fn size(&self) -> u64 {
        self.dnode.size
    }
}

pub(crate) struct TreeInner {
    pub(crate) nodes: HashMap<Ino, Node>,
}

impl TreeInner {
    /// Any node on the chain from `ino` up to the root (inclusive) holds a
    /// metadata reference.
    fn does_meta(&self, ino: Ino) -> bool {
        let mut cursor = Some(ino);
        while let Some(cur) = cursor {
            match self.nodes.get(&cur) {
                Some(node) => {
                    if node.meta_refs > 0 {
                        return true;
                    }
                    cursor = node.parent;
                }
                None => break,
            }
        }
        false
    }

    /// Any node in the subtree rooted at `ino` (inclusive) holds an IO
    /// reference.
    fn does_io(&self, ino: Ino) -> bool {
        let mut stack = vec![ino];
        while let Some(cur) = stack.pop() {
            let Some(node) = self.nodes.get(&cur) else {
                continue;
            };
            if node.io_refs > 0 {
                return true;
            }
            if let Some(children) = &node.children {
                stack.extend(children.values().copied());
            }
        }
        false
    }

    /// Absolute path of `ino`, `/`-joined from the parent chain.
    pub(crate) fn path_of(&self, ino: Ino) -> Option<String> {
        if ino == ROOT_INO {
            return Some("/".to_owned());
        }
        let mut components = Vec::new();
        let mut cursor = ino;
        loop {
            let node = self.nodes.get(&cursor)?;
            match node.parent {
                Some(parent) => {
                    components.push(node.dnode.name.clone());
                    cursor = parent;
                }
                None => break,
            }
        }
        components.reverse();
        Some(format!("/{}", components.join("/")))
    }

    fn child_ino(&self, parent: Ino, name: &str) -> Option<Ino> {
        self.nodes
            .get(&parent)?
            .children
            .as_ref()?
            .get(name)
            .copied()
    }

    /// Recursively drop children that were never materialised by a real
    /// lookup and have no surviving descendants of their own.
    fn drop_unused_children(&mut self, ino: Ino) {
        let Some(child_inos) = self
            .nodes
            .get(&ino)
            .and_then(|n| n.children.as_ref())
            .map(|c| c.values().copied().collect::<Vec<_>>())
        else {
            return;
        };

        for child in child_inos {
            self.drop_unused_children(child);
            let evict = self.nodes.get(&child).is_some_and(|n| {
                !n.in_use && n.children.as_ref().map_or(true, |c| c.is_empty())
            });
            if evict {
                let name = self.nodes.get(&child).map(|n| n.dnode.name.clone());
                if let (Some(name), Some(parent)) = (name, self.nodes.get_mut(&ino)) {
                    if let Some(children) = parent.children.as_mut() {
                        children.remove(&name);
                    }
                }
                self.nodes.remove(&child);
            }
        }
    }

    fn unlink_from_parent(&mut self, ino: Ino) {
        let Some((parent, name)) = self
            .nodes
            .get(&ino)
            .and_then(|n| n.parent.map(|p| (p, n.dnode.name.clone())))
        else {
            return;
        };
        if let Some(children) = self.nodes.get_mut(&parent).and_then(|p| p.children.as_mut()) {
            // Check the link still points at us before removing it; a
            // rename may have rebound the name in the meantime.
            if children.get(&name) == Some(&ino) {
                children.remove(&name);
            }
        }
    }
}

/// The tree: an arena of nodes behind the global mutex, plus the wakeup
/// channel for refcount admission.
pub struct NodeTree {
    inner: Mutex<TreeInner>,
    refs_released: Notify,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    /// Create a tree holding only the root directory (inode 1).
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let root = Dnode::directory("", SystemTime::UNIX_EPOCH, SystemTime::UNIX_EPOCH);
        nodes.insert(ROOT_INO, Node::new(ROOT_INO, None, root, true));
        Self {
            inner: Mutex::new(TreeInner { nodes }),
            refs_released: Notify::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TreeInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the node, if it exists.
    pub fn with_node<R>(&self, ino: Ino, f: impl FnOnce(&Node) -> R) -> Option<R> {
        let inner = self.lock();
        inner.nodes.get(&ino).map(f)
    }

    /// Run `f` against the node mutably, if it exists.
    pub fn with_node_mut<R>(&self, ino: Ino, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        let mut inner = self.lock();
        inner.nodes.get_mut(&ino).map(f)
    }

    /// Absolute path of `ino`.
    pub fn path_of(&self, ino: Ino) -> Option<String> {
        self.lock().path_of(ino)
    }

    /// Child inode under `parent`, by name.
    pub fn child_of(&self, parent: Ino, name: &str) -> Option<Ino> {
        self.lock().child_ino(parent, name)
    }

    /// Insert or refresh a child of `parent` from a remote snapshot.
    ///
    /// An existing child keeps its inode: the snapshot and `last_stat` are
    /// refreshed and `in_use` is raised when `really` is set. Otherwise a
    /// new node is linked in under `dynamic_inode(parent, name)`.
    pub fn add_node(&self, parent: Ino, dnode: Dnode, really: bool) -> Ino {
        let mut inner = self.lock();
        if let Some(existing) = inner.child_ino(parent, &dnode.name) {
            if let Some(node) = inner.nodes.get_mut(&existing) {
                if really {
                    node.in_use = true;
                }
                node.last_stat = Some(SystemTime::now());
                node.dnode = dnode;
                return existing;
            }
        }

        let ino = dynamic_inode(parent, &dnode.name);
        let name = dnode.name.clone();
        let node = Node::new(ino, Some(parent), dnode, really);
        inner.nodes.insert(ino, node);
        if let Some(children) = inner.nodes.get_mut(&parent).and_then(|p| p.children.as_mut()) {
            children.insert(name, ino);
        }
        trace!(ino, parent, "added node");
        ino
    }

    /// Tombstone the named child of `parent` and unlink it. The node stays
    /// in the arena so outstanding handles observe ESTALE rather than a
    /// missing inode.
    pub fn del_node(&self, parent: Ino, name: &str) {
        let mut inner = self.lock();
        let Some(ino) = inner.child_ino(parent, name) else {
            return;
        };
        if let Some(node) = inner.nodes.get_mut(&ino) {
            node.deleted = true;
        }
        if let Some(children) = inner.nodes.get_mut(&parent).and_then(|p| p.children.as_mut()) {
            children.remove(name);
        }
        trace!(ino, parent, name, "deleted node");
    }

    /// Rebind `old` under `src` to `new` under `dst`, atomically under the
    /// tree lock. An existing node at the destination is tombstoned first.
    pub fn move_node(&self, src: Ino, dst: Ino, old: &str, new: &str) {
        let mut inner = self.lock();

        // Overwritten destination becomes a tombstone.
        if let Some(victim) = inner.child_ino(dst, new) {
            if let Some(node) = inner.nodes.get_mut(&victim) {
                node.deleted = true;
            }
            if let Some(children) = inner.nodes.get_mut(&dst).and_then(|p| p.children.as_mut()) {
                children.remove(new);
            }
        }

        let Some(ino) = inner.child_ino(src, old) else {
            warn!(src, old, "move_node: source vanished");
            return;
        };
        if let Some(children) = inner.nodes.get_mut(&src).and_then(|p| p.children.as_mut()) {
            children.remove(old);
        }
        if let Some(node) = inner.nodes.get_mut(&ino) {
            node.dnode.name = new.to_owned();
            node.parent = Some(dst);
        }
        if let Some(children) = inner.nodes.get_mut(&dst).and_then(|p| p.children.as_mut()) {
            children.insert(new.to_owned(), ino);
        }
        trace!(ino, src, dst, old, new, "moved node");
    }

    /// Kernel-driven GC: unlink from the parent (when still linked) and
    /// drop the node from the arena.
    pub fn forget_node(&self, ino: Ino) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.lock();
        inner.unlink_from_parent(ino);
        inner.nodes.remove(&ino);
    }

    /// Drop speculative descendants of `ino`, then forget `ino` itself
    /// when it is not in use and has no surviving children.
    pub fn invalidate(&self, ino: Ino) {
        let mut inner = self.lock();
        inner.drop_unused_children(ino);
        let forget = ino != ROOT_INO
            && inner.nodes.get(&ino).is_some_and(|n| {
                !n.in_use && n.children.as_ref().map_or(true, |c| c.is_empty())
            });
        if forget {
            inner.unlink_from_parent(ino);
            inner.nodes.remove(&ino);
        }
    }

    /// Admit an IO operation on `ino`: waits until no metadata operation
    /// holds the root path, then raises the IO count.
    pub async fn io_ref(self: &Arc<Self>, ino: Ino) -> IoRef {
        loop {
            let notified = self.refs_released.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.lock();
                if !inner.does_meta(ino) {
                    if let Some(node) = inner.nodes.get_mut(&ino) {
                        node.io_refs += 1;
                    }
                    return IoRef {
                        tree: Arc::clone(self),
                        ino,
                    };
                }
                // Register before releasing the lock so a decrement
                // between unlock and await cannot be missed.
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Admit a metadata operation on `ino`: waits out other metadata
    /// operations on the root path, raises the barrier, then waits for IO
    /// in the subtree to drain. New IO sees the raised barrier and queues.
    pub async fn meta_ref(self: &Arc<Self>, ino: Ino) -> MetaRef {
        // Phase 1: exclusive against other metadata on the root path.
        loop {
            let notified = self.refs_released.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.lock();
                if !inner.does_meta(ino) {
                    if let Some(node) = inner.nodes.get_mut(&ino) {
                        node.meta_refs += 1;
                    }
                    break;
                }
                notified.as_mut().enable();
            }
            notified.await;
        }

        let guard = MetaRef {
            tree: Arc::clone(self),
            ino,
        };

        // Phase 2: wait for in-flight IO below us to finish. The counter
        // is already raised, so no new IO can start in the meantime.
        loop {
            let notified = self.refs_released.notified();
            tokio::pin!(notified);
            {
                let inner = self.lock();
                if !inner.does_io(ino) {
                    return guard;
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    fn release_io(&self, ino: Ino) {
        {
            let mut inner = self.lock();
            if let Some(node) = inner.nodes.get_mut(&ino) {
                node.io_refs = node.io_refs.saturating_sub(1);
            }
        }
        self.refs_released.notify_waiters();
    }

    fn release_meta(&self, ino: Ino) {
        {
            let mut inner = self.lock();
            if let Some(node) = inner.nodes.get_mut(&ino) {
                node.meta_refs = node.meta_refs.saturating_sub(1);
            }
        }
        self.refs_released.notify_waiters();
    }
}

/// RAII admission token for an IO operation. Dropping releases the count
/// and wakes waiters, on every exit path.
pub struct IoRef {
    tree: Arc<NodeTree>,
    ino: Ino,
}

impl Drop for IoRef {
    fn drop(&mut self) {
        self.tree.release_io(self.ino);
    }
}

/// RAII admission token for a metadata operation.
pub struct MetaRef {
    tree: Arc<NodeTree>,
    ino: Ino,
}

impl Drop for MetaRef {
    fn drop(&mut self) {
        self.tree.release_meta(self.ino);
    }
}
