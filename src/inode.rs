//! In-memory representation of one on-server object, and the table that
//! owns every `Inode` reachable from a given graph generation.
//!
//! Grounded on the inode/dentry bookkeeping `glfs-resolve.c` and
//! `glfs.c`'s forget path perform around `inode_link`/`inode_unlink`/
//! `inode_forget`, and on the teacher's `forget_one.rs` idiom of treating
//! "lookup count reaches zero" as the one purge trigger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attr::FileType;
use crate::gfid::{Gfid, ROOT_GFID};
use crate::translator::ContextMap;

/// One in-memory object. Lifetime is governed by a reference count: the
/// longest-lived holder among dentries (parent links), open file
/// descriptors, and in-flight operations keeps it alive.
pub struct Inode {
    gfid: Gfid,
    kind: Mutex<FileType>,
    parent: Mutex<Option<Gfid>>,
    /// Child-name to child-GFID bindings; populated only for directories.
    dentries: Mutex<HashMap<String, Gfid>>,
    refcount: AtomicU32,
    /// Set on creation (or after a graph switch invalidates cached state)
    /// until an explicit `lookup` has confirmed the object still exists on
    /// the current graph generation.
    needs_lookup: AtomicBool,
    context: ContextMap,
}

impl Inode {
    fn new(gfid: Gfid, kind: FileType) -> Arc<Inode> {
        Arc::new(Inode {
            gfid,
            kind: Mutex::new(kind),
            parent: Mutex::new(None),
            dentries: Mutex::new(HashMap::new()),
            refcount: AtomicU32::new(0),
            needs_lookup: AtomicBool::new(true),
            context: ContextMap::new(),
        })
    }

    pub fn gfid(&self) -> Gfid {
        self.gfid
    }

    pub fn kind(&self) -> FileType {
        *self.kind.lock()
    }

    pub fn set_kind(&self, kind: FileType) {
        *self.kind.lock() = kind;
    }

    pub fn parent(&self) -> Option<Gfid> {
        *self.parent.lock()
    }

    pub fn set_parent(&self, parent: Option<Gfid>) {
        *self.parent.lock() = parent;
    }

    /// Snapshot of this directory's children, for `readdir` and for the
    /// resolver's `.`/`..` handling.
    pub fn children(&self) -> Vec<(String, Gfid)> {
        self.dentries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn child(&self, name: &str) -> Option<Gfid> {
        self.dentries.lock().get(name).copied()
    }

    pub fn link_child(&self, name: impl Into<String>, child: Gfid) {
        self.dentries.lock().insert(name.into(), child);
    }

    pub fn unlink_child(&self, name: &str) -> Option<Gfid> {
        self.dentries.lock().remove(name)
    }

    pub fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    fn incref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the refcount after decrementing; `0` means this inode
    /// should be purged from its table.
    fn decref(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn needs_lookup(&self) -> bool {
        self.needs_lookup.load(Ordering::Acquire)
    }

    pub fn clear_needs_lookup(&self) {
        self.needs_lookup.store(false, Ordering::Release);
    }

    pub fn mark_needs_lookup(&self) {
        self.needs_lookup.store(true, Ordering::Release);
    }

    /// Per-translator private state attached to this inode.
    pub fn context(&self) -> &ContextMap {
        &self.context
    }
}

/// Owns every `Inode` known to one graph generation, keyed by GFID.
pub struct InodeTable {
    entries: Mutex<HashMap<Gfid, Arc<Inode>>>,
}

impl InodeTable {
    /// An empty table, pre-seeded with the volume root directory held at
    /// refcount 1 (the table itself is always a holder of the root).
    pub fn new() -> Self {
        let root = Inode::new(ROOT_GFID, FileType::Directory);
        root.incref();
        root.clear_needs_lookup();
        let mut entries = HashMap::new();
        entries.insert(ROOT_GFID, root);
        InodeTable {
            entries: Mutex::new(entries),
        }
    }

    pub fn lookup(&self, gfid: &Gfid) -> Option<Arc<Inode>> {
        self.entries.lock().get(gfid).cloned()
    }

    /// Returns the existing inode for `gfid`, or allocates (but does not
    /// yet ref) a new one of the given type.
    pub fn get_or_create(&self, gfid: Gfid, kind: FileType) -> Arc<Inode> {
        let mut entries = self.entries.lock();
        entries.entry(gfid).or_insert_with(|| Inode::new(gfid, kind)).clone()
    }

    /// Links `child` into `parent`'s dentry table under `name`, taking a
    /// reference on `child` on the child's behalf of this dentry.
    pub fn link(&self, parent: &Gfid, name: &str, child: &Arc<Inode>) {
        if let Some(p) = self.entries.lock().get(parent) {
            p.link_child(name, child.gfid());
        }
        child.set_parent(Some(*parent));
        child.incref();
    }

    /// Removes the `name` dentry from `parent`, dropping the reference it
    /// held on the child, purging the child if that was its last.
    pub fn unlink(&self, parent: &Gfid, name: &str) -> Option<Gfid> {
        let child_gfid = self.entries.lock().get(parent)?.unlink_child(name)?;
        self.forget(&child_gfid, 1);
        Some(child_gfid)
    }

    /// Drops `count` references from `gfid`'s inode (the application
    /// "forgetting" it, or a dentry/FD release), purging the entry once
    /// its refcount reaches zero.
    pub fn forget(&self, gfid: &Gfid, count: u32) {
        let mut entries = self.entries.lock();
        let remaining = if let Some(inode) = entries.get(gfid) {
            let mut r = inode.ref_count();
            for _ in 0..count {
                r = inode.decref();
            }
            Some(r)
        } else {
            None
        };
        if remaining == Some(0) {
            entries.remove(gfid);
        }
    }

    /// Takes an additional reference on an already-known inode (an open
    /// FD, or an in-flight operation holding it alive).
    pub fn reference(&self, gfid: &Gfid) -> Option<Arc<Inode>> {
        let inode = self.entries.lock().get(gfid)?.clone();
        inode.incref();
        Some(inode)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        InodeTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gfid(n: u8) -> Gfid {
        let mut b = [0u8; 16];
        b[15] = n;
        Gfid(b)
    }

    #[test]
    fn root_is_preseeded_at_refcount_one() {
        let table = InodeTable::new();
        let root = table.lookup(&ROOT_GFID).unwrap();
        assert_eq!(root.ref_count(), 1);
        assert_eq!(root.kind(), FileType::Directory);
    }

    #[test]
    fn link_then_forget_purges_entry() {
        let table = InodeTable::new();
        let child = table.get_or_create(gfid(2), FileType::RegularFile);
        table.link(&ROOT_GFID, "a.txt", &child);
        assert_eq!(child.ref_count(), 1);
        assert!(table.lookup(&gfid(2)).is_some());

        table.forget(&gfid(2), 1);
        assert!(table.lookup(&gfid(2)).is_none());
    }

    #[test]
    fn unlink_drops_dentry_and_child_reference() {
        let table = InodeTable::new();
        let child = table.get_or_create(gfid(3), FileType::RegularFile);
        table.link(&ROOT_GFID, "b.txt", &child);
        let root = table.lookup(&ROOT_GFID).unwrap();
        assert_eq!(root.child("b.txt"), Some(gfid(3)));

        table.unlink(&ROOT_GFID, "b.txt");
        assert_eq!(root.child("b.txt"), None);
        assert!(table.lookup(&gfid(3)).is_none());
    }

    #[test]
    fn multiple_dentries_keep_inode_alive_until_all_forgotten() {
        let table = InodeTable::new();
        let child = table.get_or_create(gfid(4), FileType::RegularFile);
        table.link(&ROOT_GFID, "hardlink-a", &child);
        table.link(&ROOT_GFID, "hardlink-b", &child);
        assert_eq!(child.ref_count(), 2);

        table.unlink(&ROOT_GFID, "hardlink-a");
        assert!(table.lookup(&gfid(4)).is_some());

        table.unlink(&ROOT_GFID, "hardlink-b");
        assert!(table.lookup(&gfid(4)).is_none());
    }
}
