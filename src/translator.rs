//! The `Translator` capability set every node in a request-processing graph
//! implements, plus a minimal in-memory translator used to exercise the
//! pipeline end-to-end in tests.
//!
//! Grounded on `glfs-fops.c`'s operation shapes (translated from the
//! kernel-inode-based calls a POSIX fop takes to the GFID-based calls this
//! crate's graph forwards) and on the teacher's `Filesystem` trait in
//! `lib.rs` for the overall "one method per operation, default behavior for
//! anything a given node doesn't care about" shape.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::attr::{Iatt, SetAttr};
use crate::errno::{Errno, Result};
use crate::gfid::Gfid;
use crate::task::Wait;

/// One request a translator graph forwards down the stack. Each variant
/// carries GFID-addressed arguments rather than raw pathnames: resolution
/// into GFIDs has already happened by the time an `Operation` is built (see
/// `src/resolve.rs`).
#[derive(Clone, Debug)]
pub enum Operation {
    Lookup { parent: Gfid, name: String },
    Create { parent: Gfid, name: String, mode: u32, gfid_hint: Option<Gfid> },
    Mkdir { parent: Gfid, name: String, mode: u32 },
    Unlink { parent: Gfid, name: String },
    Rmdir { parent: Gfid, name: String },
    Rename { old_parent: Gfid, old_name: String, new_parent: Gfid, new_name: String },
    Link { target: Gfid, new_parent: Gfid, new_name: String },
    Symlink { parent: Gfid, name: String, target: String },
    Readlink { gfid: Gfid },
    Open { gfid: Gfid, flags: i32 },
    Read { gfid: Gfid, offset: u64, size: u32 },
    Write { gfid: Gfid, offset: u64, data: Vec<u8> },
    Flush { gfid: Gfid },
    Fsync { gfid: Gfid, data_only: bool },
    Getattr { gfid: Gfid },
    Setattr { gfid: Gfid, attr: SetAttr },
    Readdir { gfid: Gfid, offset: u64 },
    Statfs,
    Getxattr { gfid: Gfid, name: String },
    Setxattr { gfid: Gfid, name: String, value: Vec<u8> },
    Removexattr { gfid: Gfid, name: String },
    Fallocate { gfid: Gfid, offset: u64, len: u64 },
    Discard { gfid: Gfid, offset: u64, len: u64 },
    ChildUp,
    ParentDown,
}

/// One directory entry as returned by `Readdir`.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub gfid: Gfid,
    pub attr: Iatt,
    pub offset: u64,
}

/// Filesystem-wide space usage, as returned by `Statfs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatVfs {
    pub block_size: u64,
    pub blocks_total: u64,
    pub blocks_free: u64,
    pub files_total: u64,
    pub files_free: u64,
}

/// A translator's answer to one [`Operation`].
#[derive(Clone, Debug)]
pub enum OperationReply {
    Looked { gfid: Gfid, attr: Iatt },
    Attr(Iatt),
    Data(Vec<u8>),
    Written(u32),
    Entries(Vec<DirEntry>),
    Xattr(Vec<u8>),
    Statfs(StatVfs),
    Unit,
}

/// Event delivered via `Translator::notify`, mirroring the `ChildUp` /
/// `ParentDown` protocol the graph lifecycle relies on (§4.4).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotifyEvent {
    ChildUp,
    ChildDown,
    ParentDown,
}

/// A type-erased, per-translator slot for private state attached to an
/// `Inode` or `Fd`. Every translator keys its own state off its own type,
/// so two translators never collide even though they share one map.
#[derive(Default)]
pub struct ContextMap {
    slots: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl ContextMap {
    pub fn new() -> Self {
        ContextMap::default()
    }

    /// Runs `init` to populate this translator's slot if it is empty, then
    /// runs `with` against the (now certainly present) value.
    pub fn get_or_insert_with<T, R>(&self, init: impl FnOnce() -> T, with: impl FnOnce(&mut T) -> R) -> R
    where
        T: Any + Send + Sync + Default,
    {
        let mut slots = self.slots.lock();
        let entry = slots
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(init()));
        let value = entry.downcast_mut::<T>().expect("context type mismatch");
        with(value)
    }

    /// Drops the slot for `T`, if any was set.
    pub fn clear<T: Any + Send + Sync>(&self) {
        self.slots.lock().remove(&TypeId::of::<T>());
    }
}

/// A node in the request-processing graph. The top translator ("mount") is
/// a placeholder that traps `forget`/`release`/`releasedir` to keep the
/// `Fs` context's inode and FD tables in sync; every other node forwards
/// (and may transform) operations toward its children.
pub trait Translator: Send + Sync {
    /// Name as it would appear in a volfile, for logging.
    fn name(&self) -> &str;

    /// Forwards `op` to this translator (and, for composite translators,
    /// onward to children), returning a suspension point for the reply.
    fn forward(&self, op: Operation) -> Wait<Result<OperationReply>>;

    /// Delivers an out-of-band lifecycle event (child-up at graph
    /// activation, parent-down at teardown).
    fn notify(&self, event: NotifyEvent);

    /// Runs once when this translator's subgraph is first activated.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Runs once when this translator's subgraph is torn down.
    fn fini(&self) {}
}

pub mod memory_brick {
    //! A minimal in-memory "brick" translator: just enough state (a flat
    //! GFID-keyed inode table with parent/child dentries and file bytes)
    //! to let `ops.rs`'s pipeline run end to end in tests, analogous to
    //! the teacher's `examples/simple` in-memory filesystem.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;

    use super::{DirEntry, NotifyEvent, Operation, OperationReply, StatVfs, Translator};
    use crate::attr::{FileType, Iatt};
    use crate::errno::{Errno, Result};
    use crate::gfid::Gfid;
    use crate::task::{wait_pair, Wait};

    struct Entry {
        attr: Iatt,
        data: Vec<u8>,
        children: HashMap<String, Gfid>,
        symlink_target: Option<String>,
    }

    pub struct MemoryBrick {
        name: String,
        entries: Mutex<HashMap<Gfid, Entry>>,
        next_id: AtomicU64,
    }

    impl MemoryBrick {
        pub fn new(name: impl Into<String>) -> Self {
            let mut entries = HashMap::new();
            entries.insert(
                crate::gfid::ROOT_GFID,
                Entry {
                    attr: Iatt::zeroed(crate::gfid::ROOT_GFID, FileType::Directory),
                    data: Vec::new(),
                    children: HashMap::new(),
                    symlink_target: None,
                },
            );
            MemoryBrick {
                name: name.into(),
                entries: Mutex::new(entries),
                next_id: AtomicU64::new(2),
            }
        }

        fn alloc_gfid(&self) -> Gfid {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            let mut bytes = [0u8; 16];
            bytes[8..16].copy_from_slice(&n.to_be_bytes());
            Gfid(bytes)
        }

        fn handle(&self, op: Operation) -> Result<OperationReply> {
            let mut entries = self.entries.lock();
            match op {
                // An empty name is the GFID-based lookup convention
                // `object.rs`'s slow path uses after a graph switch: resolve
                // `parent` directly as the target's own GFID rather than as
                // a directory to search.
                Operation::Lookup { parent, name } if name.is_empty() => {
                    let attr = entries.get(&parent).ok_or(Errno::Stale)?.attr;
                    Ok(OperationReply::Looked { gfid: parent, attr })
                }
                Operation::Lookup { parent, name } => {
                    let child = *entries
                        .get(&parent)
                        .ok_or(Errno::NoEnt)?
                        .children
                        .get(&name)
                        .ok_or(Errno::NoEnt)?;
                    let attr = entries.get(&child).ok_or(Errno::Stale)?.attr;
                    Ok(OperationReply::Looked { gfid: child, attr })
                }
                Operation::Create { parent, name, mode, gfid_hint } => {
                    if entries.get(&parent).ok_or(Errno::NoEnt)?.children.contains_key(&name) {
                        return Err(Errno::Exist);
                    }
                    let gfid = gfid_hint.unwrap_or_else(|| self.alloc_gfid());
                    let mut attr = Iatt::zeroed(gfid, FileType::RegularFile);
                    attr.perm = mode as u16;
                    entries.insert(
                        gfid,
                        Entry { attr, data: Vec::new(), children: HashMap::new(), symlink_target: None },
                    );
                    entries.get_mut(&parent).unwrap().children.insert(name, gfid);
                    Ok(OperationReply::Looked { gfid, attr })
                }
                Operation::Mkdir { parent, name, mode } => {
                    if entries.get(&parent).ok_or(Errno::NoEnt)?.children.contains_key(&name) {
                        return Err(Errno::Exist);
                    }
                    let gfid = self.alloc_gfid();
                    let mut attr = Iatt::zeroed(gfid, FileType::Directory);
                    attr.perm = mode as u16;
                    entries.insert(
                        gfid,
                        Entry { attr, data: Vec::new(), children: HashMap::new(), symlink_target: None },
                    );
                    entries.get_mut(&parent).unwrap().children.insert(name, gfid);
                    Ok(OperationReply::Looked { gfid, attr })
                }
                Operation::Unlink { parent, name } | Operation::Rmdir { parent, name } => {
                    let gfid = entries
                        .get_mut(&parent)
                        .ok_or(Errno::NoEnt)?
                        .children
                        .remove(&name)
                        .ok_or(Errno::NoEnt)?;
                    entries.remove(&gfid);
                    Ok(OperationReply::Unit)
                }
                Operation::Rename { old_parent, old_name, new_parent, new_name } => {
                    let gfid = entries
                        .get_mut(&old_parent)
                        .ok_or(Errno::NoEnt)?
                        .children
                        .remove(&old_name)
                        .ok_or(Errno::NoEnt)?;
                    entries.get_mut(&new_parent).ok_or(Errno::NoEnt)?.children.insert(new_name, gfid);
                    Ok(OperationReply::Unit)
                }
                Operation::Link { target, new_parent, new_name } => {
                    if !entries.contains_key(&target) {
                        return Err(Errno::NoEnt);
                    }
                    entries.get_mut(&new_parent).ok_or(Errno::NoEnt)?.children.insert(new_name, target);
                    if let Some(e) = entries.get_mut(&target) {
                        e.attr.nlink += 1;
                    }
                    let attr = entries.get(&target).unwrap().attr;
                    Ok(OperationReply::Looked { gfid: target, attr })
                }
                Operation::Symlink { parent, name, target } => {
                    let gfid = self.alloc_gfid();
                    let attr = Iatt::zeroed(gfid, FileType::Symlink);
                    entries.insert(
                        gfid,
                        Entry { attr, data: Vec::new(), children: HashMap::new(), symlink_target: Some(target) },
                    );
                    entries.get_mut(&parent).ok_or(Errno::NoEnt)?.children.insert(name, gfid);
                    Ok(OperationReply::Looked { gfid, attr })
                }
                Operation::Readlink { gfid } => {
                    let target = entries
                        .get(&gfid)
                        .ok_or(Errno::Stale)?
                        .symlink_target
                        .clone()
                        .ok_or(Errno::Invalid)?;
                    Ok(OperationReply::Data(target.into_bytes()))
                }
                Operation::Open { gfid, .. } => {
                    entries.get(&gfid).ok_or(Errno::Stale)?;
                    Ok(OperationReply::Unit)
                }
                Operation::Read { gfid, offset, size } => {
                    let e = entries.get(&gfid).ok_or(Errno::Stale)?;
                    let start = (offset as usize).min(e.data.len());
                    let end = (start + size as usize).min(e.data.len());
                    Ok(OperationReply::Data(e.data[start..end].to_vec()))
                }
                Operation::Write { gfid, offset, data } => {
                    let e = entries.get_mut(&gfid).ok_or(Errno::Stale)?;
                    let end = offset as usize + data.len();
                    if e.data.len() < end {
                        e.data.resize(end, 0);
                    }
                    e.data[offset as usize..end].copy_from_slice(&data);
                    e.attr.size = e.data.len() as u64;
                    Ok(OperationReply::Written(data.len() as u32))
                }
                Operation::Flush { .. } | Operation::Fsync { .. } => Ok(OperationReply::Unit),
                Operation::Getattr { gfid } => {
                    Ok(OperationReply::Attr(entries.get(&gfid).ok_or(Errno::Stale)?.attr))
                }
                Operation::Setattr { gfid, attr } => {
                    let e = entries.get_mut(&gfid).ok_or(Errno::Stale)?;
                    if let Some(mode) = attr.mode {
                        e.attr.perm = mode as u16;
                    }
                    if let Some(uid) = attr.uid {
                        e.attr.uid = uid;
                    }
                    if let Some(gid) = attr.gid {
                        e.attr.gid = gid;
                    }
                    if let Some(size) = attr.size {
                        e.data.resize(size as usize, 0);
                        e.attr.size = size;
                    }
                    Ok(OperationReply::Attr(e.attr))
                }
                Operation::Readdir { gfid, offset } => {
                    let e = entries.get(&gfid).ok_or(Errno::Stale)?;
                    let mut out = Vec::new();
                    for (i, (name, child)) in e.children.iter().enumerate() {
                        if (i as u64) < offset {
                            continue;
                        }
                        if let Some(child_entry) = entries.get(child) {
                            out.push(DirEntry {
                                name: name.clone(),
                                gfid: *child,
                                attr: child_entry.attr,
                                offset: i as u64 + 1,
                            });
                        }
                    }
                    Ok(OperationReply::Entries(out))
                }
                Operation::Statfs => Ok(OperationReply::Statfs(StatVfs {
                    block_size: 4096,
                    blocks_total: 1 << 20,
                    blocks_free: 1 << 19,
                    files_total: 1 << 16,
                    files_free: 1 << 15,
                })),
                Operation::Getxattr { .. } => Err(Errno::NoData),
                Operation::Setxattr { .. } | Operation::Removexattr { .. } => Ok(OperationReply::Unit),
                Operation::Fallocate { gfid, offset, len } => {
                    let e = entries.get_mut(&gfid).ok_or(Errno::Stale)?;
                    let end = (offset + len) as usize;
                    if e.data.len() < end {
                        e.data.resize(end, 0);
                    }
                    Ok(OperationReply::Unit)
                }
                Operation::Discard { gfid, offset, len } => {
                    let e = entries.get_mut(&gfid).ok_or(Errno::Stale)?;
                    let start = offset as usize;
                    let end = ((offset + len) as usize).min(e.data.len());
                    if start < end {
                        e.data[start..end].fill(0);
                    }
                    Ok(OperationReply::Unit)
                }
                Operation::ChildUp | Operation::ParentDown => Ok(OperationReply::Unit),
            }
        }
    }

    impl Translator for MemoryBrick {
        fn name(&self) -> &str {
            &self.name
        }

        fn forward(&self, op: Operation) -> Wait<Result<OperationReply>> {
            let (waker, wait) = wait_pair();
            waker.wake(self.handle(op));
            wait
        }

        fn notify(&self, _event: NotifyEvent) {}
    }
}
