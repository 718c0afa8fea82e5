//! The `Fs` context: the process-wide handle applications hold for one
//! mounted volume, owning every piece of shared state the rest of the
//! crate coordinates through.
//!
//! Grounded on `glfs.c`'s `pub_glfs_new`/`pub_glfs_init`/`pub_glfs_fini`
//! for the construction/arm/teardown lifecycle, and on the same file's
//! graph-slot handling for how `switch_graph` sequences the six migration
//! steps `src/graph.rs` provides the primitives for.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::errno::{Errno, Result};
use crate::fd::{Fd, FdTable};
use crate::gf::Gf;
use crate::gfid::GfidAllocator;
use crate::graph::{Graph, GraphSlots, GraphState};
use crate::matrix::MatrixCache;
use crate::task::TaskRuntime;
use crate::translator::{NotifyEvent, Operation, OperationReply, Translator};
use crate::upcall::UpcallRegistry;

/// Transport kind named in a volfile-server configuration. Validated at
/// `set_volfile_server` time; the actual connection is out of scope (the
/// wire codec is an explicit non-goal), so this only ever gets as far as
/// being recorded and logged.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportKind {
    Tcp,
    Rdma,
    Unix,
}

/// Where this `Fs` should fetch its volume description from. Resolving
/// this into an actual translator graph (parsing a volfile, talking to a
/// management server) is an explicit non-goal; `init` instead takes the
/// already-built top translator directly, and this is kept purely as the
/// configuration surface a caller sets first, the way the teacher's
/// `mount_options` module validates mount options before a session opens.
#[derive(Clone, Debug)]
pub enum VolfileSource {
    Path(String),
    Server { host: String, port: u16, transport: TransportKind },
}

/// Process-wide handle to one mounted volume.
pub struct Fs {
    volname: String,
    volfile_source: Mutex<Option<VolfileSource>>,
    pub(crate) rt: TaskRuntime,
    pub(crate) gf: Arc<Gf>,
    pub(crate) matrix: Mutex<Option<Arc<MatrixCache>>>,
    pub(crate) gfid_alloc: GfidAllocator,
    pub(crate) slots: Mutex<GraphSlots>,
    pub(crate) fds: FdTable,
    pub(crate) upcalls: Arc<UpcallRegistry>,
    ready_mutex: Mutex<bool>,
    ready_condvar: Condvar,
}

impl Fs {
    /// Allocates a fresh, unarmed context. Nothing here talks to a network
    /// or spawns background work yet; that starts at [`Fs::init`].
    pub fn new(volname: impl Into<String>) -> Result<Arc<Fs>> {
        let volname = volname.into();
        let salt = volname.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        Ok(Arc::new(Fs {
            volname,
            volfile_source: Mutex::new(None),
            rt: TaskRuntime::new(4)?,
            gf: Arc::new(Gf::default_field()?),
            matrix: Mutex::new(None),
            gfid_alloc: GfidAllocator::new(salt),
            slots: Mutex::new(GraphSlots::new()),
            fds: FdTable::new(),
            upcalls: UpcallRegistry::new(),
            ready_mutex: Mutex::new(false),
            ready_condvar: Condvar::new(),
        }))
    }

    pub fn volname(&self) -> &str {
        &self.volname
    }

    /// Records a local volfile path to fetch the graph description from.
    pub fn set_volfile(&self, path: impl Into<String>) -> Result<()> {
        let path = path.into();
        if path.is_empty() {
            return Err(Errno::Invalid);
        }
        *self.volfile_source.lock() = Some(VolfileSource::Path(path));
        Ok(())
    }

    /// Records a management server to fetch the graph description from.
    pub fn set_volfile_server(&self, host: impl Into<String>, port: u16, transport: TransportKind) -> Result<()> {
        let host = host.into();
        if host.is_empty() || port == 0 {
            return Err(Errno::Invalid);
        }
        *self.volfile_source.lock() = Some(VolfileSource::Server { host, port, transport });
        Ok(())
    }

    /// Configures the erasure-coding geometry for this volume. Not every
    /// volume is dispersed; callers that never invoke this get
    /// `Errno::NotSupported` from any operation that needs striping.
    pub fn configure_erasure_coding(&self, fragments: u32, redundancy: u32, cache_size: usize) -> Result<()> {
        let cache = MatrixCache::new(self.gf.clone(), fragments, redundancy, cache_size)?;
        *self.matrix.lock() = Some(Arc::new(cache));
        Ok(())
    }

    pub fn erasure_coding(&self) -> Option<Arc<MatrixCache>> {
        self.matrix.lock().clone()
    }

    /// Registers the application's upcall callback and the event classes it
    /// wants delivered. See [`crate::upcall::UpcallRegistry::subscribe`].
    pub fn subscribe_upcalls(&self, mask: crate::upcall::SubscriptionMask, callback: crate::upcall::UpcallCallback) {
        self.upcalls.subscribe(mask, callback);
    }

    pub fn unsubscribe_upcalls(&self) {
        self.upcalls.unsubscribe();
    }

    /// Queues a server-pushed notification for delivery to the subscribed
    /// callback. A brick translator (or, in a full build, the poller that
    /// watches the out-of-band notification channel a real `Transport`
    /// would carry) calls this as events arrive.
    pub fn push_upcall(&self, event: crate::upcall::Upcall) {
        self.upcalls.push(event);
    }

    /// Arms this context: installs `top` as the first graph generation and
    /// blocks until it reports `ChildUp`, matching `pub_glfs_init`'s
    /// "block the caller until the graph is usable" contract.
    pub fn init(&self, top: Arc<dyn Translator>) -> Result<()> {
        if self.volfile_source.lock().is_none() {
            return Err(Errno::Invalid);
        }
        top.init()?;
        let graph = Graph::new(1, rand_uuid(&self.volname), top);
        graph.set_state(GraphState::Active);
        graph.mark_used();
        graph.top().notify(NotifyEvent::ChildUp);
        info!("volume {}: generation {} active", self.volname, graph.generation());

        {
            let mut slots = self.slots.lock();
            slots.active = Some(graph);
        }
        self.upcalls.spawn_drain_task(&self.rt);

        let mut ready = self.ready_mutex.lock();
        *ready = true;
        self.ready_condvar.notify_all();
        Ok(())
    }

    /// Blocks until `init` has armed this context (a no-op if it already
    /// has). Non-task application threads use this the same way they use
    /// `syncop`: a `parking_lot::Condvar` wait, not a busy poll.
    pub fn wait_ready(&self) {
        let mut ready = self.ready_mutex.lock();
        while !*ready {
            self.ready_condvar.wait(&mut ready);
        }
    }

    pub fn active_graph(&self) -> Result<Arc<Graph>> {
        self.slots.lock().active.clone().ok_or(Errno::Invalid)
    }

    /// Runs one operation against the active graph with correct `winds`
    /// bookkeeping: acquires a wind under the context mutex before
    /// dispatch, releases it lock-free afterward, and if this was the last
    /// wind on a graph superseded mid-flight, sends `ParentDown` and
    /// retires it.
    pub(crate) fn wind_active<T>(&self, body: impl FnOnce(Arc<Graph>) -> Result<T>) -> Result<T> {
        let graph = {
            let slots = self.slots.lock();
            let graph = slots.active.clone().ok_or(Errno::Invalid)?;
            graph.begin_wind();
            graph
        };
        let result = body(graph.clone());
        if graph.end_wind() {
            graph.top().notify(NotifyEvent::ParentDown);
            let mut slots = self.slots.lock();
            if slots.old.as_ref().map(|o| o.generation()) == Some(graph.generation()) {
                debug!("generation {} drained, retiring", graph.generation());
                slots.retire_old();
            }
        }
        result
    }

    /// Drives the full six-step migration protocol onto `new_top`: stage
    /// it, wait for `ChildUp`, confirm it by looking up its own root,
    /// migrate every open FD onto it (inode refresh, re-open, lock
    /// reinjection, handle swap), promote it to active, and drain the
    /// outgoing generation.
    pub fn switch_graph(&self, new_top: Arc<dyn Translator>) -> Result<()> {
        new_top.init()?;
        let uuid = rand_uuid(&self.volname);
        let generation = {
            let slots = self.slots.lock();
            slots.active.as_ref().map(|g| g.generation()).unwrap_or(0) + 1
        };
        info!("volume {}: staging generation {}", self.volname, generation);
        let incoming = Graph::new(generation, uuid, new_top);

        // Step 1: stage.
        {
            let mut slots = self.slots.lock();
            slots.stage_next(incoming.clone());
        }

        // Step 2: child-up, begin migration.
        incoming.top().notify(NotifyEvent::ChildUp);
        {
            let mut slots = self.slots.lock();
            slots.begin_migration();
        }

        // Step 3: first lookup. Confirm the incoming graph actually
        // answers for its own root before any FD migration proceeds,
        // matching `glfs_first_lookup`'s role in priming a freshly
        // activated graph.
        {
            let top = incoming.top().clone();
            self.rt.syncop(move || async move {
                top.forward(Operation::Lookup { parent: crate::gfid::ROOT_GFID, name: String::new() })
                    .recv()
                    .await?
            })?;
        }

        // Steps 4a-4d: for every FD still backed by an older generation,
        // refresh its inode, re-open it, reinstate its locks, and swap it
        // onto the incoming graph. Best-effort per FD: one handle that
        // can't be migrated (e.g. the new generation genuinely has no
        // record of it) is logged and left behind rather than aborting
        // the whole switch.
        for fd in self.fds.all() {
            if fd.graph_generation() >= generation {
                continue;
            }
            if let Err(e) = self.migrate_fd_onto(&fd, &incoming) {
                warn!("failed to migrate fd {} onto generation {}: {e}", fd.id(), generation);
            }
        }

        // Step 5: promote.
        {
            let mut slots = self.slots.lock();
            slots.promote();
        }
        info!("volume {}: generation {} active", self.volname, generation);

        // Step 6: the outgoing generation drains as its winds reach zero
        // (see `wind_active`); nothing further to do here unless it is
        // already idle, in which case retire it immediately.
        let mut slots = self.slots.lock();
        if let Some(old) = slots.old.clone() {
            if old.winds() == 0 {
                old.mark_switched();
                old.top().notify(NotifyEvent::ParentDown);
                slots.retire_old();
            }
        }
        Ok(())
    }

    /// Migrates one open `Fd` onto `target`: step 4a refreshes its inode
    /// with a nameless (GFID-addressed) lookup, step 4b re-opens it with
    /// creation-only flags masked off (a handle that already existed
    /// before the switch is never `O_CREAT`/`O_EXCL`/`O_TRUNC` again),
    /// step 4c best-effort reinstates its byte-range locks via the
    /// `glusterfs.lockinfo`-equivalent xattr, and step 4d atomically swaps
    /// the `Fd` onto the result. Called both eagerly from `switch_graph`
    /// for every FD open at switch time, and lazily from `ops::dispatch_fd`
    /// for one that raced past it.
    pub(crate) fn migrate_fd_onto(&self, fd: &Arc<Fd>, target: &Arc<Graph>) -> Result<()> {
        let gfid = fd.inode().gfid();

        let top = target.top().clone();
        let reply = self.rt.syncop(move || async move {
            top.forward(Operation::Lookup { parent: gfid, name: String::new() }).recv().await?
        })?;
        let (resolved_gfid, attr) = match reply {
            OperationReply::Looked { gfid, attr } => (gfid, attr),
            _ => return Err(Errno::Stale),
        };
        let new_inode = target.inodes().get_or_create(resolved_gfid, attr.kind);
        new_inode.clear_needs_lookup();

        let open_flags = fd.flags() & !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);
        let top = target.top().clone();
        self.rt.syncop(move || async move {
            top.forward(Operation::Open { gfid: resolved_gfid, flags: open_flags }).recv().await?
        })?;

        let locks = fd.locks();
        if !locks.is_empty() {
            let top = target.top().clone();
            let encoded = crate::graph::encode_lockinfo(&locks);
            let lock_count = locks.len();
            let fd_id = fd.id();
            let target_generation = target.generation();
            if let Err(e) = self.rt.syncop(move || async move {
                top.forward(Operation::Setxattr {
                    gfid: resolved_gfid,
                    name: crate::fd::LOCKINFO_XATTR_KEY.to_string(),
                    value: encoded,
                })
                .recv()
                .await?
            }) {
                warn!("failed to migrate {lock_count} lock(s) for fd {fd_id} onto generation {target_generation}: {e}");
            }
        }

        fd.set_backing(new_inode, target.generation());
        Ok(())
    }

    /// Tears this context down: waits for every open FD to close, sends a
    /// synchronous `ParentDown` to the active graph, and stops the
    /// cooperative runtime's background work.
    pub fn fini(&self) -> Result<()> {
        while !self.fds.is_empty() {
            std::thread::yield_now();
        }
        if let Some(graph) = self.slots.lock().active.take() {
            graph.top().notify(NotifyEvent::ParentDown);
            graph.set_state(GraphState::Dead);
        }
        info!("volume {}: torn down", self.volname);
        Ok(())
    }
}

fn rand_uuid(seed: &str) -> u128 {
    let mut h: u128 = 0xcbf29ce484222325;
    for b in seed.bytes() {
        h ^= b as u128;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::memory_brick::MemoryBrick;

    fn armed() -> Arc<Fs> {
        let fs = Fs::new("test-vol").unwrap();
        fs.set_volfile("/etc/volfiles/test-vol.vol").unwrap();
        fs.init(Arc::new(MemoryBrick::new("brick0"))).unwrap();
        fs
    }

    #[test]
    fn init_without_volfile_source_fails() {
        let fs = Fs::new("no-config").unwrap();
        let err = fs.init(Arc::new(MemoryBrick::new("b"))).unwrap_err();
        assert_eq!(err, Errno::Invalid);
    }

    #[test]
    fn init_arms_the_active_graph() {
        let fs = armed();
        let graph = fs.active_graph().unwrap();
        assert_eq!(graph.state(), crate::graph::GraphState::Active);
    }

    #[test]
    fn switch_graph_promotes_new_generation_and_retires_old() {
        let fs = armed();
        let old_generation = fs.active_graph().unwrap().generation();
        fs.switch_graph(Arc::new(MemoryBrick::new("brick1"))).unwrap();
        let new_graph = fs.active_graph().unwrap();
        assert_eq!(new_graph.generation(), old_generation + 1);
        assert_eq!(new_graph.state(), crate::graph::GraphState::Active);
        assert!(fs.slots.lock().old.is_none());
    }

    #[test]
    fn configure_erasure_coding_enables_matrix_cache() {
        let fs = armed();
        assert!(fs.erasure_coding().is_none());
        fs.configure_erasure_coding(4, 2, 8).unwrap();
        assert!(fs.erasure_coding().is_some());
    }
}
