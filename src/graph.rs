//! Translator graph lifecycle: the state machine a graph built from a
//! volume file moves through from first activation to teardown, and the
//! `winds` bookkeeping that lets a graph be torn down only once nothing is
//! still in flight against it.
//!
//! Grounded on `glfs.c`'s graph-slot handling (`fs->next`, `fs->active`,
//! `fs->old`) and `glfs-resolve.c`'s `glfs_migrate_fd_safe`/
//! `glfs_migrate_fd_locks_safe`, which drive the inode/FD migration steps
//! `src/fs.rs` sequences using the primitives here.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::fd::LockRange;
use crate::inode::InodeTable;
use crate::translator::Translator;

/// A graph's position in its lifecycle. Transitions only ever move
/// forward through this list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GraphState {
    /// Built from a volfile, not yet wired into the `Fs`'s graph slots.
    Staged,
    /// Installed as the `next` slot, awaiting a `ChildUp` notification.
    Next,
    /// `ChildUp` received; inode and FD state is being migrated onto it.
    MigrationInProgress,
    /// Serving application requests.
    Active,
    /// Superseded by a newer graph; draining in-flight operations.
    Old,
    /// Drained (`winds == 0`) and torn down.
    Dead,
}

/// A rooted translator graph built from one volume file.
pub struct Graph {
    uuid: u128,
    generation: u64,
    top: Arc<dyn Translator>,
    inodes: InodeTable,
    state: parking_lot::Mutex<GraphState>,
    /// Set once this generation has reported `ChildUp`.
    used: AtomicBool,
    /// Set once a newer generation has superseded this one.
    switched: AtomicBool,
    /// Number of in-flight operations that still hold a reference to this
    /// graph. Incremented under the `Fs` context mutex at acquire time;
    /// decremented lock-free at release time (see [`Graph::end_wind`]).
    winds: AtomicU32,
    /// Armed exactly once, by whichever `end_wind` call observes
    /// `winds == 0` on a switched graph; resolves the race SPEC_FULL.md §9
    /// calls out.
    parent_down_sent: AtomicBool,
}

impl Graph {
    pub fn new(generation: u64, uuid: u128, top: Arc<dyn Translator>) -> Arc<Graph> {
        Arc::new(Graph {
            uuid,
            generation,
            top,
            inodes: InodeTable::new(),
            state: parking_lot::Mutex::new(GraphState::Staged),
            used: AtomicBool::new(false),
            switched: AtomicBool::new(false),
            winds: AtomicU32::new(0),
            parent_down_sent: AtomicBool::new(false),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn uuid(&self) -> u128 {
        self.uuid
    }

    pub fn top(&self) -> &Arc<dyn Translator> {
        &self.top
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn state(&self) -> GraphState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: GraphState) {
        *self.state.lock() = state;
    }

    pub fn mark_used(&self) {
        self.used.store(true, Ordering::Release);
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    /// Marks this graph as superseded. After this, it must never be
    /// promoted back to `Active` (SPEC_FULL.md §3's invariant).
    pub fn mark_switched(&self) {
        self.switched.store(true, Ordering::Release);
    }

    pub fn is_switched(&self) -> bool {
        self.switched.load(Ordering::Acquire)
    }

    pub fn winds(&self) -> u32 {
        self.winds.load(Ordering::Acquire)
    }

    /// Records that one more operation now holds this graph. Must be
    /// called while the caller holds the `Fs` context mutex, so that it
    /// can never race with the graph-switch code that reads `winds == 0`
    /// to decide a graph is drained.
    pub fn begin_wind(&self) -> u32 {
        self.winds.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Releases one operation's hold on this graph. Lock-free: does not
    /// require the context mutex. Returns `true` exactly once — for
    /// whichever caller's release happens to observe `winds` reach zero on
    /// an already-switched graph — signaling that *this* caller is
    /// responsible for sending `ParentDown` and finishing teardown.
    pub fn end_wind(&self) -> bool {
        loop {
            let current = self.winds.load(Ordering::Acquire);
            debug_assert!(current > 0, "end_wind called without a matching begin_wind");
            let next = current.saturating_sub(1);
            if self
                .winds
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if next == 0 && self.switched.load(Ordering::Acquire) {
                    return self
                        .parent_down_sent
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                }
                return false;
            }
        }
    }
}

/// The four generation slots an `Fs` keeps live at once (SPEC_FULL.md §3):
/// at most one graph may occupy each slot.
#[derive(Default)]
pub struct GraphSlots {
    pub active: Option<Arc<Graph>>,
    pub next: Option<Arc<Graph>>,
    pub migration_in_progress: Option<Arc<Graph>>,
    pub old: Option<Arc<Graph>>,
}

impl GraphSlots {
    pub fn new() -> Self {
        GraphSlots::default()
    }

    /// Step 1 of the migration protocol: stage a freshly built graph into
    /// the `next` slot.
    pub fn stage_next(&mut self, graph: Arc<Graph>) {
        graph.set_state(GraphState::Next);
        self.next = Some(graph);
    }

    /// Step 2: `next` has reported `ChildUp`; move it into
    /// `migration_in_progress` so inode/FD migration can proceed against
    /// it while the old graph still serves traffic.
    pub fn begin_migration(&mut self) {
        if let Some(graph) = self.next.take() {
            graph.mark_used();
            graph.set_state(GraphState::MigrationInProgress);
            self.migration_in_progress = Some(graph);
        }
    }

    /// Steps 3-4 (inode refresh, FD/lock migration) happen against
    /// `self.migration_in_progress` in `src/fs.rs`, which has the tables
    /// this module doesn't own. Once they're done, step 5 promotes it.
    pub fn promote(&mut self) -> Option<Arc<Graph>> {
        let incoming = self.migration_in_progress.take()?;
        if let Some(outgoing) = self.active.take() {
            outgoing.mark_switched();
            outgoing.set_state(GraphState::Old);
            self.old = Some(outgoing);
        }
        incoming.set_state(GraphState::Active);
        self.active = Some(incoming.clone());
        Some(incoming)
    }

    /// Step 6: once `old`'s `winds` has drained to zero (observed via
    /// [`Graph::end_wind`] returning `true`), the caller sends `ParentDown`
    /// and calls this to free the slot.
    pub fn retire_old(&mut self) -> Option<Arc<Graph>> {
        let graph = self.old.take()?;
        graph.set_state(GraphState::Dead);
        Some(graph)
    }
}

/// Encodes byte-range locks for the `glusterfs.lockinfo`-equivalent xattr
/// used to reinject a file descriptor's locks against the new graph
/// generation during migration. Format: a flat sequence of
/// `(start: u64 LE, len: u64 LE, exclusive: u8, owner: u64 LE)` records.
pub fn encode_lockinfo(locks: &[LockRange]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(locks.len() * 25);
    for lock in locks {
        buf.extend_from_slice(&lock.start.to_le_bytes());
        buf.extend_from_slice(&lock.len.to_le_bytes());
        buf.push(lock.exclusive as u8);
        buf.extend_from_slice(&lock.owner.to_le_bytes());
    }
    buf
}

/// Reverse of [`encode_lockinfo`]. Malformed input (wrong length) yields
/// an empty list rather than panicking: migration best-effort-restores
/// locks and logs rather than failing the whole switch over one corrupt
/// record.
pub fn decode_lockinfo(data: &[u8]) -> Vec<LockRange> {
    const RECORD_LEN: usize = 25;
    if data.len() % RECORD_LEN != 0 {
        return Vec::new();
    }
    data.chunks_exact(RECORD_LEN)
        .map(|rec| LockRange {
            start: u64::from_le_bytes(rec[0..8].try_into().unwrap()),
            len: u64::from_le_bytes(rec[8..16].try_into().unwrap()),
            exclusive: rec[16] != 0,
            owner: u64::from_le_bytes(rec[17..25].try_into().unwrap()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::memory_brick::MemoryBrick;

    fn graph(gen: u64) -> Arc<Graph> {
        Graph::new(gen, gen as u128, Arc::new(MemoryBrick::new("test")))
    }

    #[test]
    fn end_wind_only_signals_on_switched_graph_at_zero() {
        let g = graph(1);
        g.begin_wind();
        g.begin_wind();
        assert!(!g.end_wind()); // winds: 2 -> 1, not switched anyway
        assert!(!g.end_wind()); // winds: 1 -> 0, but not switched
        g.begin_wind();
        g.mark_switched();
        assert!(g.end_wind()); // winds: 1 -> 0, switched: fires once
    }

    #[test]
    fn end_wind_fires_exactly_once_under_race() {
        use std::thread;
        let g = graph(2);
        for _ in 0..8 {
            g.begin_wind();
        }
        g.mark_switched();
        let fired: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8).map(|_| scope.spawn(|| g.end_wind())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(fired.iter().filter(|&&f| f).count(), 1);
    }

    #[test]
    fn slots_cycle_through_expected_states() {
        let mut slots = GraphSlots::new();
        let g1 = graph(1);
        g1.set_state(GraphState::Active);
        slots.active = Some(g1.clone());

        let g2 = graph(2);
        slots.stage_next(g2.clone());
        assert_eq!(g2.state(), GraphState::Next);

        slots.begin_migration();
        assert_eq!(g2.state(), GraphState::MigrationInProgress);
        assert!(g2.is_used());

        slots.promote();
        assert_eq!(g2.state(), GraphState::Active);
        assert_eq!(g1.state(), GraphState::Old);
        assert!(g1.is_switched());

        let retired = slots.retire_old().unwrap();
        assert_eq!(retired.uuid(), g1.uuid());
        assert_eq!(retired.state(), GraphState::Dead);
    }

    #[test]
    fn lockinfo_roundtrips() {
        let locks = vec![
            LockRange { start: 0, len: 100, exclusive: true, owner: 7 },
            LockRange { start: 200, len: 0, exclusive: false, owner: 9 },
        ];
        let encoded = encode_lockinfo(&locks);
        let decoded = decode_lockinfo(&encoded);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].start, 0);
        assert_eq!(decoded[1].owner, 9);
    }

    #[test]
    fn malformed_lockinfo_decodes_to_empty() {
        assert!(decode_lockinfo(&[1, 2, 3]).is_empty());
    }
}
