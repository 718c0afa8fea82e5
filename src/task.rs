//! Cooperative task runtime: turns callback-driven network operations into
//! straight-line request logic that suspends only at explicit wait points.
//!
//! Grounded on the teacher's `tokio`-based `Session`/`ActiveSession` in
//! `session.rs` (tokio tasks, `oneshot` completion channels, `JoinHandle`
//! tracked background work). The teacher spawns one task per inbound kernel
//! request and waits on it via a destroy-signal `oneshot`; here, one task
//! per `syncop` call performs the (simulated) network round trip and wakes
//! the calling application thread through a `parking_lot::Condvar`, since
//! the caller is an ordinary OS thread, never itself a runtime worker.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Runtime;

use crate::errno::{Errno, Result};

/// A suspension point a task hands to whatever will eventually resume it
/// (a transport reply, a timer, an upcall). `Wait::recv` is the only place
/// a task body actually suspends.
pub struct Wait<T> {
    rx: tokio::sync::oneshot::Receiver<T>,
}

/// The other half of a [`Wait`]; fires it exactly once.
#[derive(Clone)]
pub struct Waker<T> {
    tx: Arc<Mutex<Option<tokio::sync::oneshot::Sender<T>>>>,
}

impl<T> Waker<T> {
    /// Resumes the waiting task with `value`. A second call is a silent
    /// no-op: only the first wakeup can matter, matching the "non-task
    /// threads never double-resume" rule callers rely on.
    pub fn wake(&self, value: T) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(value);
        }
    }
}

/// Creates one suspension point.
pub fn wait_pair<T>() -> (Waker<T>, Wait<T>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    (
        Waker {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        Wait { rx },
    )
}

impl<T> Wait<T> {
    /// Suspends the current task until [`Waker::wake`] is called.
    pub async fn recv(self) -> Result<T> {
        self.rx.await.map_err(|_| Errno::Io)
    }
}

/// Identifies one in-flight cooperative task, for logging and for the
/// graph-migration wait queue that needs to name tasks it is holding.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    fn next() -> TaskId {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A spawned cooperative task's handle. Tasks here are never cancelled
/// mid-flight (SPEC_FULL.md §9): dropping a `TaskHandle` does not abort the
/// underlying tokio task, it only stops tracking it.
pub struct TaskHandle {
    id: TaskId,
    join: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    /// This task's id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// `true` once the task body has returned.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

struct WaitSlot<T> {
    result: Mutex<Option<T>>,
    condvar: Condvar,
}

/// Owns the tokio runtime that executes every cooperative task body, and
/// exposes the `syncop` entry point application threads call into.
pub struct TaskRuntime {
    rt: Runtime,
}

impl TaskRuntime {
    /// Builds a multi-threaded runtime with `worker_threads` synctask
    /// workers, matching the teacher's default of dedicating a small fixed
    /// pool rather than one thread per request.
    pub fn new(worker_threads: usize) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("synctask")
            .enable_time()
            .build()
            .map_err(|_| Errno::NoMem)?;
        Ok(TaskRuntime { rt })
    }

    /// Spawns a fire-and-forget cooperative task (used for the upcall drain
    /// task and the poller loop, neither of which has a caller waiting on
    /// a result).
    pub fn spawn<F>(&self, body: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = TaskId::next();
        let join = self.rt.spawn(body);
        TaskHandle { id, join }
    }

    /// Runs `make_future()` as a cooperative task and blocks the calling
    /// (non-task) thread until it completes, returning its result.
    ///
    /// This is the straight-line "syncop" call application-facing methods
    /// in `ops.rs` use: the calling thread never touches the tokio runtime
    /// directly, so it cannot starve a worker, and the task body can
    /// suspend freely at any [`Wait::recv`] point without blocking anyone
    /// but itself.
    pub fn syncop<T, F, Fut>(&self, make_future: F) -> Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        F: FnOnce() -> Fut,
    {
        let slot = Arc::new(WaitSlot {
            result: Mutex::new(None),
            condvar: Condvar::new(),
        });
        let slot2 = slot.clone();
        let fut = make_future();
        self.rt.spawn(async move {
            let result = fut.await;
            let mut guard = slot2.result.lock();
            *guard = Some(result);
            slot2.condvar.notify_all();
        });

        let mut guard = slot.result.lock();
        while guard.is_none() {
            slot.condvar.wait(&mut guard);
        }
        guard.take().unwrap()
    }

    /// A handle to the runtime, for components (the upcall drain task, the
    /// graph migration driver) that need to spawn their own long-lived
    /// background tasks outside of a `syncop` call.
    pub fn handle(&self) -> tokio::runtime::Handle {
        self.rt.handle().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn syncop_returns_task_result() {
        let rt = TaskRuntime::new(2).unwrap();
        let out = rt.syncop(|| async { Ok::<_, Errno>(21 * 2) }).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn syncop_propagates_error() {
        let rt = TaskRuntime::new(2).unwrap();
        let out: Result<()> = rt.syncop(|| async { Err(Errno::Io) });
        assert_eq!(out, Err(Errno::Io));
    }

    #[test]
    fn wait_pair_suspends_until_woken() {
        let rt = TaskRuntime::new(2).unwrap();
        let (waker, wait) = wait_pair::<u32>();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake(7);
        });
        let out = rt.syncop(move || async move { wait.recv().await }).unwrap();
        assert_eq!(out, 7);
    }

    #[test]
    fn second_wake_is_a_no_op() {
        let (waker, wait) = wait_pair::<u32>();
        waker.wake(1);
        waker.wake(2);
        let rt = TaskRuntime::new(1).unwrap();
        let out = rt.syncop(move || async move { wait.recv().await }).unwrap();
        assert_eq!(out, 1);
    }

    #[test]
    fn many_concurrent_syncops_each_get_their_own_result() {
        let rt = Arc::new(TaskRuntime::new(4).unwrap());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let rt = rt.clone();
                thread::spawn(move || rt.syncop(move || async move { Ok::<_, Errno>(i) }).unwrap())
            })
            .collect();
        let mut results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort();
        assert_eq!(results, (0..16).collect::<Vec<_>>());
    }
}
