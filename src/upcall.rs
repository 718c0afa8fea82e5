//! Server-initiated notification delivery: cache invalidation and lease
//! recalls pushed by a poller onto a queue, drained by a cooperative task
//! that invokes the application's callback outside any lock.
//!
//! Grounded on the teacher's `notify.rs` (`Notifier`/`ChannelSender`
//! pattern for pushing events across a thread boundary), turned around:
//! there the kernel pushes invalidations the filesystem driver requested;
//! here a brick pushes invalidations the application subscribed to.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::attr::Iatt;
use crate::gfid::Gfid;
use crate::task::{TaskHandle, TaskRuntime};

bitflags! {
    /// Which upcall event classes an application callback wants delivered.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SubscriptionMask: u32 {
        const INVALIDATE_ENTRY = 0b001;
        const INVALIDATE_INODE = 0b010;
        const LEASE_RECALL     = 0b100;
        const ALL = Self::INVALIDATE_ENTRY.bits() | Self::INVALIDATE_INODE.bits() | Self::LEASE_RECALL.bits();
    }
}

/// One server-pushed notification.
#[derive(Clone, Debug)]
pub struct Upcall {
    pub gfid: Gfid,
    pub event: UpcallData,
}

/// Event-specific payload. The event's class (for subscription-mask
/// filtering) is implicit in which variant this is.
#[derive(Clone, Debug)]
pub enum UpcallData {
    /// A specific child entry under `gfid` should be considered stale.
    InvalidateEntry { parent: Gfid, child_name: String },
    /// `gfid` itself changed; `attr` is the server's current view, if it
    /// chose to include one.
    InvalidateInode { attr: Option<Iatt> },
    /// The server is recalling a lease of the given type (bitmask of
    /// whichever lease-type encoding the brick protocol defines; opaque
    /// here since no lease implementation is in scope).
    LeaseRecall { lease_type: u32 },
}

impl UpcallData {
    fn mask_bit(&self) -> SubscriptionMask {
        match self {
            UpcallData::InvalidateEntry { .. } => SubscriptionMask::INVALIDATE_ENTRY,
            UpcallData::InvalidateInode { .. } => SubscriptionMask::INVALIDATE_INODE,
            UpcallData::LeaseRecall { .. } => SubscriptionMask::LEASE_RECALL,
        }
    }
}

/// An application's upcall callback: invoked once per delivered event,
/// never while any internal lock is held.
pub type UpcallCallback = Arc<dyn Fn(Upcall) + Send + Sync>;

/// Owns the subscription mask, the registered callback, and the pending
/// queue one `Fs` maintains.
pub struct UpcallRegistry {
    mask: AtomicU32,
    callback: Mutex<Option<UpcallCallback>>,
    queue: Mutex<VecDeque<Upcall>>,
    notify: Notify,
}

impl UpcallRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(UpcallRegistry {
            mask: AtomicU32::new(0),
            callback: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// Registers (or replaces) the application's callback and the event
    /// classes it wants. Passing `SubscriptionMask::empty()` effectively
    /// unsubscribes without dropping the callback pointer.
    pub fn subscribe(&self, mask: SubscriptionMask, callback: UpcallCallback) {
        *self.callback.lock() = Some(callback);
        self.mask.store(mask.bits(), Ordering::Release);
    }

    pub fn unsubscribe(&self) {
        self.mask.store(0, Ordering::Release);
        *self.callback.lock() = None;
    }

    fn current_mask(&self) -> SubscriptionMask {
        SubscriptionMask::from_bits_truncate(self.mask.load(Ordering::Acquire))
    }

    /// Poller-side entry point: appends `event` if it matches the current
    /// subscription mask and wakes the drain task. Events outside the mask
    /// are dropped immediately rather than queued — an application that
    /// hasn't asked for lease recalls shouldn't pay to buffer them.
    pub fn push(&self, event: Upcall) {
        if !self.current_mask().contains(event.event.mask_bit()) {
            debug!("upcall for {} dropped: no subscriber", event.gfid);
            return;
        }
        self.queue.lock().push_back(event);
        self.notify.notify_one();
    }

    /// Spawns the cooperative task that drains the queue and invokes the
    /// callback for each entry, outside the queue lock so a slow or
    /// reentrant callback can't stall the poller.
    pub fn spawn_drain_task(self: &Arc<Self>, rt: &TaskRuntime) -> TaskHandle {
        let registry = self.clone();
        rt.spawn(async move {
            loop {
                registry.notify.notified().await;
                loop {
                    let next = registry.queue.lock().pop_front();
                    let Some(event) = next else { break };
                    let callback = registry.callback.lock().clone();
                    if let Some(cb) = callback {
                        cb(event);
                    }
                }
            }
        })
    }

    /// Number of events currently queued, for tests and diagnostics.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as StdMutex;
    use std::time::Duration;

    fn gfid(n: u8) -> Gfid {
        let mut b = [0u8; 16];
        b[15] = n;
        Gfid(b)
    }

    #[test]
    fn unsubscribed_events_are_dropped_not_queued() {
        let registry = UpcallRegistry::new();
        registry.push(Upcall {
            gfid: gfid(1),
            event: UpcallData::InvalidateInode { attr: None },
        });
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn matching_events_are_delivered_by_the_drain_task() {
        let registry = UpcallRegistry::new();
        let received: Arc<StdMutex<Vec<Gfid>>> = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        registry.subscribe(
            SubscriptionMask::INVALIDATE_INODE,
            Arc::new(move |u: Upcall| received2.lock().push(u.gfid)),
        );

        let rt = TaskRuntime::new(2).unwrap();
        let _drain = registry.spawn_drain_task(&rt);

        registry.push(Upcall {
            gfid: gfid(7),
            event: UpcallData::InvalidateInode { attr: None },
        });

        // Give the cooperative task a moment to run; this is the one spot
        // a test needs a real sleep, since there's no synchronous signal
        // for "the background task has drained the queue."
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(received.lock().as_slice(), &[gfid(7)]);
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn events_outside_mask_are_filtered() {
        let registry = UpcallRegistry::new();
        registry.subscribe(SubscriptionMask::LEASE_RECALL, Arc::new(|_| {}));
        registry.push(Upcall {
            gfid: gfid(2),
            event: UpcallData::InvalidateEntry { parent: gfid(1), child_name: "x".into() },
        });
        assert_eq!(registry.pending(), 0);
    }
}
