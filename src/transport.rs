//! The seam a production wire codec (XDR/RPC framing to bricks) would sit
//! behind. A real codec is an explicit non-goal of this crate; what it
//! needs to implement is not: translators call through `Transport` exactly
//! as they call through any other capability, and tests substitute an
//! in-memory fake.
//!
//! Grounded on the way the teacher keeps the kernel FUSE channel behind a
//! narrow `Channel`/`ChannelSender` seam (`channel.rs`) rather than letting
//! `/dev/fuse` I/O leak into request-handling code.

use crate::errno::Result;
use crate::task::Wait;

/// One frame sent to a brick: an opaque operation tag plus its serialized
/// arguments. The core never interprets `payload`; only a real codec and
/// the matching brick would.
#[derive(Clone, Debug)]
pub struct Frame {
    pub op: u32,
    pub payload: Vec<u8>,
}

/// A brick's reply to one [`Frame`].
#[derive(Clone, Debug)]
pub struct Reply {
    pub payload: Vec<u8>,
}

/// Delivers frames to a brick (or bricks) and returns a future that
/// resolves with the reply. Implementations own however the frame
/// actually reaches the wire; the core only ever sees this trait.
pub trait Transport: Send + Sync {
    /// Sends `frame` to brick `brick_id` and returns a suspension point
    /// that resolves when the reply arrives.
    fn forward(&self, brick_id: u32, frame: Frame) -> Wait<Result<Reply>>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    //! An in-memory `Transport` that loops every frame straight back to a
    //! single in-process "brick" closure, analogous to the teacher's
    //! `examples/simple` in-memory filesystem: just enough to exercise the
    //! pipeline end-to-end without a real network.

    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{Frame, Reply, Transport};
    use crate::task::{wait_pair, Wait};
    use crate::errno::Result;

    /// A handler invoked synchronously for every frame sent to any brick.
    pub type Handler = Arc<dyn Fn(u32, Frame) -> Result<Reply> + Send + Sync>;

    /// An in-memory transport that immediately "replies" by invoking a
    /// handler closure on the calling thread. Frames are recorded for
    /// assertions in tests that care about call order.
    pub struct FakeTransport {
        handler: Handler,
        log: Mutex<Vec<(u32, Frame)>>,
    }

    impl FakeTransport {
        pub fn new(handler: Handler) -> Self {
            FakeTransport {
                handler,
                log: Mutex::new(Vec::new()),
            }
        }

        /// Frames sent so far, in order, for test assertions.
        pub fn sent(&self) -> Vec<(u32, Frame)> {
            self.log.lock().clone()
        }
    }

    impl Transport for FakeTransport {
        fn forward(&self, brick_id: u32, frame: Frame) -> Wait<Result<Reply>> {
            self.log.lock().push((brick_id, frame.clone()));
            let (waker, wait) = wait_pair();
            waker.wake((self.handler)(brick_id, frame));
            wait
        }
    }
}
