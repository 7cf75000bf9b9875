//! Latest-wins frame hand-off between the driver and the frame worker.
//!
//! The slot holds at most one frame. A frame delivered while the previous one
//! is still unconsumed replaces it and is counted as dropped, so the sampler
//! never works through a backlog.
//!
//! A driver whose stream dies closes the slot with [`FrameSink::fail`]; the
//! worker picks the reason up with [`FrameReceiver::take_failure`].

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::traits::PlanarBuffer;

#[derive(Default)]
struct Slot {
    frame: Option<PlanarBuffer>,
    closed: bool,
    failure: Option<String>,
    delivered: u64,
    dropped: u64,
}

/// Frame hand-off counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames accepted since the channel was created.
    pub delivered: u64,
    /// Frames replaced before the worker picked them up.
    pub dropped: u64,
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} delivered, {} dropped", self.delivered, self.dropped)
    }
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a connected sink/receiver pair.
pub fn frame_channel() -> (FrameSink, FrameReceiver) {
    let shared = Arc::new(Shared::default());
    (
        FrameSink {
            shared: Arc::clone(&shared),
        },
        FrameReceiver { shared },
    )
}

/// Driver-side handle frames are pushed into.
#[derive(Clone)]
pub struct FrameSink {
    shared: Arc<Shared>,
}

impl FrameSink {
    /// Hand a frame to the worker, replacing any unconsumed one.
    ///
    /// Returns `false` once the channel is closed; the frame is discarded.
    pub fn deliver(&self, frame: PlanarBuffer) -> bool {
        let mut slot = self.shared.lock();
        if slot.closed {
            return false;
        }
        if slot.frame.replace(frame).is_some() {
            slot.dropped += 1;
        }
        slot.delivered += 1;
        drop(slot);
        self.shared.ready.notify_one();
        true
    }

    /// Close the channel. Pending and future frames are discarded.
    pub fn close(&self) {
        let mut slot = self.shared.lock();
        slot.closed = true;
        slot.frame = None;
        drop(slot);
        self.shared.ready.notify_all();
    }

    /// Close the channel because the frame source stopped for good.
    ///
    /// Ignored once the channel is already closed.
    pub fn fail(&self, message: impl Into<String>) {
        let mut slot = self.shared.lock();
        if slot.closed {
            return;
        }
        slot.closed = true;
        slot.frame = None;
        slot.failure = Some(message.into());
        drop(slot);
        self.shared.ready.notify_all();
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Current hand-off counters.
    pub fn stats(&self) -> FrameStats {
        let slot = self.shared.lock();
        FrameStats {
            delivered: slot.delivered,
            dropped: slot.dropped,
        }
    }
}

/// Worker-side handle.
pub struct FrameReceiver {
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// Block until a frame arrives. Returns `None` once the channel is closed.
    pub fn recv(&self) -> Option<PlanarBuffer> {
        let mut slot = self.shared.lock();
        loop {
            if slot.closed {
                return None;
            }
            if let Some(frame) = slot.frame.take() {
                return Some(frame);
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PlanarBuffer> {
        let slot = self.shared.lock();
        let (mut slot, _) = self
            .shared
            .ready
            .wait_timeout_while(slot, timeout, |slot| !slot.closed && slot.frame.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        if slot.closed {
            return None;
        }
        slot.frame.take()
    }

    /// Why the frame source closed the channel, if it failed.
    pub fn take_failure(&self) -> Option<String> {
        self.shared.lock().failure.take()
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
    }
}
