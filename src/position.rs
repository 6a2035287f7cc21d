//! Position sources and cancellable position watches.
//!
//! A [`PositionSource`] hands out a [`PositionWatch`] when a walk starts.
//! The watch is a subscription: samples queue up on a channel until the
//! engine drains them, and cancelling (or dropping) the watch releases the
//! subscription on the source side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};

use crate::{Coordinate, Result, WalkError};

/// A single position fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub coordinate: Coordinate,
    /// Reported horizontal accuracy in meters, if the source knows it
    pub accuracy_m: Option<f64>,
    /// Fix time in milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

impl PositionSample {
    pub fn new(coordinate: Coordinate, timestamp_ms: i64) -> Self {
        Self {
            coordinate,
            accuracy_m: None,
            timestamp_ms,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }
}

/// Event delivered through a position watch.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Sample(PositionSample),
    /// Transient read failure; the watch stays open
    Error(String),
}

/// Something that can produce a live stream of positions.
pub trait PositionSource {
    /// Whether positions can be produced at all (capability and permission).
    fn is_available(&self) -> bool;

    /// Begin producing positions.
    ///
    /// Fails with [`WalkError::PositionUnavailable`] if the source cannot
    /// start.
    fn watch(&mut self) -> Result<PositionWatch>;
}

/// Handle for an active position subscription.
///
/// Dropping the handle cancels the subscription.
#[derive(Debug)]
pub struct PositionWatch {
    receiver: Receiver<PositionEvent>,
    active: Arc<AtomicBool>,
}

impl PositionWatch {
    /// Wrap a receiver. The source stops delivering once `active` is false.
    pub fn new(receiver: Receiver<PositionEvent>, active: Arc<AtomicBool>) -> Self {
        Self { receiver, active }
    }

    /// Next queued event (non-blocking).
    ///
    /// `Err(TryRecvError::Disconnected)` means the stream ended.
    pub fn try_next(&self) -> std::result::Result<PositionEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Release the subscription.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Host-fed Position Source
// ============================================================================

#[derive(Debug)]
struct FeedState {
    available: bool,
    sender: Option<Sender<PositionEvent>>,
    active: Option<Arc<AtomicBool>>,
}

impl FeedState {
    /// Sender of the current subscription, dropping it if the watch was cancelled.
    fn live_sender(&mut self) -> Option<&Sender<PositionEvent>> {
        let active = self
            .active
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst));
        if !active {
            self.sender = None;
            self.active = None;
        }
        self.sender.as_ref()
    }
}

fn lock_feed(state: &Mutex<FeedState>) -> MutexGuard<'_, FeedState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Position source whose fixes are pushed in by the host.
///
/// Mobile hosts forward platform location callbacks through the paired
/// [`PositionFeed`]; tests push fixes directly.
#[derive(Debug, Clone)]
pub struct ChannelPositionSource {
    state: Arc<Mutex<FeedState>>,
}

/// Sending side of a [`ChannelPositionSource`].
#[derive(Debug, Clone)]
pub struct PositionFeed {
    state: Arc<Mutex<FeedState>>,
}

impl ChannelPositionSource {
    /// Create an available source and its feed.
    pub fn new() -> (Self, PositionFeed) {
        let state = Arc::new(Mutex::new(FeedState {
            available: true,
            sender: None,
            active: None,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            PositionFeed { state },
        )
    }
}

impl PositionSource for ChannelPositionSource {
    fn is_available(&self) -> bool {
        lock_feed(&self.state).available
    }

    fn watch(&mut self) -> Result<PositionWatch> {
        let mut state = lock_feed(&self.state);
        if !state.available {
            return Err(WalkError::PositionUnavailable {
                message: "position feed is disabled".to_string(),
            });
        }

        // A new watch replaces any previous subscription
        if let Some(previous) = state.active.take() {
            previous.store(false, Ordering::SeqCst);
        }

        let (sender, receiver) = mpsc::channel();
        let active = Arc::new(AtomicBool::new(true));
        state.sender = Some(sender);
        state.active = Some(Arc::clone(&active));

        info!("[PositionFeed] Watch started");
        Ok(PositionWatch::new(receiver, active))
    }
}

impl PositionFeed {
    /// Mark the source as (un)available, e.g. after a permission change.
    pub fn set_available(&self, available: bool) {
        lock_feed(&self.state).available = available;
    }

    /// Deliver a fix. Returns false if nobody is watching.
    pub fn push(&self, sample: PositionSample) -> bool {
        self.send(PositionEvent::Sample(sample))
    }

    /// Deliver a transient read failure. Returns false if nobody is watching.
    pub fn push_error(&self, message: impl Into<String>) -> bool {
        self.send(PositionEvent::Error(message.into()))
    }

    /// End the current stream. The watcher sees a disconnected channel.
    pub fn close(&self) {
        let mut state = lock_feed(&self.state);
        state.sender = None;
        state.active = None;
    }

    /// Whether a watch is currently subscribed.
    pub fn has_subscriber(&self) -> bool {
        lock_feed(&self.state).live_sender().is_some()
    }

    fn send(&self, event: PositionEvent) -> bool {
        let mut state = lock_feed(&self.state);
        let delivered = match state.live_sender() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        };
        if !delivered {
            debug!("[PositionFeed] Dropped event, no active watch");
            state.sender = None;
            state.active = None;
        }
        delivered
    }
}
