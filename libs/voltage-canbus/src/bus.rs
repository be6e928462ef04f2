//! Bus Contract
//!
//! The abstract transport interface consumed by upper protocol layers, plus the
//! pieces every transport shares: the frame listener slot, lock-free
//! statistics and the reception state channel.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Upper layers (NMT / SDO / PDO / EMCY / TIME)     │
//! └─────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Bus (trait)                          │
//! │  connect(), disconnect(), send(), subscribe()           │
//! └─────────────────────────────────────────────────────────┘
//!                             │
//!     ┌───────────┬──────────┼──────────┬───────────┐
//!     ▼           ▼          ▼          ▼           ▼
//! ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐
//! │Blocking│ │ Cancel │ │Batched │ │  Ring  │ │Virtual │
//! │  read  │ │  loop  │ │recvmmsg│ │mmap rx │ │in-proc.│
//! └────────┘ └────────┘ └────────┘ └────────┘ └────────┘
//! ```

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::Result;
use crate::frame::Frame;

/// Receives frames on the transport's reception task
///
/// Implementations run on the reception hot path and must not block
/// significantly.
pub trait FrameListener: Send + Sync {
    fn handle(&self, frame: Frame);
}

impl<F> FrameListener for F
where
    F: Fn(Frame) + Send + Sync,
{
    fn handle(&self, frame: Frame) {
        self(frame)
    }
}

/// Listener that drops every frame; subscribing it deregisters the previous one
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl FrameListener for NoopListener {
    fn handle(&self, _frame: Frame) {}
}

/// Core bus trait implemented by every transport
#[async_trait]
pub trait Bus: Send + Sync + fmt::Debug {
    /// Registry name of the transport implementation
    fn transport_type(&self) -> &str;

    /// Channel this transport is bound to (e.g. "can0")
    fn channel(&self) -> &str;

    /// Acquire OS resources if needed and start the reception task
    ///
    /// Returns once the task is launched. Connecting a connected transport is
    /// a no-op; it never starts a second reception task.
    async fn connect(&self) -> Result<()>;

    /// Cancel the reception task, wait for it to exit, release OS resources
    ///
    /// Safe on a never-connected transport and when called repeatedly.
    async fn disconnect(&self) -> Result<()>;

    /// Write one frame; a partial write is an error
    async fn send(&self, frame: &Frame) -> Result<()>;

    /// Install the listener invoked per received frame (last call wins)
    fn subscribe(&self, listener: Box<dyn FrameListener>);

    /// Whether a reception task is currently attached
    fn is_connected(&self) -> bool;

    /// Snapshot of transport counters
    fn stats(&self) -> BusStats;

    /// Watch the lifecycle of the reception task
    fn reception_state(&self) -> watch::Receiver<ReceptionState>;
}

/// Lifecycle of a transport's reception task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceptionState {
    /// Never connected
    Idle,
    /// Reception task is running
    Running,
    /// Reception task exited after cancellation
    Stopped,
    /// Reception task terminated on a fatal error
    Failed(String),
}

impl ReceptionState {
    pub fn is_running(&self) -> bool {
        matches!(self, ReceptionState::Running)
    }
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Frames accepted by the OS for transmission
    pub frames_sent: u64,
    /// Frames delivered to the listener
    pub frames_received: u64,
    /// Frames discarded (invalid records, kernel ring overruns)
    pub frames_dropped: u64,
    /// Receive calls that failed with anything other than a timeout
    pub receive_errors: u64,
}

/// Lock-free counters updated from the hot path
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    receive_errors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BusStats {
        BusStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// Listener reference swapped atomically by `subscribe`, read per frame
pub(crate) struct ListenerSlot {
    inner: ArcSwap<Box<dyn FrameListener>>,
}

impl ListenerSlot {
    pub(crate) fn new() -> Self {
        let noop: Box<dyn FrameListener> = Box::new(NoopListener);
        Self {
            inner: ArcSwap::new(Arc::new(noop)),
        }
    }

    pub(crate) fn replace(&self, listener: Box<dyn FrameListener>) {
        self.inner.store(Arc::new(listener));
    }

    #[inline]
    pub(crate) fn dispatch(&self, frame: Frame) {
        self.inner.load().handle(frame);
    }
}

impl fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ListenerSlot")
    }
}

/// State every transport shares with its reception task
#[derive(Debug)]
pub(crate) struct Reception {
    pub(crate) listener: ListenerSlot,
    pub(crate) stats: StatsCounters,
    state: watch::Sender<ReceptionState>,
}

impl Reception {
    pub(crate) fn new() -> Arc<Self> {
        let (state, _) = watch::channel(ReceptionState::Idle);
        Arc::new(Self {
            listener: ListenerSlot::new(),
            stats: StatsCounters::default(),
            state,
        })
    }

    /// Hand one received frame to the listener
    #[inline]
    pub(crate) fn deliver(&self, frame: Frame) {
        self.stats.record_received();
        self.listener.dispatch(frame);
    }

    pub(crate) fn set_state(&self, state: ReceptionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ReceptionState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listener_slot_last_subscribe_wins() {
        let slot = ListenerSlot::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let sink = first.clone();
        slot.replace(Box::new(move |frame: Frame| sink.lock().push(frame)));
        slot.dispatch(Frame::new(0x1, &[]).unwrap());

        let sink = second.clone();
        slot.replace(Box::new(move |frame: Frame| sink.lock().push(frame)));
        slot.dispatch(Frame::new(0x2, &[]).unwrap());

        assert_eq!(first.lock().len(), 1);
        assert_eq!(second.lock().len(), 1);
        assert_eq!(second.lock()[0].id(), 0x2);

        // No-op listener is the deregistration idiom
        slot.replace(Box::new(NoopListener));
        slot.dispatch(Frame::new(0x3, &[]).unwrap());
        assert_eq!(second.lock().len(), 1);
    }

    #[test]
    fn test_stats_counters() {
        let counters = StatsCounters::default();
        counters.record_sent();
        counters.record_received();
        counters.record_received();
        counters.record_dropped(3);
        counters.record_receive_error();

        let stats = counters.snapshot();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(stats.receive_errors, 1);
    }

    #[test]
    fn test_reception_state_watch() {
        let reception = Reception::new();
        let rx = reception.watch();
        assert_eq!(*rx.borrow(), ReceptionState::Idle);

        reception.set_state(ReceptionState::Running);
        assert!(rx.borrow().is_running());

        reception.set_state(ReceptionState::Failed("socket closed".to_string()));
        assert_eq!(
            *rx.borrow(),
            ReceptionState::Failed("socket closed".to_string())
        );
    }
}
