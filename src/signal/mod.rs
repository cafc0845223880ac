#![forbid(unsafe_code)]

// Signal bus - typed milestone emit/await used to synchronize a test run.
// Emission is not buffered: a waiter registered after a signal fired never sees it.

pub mod wait;

use crate::error::{HarnessError, HarnessResult};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

/// Kinds of milestone a run synchronizes on. Each is paired with an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Milestone {
    ChannelOpenLocal,
    ChannelOpenRemote,
    DataReceivedLocal,
    DataReceivedRemote,
    ChannelClosedLocal,
    ChannelClosedRemote,
    EchoMismatch,
    SourceCanPlay,
}

impl Milestone {
    pub fn name(self) -> &'static str {
        match self {
            Milestone::ChannelOpenLocal => "channel-open-local",
            Milestone::ChannelOpenRemote => "channel-open-remote",
            Milestone::DataReceivedLocal => "data-received-local",
            Milestone::DataReceivedRemote => "data-received-remote",
            Milestone::ChannelClosedLocal => "channel-closed-local",
            Milestone::ChannelClosedRemote => "channel-closed-remote",
            Milestone::EchoMismatch => "echo-mismatch",
            Milestone::SourceCanPlay => "source-can-play",
        }
    }
}

/// A milestone for one channel or source index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal {
    pub milestone: Milestone,
    pub index: usize,
}

impl Signal {
    pub fn new(milestone: Milestone, index: usize) -> Self {
        Self { milestone, index }
    }

    pub fn open_local(index: usize) -> Self {
        Self::new(Milestone::ChannelOpenLocal, index)
    }

    pub fn open_remote(index: usize) -> Self {
        Self::new(Milestone::ChannelOpenRemote, index)
    }

    pub fn data_local(index: usize) -> Self {
        Self::new(Milestone::DataReceivedLocal, index)
    }

    pub fn data_remote(index: usize) -> Self {
        Self::new(Milestone::DataReceivedRemote, index)
    }

    pub fn closed_local(index: usize) -> Self {
        Self::new(Milestone::ChannelClosedLocal, index)
    }

    pub fn closed_remote(index: usize) -> Self {
        Self::new(Milestone::ChannelClosedRemote, index)
    }

    /// Maps a failure signal observed while waiting for `awaited` to a run error.
    fn failure(awaited: Signal, observed: Signal) -> HarnessError {
        match observed.milestone {
            Milestone::EchoMismatch => HarnessError::EchoMismatch { index: observed.index },
            _ => HarnessError::ClosedPrematurely { awaited, observed },
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.milestone.name(), self.index)
    }
}

/// One registered wait. Shared by every key the wait listens on; the first
/// emission takes the sender and the remaining registrations become inert.
type Slot = Arc<Mutex<Option<oneshot::Sender<Signal>>>>;

/// Per-run broadcast point for milestone signals.
#[derive(Clone, Default)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    waiters: Mutex<HashMap<Signal, Vec<Slot>>>,
    history: Option<Mutex<Vec<Signal>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bus that records every emitted signal, in order.
    pub fn with_history() -> Self {
        Self {
            inner: Arc::new(BusInner {
                waiters: Mutex::new(HashMap::new()),
                history: Some(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Fires every waiter currently registered for `signal`, then forgets them.
    pub fn emit(&self, signal: Signal) {
        let slots = {
            let mut waiters = self.inner.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.remove(&signal).unwrap_or_default()
        };

        if let Some(history) = &self.inner.history {
            history.lock().unwrap_or_else(|e| e.into_inner()).push(signal);
        }
        trace!("Signal {} ({} waiters)", signal, slots.len());

        for slot in slots {
            let sender = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(sender) = sender {
                // Receiver may already be gone when an aggregate wait failed fast
                let _ = sender.send(signal);
            }
        }
    }

    /// Registers a wait now and returns the future that observes it.
    ///
    /// The future resolves when `success` is emitted and fails if any of
    /// `failures` is emitted first.
    pub fn wait_for<I>(&self, success: Signal, failures: I) -> SignalWait
    where
        I: IntoIterator<Item = Signal>,
    {
        let (tx, rx) = oneshot::channel();
        let slot: Slot = Arc::new(Mutex::new(Some(tx)));

        let mut waiters = self.inner.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.entry(success).or_default().push(Arc::clone(&slot));
        for failure in failures {
            waiters.entry(failure).or_default().push(Arc::clone(&slot));
        }

        SignalWait { awaited: success, rx }
    }

    /// Signals emitted so far. Empty unless created with [`SignalBus::with_history`].
    pub fn history(&self) -> Vec<Signal> {
        self.inner
            .history
            .as_ref()
            .map(|h| h.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }
}

/// Future returned by [`SignalBus::wait_for`].
pub struct SignalWait {
    awaited: Signal,
    rx: oneshot::Receiver<Signal>,
}

impl Future for SignalWait {
    type Output = HarnessResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let awaited = self.awaited;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(observed)) if observed == awaited => Poll::Ready(Ok(())),
            Poll::Ready(Ok(observed)) => Poll::Ready(Err(Signal::failure(awaited, observed))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(HarnessError::SignalLost { awaited })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::open_local(3).to_string(), "channel-open-local-3");
        assert_eq!(Signal::closed_remote(0).to_string(), "channel-closed-remote-0");
        assert_eq!(Signal::data_remote(12).to_string(), "data-received-remote-12");
    }

    #[tokio::test]
    async fn test_emit_resolves_all_waiters() {
        let bus = SignalBus::new();
        let first = bus.wait_for(Signal::open_local(1), []);
        let second = bus.wait_for(Signal::open_local(1), []);

        bus.emit(Signal::open_local(1));

        assert!(first.await.is_ok());
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn test_no_replay_for_late_waiters() {
        let bus = SignalBus::new();
        bus.emit(Signal::open_local(0));

        let late = bus.wait_for(Signal::open_local(0), []);
        assert!(timeout(Duration::from_millis(20), late).await.is_err());
    }

    #[tokio::test]
    async fn test_failure_signal_rejects() {
        let bus = SignalBus::new();
        let wait = bus.wait_for(Signal::open_remote(2), [Signal::closed_remote(2)]);

        bus.emit(Signal::closed_remote(2));
        bus.emit(Signal::open_remote(2));

        match wait.await {
            Err(HarnessError::ClosedPrematurely { awaited, observed }) => {
                assert_eq!(awaited, Signal::open_remote(2));
                assert_eq!(observed, Signal::closed_remote(2));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_echo_mismatch_maps_to_its_own_error() {
        let bus = SignalBus::new();
        let wait = bus.wait_for(
            Signal::data_local(4),
            [Signal::new(Milestone::EchoMismatch, 4)],
        );
        bus.emit(Signal::new(Milestone::EchoMismatch, 4));
        assert!(matches!(wait.await, Err(HarnessError::EchoMismatch { index: 4 })));
    }

    #[tokio::test]
    async fn test_success_wins_when_emitted_first() {
        let bus = SignalBus::new();
        let wait = bus.wait_for(Signal::open_local(0), [Signal::closed_local(0)]);
        bus.emit(Signal::open_local(0));
        bus.emit(Signal::closed_local(0));
        assert!(wait.await.is_ok());
    }

    #[tokio::test]
    async fn test_other_indices_do_not_resolve() {
        let bus = SignalBus::new();
        let wait = bus.wait_for(Signal::open_local(1), [Signal::closed_local(1)]);
        bus.emit(Signal::open_local(2));
        bus.emit(Signal::closed_local(0));
        assert!(timeout(Duration::from_millis(20), wait).await.is_err());
    }

    #[test]
    fn test_history_records_in_order() {
        let bus = SignalBus::with_history();
        bus.emit(Signal::open_local(0));
        bus.emit(Signal::open_remote(0));
        assert_eq!(bus.history(), vec![Signal::open_local(0), Signal::open_remote(0)]);
        assert!(SignalBus::new().history().is_empty());
    }
}
