#![forbid(unsafe_code)]

// Data channel pairs - creation, remote binding by label, echo and close signalling

use super::SessionPair;
use crate::error::HarnessResult;
use crate::signal::{Milestone, Signal, SignalBus, SignalWait};
use crate::transport::{DataChannel, SessionEndpoint};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Pending,
    Connected,
    Disconnected,
}

const PENDING: u8 = 0;
const CONNECTED: u8 = 1;
const DISCONNECTED: u8 = 2;

/// Both ends of channel `index`. The remote end is bound when the peer announces it.
pub struct ChannelDescriptor<C: DataChannel> {
    index: usize,
    local: Arc<C>,
    remote: OnceLock<Arc<C>>,
    state: AtomicU8,
    local_closed: AtomicBool,
    remote_closed: AtomicBool,
    sent: Mutex<Option<Bytes>>,
}

impl<C: DataChannel> ChannelDescriptor<C> {
    fn new(index: usize, local: Arc<C>) -> Self {
        Self {
            index,
            local,
            remote: OnceLock::new(),
            state: AtomicU8::new(PENDING),
            local_closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
            sent: Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn local(&self) -> &Arc<C> {
        &self.local
    }

    pub fn remote(&self) -> Option<&Arc<C>> {
        self.remote.get()
    }

    pub fn state(&self) -> ChannelState {
        match self.state.load(Ordering::SeqCst) {
            PENDING => ChannelState::Pending,
            CONNECTED => ChannelState::Connected,
            _ => ChannelState::Disconnected,
        }
    }

    /// Pending becomes connected on local open; a closed channel stays disconnected.
    fn mark_open(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, CONNECTED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Emits `signal` unless this side already reported closed.
    fn mark_closed(&self, flag: &AtomicBool, signal: Signal, bus: &SignalBus) {
        if !flag.swap(true, Ordering::SeqCst) {
            self.state.store(DISCONNECTED, Ordering::SeqCst);
            bus.emit(signal);
        }
    }

    fn echo_matches(&self, payload: &Bytes) -> bool {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|sent| sent == payload)
    }
}

/// Every channel of one run, indexed by position.
pub struct ChannelPairs<C: DataChannel> {
    bus: SignalBus,
    descriptors: Vec<Arc<ChannelDescriptor<C>>>,
}

impl<C: DataChannel> ChannelPairs<C> {
    /// Creates `count` channels on the local endpoint, labelled by index, and
    /// binds incoming channels on the remote endpoint.
    pub async fn create<E>(pair: &SessionPair<E>, bus: &SignalBus, count: usize) -> HarnessResult<Self>
    where
        E: SessionEndpoint<Channel = C>,
    {
        let mut descriptors = Vec::with_capacity(count);
        for index in 0..count {
            let local = pair.local.create_channel(&index.to_string()).await?;
            let descriptor = Arc::new(ChannelDescriptor::new(index, local));
            bind_local(&descriptor, bus);
            descriptors.push(descriptor);
        }

        let lookup: Vec<Weak<ChannelDescriptor<C>>> = descriptors.iter().map(Arc::downgrade).collect();
        let remote_bus = bus.clone();
        pair.remote.on_new_channel(Box::new(move |channel: Arc<C>| {
            bind_remote(&lookup, channel, &remote_bus);
        }));

        debug!("Created {} channels", count);
        Ok(Self {
            bus: bus.clone(),
            descriptors,
        })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[Arc<ChannelDescriptor<C>>] {
        &self.descriptors
    }

    /// Both open signals per channel; either side closing first fails the wait.
    pub fn wait_opened(&self) -> Vec<SignalWait> {
        self.descriptors
            .iter()
            .flat_map(|d| {
                let i = d.index;
                [
                    self.bus.wait_for(Signal::open_local(i), [Signal::closed_local(i)]),
                    self.bus.wait_for(Signal::open_remote(i), [Signal::closed_remote(i)]),
                ]
            })
            .collect()
    }

    /// Both data signals per channel. Register before [`ChannelPairs::send_all`].
    pub fn wait_echoed(&self) -> Vec<SignalWait> {
        self.descriptors
            .iter()
            .flat_map(|d| {
                let i = d.index;
                let mismatch = Signal::new(Milestone::EchoMismatch, i);
                [
                    self.bus.wait_for(
                        Signal::data_remote(i),
                        [Signal::closed_local(i), Signal::closed_remote(i)],
                    ),
                    self.bus.wait_for(
                        Signal::data_local(i),
                        [Signal::closed_local(i), Signal::closed_remote(i), mismatch],
                    ),
                ]
            })
            .collect()
    }

    /// Both close signals per channel, with no failure conditions.
    pub fn wait_closed(&self) -> Vec<SignalWait> {
        self.descriptors
            .iter()
            .flat_map(|d| {
                [
                    self.bus.wait_for(Signal::closed_local(d.index), []),
                    self.bus.wait_for(Signal::closed_remote(d.index), []),
                ]
            })
            .collect()
    }

    /// Sends one message on every local channel.
    pub async fn send_all(&self) -> HarnessResult<()> {
        for descriptor in &self.descriptors {
            let payload = Bytes::from(format!("Message on channel {}", descriptor.index));
            *descriptor.sent.lock().unwrap_or_else(|e| e.into_inner()) = Some(payload.clone());
            descriptor.local.send(payload).await?;
        }
        Ok(())
    }

    /// Reports channel `index` closed on both sides, as if the platform had.
    pub fn synthesize_closed(&self, index: usize) {
        if let Some(descriptor) = self.descriptors.get(index) {
            descriptor.mark_closed(&descriptor.local_closed, Signal::closed_local(index), &self.bus);
            descriptor.mark_closed(&descriptor.remote_closed, Signal::closed_remote(index), &self.bus);
        }
    }
}

fn bind_local<C: DataChannel>(descriptor: &Arc<ChannelDescriptor<C>>, bus: &SignalBus) {
    let index = descriptor.index;

    let weak = Arc::downgrade(descriptor);
    let signals = bus.clone();
    descriptor.local.on_open(Box::new(move || {
        if let Some(d) = weak.upgrade() {
            d.mark_open();
        }
        signals.emit(Signal::open_local(index));
    }));

    let weak = Arc::downgrade(descriptor);
    let signals = bus.clone();
    descriptor.local.on_message(Box::new(move |payload: Bytes| {
        let Some(d) = weak.upgrade() else {
            return;
        };
        if d.echo_matches(&payload) {
            signals.emit(Signal::data_local(index));
        } else {
            warn!(
                "Channel {} echoed {:?}",
                index,
                String::from_utf8_lossy(&payload)
            );
            signals.emit(Signal::new(Milestone::EchoMismatch, index));
        }
    }));

    let weak = Arc::downgrade(descriptor);
    let signals = bus.clone();
    descriptor.local.on_close(Box::new(move || {
        if let Some(d) = weak.upgrade() {
            d.mark_closed(&d.local_closed, Signal::closed_local(index), &signals);
        }
    }));
}

/// Binds a channel announced by the peer to the descriptor named by its label.
fn bind_remote<C: DataChannel>(
    lookup: &[Weak<ChannelDescriptor<C>>],
    channel: Arc<C>,
    bus: &SignalBus,
) {
    let label = channel.label();
    let Some(descriptor) = label
        .parse::<usize>()
        .ok()
        .and_then(|index| lookup.get(index))
        .and_then(Weak::upgrade)
    else {
        warn!("Ignoring channel with unexpected label '{}'", label);
        return;
    };
    let index = descriptor.index;
    if descriptor.remote.set(Arc::clone(&channel)).is_err() {
        warn!("Channel {} announced twice, ignoring the duplicate", index);
        return;
    }

    let signals = bus.clone();
    channel.on_open(Box::new(move || signals.emit(Signal::open_remote(index))));

    let echo = Arc::downgrade(&channel);
    let signals = bus.clone();
    channel.on_message(Box::new(move |payload: Bytes| {
        let Some(channel) = echo.upgrade() else {
            return;
        };
        let signals = signals.clone();
        tokio::spawn(async move {
            match channel.send(payload).await {
                Ok(()) => signals.emit(Signal::data_remote(index)),
                Err(e) => {
                    warn!("Channel {} failed to echo: {}", index, e);
                    signals.emit(Signal::new(Milestone::EchoMismatch, index));
                }
            }
        });
    }));

    let weak = Arc::downgrade(&descriptor);
    let signals = bus.clone();
    channel.on_close(Box::new(move || {
        if let Some(d) = weak.upgrade() {
            d.mark_closed(&d.remote_closed, Signal::closed_remote(index), &signals);
        }
    }));
}
