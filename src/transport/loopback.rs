#![forbid(unsafe_code)]

// In-memory transport. Both endpoints live in one process and exchange events through
// spawned tasks. Optional limits reproduce the ways real stacks fail at scale.

use super::{
    CandidateHandler, ChannelHandler, DataChannel, EndpointRole, EventHandler, IceCandidate,
    MediaSource, MessageHandler, Platform, ReadyState, RemoteTrack, RenderSink, Representation,
    SdpType, SessionDescription, SessionEndpoint, TrackHandler,
};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Simulated frame pacing for rendered tracks
const FRAME_INTERVAL: Duration = Duration::from_millis(33);
const FRAME_BYTES: usize = 1100;

/// What happens to channels beyond `max_channels`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Overflow {
    /// Never opens and never reports an error
    Silent,
    /// Reports closed without ever opening
    CloseEarly,
}

/// Which capture entry points source elements expose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSupport {
    Primary,
    FallbackOnly,
    Unsupported,
}

#[derive(Debug, Clone)]
pub struct LoopbackLimits {
    pub max_channels: Option<usize>,
    pub max_streams: Option<usize>,
    pub overflow: Overflow,
    pub reject_offer: bool,
    pub capture: CaptureSupport,
    /// Delay before a source element reaches can-play readiness
    pub can_play_delay: Duration,
    /// When false the ended flag never flips, as on loaded browsers
    pub reports_ended: bool,
    /// Alters every payload sent by the answering side
    pub corrupt_echo: bool,
    /// Refuses every relayed candidate, even after a remote description
    pub reject_candidates: bool,
}

impl Default for LoopbackLimits {
    fn default() -> Self {
        Self {
            max_channels: None,
            max_streams: None,
            overflow: Overflow::Silent,
            reject_offer: false,
            capture: CaptureSupport::Primary,
            can_play_delay: Duration::ZERO,
            reports_ended: true,
            corrupt_echo: false,
            reject_candidates: false,
        }
    }
}

type Registry = Mutex<HashMap<u64, Weak<LoopbackEndpoint>>>;

/// Platform handing out in-memory endpoints that find each other through their SDP.
pub struct LoopbackPlatform {
    limits: LoopbackLimits,
    registry: Arc<Registry>,
    next_id: AtomicU64,
}

impl LoopbackPlatform {
    pub fn new(limits: LoopbackLimits) -> Self {
        Self {
            limits,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for LoopbackPlatform {
    fn default() -> Self {
        Self::new(LoopbackLimits::default())
    }
}

#[async_trait]
impl Platform for LoopbackPlatform {
    type Source = LoopbackSource;
    type Endpoint = LoopbackEndpoint;

    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn create_endpoint(&self, role: EndpointRole) -> TransportResult<Arc<LoopbackEndpoint>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = Arc::new_cyclic(|me| LoopbackEndpoint {
            id,
            role,
            me: me.clone(),
            limits: self.limits.clone(),
            registry: Arc::clone(&self.registry),
            state: Mutex::new(EndpointState::default()),
        });
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::downgrade(&endpoint));
        debug!("Loopback endpoint {} created ({})", id, role);
        Ok(endpoint)
    }

    async fn create_media_source(
        &self,
        element_id: &str,
        representations: &[String],
    ) -> TransportResult<Arc<LoopbackSource>> {
        let seconds = representations
            .iter()
            .find_map(|raw| match Representation::parse(raw) {
                Ok(Representation::Synthetic { seconds }) => Some(seconds),
                _ => None,
            })
            .ok_or_else(|| TransportError::UnsupportedMedia(representations.join(", ")))?;

        Ok(LoopbackSource::new(element_id, seconds, &self.limits))
    }
}

#[derive(Default)]
struct EndpointState {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    peer: Option<Weak<LoopbackEndpoint>>,
    created: Vec<Arc<LoopbackChannel>>,
    accepted: Vec<Arc<LoopbackChannel>>,
    streams: Vec<LoopbackStream>,
    feeds: Vec<Arc<TrackFeed>>,
    remote_candidates: Vec<IceCandidate>,
    candidate_handler: Option<Arc<CandidateHandler>>,
    channel_handler: Option<Arc<ChannelHandler<LoopbackChannel>>>,
    track_handler: Option<Arc<TrackHandler<LoopbackTrack>>>,
    connected: bool,
    closed: bool,
}

pub struct LoopbackEndpoint {
    id: u64,
    role: EndpointRole,
    me: Weak<LoopbackEndpoint>,
    limits: LoopbackLimits,
    registry: Arc<Registry>,
    state: Mutex<EndpointState>,
}

impl LoopbackEndpoint {
    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn describe(&self, kind: SdpType) -> SessionDescription {
        let state = self.lock();
        SessionDescription {
            kind,
            sdp: format!(
                "v=0\r\no=loopback {}\r\na=channels:{}\r\na=streams:{}\r\n",
                self.id,
                state.created.len(),
                state.streams.len()
            ),
        }
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.lock().closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn peer_from_sdp(&self, sdp: &str) -> TransportResult<Weak<LoopbackEndpoint>> {
        let peer_id = sdp
            .lines()
            .find_map(|line| line.strip_prefix("o=loopback "))
            .and_then(|id| id.trim().parse::<u64>().ok())
            .ok_or_else(|| TransportError::Rejected("Malformed loopback description".to_string()))?;

        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer_id)
            .cloned()
            .ok_or_else(|| TransportError::Rejected(format!("Unknown loopback peer {peer_id}")))
    }

    /// Emits a couple of host candidates as soon as a description is committed.
    fn gather_candidates(&self) {
        let Some(handler) = self.lock().candidate_handler.clone() else {
            return;
        };
        for n in 0..2u16 {
            handler(IceCandidate {
                candidate: format!(
                    "candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host",
                    40_000 + self.id * 2 + u64::from(n)
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            });
        }
    }

    fn connect(&self) {
        let (Some(me), Some(peer)) = (self.me.upgrade(), self.lock().peer.clone()) else {
            return;
        };
        let Some(peer) = peer.upgrade() else {
            warn!("Loopback endpoint {} lost its peer before connecting", self.id);
            return;
        };
        me.lock().connected = true;
        peer.lock().connected = true;

        tokio::spawn(async move {
            deliver(&me, &peer).await;
            deliver(&peer, &me).await;
        });
    }
}

/// Hands every channel and stream created on `from` over to `to`.
async fn deliver(from: &Arc<LoopbackEndpoint>, to: &Arc<LoopbackEndpoint>) {
    let (channels, streams) = {
        let state = from.lock();
        (state.created.clone(), state.streams.clone())
    };
    let (channel_handler, track_handler) = {
        let state = to.lock();
        (state.channel_handler.clone(), state.track_handler.clone())
    };

    for (index, channel) in channels.iter().enumerate() {
        if from.limits.max_channels.is_some_and(|max| index >= max) {
            match from.limits.overflow {
                Overflow::Silent => debug!("Dropping channel '{}' silently", channel.label),
                Overflow::CloseEarly => channel.fire_close(),
            }
            continue;
        }

        let accepted = Arc::new(LoopbackChannel::new(&channel.label, to.limits.corrupt_echo));
        LoopbackChannel::link(channel, &accepted);
        to.lock().accepted.push(Arc::clone(&accepted));

        if let Some(handler) = &channel_handler {
            handler(Arc::clone(&accepted));
        }
        channel.fire_open();
        accepted.fire_open();
        tokio::task::yield_now().await;
    }

    for stream in streams {
        for track_id in &stream.tracks {
            let track = Arc::new(LoopbackTrack {
                track_id: track_id.clone(),
                stream_id: stream.stream_id.clone(),
                feed: Arc::clone(&stream.feed),
            });
            to.lock().feeds.push(Arc::clone(&stream.feed));
            if let Some(handler) = &track_handler {
                handler(track);
            }
        }
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

#[async_trait]
impl SessionEndpoint for LoopbackEndpoint {
    type Channel = LoopbackChannel;
    type Track = LoopbackTrack;
    type Stream = LoopbackStream;

    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        self.ensure_open()?;
        if self.limits.reject_offer {
            return Err(TransportError::Rejected("Offer rejected by platform".to_string()));
        }
        Ok(self.describe(SdpType::Offer))
    }

    async fn create_answer(&self) -> TransportResult<SessionDescription> {
        self.ensure_open()?;
        let has_offer = matches!(
            self.lock().remote_description,
            Some(SessionDescription { kind: SdpType::Offer, .. })
        );
        if !has_offer {
            return Err(TransportError::Rejected("No remote offer to answer".to_string()));
        }
        Ok(self.describe(SdpType::Answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> TransportResult<()> {
        self.ensure_open()?;
        self.lock().local_description = Some(description);
        self.gather_candidates();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> TransportResult<()> {
        self.ensure_open()?;
        let peer = self.peer_from_sdp(&description.sdp)?;
        let completes_offer = description.kind == SdpType::Answer;
        {
            let mut state = self.lock();
            state.peer = Some(peer);
            state.remote_description = Some(description);
        }
        if completes_offer {
            self.connect();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.remote_description.is_none() {
            return Err(TransportError::Rejected("Remote description not set".to_string()));
        }
        if self.limits.reject_candidates {
            return Err(TransportError::Rejected(format!(
                "Candidate refused by {} endpoint: {}",
                self.role, candidate.candidate
            )));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> TransportResult<Arc<LoopbackChannel>> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.connected {
            return Err(TransportError::Rejected("Renegotiation is not supported".to_string()));
        }
        let channel = Arc::new(LoopbackChannel::new(label, false));
        state.created.push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn add_stream(&self, stream: &LoopbackStream) -> TransportResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(max) = self.limits.max_streams {
            if state.streams.len() >= max {
                return Err(TransportError::Rejected(format!(
                    "Media pipeline limit of {max} streams reached"
                )));
            }
        }
        state.streams.push(stream.clone());
        debug!("Loopback endpoint {} ({}) added stream {}", self.id, self.role, stream.stream_id());
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let (channels, feeds) = {
            let mut state = self.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let channels: Vec<_> = state.created.iter().chain(state.accepted.iter()).cloned().collect();
            let feeds: Vec<_> = state
                .streams
                .iter()
                .map(|s| Arc::clone(&s.feed))
                .chain(state.feeds.iter().cloned())
                .collect();
            (channels, feeds)
        };

        // Closing the transport tears down both ends of every channel
        for channel in channels {
            channel.fire_close();
            if let Some(peer) = channel.peer() {
                peer.fire_close();
            }
        }
        for feed in feeds {
            feed.close();
        }
        debug!("Loopback endpoint {} closed", self.id);
        Ok(())
    }

    fn on_ice_candidate(&self, handler: CandidateHandler) {
        self.lock().candidate_handler = Some(Arc::new(handler));
    }

    fn on_new_channel(&self, handler: ChannelHandler<LoopbackChannel>) {
        self.lock().channel_handler = Some(Arc::new(handler));
    }

    fn on_new_track(&self, handler: TrackHandler<LoopbackTrack>) {
        self.lock().track_handler = Some(Arc::new(handler));
    }
}

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Default)]
struct ChannelHandlers {
    open: Option<Arc<EventHandler>>,
    message: Option<Arc<MessageHandler>>,
    close: Option<Arc<EventHandler>>,
}

pub struct LoopbackChannel {
    label: String,
    corrupt: bool,
    state: AtomicU8,
    peer: Mutex<Weak<LoopbackChannel>>,
    handlers: Mutex<ChannelHandlers>,
}

impl LoopbackChannel {
    fn new(label: &str, corrupt: bool) -> Self {
        Self {
            label: label.to_string(),
            corrupt,
            state: AtomicU8::new(CONNECTING),
            peer: Mutex::new(Weak::new()),
            handlers: Mutex::new(ChannelHandlers::default()),
        }
    }

    fn link(a: &Arc<LoopbackChannel>, b: &Arc<LoopbackChannel>) {
        *a.peer.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(b);
        *b.peer.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(a);
    }

    fn peer(&self) -> Option<Arc<LoopbackChannel>> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner()).upgrade()
    }

    fn handlers(&self) -> MutexGuard<'_, ChannelHandlers> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire_open(&self) {
        if self
            .state
            .compare_exchange(CONNECTING, OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let handler = self.handlers().open.clone();
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    fn fire_close(&self) {
        if self.state.swap(CLOSED, Ordering::SeqCst) != CLOSED {
            let handler = self.handlers().close.clone();
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    fn receive(&self, payload: Bytes) {
        if self.state.load(Ordering::SeqCst) != OPEN {
            return;
        }
        let handler = self.handlers().message.clone();
        if let Some(handler) = handler {
            handler(payload);
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn on_open(&self, handler: EventHandler) {
        self.handlers().open = Some(Arc::new(handler));
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers().message = Some(Arc::new(handler));
    }

    fn on_close(&self, handler: EventHandler) {
        self.handlers().close = Some(Arc::new(handler));
    }

    async fn send(&self, payload: Bytes) -> TransportResult<()> {
        if self.state.load(Ordering::SeqCst) != OPEN {
            return Err(TransportError::Closed);
        }
        let peer = self.peer().ok_or(TransportError::Closed)?;
        let payload = if self.corrupt {
            let mut altered = payload.to_vec();
            altered.push(b'?');
            Bytes::from(altered)
        } else {
            payload
        };
        tokio::spawn(async move { peer.receive(payload) });
        Ok(())
    }
}

/// Shared playback clock for one captured stream and every track made from it.
pub struct TrackFeed {
    duration: Duration,
    started: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

impl TrackFeed {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn start(&self) {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        started.get_or_insert_with(Instant::now);
    }

    fn position(&self) -> Duration {
        match *self.started.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(started) => started.elapsed().min(self.duration),
            None => Duration::ZERO,
        }
    }

    fn is_started(&self) -> bool {
        self.started.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn finished_playing(&self) -> bool {
        self.is_started() && self.position() >= self.duration
    }

    fn is_done(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.finished_playing()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct LoopbackStream {
    stream_id: String,
    tracks: Vec<String>,
    feed: Arc<TrackFeed>,
}

impl LoopbackStream {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

pub struct LoopbackTrack {
    track_id: String,
    stream_id: String,
    feed: Arc<TrackFeed>,
}

impl RemoteTrack for LoopbackTrack {
    fn track_id(&self) -> String {
        self.track_id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn render(&self, sink: Arc<RenderSink>) {
        let feed = Arc::clone(&self.feed);
        tokio::spawn(async move {
            let mut ticker = interval(FRAME_INTERVAL);
            loop {
                ticker.tick().await;
                if feed.is_done() {
                    break;
                }
                if feed.is_started() {
                    sink.record(FRAME_BYTES);
                }
            }
        });
    }
}

pub struct LoopbackSource {
    element_id: String,
    feed: Arc<TrackFeed>,
    ready: Mutex<ReadyState>,
    can_play: Mutex<Vec<EventHandler>>,
    capture: CaptureSupport,
    reports_ended: bool,
}

impl LoopbackSource {
    fn new(element_id: &str, seconds: f64, limits: &LoopbackLimits) -> Arc<Self> {
        let delay = limits.can_play_delay;
        let initial = if delay.is_zero() {
            ReadyState::HaveEnoughData
        } else {
            ReadyState::HaveMetadata
        };
        let source = Arc::new(Self {
            element_id: element_id.to_string(),
            feed: Arc::new(TrackFeed::new(Duration::from_secs_f64(seconds))),
            ready: Mutex::new(initial),
            can_play: Mutex::new(Vec::new()),
            capture: limits.capture,
            reports_ended: limits.reports_ended,
        });

        if !delay.is_zero() {
            let weak = Arc::downgrade(&source);
            tokio::spawn(async move {
                sleep(delay).await;
                if let Some(source) = weak.upgrade() {
                    source.become_ready();
                }
            });
        }
        source
    }

    fn become_ready(&self) {
        *self.ready.lock().unwrap_or_else(|e| e.into_inner()) = ReadyState::HaveEnoughData;
        let handlers = std::mem::take(&mut *self.can_play.lock().unwrap_or_else(|e| e.into_inner()));
        for handler in handlers {
            handler();
        }
    }

    fn capture(&self) -> LoopbackStream {
        LoopbackStream {
            stream_id: Uuid::new_v4().simple().to_string(),
            tracks: vec![
                format!("{}/video", self.element_id),
                format!("{}/audio", self.element_id),
            ],
            feed: Arc::clone(&self.feed),
        }
    }
}

#[async_trait]
impl MediaSource for LoopbackSource {
    type Stream = LoopbackStream;

    fn ready_state(&self) -> ReadyState {
        *self.ready.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_can_play(&self, handler: EventHandler) {
        self.can_play.lock().unwrap_or_else(|e| e.into_inner()).push(handler);
    }

    fn capture_stream(&self) -> Option<LoopbackStream> {
        (self.capture == CaptureSupport::Primary).then(|| self.capture())
    }

    fn capture_stream_fallback(&self) -> Option<LoopbackStream> {
        (self.capture == CaptureSupport::FallbackOnly).then(|| self.capture())
    }

    async fn play(&self) -> TransportResult<()> {
        self.feed.start();
        Ok(())
    }

    fn duration(&self) -> f64 {
        self.feed.duration.as_secs_f64()
    }

    fn current_time(&self) -> f64 {
        self.feed.position().as_secs_f64()
    }

    fn ended(&self) -> bool {
        self.reports_ended && self.feed.finished_playing()
    }
}
