#![forbid(unsafe_code)]

// Transport capability - what a test run drives on the underlying real-time platform.
// The run never implements negotiation or media itself; a Platform supplies both.

pub mod loopback;
pub mod rtc;

use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use loopback::{CaptureSupport, LoopbackLimits, LoopbackPlatform, Overflow};
pub use rtc::RtcPlatform;

/// Offer or answer half of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpType,
    pub sdp: String,
}

/// A discovered connectivity option, relayed verbatim between endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Which side of the session pair an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Local,
    Remote,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRole::Local => f.write_str("local"),
            EndpointRole::Remote => f.write_str("remote"),
        }
    }
}

/// Media element readiness, ordered from least to most data available
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

impl ReadyState {
    /// Whether playback can begin without stalling right away.
    pub fn can_play(self) -> bool {
        self >= ReadyState::HaveFutureData
    }
}

/// Longest generated clip, in seconds
pub const MAX_SYNTHETIC_SECONDS: f64 = 3600.0;

/// One representation of the clip a source element may load.
#[derive(Debug, Clone, PartialEq)]
pub enum Representation {
    /// IVF container holding VP8 or VP9 frames
    Ivf(PathBuf),
    /// Generated frames of the given length in seconds
    Synthetic { seconds: f64 },
}

impl Representation {
    pub fn parse(raw: &str) -> TransportResult<Self> {
        if let Some(seconds) = raw.strip_prefix("synthetic:") {
            let seconds: f64 = seconds
                .parse()
                .map_err(|_| TransportError::Media(format!("Invalid synthetic length: {raw}")))?;
            if !seconds.is_finite() || seconds <= 0.0 {
                return Err(TransportError::Media(format!("Invalid synthetic length: {raw}")));
            }
            if seconds > MAX_SYNTHETIC_SECONDS {
                return Err(TransportError::Media(format!(
                    "Synthetic length {raw} exceeds {MAX_SYNTHETIC_SECONDS} seconds"
                )));
            }
            return Ok(Representation::Synthetic { seconds });
        }
        if raw.to_ascii_lowercase().ends_with(".ivf") {
            return Ok(Representation::Ivf(PathBuf::from(raw)));
        }
        Err(TransportError::UnsupportedMedia(raw.to_string()))
    }
}

pub type EventHandler = Box<dyn Fn() + Send + Sync>;
pub type MessageHandler = Box<dyn Fn(Bytes) + Send + Sync>;
pub type CandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;
pub type ChannelHandler<C> = Box<dyn Fn(Arc<C>) + Send + Sync>;
pub type TrackHandler<T> = Box<dyn Fn(Arc<T>) + Send + Sync>;

/// Reliable, ordered message pipe. Handlers may fire on any runtime task.
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    fn label(&self) -> String;
    fn on_open(&self, handler: EventHandler);
    fn on_message(&self, handler: MessageHandler);
    fn on_close(&self, handler: EventHandler);
    async fn send(&self, payload: Bytes) -> TransportResult<()>;
}

/// Running totals for what a rendering target consumed.
#[derive(Debug, Default)]
pub struct RenderSink {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl RenderSink {
    pub fn record(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// A track that arrived from the peer.
pub trait RemoteTrack: Send + Sync + 'static {
    fn track_id(&self) -> String;
    fn stream_id(&self) -> String;
    /// Starts consuming the track into `sink` until the track ends.
    fn render(&self, sink: Arc<RenderSink>);
}

/// A playable source element with a captureable live stream.
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    type Stream: Send + Sync + 'static;

    fn ready_state(&self) -> ReadyState;
    fn on_can_play(&self, handler: EventHandler);
    fn capture_stream(&self) -> Option<Self::Stream>;
    /// Alternate capture entry point for platforms that expose one.
    fn capture_stream_fallback(&self) -> Option<Self::Stream>;
    async fn play(&self) -> TransportResult<()>;
    /// Clip length in seconds
    fn duration(&self) -> f64;
    /// Playback position in seconds
    fn current_time(&self) -> f64;
    fn ended(&self) -> bool;
}

/// One side of a peer-to-peer session.
#[async_trait]
pub trait SessionEndpoint: Send + Sync + 'static {
    type Channel: DataChannel;
    type Track: RemoteTrack;
    type Stream: Send + Sync + 'static;

    async fn create_offer(&self) -> TransportResult<SessionDescription>;
    async fn create_answer(&self) -> TransportResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> TransportResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> TransportResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()>;
    /// Opens an ordered channel with the given label.
    async fn create_channel(&self, label: &str) -> TransportResult<Arc<Self::Channel>>;
    /// Adds every track of a captured stream so it is offered to the peer.
    async fn add_stream(&self, stream: &Self::Stream) -> TransportResult<()>;
    async fn close(&self) -> TransportResult<()>;

    fn on_ice_candidate(&self, handler: CandidateHandler);
    fn on_new_channel(&self, handler: ChannelHandler<Self::Channel>);
    fn on_new_track(&self, handler: TrackHandler<Self::Track>);
}

/// Factory for endpoints and source elements of one transport implementation.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    type Source: MediaSource;
    type Endpoint: SessionEndpoint<Stream = <Self::Source as MediaSource>::Stream>;

    fn name(&self) -> &'static str;
    async fn create_endpoint(&self, role: EndpointRole) -> TransportResult<Arc<Self::Endpoint>>;
    /// Creates a source element bound to the first playable representation.
    async fn create_media_source(
        &self,
        element_id: &str,
        representations: &[String],
    ) -> TransportResult<Arc<Self::Source>>;
}
