#![forbid(unsafe_code)]

// webrtc-rs backend - both endpoints are real peer connections in this process,
// joined over host candidates with loopback addresses included.

mod media;

pub use media::{RtcMediaSource, RtcStream};

use super::{
    CandidateHandler, ChannelHandler, DataChannel, EndpointRole, EventHandler, IceCandidate,
    MessageHandler, Platform, RemoteTrack, RenderSink, SdpType, SessionDescription,
    SessionEndpoint, TrackHandler,
};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        TransportError::Platform(e.to_string())
    }
}

/// Platform backed by webrtc-rs peer connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcPlatform;

impl RtcPlatform {
    pub fn new() -> Self {
        Self
    }
}

/// A fresh API per endpoint: media engines are consumed by the builder.
fn build_api() -> TransportResult<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let mut settings = SettingEngine::default();
    settings.set_include_loopback_candidate(true);

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(settings)
        .build())
}

#[async_trait]
impl Platform for RtcPlatform {
    type Source = RtcMediaSource;
    type Endpoint = RtcEndpoint;

    fn name(&self) -> &'static str {
        "webrtc-rs"
    }

    async fn create_endpoint(&self, role: EndpointRole) -> TransportResult<Arc<RtcEndpoint>> {
        let api = build_api()?;
        let pc = api.new_peer_connection(RTCConfiguration::default()).await?;

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("{} peer connection state: {}", role, state);
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcEndpoint {
            role,
            pc: Arc::new(pc),
        }))
    }

    async fn create_media_source(
        &self,
        element_id: &str,
        representations: &[String],
    ) -> TransportResult<Arc<RtcMediaSource>> {
        RtcMediaSource::load(element_id, representations).await
    }
}

fn to_rtc(description: SessionDescription) -> TransportResult<RTCSessionDescription> {
    let converted = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(converted)
}

fn from_rtc(description: RTCSessionDescription) -> TransportResult<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(TransportError::Platform(format!(
                "Unexpected description type: {other}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

pub struct RtcEndpoint {
    role: EndpointRole,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl SessionEndpoint for RtcEndpoint {
    type Channel = RtcChannel;
    type Track = RtcRemoteTrack;
    type Stream = RtcStream;

    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> TransportResult<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, description: SessionDescription) -> TransportResult<()> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> TransportResult<()> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> TransportResult<Arc<RtcChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        Ok(Arc::new(RtcChannel { dc }))
    }

    async fn add_stream(&self, stream: &RtcStream) -> TransportResult<()> {
        for track in stream.tracks() {
            let sender = self
                .pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;

            // RTCP has to be drained for interceptors to keep running
            let role = self.role;
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
                debug!("{} RTCP reader stopped", role);
            });
        }
        debug!("{} added stream {}", self.role, stream.stream_id());
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.pc.close().await?;
        Ok(())
    }

    fn on_ice_candidate(&self, handler: CandidateHandler) {
        let handler = Arc::new(handler);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    // None marks the end of gathering
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => handler(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                })
            }));
    }

    fn on_new_channel(&self, handler: ChannelHandler<RtcChannel>) {
        let handler = Arc::new(handler);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move { handler(Arc::new(RtcChannel { dc })) })
            }));
    }

    fn on_new_track(&self, handler: TrackHandler<RtcRemoteTrack>) {
        let handler = Arc::new(handler);
        // Must return quickly: webrtc-rs holds the handler lock while the future runs
        self.pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let handler = Arc::clone(&handler);
                Box::pin(async move { handler(Arc::new(RtcRemoteTrack { track })) })
            }));
    }
}

pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn on_open(&self, handler: EventHandler) {
        self.dc.on_open(Box::new(move || {
            handler();
            Box::pin(async {})
        }));
    }

    fn on_message(&self, handler: MessageHandler) {
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            handler(msg.data);
            Box::pin(async {})
        }));
    }

    fn on_close(&self, handler: EventHandler) {
        self.dc.on_close(Box::new(move || {
            handler();
            Box::pin(async {})
        }));
    }

    async fn send(&self, payload: Bytes) -> TransportResult<()> {
        self.dc.send(&payload).await?;
        Ok(())
    }
}

pub struct RtcRemoteTrack {
    track: Arc<TrackRemote>,
}

impl RemoteTrack for RtcRemoteTrack {
    fn track_id(&self) -> String {
        self.track.id()
    }

    fn stream_id(&self) -> String {
        self.track.stream_id()
    }

    fn render(&self, sink: Arc<RenderSink>) {
        let track = Arc::clone(&self.track);
        tokio::spawn(async move {
            let ssrc = track.ssrc();
            let mut buf = vec![0u8; 1500];
            loop {
                match track.read(&mut buf).await {
                    Ok((packet, _attrs)) => sink.record(packet.payload.len()),
                    Err(e) => {
                        debug!("Track read ended (ssrc={}): {}", ssrc, e);
                        break;
                    }
                }
            }
            debug!("Rendered {} packets from ssrc {}", sink.packets(), ssrc);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_carries_data_section() {
        let platform = RtcPlatform::new();
        let local = platform.create_endpoint(EndpointRole::Local).await.unwrap();
        local.create_channel("0").await.unwrap();

        let offer = local.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("m=application"));

        local.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_without_offer_fails() {
        let platform = RtcPlatform::new();
        let remote = platform.create_endpoint(EndpointRole::Remote).await.unwrap();
        assert!(matches!(
            remote.create_answer().await,
            Err(TransportError::Platform(_))
        ));
        remote.close().await.unwrap();
    }
}
