#![forbid(unsafe_code)]

// Media stream pairs - source elements on the local side, render targets on the remote side

use super::SessionPair;
use crate::config::RunTimings;
use crate::error::{HarnessError, HarnessResult};
use crate::signal::wait::{after_delay, until_condition};
use crate::signal::{Milestone, Signal, SignalBus};
use crate::transport::{MediaSource, Platform, RemoteTrack, RenderSink, SessionEndpoint};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type TrackOf<P> = <<P as Platform>::Endpoint as SessionEndpoint>::Track;

/// Remote rendering element for one incoming stream.
pub struct RenderTarget<T: RemoteTrack> {
    stream_id: String,
    tracks: Mutex<Vec<Arc<T>>>,
    sink: Arc<RenderSink>,
}

impl<T: RemoteTrack> RenderTarget<T> {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn sink(&self) -> &RenderSink {
        &self.sink
    }
}

type Targets<T> = Arc<Mutex<Vec<Arc<RenderTarget<T>>>>>;

/// Tracks of one stream arrive back to back, so a new target is only needed
/// when the stream id changes from the previous track's.
fn attach_track<T: RemoteTrack>(targets: &Targets<T>, track: Arc<T>) {
    let stream_id = track.stream_id();
    let target = {
        let mut targets = targets.lock().unwrap_or_else(|e| e.into_inner());
        match targets.last() {
            Some(last) if last.stream_id == stream_id => Arc::clone(last),
            _ => {
                let target = Arc::new(RenderTarget {
                    stream_id: stream_id.clone(),
                    tracks: Mutex::new(Vec::new()),
                    sink: Arc::new(RenderSink::default()),
                });
                targets.push(Arc::clone(&target));
                debug!("New render target for stream {}", stream_id);
                target
            }
        }
    };
    track.render(Arc::clone(&target.sink));
    target
        .tracks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(track);
}

/// True once the source reports ended or is within `threshold` seconds of its end.
pub fn playback_finished<S: MediaSource + ?Sized>(source: &S, threshold: f64) -> bool {
    source.ended() || source.duration() - source.current_time() < threshold
}

/// Every media source of one run plus the targets their streams render into.
pub struct StreamPairs<P: Platform> {
    sources: Vec<Arc<P::Source>>,
    targets: Targets<TrackOf<P>>,
}

impl<P: Platform> StreamPairs<P> {
    /// Creates `count` source elements under `container`, waits for each to be
    /// playable and adds its captured stream to the local endpoint.
    pub async fn create(
        platform: &P,
        pair: &SessionPair<P::Endpoint>,
        bus: &SignalBus,
        container: &str,
        count: usize,
        representations: &[String],
    ) -> HarnessResult<Self> {
        let targets: Targets<TrackOf<P>> = Arc::new(Mutex::new(Vec::new()));
        let incoming = Arc::clone(&targets);
        pair.remote
            .on_new_track(Box::new(move |track| attach_track(&incoming, track)));

        let mut sources = Vec::with_capacity(count);
        for index in 0..count {
            let element_id = format!("{container}/source-{index}");
            let source = platform
                .create_media_source(&element_id, representations)
                .await?;
            wait_can_play(source.as_ref(), bus, index).await?;

            let stream = match source.capture_stream() {
                Some(stream) => stream,
                None => {
                    let stream = source
                        .capture_stream_fallback()
                        .ok_or(HarnessError::CaptureUnsupported { index })?;
                    info!("{}: using fallback stream capture", element_id);
                    stream
                }
            };
            pair.local.add_stream(&stream).await?;
            sources.push(source);
        }

        Ok(Self { sources, targets })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn targets(&self) -> Vec<Arc<RenderTarget<TrackOf<P>>>> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of render targets that consumed at least one packet.
    pub fn rendered(&self) -> usize {
        self.targets()
            .iter()
            .filter(|t| t.sink.packets() > 0)
            .count()
    }

    pub async fn play_all(&self) -> HarnessResult<()> {
        for source in &self.sources {
            source.play().await?;
        }
        Ok(())
    }

    /// Polls until every source has finished playing, then lets rendering settle.
    pub async fn wait_finished(&self, timings: &RunTimings) -> HarnessResult<()> {
        let threshold = timings.end_threshold;
        until_condition(
            || {
                Ok(self
                    .sources
                    .iter()
                    .all(|s| playback_finished(s.as_ref(), threshold)))
            },
            timings.poll_interval,
        )
        .await?;
        after_delay(timings.settle_delay).await;
        Ok(())
    }
}

/// Resolves once the source reaches can-play readiness, whether that happened
/// already or happens later.
async fn wait_can_play<S: MediaSource>(source: &S, bus: &SignalBus, index: usize) -> HarnessResult<()> {
    let ready = Signal::new(Milestone::SourceCanPlay, index);
    let wait = bus.wait_for(ready, []);

    let signals = bus.clone();
    source.on_can_play(Box::new(move || signals.emit(ready)));
    if source.ready_state().can_play() {
        bus.emit(ready);
    }
    wait.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CaptureSupport, LoopbackLimits, LoopbackPlatform};
    use std::time::Duration;

    fn synthetic() -> Vec<String> {
        vec!["synthetic:1".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_delayed_can_play() {
        let platform = LoopbackPlatform::new(LoopbackLimits {
            can_play_delay: Duration::from_millis(300),
            ..Default::default()
        });
        let pair = SessionPair::open(&platform).await.unwrap();
        let bus = SignalBus::new();

        let streams = StreamPairs::create(&platform, &pair, &bus, "run", 2, &synthetic())
            .await
            .unwrap();
        assert_eq!(streams.len(), 2);
    }

    #[tokio::test]
    async fn test_capture_unsupported() {
        let platform = LoopbackPlatform::new(LoopbackLimits {
            capture: CaptureSupport::Unsupported,
            ..Default::default()
        });
        let pair = SessionPair::open(&platform).await.unwrap();
        let bus = SignalBus::new();

        let result = StreamPairs::create(&platform, &pair, &bus, "run", 1, &synthetic()).await;
        assert!(matches!(result, Err(HarnessError::CaptureUnsupported { index: 0 })));
    }

    #[tokio::test]
    async fn test_fallback_capture() {
        let platform = LoopbackPlatform::new(LoopbackLimits {
            capture: CaptureSupport::FallbackOnly,
            ..Default::default()
        });
        let pair = SessionPair::open(&platform).await.unwrap();
        let bus = SignalBus::new();

        let streams = StreamPairs::create(&platform, &pair, &bus, "run", 1, &synthetic())
            .await
            .unwrap();
        assert_eq!(streams.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_group_into_render_targets() {
        let platform = LoopbackPlatform::default();
        let pair = SessionPair::open(&platform).await.unwrap();
        let bus = SignalBus::new();

        let streams = StreamPairs::create(&platform, &pair, &bus, "run", 2, &synthetic())
            .await
            .unwrap();
        crate::session::Negotiator::attach(&pair)
            .negotiate()
            .await
            .unwrap();
        streams.play_all().await.unwrap();
        streams.wait_finished(&RunTimings::default()).await.unwrap();

        let targets = streams.targets();
        assert_eq!(targets.len(), 2);
        assert_ne!(targets[0].stream_id(), targets[1].stream_id());
        for target in &targets {
            assert_eq!(target.track_count(), 2);
            assert!(target.sink().packets() > 0);
            assert!(target.sink().bytes() >= target.sink().packets());
        }
        assert_eq!(streams.rendered(), 2);
        pair.close().await;
    }

    struct FixedClock {
        duration: f64,
        position: f64,
        ended: bool,
    }

    #[async_trait::async_trait]
    impl MediaSource for FixedClock {
        type Stream = ();

        fn ready_state(&self) -> crate::transport::ReadyState {
            crate::transport::ReadyState::HaveEnoughData
        }
        fn on_can_play(&self, _handler: crate::transport::EventHandler) {}
        fn capture_stream(&self) -> Option<()> {
            None
        }
        fn capture_stream_fallback(&self) -> Option<()> {
            None
        }
        async fn play(&self) -> crate::error::TransportResult<()> {
            Ok(())
        }
        fn duration(&self) -> f64 {
            self.duration
        }
        fn current_time(&self) -> f64 {
            self.position
        }
        fn ended(&self) -> bool {
            self.ended
        }
    }

    #[test]
    fn test_playback_finished_threshold() {
        let near_end = FixedClock { duration: 5.0, position: 4.95, ended: false };
        let playing = FixedClock { duration: 5.0, position: 4.5, ended: false };
        let ended = FixedClock { duration: 5.0, position: 0.0, ended: true };

        assert!(playback_finished(&near_end, 0.1));
        assert!(!playback_finished(&playing, 0.1));
        assert!(playback_finished(&ended, 0.1));
    }
}
