#![forbid(unsafe_code)]

// Media sources for the webrtc-rs backend - IVF clips or generated frames,
// paced into sample tracks once playback starts.

use crate::error::{TransportError, TransportResult};
use crate::transport::{EventHandler, MediaSource, ReadyState, Representation};
use async_trait::async_trait;
use bytes::Bytes;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::media::io::ivf_reader::IVFReader;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const SYNTHETIC_FRAME_INTERVAL: Duration = Duration::from_millis(33);
static SYNTHETIC_FRAME: [u8; 1000] = [0; 1000];

/// Decoded clip held in memory, one entry per frame.
struct Clip {
    mime_type: &'static str,
    frames: Vec<Bytes>,
    frame_duration: Duration,
}

impl Clip {
    fn synthetic(seconds: f64) -> Self {
        let count = (seconds / SYNTHETIC_FRAME_INTERVAL.as_secs_f64()).ceil().max(1.0) as usize;
        Self {
            mime_type: MIME_TYPE_VP8,
            frames: vec![Bytes::from_static(&SYNTHETIC_FRAME); count],
            frame_duration: SYNTHETIC_FRAME_INTERVAL,
        }
    }

    fn read_ivf(path: &Path) -> TransportResult<Self> {
        let file = File::open(path)
            .map_err(|e| TransportError::Media(format!("{}: {}", path.display(), e)))?;
        let (mut reader, header) = IVFReader::new(BufReader::new(file))
            .map_err(|e| TransportError::Media(format!("{}: {}", path.display(), e)))?;

        let mime_type = match &header.four_cc {
            b"VP80" => MIME_TYPE_VP8,
            b"VP90" => MIME_TYPE_VP9,
            other => {
                return Err(TransportError::UnsupportedMedia(format!(
                    "{} ({})",
                    path.display(),
                    String::from_utf8_lossy(other)
                )))
            }
        };

        let millis = u64::from(header.timebase_numerator) * 1000
            / u64::from(header.timebase_denominator.max(1));
        let frame_duration = Duration::from_millis(millis.max(1));

        let mut frames = Vec::new();
        while let Ok((frame, _)) = reader.parse_next_frame() {
            frames.push(frame.freeze());
        }
        if frames.is_empty() {
            return Err(TransportError::Media(format!(
                "{}: no frames",
                path.display()
            )));
        }

        Ok(Self {
            mime_type,
            frames,
            frame_duration,
        })
    }

    fn duration(&self) -> Duration {
        self.frame_duration * self.frames.len() as u32
    }
}

/// Captured stream: the sample tracks fed by one source element.
#[derive(Clone)]
pub struct RtcStream {
    stream_id: String,
    tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl RtcStream {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub(super) fn tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.tracks
    }
}

#[derive(Default)]
struct Playback {
    started: AtomicBool,
    ended: AtomicBool,
    position_ms: AtomicU64,
}

pub struct RtcMediaSource {
    element_id: String,
    clip: Arc<Clip>,
    playback: Arc<Playback>,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl RtcMediaSource {
    /// Binds to the first representation that loads.
    pub(super) async fn load(
        element_id: &str,
        representations: &[String],
    ) -> TransportResult<Arc<Self>> {
        for raw in representations {
            let clip = match Representation::parse(raw) {
                Ok(Representation::Synthetic { seconds }) => Clip::synthetic(seconds),
                Ok(Representation::Ivf(path)) => match read_ivf_blocking(path).await {
                    Ok(clip) => clip,
                    Err(e) => {
                        warn!("{}: skipping {}: {}", element_id, raw, e);
                        continue;
                    }
                },
                Err(e) => {
                    debug!("{}: skipping {}: {}", element_id, raw, e);
                    continue;
                }
            };

            info!(
                "{}: loaded {} ({} frames, {:?})",
                element_id,
                raw,
                clip.frames.len(),
                clip.duration()
            );
            return Ok(Arc::new(Self {
                element_id: element_id.to_string(),
                clip: Arc::new(clip),
                playback: Arc::new(Playback::default()),
                tracks: Mutex::new(Vec::new()),
            }));
        }

        Err(TransportError::UnsupportedMedia(representations.join(", ")))
    }
}

async fn read_ivf_blocking(path: PathBuf) -> TransportResult<Clip> {
    tokio::task::spawn_blocking(move || Clip::read_ivf(&path))
        .await
        .map_err(|e| TransportError::Media(e.to_string()))?
}

#[async_trait]
impl MediaSource for RtcMediaSource {
    type Stream = RtcStream;

    fn ready_state(&self) -> ReadyState {
        // Clips are fully buffered before the element exists
        ReadyState::HaveEnoughData
    }

    fn on_can_play(&self, handler: EventHandler) {
        handler();
    }

    fn capture_stream(&self) -> Option<RtcStream> {
        let stream_id = Uuid::new_v4().simple().to_string();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: self.clip.mime_type.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video-{stream_id}"),
            stream_id.clone(),
        ));
        self.tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&track));

        Some(RtcStream {
            stream_id,
            tracks: vec![track],
        })
    }

    fn capture_stream_fallback(&self) -> Option<RtcStream> {
        None
    }

    async fn play(&self) -> TransportResult<()> {
        if self.playback.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tracks = self.tracks.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let clip = Arc::clone(&self.clip);
        let playback = Arc::clone(&self.playback);
        let element_id = self.element_id.clone();

        tokio::spawn(async move {
            let frame_ms = clip.frame_duration.as_millis() as u64;
            let mut ticker = interval(clip.frame_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

            for (n, frame) in clip.frames.iter().enumerate() {
                ticker.tick().await;
                for track in &tracks {
                    let sample = Sample {
                        data: frame.clone(),
                        duration: clip.frame_duration,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        debug!("{}: sample write failed: {}", element_id, e);
                    }
                }
                playback
                    .position_ms
                    .store((n as u64 + 1) * frame_ms, Ordering::Relaxed);
            }
            playback.ended.store(true, Ordering::SeqCst);
            debug!("{}: playback ended", element_id);
        });
        Ok(())
    }

    fn duration(&self) -> f64 {
        self.clip.duration().as_secs_f64()
    }

    fn current_time(&self) -> f64 {
        self.playback.position_ms.load(Ordering::Relaxed) as f64 / 1000.0
    }

    fn ended(&self) -> bool {
        self.playback.ended.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_clip_length() {
        let clip = Clip::synthetic(1.0);
        assert_eq!(clip.frames.len(), 31);
        assert!(clip.duration() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_load_skips_unplayable_representations() {
        let reps = vec![
            "missing/clip.ivf".to_string(),
            "clip.webm".to_string(),
            "synthetic:0.5".to_string(),
        ];
        let source = RtcMediaSource::load("run/source-0", &reps).await.unwrap();
        assert!(source.ready_state().can_play());
        assert!((source.duration() - 0.528).abs() < 0.001);
        assert!(source.capture_stream_fallback().is_none());
    }

    #[tokio::test]
    async fn test_load_without_playable_representation() {
        let reps = vec!["clip.webm".to_string()];
        assert!(matches!(
            RtcMediaSource::load("run/source-0", &reps).await,
            Err(TransportError::UnsupportedMedia(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_reaches_end() {
        let source = RtcMediaSource::load("run/source-0", &["synthetic:0.2".to_string()])
            .await
            .unwrap();
        source.capture_stream().unwrap();
        source.play().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(source.ended());
        assert!(source.duration() - source.current_time() < 0.1);
    }
}
