#![forbid(unsafe_code)]

// Test run orchestrator - one isolated session with N channels and M streams,
// driven from setup through teardown.

use crate::config::RunTimings;
use crate::error::{HarnessError, HarnessResult};
use crate::metrics::HarnessMetrics;
use crate::session::{ChannelPairs, Negotiator, SessionPair, StreamPairs};
use crate::signal::wait::{after_delay, await_all_of};
use crate::signal::{SignalBus, SignalWait};
use crate::transport::{DataChannel, Platform};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Setup,
    Negotiating,
    AwaitingChannelsOpen,
    Driving,
    AwaitingCompletion,
    Disconnecting,
    Closed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Closed | RunState::Failed)
    }
}

/// What one run exercises. Fixed once the run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRunConfig {
    pub requested_channels: usize,
    pub requested_streams: usize,
    pub media_sources: Vec<String>,
}

/// Outcome of a run that completed every phase.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub channels: usize,
    pub streams: usize,
    /// Remote render targets that consumed media
    pub rendered_streams: usize,
    pub elapsed: Duration,
}

/// Waiters registered during setup, before anything can fire them.
struct Waits {
    opened: Vec<SignalWait>,
    echoed: Vec<SignalWait>,
    closed: Vec<SignalWait>,
}

pub struct TestRun<P: Platform> {
    platform: Arc<P>,
    config: TestRunConfig,
    timings: RunTimings,
    bus: SignalBus,
    metrics: Option<HarnessMetrics>,
    state: RunState,
    run_id: String,
}

impl<P: Platform> TestRun<P> {
    pub fn new(platform: Arc<P>, config: TestRunConfig, timings: RunTimings) -> Self {
        let mut run_id = Uuid::new_v4().simple().to_string();
        run_id.truncate(8);
        Self {
            platform,
            config,
            timings,
            bus: SignalBus::new(),
            metrics: None,
            state: RunState::Idle,
            run_id,
        }
    }

    /// Uses `bus` instead of a private one, e.g. to inspect emitted signals.
    pub fn with_bus(mut self, bus: SignalBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_metrics(mut self, metrics: HarnessMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!("Run {}: {:?} -> {:?}", self.run_id, self.state, next);
        self.state = next;
    }

    /// Runs every phase. Both endpoints are closed before this returns, whatever the outcome.
    pub async fn run(&mut self) -> HarnessResult<RunReport> {
        let started = Instant::now();
        let _active = self.metrics.as_ref().map(HarnessMetrics::run_started);
        info!(
            "Run {}: {} channels, {} streams on {}",
            self.run_id,
            self.config.requested_channels,
            self.config.requested_streams,
            self.platform.name()
        );

        self.transition(RunState::Setup);
        let platform = Arc::clone(&self.platform);
        let result = match SessionPair::open(platform.as_ref()).await {
            Ok(pair) => {
                let result = self.drive(&pair, started).await;
                pair.close().await;
                result
            }
            Err(e) => Err(e),
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(_) => self.transition(RunState::Closed),
            Err(e) => {
                warn!("Run {} failed in {:?}: {}", self.run_id, self.state, e);
                self.transition(RunState::Failed);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.run_finished(result.is_ok(), elapsed);
        }
        result
    }

    async fn drive(
        &mut self,
        pair: &SessionPair<P::Endpoint>,
        started: Instant,
    ) -> HarnessResult<RunReport> {
        let platform = Arc::clone(&self.platform);
        let container = format!("run-{}", self.run_id);

        let channels = ChannelPairs::create(pair, &self.bus, self.config.requested_channels).await?;
        let streams = StreamPairs::create(
            platform.as_ref(),
            pair,
            &self.bus,
            &container,
            self.config.requested_streams,
            &self.config.media_sources,
        )
        .await?;
        let negotiator = Negotiator::attach(pair);
        let waits = Waits {
            opened: channels.wait_opened(),
            echoed: channels.wait_echoed(),
            closed: channels.wait_closed(),
        };

        self.transition(RunState::Negotiating);
        negotiator.negotiate().await?;

        self.transition(RunState::AwaitingChannelsOpen);
        self.await_open(&channels, waits.opened).await?;
        if let Some(metrics) = &self.metrics {
            metrics.add_channels_opened(channels.len());
        }

        self.transition(RunState::Driving);
        streams.play_all().await?;
        channels.send_all().await?;
        await_all_of(waits.echoed).await?;
        if let Some(metrics) = &self.metrics {
            metrics.add_echoes_completed(channels.len());
        }

        self.transition(RunState::AwaitingCompletion);
        streams.wait_finished(&self.timings).await?;
        let rendered_streams = streams.rendered();
        if let Some(metrics) = &self.metrics {
            metrics.add_streams_rendered(rendered_streams);
        }

        self.transition(RunState::Disconnecting);
        pair.close().await;
        let waited = self.timings.teardown_timeout;
        timeout(waited, await_all_of(waits.closed))
            .await
            .map_err(|_| HarnessError::TeardownTimeout { waited })??;

        Ok(RunReport {
            channels: channels.len(),
            streams: streams.len(),
            rendered_streams,
            elapsed: started.elapsed(),
        })
    }

    /// Waits for every channel to open on both sides. With more than one channel
    /// the wait is raced against the open timeout.
    async fn await_open<C: DataChannel>(
        &self,
        channels: &ChannelPairs<C>,
        opened: Vec<SignalWait>,
    ) -> HarnessResult<()> {
        let count = channels.len();
        if count <= 1 {
            await_all_of(opened).await?;
            return Ok(());
        }

        let waited = self.timings.open_timeout;
        tokio::select! {
            result = await_all_of(opened) => result.map(|_| ()),
            _ = after_delay(waited) => {
                warn!("Run {}: channels not open after {:?}", self.run_id, waited);
                channels.synthesize_closed(count - 1);
                Err(HarnessError::ChannelOpenTimeout { waited, channels: count })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use crate::transport::{CaptureSupport, LoopbackLimits, LoopbackPlatform, Overflow};

    fn config(channels: usize, streams: usize) -> TestRunConfig {
        TestRunConfig {
            requested_channels: channels,
            requested_streams: streams,
            media_sources: vec!["synthetic:2".to_string()],
        }
    }

    fn loopback(limits: LoopbackLimits) -> Arc<LoopbackPlatform> {
        Arc::new(LoopbackPlatform::new(limits))
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_channels_one_stream() {
        let bus = SignalBus::with_history();
        let metrics = HarnessMetrics::new();
        let mut run = TestRun::new(loopback(LoopbackLimits::default()), config(3, 1), RunTimings::default())
            .with_bus(bus.clone())
            .with_metrics(metrics.clone());

        let report = run.run().await.unwrap();
        assert_eq!(run.state(), RunState::Closed);
        assert_eq!(report.channels, 3);
        assert_eq!(report.streams, 1);
        assert_eq!(report.rendered_streams, 1);
        assert_eq!(metrics.runs_total(), 1);
        assert_eq!(metrics.runs_active(), 0);

        let history = bus.history();
        let count = |s: Signal| history.iter().filter(|h| **h == s).count();
        let position = |s: Signal| history.iter().position(|h| *h == s);
        for i in 0..3 {
            assert_eq!(count(Signal::closed_local(i)), 1);
            assert_eq!(count(Signal::closed_remote(i)), 1);
            assert_eq!(count(Signal::data_local(i)), 1);
            assert_eq!(count(Signal::data_remote(i)), 1);
            assert!(position(Signal::open_local(i)) < position(Signal::closed_local(i)));
            assert!(position(Signal::open_remote(i)) < position(Signal::closed_remote(i)));
        }
        let closed = history
            .iter()
            .filter(|s| {
                matches!(
                    s.milestone,
                    crate::signal::Milestone::ChannelClosedLocal
                        | crate::signal::Milestone::ChannelClosedRemote
                )
            })
            .count();
        assert_eq!(closed, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_overflow_times_out() {
        let bus = SignalBus::with_history();
        let limits = LoopbackLimits {
            max_channels: Some(2),
            overflow: Overflow::Silent,
            ..Default::default()
        };
        let mut run = TestRun::new(loopback(limits), config(3, 1), RunTimings::default())
            .with_bus(bus.clone());

        let started = Instant::now();
        match run.run().await {
            Err(HarnessError::ChannelOpenTimeout { waited, channels }) => {
                assert_eq!(waited, Duration::from_secs(60));
                assert_eq!(channels, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(run.state(), RunState::Failed);

        let history = bus.history();
        assert!(history.contains(&Signal::closed_local(2)));
        assert!(history.contains(&Signal::closed_remote(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_close_fails_open_wait() {
        let limits = LoopbackLimits {
            max_channels: Some(2),
            overflow: Overflow::CloseEarly,
            ..Default::default()
        };
        let mut run = TestRun::new(loopback(limits), config(3, 1), RunTimings::default());

        match run.run().await {
            Err(HarnessError::ClosedPrematurely { awaited, observed }) => {
                assert_eq!(awaited, Signal::open_local(2));
                assert_eq!(observed, Signal::closed_local(2));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(run.state(), RunState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_rejection() {
        let limits = LoopbackLimits {
            reject_offer: true,
            ..Default::default()
        };
        let mut run = TestRun::new(loopback(limits), config(1, 1), RunTimings::default());
        assert!(matches!(run.run().await, Err(HarnessError::NegotiationFailure(_))));
        assert_eq!(run.state(), RunState::Failed);
    }

    #[tokio::test]
    async fn test_candidate_rejection_fails_run() {
        let metrics = HarnessMetrics::new();
        let limits = LoopbackLimits {
            reject_candidates: true,
            ..Default::default()
        };
        let mut run = TestRun::new(loopback(limits), config(2, 1), RunTimings::default())
            .with_metrics(metrics.clone());

        match run.run().await {
            Err(HarnessError::NegotiationFailure(reason)) => assert!(reason.contains("candidate")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(run.state(), RunState::Failed);
        assert!(run.state().is_terminal());
        assert_eq!(metrics.runs_failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_poll_interval_still_completes() {
        let timings = RunTimings {
            poll_interval: Duration::ZERO,
            ..RunTimings::default()
        };
        let mut run = TestRun::new(loopback(LoopbackLimits::default()), config(1, 1), timings);
        assert!(!run.state().is_terminal());

        let report = run.run().await.unwrap();
        assert_eq!(report.rendered_streams, 1);
        assert_eq!(run.state(), RunState::Closed);
        assert!(run.state().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_unsupported() {
        let limits = LoopbackLimits {
            capture: CaptureSupport::Unsupported,
            ..Default::default()
        };
        let mut run = TestRun::new(loopback(limits), config(1, 2), RunTimings::default());
        assert!(matches!(
            run.run().await,
            Err(HarnessError::CaptureUnsupported { index: 0 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_capture_completes() {
        let limits = LoopbackLimits {
            capture: CaptureSupport::FallbackOnly,
            ..Default::default()
        };
        let mut run = TestRun::new(loopback(limits), config(1, 2), RunTimings::default());
        let report = run.run().await.unwrap();
        assert_eq!(report.streams, 2);
        assert_eq!(report.rendered_streams, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_echo() {
        let limits = LoopbackLimits {
            corrupt_echo: true,
            ..Default::default()
        };
        let mut run = TestRun::new(loopback(limits), config(2, 1), RunTimings::default());
        assert!(matches!(run.run().await, Err(HarnessError::EchoMismatch { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ceiling() {
        let limits = LoopbackLimits {
            max_streams: Some(1),
            ..Default::default()
        };
        let mut run = TestRun::new(loopback(limits), config(1, 2), RunTimings::default());
        assert!(matches!(run.run().await, Err(HarnessError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_without_ended_flag() {
        let limits = LoopbackLimits {
            reports_ended: false,
            ..Default::default()
        };
        let mut run = TestRun::new(loopback(limits), config(1, 1), RunTimings::default());
        let report = run.run().await.unwrap();
        // Clip length plus the settle delay
        assert!(report.elapsed >= Duration::from_secs(3));
    }
}
