#![forbid(unsafe_code)]

// Limit sweep - isolated runs over an increasing candidate sequence until the first failure

use crate::config::RunTimings;
use crate::error::HarnessResult;
use crate::metrics::HarnessMetrics;
use crate::report::StatusReporter;
use crate::run::{RunReport, TestRun, TestRunConfig};
use crate::transport::Platform;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Powers of two with their neighbours, denser around 64 and 128.
pub const CANDIDATE_VALUES: [usize; 57] = [
    1, 2, 3, 4, 5, 7, 8, 9, 15, 16, 17, 31, 32, 33, 60, 61, 62, 63, 64, 65, 66, 67, 68, 124, 125,
    126, 127, 128, 129, 130, 131, 132, 255, 256, 257, 511, 512, 513, 1023, 1024, 1025, 2047, 2048,
    2049, 4095, 4096, 4097, 8191, 8192, 8193, 16383, 16384, 16385, 32767, 32768, 32769, 65535,
];

/// The two quantities a sweep can probe. Each is probed with the other held at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ParameterKind {
    Channels,
    Streams,
}

impl ParameterKind {
    /// Sweep order, whatever order parameters were requested in.
    pub const ORDER: [ParameterKind; 2] = [ParameterKind::Channels, ParameterKind::Streams];

    pub fn singular(self) -> &'static str {
        match self {
            ParameterKind::Channels => "data channel",
            ParameterKind::Streams => "media stream",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            ParameterKind::Channels => "data channels",
            ParameterKind::Streams => "media streams",
        }
    }

    /// "1 data channel", "4 media streams"
    pub fn label(self, value: usize) -> String {
        if value == 1 {
            format!("{} {}", value, self.singular())
        } else {
            format!("{} {}", value, self.plural())
        }
    }

    pub fn isolation_config(self, value: usize, media_sources: &[String]) -> TestRunConfig {
        let (requested_channels, requested_streams) = match self {
            ParameterKind::Channels => (value, 1),
            ParameterKind::Streams => (1, value),
        };
        TestRunConfig {
            requested_channels,
            requested_streams,
            media_sources: media_sources.to_vec(),
        }
    }
}

/// Result of sweeping one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepParameter {
    pub kind: ParameterKind,
    /// Largest value whose run completed; 0 when none did
    pub discovered_maximum: usize,
    pub last_attempted: Option<usize>,
    /// Error of the run that ended the sweep, if one failed
    pub failure: Option<String>,
}

impl SweepParameter {
    fn new(kind: ParameterKind) -> Self {
        Self {
            kind,
            discovered_maximum: 0,
            last_attempted: None,
            failure: None,
        }
    }
}

/// Executes one isolated run.
#[async_trait]
pub trait IsolationRunner: Send + Sync {
    async fn run(&self, config: TestRunConfig) -> HarnessResult<RunReport>;
}

/// Runs every isolation run on one platform with fresh sessions.
pub struct PlatformRunner<P: Platform> {
    platform: Arc<P>,
    timings: RunTimings,
    metrics: HarnessMetrics,
}

impl<P: Platform> PlatformRunner<P> {
    pub fn new(platform: Arc<P>, timings: RunTimings, metrics: HarnessMetrics) -> Self {
        Self {
            platform,
            timings,
            metrics,
        }
    }
}

#[async_trait]
impl<P: Platform> IsolationRunner for PlatformRunner<P> {
    async fn run(&self, config: TestRunConfig) -> HarnessResult<RunReport> {
        TestRun::new(Arc::clone(&self.platform), config, self.timings.clone())
            .with_metrics(self.metrics.clone())
            .run()
            .await
    }
}

pub struct LimitSweep<R: IsolationRunner> {
    runner: R,
    reporter: StatusReporter,
    candidates: Vec<usize>,
    media_sources: Vec<String>,
}

impl<R: IsolationRunner> LimitSweep<R> {
    pub fn new(runner: R, reporter: StatusReporter, media_sources: Vec<String>) -> Self {
        Self {
            runner,
            reporter,
            candidates: CANDIDATE_VALUES.to_vec(),
            media_sources,
        }
    }

    /// Drops candidates above `max`.
    pub fn with_max_value(mut self, max: Option<usize>) -> Self {
        if let Some(max) = max {
            self.candidates.retain(|&value| value <= max);
        }
        self
    }

    pub fn candidates(&self) -> &[usize] {
        &self.candidates
    }

    /// Walks the candidates in order and stops at the first failed run.
    pub async fn sweep(&self, kind: ParameterKind) -> SweepParameter {
        let mut result = SweepParameter::new(kind);
        self.reporter
            .report(format!("Determining maximum number of {}...", kind.plural()))
            .await;

        for &value in &self.candidates {
            result.last_attempted = Some(value);
            self.reporter
                .report(format!("Testing with {}...", kind.label(value)))
                .await;

            let config = kind.isolation_config(value, &self.media_sources);
            match self.runner.run(config).await {
                Ok(report) => {
                    debug!("{} passed in {:?}", kind.label(value), report.elapsed);
                    result.discovered_maximum = value;
                    self.reporter
                        .report(format!("Test with {} succeeded.", kind.label(value)))
                        .await;
                }
                Err(e) => {
                    self.reporter
                        .report(format!("Test with {} failed: {}", kind.label(value), e))
                        .await;
                    result.failure = Some(e.to_string());
                    break;
                }
            }
        }

        self.reporter
            .report(format!(
                "Maximum number of {}: {}",
                kind.plural(),
                result.discovered_maximum
            ))
            .await;
        result
    }

    /// Sweeps the requested parameters in fixed order. Empty means both.
    pub async fn run(&self, requested: &[ParameterKind]) -> Vec<SweepParameter> {
        let mut results = Vec::new();
        for kind in ParameterKind::ORDER {
            if requested.is_empty() || requested.contains(&kind) {
                results.push(self.sweep(kind).await);
            }
        }
        results
    }
}
