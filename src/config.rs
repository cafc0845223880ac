#![forbid(unsafe_code)]

// Harness configuration - command line flags with PEERLIMIT_* environment fallbacks

use crate::sweep::ParameterKind;
use crate::transport::{CaptureSupport, LoopbackLimits, Overflow};
use clap::{Parser, ValueEnum};
use std::time::Duration;
use url::Url;

/// Timing knobs for a single test run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTimings {
    /// How long to wait for all channels to open when more than one was requested
    pub open_timeout: Duration,
    /// Playback polling period
    pub poll_interval: Duration,
    /// Grace period after playback finishes
    pub settle_delay: Duration,
    /// Seconds before the clip end that count as finished
    pub end_threshold: f64,
    /// Upper bound on waiting for every channel to report closed
    pub teardown_timeout: Duration,
}

impl Default for RunTimings {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(1),
            end_threshold: 0.1,
            teardown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// webrtc-rs peer connections over host loopback
    Rtc,
    /// In-memory transport with configurable limits
    Loopback,
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let seconds: f64 = raw.parse().map_err(|_| format!("not a number of seconds: {raw}"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("not a non-negative number of seconds: {raw}"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn parse_interval(raw: &str) -> Result<Duration, String> {
    let interval = parse_seconds(raw)?;
    if interval.is_zero() {
        return Err(format!("interval must be above zero: {raw}"));
    }
    Ok(interval)
}

/// Probe how many data channels and media streams one peer connection sustains
#[derive(Parser, Debug, Clone)]
#[command(name = "peerlimit")]
#[command(about = "Discovers per-connection channel and stream limits of a real-time platform")]
pub struct HarnessConfig {
    /// Transport backend under test
    #[arg(long, value_enum, env = "PEERLIMIT_BACKEND", default_value = "rtc")]
    pub backend: Backend,

    /// Parameters to sweep, always run in channel-then-stream order
    #[arg(long = "parameter", value_enum, value_delimiter = ',', env = "PEERLIMIT_PARAMETERS")]
    pub parameters: Vec<ParameterKind>,

    /// Representations of the clip each source loads, in preference order
    #[arg(
        long = "media",
        value_delimiter = ',',
        env = "PEERLIMIT_MEDIA",
        default_value = "synthetic:5"
    )]
    pub media_sources: Vec<String>,

    /// Remote log service base URL; console only when absent
    #[arg(long, env = "PEERLIMIT_LOG_ENDPOINT")]
    pub log_endpoint: Option<Url>,

    /// Skip candidate values above this
    #[arg(long, env = "PEERLIMIT_MAX_VALUE")]
    pub max_value: Option<usize>,

    /// Seconds to wait for channels to open
    #[arg(long, env = "PEERLIMIT_OPEN_TIMEOUT", value_parser = parse_seconds, default_value = "60")]
    pub open_timeout: Duration,

    /// Seconds between playback checks
    #[arg(long, env = "PEERLIMIT_POLL_INTERVAL", value_parser = parse_interval, default_value = "1")]
    pub poll_interval: Duration,

    /// Seconds to let rendering settle after playback
    #[arg(long, env = "PEERLIMIT_SETTLE_DELAY", value_parser = parse_seconds, default_value = "1")]
    pub settle_delay: Duration,

    /// Seconds to wait for every channel to report closed
    #[arg(long, env = "PEERLIMIT_TEARDOWN_TIMEOUT", value_parser = parse_seconds, default_value = "30")]
    pub teardown_timeout: Duration,

    /// Print run metrics in Prometheus text format when done
    #[arg(long, env = "PEERLIMIT_PRINT_METRICS")]
    pub print_metrics: bool,

    /// Loopback only: channels beyond this count fail to open
    #[arg(long, env = "PEERLIMIT_LOOPBACK_MAX_CHANNELS")]
    pub loopback_max_channels: Option<usize>,

    /// Loopback only: streams beyond this count are rejected
    #[arg(long, env = "PEERLIMIT_LOOPBACK_MAX_STREAMS")]
    pub loopback_max_streams: Option<usize>,

    /// Loopback only: how channels beyond the limit fail
    #[arg(long, value_enum, env = "PEERLIMIT_LOOPBACK_OVERFLOW", default_value = "close-early")]
    pub loopback_overflow: Overflow,

    /// Loopback only: refuse every relayed connectivity candidate
    #[arg(long, env = "PEERLIMIT_LOOPBACK_REJECT_CANDIDATES")]
    pub loopback_reject_candidates: bool,
}

impl HarnessConfig {
    pub fn timings(&self) -> RunTimings {
        RunTimings {
            open_timeout: self.open_timeout,
            poll_interval: self.poll_interval,
            settle_delay: self.settle_delay,
            teardown_timeout: self.teardown_timeout,
            ..RunTimings::default()
        }
    }

    pub fn loopback_limits(&self) -> LoopbackLimits {
        LoopbackLimits {
            max_channels: self.loopback_max_channels,
            max_streams: self.loopback_max_streams,
            overflow: self.loopback_overflow,
            reject_candidates: self.loopback_reject_candidates,
            capture: CaptureSupport::Primary,
            ..LoopbackLimits::default()
        }
    }
}
