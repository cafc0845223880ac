#![forbid(unsafe_code)]

// Harness metrics - atomic counters and a run-duration histogram rendered as Prometheus text

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Run durations span sub-second loopback runs to multi-minute sweeps (milliseconds).
const BUCKET_BOUNDS_MS: [u64; 10] = [
    100, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000, 120_000, 300_000,
];
const BUCKET_LABELS: [&str; 10] = [
    "0.1", "0.5", "1", "2.5", "5", "10", "30", "60", "120", "300",
];

pub struct Histogram {
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.sum_ms.fetch_add(ms, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_MS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn count(&self) -> u64 {
        self.count.load(Relaxed)
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, label) in self.buckets.iter().zip(BUCKET_LABELS) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count();
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_ms = self.sum_ms.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:03}", sum_ms / 1_000, sum_ms % 1_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Process-wide harness counters, cheap to clone into every run.
#[derive(Clone)]
pub struct HarnessMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    runs_total: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    channels_opened: AtomicU64,
    echoes_completed: AtomicU64,
    streams_rendered: AtomicU64,

    runs_active: AtomicU64,

    run_duration: Histogram,
}

impl Default for HarnessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                runs_total: AtomicU64::new(0),
                runs_succeeded: AtomicU64::new(0),
                runs_failed: AtomicU64::new(0),
                channels_opened: AtomicU64::new(0),
                echoes_completed: AtomicU64::new(0),
                streams_rendered: AtomicU64::new(0),
                runs_active: AtomicU64::new(0),
                run_duration: Histogram::new(),
            }),
        }
    }

    /// Counts a started run and returns a guard holding the active gauge up.
    pub fn run_started(&self) -> ActiveRunGuard {
        self.inner.runs_total.fetch_add(1, Relaxed);
        self.inner.runs_active.fetch_add(1, Relaxed);
        ActiveRunGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn run_finished(&self, succeeded: bool, elapsed: Duration) {
        if succeeded {
            self.inner.runs_succeeded.fetch_add(1, Relaxed);
        } else {
            self.inner.runs_failed.fetch_add(1, Relaxed);
        }
        self.inner.run_duration.observe(elapsed);
    }

    pub fn add_channels_opened(&self, n: usize) {
        self.inner.channels_opened.fetch_add(n as u64, Relaxed);
    }

    pub fn add_echoes_completed(&self, n: usize) {
        self.inner.echoes_completed.fetch_add(n as u64, Relaxed);
    }

    pub fn add_streams_rendered(&self, n: usize) {
        self.inner.streams_rendered.fetch_add(n as u64, Relaxed);
    }

    pub fn runs_total(&self) -> u64 {
        self.inner.runs_total.load(Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.inner.runs_failed.load(Relaxed)
    }

    pub fn runs_active(&self) -> u64 {
        self.inner.runs_active.load(Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);
        let i = &self.inner;

        render_counter(&mut out, "peerlimit_runs_total", "Test runs started", i.runs_total.load(Relaxed));
        render_counter(&mut out, "peerlimit_runs_succeeded_total", "Test runs that completed", i.runs_succeeded.load(Relaxed));
        render_counter(&mut out, "peerlimit_runs_failed_total", "Test runs that failed", i.runs_failed.load(Relaxed));
        render_counter(&mut out, "peerlimit_channels_opened_total", "Channels open on both sides", i.channels_opened.load(Relaxed));
        render_counter(&mut out, "peerlimit_echoes_completed_total", "Messages echoed back intact", i.echoes_completed.load(Relaxed));
        render_counter(&mut out, "peerlimit_streams_rendered_total", "Remote streams that rendered media", i.streams_rendered.load(Relaxed));

        render_gauge(&mut out, "peerlimit_runs_active", "Test runs in progress", i.runs_active.load(Relaxed));

        i.run_duration.render(
            "peerlimit_run_duration_seconds",
            "Wall time per test run in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `runs_active` on drop, including when a run future is cancelled.
pub struct ActiveRunGuard {
    inner: Arc<Inner>,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.inner.runs_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
