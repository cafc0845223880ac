#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use peerlimit::config::{Backend, HarnessConfig};
use peerlimit::metrics::HarnessMetrics;
use peerlimit::report::StatusReporter;
use peerlimit::sweep::{LimitSweep, PlatformRunner, SweepParameter};
use peerlimit::transport::{LoopbackPlatform, Platform, RtcPlatform};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn sweep_with<P: Platform>(
    platform: P,
    config: &HarnessConfig,
    reporter: StatusReporter,
    metrics: HarnessMetrics,
) -> Vec<SweepParameter> {
    info!("Sweeping on the {} backend", platform.name());
    let runner = PlatformRunner::new(Arc::new(platform), config.timings(), metrics);
    LimitSweep::new(runner, reporter, config.media_sources.clone())
        .with_max_value(config.max_value)
        .run(&config.parameters)
        .await
}

// Every run is interleaved on one cooperative scheduler
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerlimit=info,webrtc=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HarnessConfig::parse();
    info!("peerlimit - starting limit sweep");

    let reporter = StatusReporter::connect(config.log_endpoint.clone()).await;
    let metrics = HarnessMetrics::new();

    let sweep = async {
        match config.backend {
            Backend::Rtc => sweep_with(RtcPlatform::new(), &config, reporter.clone(), metrics.clone()).await,
            Backend::Loopback => {
                let platform = LoopbackPlatform::new(config.loopback_limits());
                sweep_with(platform, &config, reporter.clone(), metrics.clone()).await
            }
        }
    };

    tokio::select! {
        results = sweep => {
            for result in &results {
                info!(
                    "{}: maximum {} (last attempted {:?})",
                    result.kind.plural(),
                    result.discovered_maximum,
                    result.last_attempted
                );
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, abandoning sweep");
        }
    }

    if config.print_metrics {
        println!("{}", metrics.render_prometheus());
    }

    info!("Sweep complete");
    Ok(())
}
