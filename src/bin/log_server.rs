#![forbid(unsafe_code)]

use anyhow::Result;
use peerlimit::logsink::{LogSink, LogSinkConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerlimit=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = LogSinkConfig::from_env()?;
    info!(
        "Log sink writing to {} and serving {}",
        config.log_dir.display(),
        config.static_dir.display()
    );

    tokio::select! {
        result = LogSink::new(&config).serve(config.addr) => {
            if let Err(e) = result {
                tracing::error!("Log sink error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
