use clap::Parser;
use tokio_util::sync::CancellationToken;

use tsbridge_engine::BridgeConfig;
use tsbridge_server::bootstrap;

#[derive(Parser)]
#[command(name = "tsbridge-server", about = "MQTT to TimescaleDB ingest bridge")]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(long, default_value = "config.toml", env = "TSBRIDGE_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "loading configuration");
    let config = match BridgeConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    tracing::info!(topics = config.topics.len(), "configuration loaded");

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    match bootstrap::run(config, shutdown).await {
        Ok(report) => {
            tracing::info!(trigger = %report.trigger, stopped = report.stopped.len(), "tsbridge-server stopped");
            std::process::exit(bootstrap::exit_code(&report));
        }
        Err(e) => {
            tracing::error!(error = %e, "tsbridge-server failed");
            std::process::exit(1);
        }
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl+C received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
    shutdown.cancel();
}
