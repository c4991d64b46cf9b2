use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use appd::Args;
use appd::app::{self, DemoShared};
use engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.server_config();
    tracing::info!(
        "appd starting: {} workers, bind {}, identity header '{}'",
        config.workers,
        config.bind,
        config.identity_header
    );

    let engine = Engine::new(config.clone(), app::factory(DemoShared::new()));
    engine.start();
    if args.heartbeat_secs > 0 {
        engine
            .scheduler()
            .add_interval(app::HEARTBEAT, Duration::from_secs(args.heartbeat_secs));
    }

    let listener = http::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    http::serve_http(Arc::clone(&engine), listener, shutdown_signal())
        .await
        .context("server failed")?;

    engine.shutdown();
    tracing::info!("appd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
