use std::future::{Future, IntoFuture};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::router::app_router;
use engine::Engine;

/// How long to drain connections after shutdown when requests have no deadline.
const DEFAULT_DRAIN: Duration = Duration::from_secs(30);

pub async fn bind(addr: &str) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    if let Ok(local) = listener.local_addr() {
        tracing::info!("appd listening on {}", local);
    }
    Ok(listener)
}

/// Serve `engine` on `listener` until `shutdown` resolves, then stop accepting
/// and give in-flight requests up to one request timeout to finish.
pub async fn serve_http<F>(engine: Arc<Engine>, listener: TcpListener, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let drain = engine.config().request_timeout().unwrap_or(DEFAULT_DRAIN);
    let app = app_router(engine);

    let (stopping_tx, stopping_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = stopping_tx.send(());
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result,
        _ = stopping_rx => {}
    }

    tracing::info!("shutting down; draining for up to {}s", drain.as_secs());
    match tokio::time::timeout(drain, server).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("in-flight requests still running after {}s; exiting", drain.as_secs());
            Ok(())
        }
    }
}
