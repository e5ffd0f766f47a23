use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels the token once SIGTERM or SIGINT arrives.
pub async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("shutdown signal received: SIGTERM");
                    }
                    _ = sigint.recv() => {
                        info!("shutdown signal received: SIGINT");
                    }
                }
            }
            _ => {
                warn!("signal handler install failed, waiting on ctrl-c");
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                info!("shutdown signal received: SIGINT");
            }
        }
        token.cancel();
    }

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received: SIGINT");
        token.cancel();
    }
}
