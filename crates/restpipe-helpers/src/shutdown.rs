use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancels `token` when the process receives SIGTERM or SIGINT.
///
/// Spawn once per process; every long-running task observes the token.
pub async fn listen_shutdown(token: CancellationToken) {
    let signal_name = wait_for_signal().await;
    warn!("shutdown signal received: {signal_name}");
    token.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let sigterm = signal(SignalKind::terminate());
    let sigint = signal(SignalKind::interrupt());

    match (sigterm, sigint) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            }
        }
        (sigterm, sigint) => {
            if let Err(err) = &sigterm {
                warn!("failed to install SIGTERM handler: error={err}");
            }
            if let Err(err) = &sigint {
                warn!("failed to install SIGINT handler: error={err}");
            }
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
