use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// Suite runs and the heartbeat loop watch this token and stop at their next
/// suspension point. If the signal handlers cannot be installed the token is
/// simply never cancelled by a signal.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, aborting suite run");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, aborting suite run");
            }
        }

        token_clone.cancel();
    });

    token
}
