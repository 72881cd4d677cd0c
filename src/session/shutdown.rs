use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels `cancelation` once the process is asked to stop: Ctrl-C everywhere, plus SIGTERM and
/// SIGHUP on unix so that closing the terminal or killing the process still closes the session.
///
/// Returns early without cancelling if the token gets cancelled by someone else.
pub async fn detect_shutdown(cancelation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C");
        },
        _ = terminate_signal() => {
            info!("Received termination signal");
        },
        _ = cancelation.cancelled() => return,
    };
    cancelation.cancel();
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut hangup) =
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(terminate), Ok(hangup)) => (terminate, hangup),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to listen for termination signals {e:?}");
                return std::future::pending().await;
            }
        };
    select! {
        _ = terminate.recv() => (),
        _ = hangup.recv() => (),
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending().await
}
