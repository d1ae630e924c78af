//! Process signals.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::consumer::ConsumerControl;

/// Returns the root token, cancelled on Ctrl-C or SIGTERM.
pub fn root_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("Termination signal received, shutting down");
        trigger.cancel();
    });
    token
}

async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Toggles consumption on every SIGUSR1 until `shutdown` is cancelled.
#[cfg(unix)]
pub fn spawn_pause_toggle(control: ConsumerControl, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGUSR1, pause toggle disabled");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                received = usr1.recv() => {
                    if received.is_none() {
                        return;
                    }
                    let paused = control.toggle();
                    info!(paused, "Consumption toggled by SIGUSR1");
                }
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_pause_toggle(_control: ConsumerControl, _shutdown: CancellationToken) {}
