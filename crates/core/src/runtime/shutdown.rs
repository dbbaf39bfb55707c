use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Process-wide cancellation. Every background task (catalog refreshers,
/// the action consumer) selects on this token.
#[derive(Debug)]
pub struct ShutdownGuard {
    token: CancellationToken,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// The cancellation token that all tasks should monitor.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel on SIGINT or SIGTERM.
    pub fn spawn_signal_listener(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to register SIGTERM handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = signal::ctrl_c() => tracing::info!("received Ctrl+C, initiating shutdown"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, initiating shutdown"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = signal::ctrl_c().await;
                tracing::info!("received Ctrl+C, initiating shutdown");
            }
            token.cancel();
        });
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}
