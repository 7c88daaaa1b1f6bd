use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels the root token on Ctrl-C (and SIGTERM on unix). In-flight
/// deployments observe the token, roll back and report `rolled_back`;
/// queued ones never start.
pub struct ShutdownCoordinator {
    root: CancellationToken,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Spawn the signal listener. The task ends once the token is cancelled
    /// by a signal or by anyone else.
    pub fn install_signal_handlers(&self) {
        let root = self.root.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = root.cancelled() => {}
                signal = wait_for_signal() => {
                    match signal {
                        Ok(name) => warn!(signal = name, "Shutdown requested; rolling back in-flight deployments"),
                        Err(e) => {
                            warn!(error = %e, "Could not listen for shutdown signals");
                            return;
                        }
                    }
                    root.cancel();
                }
            }
        });
        info!("Shutdown coordinator ready - will roll back gracefully on SIGINT/SIGTERM");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_is_shared() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();
        coordinator.install_signal_handlers();
        let child = token.child_token();
        token.cancel();
        assert!(child.is_cancelled());
    }
}
