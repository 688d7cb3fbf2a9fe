use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Turns Ctrl-C into cancellation of the in-flight operation.
///
/// The first interrupt cancels the token, which makes the orchestrator
/// discard or cancel its remote run and return. A second interrupt within
/// the grace period exits the process without waiting.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace_period: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            grace_period: Duration::from_secs(30),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Token handed to the running operation
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token as if an interrupt had arrived
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested, canceling the current run");
            self.token.cancel();
        }
    }

    /// Install the Ctrl-C handler on the current runtime
    pub fn install_signal_handlers(&self) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Unable to listen for Ctrl-C; interrupts will not cancel runs");
                return;
            }
            coordinator.trigger();

            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        warn!("Second interrupt received, exiting without waiting for the remote run");
                        std::process::exit(130);
                    }
                }
                _ = tokio::time::sleep(coordinator.grace_period) => {
                    warn!(
                        grace_secs = coordinator.grace_period.as_secs(),
                        "Run did not stop within the grace period, exiting"
                    );
                    std::process::exit(130);
                }
            }
        });
    }
}
