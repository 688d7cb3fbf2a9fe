// Bounded exponential backoff for remote service calls.
// Transport failures are retried; every other error kind is returned on the spot.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::api::errors::{ApiError, ApiResult};
use crate::clock::{Sleeper, TokioSleeper};
use crate::observability::ApiMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

#[derive(Clone)]
pub struct RetryHandler {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
    metrics: Option<Arc<ApiMetrics>>,
}

impl std::fmt::Debug for RetryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryHandler")
            .field("config", &self.config)
            .finish()
    }
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(RetryConfig::default(), Arc::new(TokioSleeper))
    }
}

impl RetryHandler {
    pub fn new(config: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            config,
            sleeper,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ApiMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute a remote call, retrying transport failures with exponential backoff
    pub async fn execute_with_retry<T, F, Fut>(&self, operation: &str, call: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        self.execute_when(operation, ApiError::is_retryable, call)
            .await
    }

    /// Execute a remote call, retrying whichever errors `should_retry` accepts
    pub async fn execute_when<T, F, Fut, P>(
        &self,
        operation: &str,
        should_retry: P,
        mut call: F,
    ) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
        P: Fn(&ApiError) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match call().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(err) if should_retry(&err) && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Operation failed (retryable)"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry();
                    }
                    self.sleeper.sleep(delay).await;
                }
                Err(err) => {
                    if should_retry(&err) {
                        error!(operation, attempt, error = %err, "Operation failed after exhausting retries");
                    } else {
                        debug!(operation, attempt, error = %err, "Operation failed (non-retryable)");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Delay before the retry that follows `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .config
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_delay);

        if self.config.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = rand::rng().random_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(spread)
        } else {
            delay
        }
    }
}
