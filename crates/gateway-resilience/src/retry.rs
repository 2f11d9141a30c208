//! Retry policy with exponential backoff.
//!
//! Delay before attempt `n + 1` is `initial_delay * backoff_multiplier^(n - 1)`,
//! capped at `max_delay`, optionally jittered by ±25%. An upstream
//! `Retry-After` hint replaces the computed backoff.

use gateway_core::{GatewayError, GatewayResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fraction of the computed delay applied as random jitter
const JITTER_FACTOR: f64 = 0.25;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Whether to apply ±25% jitter
    pub jitter: bool,
    /// HTTP status codes to retry on
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

type Predicate = Arc<dyn Fn(&GatewayError) -> bool + Send + Sync>;

/// Retry policy implementation
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: Option<Predicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the given configuration
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: None,
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Replace the built-in retryability rules with a caller predicate
    #[must_use]
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&GatewayError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Computed backoff before the attempt following `attempt` (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.initial_delay.as_millis() as f64;
        let delay = (base * self.config.backoff_multiplier.powi(exponent))
            .min(self.config.max_delay.as_millis() as f64);

        let delay = if self.config.jitter && delay > 0.0 {
            let range = delay * JITTER_FACTOR;
            (delay + rand::thread_rng().gen_range(-range..=range)).max(0.0)
        } else {
            delay
        };
        Duration::from_millis(delay as u64)
    }

    /// Check if an error is retryable.
    ///
    /// A caller predicate takes precedence over every built-in rule.
    #[must_use]
    pub fn is_retryable(&self, error: &GatewayError) -> bool {
        if error.is_cancelled() {
            return false;
        }
        if let Some(predicate) = &self.predicate {
            return predicate(error);
        }
        match error.root_cause() {
            GatewayError::Status { status_code, .. } => {
                self.config.retryable_status_codes.contains(status_code)
            }
            GatewayError::Network { .. } | GatewayError::Timeout { .. } => true,
            _ => false,
        }
    }

    fn delay_after(&self, attempt: u32, error: &GatewayError) -> Duration {
        match error.root_cause().retry_after() {
            Some(hint) => hint.min(self.config.max_delay),
            None => self.delay_for_attempt(attempt),
        }
    }

    /// Execute an operation with retry logic.
    ///
    /// `operation` receives the 1-based attempt number.
    ///
    /// # Errors
    /// Returns non-retryable errors unchanged and
    /// `GatewayError::RetryExhausted` once every attempt failed
    pub async fn execute<F, Fut, T>(&self, operation: F) -> GatewayResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.execute_with_cancel(operation, &CancellationToken::new())
            .await
    }

    /// Execute with retry, abandoning backoff sleeps when `cancel` fires
    ///
    /// # Errors
    /// Same as [`RetryPolicy::execute`], plus `GatewayError::Cancelled`
    pub async fn execute_with_cancel<F, Fut, T>(
        &self,
        mut operation: F,
        cancel: &CancellationToken,
    ) -> GatewayResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.is_retryable(&error) {
                return Err(error);
            }
            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "Retry attempts exhausted");
                return Err(GatewayError::RetryExhausted {
                    attempts: attempt,
                    last_error: Box::new(error),
                });
            }

            let delay = self.delay_after(attempt, &error);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after error"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            }
            attempt += 1;
        }
    }
}

/// Run `operation` with a one-off policy built from `config`
///
/// # Errors
/// See [`RetryPolicy::execute`]
pub async fn with_retry<F, Fut, T>(operation: F, config: RetryConfig) -> GatewayResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    RetryPolicy::new(config).execute(operation).await
}
