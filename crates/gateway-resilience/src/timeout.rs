//! Timeouts and deadlines.
//!
//! Expiry always drops (and thereby cancels) the raced future; the
//! signal-based variant additionally cancels a child token handed to the
//! operation so work it spawned elsewhere stops too.

use gateway_core::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Budget for a complete non-streaming upstream call
    #[serde(with = "humantime_serde")]
    pub request: Duration,
    /// Budget for a streaming upstream call to start answering
    #[serde(with = "humantime_serde")]
    pub stream_first_byte: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(120),
            stream_first_byte: Duration::from_secs(30),
        }
    }
}

/// Race `future` against a timer
///
/// # Errors
/// Returns `GatewayError::Timeout` when the timer wins, otherwise the
/// future's own result
pub async fn with_timeout<F, T>(duration: Duration, operation: &str, future: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::timeout(duration, operation)),
    }
}

/// Race an operation against a timer and a parent cancellation signal.
///
/// The operation receives a child of `parent`; the child is cancelled on
/// expiry and whenever the parent is cancelled.
///
/// # Errors
/// Returns `GatewayError::Timeout` on expiry, `GatewayError::Cancelled` when
/// the parent fired first
pub async fn with_timeout_signal<F, Fut, T>(
    duration: Duration,
    operation: &str,
    parent: &CancellationToken,
    f: F,
) -> GatewayResult<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let child = parent.child_token();
    let guard = child.clone().drop_guard();
    let result = tokio::select! {
        result = f(child) => result,
        () = tokio::time::sleep(duration) => Err(GatewayError::timeout(duration, operation)),
        () = parent.cancelled() => Err(GatewayError::Cancelled),
    };
    match &result {
        Ok(_) => {
            let _ = guard.disarm();
        }
        Err(_) => drop(guard),
    }
    result
}

/// Absolute point in time by which a request must complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
            budget,
        }
    }

    /// Time left, zero once expired
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Original budget
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Run `future` within the remaining budget
    ///
    /// # Errors
    /// Returns `GatewayError::Timeout` (reporting the full budget) when the
    /// deadline is or becomes exceeded
    pub async fn run<F, T>(&self, operation: &str, future: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        if self.is_expired() {
            return Err(GatewayError::timeout(self.budget, operation));
        }
        with_timeout(self.remaining(), operation, future)
            .await
            .map_err(|e| match e {
                GatewayError::Timeout { .. } => GatewayError::timeout(self.budget, operation),
                other => other,
            })
    }
}
