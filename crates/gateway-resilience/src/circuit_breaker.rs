//! Circuit breaker pattern implementation.
//!
//! The circuit breaker stops calling a route that keeps failing and gives it
//! time to recover:
//!
//! ```text
//! closed ──(threshold / failure rate)──▶ open ──(reset_timeout)──▶ half-open
//!    ▲                                    ▲                           │
//!    └──────(success_threshold)───────────┼──────────(any failure)────┘
//! ```
//!
//! Half-open admits a single trial at a time. Breakers are keyed per logical
//! route (`provider` or `provider:model`) and held in a
//! [`CircuitBreakerRegistry`].

use dashmap::DashMap;
use gateway_core::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if the route recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) before opening the circuit
    pub failure_threshold: u32,
    /// Successes in half-open required to close the circuit
    pub success_threshold: u32,
    /// Time spent open before a trial request is allowed
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Number of recent outcomes evaluated for the failure rate
    pub window_size: usize,
    /// Failure rate (0.0 - 1.0) over a full window that opens the circuit
    pub failure_rate_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            window_size: 10,
            failure_rate_threshold: 0.5,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    window: VecDeque<bool>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            window: VecDeque::new(),
            trial_in_flight: false,
        }
    }
}

/// Circuit breaker for a single route
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Route identifier
    circuit_id: String,
    /// Configuration
    config: CircuitBreakerConfig,
    /// Mutable state, updated atomically per outcome
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(circuit_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            circuit_id: circuit_id.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(circuit_id: impl Into<String>) -> Self {
        Self::new(circuit_id, CircuitBreakerConfig::default())
    }

    /// Get the route identifier
    #[must_use]
    pub fn circuit_id(&self) -> &str {
        &self.circuit_id
    }

    /// Get the current state, moving open → half-open if the reset timeout elapsed
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether a call would currently be admitted
    #[must_use]
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !inner.trial_in_flight,
            CircuitState::Open => false,
        }
    }

    /// Admit one call, claiming the trial slot when half-open
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` when the call is rejected
    pub fn acquire(&self) -> GatewayResult<()> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!(circuit = %self.circuit_id, "Circuit breaker admitting trial request");
                Ok(())
            }
            _ => Err(GatewayError::CircuitOpen {
                circuit_id: self.circuit_id.clone(),
                retry_after_ms: self.retry_after(&inner).as_millis() as u64,
            }),
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Rejects immediately when the circuit does not admit the call. The
    /// outcome is recorded with [`counts_as_failure`]; a cancelled call
    /// releases its trial slot without being counted.
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` on rejection, otherwise the
    /// operation's own error
    pub async fn execute<F, Fut, T>(&self, operation: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.acquire()?;
        let mut call = Call {
            breaker: self,
            settled: false,
        };
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if counts_as_failure(e) => self.record_failure(),
            Err(_) => self.release_trial(),
        }
        call.settled = true;
        result
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                self.push_outcome(&mut inner, true);
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                debug!(
                    circuit = %self.circuit_id,
                    successes = inner.half_open_successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker half-open success"
                );
                if inner.half_open_successes >= self.config.success_threshold {
                    self.close(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                self.push_outcome(&mut inner, false);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    debug!(
                        circuit = %self.circuit_id,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker failure threshold reached"
                    );
                    self.open(&mut inner);
                } else if self
                    .window_failure_rate(&inner)
                    .is_some_and(|rate| rate >= self.config.failure_rate_threshold)
                {
                    debug!(circuit = %self.circuit_id, "Circuit breaker failure rate exceeded");
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                debug!(circuit = %self.circuit_id, "Circuit breaker trial request failed, reopening");
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Reset the circuit breaker to closed state, clearing all counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
    }

    /// Force the circuit open (manual intervention)
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        self.open(&mut inner);
    }

    /// Get current statistics
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            window_len: inner.window.len(),
            window_failures: inner.window.iter().filter(|ok| !**ok).count(),
            retry_after_ms: self.retry_after(&inner).as_millis() as u64,
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner.opened_at.map_or(Duration::MAX, |t| t.elapsed());
        if elapsed >= self.config.reset_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            inner.trial_in_flight = false;
            info!(circuit = %self.circuit_id, "Circuit breaker half-open, testing");
        }
    }

    fn retry_after(&self, inner: &BreakerInner) -> Duration {
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.config.reset_timeout.saturating_sub(opened_at.elapsed())
            }
            _ => Duration::ZERO,
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, success: bool) {
        if self.config.window_size == 0 {
            return;
        }
        inner.window.push_back(success);
        while inner.window.len() > self.config.window_size {
            inner.window.pop_front();
        }
    }

    /// Failure rate, only once the window is full
    fn window_failure_rate(&self, inner: &BreakerInner) -> Option<f64> {
        if self.config.window_size == 0 || inner.window.len() < self.config.window_size {
            return None;
        }
        let failures = inner.window.iter().filter(|ok| !**ok).count();
        Some(failures as f64 / inner.window.len() as f64)
    }

    fn open(&self, inner: &mut BreakerInner) {
        let previous = inner.state;
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
        inner.trial_in_flight = false;
        inner.window.clear();
        if previous != CircuitState::Open {
            warn!(
                circuit = %self.circuit_id,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
        }
    }

    fn close(&self, inner: &mut BreakerInner) {
        let previous = inner.state;
        *inner = BreakerInner::new();
        if previous != CircuitState::Closed {
            info!(circuit = %self.circuit_id, "Circuit breaker closed");
        }
    }
}

/// Releases the trial slot if the guarded future is dropped mid-flight
struct Call<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for Call<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_trial();
        }
    }
}

/// Whether an error says something about the health of the route.
///
/// Caller mistakes (4xx other than 429), cancellations and breaker
/// rejections are not counted.
#[must_use]
pub fn counts_as_failure(error: &GatewayError) -> bool {
    match error.root_cause() {
        GatewayError::Status { status_code, .. } => *status_code == 429 || *status_code >= 500,
        GatewayError::Network { .. } | GatewayError::Timeout { .. } => true,
        _ => false,
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub consecutive_failures: u32,
    /// Success count in half-open state
    pub half_open_successes: u32,
    /// Outcomes currently in the sliding window
    pub window_len: usize,
    /// Failures currently in the sliding window
    pub window_failures: usize,
    /// Milliseconds until an open circuit admits a trial request
    pub retry_after_ms: u64,
}

impl CircuitBreakerStats {
    /// Failure rate over the current window
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.window_len == 0 {
            0.0
        } else {
            self.window_failures as f64 / self.window_len as f64
        }
    }
}

/// Registry of breakers keyed by route
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry handing out breakers with `config`
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Route key: `provider` or `provider:model`
    #[must_use]
    pub fn key(provider: &str, model: Option<&str>) -> String {
        match model {
            Some(model) if !model.is_empty() => format!("{provider}:{model}"),
            _ => provider.to_string(),
        }
    }

    /// Get the breaker for a route, creating it on first use
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
                .value(),
        )
    }

    /// Get an existing breaker
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| Arc::clone(b.value()))
    }

    /// Statistics for every known route, sorted by key
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, CircuitBreakerStats)> {
        let mut stats: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
    }
}
