//! Circuit breaker for upstream protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: upstream assumed down, requests fail fast
//! - Half-Open: probing whether the upstream recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open:      consecutive failures >= failure_threshold, or (past the
//!                     minimum request volume) rolling error rate or slow-call
//!                     rate over threshold
//! Open → Half-Open:   current_timeout elapsed since the last transition
//!                     (checked lazily on the next call, no timer)
//! Half-Open → Closed: success_threshold consecutive successes; timeout resets
//! Half-Open → Open:   any failure; timeout *= backoff_multiplier (capped)
//! ```
//!
//! # Design Decisions
//! - One mutex per breaker; never held across the protected call
//! - Fail fast in Open state without touching stats
//! - The protected call's error is returned unchanged inside `BreakerError::Inner`
//! - `reset()` bumps a generation counter so calls admitted before the reset
//!   cannot leak their outcome into the fresh stats

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{BreakerProfile, CircuitBreakerConfig};
use crate::observability::metrics;
use crate::resilience::stats::{epoch_millis, CircuitBreakerStats, StateChange, StatsSnapshot};

/// Rolling-window samples required before the error-rate check applies.
const ERROR_RATE_MIN_SAMPLES: usize = 20;
/// Latency samples required before the slow-call check applies.
const SLOW_RATE_MIN_SAMPLES: usize = 10;
/// State changes included in a snapshot.
const SNAPSHOT_STATE_CHANGES: usize = 10;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0=closed, 1=open, 2=half-open.
    pub fn metric_value(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = millis_ceil(timeout);
        self.max_timeout_ms = self.max_timeout_ms.max(self.timeout_ms);
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout_ms = millis_ceil(max_timeout);
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = millis_ceil(timeout);
        self
    }

    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    pub fn with_slow_request(mut self, threshold: Duration, rate: f64) -> Self {
        self.slow_request_threshold_ms = threshold.as_millis() as u64;
        self.slow_request_rate_threshold = rate;
        self
    }

    pub fn with_minimum_request_volume(mut self, volume: u32) -> Self {
        self.minimum_request_volume = volume;
        self
    }
}

/// Whole milliseconds, rounded up and never zero.
fn millis_ceil(duration: Duration) -> u64 {
    let millis = duration.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX).max(1)
}

impl BreakerProfile {
    /// Breaker tuning for this kind of service.
    pub fn config(self) -> CircuitBreakerConfig {
        let base = CircuitBreakerConfig::default();
        match self {
            BreakerProfile::LlmService => CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                timeout_ms: 120_000,
                response_timeout_ms: 60_000,
                error_rate_threshold: 0.3,
                slow_request_threshold_ms: 10_000,
                ..base
            },
            BreakerProfile::ApiGateway => CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 3,
                timeout_ms: 60_000,
                response_timeout_ms: 30_000,
                error_rate_threshold: 0.5,
                slow_request_threshold_ms: 5000,
                ..base
            },
            BreakerProfile::DatabaseService => CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                timeout_ms: 30_000,
                response_timeout_ms: 10_000,
                error_rate_threshold: 0.2,
                slow_request_threshold_ms: 2000,
                ..base
            },
            BreakerProfile::ExternalApi => CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 3,
                timeout_ms: 300_000,
                response_timeout_ms: 30_000,
                error_rate_threshold: 0.6,
                slow_request_threshold_ms: 15_000,
                ..base
            },
        }
    }
}

/// Signal returned when a breaker rejects a call without running it.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker '{name}' is {state}; retry after {}s", self.retry_after_secs())]
pub struct BreakerOpenError {
    pub name: String,
    pub state: CircuitState,
    /// The breaker's current open window.
    pub retry_after: Duration,
    pub stats: StatsSnapshot,
}

impl BreakerOpenError {
    /// `retry_after` rounded up to whole seconds, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        (self.retry_after.as_secs_f64().ceil() as u64).max(1)
    }
}

/// Outcome of a call that did not succeed.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call; the operation never ran.
    #[error(transparent)]
    Open(BreakerOpenError),

    /// The operation exceeded the breaker's response timeout.
    #[error("circuit breaker '{breaker}' call timed out after {timeout:?}")]
    Timeout { breaker: String, timeout: Duration },

    /// The operation's own error, unchanged.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Read-only view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    /// Epoch milliseconds of the last transition.
    pub last_state_change: u64,
    pub current_timeout_secs: f64,
    pub stats: StatsSnapshot,
    pub config: CircuitBreakerConfig,
    pub recent_state_changes: Vec<StateChange>,
}

struct BreakerInner {
    state: CircuitState,
    stats: CircuitBreakerStats,
    last_state_change: Instant,
    last_state_change_epoch: u64,
    current_timeout: Duration,
    generation: u64,
}

/// Per-resource circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let current_timeout = config.timeout();
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                stats: CircuitBreakerStats::new(),
                last_state_change: Instant::now(),
                last_state_change_epoch: epoch_millis(),
                current_timeout,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn current_timeout(&self) -> Duration {
        self.lock().current_timeout
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `operation` under the breaker.
    ///
    /// Fails fast with [`BreakerError::Open`] while the circuit is open. Otherwise
    /// the operation runs under the configured response timeout and its outcome
    /// is recorded before being handed back.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let generation = self.admit()?;
        let timeout = self.config.response_timeout();
        let started = Instant::now();

        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success(generation, started.elapsed());
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure(generation, err.to_string());
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.on_failure(generation, format!("timed out after {:?}", timeout));
                Err(BreakerError::Timeout {
                    breaker: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Decide whether a call may proceed. Returns the admitting generation.
    fn admit<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Open => {
                if inner.last_state_change.elapsed() >= inner.current_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen, "recovery timeout elapsed");
                } else {
                    metrics::record_breaker_rejection(&self.name);
                    return Err(BreakerError::Open(self.open_error(&inner)));
                }
            }
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {
                if let Some(reason) = self.health_trip(&inner.stats) {
                    self.transition(&mut inner, CircuitState::Open, &reason);
                    metrics::record_breaker_rejection(&self.name);
                    return Err(BreakerError::Open(self.open_error(&inner)));
                }
            }
        }

        Ok(inner.generation)
    }

    fn on_success(&self, generation: u64, elapsed: Duration) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        inner.stats.record_success(elapsed.as_millis() as u64);

        if inner.state == CircuitState::HalfOpen
            && inner.stats.consecutive_successes >= self.config.success_threshold
        {
            self.transition(&mut inner, CircuitState::Closed, "recovered");
        }
    }

    fn on_failure(&self, generation: u64, error: String) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        tracing::debug!(breaker = %self.name, error = %error, "Circuit breaker recorded failure");
        inner.stats.record_failure(error);
        metrics::record_breaker_failure(&self.name);

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, "failure while half-open");
            }
            CircuitState::Closed => {
                if let Some(reason) = self.health_trip(&inner.stats) {
                    self.transition(&mut inner, CircuitState::Open, &reason);
                }
            }
            // Already tripped by a concurrent call
            CircuitState::Open => {}
        }
    }

    /// First health condition that calls for opening the circuit, if any.
    fn health_trip(&self, stats: &CircuitBreakerStats) -> Option<String> {
        if stats.consecutive_failures >= self.config.failure_threshold {
            return Some(format!("consecutive failures: {}", stats.consecutive_failures));
        }

        if stats.total_requests < u64::from(self.config.minimum_request_volume) {
            return None;
        }

        if stats.window_len() >= ERROR_RATE_MIN_SAMPLES {
            let rate = stats.window_error_rate();
            if rate >= self.config.error_rate_threshold {
                return Some(format!("error rate: {:.1}%", rate * 100.0));
            }
        }

        let (samples, rate) = stats.window_slow_rate(self.config.slow_request_threshold_ms);
        if samples >= SLOW_RATE_MIN_SAMPLES && rate >= self.config.slow_request_rate_threshold {
            return Some(format!("slow request rate: {:.1}%", rate * 100.0));
        }

        None
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, reason: &str) {
        let from = inner.state;
        if from == to {
            return;
        }

        match (from, to) {
            (CircuitState::HalfOpen, CircuitState::Open) => {
                let grown = inner.current_timeout.as_secs_f64() * self.config.backoff_multiplier;
                inner.current_timeout = Duration::try_from_secs_f64(grown)
                    .unwrap_or(self.config.max_timeout())
                    .min(self.config.max_timeout());
            }
            (_, CircuitState::HalfOpen) => {
                inner.stats.consecutive_successes = 0;
            }
            (_, CircuitState::Closed) => {
                inner.current_timeout = self.config.timeout();
                inner.stats.clear_window();
            }
            _ => {}
        }

        inner.state = to;
        inner.last_state_change = Instant::now();
        inner.last_state_change_epoch = epoch_millis();
        let timestamp = inner.last_state_change_epoch;
        inner.stats.record_state_change(from, to, timestamp);

        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                from = %from,
                reason = %reason,
                open_for_secs = inner.current_timeout.as_secs_f64(),
                "Circuit breaker opened"
            ),
            _ => tracing::info!(
                breaker = %self.name,
                from = %from,
                to = %to,
                reason = %reason,
                "Circuit breaker state changed"
            ),
        }

        metrics::record_state_transition(&self.name, from.as_str(), to.as_str(), to.metric_value());
    }

    fn open_error(&self, inner: &BreakerInner) -> BreakerOpenError {
        BreakerOpenError {
            name: self.name.clone(),
            state: inner.state,
            retry_after: inner.current_timeout,
            stats: inner.stats.snapshot(self.config.slow_request_threshold_ms),
        }
    }

    fn snapshot_locked(&self, inner: &BreakerInner) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            last_state_change: inner.last_state_change_epoch,
            current_timeout_secs: inner.current_timeout.as_secs_f64(),
            stats: inner.stats.snapshot(self.config.slow_request_threshold_ms),
            config: self.config.clone(),
            recent_state_changes: inner.stats.recent_state_changes(SNAPSHOT_STATE_CHANGES),
        }
    }

    /// Point-in-time statistics.
    pub fn get_stats(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        self.snapshot_locked(&inner)
    }

    /// Force the breaker closed with fresh stats. Returns the stats from before the reset.
    pub fn reset(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.lock();
        let prior = self.snapshot_locked(&inner);
        let from = inner.state;

        inner.state = CircuitState::Closed;
        inner.stats = CircuitBreakerStats::new();
        inner.last_state_change = Instant::now();
        inner.last_state_change_epoch = epoch_millis();
        inner.current_timeout = self.config.timeout();
        inner.generation += 1;

        if from != CircuitState::Closed {
            metrics::record_state_transition(
                &self.name,
                from.as_str(),
                CircuitState::Closed.as_str(),
                CircuitState::Closed.metric_value(),
            );
        }
        tracing::info!(breaker = %self.name, from = %from, "Circuit breaker manually reset");

        prior
    }
}
