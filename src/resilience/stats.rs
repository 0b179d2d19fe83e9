//! Per-breaker request statistics.
//!
//! # Invariants
//! - `successful_requests + failed_requests == total_requests`
//! - At most one of `consecutive_failures` / `consecutive_successes` is non-zero
//!
//! # Design Decisions
//! - Bounded rings: 1000 response times, 100 state changes
//! - Health checks read rolling windows of the last 100 outcomes and the
//!   last 100 latency samples, both cleared when the circuit closes, so a
//!   recovered breaker starts clean
//! - Failures carry no latency and never push samples out of the latency
//!   window

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::resilience::circuit_breaker::CircuitState;

const MAX_RESPONSE_TIMES: usize = 1000;
const MAX_STATE_CHANGES: usize = 100;
const HEALTH_WINDOW: usize = 100;
const SAMPLE_SIZE: usize = 100;

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub consecutive_failures: u32,
    pub error_rate: f64,
}

/// Mutable statistics owned by exactly one breaker.
#[derive(Debug, Default)]
pub struct CircuitBreakerStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_time: Option<u64>,
    pub last_success_time: Option<u64>,
    pub last_error: Option<String>,
    response_times: VecDeque<u64>,
    state_changes: VecDeque<StateChange>,
    /// Recent outcomes, `true` for a failure.
    window: VecDeque<bool>,
    window_latencies: VecDeque<u64>,
}

impl CircuitBreakerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, response_time_ms: u64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_success_time = Some(epoch_millis());

        if self.response_times.len() == MAX_RESPONSE_TIMES {
            self.response_times.pop_front();
        }
        self.response_times.push_back(response_time_ms);
        self.push_outcome(false);
        if self.window_latencies.len() == SAMPLE_SIZE {
            self.window_latencies.pop_front();
        }
        self.window_latencies.push_back(response_time_ms);
    }

    pub fn record_failure(&mut self, error: String) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_failure_time = Some(epoch_millis());
        self.last_error = Some(error);
        self.push_outcome(true);
    }

    fn push_outcome(&mut self, failed: bool) {
        if self.window.len() == HEALTH_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    pub fn record_state_change(&mut self, from: CircuitState, to: CircuitState, timestamp: u64) {
        if self.state_changes.len() == MAX_STATE_CHANGES {
            self.state_changes.pop_front();
        }
        self.state_changes.push_back(StateChange {
            from,
            to,
            timestamp,
            consecutive_failures: self.consecutive_failures,
            error_rate: self.error_rate(),
        });
    }

    /// Forget the rolling health windows.
    pub fn clear_window(&mut self) {
        self.window.clear();
        self.window_latencies.clear();
    }

    /// Lifetime failure fraction.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    /// Mean over the last 100 response times.
    pub fn avg_response_time_ms(&self) -> f64 {
        let recent = self.recent_response_times();
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().sum::<u64>() as f64 / recent.len() as f64
    }

    /// Fraction of the last 100 response times above `threshold_ms`.
    pub fn slow_request_rate(&self, threshold_ms: u64) -> f64 {
        let recent = self.recent_response_times();
        if recent.is_empty() {
            return 0.0;
        }
        let slow = recent.iter().filter(|&&t| t > threshold_ms).count();
        slow as f64 / recent.len() as f64
    }

    fn recent_response_times(&self) -> Vec<u64> {
        let skip = self.response_times.len().saturating_sub(SAMPLE_SIZE);
        self.response_times.iter().skip(skip).copied().collect()
    }

    /// Number of outcomes in the rolling health window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Failure fraction over the rolling health window.
    pub fn window_error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failed = self.window.iter().filter(|&&failed| failed).count();
        failed as f64 / self.window.len() as f64
    }

    /// Latency samples since the circuit last closed (at most the last 100)
    /// and the slow fraction among them.
    pub fn window_slow_rate(&self, threshold_ms: u64) -> (usize, f64) {
        let samples = self.window_latencies.len();
        if samples == 0 {
            return (0, 0.0);
        }
        let slow = self.window_latencies.iter().filter(|&&t| t > threshold_ms).count();
        (samples, slow as f64 / samples as f64)
    }

    pub fn response_time_count(&self) -> usize {
        self.response_times.len()
    }

    /// Latency distribution over the last 100 response times.
    pub fn latency_buckets(&self) -> LatencyBuckets {
        let mut buckets = LatencyBuckets::default();
        for t in self.recent_response_times() {
            match t {
                0..=100 => buckets.under_100ms += 1,
                101..=500 => buckets.under_500ms += 1,
                501..=1000 => buckets.under_1s += 1,
                1001..=5000 => buckets.under_5s += 1,
                _ => buckets.over_5s += 1,
            }
        }
        buckets
    }

    /// The last `n` state changes, oldest first.
    pub fn recent_state_changes(&self, n: usize) -> Vec<StateChange> {
        let skip = self.state_changes.len().saturating_sub(n);
        self.state_changes.iter().skip(skip).cloned().collect()
    }

    pub fn state_change_count(&self) -> usize {
        self.state_changes.len()
    }

    pub fn snapshot(&self, slow_threshold_ms: u64) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            success_rate: self.success_rate(),
            error_rate: self.error_rate(),
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            avg_response_time_ms: self.avg_response_time_ms(),
            slow_request_rate: self.slow_request_rate(slow_threshold_ms),
            latency_buckets: self.latency_buckets(),
            last_failure_time: self.last_failure_time,
            last_success_time: self.last_success_time,
            last_error: self.last_error.clone(),
        }
    }
}

/// Response-time histogram over the recent sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyBuckets {
    pub under_100ms: u32,
    pub under_500ms: u32,
    pub under_1s: u32,
    pub under_5s: u32,
    pub over_5s: u32,
}

/// Read-only copy of a breaker's aggregate statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub avg_response_time_ms: f64,
    pub slow_request_rate: f64,
    pub latency_buckets: LatencyBuckets,
    pub last_failure_time: Option<u64>,
    pub last_success_time: Option<u64>,
    pub last_error: Option<String>,
}
