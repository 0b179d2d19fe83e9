//! Retry logic.
//!
//! # Responsibilities
//! - Determine if a failure is retryable (`Retryable` or a custom predicate)
//! - Execute retries with backoff + jitter
//! - Compose retries with a circuit breaker
//!
//! # Design Decisions
//! - Non-retryable errors return on first occurrence
//! - The last error is returned unchanged once attempts run out
//! - Breaker-open rejections are terminal unless the caller opts in with
//!   `OpenCircuitPolicy::Retry`
//! - Response timeouts apply per attempt; there is no overall deadline

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::config::RetryConfig;
use crate::error::Retryable;
use crate::resilience::circuit_breaker::{BreakerError, CircuitBreaker};

/// Observer invoked before each retry sleep with the 1-based attempt that
/// failed, its error and the chosen delay.
pub type RetryHook<E> = Arc<dyn Fn(u32, &E, Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Predicate deciding whether an error may be retried.
pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// What `retry_with_circuit_breaker` does when the breaker rejects a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenCircuitPolicy {
    /// Return the rejection immediately.
    FailFast,
    /// Treat the rejection like any transient failure and back off.
    Retry,
}

/// Retry driver: a config plus a retryability predicate and optional hook.
pub struct RetryPolicy<E> {
    config: RetryConfig,
    retry_if: RetryPredicate<E>,
    on_retry: Option<RetryHook<E>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            retry_if: self.retry_if.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E: Retryable + 'static> RetryPolicy<E> {
    /// Policy that retries whatever `Retryable` marks as transient.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retry_if: Arc::new(|err: &E| err.is_retryable()),
            on_retry: None,
        }
    }
}

impl<E> RetryPolicy<E> {
    /// Policy with an explicit predicate, for error types without a `Retryable` impl.
    pub fn with_predicate(config: RetryConfig, retry_if: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            config,
            retry_if: Arc::new(retry_if),
            on_retry: None,
        }
    }

    pub fn retry_if(mut self, retry_if: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Arc::new(retry_if);
        self
    }

    pub fn on_retry(mut self, hook: RetryHook<E>) -> Self {
        self.on_retry = Some(hook);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl<E: fmt::Display> RetryPolicy<E> {
    /// Run `operation` until it succeeds, fails terminally or attempts run out.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(self.succeeded(attempt, value)),
                Err(err) => attempt = self.failed(attempt, err).await?,
            }
        }
    }

    fn succeeded<T>(&self, attempt: u32, value: T) -> T {
        if attempt > 0 {
            tracing::info!(total_attempts = attempt + 1, "Operation succeeded after retries");
        }
        value
    }

    /// Handle a failed 0-based `attempt`: give the error back, or sleep and
    /// return the next attempt index.
    async fn failed(&self, attempt: u32, err: E) -> Result<u32, E> {
        if !(self.retry_if)(&err) {
            tracing::debug!(error = %err, "Error not retryable");
            return Err(err);
        }

        let max_attempts = self.config.max_attempts.max(1);
        if attempt + 1 >= max_attempts {
            tracing::error!(attempts = max_attempts, error = %err, "All retry attempts exhausted");
            return Err(err);
        }

        let delay = self.config.calculate_delay(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after failure"
        );

        if let Some(hook) = &self.on_retry {
            hook(attempt + 1, &err, delay).await;
        }
        tokio::time::sleep(delay).await;

        Ok(attempt + 1)
    }
}

/// Retry `operation` with the default retryable set.
pub async fn retry_async<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display + 'static,
{
    RetryPolicy::new(config.clone()).run(operation).await
}

/// Retry `operation`, each attempt going through `breaker`.
///
/// The breaker wraps the operation, so every attempt is recorded by the
/// breaker and a rejection is subject to `on_open`.
pub async fn retry_with_circuit_breaker<F, Fut, T, E>(
    config: &RetryConfig,
    breaker: &CircuitBreaker,
    on_open: OpenCircuitPolicy,
    mut operation: F,
) -> Result<T, BreakerError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display + 'static,
{
    let policy = RetryPolicy::new(config.clone()).retry_if(move |err: &BreakerError<E>| match err {
        BreakerError::Open(_) => on_open == OpenCircuitPolicy::Retry,
        other => other.is_retryable(),
    });

    let mut attempt = 0;
    loop {
        match breaker.call(&mut operation).await {
            Ok(value) => return Ok(policy.succeeded(attempt, value)),
            Err(err) => attempt = policy.failed(attempt, err).await?,
        }
    }
}
