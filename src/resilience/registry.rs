//! Named circuit breaker registry.
//!
//! # Responsibilities
//! - Hand out one breaker per name, creating it on first use
//! - Aggregate snapshots and bulk reset
//!
//! # Design Decisions
//! - Constructed explicitly and shared by `Arc`; no process-wide instance
//! - The lock guards lookup/insert only, never a protected call
//! - A differing config for an existing name follows `ConfigConflictPolicy`:
//!   keep the existing breaker (with a warning) or reject the lookup

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::config::{CircuitBreakerConfig, ConfigConflictPolicy, RegistryConfig};
use crate::error::ResilienceError;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::resilience::stats::epoch_millis;

/// Snapshot of every registered breaker.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub circuit_breakers: BTreeMap<String, CircuitBreakerSnapshot>,
    pub total_breakers: usize,
    /// Epoch milliseconds.
    pub generated_at: u64,
}

pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    conflict_policy: ConfigConflictPolicy,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), RegistryConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig, config: RegistryConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            default_config,
            conflict_policy: config.conflict_policy,
        }
    }

    pub fn conflict_policy(&self) -> ConfigConflictPolicy {
        self.conflict_policy
    }

    /// Get the breaker registered under `name`, creating it if absent.
    ///
    /// `config` applies only on creation; `None` means the registry default.
    pub fn get_breaker(
        &self,
        name: &str,
        config: Option<&CircuitBreakerConfig>,
    ) -> Result<Arc<CircuitBreaker>, ResilienceError> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = breakers.get(name) {
            if let Some(requested) = config {
                if requested != existing.config() {
                    match self.conflict_policy {
                        ConfigConflictPolicy::KeepExisting => {
                            tracing::warn!(
                                breaker = %name,
                                "Circuit breaker already exists with a different config; keeping existing"
                            );
                        }
                        ConfigConflictPolicy::Reject => {
                            return Err(ResilienceError::BreakerConfigConflict {
                                name: name.to_string(),
                            });
                        }
                    }
                }
            }
            return Ok(existing.clone());
        }

        let config = config.cloned().unwrap_or_else(|| self.default_config.clone());
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        breakers.insert(name.to_string(), breaker.clone());
        tracing::info!(breaker = %name, "Created circuit breaker");

        Ok(breaker)
    }

    /// Look up a breaker without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots of breakers whose names match `filter`.
    pub fn stats_matching(&self, filter: impl Fn(&str) -> bool) -> BTreeMap<String, CircuitBreakerSnapshot> {
        self.all()
            .into_iter()
            .filter(|b| filter(b.name()))
            .map(|b| (b.name().to_string(), b.get_stats()))
            .collect()
    }

    pub fn get_all_stats(&self) -> RegistryStats {
        let circuit_breakers = self.stats_matching(|_| true);
        RegistryStats {
            total_breakers: circuit_breakers.len(),
            circuit_breakers,
            generated_at: epoch_millis(),
        }
    }

    /// Reset every breaker, returning each one's stats from before the reset.
    pub fn reset_all(&self) -> BTreeMap<String, CircuitBreakerSnapshot> {
        self.all()
            .into_iter()
            .map(|b| (b.name().to_string(), b.reset()))
            .collect()
    }

    /// Run `operation` through the breaker named `name`.
    pub async fn call<F, Fut, T>(
        &self,
        name: &str,
        config: Option<&CircuitBreakerConfig>,
        operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let breaker = self.get_breaker(name, config)?;
        breaker.call(operation).await.map_err(ResilienceError::from)
    }
}
