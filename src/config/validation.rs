//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, rates within 0..=1)
//! - Check service definitions (parseable URLs, unique names)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ResilienceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;
use url::Url;

use crate::config::schema::{CircuitBreakerConfig, ResilienceConfig, RetryConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a full configuration.
pub fn validate_config(config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_breaker("circuit_breaker", &config.circuit_breaker, &mut errors);
    validate_retry("retries", &config.retries, &mut errors);

    if config.rate_limit.limit == 0 {
        errors.push(ValidationError::new("rate_limit.limit", "must be greater than 0"));
    }
    if config.rate_limit.window_secs == 0 {
        errors.push(ValidationError::new("rate_limit.window_secs", "must be greater than 0"));
    }
    if config.store.key_prefix.is_empty() {
        errors.push(ValidationError::new("store.key_prefix", "must not be empty"));
    }

    let mut seen = HashSet::new();
    for (i, service) in config.services.iter().enumerate() {
        let field = format!("services[{}]", i);
        if service.name.is_empty() {
            errors.push(ValidationError::new(format!("{}.name", field), "must not be empty"));
        } else if !seen.insert(service.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("duplicate service name '{}'", service.name),
            ));
        }
        if let Err(e) = Url::parse(&service.base_url) {
            errors.push(ValidationError::new(
                format!("{}.base_url", field),
                format!("invalid URL '{}': {}", service.base_url, e),
            ));
        }
        if service.timeout_secs == 0 {
            errors.push(ValidationError::new(format!("{}.timeout_secs", field), "must be greater than 0"));
        }
        if let Some(breaker) = &service.circuit_breaker {
            validate_breaker(&format!("{}.circuit_breaker", field), breaker, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a single breaker config, appending problems to `errors`.
pub fn validate_breaker(prefix: &str, config: &CircuitBreakerConfig, errors: &mut Vec<ValidationError>) {
    let field = |name: &str| format!("{}.{}", prefix, name);

    if config.failure_threshold == 0 {
        errors.push(ValidationError::new(field("failure_threshold"), "must be greater than 0"));
    }
    if config.success_threshold == 0 {
        errors.push(ValidationError::new(field("success_threshold"), "must be greater than 0"));
    }
    if config.timeout_ms == 0 {
        errors.push(ValidationError::new(field("timeout_ms"), "must be greater than 0"));
    }
    if config.max_timeout_ms < config.timeout_ms {
        errors.push(ValidationError::new(
            field("max_timeout_ms"),
            format!("must be at least timeout_ms ({})", config.timeout_ms),
        ));
    }
    if !(config.backoff_multiplier >= 1.0) {
        errors.push(ValidationError::new(field("backoff_multiplier"), "must be at least 1.0"));
    }
    if config.response_timeout_ms == 0 {
        errors.push(ValidationError::new(field("response_timeout_ms"), "must be greater than 0"));
    }
    for (name, rate) in [
        ("error_rate_threshold", config.error_rate_threshold),
        ("slow_request_rate_threshold", config.slow_request_rate_threshold),
    ] {
        if !(0.0..=1.0).contains(&rate) {
            errors.push(ValidationError::new(field(name), "must be within 0.0..=1.0"));
        }
    }
}

fn validate_retry(prefix: &str, config: &RetryConfig, errors: &mut Vec<ValidationError>) {
    if config.max_attempts == 0 {
        errors.push(ValidationError::new(format!("{}.max_attempts", prefix), "must be at least 1"));
    }
    if config.max_delay_ms < config.base_delay_ms {
        errors.push(ValidationError::new(
            format!("{}.max_delay_ms", prefix),
            format!("must be at least base_delay_ms ({})", config.base_delay_ms),
        ));
    }
    if !(config.exponential_base >= 1.0) {
        errors.push(ValidationError::new(format!("{}.exponential_base", prefix), "must be at least 1.0"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ServiceConfig;

    fn service(name: &str, url: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            base_url: url.to_string(),
            timeout_secs: 30,
            max_idle_connections: 20,
            profile: None,
            circuit_breaker: None,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ResilienceConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = ResilienceConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        config.circuit_breaker.error_rate_threshold = 1.5;
        config.retries.max_attempts = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.field == "circuit_breaker.failure_threshold"));
        assert!(errors.iter().any(|e| e.field == "circuit_breaker.error_rate_threshold"));
        assert!(errors.iter().any(|e| e.field == "retries.max_attempts"));
    }

    #[test]
    fn test_rejects_backoff_ceiling_below_timeout() {
        let mut config = ResilienceConfig::default();
        config.circuit_breaker.timeout_ms = 120_000;
        config.circuit_breaker.max_timeout_ms = 60_000;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "circuit_breaker.max_timeout_ms");
    }

    #[test]
    fn test_service_checks() {
        let mut config = ResilienceConfig::default();
        config.services.push(service("mcp-server", "http://mcp-server:8001"));
        config.services.push(service("mcp-server", "http://other:8001"));
        config.services.push(service("broken", "not a url"));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("duplicate"));
        assert_eq!(errors[1].field, "services[2].base_url");
    }
}
