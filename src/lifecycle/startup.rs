//! Startup orchestration.
//!
//! # Responsibilities
//! - Build every shared resilience component from one validated config
//! - Hand out middleware state wired to those components
//! - Register the shutdown work the components need
//!
//! # Design Decisions
//! - Components are built in dependency order: breakers, store, limiters,
//!   then service clients
//! - Any construction error is fatal
//! - Logging and metrics sinks are installed by the binary, not here

use std::sync::Arc;

use crate::config::ResilienceConfig;
use crate::error::ResilienceError;
use crate::http::middleware::{AirtableLimitState, BreakerMiddlewareState, RateLimitState};
use crate::http::registry::ServiceRegistry;
use crate::lifecycle::hooks::{hook, LifecycleHooks};
use crate::rate_limit::{connect_store, AirtableRateLimiter, RateLimiter, Store};
use crate::resilience::registry::CircuitBreakerRegistry;

/// Shared components for one process.
pub struct ResilienceContext {
    pub config: ResilienceConfig,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub store: Arc<dyn Store>,
    pub limiter: RateLimiter,
    pub airtable: AirtableRateLimiter,
    pub services: Arc<ServiceRegistry>,
}

impl ResilienceContext {
    pub async fn from_config(config: ResilienceConfig) -> Result<Self, ResilienceError> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.clone(),
            config.registry.clone(),
        ));

        let store = connect_store(&config.store).await?;
        let limiter = RateLimiter::new(store.clone(), config.store.key_prefix.clone());
        let airtable = AirtableRateLimiter::new(store.clone());

        let services = Arc::new(ServiceRegistry::from_services(breakers.clone(), &config.services)?);

        tracing::info!(
            service = %config.service.name,
            upstreams = services.len(),
            shared_store = config.store.redis_url.is_some(),
            "Resilience context ready"
        );

        Ok(Self {
            config,
            breakers,
            store,
            limiter,
            airtable,
            services,
        })
    }

    /// Endpoint breakers default to the `[circuit_breaker]` section.
    pub fn breaker_middleware_state(&self) -> Arc<BreakerMiddlewareState> {
        Arc::new(BreakerMiddlewareState::with_default_config(
            self.breakers.clone(),
            self.config.circuit_breaker.clone(),
        ))
    }

    pub fn rate_limit_state(&self) -> Arc<RateLimitState> {
        Arc::new(
            RateLimitState::new(self.limiter.clone(), &self.config.rate_limit)
                .with_fail_open(self.config.store.fail_open),
        )
    }

    pub fn airtable_state(&self) -> Arc<AirtableLimitState> {
        Arc::new(
            AirtableLimitState::new(self.airtable.clone())
                .with_exclude_paths(self.config.rate_limit.exclude_paths.clone())
                .with_fail_open(self.config.store.fail_open),
        )
    }

    /// Hooks that probe upstreams on startup and close clients on shutdown.
    pub fn hooks(&self) -> LifecycleHooks {
        let mut hooks = LifecycleHooks::new();

        let services = self.services.clone();
        hooks.on_startup(
            "upstream-health",
            hook(move || {
                let services = services.clone();
                async move {
                    let health = services.health_check_all().await;
                    if !health.overall_status.is_healthy() {
                        tracing::warn!(status = %health.overall_status, "Some upstream services are not healthy");
                    }
                    Ok(())
                }
            }),
        );

        let services = self.services.clone();
        hooks.on_shutdown(
            "close-clients",
            hook(move || {
                let services = services.clone();
                async move {
                    services.close_all().await;
                    Ok(())
                }
            }),
        );

        hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, BreakerProfile};

    const CONFIG: &str = r#"
        [service]
        name = "airtable-gateway"

        [circuit_breaker]
        failure_threshold = 4

        [rate_limit]
        limit = 2
        window_secs = 1

        [[services]]
        name = "mcp-server"
        base_url = "http://mcp-server:8001"
        profile = "database_service"
    "#;

    #[tokio::test]
    async fn test_context_from_config() {
        let context = ResilienceContext::from_config(parse_config(CONFIG).unwrap()).await.unwrap();

        let client = context.services.get("mcp-server").unwrap();
        assert_eq!(client.breaker_config(), &BreakerProfile::DatabaseService.config());

        let breaker = context.breakers.get_breaker("anything", None).unwrap();
        assert_eq!(breaker.config().failure_threshold, 4);

        let decision = context.limiter.is_allowed("user", 2, 1, Default::default()).await.unwrap();
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_shutdown_hook_closes_clients() {
        let context = ResilienceContext::from_config(parse_config(CONFIG).unwrap()).await.unwrap();
        let client = context.services.get("mcp-server").unwrap();

        assert_eq!(context.hooks().run_shutdown().await, 0);
        assert!(client.is_closed());
        assert!(context.services.is_empty());
    }
}
