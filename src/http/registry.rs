//! One resilient client per upstream service.
//!
//! # Responsibilities
//! - Get-or-create clients by service name
//! - Build clients from `[[services]]` config and the built-in presets
//! - Aggregate health across services; close them all on shutdown
//!
//! # Design Decisions
//! - Every client shares one breaker registry
//! - The map lock covers lookup and insert only; health probes run on
//!   cloned handles, concurrently

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;

use crate::config::{CircuitBreakerConfig, ServiceConfig};
use crate::error::ResilienceError;
use crate::health::RegistryHealth;
use crate::http::client::{ClientOptions, ResilientHttpClient};
use crate::http::transport::HttpTransport;
use crate::resilience::registry::CircuitBreakerRegistry;

/// Known service with its default address and breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct ServicePreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
    pub response_timeout_secs: u64,
}

/// Critical path; trips early and expects fast answers.
pub const MCP_SERVER: ServicePreset = ServicePreset {
    name: "mcp-server",
    base_url: "http://mcp-server:8001",
    failure_threshold: 3,
    success_threshold: 2,
    timeout_secs: 30,
    response_timeout_secs: 10,
};

pub const AIRTABLE_GATEWAY: ServicePreset = ServicePreset {
    name: "airtable-gateway",
    base_url: "http://airtable-gateway:8002",
    failure_threshold: 5,
    success_threshold: 3,
    timeout_secs: 60,
    response_timeout_secs: 30,
};

/// LLM calls run long.
pub const LLM_ORCHESTRATOR: ServicePreset = ServicePreset {
    name: "llm-orchestrator",
    base_url: "http://llm-orchestrator:8000",
    failure_threshold: 3,
    success_threshold: 2,
    timeout_secs: 120,
    response_timeout_secs: 60,
};

pub const PRESETS: [ServicePreset; 3] = [MCP_SERVER, AIRTABLE_GATEWAY, LLM_ORCHESTRATOR];

impl ServicePreset {
    pub fn find(name: &str) -> Option<ServicePreset> {
        PRESETS.iter().copied().find(|preset| preset.name == name)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.failure_threshold)
            .with_success_threshold(self.success_threshold)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_response_timeout(Duration::from_secs(self.response_timeout_secs))
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::default().with_circuit_breaker(self.breaker_config())
    }
}

pub struct ServiceRegistry {
    clients: Mutex<HashMap<String, Arc<ResilientHttpClient>>>,
    breakers: Arc<CircuitBreakerRegistry>,
    /// Shared by every client when set; otherwise each gets its own pool.
    transport: Option<Arc<dyn HttpTransport>>,
}

impl ServiceRegistry {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            breakers,
            transport: None,
        }
    }

    pub fn with_transport(breakers: Arc<CircuitBreakerRegistry>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport: Some(transport),
            ..Self::new(breakers)
        }
    }

    /// Registry with a client for every configured service.
    pub fn from_services(
        breakers: Arc<CircuitBreakerRegistry>,
        services: &[ServiceConfig],
    ) -> Result<Self, ResilienceError> {
        let registry = Self::new(breakers);
        for service in services {
            registry.register(service)?;
        }
        Ok(registry)
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Get the client for `service`, creating it if absent.
    ///
    /// `base_url` and `options` apply only on creation.
    pub fn get_client(
        &self,
        service: &str,
        base_url: &str,
        options: ClientOptions,
    ) -> Result<Arc<ResilientHttpClient>, ResilienceError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = clients.get(service) {
            return Ok(existing.clone());
        }

        let client = match &self.transport {
            Some(transport) => ResilientHttpClient::with_transport(
                service,
                base_url,
                self.breakers.clone(),
                options,
                transport.clone(),
            ),
            None => ResilientHttpClient::new(service, base_url, self.breakers.clone(), options).map_err(|e| {
                ResilienceError::Connection {
                    service: service.to_string(),
                    message: e.to_string(),
                }
            })?,
        };

        let client = Arc::new(client);
        clients.insert(service.to_string(), client.clone());
        tracing::info!(service = %service, "Registered HTTP client");
        Ok(client)
    }

    pub fn register(&self, service: &ServiceConfig) -> Result<Arc<ResilientHttpClient>, ResilienceError> {
        self.get_client(&service.name, &service.base_url, ClientOptions::from_service(service))
    }

    /// Client for a preset service, at its default address unless overridden.
    pub fn preset_client(
        &self,
        preset: &ServicePreset,
        base_url: Option<&str>,
    ) -> Result<Arc<ResilientHttpClient>, ResilienceError> {
        self.get_client(preset.name, base_url.unwrap_or(preset.base_url), preset.client_options())
    }

    pub fn get(&self, service: &str) -> Option<Arc<ResilientHttpClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all(&self) -> Vec<Arc<ResilientHttpClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub async fn health_check_all(&self) -> RegistryHealth {
        let clients = self.all();
        let reports = join_all(clients.iter().map(|client| client.health_check())).await;
        RegistryHealth::from_reports(reports)
    }

    /// Close and forget every client.
    pub async fn close_all(&self) {
        let clients: Vec<_> = {
            let mut map = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
            map.drain().map(|(_, client)| client).collect()
        };

        for client in &clients {
            client.close().await;
        }
        tracing::info!(closed = clients.len(), "Closed all HTTP clients");
    }
}
