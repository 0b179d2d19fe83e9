//! Circuit-breaker-protected HTTP client for one upstream service.
//!
//! # Responsibilities
//! - Route every call through a breaker scoped to the endpoint
//! - Attach default headers and an `X-Correlation-ID`
//! - Tell breaker rejections, timeouts and error statuses apart in logs
//!   and metrics, while propagating all of them
//! - Probe `/health` through a dedicated breaker
//!
//! # Design Decisions
//! - No retries here; compose with `retry_async` when wanted
//! - 5xx responses and transport failures count against the breaker;
//!   4xx responses are returned as errors without tripping it
//! - Breakers live in a shared registry, so clients built for the same
//!   service share breaker state
//! - Health reports list the breakers this client has used, by exact name

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use uuid::Uuid;

use crate::config::{CircuitBreakerConfig, ServiceConfig};
use crate::error::ResilienceError;
use crate::health::{HealthStatus, ServiceHealth};
use crate::http::transport::{
    HttpTransport, ReqwestTransport, TransportError, TransportRequest, TransportResponse,
};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::BreakerError;
use crate::resilience::registry::CircuitBreakerRegistry;
use crate::resilience::stats::epoch_millis;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Construction options for a [`ResilientHttpClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub max_idle_connections: usize,
    /// Breaker config for every endpoint; `None` uses the client default.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_idle_connections: 20,
            circuit_breaker: None,
        }
    }
}

impl ClientOptions {
    /// Options for a configured service: explicit breaker config, then
    /// profile, then the client default.
    pub fn from_service(service: &ServiceConfig) -> Self {
        let circuit_breaker = service
            .circuit_breaker
            .clone()
            .or_else(|| service.profile.map(|profile| profile.config()));

        Self {
            timeout: Duration::from_secs(service.timeout_secs),
            max_idle_connections: service.max_idle_connections,
            circuit_breaker,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// The configured breaker config, or 5 failures / 3 successes / 60s open
    /// with the request timeout as response timeout.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        self.circuit_breaker.clone().unwrap_or_else(|| {
            CircuitBreakerConfig::default()
                .with_failure_threshold(5)
                .with_success_threshold(3)
                .with_timeout(Duration::from_secs(60))
                .with_response_timeout(self.timeout)
        })
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub json: Option<serde_json::Value>,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    /// Overrides the endpoint-derived breaker name.
    pub breaker_name: Option<String>,
    /// Propagated as `X-Correlation-ID`; generated when absent.
    pub correlation_id: Option<String>,
}

impl RequestOptions {
    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_breaker_name(mut self, name: impl Into<String>) -> Self {
        self.breaker_name = Some(name.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

pub struct ResilientHttpClient {
    service: String,
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    breakers: Arc<CircuitBreakerRegistry>,
    breaker_config: CircuitBreakerConfig,
    default_headers: HeaderMap,
    timeout: Duration,
    used_breakers: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
}

impl ResilientHttpClient {
    /// Client over a pooled reqwest transport.
    pub fn new(
        service: impl Into<String>,
        base_url: impl Into<String>,
        breakers: Arc<CircuitBreakerRegistry>,
        options: ClientOptions,
    ) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(options.timeout, options.max_idle_connections)?;
        Ok(Self::with_transport(service, base_url, breakers, options, Arc::new(transport)))
    }

    pub fn with_transport(
        service: impl Into<String>,
        base_url: impl Into<String>,
        breakers: Arc<CircuitBreakerRegistry>,
        options: ClientOptions,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let service = service.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut default_headers = HeaderMap::new();
        if let Ok(agent) = HeaderValue::from_str(&format!("PyAirtable-{}/1.0", service)) {
            default_headers.insert(header::USER_AGENT, agent);
        }
        default_headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        default_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::info!(service = %service, base_url = %base_url, "Created resilient HTTP client");

        Self {
            breaker_config: options.breaker_config(),
            timeout: options.timeout,
            service,
            base_url,
            transport,
            breakers,
            default_headers,
            used_breakers: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn breaker_config(&self) -> &CircuitBreakerConfig {
        &self.breaker_config
    }

    /// Breaker name for `endpoint`: `{service}-{endpoint with '/' as '-'}`.
    pub fn breaker_name(&self, endpoint: &str) -> String {
        format!("{}-{}", self.service, endpoint.replace('/', "-"))
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    fn build_request(
        &self,
        method: Method,
        url: String,
        options: RequestOptions,
    ) -> Result<TransportRequest, ResilienceError> {
        let mut headers = self.default_headers.clone();
        headers.extend(options.headers);

        let correlation_id = options
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id = HeaderValue::from_str(&correlation_id)
            .map_err(|_| ResilienceError::Validation("correlation id is not a valid header value".into()))?;
        headers.insert(CORRELATION_ID_HEADER, correlation_id);

        let body = options
            .json
            .map(|json| serde_json::to_vec(&json))
            .transpose()
            .map_err(|e| ResilienceError::Validation(format!("request body: {}", e)))?;

        Ok(TransportRequest {
            method,
            url,
            headers,
            query: options.query,
            body,
            timeout: self.timeout,
        })
    }

    fn transport_failure(&self, breaker: &str, err: TransportError) -> ResilienceError {
        match err {
            TransportError::Timeout(_) => ResilienceError::UpstreamTimeout {
                breaker: breaker.to_string(),
                timeout: self.timeout,
            },
            other => ResilienceError::Connection {
                service: self.service.clone(),
                message: other.to_string(),
            },
        }
    }

    fn status_error(&self, response: &TransportResponse) -> ResilienceError {
        ResilienceError::UpstreamStatus {
            service: self.service.clone(),
            status: response.status.as_u16(),
            body: response.text(),
        }
    }

    /// Send a request through the endpoint's breaker.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<TransportResponse, ResilienceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ResilienceError::Connection {
                service: self.service.clone(),
                message: "client is closed".to_string(),
            });
        }

        let breaker_name = options
            .breaker_name
            .clone()
            .unwrap_or_else(|| self.breaker_name(endpoint));
        let breaker = self.breakers.get_breaker(&breaker_name, Some(&self.breaker_config))?;
        self.used_breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(breaker_name.clone());

        let url = self.url(endpoint);
        let request = self.build_request(method.clone(), url.clone(), options)?;
        tracing::debug!(service = %self.service, method = %method, url = %url, "Sending request");

        let started = Instant::now();
        let name = breaker_name.as_str();
        let outcome = breaker
            .call(move || async move {
                let response = self
                    .transport
                    .send(request)
                    .await
                    .map_err(|e| self.transport_failure(name, e))?;
                if response.status.is_server_error() {
                    return Err(self.status_error(&response));
                }
                Ok(response)
            })
            .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(response) if response.status.is_client_error() => {
                tracing::warn!(method = %method, url = %url, status = response.status.as_u16(), "HTTP error");
                metrics::record_client_request(&self.service, method.as_str(), "client_error", elapsed);
                Err(self.status_error(&response))
            }
            Ok(response) => {
                tracing::debug!(
                    method = %method,
                    url = %url,
                    status = response.status.as_u16(),
                    bytes = response.body.len(),
                    "Request completed"
                );
                metrics::record_client_request(&self.service, method.as_str(), "success", elapsed);
                Ok(response)
            }
            Err(BreakerError::Open(open)) => {
                tracing::error!(service = %self.service, breaker = %open.name, "Circuit breaker open");
                metrics::record_client_request(&self.service, method.as_str(), "circuit_open", elapsed);
                Err(ResilienceError::BreakerOpen(open))
            }
            Err(BreakerError::Timeout { breaker, timeout }) => {
                tracing::warn!(method = %method, url = %url, timeout = ?timeout, "Request timeout");
                metrics::record_client_request(&self.service, method.as_str(), "timeout", elapsed);
                Err(ResilienceError::UpstreamTimeout { breaker, timeout })
            }
            Err(BreakerError::Inner(err)) => {
                match &err {
                    ResilienceError::UpstreamTimeout { .. } => {
                        tracing::warn!(method = %method, url = %url, "Request timeout");
                        metrics::record_client_request(&self.service, method.as_str(), "timeout", elapsed);
                    }
                    ResilienceError::UpstreamStatus { status, .. } => {
                        tracing::warn!(method = %method, url = %url, status = *status, "HTTP error");
                        metrics::record_client_request(&self.service, method.as_str(), "server_error", elapsed);
                    }
                    other => {
                        tracing::error!(method = %method, url = %url, error = %other, "Request failed");
                        metrics::record_client_request(&self.service, method.as_str(), "error", elapsed);
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn get(&self, endpoint: &str, options: RequestOptions) -> Result<TransportResponse, ResilienceError> {
        self.request(Method::GET, endpoint, options).await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: serde_json::Value,
        options: RequestOptions,
    ) -> Result<TransportResponse, ResilienceError> {
        self.request(Method::POST, endpoint, options.with_json(body)).await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        body: serde_json::Value,
        options: RequestOptions,
    ) -> Result<TransportResponse, ResilienceError> {
        self.request(Method::PUT, endpoint, options.with_json(body)).await
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        body: serde_json::Value,
        options: RequestOptions,
    ) -> Result<TransportResponse, ResilienceError> {
        self.request(Method::PATCH, endpoint, options.with_json(body)).await
    }

    pub async fn delete(&self, endpoint: &str, options: RequestOptions) -> Result<TransportResponse, ResilienceError> {
        self.request(Method::DELETE, endpoint, options).await
    }

    /// Probe `/health` through the `{service}-health` breaker.
    pub async fn health_check(&self) -> ServiceHealth {
        let options = RequestOptions::default().with_breaker_name(format!("{}-health", self.service));

        let (status, response_time_ms, error) = match self.get("/health", options).await {
            Ok(response) => {
                let status = if response.status == StatusCode::OK {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                };
                (status, Some(response.elapsed.as_secs_f64() * 1000.0), None)
            }
            Err(ResilienceError::BreakerOpen(_)) => {
                (HealthStatus::CircuitOpen, None, Some("Circuit breaker is open".to_string()))
            }
            Err(err) => (HealthStatus::Unhealthy, None, Some(err.to_string())),
        };

        let used = self
            .used_breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        ServiceHealth {
            service: self.service.clone(),
            base_url: self.base_url.clone(),
            status,
            response_time_ms,
            error,
            circuit_breakers: self.breakers.stats_matching(|name| used.contains(name)),
            checked_at: epoch_millis(),
        }
    }

    /// Release the transport. Later requests fail without reaching it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close().await;
        tracing::info!(service = %self.service, "Closed HTTP client");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::transport::testing::ScriptedTransport;
    use crate::resilience::circuit_breaker::CircuitState;

    fn client(transport: Arc<ScriptedTransport>, config: CircuitBreakerConfig) -> ResilientHttpClient {
        ResilientHttpClient::with_transport(
            "airtable-gateway",
            "http://airtable-gateway:8002/",
            Arc::new(CircuitBreakerRegistry::default()),
            ClientOptions::default().with_circuit_breaker(config),
            transport,
        )
    }

    #[tokio::test]
    async fn test_request_composition() {
        let transport = Arc::new(ScriptedTransport::new(200));
        let client = client(transport.clone(), CircuitBreakerConfig::default());

        let options = RequestOptions::default()
            .with_query("maxRecords", "10")
            .with_correlation_id("req-42");
        client.post("/bases/app1/records", serde_json::json!({"a": 1}), options).await.unwrap();

        let sent = transport.last_request();
        assert_eq!(sent.method, Method::POST);
        assert_eq!(sent.url, "http://airtable-gateway:8002/bases/app1/records");
        assert_eq!(sent.query, vec![("maxRecords".to_string(), "10".to_string())]);
        assert_eq!(sent.body.as_deref(), Some(br#"{"a":1}"#.as_slice()));
        assert_eq!(sent.headers[CORRELATION_ID_HEADER], "req-42");
        assert_eq!(sent.headers[header::USER_AGENT], "PyAirtable-airtable-gateway/1.0");
        assert_eq!(sent.headers[header::ACCEPT], "application/json");

        assert!(client.breakers.get("airtable-gateway--bases-app1-records").is_some());
    }

    #[tokio::test]
    async fn test_correlation_id_generated_when_absent() {
        let transport = Arc::new(ScriptedTransport::new(200));
        let client = client(transport.clone(), CircuitBreakerConfig::default());

        client.get("records", RequestOptions::default()).await.unwrap();

        let sent = transport.last_request();
        let id = sent.headers[CORRELATION_ID_HEADER].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_server_errors_trip_endpoint_breaker() {
        let transport = Arc::new(ScriptedTransport::new(503));
        let client = client(transport.clone(), CircuitBreakerConfig::default().with_failure_threshold(2));

        for _ in 0..2 {
            let err = client.get("/tables", RequestOptions::default()).await.unwrap_err();
            assert!(matches!(err, ResilienceError::UpstreamStatus { status: 503, .. }));
        }

        let err = client.get("/tables", RequestOptions::default()).await.unwrap_err();
        assert!(matches!(err, ResilienceError::BreakerOpen(_)));
        assert_eq!(transport.sent(), 2);

        // Other endpoints have their own breaker
        client.get("/bases", RequestOptions::default()).await.unwrap_err();
        assert_eq!(transport.sent(), 3);
    }

    #[tokio::test]
    async fn test_client_errors_propagate_without_tripping() {
        let transport = Arc::new(ScriptedTransport::new(404));
        let client = client(transport.clone(), CircuitBreakerConfig::default().with_failure_threshold(1));

        for _ in 0..3 {
            let err = client.get("/missing", RequestOptions::default()).await.unwrap_err();
            assert!(matches!(err, ResilienceError::UpstreamStatus { status: 404, .. }));
        }

        let breaker = client.breakers.get("airtable-gateway--missing").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.get_stats().stats.failed_requests, 0);
        assert_eq!(transport.sent(), 3);
    }

    #[tokio::test]
    async fn test_transport_timeout_maps_to_upstream_timeout() {
        let transport = Arc::new(ScriptedTransport::new(200));
        transport.push(Err(TransportError::Timeout("deadline".into())));
        let client = client(transport.clone(), CircuitBreakerConfig::default());

        let err = client.get("/slow", RequestOptions::default()).await.unwrap_err();
        assert!(matches!(err, ResilienceError::UpstreamTimeout { .. }));
        assert!(err.to_string().contains("airtable-gateway--slow"));
    }

    #[tokio::test]
    async fn test_health_check_statuses() {
        let transport = Arc::new(ScriptedTransport::new(200));
        transport.push(Ok(200));
        transport.push(Ok(204));
        transport.push(Err(TransportError::Connection("refused".into())));
        let client = client(transport.clone(), CircuitBreakerConfig::default().with_failure_threshold(1));

        let healthy = client.health_check().await;
        assert_eq!(healthy.status, HealthStatus::Healthy);
        assert!(healthy.response_time_ms.is_some());
        assert!(healthy.circuit_breakers.contains_key("airtable-gateway-health"));

        assert_eq!(client.health_check().await.status, HealthStatus::Degraded);

        let down = client.health_check().await;
        assert_eq!(down.status, HealthStatus::Unhealthy);
        assert!(down.error.unwrap().contains("refused"));

        // Threshold of one: the failed probe opened the health breaker
        let open = client.health_check().await;
        assert_eq!(open.status, HealthStatus::CircuitOpen);
        assert_eq!(transport.sent(), 3);
    }

    #[tokio::test]
    async fn test_health_lists_only_own_breakers() {
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let transport = Arc::new(ScriptedTransport::new(200));
        let short = ResilientHttpClient::with_transport(
            "mcp",
            "http://mcp:8001",
            breakers.clone(),
            ClientOptions::default(),
            transport.clone(),
        );
        let long = ResilientHttpClient::with_transport(
            "mcp-server",
            "http://mcp-server:8001",
            breakers,
            ClientOptions::default(),
            transport,
        );

        long.get("/records", RequestOptions::default()).await.unwrap();
        short.get("tools", RequestOptions::default()).await.unwrap();

        let health = short.health_check().await;
        let names: Vec<&str> = health.circuit_breakers.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["mcp-health", "mcp-tools"]);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let transport = Arc::new(ScriptedTransport::new(200));
        let client = client(transport.clone(), CircuitBreakerConfig::default());

        client.close().await;
        client.close().await;

        assert!(client.is_closed());
        assert!(transport.is_closed());
        assert!(client.get("/records", RequestOptions::default()).await.is_err());
        assert_eq!(transport.sent(), 0);
    }

    #[tokio::test]
    async fn test_sub_second_timeout_is_kept() {
        let transport = Arc::new(ScriptedTransport::new(200).with_delay(Duration::from_millis(5)));
        let client = ResilientHttpClient::with_transport(
            "svc",
            "http://svc:9000",
            Arc::new(CircuitBreakerRegistry::default()),
            ClientOptions::default().with_timeout(Duration::from_millis(500)),
            transport.clone(),
        );
        assert_eq!(client.breaker_config().response_timeout(), Duration::from_millis(500));

        let response = client.get("/records", RequestOptions::default()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(transport.last_request().timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_default_breaker_config_follows_timeout() {
        let options = ClientOptions::default().with_timeout(Duration::from_secs(12));
        let config = options.breaker_config();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.response_timeout(), Duration::from_secs(12));
    }
}
