//! Resilient client against live mock backends.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use airtable_resilience::config::{CircuitBreakerConfig, RetryConfig};
use airtable_resilience::health::HealthStatus;
use airtable_resilience::http::{ClientOptions, RequestOptions, ResilientHttpClient, ServiceRegistry};
use airtable_resilience::resilience::{retry_async, CircuitBreakerRegistry, CircuitState};
use airtable_resilience::ResilienceError;

mod common;

fn client(addr: std::net::SocketAddr, options: ClientOptions) -> ResilientHttpClient {
    ResilientHttpClient::new(
        "airtable-gateway",
        format!("http://{}", addr),
        Arc::new(CircuitBreakerRegistry::default()),
        options,
    )
    .unwrap()
}

#[tokio::test]
async fn test_breaker_trips_then_recovers_after_open_window() {
    let (addr, calls) = common::start_scripted_backend(vec![503, 503, 503], 200).await;
    let breaker = CircuitBreakerConfig::default()
        .with_failure_threshold(3)
        .with_success_threshold(1)
        .with_timeout(Duration::from_secs(1));
    let client = client(addr, ClientOptions::default().with_circuit_breaker(breaker));

    for _ in 0..3 {
        let err = client.get("/records", RequestOptions::default()).await.unwrap_err();
        assert!(matches!(err, ResilienceError::UpstreamStatus { status: 503, .. }));
    }

    let err = client.get("/records", RequestOptions::default()).await.unwrap_err();
    assert!(matches!(err, ResilienceError::BreakerOpen(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "open breaker must not reach the backend");

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let response = client.get("/records", RequestOptions::default()).await.unwrap();
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let health = client.health_check().await;
    let records = &health.circuit_breakers["airtable-gateway--records"];
    assert_eq!(records.state, CircuitState::Closed);
}

#[tokio::test]
async fn test_retry_layer_composes_with_client() {
    let (addr, calls) = common::start_scripted_backend(vec![502, 503], 200).await;
    let client = client(addr, ClientOptions::default());
    let retries = RetryConfig::default()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_millis(10))
        .with_jitter(false);

    let response = retry_async(&retries, || client.get("/bases/app1/records", RequestOptions::default()))
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let (addr, calls) = common::start_scripted_backend(vec![], 404).await;
    let client = client(addr, ClientOptions::default());
    let retries = RetryConfig::default().with_base_delay(Duration::from_millis(10));

    let err = retry_async(&retries, || client.get("/missing", RequestOptions::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, ResilienceError::UpstreamStatus { status: 404, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let addr = common::start_programmable_backend(|_| async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        (200, "{}".to_string())
    })
    .await;
    let client = client(addr, ClientOptions::default().with_timeout(Duration::from_secs(1)));

    let err = client.get("/slow", RequestOptions::default()).await.unwrap_err();
    assert!(matches!(err, ResilienceError::UpstreamTimeout { .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_headers_and_body_reach_backend() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let addr = common::start_programmable_backend(move |request| {
        recorder.lock().unwrap().push(request);
        async { (200, r#"{"id":"rec1"}"#.to_string()) }
    })
    .await;
    let client = client(addr, ClientOptions::default());

    let response = client
        .post(
            "/bases/app1/records",
            serde_json::json!({"fields": {"Name": "x"}}),
            RequestOptions::default()
                .with_query("typecast", "true")
                .with_correlation_id("corr-7"),
        )
        .await
        .unwrap();
    let created: serde_json::Value = response.json().unwrap();
    assert_eq!(created["id"], "rec1");

    let request = seen.lock().unwrap()[0].clone();
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/bases/app1/records?typecast=true");
    assert_eq!(request.header("x-correlation-id"), Some("corr-7"));
    assert_eq!(request.header("user-agent"), Some("PyAirtable-airtable-gateway/1.0"));
    assert_eq!(request.body, r#"{"fields":{"Name":"x"}}"#);
}

#[tokio::test]
async fn test_registry_health_across_services() {
    let (healthy, _) = common::start_scripted_backend(vec![], 200).await;
    let (failing, _) = common::start_scripted_backend(vec![], 500).await;

    let registry = ServiceRegistry::new(Arc::new(CircuitBreakerRegistry::default()));
    registry
        .get_client("mcp-server", &format!("http://{}", healthy), ClientOptions::default())
        .unwrap();
    registry
        .get_client("llm-orchestrator", &format!("http://{}", failing), ClientOptions::default())
        .unwrap();

    let health = registry.health_check_all().await;
    assert_eq!(health.overall_status, HealthStatus::Degraded);
    assert_eq!(health.services["mcp-server"].status, HealthStatus::Healthy);
    assert_eq!(health.services["llm-orchestrator"].status, HealthStatus::Unhealthy);

    registry.close_all().await;
    assert!(registry.is_empty());
}
