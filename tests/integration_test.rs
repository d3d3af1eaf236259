// SPDX-License-Identifier: MIT OR Apache-2.0

use matchcast_client::client::{AllUnhealthyPolicy, ErrorBudgetTracker, HealthStatus, PoolConfig};
use matchcast_client::config::InstanceConfig;
use matchcast_client::runtime::CircuitState;
use matchcast_client::testkit::{MockReply, MockTransport};
use matchcast_client::{CacheDirective, ClientConfig, ClientError, RequestOptions, ResilientClient};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const PRIMARY: &str = "http://primary:3001";
const FALLBACK: &str = "http://fallback:3001";

#[derive(Debug, Deserialize, PartialEq)]
struct Prediction {
    home: f64,
    away: f64,
    confidence: f64,
}

fn single_backend() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.mesh.enabled = false;
    config.retry.initial_delay_ms = 1000;
    config.retry.jitter_ms = 0;
    config.services.get_mut("backend").unwrap().instances = vec![InstanceConfig {
        url: PRIMARY.into(),
        weight: 10,
    }];
    config
}

fn with_fallback(mut config: ClientConfig) -> ClientConfig {
    config
        .services
        .get_mut("backend")
        .unwrap()
        .instances
        .push(InstanceConfig {
            url: FALLBACK.into(),
            weight: 5,
        });
    config
}

fn build(config: ClientConfig) -> (ResilientClient, Arc<MockTransport>) {
    let mock = Arc::new(MockTransport::new());
    let client = ResilientClient::builder(config)
        .transport(mock.clone())
        .build()
        .unwrap();
    (client, mock)
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_never_reaches_transport() -> anyhow::Result<()> {
    let (client, mock) = build(single_backend());
    let breaker = client.breakers().get("backend");
    for _ in 0..breaker.config().failure_threshold {
        breaker.on_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let started = tokio::time::Instant::now();
    let err = assert_err!(client.get::<Value>("/api/matches", RequestOptions::new()).await);

    assert!(err.is_circuit_open());
    assert_eq!(mock.call_count(), 0);
    assert_eq!(started.elapsed(), Duration::ZERO);
    for instance in client.balancer().instances("backend") {
        assert_eq!(instance.active_connections(), 0);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_retried_until_success() -> anyhow::Result<()> {
    let (client, mock) = build(single_backend());
    mock.respond(
        "http://primary:3001/api/matches/7/prediction",
        MockReply::json(&json!({"home": 0.5, "away": 0.2, "confidence": 0.7})),
    )
    .push("http://primary:3001/api/matches/7/prediction", MockReply::status(503))
    .push("http://primary:3001/api/matches/7/prediction", MockReply::network_error());

    let started = tokio::time::Instant::now();
    let prediction: Prediction = client
        .get("/api/matches/7/prediction", RequestOptions::new())
        .await?;

    assert_eq!(prediction.confidence, 0.7);
    assert_eq!(mock.call_count(), 3);
    // 1 s then 2 s between attempts.
    assert!(started.elapsed() >= Duration::from_secs(3));

    let breaker = client.breakers().get("backend");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(client.balancer().healthy_count("backend"), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_returns_last_error_once_to_circuit() {
    let (client, mock) = build(single_backend());
    mock.push("http://primary:3001/api/live", MockReply::network_error())
        .push("http://primary:3001/api/live", MockReply::status(502))
        .push("http://primary:3001/api/live", MockReply::status(500));

    let err = assert_err!(client.get::<Value>("/api/live", RequestOptions::new()).await);

    assert_eq!(err.status(), Some(http::StatusCode::INTERNAL_SERVER_ERROR));
    assert_eq!(mock.call_count(), 3);
    assert_eq!(client.breakers().get("backend").failure_count(), 1);
    assert_eq!(client.balancer().healthy_count("backend"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_not_retried() {
    let (client, mock) = build(single_backend());
    mock.respond(
        "http://primary:3001/api/matches/404",
        MockReply::Status(
            http::StatusCode::NOT_FOUND,
            json!({"message": "match not found"}).to_string().into(),
        ),
    );

    let err = assert_err!(
        client
            .get::<Value>("/api/matches/404", RequestOptions::new())
            .await
    );

    match err {
        ClientError::Client { status, message } => {
            assert_eq!(status, http::StatusCode::NOT_FOUND);
            assert_eq!(message, "match not found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_after_threshold_then_recovers() {
    let mut config = single_backend();
    config.retry.max_attempts = 1;
    let (client, mock) = build(config);

    for _ in 0..5 {
        assert_err!(client.get::<Value>("/api/odds", RequestOptions::new()).await);
    }
    let breaker = client.breakers().get("backend");
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(mock.call_count(), 5);

    let err = assert_err!(client.get::<Value>("/api/odds", RequestOptions::new()).await);
    assert!(matches!(err, ClientError::CircuitOpen { ref service, .. } if service == "backend"));
    assert_eq!(mock.call_count(), 5);

    tokio::time::advance(Duration::from_secs(30)).await;
    mock.respond("http://primary:3001/api/odds", MockReply::json(&json!([])));

    assert_ok!(client.get::<Value>("/api/odds", RequestOptions::new()).await);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_ok!(client.get::<Value>("/api/odds", RequestOptions::new()).await);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_instance_leaves_rotation() {
    let mut config = with_fallback(single_backend());
    config.retry.max_attempts = 1;
    let (client, mock) = build(config);
    mock.respond("http://primary:3001/api/news", MockReply::network_error())
        .respond("http://fallback:3001/api/news", MockReply::json(&json!(["item"])));

    assert_err!(client.get::<Value>("/api/news", RequestOptions::new()).await);
    assert_eq!(client.balancer().healthy_count("backend"), 1);

    for _ in 0..5 {
        assert_ok!(client.get::<Value>("/api/news", RequestOptions::new()).await);
    }
    assert_eq!(mock.calls_to("http://primary:3001/api/news"), 1);
    assert_eq!(mock.calls_to("http://fallback:3001/api/news"), 5);
}

#[tokio::test(start_paused = true)]
async fn test_all_unhealthy_falls_back_to_primary() {
    let (client, mock) = build(with_fallback(single_backend()));
    for instance in client.balancer().instances("backend") {
        client.balancer().mark_unhealthy(instance.url());
    }
    mock.respond("http://primary:3001/api/matches", MockReply::json(&json!([])));

    assert_ok!(client.get::<Value>("/api/matches", RequestOptions::new()).await);
    assert_eq!(mock.calls_to("http://primary:3001/api/matches"), 1);
    assert_eq!(client.metrics().snapshot().pool_failovers, 1);
    assert!(client.balancer().instances("backend")[0].is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_all_unhealthy_fail_fast() {
    let mut config = with_fallback(single_backend());
    config.balancer = PoolConfig::default().with_all_unhealthy(AllUnhealthyPolicy::FailFast);
    let (client, mock) = build(config);
    for instance in client.balancer().instances("backend") {
        client.balancer().mark_unhealthy(instance.url());
    }

    let err = assert_err!(client.get::<Value>("/api/matches", RequestOptions::new()).await);
    assert!(matches!(err, ClientError::NoInstance(_)));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_cache_hit_skips_network() -> anyhow::Result<()> {
    let (client, mock) = build(single_backend());
    mock.respond(
        "http://primary:3001/api/matches/12345/prediction",
        MockReply::json(&json!({"home": 0.4, "away": 0.35, "confidence": 0.62})),
    );
    let options = RequestOptions::new().cached(
        CacheDirective::new("match_12345_prediction", "upcoming-match")
            .with_confidence_pointer("/confidence"),
    );

    let first: Prediction = client
        .get("/api/matches/12345/prediction", options.clone())
        .await?;
    let second: Prediction = client
        .get("/api/matches/12345/prediction", options.clone())
        .await?;

    assert_eq!(first, second);
    assert_eq!(mock.call_count(), 1);

    assert_eq!(client.cache().invalidate_pattern("match_12345_*")?, 1);
    let _: Prediction = client
        .get("/api/matches/12345/prediction", options)
        .await?;
    assert_eq!(mock.call_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_cache_hit_during_outage() -> anyhow::Result<()> {
    let (client, mock) = build(single_backend());
    mock.push(
        "http://primary:3001/api/matches/9",
        MockReply::json(&json!({"home": 1.0, "away": 0.0, "confidence": 0.9})),
    );
    let options =
        RequestOptions::new().cached(CacheDirective::new("match:9", "historical"));
    let _: Prediction = client.get("/api/matches/9", options.clone()).await?;

    let breaker = client.breakers().get("backend");
    for _ in 0..5 {
        breaker.on_failure();
    }
    let cached: Prediction = client.get("/api/matches/9", options).await?;
    assert_eq!(cached.home, 1.0);
    assert_eq!(mock.call_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_error_budget_end_to_end() {
    let tracker = Arc::new(ErrorBudgetTracker::default());
    let (sink, rx) = ErrorBudgetTracker::channel();
    let consumer = tracker.spawn_consumer(rx);

    let mock = Arc::new(MockTransport::new());
    mock.respond("http://primary:3001/api/ok", MockReply::json(&json!({})))
        .respond("http://primary:3001/api/bad", MockReply::status(400));
    let client = ResilientClient::builder(single_backend())
        .transport(mock)
        .budget_sink(sink)
        .build()
        .unwrap();

    for _ in 0..3 {
        assert_ok!(client.get::<Value>("/api/ok", RequestOptions::new()).await);
    }
    assert_err!(client.get::<Value>("/api/bad", RequestOptions::new()).await);
    drop(client);
    consumer.await.unwrap();

    let status = tracker.status("backend").unwrap();
    assert_eq!(status.total_requests, 4);
    assert_eq!(status.failed_requests, 1);
    assert!(status.budget_remaining < 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_mesh_reports_down_service_but_requests_proceed() {
    let mut config = single_backend();
    config.mesh.enabled = true;
    let (client, mock) = build(config);
    mock.respond("http://localhost:3000/api/health", MockReply::json(&json!({})))
        .respond("http://localhost:3000/api/ml/health", MockReply::status(503))
        .respond("http://primary:3001/api/matches", MockReply::json(&json!([])));

    let mesh = client.mesh().unwrap().clone();
    mesh.check_all().await;

    assert_eq!(
        mesh.get_service_status("backend").unwrap().status,
        HealthStatus::Down
    );
    assert_eq!(
        mesh.get_service_status("ml").unwrap().status,
        HealthStatus::Degraded
    );
    assert!(mesh.is_healthy("frontend"));
    assert!(!mesh.can_serve_request(&["frontend", "backend"]));
    assert!(mesh.can_serve_request(&["frontend", "ml"]));

    assert_ok!(client.get::<Value>("/api/matches", RequestOptions::new()).await);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_export_after_traffic() {
    let (client, mock) = build(single_backend());
    mock.respond("http://primary:3001/api/ok", MockReply::json(&json!({})));

    assert_ok!(client.get::<Value>("/api/ok", RequestOptions::new()).await);

    assert_eq!(client.metrics().total_requests(), 1);
    assert_eq!(client.metrics().successful_requests(), 1);
    let text = client.metrics().to_prometheus_text();
    assert!(text.contains("matchcast_client_requests_total"));
}
