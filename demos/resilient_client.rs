// SPDX-License-Identifier: MIT OR Apache-2.0

//! Example: Resilient Client against scripted services
//!
//! This example runs the full request lifecycle offline, with an in-memory
//! transport standing in for the MatchCast services:
//! - Weighted instance selection and failover
//! - Retry with exponential backoff
//! - Circuit breaker rejection
//! - Prediction caching
//! - Error budget reporting and metrics export

use matchcast_client::client::ErrorBudgetTracker;
use matchcast_client::config::InstanceConfig;
use matchcast_client::testkit::{MockReply, MockTransport};
use matchcast_client::{CacheDirective, ClientConfig, RequestOptions, ResilientClient};
use serde_json::{json, Value};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // ==========================================================================
    // 1. Configuration
    // ==========================================================================
    println!("=== Configuration ===");

    let mut config = ClientConfig::default();
    config.mesh.enabled = false;
    config.retry.initial_delay_ms = 100;
    config.retry.jitter_ms = 50;
    config.services.get_mut("backend").ok_or("no backend")?.instances = vec![
        InstanceConfig {
            url: "http://api-1.matchcast.local:3001".into(),
            weight: 10,
        },
        InstanceConfig {
            url: "http://api-2.matchcast.local:3001".into(),
            weight: 5,
        },
    ];
    config.services.get_mut("ml").ok_or("no ml")?.base_url =
        Some("http://ml.matchcast.local:8000".into());
    config.apply_env();
    println!("{}", config.to_yaml()?);

    // ==========================================================================
    // 2. Client with scripted transport
    // ==========================================================================
    let transport = Arc::new(MockTransport::new());
    transport
        .respond(
            "http://api-1.matchcast.local:3001/api/matches/42/prediction",
            MockReply::json(&json!({"home": 0.55, "draw": 0.25, "away": 0.2, "confidence": 0.81})),
        )
        .push(
            "http://api-1.matchcast.local:3001/api/matches/42/prediction",
            MockReply::status(503),
        )
        .respond(
            "http://api-2.matchcast.local:3001/api/news",
            MockReply::json(&json!(["transfer window opens"])),
        );

    let tracker = Arc::new(ErrorBudgetTracker::default());
    let (sink, events) = ErrorBudgetTracker::channel();
    let consumer = tracker.spawn_consumer(events);

    let client = ResilientClient::builder(config)
        .transport(transport.clone())
        .budget_sink(sink)
        .build()?;

    // ==========================================================================
    // 3. Retry and caching
    // ==========================================================================
    println!("\n=== Retry and Caching ===");

    let options = RequestOptions::new().cached(
        CacheDirective::new("match_42_prediction", "upcoming-match")
            .with_confidence_pointer("/confidence"),
    );
    let prediction: Value = client
        .get("/api/matches/42/prediction", options.clone())
        .await?;
    println!("Prediction: {prediction}");

    let again: Value = client.get("/api/matches/42/prediction", options).await?;
    println!("From cache: {again}");
    println!("Transport calls so far: {}", transport.call_count());

    // ==========================================================================
    // 4. Failover and circuit breaking
    // ==========================================================================
    println!("\n=== Failover and Circuit Breaking ===");

    match client.get::<Value>("/ml/models", RequestOptions::new()).await {
        Ok(models) => println!("Models: {models}"),
        Err(e) if e.is_circuit_open() => println!("ML temporarily unavailable: {e}"),
        Err(e) => println!("ML call failed: {e}"),
    }

    for stats in client.balancer().stats("backend") {
        println!(
            "  {} healthy={} connections={} avg={:.1}ms",
            stats.url, stats.healthy, stats.connections, stats.avg_response_time_ms
        );
    }
    for snapshot in client.breakers().snapshots() {
        println!("  circuit {}: {:?}", snapshot.name, snapshot.state);
    }

    // ==========================================================================
    // 5. Error budget and metrics
    // ==========================================================================
    println!("\n=== Metrics ===");
    print!("{}", client.metrics().to_prometheus_text());

    println!("\n=== Error Budget ===");

    drop(client);
    consumer.await?;
    for service in ["backend", "ml"] {
        if let Some(status) = tracker.status(service) {
            println!(
                "  {service}: {}/{} failed, {:.3}% budget remaining",
                status.failed_requests,
                status.total_requests,
                status.budget_remaining * 100.0
            );
        }
    }

    Ok(())
}
