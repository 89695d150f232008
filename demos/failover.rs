//! Example demonstrating fallback behavior during a store outage.
//!
//! Uses the mock store (from the `test-helpers` feature) to simulate the
//! shared quota store going down and coming back, and shows how fail-open
//! keeps admitting a bounded trickle while degraded.
//!
//! Run with: cargo run --example failover --features test-helpers

use quota_gate::infrastructure::mocks::MockQuotaStore;
use quota_gate::{AdmissionEngine, FallbackMode, OutageConfig, Policy, RateLimitKey};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let store = Arc::new(MockQuotaStore::new());
    let engine = AdmissionEngine::builder(store.clone(), Policy::token_bucket(100, 10.0).unwrap())
        .with_fallback(FallbackMode::FailOpen {
            local_burst_allowance: 3.0,
        })
        .with_outage_config(OutageConfig {
            failure_threshold: 2,
            retry_timeout: Duration::from_millis(200),
        })
        .build()
        .unwrap();

    let key = RateLimitKey::composite("tenant-1", "/api");

    println!("=== Store Outage Failover Example ===\n");

    println!("Store healthy:");
    for i in 1..=3 {
        let decision = engine.check(&key, 1.0).await;
        println!(
            "  request {i}: allowed={} degraded={}",
            decision.allowed, decision.degraded
        );
    }

    println!("\nStore goes down; fail-open admits up to the 3-token allowance:");
    store.set_available(false);
    for i in 1..=6 {
        let decision = engine.check(&key, 1.0).await;
        println!(
            "  request {i}: allowed={} degraded={} reason={:?}",
            decision.allowed, decision.degraded, decision.reason
        );
    }

    println!("\nStore recovers; the next probe restores normal decisions:");
    store.set_available(true);
    tokio::time::sleep(Duration::from_millis(250)).await;
    let decision = engine.check(&key, 1.0).await;
    println!(
        "  request: allowed={} degraded={}",
        decision.allowed, decision.degraded
    );

    let snapshot = engine.metrics().snapshot();
    println!(
        "\nTotals: {} admitted, {} denied, {} degraded decisions",
        snapshot.admitted_total, snapshot.denied_total, snapshot.degraded_total
    );
}
