//! Basic example demonstrating admission control with per-tenant policies.
//!
//! This example runs an in-process quota store, registers a couple of
//! policies and shows how decisions, remaining estimates and retry hints
//! behave as a tenant burns through its budget.

use quota_gate::{AdmissionEngine, InMemoryQuotaStore, Policy, RateLimitKey};
use std::time::Duration;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // Global default: 5 requests of burst, refilling 1 token/sec
    let engine = AdmissionEngine::builder(
        InMemoryQuotaStore::new(),
        Policy::token_bucket(5, 1.0).unwrap(),
    )
    .build()
    .unwrap();

    // Paying tenants get a bigger budget on every endpoint
    engine
        .registry()
        .set_policy("premium:*", Policy::token_bucket(100, 50.0).unwrap())
        .unwrap();

    // Expensive endpoint, counted per hour regardless of tenant tier
    engine
        .registry()
        .set_policy(
            "premium:/export",
            Policy::fixed_window(2, Duration::from_secs(3600)).unwrap(),
        )
        .unwrap();

    println!("=== Basic Admission Control Example ===\n");

    println!("Free tenant against the 5-token default:");
    let free = RateLimitKey::composite("free-tier", "/search");
    for i in 1..=7 {
        let decision = engine.check(&free, 1.0).await;
        if decision.allowed {
            println!("  request {i}: allowed ({:.1} remaining)", decision.remaining);
        } else {
            println!(
                "  request {i}: denied, retry after {:?}",
                decision.retry_after
            );
        }
    }

    println!("\nPremium tenant rides the wildcard policy:");
    let premium = RateLimitKey::composite("premium", "/search");
    let decision = engine.check(&premium, 10.0).await;
    println!(
        "  batch of 10: allowed={} ({:.1} remaining)",
        decision.allowed, decision.remaining
    );

    println!("\nBut /export has its own 2-per-hour window:");
    let export = RateLimitKey::composite("premium", "/export");
    for i in 1..=3 {
        let decision = engine.check(&export, 1.0).await;
        println!("  export {i}: allowed={}", decision.allowed);
    }

    let snapshot = engine.metrics().snapshot();
    println!(
        "\nTotals: {} admitted, {} denied ({:.0}% denial rate)",
        snapshot.admitted_total,
        snapshot.denied_total,
        snapshot.denial_rate() * 100.0
    );
}
