use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quota_gate::{
    AdmissionEngine, InMemoryQuotaStore, Limiter, Policy, PolicyRegistry, QuotaState, RateLimitKey,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Benchmark the raw accounting arithmetic, one algorithm at a time
fn bench_algorithms(c: &mut Criterion) {
    let mut group = c.benchmark_group("algorithms");
    group.throughput(Throughput::Elements(1000));

    let policies = [
        ("token_bucket", Policy::token_bucket(1_000_000, 1000.0).unwrap()),
        (
            "fixed_window",
            Policy::fixed_window(1_000_000, Duration::from_secs(1)).unwrap(),
        ),
        (
            "sliding_counter",
            Policy::sliding_window_counter(1_000_000, Duration::from_secs(1)).unwrap(),
        ),
        (
            "sliding_log",
            Policy::sliding_window_log(1_000_000, Duration::from_secs(1)).unwrap(),
        ),
    ];

    for (name, policy) in policies {
        group.bench_with_input(
            BenchmarkId::new("try_consume", name),
            &policy,
            |b, policy| {
                b.iter(|| {
                    let now = Instant::now();
                    let mut state = QuotaState::new(policy, 0, now);
                    for _ in 0..1000 {
                        black_box(state.try_consume(policy, black_box(1.0), now));
                    }
                })
            },
        );
    }

    group.finish();
}

/// Benchmark policy resolution across registry shapes
fn bench_policy_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_resolution");

    let registry = PolicyRegistry::new(Policy::token_bucket(100, 10.0).unwrap()).unwrap();
    for i in 0..100 {
        registry
            .set_policy(
                &format!("tenant-{i}:api"),
                Policy::token_bucket(100, 10.0).unwrap(),
            )
            .unwrap();
        registry
            .set_policy(
                &format!("tenant-{i}:*"),
                Policy::token_bucket(1000, 100.0).unwrap(),
            )
            .unwrap();
    }

    let exact = RateLimitKey::new("tenant-42:api");
    let wildcard = RateLimitKey::new("tenant-42:search");
    let default = RateLimitKey::new("nobody:home");

    group.bench_function("exact_match", |b| {
        b.iter(|| black_box(registry.resolve(black_box(&exact))))
    });
    group.bench_function("wildcard_match", |b| {
        b.iter(|| black_box(registry.resolve(black_box(&wildcard))))
    });
    group.bench_function("default_fallback", |b| {
        b.iter(|| black_box(registry.resolve(black_box(&default))))
    });

    group.finish();
}

/// Benchmark the full check path: lease hits vs store round-trips
fn bench_engine_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_check");
    group.throughput(Throughput::Elements(1000));

    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("lease_fast_path", |b| {
        // Huge budget and long TTL: after warm-up every check is a local hit
        let engine = AdmissionEngine::builder(
            InMemoryQuotaStore::new(),
            Policy::token_bucket(u64::MAX / 2, 0.0).unwrap(),
        )
        .with_lease_ttl(Duration::from_secs(3600))
        .build()
        .unwrap();
        let key = RateLimitKey::new("hot");
        rt.block_on(engine.check(&key, 1.0));

        b.iter(|| {
            rt.block_on(async {
                for _ in 0..1000 {
                    black_box(engine.check(black_box(&key), 1.0).await);
                }
            })
        })
    });

    group.bench_function("store_every_check", |b| {
        let engine = AdmissionEngine::builder(
            InMemoryQuotaStore::new(),
            Policy::token_bucket(u64::MAX / 2, 0.0).unwrap(),
        )
        .with_lease_fraction(0.0)
        .build()
        .unwrap();
        let key = RateLimitKey::new("hot");

        b.iter(|| {
            rt.block_on(async {
                for _ in 0..1000 {
                    black_box(engine.check(black_box(&key), 1.0).await);
                }
            })
        })
    });

    group.finish();
}

/// Benchmark key diversity: a single contended key vs many independent keys
fn bench_key_diversity(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_diversity");
    group.throughput(Throughput::Elements(1000));

    let rt = tokio::runtime::Runtime::new().unwrap();

    for num_keys in [1usize, 10, 1000] {
        group.bench_with_input(BenchmarkId::new("keys", num_keys), &num_keys, |b, &n| {
            let engine = AdmissionEngine::builder(
                InMemoryQuotaStore::new(),
                Policy::token_bucket(u64::MAX / 2, 0.0).unwrap(),
            )
            .with_lease_ttl(Duration::from_secs(3600))
            .build()
            .unwrap();
            let keys: Vec<_> = (0..n)
                .map(|i| RateLimitKey::composite(&format!("tenant-{i}"), "/api"))
                .collect();

            b.iter(|| {
                rt.block_on(async {
                    for i in 0..1000 {
                        let key = &keys[i % n];
                        black_box(engine.check(black_box(key), 1.0).await);
                    }
                })
            })
        });
    }

    group.finish();
}

/// Benchmark concurrent checks against one engine
fn bench_concurrent_checks(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent");

    let rt = tokio::runtime::Runtime::new().unwrap();

    for num_tasks in [2usize, 4, 8] {
        group.throughput(Throughput::Elements((num_tasks as u64) * 1000));
        group.bench_with_input(
            BenchmarkId::new("tasks", num_tasks),
            &num_tasks,
            |b, &num_tasks| {
                b.iter(|| {
                    rt.block_on(async {
                        let engine = Arc::new(
                            AdmissionEngine::builder(
                                InMemoryQuotaStore::new(),
                                Policy::token_bucket(u64::MAX / 2, 0.0).unwrap(),
                            )
                            .with_lease_ttl(Duration::from_secs(3600))
                            .build()
                            .unwrap(),
                        );

                        let mut tasks = vec![];
                        for i in 0..num_tasks {
                            let engine = Arc::clone(&engine);
                            tasks.push(tokio::spawn(async move {
                                // Each task hammers its own key
                                let key = RateLimitKey::composite(&format!("task-{i}"), "/api");
                                for _ in 0..1000 {
                                    black_box(engine.check(&key, 1.0).await);
                                }
                            }));
                        }
                        for task in tasks {
                            task.await.unwrap();
                        }
                    })
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_algorithms,
    bench_policy_resolution,
    bench_engine_check,
    bench_key_diversity,
    bench_concurrent_checks,
);
criterion_main!(benches);
