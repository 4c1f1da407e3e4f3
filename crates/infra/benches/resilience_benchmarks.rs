use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hybridcap_core::{Clock, ManualClock};
use hybridcap_infra::resilience::{
    BackoffConfig, CircuitBreakerConfig, CircuitBreakerRegistry, RateLimitGovernor,
    RecordingSleeper, RemoteError, ResilientExecutor, RetryConfig,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(Utc::now()))
}

fn bench_backoff_delay(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_delay");
    let plain = BackoffConfig::default().with_jitter(false);
    let jittered = BackoffConfig::default();
    let mut rng = StdRng::seed_from_u64(7);

    group.bench_function("no_jitter", |b| {
        b.iter(|| {
            for attempt in 0..16 {
                black_box(plain.delay(black_box(attempt), &mut rng));
            }
        });
    });
    group.bench_function("jitter", |b| {
        b.iter(|| {
            for attempt in 0..16 {
                black_box(jittered.delay(black_box(attempt), &mut rng));
            }
        });
    });
    group.finish();
}

fn bench_breaker_hot_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("breaker_registry");

    for keys in [1usize, 100, 10_000].iter() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), clock());
        let names: Vec<String> = (0..*keys).map(|i| format!("repo:{i}:fetch_page")).collect();
        for name in &names {
            registry.record_success(name);
        }

        group.throughput(Throughput::Elements(*keys as u64));
        group.bench_with_input(BenchmarkId::new("allow_and_record", keys), keys, |b, _| {
            b.iter(|| {
                for name in &names {
                    if registry.allow(black_box(name)) {
                        registry.record_success(name);
                    }
                }
            });
        });
    }
    group.finish();
}

fn bench_executor_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("resilient_executor");
    group.sample_size(1000);
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(err) => panic!("failed to build runtime: {err}"),
    };

    let clock = clock();
    let executor = ResilientExecutor::new(
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), clock.clone())),
        Arc::new(RateLimitGovernor::new(clock)),
        Arc::new(RecordingSleeper::new()),
    )
    .with_seed(7);
    let retry = RetryConfig::new(
        3,
        BackoffConfig::exponential(Duration::from_millis(1), 2.0, Duration::from_millis(10)),
    );

    group.bench_function("success_first_attempt", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let out: Result<u32, _> = executor
                    .execute_with_backoff(&retry, Some("repo:1:fetch_page"), || async {
                        Ok::<_, RemoteError>(1)
                    })
                    .await;
                black_box(out)
            })
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_backoff_delay,
    bench_breaker_hot_path,
    bench_executor_overhead
);
criterion_main!(benches);
