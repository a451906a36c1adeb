use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use llm_rate_limiter::domain::clock::ManualClock;
use llm_rate_limiter::domain::config::{
    LimiterConfig, ModelConfig, RatioAdjustmentConfig, RatioConfig, ResourceEstimation,
};
use llm_rate_limiter::domain::coordinator::{CoordinatorOptions, RateLimitCoordinator};
use llm_rate_limiter::domain::scheduler::job::{JobFn, JobOutcome, JobRequest};
use llm_rate_limiter::domain::usage::{TokenUsage, UsageReport};
use llm_rate_limiter::domain::util::id::{JobTypeId, ModelId};

fn two_type_config(
    tpm: u64,
    estimated_tokens: u64,
    fixed_ratio: f64,
    flex_ratio: f64,
) -> LimiterConfig {
    let model = ModelId::new("gpt");
    let mut models = HashMap::new();
    models.insert(model.clone(), ModelConfig { tokens_per_minute: Some(tpm), ..Default::default() });

    let mut estimations = HashMap::new();
    estimations.insert(
        JobTypeId::new("fixed-type"),
        ResourceEstimation {
            estimated_used_tokens: Some(estimated_tokens),
            ratio: RatioConfig { initial_value: Some(fixed_ratio), flexible: false },
            ..Default::default()
        },
    );
    estimations.insert(
        JobTypeId::new("flex-type"),
        ResourceEstimation {
            estimated_used_tokens: Some(estimated_tokens),
            ratio: RatioConfig { initial_value: Some(flex_ratio), flexible: true },
            ..Default::default()
        },
    );

    LimiterConfig { models, escalation_order: vec![model], estimations, ..Default::default() }
}

fn options_with_clock(clock: &ManualClock) -> CoordinatorOptions {
    CoordinatorOptions { clock: Arc::new(clock.clone()), ..Default::default() }
}

fn gated_job(gate: Arc<tokio::sync::Semaphore>, tokens: u64) -> JobFn {
    Arc::new(move |_context| {
        let gate = gate.clone();
        Box::pin(async move {
            let _permit = gate.acquire().await;
            Ok(JobOutcome::Resolve(UsageReport::of_tokens(TokenUsage::new(tokens, 0, 0))))
        })
    })
}

async fn wait_until(condition: impl Fn() -> bool, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A fixed-ratio type keeps its slots no matter how hard the flexible
/// type floods the model.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fixed_ratio_slots_survive_a_flood() {
    let clock = ManualClock::new(0);
    // Pool of 10 whole jobs: 4 fixed, 6 flexible.
    let config = two_type_config(100_000, 10_000, 0.4, 0.6);
    let coordinator =
        RateLimitCoordinator::start(config, options_with_clock(&clock)).await.unwrap();

    let fixed = JobTypeId::new("fixed-type");
    let model = ModelId::new("gpt");
    assert_eq!(coordinator.get_stats().models[&model].job_types[&fixed].allocated, 4);

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let mut flood = Vec::new();
    for i in 0..20 {
        let coordinator = coordinator.clone();
        let job = gated_job(gate.clone(), 10_000);
        flood.push(tokio::spawn(async move {
            coordinator.queue_job(JobRequest::new(format!("flood-{}", i), "flex-type", job)).await
        }));
    }

    // All six flexible slots fill up.
    let stats = coordinator.clone();
    wait_until(
        move || {
            stats.get_stats().models[&ModelId::new("gpt")].job_types
                [&JobTypeId::new("flex-type")]
                .in_flight
                == 6
        },
        Duration::from_secs(2),
        "flexible slots saturated",
    )
    .await;
    assert_eq!(coordinator.get_stats().models[&model].job_types[&fixed].allocated, 4);

    // The fixed-type job squeezes through the protected share promptly.
    let started = Instant::now();
    let immediate: JobFn = Arc::new(|_context| {
        Box::pin(async move {
            Ok(JobOutcome::Resolve(UsageReport::of_tokens(TokenUsage::new(10_000, 0, 0))))
        })
    });
    let success =
        coordinator.queue_job(JobRequest::new("vip", "fixed-type", immediate)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(success.model_used, model);
    assert_eq!(coordinator.get_stats().models[&model].job_types[&fixed].allocated, 4);

    // Drain the flood; whatever the token window cannot take anymore is
    // rejected at shutdown.
    gate.add_permits(100);
    tokio::time::sleep(Duration::from_millis(100)).await;
    coordinator.stop().await;
    for handle in flood {
        let _ = handle.await;
    }
}

/// Sustained pressure on one flexible type pulls ratio mass over from an
/// idle flexible type.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adaptive_loop_rebalances_flexible_types() {
    let clock = ManualClock::new(0);
    let mut config = two_type_config(10_000, 1_000, 0.5, 0.5);
    // Both types flexible for this one; quick adjustment cadence.
    config.estimations.get_mut(&JobTypeId::new("fixed-type")).unwrap().ratio =
        RatioConfig { initial_value: Some(0.5), flexible: true };
    config.ratio_adjustment =
        RatioAdjustmentConfig { adjustment_interval_ms: 100, ..Default::default() };
    let coordinator =
        RateLimitCoordinator::start(config, options_with_clock(&clock)).await.unwrap();

    let model = ModelId::new("gpt");
    let flex = JobTypeId::new("flex-type");
    assert_eq!(coordinator.get_stats().models[&model].job_types[&flex].allocated, 5);

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let mut busy = Vec::new();
    for i in 0..5 {
        let coordinator = coordinator.clone();
        let job = gated_job(gate.clone(), 1_000);
        busy.push(tokio::spawn(async move {
            coordinator.queue_job(JobRequest::new(format!("busy-{}", i), "flex-type", job)).await
        }));
    }

    // Load 1.0 on flex-type, 0.0 on the other: the loop shifts ratio.
    let stats = coordinator.clone();
    wait_until(
        move || {
            stats.get_stats().models[&ModelId::new("gpt")].job_types[&JobTypeId::new("flex-type")]
                .allocated
                > 5
        },
        Duration::from_secs(3),
        "ratio adjustment to kick in",
    )
    .await;

    let snapshot = coordinator.get_stats().models[&model].job_types.clone();
    let ratio_sum: f64 = snapshot.values().map(|t| t.ratio).sum();
    assert!((ratio_sum - 1.0).abs() < 1e-9);

    gate.add_permits(100);
    for handle in busy {
        let _ = handle.await;
    }
    coordinator.stop().await;
}
