use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use llm_rate_limiter::domain::clock::ManualClock;
use llm_rate_limiter::domain::config::{
    LimiterConfig, ModelConfig, RatioConfig, ResourceEstimation,
};
use llm_rate_limiter::domain::coordinator::{CoordinatorOptions, RateLimitCoordinator};
use llm_rate_limiter::domain::scheduler::job::{JobFn, JobOutcome, JobRequest, JobStatus};
use llm_rate_limiter::domain::usage::{TokenUsage, UsageReport};
use llm_rate_limiter::domain::util::id::{JobTypeId, ModelId};
use llm_rate_limiter::error::Error;

fn two_model_config() -> LimiterConfig {
    let mut models = HashMap::new();
    models.insert(
        ModelId::new("model-a"),
        ModelConfig { tokens_per_minute: Some(10_000), ..Default::default() },
    );
    models.insert(
        ModelId::new("model-b"),
        ModelConfig { max_concurrent_requests: Some(10), ..Default::default() },
    );

    let mut max_wait_ms = HashMap::new();
    max_wait_ms.insert(ModelId::new("model-a"), 0);

    let mut estimations = HashMap::new();
    estimations.insert(
        JobTypeId::new("summary"),
        ResourceEstimation {
            estimated_used_tokens: Some(10_000),
            ratio: RatioConfig { initial_value: Some(1.0), flexible: true },
            max_wait_ms,
            ..Default::default()
        },
    );

    LimiterConfig {
        models,
        escalation_order: vec![ModelId::new("model-a"), ModelId::new("model-b")],
        estimations,
        ..Default::default()
    }
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

/// A `maxWaitMS = 0` model is skipped immediately once it is full; the
/// second job lands on the fallback within the same breath.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_wait_escalates_without_blocking() {
    let clock = ManualClock::new(0);
    let coordinator =
        RateLimitCoordinator::start(two_model_config(), options_with_clock(&clock)).await.unwrap();

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let first = {
        let coordinator = coordinator.clone();
        let job = gated_job(gate.clone(), 10_000);
        tokio::spawn(async move {
            coordinator.queue_job(JobRequest::new("job-1", "summary", job)).await
        })
    };

    // The first job owns model-a's whole token window.
    let stats = coordinator.clone();
    wait_until(
        move || {
            stats
                .get_stats()
                .active_jobs
                .iter()
                .any(|info| info.status == JobStatus::Processing)
        },
        Duration::from_secs(2),
        "first job processing",
    )
    .await;

    let immediate: JobFn = Arc::new(|_context| {
        Box::pin(async move {
            Ok(JobOutcome::Resolve(UsageReport::of_tokens(TokenUsage::new(0, 0, 0))))
        })
    });
    let started = Instant::now();
    let second =
        coordinator.queue_job(JobRequest::new("job-2", "summary", immediate)).await.unwrap();
    assert_eq!(second.model_used, ModelId::new("model-b"));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(
        second.models_tried,
        vec![ModelId::new("model-a"), ModelId::new("model-b")]
    );

    gate.add_permits(1);
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.model_used, ModelId::new("model-a"));
    coordinator.stop().await;
}

/// `reject(delegate: true)` books the usage on the abandoned model and
/// carries the job to the next one without failing it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delegation_commits_usage_and_moves_on() {
    let clock = ManualClock::new(0);
    let mut config = two_model_config();
    config
        .estimations
        .get_mut(&JobTypeId::new("summary"))
        .unwrap()
        .max_wait_ms
        .clear();
    let coordinator =
        RateLimitCoordinator::start(config, options_with_clock(&clock)).await.unwrap();

    let job: JobFn = Arc::new(|context| {
        Box::pin(async move {
            if context.model_id == ModelId::new("model-a") {
                Ok(JobOutcome::Reject {
                    usage: UsageReport::of_tokens(TokenUsage::new(3_000, 0, 0)),
                    delegate: true,
                    reason: "content filter".to_string(),
                })
            } else {
                Ok(JobOutcome::Resolve(UsageReport::of_tokens(TokenUsage::new(2_000, 0, 0))))
            }
        })
    });

    let success = coordinator.queue_job(JobRequest::new("job-1", "summary", job)).await.unwrap();
    assert_eq!(success.model_used, ModelId::new("model-b"));
    assert_eq!(
        success.models_tried,
        vec![ModelId::new("model-a"), ModelId::new("model-b")]
    );

    // The delegating attempt still consumed 3k tokens on model-a.
    let stats = coordinator.get_stats();
    let remaining = stats.models[&ModelId::new("model-a")].remaining;
    assert_eq!(remaining.tokens_per_minute, Some(7_000));

    coordinator.stop().await;
}

/// When every model is exhausted and no waiting is allowed, the job
/// terminates with the dedicated error.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_order_rejects_the_job() {
    let clock = ManualClock::new(0);
    let mut config = two_model_config();
    // Make model-b skippable too: one concurrent slot and no waiting.
    config.models.insert(
        ModelId::new("model-b"),
        ModelConfig { max_concurrent_requests: Some(1), ..Default::default() },
    );
    config
        .estimations
        .get_mut(&JobTypeId::new("summary"))
        .unwrap()
        .max_wait_ms
        .insert(ModelId::new("model-b"), 0);
    let coordinator =
        RateLimitCoordinator::start(config, options_with_clock(&clock)).await.unwrap();

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let holders: Vec<_> = (0..2)
        .map(|i| {
            let coordinator = coordinator.clone();
            let job = gated_job(gate.clone(), 1_000);
            tokio::spawn(async move {
                coordinator.queue_job(JobRequest::new(format!("holder-{}", i), "summary", job)).await
            })
        })
        .collect();

    let stats = coordinator.clone();
    wait_until(
        move || {
            stats
                .get_stats()
                .active_jobs
                .iter()
                .filter(|info| info.status == JobStatus::Processing)
                .count()
                == 2
        },
        Duration::from_secs(2),
        "both models occupied",
    )
    .await;

    let result = coordinator
        .queue_job(JobRequest::new("job-3", "summary", gated_job(gate.clone(), 0)))
        .await;
    assert!(matches!(result, Err(Error::AllModelsRejected { .. })));

    gate.add_permits(4);
    for holder in holders {
        assert!(holder.await.unwrap().is_ok());
    }
    coordinator.stop().await;
}

/// A job that dies without reporting usage keeps its window reservation
/// (overuse cannot hide), while concurrency comes back.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_job_keeps_the_window_reservation() {
    let clock = ManualClock::new(0);
    let mut config = two_model_config();
    config.escalation_order = vec![ModelId::new("model-a")];
    config.models.remove(&ModelId::new("model-b"));
    let coordinator =
        RateLimitCoordinator::start(config, options_with_clock(&clock)).await.unwrap();

    let job: JobFn =
        Arc::new(|_context| Box::pin(async move { Err(anyhow::anyhow!("upstream exploded")) }));
    let result = coordinator.queue_job(JobRequest::new("job-1", "summary", job)).await;
    assert!(matches!(result, Err(Error::JobFailed { .. })));

    let stats = coordinator.get_stats();
    let remaining = stats.models[&ModelId::new("model-a")].remaining;
    assert_eq!(remaining.tokens_per_minute, Some(0));

    coordinator.stop().await;
}
