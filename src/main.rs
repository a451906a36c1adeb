mod api;
mod domain;
mod error;
mod loader;
mod logger;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;

use crate::domain::coordinator::{CoordinatorOptions, RateLimitCoordinator};
use crate::domain::distributed::allocation::JobTypeResourceRecord;
use crate::domain::distributed::redis::RedisAllocator;
use crate::domain::scheduler::job::{JobFn, JobOutcome, JobRequest};
use crate::domain::usage::{TokenUsage, UsageReport};
use crate::domain::util::id::InstanceId;

#[derive(Parser, Debug)]
#[command(about = "Multi-model rate limiter demo driver")]
struct Args {
    /// Path to the limiter configuration JSON.
    #[arg(long, default_value = "config/limiter.json")]
    config: String,

    /// Redis URL for distributed coordination; absent = local-only mode.
    #[arg(long)]
    redis_url: Option<String>,

    /// Identifier of this instance in the fleet.
    #[arg(long)]
    instance_id: Option<String>,

    /// Number of synthetic jobs to submit. 0 = submit nothing and serve
    /// until ctrl-c (useful as a fleet member).
    #[arg(long, default_value_t = 20)]
    jobs: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();
    let args = Args::parse();

    let dto: api::config_dto::LimiterConfigDto = loader::parser::parse_json_file(&args.config)?;
    let config = dto.into_domain()?;
    log::info!("Loaded limiter configuration from '{}'.", args.config);

    let mut options = CoordinatorOptions::default();
    if let Some(instance_id) = args.instance_id {
        options.instance_id = InstanceId::new(instance_id);
    }

    if let Some(redis_url) = &args.redis_url {
        let capacities: BTreeMap<_, _> =
            config.models.iter().map(|(id, c)| (id.clone(), c.clone())).collect();
        let resources: BTreeMap<_, _> = {
            let ratios = config.resolved_ratios();
            config
                .estimations
                .iter()
                .map(|(id, estimation)| {
                    (
                        id.clone(),
                        JobTypeResourceRecord {
                            estimated_used_tokens: estimation.estimated_used_tokens,
                            estimated_number_of_requests: estimation.estimated_number_of_requests,
                            ratio: ratios.get(id).copied().unwrap_or(0.0),
                        },
                    )
                })
                .collect()
        };
        let allocator = RedisAllocator::connect(
            redis_url,
            config.distributed.key_prefix.clone(),
            options.clock.clone(),
            &capacities,
            &resources,
        )
        .await?;
        options.backend = Some(Arc::new(allocator));
        log::info!("Distributed coordination enabled via {}.", redis_url);
    }

    options.on_available_slots_change = Some(Arc::new(|availability, reason, model_id, _| {
        log::info!(
            "[{}] model {} now has {} slot(s) available.",
            reason.as_str(),
            model_id,
            availability.slots
        );
    }));

    let job_types: Vec<String> = config.estimations.keys().map(|id| id.to_string()).collect();
    let coordinator = RateLimitCoordinator::start(config, options).await?;

    if args.jobs == 0 {
        log::info!("No workload requested; holding this instance's share until ctrl-c.");
        tokio::signal::ctrl_c().await?;
        coordinator.stop().await;
        return Ok(());
    }

    let mut handles = Vec::new();
    for i in 0..args.jobs {
        let job_type = job_types[i % job_types.len()].clone();
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            let job: JobFn = Arc::new(|context| {
                Box::pin(async move {
                    // Simulate an upstream call with variable latency and
                    // usage.
                    let (latency_ms, output_tokens) = {
                        let mut rng = rand::rng();
                        (rng.random_range(50..500), rng.random_range(100..2_000))
                    };
                    tokio::time::sleep(Duration::from_millis(latency_ms)).await;
                    log::debug!("Synthetic job ran on model {}.", context.model_id);
                    Ok(JobOutcome::Resolve(UsageReport::of_tokens(TokenUsage::new(
                        500,
                        output_tokens,
                        0,
                    ))))
                })
            });
            let request = JobRequest::new(uuid::Uuid::new_v4().to_string(), job_type, job);
            coordinator.queue_job(request).await
        }));
    }

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(success)) => {
                succeeded += 1;
                log::info!(
                    "Job finished on {} using {} token(s).",
                    success.model_used,
                    success.usage.total()
                );
            }
            Ok(Err(e)) => {
                failed += 1;
                log::error!("Job failed: {}", e);
            }
            Err(e) => {
                failed += 1;
                log::error!("Job task panicked: {}", e);
            }
        }
    }

    log::info!("Workload done: {} succeeded, {} failed.", succeeded, failed);
    let stats = coordinator.get_stats();
    log::info!("Final stats: {}", serde_json::to_string_pretty(&stats)?);
    if let Some(cluster) = coordinator.get_cluster_stats().await? {
        log::info!("Cluster stats: {}", serde_json::to_string_pretty(&cluster)?);
    }

    coordinator.stop().await;
    Ok(())
}
