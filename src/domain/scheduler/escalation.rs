use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;

use crate::domain::coordinator::CoordinatorInner;
use crate::domain::distributed::backend::PoolAcquire;
use crate::domain::limiter::model_limiter::ModelReservation;
use crate::domain::scheduler::job::{
    ActiveJobInfo, JobContext, JobKey, JobOutcome, JobRequest, JobStatus, JobSuccess,
};
use crate::domain::scheduler::wait_list::WakeReason;
use crate::domain::usage::{ResourceRequest, UsageReport};
use crate::domain::util::id::ModelId;
use crate::error::{Error, Result};

/// How one attempt at a model ended.
enum Attempt {
    /// Reserved on all layers; the job may run.
    Reserved(ModelReservation),
    /// No capacity within the allowed wait; move on.
    MoveOn,
}

/// What the user callback's outcome means for the state machine.
enum RunResult {
    Success(UsageReport),
    Delegate,
    Failure(String),
}

/// Drives one job through the per-model escalation state machine:
/// `enter -> try(M) -> reserve(M) -> run(M) -> commit(M)`, falling
/// through to the next configured model on exhaustion or delegation.
pub(crate) async fn run_job(
    inner: &Arc<CoordinatorInner>,
    request: JobRequest,
) -> Result<JobSuccess> {
    let estimated = inner
        .config
        .resource_request(&request.job_type)
        .ok_or_else(|| {
            Error::Configuration(format!("unknown job type '{}'", request.job_type))
        })?;

    let job_key = inner.jobs.insert(ActiveJobInfo {
        job_id: request.job_id.clone(),
        job_type: request.job_type.clone(),
        status: JobStatus::WaitingForCapacity,
        queued_at: inner.clock.now_ms(),
        started_at: None,
        current_model_id: None,
        tried_models: Vec::new(),
        wait_started_at: None,
        max_wait_ms: None,
        timeout_at: None,
    });

    let result = drive(inner, &request, estimated, job_key).await;
    inner.jobs.remove(job_key);

    match &result {
        Ok(success) => {
            log::info!(
                "Job {:?} finished on model {} after trying {} model(s).",
                request.job_id,
                success.model_used,
                success.models_tried.len()
            );
            if let Some(on_complete) = &request.on_complete {
                on_complete(success);
            }
        }
        Err(error) => {
            log::warn!("Job {:?} failed: {}.", request.job_id, error);
            if let Some(on_error) = &request.on_error {
                on_error(error);
            }
        }
    }
    result
}

async fn drive(
    inner: &Arc<CoordinatorInner>,
    request: &JobRequest,
    estimated: ResourceRequest,
    job_key: JobKey,
) -> Result<JobSuccess> {
    let mut tried: Vec<ModelId> = Vec::new();

    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }

        let Some(model_id) = next_model(inner, &tried) else {
            return Err(Error::AllModelsRejected { job_id: request.job_id.clone() });
        };

        match try_model(inner, request, &model_id, estimated, job_key).await? {
            Attempt::MoveOn => {
                tried.push(model_id);
                continue;
            }
            Attempt::Reserved(reservation) => {
                inner.jobs.update(job_key, |info| {
                    info.status = JobStatus::Processing;
                    info.started_at = Some(inner.clock.now_ms());
                    info.current_model_id = Some(model_id.clone());
                    info.tried_models.push(model_id.clone());
                });

                match run_on_model(inner, request, &model_id, reservation).await {
                    RunResult::Success(usage) => {
                        tried.push(model_id.clone());
                        return Ok(JobSuccess {
                            model_used: model_id,
                            usage: usage.tokens,
                            models_tried: tried,
                        });
                    }
                    RunResult::Delegate => {
                        tried.push(model_id);
                        continue;
                    }
                    RunResult::Failure(reason) => {
                        return Err(Error::JobFailed { job_id: request.job_id.clone(), reason });
                    }
                }
            }
        }
    }
}

/// The next configured model not yet tried whose pool is not empty.
fn next_model(inner: &Arc<CoordinatorInner>, tried: &[ModelId]) -> Option<ModelId> {
    inner
        .config
        .escalation_order
        .iter()
        .find(|&model_id| !tried.contains(model_id) && inner.pool_open(model_id))
        .cloned()
}

/// `try(M)`: the two-layer admission check, parking the job on the
/// model's wait list up to its deadline when capacity is missing.
async fn try_model(
    inner: &Arc<CoordinatorInner>,
    request: &JobRequest,
    model_id: &ModelId,
    estimated: ResourceRequest,
    job_key: JobKey,
) -> Result<Attempt> {
    let max_wait_ms = inner
        .config
        .estimations
        .get(&request.job_type)
        .and_then(|estimation| estimation.max_wait_ms.get(model_id).copied());

    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }

        let mut lost_reserve_race = false;
        if inner.can_admit(model_id, &request.job_type, &estimated) {
            match reserve_on_model(inner, request, model_id, estimated).await {
                Some(reservation) => return Ok(Attempt::Reserved(reservation)),
                // Lost the admission race, or the global pool said no.
                // Both count as plain no-capacity and fall through to the
                // wait path; the slot holder's release will wake us.
                None => lost_reserve_race = true,
            }
        }

        // No capacity right now.
        if max_wait_ms == Some(0) {
            return Ok(Attempt::MoveOn);
        }

        let ticket = inner.wait_list.register(model_id);
        let ticket_id = ticket.id;

        // Re-check after registering: a wake between the failed check and
        // the registration would otherwise be lost. Skipped after a lost
        // reserve race, where the advisory check may stay true until the
        // next allocation publish and would spin here.
        if !lost_reserve_race && inner.can_admit(model_id, &request.job_type, &estimated) {
            inner.wait_list.remove(model_id, ticket_id);
            continue;
        }

        let now = inner.clock.now_ms();
        inner.jobs.update(job_key, |info| {
            info.status = JobStatus::WaitingOnModel;
            info.current_model_id = Some(model_id.clone());
            info.wait_started_at = Some(now);
            info.max_wait_ms = max_wait_ms;
            info.timeout_at = max_wait_ms.map(|ms| now + ms as i64);
        });

        let woken = match max_wait_ms {
            None => ticket.rx.await.ok(),
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), ticket.rx).await {
                    Ok(result) => result.ok(),
                    Err(_elapsed) => {
                        // Deadline expired: drop our waker reference before
                        // escalating.
                        inner.wait_list.remove(model_id, ticket_id);
                        return Ok(Attempt::MoveOn);
                    }
                }
            }
        };

        match woken {
            Some(WakeReason::Capacity) => continue,
            Some(WakeReason::Stopped) | None => return Err(Error::Stopped),
        }
    }
}

/// `reserve(M)`: local limiter first, then the global pool slot. Either
/// failure releases the other and reports no capacity.
async fn reserve_on_model(
    inner: &Arc<CoordinatorInner>,
    request: &JobRequest,
    model_id: &ModelId,
    estimated: ResourceRequest,
) -> Option<ModelReservation> {
    let limiter = inner.limiters.get(model_id)?;
    let reservation = limiter.try_reserve(&estimated)?;

    if let Some(backend) = &inner.backend {
        let granted = backend
            .acquire(&PoolAcquire {
                instance_id: inner.instance_id.clone(),
                model_id: model_id.clone(),
                job_id: request.job_id.clone(),
                estimated,
            })
            .await;
        match granted {
            Ok(true) => {}
            Ok(false) => {
                log::debug!(
                    "Global pool rejected job {:?} on model {}.",
                    request.job_id,
                    model_id
                );
                limiter.refund(reservation);
                return None;
            }
            Err(e) => {
                // A backend outage must not fail local admission.
                log::warn!("Pool acquire failed on model {}: {}. Continuing locally.", model_id, e);
            }
        }
    }

    if let Some(job_types) = inner.job_types.get(model_id) {
        job_types.on_reserve(&request.job_type);
    }
    Some(reservation)
}

/// `run(M)`: invokes the user callback and reconciles its outcome.
async fn run_on_model(
    inner: &Arc<CoordinatorInner>,
    request: &JobRequest,
    model_id: &ModelId,
    reservation: ModelReservation,
) -> RunResult {
    let callback = request.job.clone();
    let context = JobContext { model_id: model_id.clone() };

    let outcome = std::panic::AssertUnwindSafe(callback(context)).catch_unwind().await;

    match outcome {
        Ok(Ok(JobOutcome::Resolve(usage))) => {
            inner
                .commit_job(model_id, &request.job_type, &request.job_id, reservation, &usage)
                .await;
            RunResult::Success(usage)
        }
        Ok(Ok(JobOutcome::Reject { usage, delegate, reason })) => {
            // Actual usage is booked on the model either way.
            inner
                .commit_job(model_id, &request.job_type, &request.job_id, reservation, &usage)
                .await;
            if delegate {
                log::debug!(
                    "Job {:?} delegated away from model {}: {}.",
                    request.job_id,
                    model_id,
                    reason
                );
                RunResult::Delegate
            } else {
                RunResult::Failure(reason)
            }
        }
        Ok(Err(error)) => {
            inner.abandon_job(model_id, &request.job_type, &request.job_id, reservation).await;
            RunResult::Failure(error.to_string())
        }
        Err(panic) => {
            inner.abandon_job(model_id, &request.job_type, &request.job_id, reservation).await;
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "job callback panicked".to_string());
            RunResult::Failure(reason)
        }
    }
}
