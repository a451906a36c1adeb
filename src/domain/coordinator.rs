use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::domain::availability::{
    AdjustmentDelta, Availability, AvailabilityCallback, AvailabilityTracker, ChangeReason,
};
use crate::domain::clock::{SharedClock, SystemClock};
use crate::domain::config::LimiterConfig;
use crate::domain::distributed::allocation::AllocationInfo;
use crate::domain::distributed::backend::{DistributedAllocator, PoolRelease};
use crate::domain::job_type::JobTypeManager;
use crate::domain::limiter::memory_manager::MemoryManager;
use crate::domain::limiter::model_limiter::{ModelLimiter, ModelReservation};
use crate::domain::scheduler::escalation;
use crate::domain::scheduler::job::{ActiveJobStore, JobRequest, JobSuccess};
use crate::domain::scheduler::wait_list::ModelWaitList;
use crate::domain::stats::{LimiterStats, ModelStats};
use crate::domain::usage::{OverageCallback, ResourceRequest, UsageReport};
use crate::domain::util::id::{InstanceId, JobId, JobTypeId, ModelId};
use crate::error::{Error, Result};

/// Pool size used for models that no global dimension constrains; large
/// enough to never gate admission, small enough for exact float ratios.
const UNCONSTRAINED_POOL_SLOTS: u64 = 1_000_000;

/// Cadence of the availability refresh sweep. Window roll-overs happen
/// lazily and emit no event of their own, so parked jobs depend on this
/// sweep to notice a fresh minute or day window.
const REFRESH_INTERVAL_MS: u64 = 500;

/// Construction-time knobs that are not part of the limiter
/// configuration proper.
pub struct CoordinatorOptions {
    pub clock: SharedClock,
    pub instance_id: InstanceId,
    pub backend: Option<Arc<dyn DistributedAllocator>>,
    pub on_available_slots_change: Option<AvailabilityCallback>,
    pub on_overage: Option<OverageCallback>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            clock: SystemClock::shared(),
            instance_id: InstanceId::new(uuid::Uuid::new_v4().to_string()),
            backend: None,
            on_available_slots_change: None,
            on_overage: None,
        }
    }
}

pub(crate) struct CoordinatorInner {
    pub(crate) config: LimiterConfig,
    pub(crate) clock: SharedClock,
    pub(crate) instance_id: InstanceId,
    pub(crate) limiters: HashMap<ModelId, ModelLimiter>,
    pub(crate) job_types: HashMap<ModelId, JobTypeManager>,
    pub(crate) memory: Option<MemoryManager>,
    pub(crate) tracker: AvailabilityTracker,
    pub(crate) wait_list: ModelWaitList,
    pub(crate) jobs: ActiveJobStore,
    pub(crate) backend: Option<Arc<dyn DistributedAllocator>>,
    pub(crate) last_allocation: Mutex<Option<AllocationInfo>>,
    pub(crate) on_overage: Option<OverageCallback>,
    pub(crate) stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Binds the limiters, the job-type allocators, the memory manager, the
/// availability tracker and the optional distributed allocator into one
/// admission engine.
#[derive(Clone)]
pub struct RateLimitCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RateLimitCoordinator {
    /// Validates the configuration, wires every component, registers at
    /// the distributed allocator when one is configured, and spawns the
    /// periodic tasks.
    pub async fn start(
        config: LimiterConfig,
        options: CoordinatorOptions,
    ) -> Result<RateLimitCoordinator> {
        config.validate()?;

        let clock = options.clock;
        let memory = config.memory.clone().map(MemoryManager::new);
        let memory_semaphore = memory.as_ref().map(MemoryManager::semaphore);
        let memory_budget_kb = memory.as_ref().map(|m| m.capacity_kb().max(0) as u64).unwrap_or(0);

        let ratios = config.resolved_ratios();
        let mut limiters = HashMap::new();
        let mut job_types = HashMap::new();
        for (model_id, model_config) in &config.models {
            limiters.insert(
                model_id.clone(),
                ModelLimiter::new(
                    model_id.clone(),
                    model_config,
                    clock.clone(),
                    memory_semaphore.clone(),
                ),
            );
            job_types.insert(
                model_id.clone(),
                JobTypeManager::new(
                    model_id.clone(),
                    &config.estimations,
                    &ratios,
                    memory_budget_kb,
                ),
            );
        }

        let inner = Arc::new(CoordinatorInner {
            instance_id: options.instance_id,
            backend: options.backend,
            on_overage: options.on_overage,
            tracker: AvailabilityTracker::new(),
            wait_list: ModelWaitList::new(),
            jobs: ActiveJobStore::new(),
            last_allocation: Mutex::new(None),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
            clock,
            limiters,
            job_types,
            memory,
        });

        if let Some(callback) = options.on_available_slots_change {
            inner.tracker.set_callback(callback);
        }

        // Seed every pool from the local limits; a distributed allocation
        // overrides this as soon as it arrives.
        for model_id in inner.config.models.keys() {
            let slots = inner.local_pool_slots(model_id);
            if let Some(job_types) = inner.job_types.get(model_id) {
                job_types.set_pool_slots(slots);
            }
        }

        if let Some(memory) = &inner.memory {
            memory.start();
        }

        let coordinator = RateLimitCoordinator { inner };
        coordinator.connect_backend().await?;
        coordinator.spawn_adjustment_task();
        coordinator.spawn_memory_task();
        coordinator.spawn_refresh_task();

        log::info!(
            "Rate limit coordinator started as instance {} with {} model(s).",
            coordinator.inner.instance_id,
            coordinator.inner.limiters.len()
        );
        Ok(coordinator)
    }

    /// Registration, allocation subscription and the heartbeat loop.
    /// Registration failures propagate; everything afterwards is
    /// fire-and-forget.
    async fn connect_backend(&self) -> Result<()> {
        let Some(backend) = self.inner.backend.clone() else {
            return Ok(());
        };

        let allocation = backend.register(&self.inner.instance_id).await?;
        self.inner.apply_allocation(allocation);

        let mut updates = backend.subscribe(&self.inner.instance_id).await?;
        let applier = {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                while let Some(allocation) = updates.recv().await {
                    inner.apply_allocation(allocation);
                }
            })
        };

        let heartbeat = {
            let inner = self.inner.clone();
            let backend = backend.clone();
            tokio::spawn(async move {
                let interval_ms = inner.config.distributed.heartbeat_interval_ms.max(250);
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = backend.heartbeat(&inner.instance_id).await {
                        log::warn!("Heartbeat failed: {}. Keeping last allocation.", e);
                        continue;
                    }
                    let cutoff =
                        inner.clock.now_ms() - inner.config.distributed.stale_after_ms as i64;
                    if let Err(e) = backend.cleanup(cutoff).await {
                        log::warn!("Registry cleanup failed: {}.", e);
                    }
                }
            })
        };

        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.push(applier);
        tasks.push(heartbeat);
        Ok(())
    }

    fn spawn_adjustment_task(&self) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let interval_ms = inner.config.ratio_adjustment.adjustment_interval_ms.max(100);
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for (model_id, job_types) in &inner.job_types {
                    let outcome = job_types.adjust_ratios(&inner.config.ratio_adjustment);
                    if outcome.changed {
                        inner.publish_availability(model_id, ChangeReason::Adjustment, None, None);
                        inner.wait_list.wake(model_id, outcome.releases);
                    }
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(task);
    }

    fn spawn_memory_task(&self) {
        let Some(memory) = &self.inner.memory else {
            return;
        };
        let interval_ms = memory.recalculation_interval_ms().max(100);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(memory) = &inner.memory else { return };
                let budget_kb = memory.capacity_kb().max(0) as u64;
                for (model_id, job_types) in &inner.job_types {
                    if job_types.set_memory_budget(budget_kb) {
                        inner.publish_availability(model_id, ChangeReason::Memory, None, None);
                        inner.wait_list.wake_all(model_id);
                    }
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(task);
    }

    fn spawn_refresh_task(&self) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(REFRESH_INTERVAL_MS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for model_id in inner.limiters.keys() {
                    inner.refresh_availability(model_id);
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(task);
    }

    /// Submits a job and resolves when it terminates (successfully or
    /// not). Multiple submissions run their state machines concurrently.
    pub async fn queue_job(&self, request: JobRequest) -> Result<JobSuccess> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        escalation::run_job(&self.inner, request).await
    }

    /// Replaces the local view of this instance's allocation. A repeated
    /// identical allocation is a no-op.
    pub fn set_distributed_availability(&self, allocation: AllocationInfo) {
        self.inner.apply_allocation(allocation);
    }

    pub fn get_stats(&self) -> LimiterStats {
        let inner = &self.inner;
        let mut models = BTreeMap::new();
        for (model_id, limiter) in &inner.limiters {
            let job_types = inner.job_types.get(model_id);
            models.insert(
                model_id.clone(),
                ModelStats {
                    remaining: limiter.remaining(),
                    pool_slots: job_types.map(JobTypeManager::pool_slots).unwrap_or(0),
                    memory_available_kb: inner
                        .memory
                        .as_ref()
                        .map(|m| m.available_kb().max(0) as u64),
                    job_types: job_types.map(JobTypeManager::snapshot).unwrap_or_default(),
                },
            );
        }
        LimiterStats {
            instance_id: inner.instance_id.clone(),
            models,
            active_jobs: inner.jobs.snapshot(),
            allocation: inner.last_allocation.lock().unwrap().clone(),
        }
    }

    pub fn availability(&self, model_id: &ModelId) -> Option<Availability> {
        self.inner.tracker.last(model_id)
    }

    /// Fleet-wide registry snapshot from the distributed allocator.
    /// `None` when running without one.
    pub async fn get_cluster_stats(&self) -> Result<Option<serde_json::Value>> {
        match &self.inner.backend {
            Some(backend) => Ok(Some(backend.stats().await?)),
            None => Ok(None),
        }
    }

    /// Cancels the periodic tasks, rejects parked jobs, and deregisters
    /// from the distributed allocator.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Stopping rate limit coordinator {}.", self.inner.instance_id);

        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.inner.wait_list.close();
        for limiter in self.inner.limiters.values() {
            limiter.close();
        }
        if let Some(memory) = &self.inner.memory {
            memory.stop();
        }

        if let Some(backend) = &self.inner.backend {
            if let Err(e) = backend.unregister(&self.inner.instance_id).await {
                log::warn!("Unregister failed during shutdown: {}.", e);
            }
            backend.shutdown().await;
        }
    }
}

impl CoordinatorInner {
    /// Both layers of the admission check: the model's limiters and the
    /// job type's slot quota.
    pub(crate) fn can_admit(
        &self,
        model_id: &ModelId,
        job_type: &JobTypeId,
        estimated: &ResourceRequest,
    ) -> bool {
        let Some(limiter) = self.limiters.get(model_id) else {
            return false;
        };
        let Some(job_types) = self.job_types.get(model_id) else {
            return false;
        };
        limiter.has_capacity(estimated) && job_types.can_admit(job_type)
    }

    /// Whether the model is worth trying at all (non-empty pool).
    pub(crate) fn pool_open(&self, model_id: &ModelId) -> bool {
        if !self.limiters.contains_key(model_id) {
            return false;
        }
        if self.backend.is_some() {
            if let Some(allocation) = self.last_allocation.lock().unwrap().as_ref() {
                // A model absent from the pools is not globally
                // constrained; only the local limiter gates it.
                return allocation.pools.get(model_id).map_or(true, |pool| pool.total_slots > 0);
            }
        }
        self.job_types.get(model_id).map_or(false, |job_types| job_types.pool_slots() > 0)
    }

    /// Terminal bookkeeping of a job that reported usage: reconcile the
    /// limiters, free the job-type slot, release the global pool slot,
    /// and emit the adjustment availability event.
    pub(crate) async fn commit_job(
        &self,
        model_id: &ModelId,
        job_type: &JobTypeId,
        job_id: &JobId,
        reservation: ModelReservation,
        usage: &UsageReport,
    ) {
        let estimated = reservation.estimated;
        let window_starts = reservation.window_starts();
        let actual_tokens = usage.tokens.total();
        let actual_requests = usage.requests.unwrap_or(estimated.requests);

        let limiter = match self.limiters.get(model_id) {
            Some(limiter) => limiter,
            None => return,
        };
        let (delta, overages) = limiter.commit(reservation, usage);
        for event in &overages {
            log::warn!(
                "Overage on model {} ({}): estimated {}, actual {}.",
                event.model_id,
                event.resource.as_str(),
                event.estimated,
                event.actual
            );
            if let Some(on_overage) = &self.on_overage {
                on_overage(event);
            }
        }

        if let Some(job_types) = self.job_types.get(model_id) {
            job_types.on_release(job_type);
        }

        if let Some(backend) = &self.backend {
            let release = PoolRelease {
                instance_id: self.instance_id.clone(),
                model_id: model_id.clone(),
                job_id: job_id.clone(),
                estimated,
                actual_tokens,
                actual_requests,
                window_starts,
            };
            if let Err(e) = backend.release(&release).await {
                log::warn!("Pool release failed on model {}: {}.", model_id, e);
            }
        }

        self.publish_availability(model_id, ChangeReason::Adjustment, Some(&delta), Some(job_type));
        self.wait_list.wake_all(model_id);
    }

    /// Terminal bookkeeping of a job that died without reporting usage:
    /// semaphores come back, window reservations stay (unless configured
    /// otherwise), the pool slot is released without usage.
    pub(crate) async fn abandon_job(
        &self,
        model_id: &ModelId,
        job_type: &JobTypeId,
        job_id: &JobId,
        reservation: ModelReservation,
    ) {
        let estimated = reservation.estimated;
        let window_starts = reservation.window_starts();

        if let Some(limiter) = self.limiters.get(model_id) {
            limiter.abandon(reservation, self.config.refund_on_abandon);
        }
        if let Some(job_types) = self.job_types.get(model_id) {
            job_types.on_release(job_type);
        }

        if let Some(backend) = &self.backend {
            let release = PoolRelease {
                instance_id: self.instance_id.clone(),
                model_id: model_id.clone(),
                job_id: job_id.clone(),
                estimated,
                actual_tokens: 0,
                actual_requests: 0,
                window_starts,
            };
            if let Err(e) = backend.release(&release).await {
                log::warn!("Pool release failed on model {}: {}.", model_id, e);
            }
        }

        self.publish_availability(model_id, ChangeReason::ConcurrentRequests, None, Some(job_type));
        self.wait_list.wake_all(model_id);
    }

    /// Installs a freshly published allocation. Identical repeats are
    /// swallowed before any downstream effect.
    pub(crate) fn apply_allocation(&self, allocation: AllocationInfo) {
        {
            let mut last = self.last_allocation.lock().unwrap();
            if last.as_ref() == Some(&allocation) {
                return;
            }
            *last = Some(allocation.clone());
        }
        tracing::info!(
            "Applying distributed allocation ({} instance(s), {} pooled model(s)).",
            allocation.instance_count,
            allocation.pools.len()
        );

        for (model_id, job_types) in &self.job_types {
            let slots = allocation
                .pools
                .get(model_id)
                .map(|pool| pool.total_slots)
                .unwrap_or_else(|| self.local_pool_slots(model_id));
            job_types.set_pool_slots(slots);
            self.publish_availability(model_id, ChangeReason::Distributed, None, None);
            self.wait_list.wake_all(model_id);
        }
    }

    /// Static whole-job pool of a model from its local limits alone;
    /// used until (and unless) a distributed allocation replaces it.
    pub(crate) fn local_pool_slots(&self, model_id: &ModelId) -> u64 {
        let Some(config) = self.config.models.get(model_id) else {
            return 0;
        };
        let est_tokens = self
            .config
            .estimations
            .values()
            .filter_map(|e| e.estimated_used_tokens)
            .max()
            .unwrap_or(0);
        let est_requests = self
            .config
            .estimations
            .values()
            .filter_map(|e| e.estimated_number_of_requests)
            .max()
            .unwrap_or(0);

        let mut slots = UNCONSTRAINED_POOL_SLOTS;
        if est_tokens > 0 {
            if let Some(limit) = config.tokens_per_minute {
                slots = slots.min(limit / est_tokens);
            }
            if let Some(limit) = config.tokens_per_day {
                slots = slots.min(limit / est_tokens);
            }
        }
        if est_requests > 0 {
            if let Some(limit) = config.requests_per_minute {
                slots = slots.min(limit / est_requests);
            }
            if let Some(limit) = config.requests_per_day {
                slots = slots.min(limit / est_requests);
            }
        }
        if let Some(limit) = config.max_concurrent_requests {
            slots = slots.min(limit);
        }
        slots
    }

    /// Periodic sweep: detect capacity that came back without an event
    /// (typically a rolled window) and wake the parked jobs.
    pub(crate) fn refresh_availability(&self, model_id: &ModelId) {
        let availability = self.compute_availability(model_id, None);
        let reason = derive_reason(self.tracker.last(model_id), &availability);
        if self.tracker.publish(model_id, availability, reason, None) {
            self.wait_list.wake_all(model_id);
        }
    }

    /// Recomputes the availability snapshot of a model and runs it
    /// through the diff-suppressing tracker. Returns whether an emission
    /// happened.
    pub(crate) fn publish_availability(
        &self,
        model_id: &ModelId,
        reason: ChangeReason,
        adjustment: Option<&AdjustmentDelta>,
        job_type: Option<&JobTypeId>,
    ) -> bool {
        let availability = self.compute_availability(model_id, job_type);
        self.tracker.publish(model_id, availability, reason, adjustment)
    }

    /// Whole-job admissions still possible on the model, evaluated with
    /// the estimate of the given job type (or the highest-ratio type when
    /// the triggering event carries none).
    pub(crate) fn compute_availability(
        &self,
        model_id: &ModelId,
        job_type: Option<&JobTypeId>,
    ) -> Availability {
        let Some(limiter) = self.limiters.get(model_id) else {
            return Availability::default();
        };
        let remaining = limiter.remaining();
        let memory_kb = self.memory.as_ref().map(|m| m.available_kb().max(0) as u64);

        let job_types = self.job_types.get(model_id);
        let chosen = job_type.cloned().or_else(|| {
            job_types.and_then(|manager| {
                manager
                    .snapshot()
                    .into_iter()
                    .max_by(|(_, a), (_, b)| a.ratio.total_cmp(&b.ratio))
                    .map(|(id, _)| id)
            })
        });

        let mut slots = match (&chosen, job_types) {
            (Some(job_type), Some(manager)) => manager.free_slots(job_type),
            _ => 0,
        };

        if let Some(estimated) = chosen.as_ref().and_then(|jt| self.config.resource_request(jt)) {
            let mut cap = |remaining_dim: Option<u64>, per_job: u64| {
                if per_job == 0 {
                    return;
                }
                if let Some(remaining_dim) = remaining_dim {
                    slots = slots.min(remaining_dim / per_job);
                }
            };
            cap(remaining.tokens_per_minute, estimated.tokens);
            cap(remaining.tokens_per_day, estimated.tokens);
            cap(remaining.requests_per_minute, estimated.requests);
            cap(remaining.requests_per_day, estimated.requests);
            cap(remaining.concurrent_requests, 1);
            cap(memory_kb, estimated.memory_kb);
        }

        Availability {
            slots,
            tokens_per_minute: remaining.tokens_per_minute,
            tokens_per_day: remaining.tokens_per_day,
            requests_per_minute: remaining.requests_per_minute,
            requests_per_day: remaining.requests_per_day,
            concurrent_requests: remaining.concurrent_requests,
            memory_kb,
        }
    }
}

/// First applicable reason, in the documented precedence order, for a
/// change discovered by comparison rather than caused by a known event.
fn derive_reason(previous: Option<Availability>, next: &Availability) -> ChangeReason {
    let Some(previous) = previous else {
        return ChangeReason::Adjustment;
    };
    if previous.tokens_per_minute != next.tokens_per_minute {
        ChangeReason::TokensMinute
    } else if previous.tokens_per_day != next.tokens_per_day {
        ChangeReason::TokensDay
    } else if previous.requests_per_minute != next.requests_per_minute {
        ChangeReason::RequestsMinute
    } else if previous.requests_per_day != next.requests_per_day {
        ChangeReason::RequestsDay
    } else if previous.concurrent_requests != next.concurrent_requests {
        ChangeReason::ConcurrentRequests
    } else if previous.memory_kb != next.memory_kb {
        ChangeReason::Memory
    } else {
        ChangeReason::Adjustment
    }
}
