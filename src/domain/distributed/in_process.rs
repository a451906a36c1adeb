use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::clock::SharedClock;
use crate::domain::config::{DAY_MS, MINUTE_MS, ModelConfig};
use crate::domain::distributed::allocation::{
    AllocationInfo, InstanceRecord, JobTypeResourceRecord, UsageTotals,
};
use crate::domain::distributed::backend::{DistributedAllocator, PoolAcquire, PoolRelease};
use crate::domain::distributed::recalc::{RecalcInputs, recalculate};
use crate::domain::util::id::{InstanceId, JobTypeId, ModelId};
use crate::error::{Error, Result};

/// In-memory allocator with the exact semantics of the Redis-backed one.
///
/// Serves single-process deployments (no backend configured) and the
/// multi-instance tests: several coordinators sharing one
/// `InProcessAllocator` behave like a fleet sharing one Redis.
pub struct InProcessAllocator {
    clock: SharedClock,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    instances: BTreeMap<InstanceId, InstanceRecord>,
    model_capacities: BTreeMap<ModelId, ModelConfig>,
    job_type_resources: BTreeMap<JobTypeId, JobTypeResourceRecord>,
    allocations: BTreeMap<InstanceId, AllocationInfo>,
    /// (model, window kind, window start) -> summed actuals.
    usage: HashMap<(ModelId, WindowKind, i64), u64>,
    subscribers: Vec<(InstanceId, mpsc::UnboundedSender<AllocationInfo>)>,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WindowKind {
    TokensMinute,
    TokensDay,
    RequestsMinute,
    RequestsDay,
}

impl InProcessAllocator {
    pub fn new(
        clock: SharedClock,
        model_capacities: BTreeMap<ModelId, ModelConfig>,
        job_type_resources: BTreeMap<JobTypeId, JobTypeResourceRecord>,
    ) -> InProcessAllocator {
        InProcessAllocator {
            clock,
            state: Mutex::new(RegistryState {
                model_capacities,
                job_type_resources,
                ..Default::default()
            }),
        }
    }

    fn usage_totals(state: &RegistryState, now: i64) -> BTreeMap<ModelId, UsageTotals> {
        let minute_start = now - now.rem_euclid(MINUTE_MS);
        let day_start = now - now.rem_euclid(DAY_MS);

        let mut totals: BTreeMap<ModelId, UsageTotals> = BTreeMap::new();
        for ((model, kind, window_start), amount) in &state.usage {
            let entry = totals.entry(model.clone()).or_default();
            match kind {
                WindowKind::TokensMinute if *window_start == minute_start => {
                    entry.tokens_minute += amount;
                }
                WindowKind::TokensDay if *window_start == day_start => {
                    entry.tokens_day += amount;
                }
                WindowKind::RequestsMinute if *window_start == minute_start => {
                    entry.requests_minute += amount;
                }
                WindowKind::RequestsDay if *window_start == day_start => {
                    entry.requests_day += amount;
                }
                _ => {}
            }
        }
        totals
    }

    /// Shared tail of every mutating operation: recompute the partition
    /// and publish each instance's allocation to its subscribers.
    fn recalc_and_publish(&self, state: &mut RegistryState) {
        let now = self.clock.now_ms();

        // Expired windows serve no further recalculation; same cutoff the
        // Redis TTLs use (twice the window).
        let minute_start = now - now.rem_euclid(MINUTE_MS);
        let day_start = now - now.rem_euclid(DAY_MS);
        state.usage.retain(|(_, kind, window_start), _| match kind {
            WindowKind::TokensMinute | WindowKind::RequestsMinute => {
                minute_start - window_start < 2 * MINUTE_MS
            }
            WindowKind::TokensDay | WindowKind::RequestsDay => {
                day_start - window_start < 2 * DAY_MS
            }
        });

        let inputs = RecalcInputs {
            instances: state.instances.clone(),
            model_capacities: state.model_capacities.clone(),
            job_type_resources: state.job_type_resources.clone(),
            usage: Self::usage_totals(state, now),
        };
        state.allocations = recalculate(&inputs);

        state.subscribers.retain(|(instance_id, tx)| {
            match state.allocations.get(instance_id) {
                Some(allocation) => tx.send(allocation.clone()).is_ok(),
                // Keep subscribers of instances that are momentarily
                // unregistered; they may re-register.
                None => !tx.is_closed(),
            }
        });
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }
}

#[async_trait]
impl DistributedAllocator for InProcessAllocator {
    async fn register(&self, instance_id: &InstanceId) -> Result<AllocationInfo> {
        self.with_state(|state| {
            if state.closed {
                return Err(Error::Stopped);
            }
            let now = self.clock.now_ms();
            state
                .instances
                .entry(instance_id.clone())
                .or_insert_with(InstanceRecord::default)
                .last_heartbeat = now;
            self.recalc_and_publish(state);
            Ok(state.allocations.get(instance_id).cloned().unwrap_or_default())
        })
    }

    async fn unregister(&self, instance_id: &InstanceId) -> Result<()> {
        self.with_state(|state| {
            state.instances.remove(instance_id);
            state.allocations.remove(instance_id);
            self.recalc_and_publish(state);
            Ok(())
        })
    }

    async fn heartbeat(&self, instance_id: &InstanceId) -> Result<()> {
        self.with_state(|state| {
            let now = self.clock.now_ms();
            if let Some(record) = state.instances.get_mut(instance_id) {
                record.last_heartbeat = now;
            }
            // Allocations stay fresh as usage windows roll.
            self.recalc_and_publish(state);
            Ok(())
        })
    }

    async fn cleanup(&self, cutoff_ms: i64) -> Result<()> {
        self.with_state(|state| {
            let stale: Vec<InstanceId> = state
                .instances
                .iter()
                .filter(|(_, record)| record.last_heartbeat < cutoff_ms)
                .map(|(id, _)| id.clone())
                .collect();
            if stale.is_empty() {
                return Ok(());
            }
            for instance_id in stale {
                log::info!("Removing stale instance {} from the registry.", instance_id);
                state.instances.remove(&instance_id);
                state.allocations.remove(&instance_id);
            }
            self.recalc_and_publish(state);
            Ok(())
        })
    }

    async fn acquire(&self, request: &PoolAcquire) -> Result<bool> {
        self.with_state(|state| {
            let Some(allocation) = state.allocations.get_mut(&request.instance_id) else {
                return Ok(false);
            };
            let Some(pool) = allocation.pools.get_mut(&request.model_id) else {
                return Ok(false);
            };
            if pool.total_slots == 0 {
                return Ok(false);
            }
            pool.total_slots -= 1;

            if let Some(record) = state.instances.get_mut(&request.instance_id) {
                *record
                    .in_flight_by_model
                    .entry(request.model_id.clone())
                    .or_insert(0) += 1;
            }
            Ok(true)
        })
    }

    async fn release(&self, request: &PoolRelease) -> Result<()> {
        self.with_state(|state| {
            let model = &request.model_id;
            if request.actual_tokens > 0 {
                *state
                    .usage
                    .entry((model.clone(), WindowKind::TokensMinute, request.window_starts.minute))
                    .or_insert(0) += request.actual_tokens;
                *state
                    .usage
                    .entry((model.clone(), WindowKind::TokensDay, request.window_starts.day))
                    .or_insert(0) += request.actual_tokens;
            }
            if request.actual_requests > 0 {
                *state
                    .usage
                    .entry((model.clone(), WindowKind::RequestsMinute, request.window_starts.minute))
                    .or_insert(0) += request.actual_requests;
                *state
                    .usage
                    .entry((model.clone(), WindowKind::RequestsDay, request.window_starts.day))
                    .or_insert(0) += request.actual_requests;
            }

            if let Some(record) = state.instances.get_mut(&request.instance_id) {
                if let Some(held) = record.in_flight_by_model.get_mut(model) {
                    *held = held.saturating_sub(1);
                }
            }
            self.recalc_and_publish(state);
            Ok(())
        })
    }

    async fn subscribe(
        &self,
        instance_id: &InstanceId,
    ) -> Result<mpsc::UnboundedReceiver<AllocationInfo>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|state| {
            if let Some(allocation) = state.allocations.get(instance_id) {
                let _ = tx.send(allocation.clone());
            }
            state.subscribers.push((instance_id.clone(), tx));
        });
        Ok(rx)
    }

    async fn stats(&self) -> Result<serde_json::Value> {
        self.with_state(|state| {
            Ok(serde_json::json!({
                "instances": state.instances,
                "allocations": state.allocations,
            }))
        })
    }

    async fn shutdown(&self) {
        self.with_state(|state| {
            state.closed = true;
            state.subscribers.clear();
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::clock::Clock;
    use crate::domain::clock::ManualClock;
    use crate::domain::limiter::model_limiter::WindowStarts;
    use crate::domain::usage::ResourceRequest;
    use crate::domain::util::id::JobId;

    fn allocator(tpm: u64, est_tokens: u64) -> (InProcessAllocator, ManualClock) {
        let clock = ManualClock::new(0);
        let mut capacities = BTreeMap::new();
        capacities.insert(
            ModelId::new("gpt"),
            ModelConfig { tokens_per_minute: Some(tpm), ..Default::default() },
        );
        let mut resources = BTreeMap::new();
        resources.insert(
            JobTypeId::new("summary"),
            JobTypeResourceRecord {
                estimated_used_tokens: Some(est_tokens),
                estimated_number_of_requests: None,
                ratio: 1.0,
            },
        );
        (InProcessAllocator::new(Arc::new(clock.clone()), capacities, resources), clock)
    }

    fn acquire_request(instance: &str) -> PoolAcquire {
        PoolAcquire {
            instance_id: InstanceId::new(instance),
            model_id: ModelId::new("gpt"),
            job_id: JobId::new("job-1"),
            estimated: ResourceRequest { requests: 1, tokens: 10_000, memory_kb: 0 },
        }
    }

    #[tokio::test]
    async fn register_partitions_capacity_evenly() {
        let (allocator, _clock) = allocator(20_000, 10_000);
        allocator.register(&InstanceId::new("a")).await.unwrap();
        let info = allocator.register(&InstanceId::new("b")).await.unwrap();

        assert_eq!(info.instance_count, 2);
        assert_eq!(info.pools[&ModelId::new("gpt")].total_slots, 1);
    }

    #[tokio::test]
    async fn acquire_consumes_slots_until_empty() {
        let (allocator, _clock) = allocator(20_000, 10_000);
        allocator.register(&InstanceId::new("a")).await.unwrap();

        assert!(allocator.acquire(&acquire_request("a")).await.unwrap());
        assert!(allocator.acquire(&acquire_request("a")).await.unwrap());
        assert!(!allocator.acquire(&acquire_request("a")).await.unwrap());
    }

    #[tokio::test]
    async fn release_propagates_usage_to_other_instances() {
        let (allocator, _clock) = allocator(100_000, 10_000);
        allocator.register(&InstanceId::new("a")).await.unwrap();
        allocator.register(&InstanceId::new("b")).await.unwrap();
        let mut rx = allocator.subscribe(&InstanceId::new("b")).await.unwrap();
        // Drain the immediate snapshot.
        let initial = rx.recv().await.unwrap();
        assert_eq!(initial.pools[&ModelId::new("gpt")].tokens_per_minute, 50_000);

        assert!(allocator.acquire(&acquire_request("a")).await.unwrap());
        allocator
            .release(&PoolRelease {
                instance_id: InstanceId::new("a"),
                model_id: ModelId::new("gpt"),
                job_id: JobId::new("job-1"),
                estimated: ResourceRequest { requests: 1, tokens: 10_000, memory_kb: 0 },
                actual_tokens: 6_000,
                actual_requests: 1,
                window_starts: WindowStarts { minute: 0, day: 0 },
            })
            .await
            .unwrap();

        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.pools[&ModelId::new("gpt")].tokens_per_minute, 47_000);
    }

    #[tokio::test]
    async fn cleanup_drops_stale_instances() {
        let (allocator, clock) = allocator(20_000, 10_000);
        allocator.register(&InstanceId::new("a")).await.unwrap();
        clock.advance(30_000);
        allocator.register(&InstanceId::new("b")).await.unwrap();

        allocator.cleanup(clock.now_ms() - 15_000).await.unwrap();
        let info = allocator.register(&InstanceId::new("b")).await.unwrap();
        assert_eq!(info.instance_count, 1);
    }

    #[tokio::test]
    async fn usage_expires_with_the_window() {
        let (allocator, clock) = allocator(100_000, 10_000);
        allocator.register(&InstanceId::new("a")).await.unwrap();

        assert!(allocator.acquire(&acquire_request("a")).await.unwrap());
        allocator
            .release(&PoolRelease {
                instance_id: InstanceId::new("a"),
                model_id: ModelId::new("gpt"),
                job_id: JobId::new("job-1"),
                estimated: ResourceRequest { requests: 1, tokens: 10_000, memory_kb: 0 },
                actual_tokens: 10_000,
                actual_requests: 1,
                window_starts: WindowStarts { minute: 0, day: 0 },
            })
            .await
            .unwrap();

        clock.advance(MINUTE_MS);
        allocator.heartbeat(&InstanceId::new("a")).await.unwrap();
        let info = allocator.register(&InstanceId::new("a")).await.unwrap();
        // The minute usage rolled out of scope; the full TPM is back.
        assert_eq!(info.pools[&ModelId::new("gpt")].tokens_per_minute, 100_000);
    }
}
