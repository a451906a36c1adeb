use std::collections::BTreeMap;

use crate::domain::config::ModelConfig;
use crate::domain::distributed::allocation::{
    AllocationInfo, DynamicLimits, InstanceRecord, JobTypeResourceRecord, PoolAllocation,
    UsageTotals,
};
use crate::domain::util::id::{InstanceId, JobTypeId, ModelId};

/// Inputs of one cluster-wide reallocation pass.
#[derive(Debug, Clone, Default)]
pub struct RecalcInputs {
    pub instances: BTreeMap<InstanceId, InstanceRecord>,
    pub model_capacities: BTreeMap<ModelId, ModelConfig>,
    pub job_type_resources: BTreeMap<JobTypeId, JobTypeResourceRecord>,
    pub usage: BTreeMap<ModelId, UsageTotals>,
}

/// Partitions each model's remaining global capacity across the live
/// instances.
///
/// Every dimension is split evenly (`floor(remaining / N)`); the slot
/// count is the minimum whole-job count over the constraining dimensions.
/// An instance already holding at least its fair share of in-flight jobs
/// gets zero slots, and idle instances absorb the remainder, so the pool
/// biases toward the least-loaded instance. A second clamp pass keeps the
/// sum of allocations within the global remainder.
///
/// This is the reference implementation of the recalculation embedded in
/// the Redis scripts; the in-process allocator runs it directly.
pub fn recalculate(inputs: &RecalcInputs) -> BTreeMap<InstanceId, AllocationInfo> {
    let instance_count = inputs.instances.len() as u64;
    let mut result: BTreeMap<InstanceId, AllocationInfo> = inputs
        .instances
        .keys()
        .map(|id| {
            (
                id.clone(),
                AllocationInfo {
                    instance_count: instance_count as u32,
                    pools: Default::default(),
                    dynamic_limits: Some(Default::default()),
                },
            )
        })
        .collect();
    if instance_count == 0 {
        return result;
    }

    // The conservative per-job estimate: the largest estimate any job
    // type declares for the dimension.
    let est_tokens = inputs
        .job_type_resources
        .values()
        .filter_map(|r| r.estimated_used_tokens)
        .max()
        .unwrap_or(0);
    let est_requests = inputs
        .job_type_resources
        .values()
        .filter_map(|r| r.estimated_number_of_requests)
        .max()
        .unwrap_or(0);

    for (model_id, config) in &inputs.model_capacities {
        let usage = inputs.usage.get(model_id).copied().unwrap_or_default();

        let remaining = [
            config.tokens_per_minute.map(|l| l.saturating_sub(usage.tokens_minute)),
            config.tokens_per_day.map(|l| l.saturating_sub(usage.tokens_day)),
            config.requests_per_minute.map(|l| l.saturating_sub(usage.requests_minute)),
            config.requests_per_day.map(|l| l.saturating_sub(usage.requests_day)),
        ];
        let estimates = [est_tokens, est_tokens, est_requests, est_requests];

        // Whole-job counts, globally and per even share. A dimension only
        // constrains when its per-job estimate is known and positive.
        let mut global_slots: Option<u64> = None;
        let mut base_slots: Option<u64> = None;
        for (remaining_dim, estimate) in remaining.iter().zip(estimates) {
            let (Some(remaining_dim), true) = (remaining_dim, estimate > 0) else {
                continue;
            };
            let global_dim = remaining_dim / estimate;
            let per_instance_dim = (remaining_dim / instance_count) / estimate;
            global_slots = Some(global_slots.map_or(global_dim, |g| g.min(global_dim)));
            base_slots = Some(base_slots.map_or(per_instance_dim, |b| b.min(per_instance_dim)));
        }

        // A model without any constraining global dimension is not pooled;
        // the local limiter alone gates it.
        let (Some(global_slots), Some(base_slots)) = (global_slots, base_slots) else {
            continue;
        };

        struct Share {
            instance_id: InstanceId,
            in_flight: u64,
            slots: u64,
        }

        // An instance already at or past its fair share gets nothing.
        let mut shares: Vec<Share> = inputs
            .instances
            .iter()
            .map(|(id, record)| {
                let in_flight = record.in_flight_by_model.get(model_id).copied().unwrap_or(0);
                Share {
                    instance_id: id.clone(),
                    in_flight,
                    slots: base_slots.saturating_sub(in_flight),
                }
            })
            .collect();
        let total_in_flight: u64 = shares.iter().map(|s| s.in_flight).sum();

        // Idle instances absorb whatever the even split left over, one
        // slot at a time to the least-loaded instance.
        let allocated_sum = |shares: &[Share]| shares.iter().map(|s| s.slots).sum::<u64>();
        let mut spare = global_slots
            .saturating_sub(allocated_sum(&shares))
            .saturating_sub(total_in_flight);
        while spare > 0 {
            let least_loaded = shares
                .iter_mut()
                .min_by_key(|s| s.in_flight + s.slots)
                .expect("at least one instance");
            least_loaded.slots += 1;
            spare -= 1;
        }

        // Second pass: in-flight overshoot must not let the sum of
        // allocations exceed what the cluster can still start.
        let budget = global_slots.saturating_sub(total_in_flight);
        while allocated_sum(&shares) > budget {
            let most_allocated =
                shares.iter_mut().max_by_key(|s| s.slots).expect("at least one instance");
            if most_allocated.slots == 0 {
                break;
            }
            most_allocated.slots -= 1;
        }

        let per_instance = |limit: Option<u64>, used: u64| -> u64 {
            limit.map(|l| l.saturating_sub(used) / instance_count).unwrap_or(0)
        };
        let pool_template = PoolAllocation {
            total_slots: 0,
            tokens_per_minute: per_instance(config.tokens_per_minute, usage.tokens_minute),
            tokens_per_day: per_instance(config.tokens_per_day, usage.tokens_day),
            requests_per_minute: per_instance(config.requests_per_minute, usage.requests_minute),
            requests_per_day: per_instance(config.requests_per_day, usage.requests_day),
        };
        let limits = DynamicLimits {
            tokens_per_minute: config
                .tokens_per_minute
                .map(|l| l.saturating_sub(usage.tokens_minute) / instance_count),
            tokens_per_day: config
                .tokens_per_day
                .map(|l| l.saturating_sub(usage.tokens_day) / instance_count),
            requests_per_minute: config
                .requests_per_minute
                .map(|l| l.saturating_sub(usage.requests_minute) / instance_count),
            requests_per_day: config
                .requests_per_day
                .map(|l| l.saturating_sub(usage.requests_day) / instance_count),
        };

        for share in shares {
            let info = result.get_mut(&share.instance_id).unwrap();
            let mut pool = pool_template;
            pool.total_slots = share.slots;
            info.pools.insert(model_id.clone(), pool);
            if let Some(dynamic) = info.dynamic_limits.as_mut() {
                dynamic.insert(model_id.clone(), limits);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, in_flight: &[(&str, u64)]) -> (InstanceId, InstanceRecord) {
        (
            InstanceId::new(id),
            InstanceRecord {
                last_heartbeat: 0,
                in_flight_by_model: in_flight
                    .iter()
                    .map(|(model, held)| (ModelId::new(*model), *held))
                    .collect(),
            },
        )
    }

    fn inputs(tpm: u64, instances: Vec<(InstanceId, InstanceRecord)>, est_tokens: u64) -> RecalcInputs {
        let mut model_capacities = BTreeMap::new();
        model_capacities.insert(
            ModelId::new("gpt"),
            ModelConfig { tokens_per_minute: Some(tpm), ..Default::default() },
        );
        let mut job_type_resources = BTreeMap::new();
        job_type_resources.insert(
            JobTypeId::new("summary"),
            JobTypeResourceRecord {
                estimated_used_tokens: Some(est_tokens),
                estimated_number_of_requests: None,
                ratio: 1.0,
            },
        );
        RecalcInputs {
            instances: instances.into_iter().collect(),
            model_capacities,
            job_type_resources,
            usage: BTreeMap::new(),
        }
    }

    #[test]
    fn even_split_across_two_idle_instances() {
        let inputs = inputs(
            20_000,
            vec![instance("a", &[]), instance("b", &[])],
            10_000,
        );
        let allocations = recalculate(&inputs);

        let model = ModelId::new("gpt");
        for id in ["a", "b"] {
            let pool = allocations[&InstanceId::new(id)].pools[&model];
            assert_eq!(pool.total_slots, 1);
            assert_eq!(pool.tokens_per_minute, 10_000);
        }
    }

    #[test]
    fn usage_reduces_the_per_instance_share() {
        let mut inputs = inputs(
            100_000,
            vec![instance("a", &[]), instance("b", &[])],
            10_000,
        );
        inputs
            .usage
            .insert(ModelId::new("gpt"), UsageTotals { tokens_minute: 6_000, ..Default::default() });

        let allocations = recalculate(&inputs);
        let pool = allocations[&InstanceId::new("b")].pools[&ModelId::new("gpt")];
        assert_eq!(pool.tokens_per_minute, 47_000);
    }

    #[test]
    fn loaded_instance_yields_to_the_idle_one() {
        let inputs = inputs(
            40_000,
            vec![instance("a", &[("gpt", 2)]), instance("b", &[])],
            10_000,
        );
        let allocations = recalculate(&inputs);

        let model = ModelId::new("gpt");
        let a = allocations[&InstanceId::new("a")].pools[&model].total_slots;
        let b = allocations[&InstanceId::new("b")].pools[&model].total_slots;
        // Four whole jobs globally, two already running on "a".
        assert_eq!(a, 0);
        assert_eq!(b, 2);
    }

    #[test]
    fn sum_of_allocations_never_exceeds_the_global_remainder() {
        let inputs = inputs(
            50_000,
            vec![
                instance("a", &[("gpt", 4)]),
                instance("b", &[("gpt", 0)]),
                instance("c", &[("gpt", 0)]),
            ],
            10_000,
        );
        let allocations = recalculate(&inputs);

        let model = ModelId::new("gpt");
        let total: u64 = allocations
            .values()
            .map(|info| info.pools.get(&model).map(|p| p.total_slots).unwrap_or(0))
            .sum();
        // 5 whole jobs globally, 4 in flight: at most one may still start.
        assert_eq!(total, 1);
    }

    #[test]
    fn model_without_global_limits_is_not_pooled() {
        let mut inputs = inputs(20_000, vec![instance("a", &[])], 10_000);
        inputs
            .model_capacities
            .insert(ModelId::new("local"), ModelConfig { max_concurrent_requests: Some(5), ..Default::default() });

        let allocations = recalculate(&inputs);
        assert!(!allocations[&InstanceId::new("a")].pools.contains_key(&ModelId::new("local")));
    }

    #[test]
    fn instance_count_is_reported() {
        let inputs = inputs(20_000, vec![instance("a", &[]), instance("b", &[])], 10_000);
        let allocations = recalculate(&inputs);
        assert!(allocations.values().all(|info| info.instance_count == 2));
    }
}
