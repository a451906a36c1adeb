use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::domain::config::{RatioAdjustmentConfig, ResourceEstimation};
use crate::domain::util::id::{JobTypeId, ModelId};

/// Per-type accounting inside one model's pool.
#[derive(Debug, Clone)]
struct TypeState {
    ratio: f64,
    initial_ratio: f64,
    flexible: bool,
    allocated: u64,
    in_flight: u64,
    estimated_memory_kb: u64,
    min_capacity: u64,
    max_capacity: Option<u64>,
}

#[derive(Debug)]
struct JtmState {
    pool_total_slots: u64,
    total_memory_kb: u64,
    types: BTreeMap<JobTypeId, TypeState>,
}

/// Public view of one job type's slot accounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTypeSnapshot {
    pub ratio: f64,
    pub allocated: u64,
    pub in_flight: u64,
    pub flexible: bool,
}

/// Result of one adaptive adjustment cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdjustmentOutcome {
    pub changed: bool,
    /// How many waiting jobs the caller may wake on the model.
    pub releases: usize,
}

/// Splits one model's per-instance pool into per-job-type slot quotas.
///
/// A job type is admitted only while `in_flight < allocated`; the
/// allocation follows the configured ratios, constrained by the memory
/// budget and the per-type capacity bounds. Flexible ratios drift with
/// observed load in [`JobTypeManager::adjust_ratios`]; fixed ratios never
/// move.
#[derive(Debug)]
pub struct JobTypeManager {
    model_id: ModelId,
    state: Mutex<JtmState>,
}

impl JobTypeManager {
    pub fn new(
        model_id: ModelId,
        estimations: &std::collections::HashMap<JobTypeId, ResourceEstimation>,
        initial_ratios: &std::collections::HashMap<JobTypeId, f64>,
        total_memory_kb: u64,
    ) -> JobTypeManager {
        let types = estimations
            .iter()
            .map(|(id, estimation)| {
                let ratio = initial_ratios.get(id).copied().unwrap_or(0.0);
                (
                    id.clone(),
                    TypeState {
                        ratio,
                        initial_ratio: ratio,
                        flexible: estimation.ratio.flexible,
                        allocated: 0,
                        in_flight: 0,
                        estimated_memory_kb: estimation.estimated_used_memory_kb.unwrap_or(0),
                        min_capacity: estimation.min_capacity,
                        max_capacity: estimation.max_capacity,
                    },
                )
            })
            .collect();

        let manager = JobTypeManager {
            model_id,
            state: Mutex::new(JtmState { pool_total_slots: 0, total_memory_kb, types }),
        };
        manager.with_state(recompute);
        manager
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut JtmState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Installs a new pool size (from the distributed allocation) and
    /// repartitions. Returns whether any allocation changed.
    pub fn set_pool_slots(&self, total_slots: u64) -> bool {
        self.with_state(|state| {
            if state.pool_total_slots == total_slots {
                return false;
            }
            state.pool_total_slots = total_slots;
            recompute(state)
        })
    }

    pub fn set_memory_budget(&self, total_memory_kb: u64) -> bool {
        self.with_state(|state| {
            if state.total_memory_kb == total_memory_kb {
                return false;
            }
            state.total_memory_kb = total_memory_kb;
            recompute(state)
        })
    }

    pub fn pool_slots(&self) -> u64 {
        self.with_state(|state| state.pool_total_slots)
    }

    /// Layer (b) of the two-layer admission check.
    pub fn can_admit(&self, job_type: &JobTypeId) -> bool {
        self.with_state(|state| match state.types.get(job_type) {
            Some(t) => t.in_flight < t.allocated,
            None => false,
        })
    }

    pub fn on_reserve(&self, job_type: &JobTypeId) {
        self.with_state(|state| {
            if let Some(t) = state.types.get_mut(job_type) {
                t.in_flight += 1;
            }
        });
    }

    pub fn on_release(&self, job_type: &JobTypeId) {
        self.with_state(|state| {
            if let Some(t) = state.types.get_mut(job_type) {
                if t.in_flight == 0 {
                    log::warn!(
                        "In-flight underflow for job type {} on model {}.",
                        job_type,
                        self.model_id
                    );
                } else {
                    t.in_flight -= 1;
                }
            }
        });
    }

    pub fn allocated(&self, job_type: &JobTypeId) -> u64 {
        self.with_state(|state| state.types.get(job_type).map(|t| t.allocated).unwrap_or(0))
    }

    pub fn in_flight(&self, job_type: &JobTypeId) -> u64 {
        self.with_state(|state| state.types.get(job_type).map(|t| t.in_flight).unwrap_or(0))
    }

    pub fn free_slots(&self, job_type: &JobTypeId) -> u64 {
        self.with_state(|state| {
            state
                .types
                .get(job_type)
                .map(|t| t.allocated.saturating_sub(t.in_flight))
                .unwrap_or(0)
        })
    }

    pub fn snapshot(&self) -> BTreeMap<JobTypeId, JobTypeSnapshot> {
        self.with_state(|state| {
            state
                .types
                .iter()
                .map(|(id, t)| {
                    (
                        id.clone(),
                        JobTypeSnapshot {
                            ratio: t.ratio,
                            allocated: t.allocated,
                            in_flight: t.in_flight,
                            flexible: t.flexible,
                        },
                    )
                })
                .collect()
        })
    }

    pub fn ratio_sum(&self) -> f64 {
        self.with_state(|state| state.types.values().map(|t| t.ratio).sum())
    }

    /// One adaptive cycle: move at most `max_adjustment` of ratio mass
    /// from under-loaded flexible types to over-loaded flexible ones.
    ///
    /// Fixed types never move; no type drops below `min_ratio` or below
    /// the ratio needed for `min_job_type_capacity` slots; the ratio sum
    /// across all types is preserved exactly.
    pub fn adjust_ratios(&self, config: &RatioAdjustmentConfig) -> AdjustmentOutcome {
        self.with_state(|state| {
            let pool_total = state.pool_total_slots;

            let load = |t: &TypeState| -> f64 {
                if t.allocated == 0 {
                    if t.in_flight > 0 { 1.0 } else { 0.0 }
                } else {
                    t.in_flight as f64 / t.allocated as f64
                }
            };

            // The ratio a donor may not fall below: the configured minimum,
            // raised so the type keeps at least min_job_type_capacity slots.
            let ratio_floor = |_t: &TypeState| -> f64 {
                let mut floor = config.min_ratio;
                if pool_total > 0 && config.min_job_type_capacity > 0 {
                    floor = floor.max(config.min_job_type_capacity as f64 / pool_total as f64);
                }
                floor
            };

            let mut donors: Vec<(JobTypeId, f64)> = Vec::new();
            let mut receivers: Vec<JobTypeId> = Vec::new();
            for (id, t) in &state.types {
                if !t.flexible {
                    continue;
                }
                let load = load(t);
                if load < config.low_load_threshold {
                    let headroom = t.ratio - ratio_floor(t);
                    if headroom > 0.0 {
                        donors.push((id.clone(), headroom));
                    }
                } else if load > config.high_load_threshold {
                    receivers.push(id.clone());
                }
            }

            // A lone flexible type can never be both donor and receiver, so
            // this also covers the single-flexible no-op.
            if donors.is_empty() || receivers.is_empty() {
                return AdjustmentOutcome::default();
            }

            let total_headroom: f64 = donors.iter().map(|(_, h)| h).sum();
            let total_take = config.max_adjustment.min(total_headroom);
            if total_take <= 0.0 {
                return AdjustmentOutcome::default();
            }

            for (id, headroom) in &donors {
                let take = total_take * headroom / total_headroom;
                state.types.get_mut(id).unwrap().ratio -= take;
            }
            let grant = total_take / receivers.len() as f64;
            for id in &receivers {
                state.types.get_mut(id).unwrap().ratio += grant;
            }

            recompute(state);
            log::debug!(
                "Adjusted job type ratios on model {}: moved {:.4} from {} type(s) to {} type(s).",
                self.model_id,
                total_take,
                donors.len(),
                receivers.len()
            );

            AdjustmentOutcome { changed: true, releases: config.releases_per_adjustment }
        })
    }
}

/// Recomputes every type's allocated slots from the pool size, the
/// memory budget and the current ratios. Returns whether anything moved.
fn recompute(state: &mut JtmState) -> bool {
    let pool_total = state.pool_total_slots;

    // Slots each type could hold on memory alone.
    let mut memory_slots: u64 = 0;
    for t in state.types.values() {
        let per_type = if t.estimated_memory_kb > 0 {
            ((state.total_memory_kb as f64 * t.ratio) / t.estimated_memory_kb as f64).floor() as u64
        } else {
            u64::MAX
        };
        memory_slots = memory_slots.saturating_add(per_type);
    }

    let constrained_total = pool_total.min(memory_slots);
    let scale_factor =
        if pool_total == 0 { 0.0 } else { constrained_total as f64 / pool_total as f64 };

    let mut changed = false;
    for t in state.types.values_mut() {
        let pool_slots_for_type = (pool_total as f64 * t.ratio).floor();
        let mut allocated = if pool_total == 0 {
            t.min_capacity
        } else {
            ((pool_slots_for_type * scale_factor).floor() as u64).max(t.min_capacity)
        };
        if let Some(max) = t.max_capacity {
            allocated = allocated.min(max);
        }
        if allocated != t.allocated {
            t.allocated = allocated;
            changed = true;
        }
    }
    changed
}
