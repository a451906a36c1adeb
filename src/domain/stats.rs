use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::distributed::allocation::AllocationInfo;
use crate::domain::job_type::JobTypeSnapshot;
use crate::domain::limiter::model_limiter::RemainingCapacity;
use crate::domain::scheduler::job::ActiveJobInfo;
use crate::domain::util::id::{InstanceId, JobTypeId, ModelId};

/// One model's view in [`LimiterStats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStats {
    pub remaining: RemainingCapacity,
    pub pool_slots: u64,
    #[serde(rename = "memoryAvailableKB")]
    pub memory_available_kb: Option<u64>,
    pub job_types: BTreeMap<JobTypeId, JobTypeSnapshot>,
}

/// Introspection snapshot returned by `get_stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub instance_id: InstanceId,
    pub models: BTreeMap<ModelId, ModelStats>,
    pub active_jobs: Vec<ActiveJobInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationInfo>,
}
