use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::util::id::ModelId;

/// One instance's share of a model's global capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAllocation {
    pub total_slots: u64,
    pub tokens_per_minute: u64,
    pub requests_per_minute: u64,
    pub tokens_per_day: u64,
    pub requests_per_day: u64,
}

/// Remaining per-instance limits, published alongside the pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicLimits {
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
}

/// Everything one instance needs to know about its current share of the
/// cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationInfo {
    pub instance_count: u32,
    pub pools: HashMap<ModelId, PoolAllocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_limits: Option<HashMap<ModelId, DynamicLimits>>,
}

/// Registry entry of one live instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub last_heartbeat: i64,
    pub in_flight_by_model: HashMap<ModelId, u64>,
}

/// Job-type resource estimates as stored in the shared registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTypeResourceRecord {
    pub estimated_used_tokens: Option<u64>,
    pub estimated_number_of_requests: Option<u64>,
    pub ratio: f64,
}

/// Summed usage of one model inside the current minute/day windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub tokens_minute: u64,
    pub tokens_day: u64,
    pub requests_minute: u64,
    pub requests_day: u64,
}

/// Payload published on the allocations channel after every registry
/// mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationUpdate {
    pub instance_id: crate::domain::util::id::InstanceId,
    pub allocation: AllocationInfo,
}
