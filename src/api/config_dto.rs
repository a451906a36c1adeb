use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::config::{
    DistributedConfig, LimiterConfig, MemoryConfig, ModelConfig, RatioAdjustmentConfig,
    RatioConfig, ResourceEstimation,
};
use crate::domain::util::id::{JobTypeId, ModelId};
use crate::error::Result;

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfigDto {
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub max_concurrent_requests: Option<u64>,
    /// Consumed by the external cost collaborator, not enforced here.
    pub pricing: Option<PricingDto>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingDto {
    pub input: f64,
    pub cached: f64,
    pub output: f64,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RatioDto {
    pub initial_value: Option<f64>,
    pub flexible: Option<bool>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEstimationDto {
    pub estimated_used_tokens: Option<u64>,
    pub estimated_number_of_requests: Option<u64>,
    #[serde(rename = "estimatedUsedMemoryKB")]
    pub estimated_used_memory_kb: Option<u64>,
    #[serde(default)]
    pub ratio: RatioDto,
    /// Mapping modelId -> wait deadline in ms; missing model = unbounded.
    #[serde(rename = "maxWaitMS", default)]
    pub max_wait_ms: HashMap<String, u64>,
    pub min_capacity: Option<u64>,
    pub max_capacity: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfigDto {
    pub free_memory_ratio: f64,
    pub recalculation_interval_ms: Option<u64>,
    #[serde(rename = "maxMemoryKB")]
    pub max_memory_kb: Option<u64>,
    #[serde(rename = "minCapacityKB")]
    pub min_capacity_kb: Option<u64>,
    #[serde(rename = "maxCapacityKB")]
    pub max_capacity_kb: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RatioAdjustmentConfigDto {
    pub high_load_threshold: Option<f64>,
    pub low_load_threshold: Option<f64>,
    pub max_adjustment: Option<f64>,
    pub min_ratio: Option<f64>,
    pub adjustment_interval_ms: Option<u64>,
    pub releases_per_adjustment: Option<usize>,
    pub min_job_type_capacity: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DistributedConfigDto {
    pub key_prefix: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub stale_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterConfigDto {
    pub models: HashMap<String, ModelConfigDto>,
    /// Accepts both spellings used in the wild.
    #[serde(alias = "order")]
    pub escalation_order: Vec<String>,
    pub resource_estimations_per_job: HashMap<String, ResourceEstimationDto>,
    pub memory: Option<MemoryConfigDto>,
    pub ratio_adjustment_config: Option<RatioAdjustmentConfigDto>,
    pub distributed: Option<DistributedConfigDto>,
    #[serde(default)]
    pub refund_on_abandon: bool,
}

impl From<ModelConfigDto> for ModelConfig {
    fn from(dto: ModelConfigDto) -> Self {
        ModelConfig {
            requests_per_minute: dto.requests_per_minute,
            requests_per_day: dto.requests_per_day,
            tokens_per_minute: dto.tokens_per_minute,
            tokens_per_day: dto.tokens_per_day,
            max_concurrent_requests: dto.max_concurrent_requests,
        }
    }
}

impl From<ResourceEstimationDto> for ResourceEstimation {
    fn from(dto: ResourceEstimationDto) -> Self {
        ResourceEstimation {
            estimated_used_tokens: dto.estimated_used_tokens,
            estimated_number_of_requests: dto.estimated_number_of_requests,
            estimated_used_memory_kb: dto.estimated_used_memory_kb,
            ratio: RatioConfig {
                initial_value: dto.ratio.initial_value,
                flexible: dto.ratio.flexible.unwrap_or(true),
            },
            max_wait_ms: dto
                .max_wait_ms
                .into_iter()
                .map(|(model, ms)| (ModelId::new(model), ms))
                .collect(),
            min_capacity: dto.min_capacity.unwrap_or(0),
            max_capacity: dto.max_capacity,
        }
    }
}

impl From<MemoryConfigDto> for MemoryConfig {
    fn from(dto: MemoryConfigDto) -> Self {
        let defaults = MemoryConfig::default();
        MemoryConfig {
            free_memory_ratio: dto.free_memory_ratio,
            recalculation_interval_ms: dto
                .recalculation_interval_ms
                .unwrap_or(defaults.recalculation_interval_ms),
            max_memory_kb: dto.max_memory_kb,
            min_capacity_kb: dto.min_capacity_kb,
            max_capacity_kb: dto.max_capacity_kb,
        }
    }
}

impl From<RatioAdjustmentConfigDto> for RatioAdjustmentConfig {
    fn from(dto: RatioAdjustmentConfigDto) -> Self {
        let defaults = RatioAdjustmentConfig::default();
        RatioAdjustmentConfig {
            high_load_threshold: dto.high_load_threshold.unwrap_or(defaults.high_load_threshold),
            low_load_threshold: dto.low_load_threshold.unwrap_or(defaults.low_load_threshold),
            max_adjustment: dto.max_adjustment.unwrap_or(defaults.max_adjustment),
            min_ratio: dto.min_ratio.unwrap_or(defaults.min_ratio),
            adjustment_interval_ms: dto
                .adjustment_interval_ms
                .unwrap_or(defaults.adjustment_interval_ms),
            releases_per_adjustment: dto
                .releases_per_adjustment
                .unwrap_or(defaults.releases_per_adjustment),
            min_job_type_capacity: dto
                .min_job_type_capacity
                .unwrap_or(defaults.min_job_type_capacity),
        }
    }
}

impl From<DistributedConfigDto> for DistributedConfig {
    fn from(dto: DistributedConfigDto) -> Self {
        let defaults = DistributedConfig::default();
        DistributedConfig {
            key_prefix: dto.key_prefix.unwrap_or(defaults.key_prefix),
            heartbeat_interval_ms: dto
                .heartbeat_interval_ms
                .unwrap_or(defaults.heartbeat_interval_ms),
            stale_after_ms: dto.stale_after_ms.unwrap_or(defaults.stale_after_ms),
        }
    }
}

impl LimiterConfigDto {
    /// Converts into the validated domain configuration.
    pub fn into_domain(self) -> Result<LimiterConfig> {
        let config = LimiterConfig {
            models: self
                .models
                .into_iter()
                .map(|(id, dto)| (ModelId::new(id), ModelConfig::from(dto)))
                .collect(),
            escalation_order: self.escalation_order.into_iter().map(ModelId::new).collect(),
            estimations: self
                .resource_estimations_per_job
                .into_iter()
                .map(|(id, dto)| (JobTypeId::new(id), ResourceEstimation::from(dto)))
                .collect(),
            memory: self.memory.map(MemoryConfig::from),
            ratio_adjustment: self.ratio_adjustment_config.map(RatioAdjustmentConfig::from).unwrap_or_default(),
            distributed: self.distributed.map(DistributedConfig::from).unwrap_or_default(),
            refund_on_abandon: self.refund_on_abandon,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_config() {
        let json = r#"{
            "models": {
                "gpt-large": {
                    "tokensPerMinute": 140000,
                    "requestsPerMinute": 60,
                    "maxConcurrentRequests": 8,
                    "pricing": { "input": 0.01, "cached": 0.001, "output": 0.03 }
                },
                "gpt-small": { "tokensPerMinute": 500000 }
            },
            "escalationOrder": ["gpt-large", "gpt-small"],
            "resourceEstimationsPerJob": {
                "summary": {
                    "estimatedUsedTokens": 10000,
                    "estimatedNumberOfRequests": 1,
                    "estimatedUsedMemoryKB": 2048,
                    "ratio": { "initialValue": 0.6, "flexible": false },
                    "maxWaitMS": { "gpt-large": 0 }
                },
                "chat": {
                    "estimatedUsedTokens": 2000,
                    "estimatedNumberOfRequests": 1
                }
            },
            "memory": { "freeMemoryRatio": 0.8 },
            "ratioAdjustmentConfig": { "maxAdjustment": 0.1 }
        }"#;

        let dto: LimiterConfigDto = serde_json::from_str(json).unwrap();
        let config = dto.into_domain().unwrap();

        assert_eq!(config.escalation_order.len(), 2);
        let summary = &config.estimations[&JobTypeId::new("summary")];
        assert_eq!(summary.estimated_used_tokens, Some(10_000));
        assert_eq!(summary.ratio.initial_value, Some(0.6));
        assert!(!summary.ratio.flexible);
        assert_eq!(summary.max_wait_ms[&ModelId::new("gpt-large")], 0);
        assert_eq!(config.ratio_adjustment.max_adjustment, 0.1);
        assert_eq!(config.ratio_adjustment.min_ratio, 0.01);

        let chat = &config.estimations[&JobTypeId::new("chat")];
        assert!(chat.ratio.flexible);
        assert!(chat.ratio.initial_value.is_none());
    }

    #[test]
    fn order_alias_is_accepted() {
        let json = r#"{
            "models": { "m": { "tokensPerMinute": 1000 } },
            "order": ["m"],
            "resourceEstimationsPerJob": {
                "t": { "estimatedUsedTokens": 100 }
            }
        }"#;
        let dto: LimiterConfigDto = serde_json::from_str(json).unwrap();
        assert_eq!(dto.escalation_order, vec!["m".to_string()]);
    }

    #[test]
    fn invalid_config_is_rejected_on_conversion() {
        let json = r#"{
            "models": { "m": { "tokensPerMinute": 1000 } },
            "escalationOrder": ["m"],
            "resourceEstimationsPerJob": {
                "t": { "estimatedNumberOfRequests": 1 }
            }
        }"#;
        let dto: LimiterConfigDto = serde_json::from_str(json).unwrap();
        assert!(dto.into_domain().is_err());
    }
}
