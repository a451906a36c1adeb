use std::collections::HashMap;

use crate::domain::usage::ResourceRequest;
use crate::domain::util::id::{JobTypeId, ModelId};
use crate::error::{Error, Result};

pub const MINUTE_MS: i64 = 60_000;
pub const DAY_MS: i64 = 86_400_000;

/// Rate limits of one upstream model. Any subset may be configured;
/// omitted limits are not enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelConfig {
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub max_concurrent_requests: Option<u64>,
}

impl ModelConfig {
    pub fn has_token_limit(&self) -> bool {
        self.tokens_per_minute.is_some() || self.tokens_per_day.is_some()
    }

    pub fn has_request_limit(&self) -> bool {
        self.requests_per_minute.is_some() || self.requests_per_day.is_some()
    }
}

/// Share of a model's instance pool a job type is entitled to.
///
/// An unspecified `initial_value` receives an even share of whatever the
/// explicitly configured ratios leave over. Fixed (non-flexible) ratios
/// are never touched by the adaptive adjustment loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatioConfig {
    pub initial_value: Option<f64>,
    pub flexible: bool,
}

impl Default for RatioConfig {
    fn default() -> Self {
        RatioConfig { initial_value: None, flexible: true }
    }
}

/// Resource estimates for one job type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceEstimation {
    pub estimated_used_tokens: Option<u64>,
    pub estimated_number_of_requests: Option<u64>,
    pub estimated_used_memory_kb: Option<u64>,
    pub ratio: RatioConfig,
    /// Per-model wait deadline before escalating. Missing entry = wait
    /// without bound; 0 = do not wait on that model at all.
    pub max_wait_ms: HashMap<ModelId, u64>,
    pub min_capacity: u64,
    pub max_capacity: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    /// Fraction of usable free memory handed to the memory semaphore.
    pub free_memory_ratio: f64,
    pub recalculation_interval_ms: u64,
    /// Hard cap on the usable memory considered, before the ratio.
    pub max_memory_kb: Option<u64>,
    pub min_capacity_kb: Option<u64>,
    pub max_capacity_kb: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            free_memory_ratio: 0.8,
            recalculation_interval_ms: 1_000,
            max_memory_kb: None,
            min_capacity_kb: None,
            max_capacity_kb: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatioAdjustmentConfig {
    pub high_load_threshold: f64,
    pub low_load_threshold: f64,
    pub max_adjustment: f64,
    pub min_ratio: f64,
    pub adjustment_interval_ms: u64,
    pub releases_per_adjustment: usize,
    pub min_job_type_capacity: u64,
}

impl Default for RatioAdjustmentConfig {
    fn default() -> Self {
        RatioAdjustmentConfig {
            high_load_threshold: 0.7,
            low_load_threshold: 0.3,
            max_adjustment: 0.2,
            min_ratio: 0.01,
            adjustment_interval_ms: 5_000,
            releases_per_adjustment: 10,
            min_job_type_capacity: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistributedConfig {
    pub key_prefix: String,
    pub heartbeat_interval_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        DistributedConfig {
            key_prefix: "llmrl:".to_string(),
            heartbeat_interval_ms: 5_000,
            stale_after_ms: 15_000,
        }
    }
}

/// Complete limiter configuration, validated at construction.
#[derive(Debug, Clone, Default)]
pub struct LimiterConfig {
    pub models: HashMap<ModelId, ModelConfig>,
    pub escalation_order: Vec<ModelId>,
    pub estimations: HashMap<JobTypeId, ResourceEstimation>,
    pub memory: Option<MemoryConfig>,
    pub ratio_adjustment: RatioAdjustmentConfig,
    pub distributed: DistributedConfig,
    /// When a job dies without reporting usage, its time-window
    /// reservations are kept by default so an unobservable failure cannot
    /// hide overuse. `true` refunds them instead.
    pub refund_on_abandon: bool,
}

impl LimiterConfig {
    /// Construction-time validation of the cross-field requirements.
    pub fn validate(&self) -> Result<()> {
        if self.escalation_order.is_empty() {
            return Err(Error::Configuration("escalation order must name at least one model".into()));
        }
        for model_id in &self.escalation_order {
            if !self.models.contains_key(model_id) {
                return Err(Error::Configuration(format!(
                    "escalation order names unknown model '{}'",
                    model_id
                )));
            }
        }
        if self.estimations.is_empty() {
            return Err(Error::Configuration("at least one job type estimation is required".into()));
        }

        let any_token_limit = self.models.values().any(ModelConfig::has_token_limit);
        let any_request_limit = self.models.values().any(ModelConfig::has_request_limit);

        for (job_type, estimation) in &self.estimations {
            if any_token_limit && estimation.estimated_used_tokens.is_none() {
                return Err(Error::Configuration(format!(
                    "job type '{}' needs estimatedUsedTokens because a token limit is configured",
                    job_type
                )));
            }
            if any_request_limit && estimation.estimated_number_of_requests.is_none() {
                return Err(Error::Configuration(format!(
                    "job type '{}' needs estimatedNumberOfRequests because a request limit is configured",
                    job_type
                )));
            }
            if let Some(initial) = estimation.ratio.initial_value {
                if !(0.0..=1.0).contains(&initial) {
                    return Err(Error::Configuration(format!(
                        "job type '{}' has ratio initialValue {} outside [0, 1]",
                        job_type, initial
                    )));
                }
            }
            if self.memory.is_some() && estimation.estimated_used_memory_kb.is_none() {
                log::warn!(
                    "Job type '{}' has no estimatedUsedMemoryKB; it will not be memory constrained.",
                    job_type
                );
            }
        }

        if let Some(memory) = &self.memory {
            if !(memory.free_memory_ratio > 0.0 && memory.free_memory_ratio <= 1.0) {
                return Err(Error::Configuration(format!(
                    "freeMemoryRatio {} outside (0, 1]",
                    memory.free_memory_ratio
                )));
            }
        }

        let adj = &self.ratio_adjustment;
        if adj.low_load_threshold >= adj.high_load_threshold {
            return Err(Error::Configuration(format!(
                "lowLoadThreshold {} must be below highLoadThreshold {}",
                adj.low_load_threshold, adj.high_load_threshold
            )));
        }

        Ok(())
    }

    /// Initial per-type ratios with the unspecified ones filled in: each
    /// receives an even share of whatever the explicit values leave of 1.0
    /// (floored at zero; an explicit sum above 1 is kept as configured).
    pub fn resolved_ratios(&self) -> HashMap<JobTypeId, f64> {
        let specified_sum: f64 = self
            .estimations
            .values()
            .filter_map(|e| e.ratio.initial_value)
            .sum();
        let unspecified = self
            .estimations
            .values()
            .filter(|e| e.ratio.initial_value.is_none())
            .count();

        let fill = if unspecified == 0 {
            0.0
        } else {
            ((1.0 - specified_sum).max(0.0)) / unspecified as f64
        };

        self.estimations
            .iter()
            .map(|(id, e)| (id.clone(), e.ratio.initial_value.unwrap_or(fill)))
            .collect()
    }

    /// Admission estimate of one job of the given type.
    pub fn resource_request(&self, job_type: &JobTypeId) -> Option<ResourceRequest> {
        let estimation = self.estimations.get(job_type)?;
        Some(ResourceRequest {
            requests: estimation.estimated_number_of_requests.unwrap_or(1),
            tokens: estimation.estimated_used_tokens.unwrap_or(0),
            memory_kb: estimation.estimated_used_memory_kb.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> LimiterConfig {
        let model = ModelId::new("gpt");
        let mut models = HashMap::new();
        models.insert(model.clone(), ModelConfig { tokens_per_minute: Some(100_000), ..Default::default() });

        let mut estimations = HashMap::new();
        estimations.insert(
            JobTypeId::new("summary"),
            ResourceEstimation { estimated_used_tokens: Some(10_000), ..Default::default() },
        );

        LimiterConfig {
            models,
            escalation_order: vec![model],
            estimations,
            ..Default::default()
        }
    }

    #[test]
    fn accepts_minimal_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_token_limit_without_token_estimate() {
        let mut config = base_config();
        config
            .estimations
            .get_mut(&JobTypeId::new("summary"))
            .unwrap()
            .estimated_used_tokens = None;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_unknown_model_in_escalation_order() {
        let mut config = base_config();
        config.escalation_order.push(ModelId::new("missing"));
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn unspecified_ratios_share_the_remainder() {
        let mut config = base_config();
        config.estimations.get_mut(&JobTypeId::new("summary")).unwrap().ratio =
            RatioConfig { initial_value: Some(0.5), flexible: false };
        config.estimations.insert(
            JobTypeId::new("chat"),
            ResourceEstimation { estimated_used_tokens: Some(2_000), ..Default::default() },
        );
        config.estimations.insert(
            JobTypeId::new("embed"),
            ResourceEstimation { estimated_used_tokens: Some(500), ..Default::default() },
        );

        let ratios = config.resolved_ratios();
        assert_eq!(ratios[&JobTypeId::new("summary")], 0.5);
        assert!((ratios[&JobTypeId::new("chat")] - 0.25).abs() < 1e-9);
        assert!((ratios[&JobTypeId::new("embed")] - 0.25).abs() < 1e-9);
    }
}
