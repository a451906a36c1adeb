use serde::{Deserialize, Serialize};

use crate::domain::util::id::ModelId;

/// Token counts reported by an upstream model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cached: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64, cached: u64) -> TokenUsage {
        TokenUsage { input, output, cached }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output + self.cached
    }
}

/// What a job reports back when it finishes.
///
/// `requests` is the number of upstream requests actually performed; when
/// absent the reservation's estimate is kept as-is (no adjustment on the
/// request counters).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub tokens: TokenUsage,
    pub requests: Option<u64>,
}

impl UsageReport {
    pub fn of_tokens(tokens: TokenUsage) -> UsageReport {
        UsageReport { tokens, requests: None }
    }
}

/// Estimated footprint of one job, used for admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    pub requests: u64,
    pub tokens: u64,
    pub memory_kb: u64,
}

/// The capacity dimensions a model limiter can be constrained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    RequestsPerMinute,
    RequestsPerDay,
    TokensPerMinute,
    TokensPerDay,
    ConcurrentRequests,
    Memory,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::RequestsPerMinute => "requestsPerMinute",
            ResourceKind::RequestsPerDay => "requestsPerDay",
            ResourceKind::TokensPerMinute => "tokensPerMinute",
            ResourceKind::TokensPerDay => "tokensPerDay",
            ResourceKind::ConcurrentRequests => "concurrentRequests",
            ResourceKind::Memory => "memory",
        }
    }
}

/// Fired when a commit observes `actual > estimated` on some dimension.
/// Not an error: the counter absorbs the overage in its current window.
#[derive(Debug, Clone)]
pub struct OverageEvent {
    pub model_id: ModelId,
    pub resource: ResourceKind,
    pub estimated: u64,
    pub actual: u64,
    pub overage: u64,
}

pub type OverageCallback = std::sync::Arc<dyn Fn(&OverageEvent) + Send + Sync>;
