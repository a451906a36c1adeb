use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::domain::util::id::ModelId;

/// Remaining whole-job capacity of one model, as last observed.
///
/// Optional fields are `None` when the dimension is not configured for
/// the model. `slots` is the number of whole jobs of the triggering job
/// type that could still be admitted across every configured dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub slots: u64,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub concurrent_requests: Option<u64>,
    #[serde(rename = "memoryKB")]
    pub memory_kb: Option<u64>,
}

/// Why an availability snapshot changed. Ordered by precedence: the
/// first applicable reason is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Adjustment,
    TokensMinute,
    TokensDay,
    RequestsMinute,
    RequestsDay,
    ConcurrentRequests,
    Memory,
    Distributed,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::Adjustment => "adjustment",
            ChangeReason::TokensMinute => "tokensMinute",
            ChangeReason::TokensDay => "tokensDay",
            ChangeReason::RequestsMinute => "requestsMinute",
            ChangeReason::RequestsDay => "requestsDay",
            ChangeReason::ConcurrentRequests => "concurrentRequests",
            ChangeReason::Memory => "memory",
            ChangeReason::Distributed => "distributed",
        }
    }
}

/// Per-dimension `actual - reserved` deltas of a commit. Memory and
/// concurrency are never post-adjusted, so their deltas stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdjustmentDelta {
    pub tokens_per_minute: i64,
    pub tokens_per_day: i64,
    pub requests_per_minute: i64,
    pub requests_per_day: i64,
    pub concurrent_requests: i64,
    pub memory_kb: i64,
}

impl AdjustmentDelta {
    pub fn is_zero(&self) -> bool {
        *self == AdjustmentDelta::default()
    }
}

pub type AvailabilityCallback =
    Arc<dyn Fn(&Availability, ChangeReason, &ModelId, Option<&AdjustmentDelta>) + Send + Sync>;

/// Keeps the last emitted snapshot per model and suppresses emissions
/// that would repeat it.
pub struct AvailabilityTracker {
    last: Mutex<HashMap<ModelId, Availability>>,
    callback: Mutex<Option<AvailabilityCallback>>,
}

impl std::fmt::Debug for AvailabilityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityTracker").field("last", &self.last).finish()
    }
}

impl AvailabilityTracker {
    pub fn new() -> AvailabilityTracker {
        AvailabilityTracker { last: Mutex::new(HashMap::new()), callback: Mutex::new(None) }
    }

    pub fn set_callback(&self, callback: AvailabilityCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Emits the snapshot if any field differs from the last one for this
    /// model. Returns whether an emission happened.
    pub fn publish(
        &self,
        model_id: &ModelId,
        availability: Availability,
        reason: ChangeReason,
        adjustment: Option<&AdjustmentDelta>,
    ) -> bool {
        {
            let mut last = self.last.lock().unwrap();
            match last.get(model_id) {
                Some(previous) if *previous == availability => return false,
                _ => {
                    last.insert(model_id.clone(), availability);
                }
            }
        }

        log::debug!(
            "Availability of model {} changed ({}): {} slots.",
            model_id,
            reason.as_str(),
            availability.slots
        );

        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&availability, reason, model_id, adjustment);
        }
        true
    }

    pub fn last(&self, model_id: &ModelId) -> Option<Availability> {
        self.last.lock().unwrap().get(model_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(slots: u64) -> Availability {
        Availability { slots, tokens_per_minute: Some(1_000), ..Default::default() }
    }

    #[test]
    fn identical_snapshots_are_suppressed() {
        let tracker = AvailabilityTracker::new();
        let emitted = Arc::new(AtomicUsize::new(0));
        let counter = emitted.clone();
        tracker.set_callback(Arc::new(move |_, _, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let model = ModelId::new("gpt");
        assert!(tracker.publish(&model, snapshot(5), ChangeReason::TokensMinute, None));
        assert!(!tracker.publish(&model, snapshot(5), ChangeReason::TokensMinute, None));
        assert!(tracker.publish(&model, snapshot(4), ChangeReason::Adjustment, None));
        assert_eq!(emitted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn models_are_tracked_independently() {
        let tracker = AvailabilityTracker::new();
        let a = ModelId::new("a");
        let b = ModelId::new("b");
        assert!(tracker.publish(&a, snapshot(1), ChangeReason::Memory, None));
        assert!(tracker.publish(&b, snapshot(1), ChangeReason::Memory, None));
        assert!(!tracker.publish(&a, snapshot(1), ChangeReason::Memory, None));
    }
}
