use std::sync::Mutex;

use crate::domain::availability::AdjustmentDelta;
use crate::domain::clock::SharedClock;
use crate::domain::config::{DAY_MS, MINUTE_MS, ModelConfig};
use crate::domain::limiter::semaphore::{FifoSemaphore, Permit};
use crate::domain::limiter::time_window::{TimeWindowCounter, WindowReservation};
use crate::domain::usage::{OverageEvent, ResourceKind, ResourceRequest, UsageReport};
use crate::domain::util::id::ModelId;

/// Window-start stamps taken at reservation time, forwarded to the
/// distributed allocator on release so global usage lands in the right
/// window keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStarts {
    pub minute: i64,
    pub day: i64,
}

/// Everything a successful [`ModelLimiter::try_reserve`] pinned down.
/// Destroyed by exactly one of `commit`, `refund` or `abandon`.
#[derive(Debug)]
pub struct ModelReservation {
    pub model_id: ModelId,
    pub estimated: ResourceRequest,
    rpm: Option<WindowReservation>,
    rpd: Option<WindowReservation>,
    tpm: Option<WindowReservation>,
    tpd: Option<WindowReservation>,
    concurrency_permit: Option<Permit>,
    memory_permit: Option<Permit>,
    window_starts: WindowStarts,
}

impl ModelReservation {
    pub fn window_starts(&self) -> WindowStarts {
        self.window_starts
    }
}

/// Per-model remaining capacity, one entry per configured dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemainingCapacity {
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub concurrent_requests: Option<u64>,
}

/// Composes the configured time-window counters with the per-model
/// concurrency semaphore and the shared memory semaphore behind one
/// reserve/commit/refund contract.
///
/// Reservation is two-phase: all counters are taken atomically (any
/// failure unwinds the ones already taken), then the semaphores are
/// try-acquired. A semaphore that would block fails the reservation and
/// unwinds the counters.
#[derive(Debug)]
pub struct ModelLimiter {
    model_id: ModelId,
    clock: SharedClock,
    rpm: Option<TimeWindowCounter>,
    rpd: Option<TimeWindowCounter>,
    tpm: Option<TimeWindowCounter>,
    tpd: Option<TimeWindowCounter>,
    concurrency: Option<FifoSemaphore>,
    memory: Option<FifoSemaphore>,
    /// Serializes the counter phase so no concurrent reserve observes a
    /// partially unwound state.
    admission: Mutex<()>,
}

impl ModelLimiter {
    pub fn new(
        model_id: ModelId,
        config: &ModelConfig,
        clock: SharedClock,
        memory: Option<FifoSemaphore>,
    ) -> ModelLimiter {
        ModelLimiter {
            rpm: config
                .requests_per_minute
                .map(|limit| TimeWindowCounter::new(limit, MINUTE_MS, clock.clone())),
            rpd: config
                .requests_per_day
                .map(|limit| TimeWindowCounter::new(limit, DAY_MS, clock.clone())),
            tpm: config
                .tokens_per_minute
                .map(|limit| TimeWindowCounter::new(limit, MINUTE_MS, clock.clone())),
            tpd: config
                .tokens_per_day
                .map(|limit| TimeWindowCounter::new(limit, DAY_MS, clock.clone())),
            concurrency: config.max_concurrent_requests.map(FifoSemaphore::new),
            memory,
            admission: Mutex::new(()),
            model_id,
            clock,
        }
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    pub fn try_reserve(&self, request: &ResourceRequest) -> Option<ModelReservation> {
        let _admission = self.admission.lock().unwrap();

        // Phase 1: all configured counters, in a fixed order. Any failure
        // rolls back the ones already taken before anyone else can look.
        let mut taken: Vec<(&TimeWindowCounter, WindowReservation)> = Vec::with_capacity(4);
        let plan = [
            (&self.rpm, request.requests),
            (&self.rpd, request.requests),
            (&self.tpm, request.tokens),
            (&self.tpd, request.tokens),
        ];

        let mut stamps: [Option<WindowReservation>; 4] = [None; 4];
        for (slot, (counter, amount)) in plan.iter().enumerate() {
            if let Some(counter) = counter {
                match counter.reserve(*amount) {
                    Some(reservation) => {
                        taken.push((counter, reservation));
                        stamps[slot] = Some(reservation);
                    }
                    None => {
                        unwind(&taken);
                        return None;
                    }
                }
            }
        }
        let [rpm, rpd, tpm, tpd] = stamps;

        // Phase 2: semaphores. A would-block answer fails the whole
        // reservation.
        let concurrency_permit = match &self.concurrency {
            None => None,
            Some(semaphore) => match semaphore.try_acquire(1) {
                Some(permit) => Some(permit),
                None => {
                    unwind(&taken);
                    return None;
                }
            },
        };

        let memory_permit = match (&self.memory, request.memory_kb) {
            (Some(semaphore), kb) if kb > 0 => match semaphore.try_acquire(kb) {
                Some(permit) => Some(permit),
                None => {
                    drop(concurrency_permit);
                    unwind(&taken);
                    return None;
                }
            },
            _ => None,
        };

        let now = self.clock.now_ms();
        let window_starts = WindowStarts {
            minute: tpm
                .or(rpm)
                .map(|r| r.window_start)
                .unwrap_or_else(|| now - now.rem_euclid(MINUTE_MS)),
            day: tpd
                .or(rpd)
                .map(|r| r.window_start)
                .unwrap_or_else(|| now - now.rem_euclid(DAY_MS)),
        };

        Some(ModelReservation {
            model_id: self.model_id.clone(),
            estimated: *request,
            rpm,
            rpd,
            tpm,
            tpd,
            concurrency_permit,
            memory_permit,
            window_starts,
        })
    }

    /// Advisory, non-reserving check across all configured dimensions.
    pub fn has_capacity(&self, request: &ResourceRequest) -> bool {
        let window_ok = |counter: &Option<TimeWindowCounter>, amount: u64| match counter {
            None => true,
            Some(counter) => counter.remaining() >= amount,
        };

        // A job that requests no memory never touches the shared memory
        // semaphore, and a model without one is unconstrained; only a
        // non-zero request against a configured semaphore is checked.
        let memory_ok = request.memory_kb == 0
            || self.memory.as_ref().map_or(true, |s| {
                s.available() >= request.memory_kb as i64 && s.waiting() == 0
            });

        window_ok(&self.rpm, request.requests)
            && window_ok(&self.rpd, request.requests)
            && window_ok(&self.tpm, request.tokens)
            && window_ok(&self.tpd, request.tokens)
            && self.concurrency.as_ref().map_or(true, |s| s.available() >= 1 && s.waiting() == 0)
            && memory_ok
    }

    /// Reconciles the reservation against actual usage, releases the
    /// semaphores, and returns the per-dimension deltas plus any overage
    /// events.
    pub fn commit(
        &self,
        reservation: ModelReservation,
        usage: &UsageReport,
    ) -> (AdjustmentDelta, Vec<OverageEvent>) {
        let actual_tokens = usage.tokens.total();
        let actual_requests = usage.requests.unwrap_or(reservation.estimated.requests);

        let mut delta = AdjustmentDelta::default();
        if let (Some(counter), Some(res)) = (&self.rpm, &reservation.rpm) {
            delta.requests_per_minute = counter.commit(res, actual_requests);
        }
        if let (Some(counter), Some(res)) = (&self.rpd, &reservation.rpd) {
            delta.requests_per_day = counter.commit(res, actual_requests);
        }
        if let (Some(counter), Some(res)) = (&self.tpm, &reservation.tpm) {
            delta.tokens_per_minute = counter.commit(res, actual_tokens);
        }
        if let (Some(counter), Some(res)) = (&self.tpd, &reservation.tpd) {
            delta.tokens_per_day = counter.commit(res, actual_tokens);
        }

        let overages = self.collect_overages(&reservation, actual_tokens, actual_requests);

        // Permits drop here and release concurrency + memory.
        drop(reservation);

        (delta, overages)
    }

    /// Equivalent to a commit with zero actual usage.
    pub fn refund(&self, reservation: ModelReservation) -> AdjustmentDelta {
        let (delta, _) = self.commit(
            reservation,
            &UsageReport { tokens: Default::default(), requests: Some(0) },
        );
        delta
    }

    /// Failure path for a job that died without reporting usage: the
    /// semaphores are always released, the time-window reservations stay
    /// unless `refund_windows` is set, so an unobservable failure cannot
    /// hide overuse.
    pub fn abandon(&self, reservation: ModelReservation, refund_windows: bool) {
        if refund_windows {
            self.refund(reservation);
        } else {
            drop(reservation);
        }
    }

    fn collect_overages(
        &self,
        reservation: &ModelReservation,
        actual_tokens: u64,
        actual_requests: u64,
    ) -> Vec<OverageEvent> {
        let mut events = Vec::new();
        let mut push = |resource: ResourceKind, estimated: u64, actual: u64| {
            if actual > estimated {
                events.push(OverageEvent {
                    model_id: self.model_id.clone(),
                    resource,
                    estimated,
                    actual,
                    overage: actual - estimated,
                });
            }
        };

        if reservation.tpm.is_some() {
            push(ResourceKind::TokensPerMinute, reservation.estimated.tokens, actual_tokens);
        }
        if reservation.tpd.is_some() {
            push(ResourceKind::TokensPerDay, reservation.estimated.tokens, actual_tokens);
        }
        if reservation.rpm.is_some() {
            push(ResourceKind::RequestsPerMinute, reservation.estimated.requests, actual_requests);
        }
        if reservation.rpd.is_some() {
            push(ResourceKind::RequestsPerDay, reservation.estimated.requests, actual_requests);
        }
        events
    }

    pub fn remaining(&self) -> RemainingCapacity {
        RemainingCapacity {
            tokens_per_minute: self.tpm.as_ref().map(TimeWindowCounter::remaining),
            tokens_per_day: self.tpd.as_ref().map(TimeWindowCounter::remaining),
            requests_per_minute: self.rpm.as_ref().map(TimeWindowCounter::remaining),
            requests_per_day: self.rpd.as_ref().map(TimeWindowCounter::remaining),
            concurrent_requests: self.concurrency.as_ref().map(|s| s.available().max(0) as u64),
        }
    }

    pub fn memory_available_kb(&self) -> Option<u64> {
        self.memory.as_ref().map(|s| s.available().max(0) as u64)
    }

    pub fn close(&self) {
        if let Some(semaphore) = &self.concurrency {
            semaphore.close();
        }
    }
}

fn unwind(taken: &[(&TimeWindowCounter, WindowReservation)]) {
    for (counter, reservation) in taken {
        counter.refund(reservation);
    }
}
