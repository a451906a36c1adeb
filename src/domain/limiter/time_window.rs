use std::sync::Mutex;

use crate::domain::clock::SharedClock;

/// Handle returned by a successful [`TimeWindowCounter::reserve`].
///
/// Carries the reserved amount and the window-start stamp observed at
/// reservation time, so a later commit can tell whether the window has
/// rolled in between. A refund against a rolled window is dropped; an
/// overage against a rolled window lands in the new window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReservation {
    pub amount: u64,
    pub window_start: i64,
}

#[derive(Debug)]
struct WindowState {
    window_start: i64,
    current: u64,
}

/// Monotonic usage counter over a rolling window of `window_ms`
/// (one minute or one day).
///
/// The window start is always aligned to a multiple of `window_ms`, so
/// every instance of the fleet agrees on window identity without
/// coordination. Roll-over happens lazily on the next access.
#[derive(Debug)]
pub struct TimeWindowCounter {
    limit: u64,
    window_ms: i64,
    clock: SharedClock,
    state: Mutex<WindowState>,
}

impl TimeWindowCounter {
    pub fn new(limit: u64, window_ms: i64, clock: SharedClock) -> TimeWindowCounter {
        let now = clock.now_ms();
        TimeWindowCounter {
            limit,
            window_ms,
            clock,
            state: Mutex::new(WindowState { window_start: align(now, window_ms), current: 0 }),
        }
    }

    /// Largest multiple of `window_ms` not exceeding `now`; resets
    /// `current` when the boundary is crossed. Idempotent: concurrent
    /// reserves observing the same roll-over both see the post-reset state.
    fn roll(&self, state: &mut WindowState) {
        let now = self.clock.now_ms();
        if now - state.window_start >= self.window_ms {
            state.window_start = align(now, self.window_ms);
            state.current = 0;
        }
    }

    pub fn reserve(&self, amount: u64) -> Option<WindowReservation> {
        let mut state = self.state.lock().unwrap();
        self.roll(&mut state);

        if state.current + amount <= self.limit {
            state.current += amount;
            Some(WindowReservation { amount, window_start: state.window_start })
        } else {
            None
        }
    }

    /// Reconciles a reservation against actual usage.
    ///
    /// Returns the applied delta (`actual - reserved`, clamped to what the
    /// counter could absorb), which feeds the availability adjustment event.
    pub fn commit(&self, reservation: &WindowReservation, actual: u64) -> i64 {
        let mut state = self.state.lock().unwrap();
        self.roll(&mut state);

        let delta = actual as i64 - reservation.amount as i64;

        if state.window_start == reservation.window_start {
            let next = state.current as i64 + delta;
            state.current = next.max(0) as u64;
            delta
        } else if delta > 0 {
            // The window rolled while the job ran: the overage belongs to
            // the window the job finished in. Refunds of a rolled window
            // are dropped.
            state.current += delta as u64;
            delta
        } else {
            0
        }
    }

    pub fn refund(&self, reservation: &WindowReservation) -> i64 {
        self.commit(reservation, 0)
    }

    pub fn remaining(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        self.roll(&mut state);
        self.limit.saturating_sub(state.current)
    }

    pub fn resets_in_ms(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        self.roll(&mut state);
        self.window_ms - (self.clock.now_ms() - state.window_start)
    }

    pub fn current(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        self.roll(&mut state);
        state.current
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_start(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        self.roll(&mut state);
        state.window_start
    }
}

fn align(now: i64, window_ms: i64) -> i64 {
    now - now.rem_euclid(window_ms)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::config::MINUTE_MS;

    fn counter(limit: u64) -> (TimeWindowCounter, ManualClock) {
        let clock = ManualClock::new(10 * MINUTE_MS);
        (TimeWindowCounter::new(limit, MINUTE_MS, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn reserve_up_to_limit_then_rejects() {
        let (counter, _clock) = counter(100);
        assert!(counter.reserve(60).is_some());
        assert!(counter.reserve(40).is_some());
        assert!(counter.reserve(1).is_none());
        assert_eq!(counter.remaining(), 0);
    }

    #[test]
    fn window_roll_resets_current() {
        let (counter, clock) = counter(100);
        counter.reserve(100).unwrap();
        assert!(counter.reserve(1).is_none());

        clock.advance(MINUTE_MS);
        assert!(counter.reserve(1).is_some());
        assert_eq!(counter.current(), 1);
    }

    #[test]
    fn window_start_stays_aligned() {
        let (counter, clock) = counter(100);
        clock.advance(MINUTE_MS + 17_000);
        assert_eq!(counter.window_start() % MINUTE_MS, 0);
    }

    #[test]
    fn commit_with_same_actual_is_neutral() {
        let (counter, _clock) = counter(100);
        let reservation = counter.reserve(40).unwrap();
        counter.commit(&reservation, 40);
        assert_eq!(counter.current(), 40);
    }

    #[test]
    fn refund_restores_current_exactly() {
        let (counter, _clock) = counter(100);
        let reservation = counter.reserve(40).unwrap();
        counter.refund(&reservation);
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn overage_is_absorbed_beyond_the_limit() {
        let (counter, _clock) = counter(100);
        let reservation = counter.reserve(80).unwrap();
        counter.commit(&reservation, 130);
        assert_eq!(counter.current(), 130);
        assert_eq!(counter.remaining(), 0);
    }

    #[test]
    fn refund_after_roll_is_dropped() {
        let (counter, clock) = counter(100);
        let reservation = counter.reserve(80).unwrap();
        clock.advance(MINUTE_MS);
        counter.refund(&reservation);
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.remaining(), 100);
    }

    #[test]
    fn overage_after_roll_lands_in_the_new_window() {
        let (counter, clock) = counter(100);
        let reservation = counter.reserve(80).unwrap();
        clock.advance(MINUTE_MS);
        counter.commit(&reservation, 95);
        // Only the 15-token overage belongs to the new window.
        assert_eq!(counter.current(), 15);
    }

    #[test]
    fn resets_in_ms_counts_down() {
        let (counter, clock) = counter(100);
        clock.advance(20_000);
        assert_eq!(counter.resets_in_ms(), MINUTE_MS - 20_000);
    }
}
