//! Global hourly call budget for the upstream provider.
//!
//! A single shared token bucket guarded by a mutex: a sliding-window
//! rate limiter generalized from per-key buckets to one process-wide
//! bucket plus a minimum inter-request delay.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tracks call timestamps in a rolling 60-minute window and enforces a
/// minimum spacing between consecutive calls.
pub struct UpstreamBudget {
    capacity_per_hour: u32,
    min_delay: Duration,
    state: Mutex<BudgetState>,
}

struct BudgetState {
    call_times: VecDeque<Instant>,
    last_call: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Allowed,
    /// Caller must wait this long before the minimum inter-request delay is satisfied.
    WaitForSpacing(Duration),
    /// The hourly budget is exhausted; callers must fail fast.
    Exceeded,
}

impl UpstreamBudget {
    pub fn new(capacity_per_hour: u32, min_delay: Duration) -> Self {
        Self {
            capacity_per_hour,
            min_delay,
            state: Mutex::new(BudgetState {
                call_times: VecDeque::new(),
                last_call: None,
            }),
        }
    }

    fn prune(state: &mut BudgetState, now: Instant) {
        let window = Duration::from_secs(3600);
        while let Some(&front) = state.call_times.front() {
            if now.duration_since(front) >= window {
                state.call_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Check whether a call may proceed right now, without consuming budget.
    pub fn check(&self) -> BudgetDecision {
        let now = Instant::now();
        let mut state = self.state.lock();
        Self::prune(&mut state, now);

        if let Some(last) = state.last_call {
            let elapsed = now.duration_since(last);
            if elapsed < self.min_delay {
                return BudgetDecision::WaitForSpacing(self.min_delay - elapsed);
            }
        }

        if state.call_times.len() as u32 >= self.capacity_per_hour {
            return BudgetDecision::Exceeded;
        }

        BudgetDecision::Allowed
    }

    /// Record a call as having been made (consumes one unit of budget).
    pub fn record_call(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        Self::prune(&mut state, now);
        state.call_times.push_back(now);
        state.last_call = Some(now);
    }

    /// Calls remaining in the current rolling hour.
    pub fn remaining(&self) -> u32 {
        let now = Instant::now();
        let mut state = self.state.lock();
        Self::prune(&mut state, now);
        self.capacity_per_hour
            .saturating_sub(state.call_times.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_capacity_calls() {
        let budget = UpstreamBudget::new(3, Duration::from_millis(0));
        for _ in 0..3 {
            assert_eq!(budget.check(), BudgetDecision::Allowed);
            budget.record_call();
        }
        assert_eq!(budget.check(), BudgetDecision::Exceeded);
    }

    #[test]
    fn enforces_minimum_spacing() {
        let budget = UpstreamBudget::new(100, Duration::from_millis(50));
        budget.record_call();
        match budget.check() {
            BudgetDecision::WaitForSpacing(d) => assert!(d <= Duration::from_millis(50)),
            other => panic!("expected spacing wait, got {:?}", other),
        }
    }

    #[test]
    fn remaining_reflects_consumed_calls() {
        let budget = UpstreamBudget::new(10, Duration::from_millis(0));
        assert_eq!(budget.remaining(), 10);
        budget.record_call();
        budget.record_call();
        assert_eq!(budget.remaining(), 8);
    }
}
