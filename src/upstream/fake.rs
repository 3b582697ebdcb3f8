//! In-memory stand-in for `HttpUpstreamClient`, used by both unit and
//! integration tests to drive deterministic ticks without a network.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::model::{Event, Fixture, TeamStats};
use crate::upstream::budget::{BudgetDecision, UpstreamBudget};
use crate::upstream::client::{UpstreamClient, UpstreamError};

#[derive(Default)]
struct FakeState {
    live: Vec<Fixture>,
    stats: HashMap<String, (TeamStats, TeamStats, u32)>,
    events: HashMap<String, Vec<Event>>,
    lineups: HashMap<String, bool>,
    calls: u32,
}

/// A scriptable upstream client: tests push fixtures/stats/events into it
/// ahead of time, then drive the ingestion pipeline against it directly.
///
/// The per-fixture detail calls (`fixture_stats`/`fixture_events`/
/// `fixture_lineups`) are gated by an optional `UpstreamBudget`, the same
/// rolling-window limiter `HttpUpstreamClient` uses, so tests can exercise
/// budget exhaustion end to end. `list_live`/`list_by_date` are left
/// ungated: they are cheap index calls, not the per-fixture detail fetches
/// the budget exists to ration.
pub struct FakeUpstreamClient {
    state: Mutex<FakeState>,
    budget: Option<UpstreamBudget>,
}

impl FakeUpstreamClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            budget: None,
        }
    }

    /// A fake client whose detail fetches are rationed by a real
    /// `UpstreamBudget` of `capacity_per_hour`, with no minimum spacing
    /// delay.
    pub fn with_budget(capacity_per_hour: u32) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            budget: Some(UpstreamBudget::new(capacity_per_hour, Duration::from_millis(0))),
        }
    }

    pub fn push_live_fixture(&self, fixture: Fixture) {
        self.state.lock().live.push(fixture);
    }

    pub fn set_stats(&self, fixture_id: &str, home: TeamStats, away: TeamStats, elapsed: u32) {
        self.state
            .lock()
            .stats
            .insert(fixture_id.to_string(), (home, away, elapsed));
    }

    pub fn set_events(&self, fixture_id: &str, events: Vec<Event>) {
        self.state.lock().events.insert(fixture_id.to_string(), events);
    }

    pub fn set_lineups_available(&self, fixture_id: &str, available: bool) {
        self.state
            .lock()
            .lineups
            .insert(fixture_id.to_string(), available);
    }

    pub fn call_count(&self) -> u32 {
        self.state.lock().calls
    }

    /// Consumes `calls` units of budget directly, for tests simulating a
    /// budget already mostly spent by prior activity.
    pub fn drain_budget(&self, calls: u32) {
        if let Some(budget) = &self.budget {
            for _ in 0..calls {
                budget.record_call();
            }
        }
    }

    fn consume_detail_budget(&self) -> Result<(), UpstreamError> {
        let Some(budget) = &self.budget else { return Ok(()) };
        match budget.check() {
            BudgetDecision::Exceeded => Err(UpstreamError::BudgetExceeded),
            BudgetDecision::WaitForSpacing(_) | BudgetDecision::Allowed => {
                budget.record_call();
                Ok(())
            }
        }
    }
}

impl Default for FakeUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamClient for FakeUpstreamClient {
    async fn list_live(&self) -> Result<Vec<Fixture>, UpstreamError> {
        let mut state = self.state.lock();
        state.calls += 1;
        Ok(state.live.clone())
    }

    async fn list_by_date(&self, _date: chrono::NaiveDate) -> Result<Vec<Fixture>, UpstreamError> {
        let mut state = self.state.lock();
        state.calls += 1;
        Ok(state.live.clone())
    }

    async fn fixture_stats(&self, fixture_id: &str) -> Result<(TeamStats, TeamStats, u32), UpstreamError> {
        self.consume_detail_budget()?;
        let mut state = self.state.lock();
        state.calls += 1;
        state
            .stats
            .get(fixture_id)
            .cloned()
            .ok_or_else(|| UpstreamError::NotFound {
                fixture_id: fixture_id.to_string(),
            })
    }

    async fn fixture_events(&self, fixture_id: &str) -> Result<Vec<Event>, UpstreamError> {
        self.consume_detail_budget()?;
        let mut state = self.state.lock();
        state.calls += 1;
        Ok(state.events.get(fixture_id).cloned().unwrap_or_default())
    }

    async fn fixture_lineups(&self, fixture_id: &str) -> Result<bool, UpstreamError> {
        self.consume_detail_budget()?;
        let mut state = self.state.lock();
        state.calls += 1;
        Ok(state.lineups.get(fixture_id).copied().unwrap_or(false))
    }

    fn budget_remaining(&self) -> u32 {
        self.budget.as_ref().map(|b| b.remaining()).unwrap_or(u32::MAX)
    }
}
