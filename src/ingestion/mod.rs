//! Periodic polling loop: fetch the live fixture list, cap to the monitored
//! limit, fetch at a status-driven detail level through a bounded worker
//! pool, diff events against the prior snapshot, and publish into the
//! Snapshot Store.
//!
//! A `tokio::sync::Semaphore`-bounded worker pool with inter-dispatch
//! spacing: each fixture fetch runs on its own spawned task, gated by the
//! semaphore permit, and results are gathered back with `JoinHandle::await`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::model::{DetailLevel, Event, Fixture};
use crate::patterns;
use crate::store::SnapshotStore;
use crate::upstream::{UpstreamClient, UpstreamError};
use crate::model::Snapshot;

#[derive(Default)]
pub struct IngestionCounters {
    pub over_capacity: AtomicU64,
    pub skipped_ttl: AtomicU64,
    pub stale_served: AtomicU64,
    pub fetch_errors: AtomicU64,
}

pub struct IngestionPipeline {
    upstream: Arc<dyn UpstreamClient>,
    store: SnapshotStore,
    max_monitored_fixtures: usize,
    concurrency: usize,
    pub counters: Arc<IngestionCounters>,
}

const INTER_DISPATCH_SPACING: Duration = Duration::from_millis(100);

impl IngestionPipeline {
    pub fn new(upstream: Arc<dyn UpstreamClient>, store: SnapshotStore, max_monitored_fixtures: usize, concurrency: usize) -> Self {
        Self {
            upstream,
            store,
            max_monitored_fixtures,
            concurrency: concurrency.max(1),
            counters: Arc::new(IngestionCounters::default()),
        }
    }

    /// Runs one ingestion tick, returning the fixture ids that received a
    /// fresh snapshot this tick (i.e. are ready for downstream evaluation).
    pub async fn run_tick(&self) -> Vec<String> {
        let live = match self.upstream.list_live().await {
            Ok(fixtures) => fixtures,
            Err(UpstreamError::BudgetExceeded) => {
                debug!("upstream budget exhausted at list_live; skipping tick fetch");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "failed to list live fixtures");
                self.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
        };

        let capped: Vec<Fixture> = if live.len() > self.max_monitored_fixtures {
            let dropped = live.len() - self.max_monitored_fixtures;
            self.counters.over_capacity.fetch_add(dropped as u64, Ordering::Relaxed);
            live.into_iter().take(self.max_monitored_fixtures).collect()
        } else {
            live
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();

        for fixture in capped {
            if self.store.is_fresh(&fixture.fixture_id) {
                self.counters.skipped_ttl.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let semaphore = semaphore.clone();
            let upstream = self.upstream.clone();
            let store = self.store.clone();
            let counters = self.counters.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                tokio::time::sleep(INTER_DISPATCH_SPACING).await;
                fetch_and_store(upstream.as_ref(), store, counters, fixture).await
            }));
        }

        let mut updated = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Some(fixture_id)) => updated.push(fixture_id),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "ingestion worker task panicked"),
            }
        }

        self.store.evict_expired();
        updated
    }

    pub fn budget_remaining(&self) -> u32 {
        self.upstream.budget_remaining()
    }
}

async fn fetch_and_store(
    upstream: &dyn UpstreamClient,
    store: SnapshotStore,
    counters: Arc<IngestionCounters>,
    fixture: Fixture,
) -> Option<String> {
    let detail = DetailLevel::for_status(fixture.status);
    let fixture_id = fixture.fixture_id.clone();

    let (home, away, elapsed, new_raw_events, lineups_available) = match detail {
        DetailLevel::Basic => {
            let prior = store.get(&fixture_id);
            let (home, away) = prior
                .as_ref()
                .map(|s| (s.home.clone(), s.away.clone()))
                .unwrap_or_default();
            (home, away, fixture.elapsed, Vec::new(), false)
        }
        DetailLevel::Detailed | DetailLevel::Full => {
            let stats = match upstream.fixture_stats(&fixture_id).await {
                Ok(s) => s,
                Err(UpstreamError::BudgetExceeded) => return serve_stale(&counters, &store, &fixture_id),
                Err(e) => {
                    warn!(fixture_id = %fixture_id, error = %e, "fixture_stats failed; serving cached snapshot");
                    return serve_stale(&counters, &store, &fixture_id);
                }
            };
            let events = match upstream.fixture_events(&fixture_id).await {
                Ok(e) => e,
                Err(e) => {
                    warn!(fixture_id = %fixture_id, error = %e, "fixture_events failed");
                    Vec::new()
                }
            };
            let lineups_available = if detail == DetailLevel::Full {
                upstream.fixture_lineups(&fixture_id).await.unwrap_or(false)
            } else {
                false
            };
            (stats.0, stats.1, stats.2, events, lineups_available)
        }
    };

    let prior = store.get(&fixture_id);
    let prior_events: Vec<Event> = prior.as_ref().map(|s| s.raw_events.clone()).unwrap_or_default();
    let diffed = diff_new_events(&prior_events, &new_raw_events);

    let mut buffer = prior_events;
    patterns::push_events(&mut buffer, diffed);

    let snapshot = Snapshot {
        fixture_id: fixture_id.clone(),
        observed_at: chrono::Utc::now(),
        status: fixture.status,
        elapsed,
        home,
        away,
        weather: prior.as_ref().and_then(|s| s.weather.clone()),
        lineups_available,
        raw_events: buffer,
        player_stats: prior.map(|s| s.player_stats.clone()).unwrap_or_default(),
    };

    store.put(fixture, snapshot);
    Some(fixture_id)
}

fn serve_stale(counters: &IngestionCounters, store: &SnapshotStore, fixture_id: &str) -> Option<String> {
    if store.get(fixture_id).is_some() {
        counters.stale_served.fetch_add(1, Ordering::Relaxed);
        Some(fixture_id.to_string())
    } else {
        None
    }
}

/// Events the provider now reports that were not present in the prior list,
/// identified by `(minute, kind, team, player_id)` identity.
fn diff_new_events(prior: &[Event], fresh: &[Event]) -> Vec<Event> {
    let seen: HashSet<(u32, String, String, Option<String>)> = prior
        .iter()
        .map(|e| (e.minute, format!("{:?}", e.kind), format!("{:?}", e.team), e.player_id.clone()))
        .collect();

    fresh
        .iter()
        .filter(|e| !seen.contains(&(e.minute, format!("{:?}", e.kind), format!("{:?}", e.team), e.player_id.clone())))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, Fixture, FixtureStatus, Team, TeamStats};
    use crate::upstream::FakeUpstreamClient;
    use chrono::Utc;

    fn live_fixture(id: &str) -> Fixture {
        Fixture {
            fixture_id: id.to_string(),
            home_team: "Home".to_string(),
            away_team: "Away".to_string(),
            league: "L".to_string(),
            venue: None,
            referee: None,
            scheduled_start: Utc::now(),
            status: FixtureStatus::Live1h,
            elapsed: 30,
        }
    }

    #[tokio::test]
    async fn caps_to_max_monitored_and_counts_over_capacity() {
        let upstream = Arc::new(FakeUpstreamClient::new());
        for i in 0..5 {
            upstream.push_live_fixture(live_fixture(&format!("f{i}")));
            upstream.set_stats(&format!("f{i}"), TeamStats::default().with_defaults(), TeamStats::default().with_defaults(), 30);
        }
        let store = SnapshotStore::new();
        let pipeline = IngestionPipeline::new(upstream, store.clone(), 2, 5);

        let updated = pipeline.run_tick().await;
        assert_eq!(updated.len(), 2);
        assert_eq!(pipeline.counters.over_capacity.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn skips_fetch_when_cache_is_fresh() {
        let upstream = Arc::new(FakeUpstreamClient::new());
        upstream.push_live_fixture(live_fixture("f1"));
        upstream.set_stats("f1", TeamStats::default().with_defaults(), TeamStats::default().with_defaults(), 30);
        let store = SnapshotStore::new();
        let pipeline = IngestionPipeline::new(upstream.clone(), store.clone(), 20, 5);

        pipeline.run_tick().await;
        let updated = pipeline.run_tick().await;
        assert!(updated.is_empty());
        assert_eq!(pipeline.counters.skipped_ttl.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn diff_only_returns_new_events() {
        let prior = vec![Event {
            fixture_id: "f1".to_string(),
            minute: 10,
            kind: EventType::Goal,
            team: Team::Home,
            player_id: None,
        }];
        let fresh = vec![
            prior[0].clone(),
            Event {
                fixture_id: "f1".to_string(),
                minute: 20,
                kind: EventType::Yellow,
                team: Team::Away,
                player_id: None,
            },
        ];
        let diffed = diff_new_events(&prior, &fresh);
        assert_eq!(diffed.len(), 1);
        assert_eq!(diffed[0].minute, 20);
    }
}
