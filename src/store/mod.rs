//! In-memory tiered snapshot cache keyed by fixture id.
//!
//! Single-writer (ingestion), many-reader (evaluators) access via a plain
//! `Arc<RwLock<HashMap<...>>>` rather than a lock-free map. A fixture's
//! prior snapshot is never mutated in place: replacement swaps in a fresh
//! `Arc<Snapshot>` so readers either see the old value or the new one,
//! never a torn read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::model::{Fixture, Snapshot};

struct Entry {
    fixture: Fixture,
    snapshot: Arc<Snapshot>,
    stored_at: Instant,
    finished_at: Option<Instant>,
}

/// The Snapshot Store. Cheap to clone (wraps an `Arc`), safe to share across
/// the ingestion task and every evaluator task.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

const EVICTION_AFTER_FINISHED: Duration = Duration::from_secs(2 * 3600);

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace (or insert) the snapshot for `fixture.fixture_id`, atomically.
    pub fn put(&self, fixture: Fixture, snapshot: Snapshot) {
        let finished_at = if fixture.status.is_terminal() {
            Some(Instant::now())
        } else {
            None
        };
        let mut guard = self.inner.write();
        guard.insert(
            fixture.fixture_id.clone(),
            Entry {
                fixture,
                snapshot: Arc::new(snapshot),
                stored_at: Instant::now(),
                finished_at,
            },
        );
    }

    /// Fetch the current snapshot without regard for TTL (callers that need
    /// TTL-aware staleness should use `is_fresh`).
    pub fn get(&self, fixture_id: &str) -> Option<Arc<Snapshot>> {
        self.inner.read().get(fixture_id).map(|e| e.snapshot.clone())
    }

    pub fn get_fixture(&self, fixture_id: &str) -> Option<Fixture> {
        self.inner.read().get(fixture_id).map(|e| e.fixture.clone())
    }

    /// Whether the cached snapshot for `fixture_id` is still within its
    /// status-derived TTL (i.e. ingestion may skip re-fetching it).
    pub fn is_fresh(&self, fixture_id: &str) -> bool {
        let guard = self.inner.read();
        match guard.get(fixture_id) {
            Some(entry) => {
                let ttl = Duration::from_secs(entry.fixture.status.snapshot_ttl_secs());
                entry.stored_at.elapsed() < ttl
            }
            None => false,
        }
    }

    /// Evict fixtures whose `FINISHED`/`POSTPONED` transition happened more
    /// than two hours ago. Called once per tick from the scheduler.
    pub fn evict_expired(&self) -> usize {
        let mut guard = self.inner.write();
        let before = guard.len();
        guard.retain(|_, entry| match entry.finished_at {
            Some(at) => at.elapsed() < EVICTION_AFTER_FINISHED,
            None => true,
        });
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_fixture_ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Forces the next `is_fresh` check for `fixture_id` to report stale
    /// without discarding the cached snapshot, so the next ingestion tick
    /// attempts a fresh fetch (falling back to the existing entry if that
    /// fetch fails).
    pub fn invalidate_freshness(&self, fixture_id: &str) {
        if let Some(entry) = self.inner.write().get_mut(fixture_id) {
            entry.stored_at = Instant::now() - Duration::from_secs(24 * 3600);
        }
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FixtureStatus, TeamStats};
    use chrono::Utc;

    fn fixture(id: &str, status: FixtureStatus) -> Fixture {
        Fixture {
            fixture_id: id.to_string(),
            home_team: "A".to_string(),
            away_team: "B".to_string(),
            league: "L".to_string(),
            venue: None,
            referee: None,
            scheduled_start: Utc::now(),
            status,
            elapsed: 10,
        }
    }

    fn snapshot(id: &str, status: FixtureStatus) -> Snapshot {
        Snapshot {
            fixture_id: id.to_string(),
            observed_at: Utc::now(),
            status,
            elapsed: 10,
            home: TeamStats::default().with_defaults(),
            away: TeamStats::default().with_defaults(),
            weather: None,
            lineups_available: false,
            raw_events: vec![],
            player_stats: Default::default(),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = SnapshotStore::new();
        store.put(fixture("f1", FixtureStatus::Live1h), snapshot("f1", FixtureStatus::Live1h));
        let got = store.get("f1").unwrap();
        assert_eq!(got.fixture_id, "f1");
    }

    #[test]
    fn fresh_immediately_after_put() {
        let store = SnapshotStore::new();
        store.put(fixture("f1", FixtureStatus::Live1h), snapshot("f1", FixtureStatus::Live1h));
        assert!(store.is_fresh("f1"));
    }

    #[test]
    fn unknown_fixture_is_not_fresh() {
        let store = SnapshotStore::new();
        assert!(!store.is_fresh("ghost"));
    }

    #[test]
    fn invalidate_freshness_forces_stale_without_dropping_entry() {
        let store = SnapshotStore::new();
        store.put(fixture("f1", FixtureStatus::Live1h), snapshot("f1", FixtureStatus::Live1h));
        store.invalidate_freshness("f1");
        assert!(!store.is_fresh("f1"));
        assert!(store.get("f1").is_some());
    }
}
