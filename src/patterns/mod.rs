//! Sliding per-fixture event buffer and the six-pattern detection engine.
//!
//! The event buffer itself is `Snapshot.raw_events`, capped to the last 50
//! entries by the ingestion pipeline when it diffs two snapshots — this
//! avoids keeping a second copy of match history alongside the snapshot the
//! condition evaluator already reads. `PatternEngine` tracks, per fixture
//! and pattern kind, whether a pattern's span is currently open so that it
//! is emitted exactly once per contiguous span, using the same
//! `Arc<Mutex<HashMap<...>>>` per-key state idiom as the rest of the
//! engine's shared in-memory state.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::model::{Event, EventType, MetricVector, Pattern, PatternKind, Severity, Team};

pub const EVENT_BUFFER_CAPACITY: usize = 50;

/// Default "Pattern retained 2 hours" window, used when the caller does not
/// supply one via `PatternEngine::with_retention`.
pub const DEFAULT_PATTERN_RETENTION: Duration = Duration::from_secs(7200);

/// Appends `new_events` to `buffer`, keeping at most `EVENT_BUFFER_CAPACITY`
/// entries (oldest dropped first).
pub fn push_events(buffer: &mut Vec<Event>, new_events: impl IntoIterator<Item = Event>) {
    buffer.extend(new_events);
    if buffer.len() > EVENT_BUFFER_CAPACITY {
        let excess = buffer.len() - EVENT_BUFFER_CAPACITY;
        buffer.drain(0..excess);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SpanKey {
    kind: PatternKind,
    team: Option<Team>,
}

#[derive(Debug, Clone)]
struct OpenSpan {
    started_at_minute: u32,
    last_seen_minute: u32,
    evidence: Vec<String>,
}

#[derive(Default)]
struct HistoryPoint {
    elapsed: u32,
    possession_home: f64,
    possession_away: f64,
    momentum_home: f64,
    momentum_away: f64,
}

#[derive(Default)]
struct FixtureState {
    open_spans: HashMap<SpanKey, OpenSpan>,
    history: VecDeque<HistoryPoint>,
    pressure_since: HashMap<Team, u32>,
    /// Every pattern emitted for this fixture within the retention window,
    /// backing `PatternEngine::recent_patterns`.
    emitted_log: VecDeque<(Instant, Pattern)>,
}

/// Owns cross-tick pattern state for every monitored fixture.
pub struct PatternEngine {
    fixtures: Mutex<HashMap<String, FixtureState>>,
    retention: Duration,
}

impl PatternEngine {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_PATTERN_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            fixtures: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Scans the event buffer for the six pattern kinds and returns any
    /// newly-started (or newly-escalated) patterns for this tick.
    pub fn detect(&self, fixture_id: &str, events: &[Event], metrics: &MetricVector) -> Vec<Pattern> {
        let mut fixtures = self.fixtures.lock();
        let state = fixtures.entry(fixture_id.to_string()).or_default();
        state.history.push_back(HistoryPoint {
            elapsed: metrics.elapsed,
            possession_home: metrics.home.possession,
            possession_away: metrics.away.possession,
            momentum_home: metrics.home.momentum,
            momentum_away: metrics.away.momentum,
        });
        if state.history.len() > 64 {
            state.history.pop_front();
        }

        let mut emitted = Vec::new();

        detect_goal_sequence(fixture_id, events, metrics.elapsed, state, &mut emitted);
        detect_card_sequence(fixture_id, events, metrics.elapsed, state, &mut emitted);
        detect_possession_swing(fixture_id, metrics, state, &mut emitted);
        detect_momentum_shift(fixture_id, metrics, state, &mut emitted);
        detect_pressure_buildup(fixture_id, metrics, state, &mut emitted);
        detect_time_based(fixture_id, events, metrics.elapsed, state, &mut emitted);

        escalate_overlaps(&mut emitted);

        let now = Instant::now();
        prune_emitted_log(&mut state.emitted_log, now, self.retention);
        for pattern in &emitted {
            state.emitted_log.push_back((now, pattern.clone()));
        }

        emitted
    }

    /// Pattern kinds with a currently open span for `fixture_id`, for the
    /// condition evaluator's `pattern.<kind>` predicates.
    pub fn active_kinds(&self, fixture_id: &str) -> std::collections::HashSet<PatternKind> {
        self.fixtures
            .lock()
            .get(fixture_id)
            .map(|state| state.open_spans.keys().map(|k| k.kind).collect())
            .unwrap_or_default()
    }

    /// Patterns emitted for `fixture_id` within the retention window.
    pub fn recent_patterns(&self, fixture_id: &str) -> Vec<Pattern> {
        let mut fixtures = self.fixtures.lock();
        let state = fixtures.entry(fixture_id.to_string()).or_default();
        let now = Instant::now();
        prune_emitted_log(&mut state.emitted_log, now, self.retention);
        state.emitted_log.iter().map(|(_, p)| p.clone()).collect()
    }
}

impl Default for PatternEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn open_or_extend(
    state: &mut FixtureState,
    key: SpanKey,
    now_minute: u32,
    evidence: Vec<String>,
) -> Option<u32> {
    match state.open_spans.get_mut(&key) {
        Some(span) => {
            span.last_seen_minute = now_minute;
            span.evidence = evidence;
            None
        }
        None => {
            state.open_spans.insert(
                key,
                OpenSpan {
                    started_at_minute: now_minute,
                    last_seen_minute: now_minute,
                    evidence,
                },
            );
            Some(now_minute)
        }
    }
}

fn close_if_absent(state: &mut FixtureState, key: SpanKey, still_matches: bool) {
    if !still_matches {
        state.open_spans.remove(&key);
    }
}

fn prune_emitted_log(log: &mut VecDeque<(Instant, Pattern)>, now: Instant, retention: Duration) {
    while let Some((at, _)) = log.front() {
        if now.duration_since(*at) >= retention {
            log.pop_front();
        } else {
            break;
        }
    }
}

fn make_pattern(
    fixture_id: &str,
    kind: PatternKind,
    severity: Severity,
    confidence: f64,
    started_at_minute: u32,
    ended_at_minute: Option<u32>,
    evidence: Vec<String>,
    team: Option<Team>,
) -> Pattern {
    Pattern {
        id: format!("{fixture_id}:{kind:?}:{started_at_minute}"),
        fixture_id: fixture_id.to_string(),
        kind,
        severity,
        confidence: confidence.clamp(0.0, 1.0),
        started_at_minute,
        ended_at_minute,
        evidence,
        team,
    }
}

fn detect_goal_sequence(
    fixture_id: &str,
    events: &[Event],
    now_minute: u32,
    state: &mut FixtureState,
    out: &mut Vec<Pattern>,
) {
    for team in [Team::Home, Team::Away] {
        let goals: Vec<&Event> = events
            .iter()
            .filter(|e| e.team == team && matches!(e.kind, EventType::Goal))
            .collect();
        let matches = goals.len() >= 2
            && goals
                .windows(2)
                .any(|w| w[1].minute.saturating_sub(w[0].minute) <= 10);

        let key = SpanKey {
            kind: PatternKind::GoalSequence,
            team: Some(team),
        };
        if matches {
            let evidence: Vec<String> = goals.iter().map(|g| format!("goal@{}", g.minute)).collect();
            let confidence = (evidence.len() as f64 / 2.0).min(1.0);
            let first_minute = goals.iter().map(|g| g.minute).min().unwrap_or(now_minute);
            let last_minute = goals.iter().map(|g| g.minute).max().unwrap_or(now_minute);
            if let Some(started) = open_or_extend(state, key, now_minute, evidence.clone()) {
                out.push(make_pattern(
                    fixture_id,
                    PatternKind::GoalSequence,
                    Severity::High,
                    confidence,
                    first_minute.min(started),
                    Some(last_minute),
                    evidence,
                    Some(team),
                ));
            }
        } else {
            close_if_absent(state, key, false);
        }
    }
}

fn detect_card_sequence(
    fixture_id: &str,
    events: &[Event],
    now_minute: u32,
    state: &mut FixtureState,
    out: &mut Vec<Pattern>,
) {
    let cards: Vec<&Event> = events
        .iter()
        .filter(|e| matches!(e.kind, EventType::Yellow | EventType::Red))
        .collect();
    let matches = cards.len() >= 3
        && cards
            .iter()
            .enumerate()
            .any(|(i, c)| cards[i..].iter().filter(|c2| c2.minute.saturating_sub(c.minute) <= 5).count() >= 3);

    let key = SpanKey {
        kind: PatternKind::CardSequence,
        team: None,
    };
    if matches {
        let evidence: Vec<String> = cards.iter().map(|c| format!("card@{}", c.minute)).collect();
        let confidence = (evidence.len() as f64 / 3.0).min(1.0);
        if let Some(started) = open_or_extend(state, key, now_minute, evidence.clone()) {
            out.push(make_pattern(
                fixture_id,
                PatternKind::CardSequence,
                Severity::Medium,
                confidence,
                started,
                None,
                evidence,
                None,
            ));
        }
    } else {
        close_if_absent(state, key, false);
    }
}

fn history_at_or_before(state: &FixtureState, minute: u32) -> Option<&HistoryPoint> {
    state.history.iter().rev().find(|h| h.elapsed <= minute)
}

fn detect_possession_swing(
    fixture_id: &str,
    metrics: &MetricVector,
    state: &mut FixtureState,
    out: &mut Vec<Pattern>,
) {
    let target = metrics.elapsed.saturating_sub(10);
    let Some(past) = history_at_or_before(state, target) else {
        return;
    };
    let home_delta = (metrics.home.possession - past.possession_home).abs();
    let away_delta = (metrics.away.possession - past.possession_away).abs();
    let matches = home_delta >= 20.0 || away_delta >= 20.0;

    let key = SpanKey {
        kind: PatternKind::PossessionSwing,
        team: None,
    };
    if matches {
        let evidence = vec![format!("possession_delta_home={home_delta:.1}"), format!("possession_delta_away={away_delta:.1}")];
        let confidence = (home_delta.max(away_delta) / 20.0).min(1.0);
        if let Some(started) = open_or_extend(state, key, metrics.elapsed, evidence.clone()) {
            out.push(make_pattern(
                fixture_id,
                PatternKind::PossessionSwing,
                Severity::Medium,
                confidence,
                started,
                None,
                evidence,
                None,
            ));
        }
    } else {
        close_if_absent(state, key, false);
    }
}

fn detect_momentum_shift(
    fixture_id: &str,
    metrics: &MetricVector,
    state: &mut FixtureState,
    out: &mut Vec<Pattern>,
) {
    let target = metrics.elapsed.saturating_sub(5);
    let Some(past) = history_at_or_before(state, target) else {
        return;
    };
    let delta = (metrics.home.momentum - past.momentum_home).abs();
    let matches = delta >= 30.0;

    let key = SpanKey {
        kind: PatternKind::MomentumShift,
        team: None,
    };
    if matches {
        let evidence = vec![format!("momentum_delta={delta:.1}")];
        let confidence = (delta / 30.0).min(1.0);
        if let Some(started) = open_or_extend(state, key, metrics.elapsed, evidence.clone()) {
            out.push(make_pattern(
                fixture_id,
                PatternKind::MomentumShift,
                Severity::High,
                confidence,
                started,
                None,
                evidence,
                None,
            ));
        }
    } else {
        close_if_absent(state, key, false);
    }
}

fn detect_pressure_buildup(
    fixture_id: &str,
    metrics: &MetricVector,
    state: &mut FixtureState,
    out: &mut Vec<Pattern>,
) {
    for (team, pressure) in [(Team::Home, metrics.home.pressure), (Team::Away, metrics.away.pressure)] {
        let key = SpanKey {
            kind: PatternKind::PressureBuildup,
            team: Some(team),
        };
        if pressure > 70.0 {
            let since = *state.pressure_since.entry(team).or_insert(metrics.elapsed);
            let sustained = metrics.elapsed.saturating_sub(since);
            if sustained >= 3 {
                let evidence = vec![format!("pressure={pressure:.1} sustained {sustained}m")];
                let confidence = (sustained as f64 / 3.0).min(1.0);
                if let Some(started) = open_or_extend(state, key, metrics.elapsed, evidence.clone()) {
                    out.push(make_pattern(
                        fixture_id,
                        PatternKind::PressureBuildup,
                        Severity::High,
                        confidence,
                        started.min(since),
                        None,
                        evidence,
                        Some(team),
                    ));
                }
            }
        } else {
            state.pressure_since.remove(&team);
            close_if_absent(state, key, false);
        }
    }
}

fn detect_time_based(
    fixture_id: &str,
    events: &[Event],
    now_minute: u32,
    state: &mut FixtureState,
    out: &mut Vec<Pattern>,
) {
    let late_goal = events.iter().find(|e| matches!(e.kind, EventType::Goal) && e.minute > 85);
    let key_goal = SpanKey {
        kind: PatternKind::TimeBased,
        team: Some(Team::Home),
    };
    if let Some(goal) = late_goal {
        let evidence = vec![format!("late_goal@{}", goal.minute)];
        if let Some(started) = open_or_extend(state, key_goal, now_minute, evidence.clone()) {
            out.push(make_pattern(
                fixture_id,
                PatternKind::TimeBased,
                Severity::High,
                1.0,
                started,
                None,
                evidence,
                Some(goal.team),
            ));
        }
    } else {
        close_if_absent(state, key_goal, false);
    }

    let early_red = events.iter().find(|e| matches!(e.kind, EventType::Red) && e.minute < 20);
    let key_red = SpanKey {
        kind: PatternKind::TimeBased,
        team: Some(Team::Away),
    };
    if let Some(red) = early_red {
        let evidence = vec![format!("early_red@{}", red.minute)];
        if let Some(started) = open_or_extend(state, key_red, now_minute, evidence.clone()) {
            out.push(make_pattern(
                fixture_id,
                PatternKind::TimeBased,
                Severity::Low,
                1.0,
                started,
                None,
                evidence,
                Some(red.team),
            ));
        }
    } else {
        close_if_absent(state, key_red, false);
    }
}

fn escalate_overlaps(patterns: &mut [Pattern]) {
    let snapshot: Vec<(usize, Option<Team>, u32)> = patterns
        .iter()
        .enumerate()
        .map(|(i, p)| (i, p.team, p.started_at_minute))
        .collect();

    let mut to_escalate = vec![false; patterns.len()];
    for a in &snapshot {
        for b in &snapshot {
            if a.0 == b.0 || a.1.is_none() || a.1 != b.1 {
                continue;
            }
            if a.2.abs_diff(b.2) <= 2 {
                to_escalate[a.0] = true;
                to_escalate[b.0] = true;
            }
        }
    }

    for (i, escalate) in to_escalate.into_iter().enumerate() {
        if escalate {
            patterns[i].severity = Severity::Critical;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;
    use crate::model::{FixtureStatus, Snapshot, TeamStats};
    use chrono::Utc;

    fn goal(minute: u32, team: Team) -> Event {
        Event {
            fixture_id: "f1".to_string(),
            minute,
            kind: EventType::Goal,
            team,
            player_id: None,
        }
    }

    fn snapshot(elapsed: u32, events: Vec<Event>) -> Snapshot {
        Snapshot {
            fixture_id: "f1".to_string(),
            observed_at: Utc::now(),
            status: FixtureStatus::Live1h,
            elapsed,
            home: TeamStats::default().with_defaults(),
            away: TeamStats::default().with_defaults(),
            weather: None,
            lineups_available: false,
            raw_events: events,
            player_stats: Default::default(),
        }
    }

    #[test]
    fn goal_sequence_emits_once_then_does_not_reemit() {
        let engine = PatternEngine::new();
        let events = vec![goal(45, Team::Home), goal(48, Team::Home), goal(50, Team::Home)];
        let snap = snapshot(50, events.clone());
        let mv = metrics::extract(&snap);

        let first = engine.detect("f1", &events, &mv);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, PatternKind::GoalSequence);
        assert_eq!(first[0].severity, Severity::High);

        let snap2 = snapshot(60, events.clone());
        let mv2 = metrics::extract(&snap2);
        let second = engine.detect("f1", &events, &mv2);
        assert!(second.iter().all(|p| p.kind != PatternKind::GoalSequence));
    }

    #[test]
    fn event_buffer_caps_at_fifty() {
        let mut buffer = Vec::new();
        let events: Vec<Event> = (0..60).map(|i| goal(i, Team::Home)).collect();
        push_events(&mut buffer, events);
        assert_eq!(buffer.len(), EVENT_BUFFER_CAPACITY);
    }

    #[test]
    fn goal_sequence_reports_started_and_ended_minute() {
        let engine = PatternEngine::new();
        let events = vec![goal(45, Team::Home), goal(48, Team::Home), goal(50, Team::Home)];
        let snap = snapshot(50, events.clone());
        let mv = metrics::extract(&snap);

        let patterns = engine.detect("f1", &events, &mv);
        assert_eq!(patterns[0].started_at_minute, 45);
        assert_eq!(patterns[0].ended_at_minute, Some(50));
    }

    #[test]
    fn recent_patterns_reflects_retention_window() {
        let engine = PatternEngine::with_retention(Duration::from_secs(3600));
        let events = vec![goal(45, Team::Home), goal(48, Team::Home)];
        let snap = snapshot(50, events.clone());
        let mv = metrics::extract(&snap);
        engine.detect("f1", &events, &mv);

        let recent = engine.recent_patterns("f1");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, PatternKind::GoalSequence);
    }
}
