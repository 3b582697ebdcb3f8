//! Boolean condition tree and the at-most-one-evaluation-per-tick guard.
//!
//! `Expression` is a tagged enum dispatched by `match`, evaluated by a
//! straightforward recursive walk with short-circuiting `And`/`Or` in
//! declaration order: a match on a small closed tag set, no dynamic
//! dispatch needed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::metrics;
use crate::model::{Event, EventType, MetricVector, Snapshot, Team};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamScope {
    Home,
    Away,
    Either,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_minute: u32,
    pub end_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expression {
    Predicate {
        metric: String,
        team_scope: TeamScope,
        operator: Operator,
        value: f64,
        #[serde(default)]
        window: Option<TimeWindow>,
        #[serde(default)]
        player_id: Option<String>,
    },
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
    Sequence {
        kinds: Vec<EventType>,
        within_minutes: u32,
        team_scope: TeamScope,
    },
}

/// Everything an `Expression` needs to evaluate against one fixture at one
/// ingestion tick.
pub struct EvalContext<'a> {
    pub metrics: &'a MetricVector,
    pub snapshot: &'a Snapshot,
    /// Pattern kinds with a currently open span for this fixture, backing
    /// `Predicate{ metric: "pattern.<kind>", operator: "==", value: 1 }`.
    pub active_patterns: &'a std::collections::HashSet<crate::model::PatternKind>,
}

impl<'a> EvalContext<'a> {
    pub fn new(metrics: &'a MetricVector, snapshot: &'a Snapshot, active_patterns: &'a std::collections::HashSet<crate::model::PatternKind>) -> Self {
        Self { metrics, snapshot, active_patterns }
    }
}

pub fn evaluate(expr: &Expression, ctx: &EvalContext) -> bool {
    match expr {
        Expression::Predicate {
            metric,
            team_scope,
            operator,
            value,
            window,
            player_id,
        } => eval_predicate(metric, *team_scope, *operator, *value, window.as_ref(), player_id.as_deref(), ctx),
        Expression::And(children) => children.iter().all(|c| evaluate(c, ctx)),
        Expression::Or(children) => children.iter().any(|c| evaluate(c, ctx)),
        Expression::Not(child) => !evaluate(child, ctx),
        Expression::Sequence {
            kinds,
            within_minutes,
            team_scope,
        } => eval_sequence(kinds, *within_minutes, *team_scope, ctx),
    }
}

fn eval_predicate(
    metric: &str,
    team_scope: TeamScope,
    operator: Operator,
    value: f64,
    window: Option<&TimeWindow>,
    player_id: Option<&str>,
    ctx: &EvalContext,
) -> bool {
    if let Some(w) = window {
        if ctx.metrics.elapsed < w.start_minute || ctx.metrics.elapsed > w.end_minute {
            return false;
        }
    }

    if let Some(kind_name) = metric.strip_prefix("pattern.") {
        let active = ctx.active_patterns.iter().any(|k| pattern_kind_name(*k) == kind_name);
        let value_for_pattern = if active { 1.0 } else { 0.0 };
        return apply_operator(operator, value_for_pattern, value);
    }

    if let Some(pid) = player_id {
        let value_for_player = ctx
            .metrics
            .players
            .get(pid)
            .map(|pm| player_metric_value(metric, pm))
            .unwrap_or(0.0);
        return apply_operator(operator, value_for_player, value);
    }

    let sides: &[Team] = match team_scope {
        TeamScope::Home => &[Team::Home],
        TeamScope::Away => &[Team::Away],
        TeamScope::Either | TeamScope::Both => &[Team::Home, Team::Away],
    };

    let mut side_values = sides.iter().map(|team| {
        if let Some(w) = window {
            if is_counted_metric(metric) {
                return windowed_count(ctx.snapshot, *team, metric, w) as f64;
            }
        }
        team_metric_value(*team, metric, ctx.metrics)
    });

    match team_scope {
        TeamScope::Home | TeamScope::Away => {
            let v = side_values.next().unwrap_or(0.0);
            apply_operator(operator, v, value)
        }
        TeamScope::Either => side_values.any(|v| apply_operator(operator, v, value)),
        TeamScope::Both => side_values.all(|v| apply_operator(operator, v, value)),
    }
}

fn pattern_kind_name(kind: crate::model::PatternKind) -> &'static str {
    use crate::model::PatternKind::*;
    match kind {
        GoalSequence => "goal_sequence",
        CardSequence => "card_sequence",
        PossessionSwing => "possession_swing",
        MomentumShift => "momentum_shift",
        PressureBuildup => "pressure_buildup",
        TimeBased => "time_based",
    }
}

fn is_counted_metric(metric: &str) -> bool {
    matches!(metric, "goals" | "cards")
}

fn windowed_count(snapshot: &Snapshot, team: Team, metric: &str, window: &TimeWindow) -> u32 {
    snapshot
        .raw_events
        .iter()
        .filter(|e| e.team == team && e.minute >= window.start_minute && e.minute <= window.end_minute)
        .filter(|e| match metric {
            "goals" => matches!(e.kind, EventType::Goal),
            "cards" => matches!(e.kind, EventType::Yellow | EventType::Red),
            _ => false,
        })
        .count() as u32
}

fn team_metric_value(team: Team, metric: &str, mv: &MetricVector) -> f64 {
    let tm = match team {
        Team::Home => &mv.home,
        Team::Away => &mv.away,
    };
    match metric {
        "goals" => tm.goals,
        "shots" => tm.shots,
        "shots_on_target" => tm.shots_on_target,
        "possession" => tm.possession,
        "corners" => tm.corners,
        "fouls" => tm.fouls,
        "yellow_cards" => tm.yellow_cards,
        "red_cards" => tm.red_cards,
        "cards" => tm.yellow_cards + tm.red_cards,
        "offsides" => tm.offsides,
        "passes" => tm.passes,
        "pass_accuracy" => tm.pass_accuracy,
        "tackles" => tm.tackles,
        "clearances" => tm.clearances,
        "saves" => tm.saves,
        "interceptions" => tm.interceptions,
        "xg" => tm.xg,
        "momentum" => tm.momentum,
        "pressure" => tm.pressure,
        // match-level metrics referenced without a meaningful team scope
        "total_goals" => mv.total_goals as f64,
        "score_difference" => mv.score_difference as f64,
        "elapsed" => mv.elapsed as f64,
        "total_shots" => mv.total_shots as f64,
        "first_half_goals" => mv.first_half_goals as f64,
        "second_half_goals" => mv.second_half_goals as f64,
        "last_10_min_goals" => mv.last_10_min_goals as f64,
        "win_probability_home" => mv.win_probability_home,
        _ => 0.0,
    }
}

fn player_metric_value(metric: &str, pm: &crate::model::PlayerMetrics) -> f64 {
    match metric {
        "goals" => pm.goals,
        "assists" => pm.assists,
        "cards" => pm.cards,
        "shots" => pm.shots,
        "passes" => pm.passes,
        "tackles" => pm.tackles,
        "rating" => pm.rating,
        "minutes" => pm.minutes,
        "goal_contributions" => pm.goal_contributions,
        _ => 0.0,
    }
}

fn apply_operator(op: Operator, actual: f64, expected: f64) -> bool {
    match op {
        Operator::Ge => actual >= expected,
        Operator::Gt => actual > expected,
        Operator::Le => actual <= expected,
        Operator::Lt => actual < expected,
        Operator::Eq => (actual - expected).abs() < f64::EPSILON,
        Operator::Ne => (actual - expected).abs() >= f64::EPSILON,
        Operator::Contains => actual != 0.0,
        Operator::NotContains => actual == 0.0,
    }
}

fn eval_sequence(kinds: &[EventType], within_minutes: u32, team_scope: TeamScope, ctx: &EvalContext) -> bool {
    match team_scope {
        TeamScope::Home => sequence_holds_for_team(kinds, within_minutes, Team::Home, &ctx.snapshot.raw_events),
        TeamScope::Away => sequence_holds_for_team(kinds, within_minutes, Team::Away, &ctx.snapshot.raw_events),
        TeamScope::Either => {
            sequence_holds_for_team(kinds, within_minutes, Team::Home, &ctx.snapshot.raw_events)
                || sequence_holds_for_team(kinds, within_minutes, Team::Away, &ctx.snapshot.raw_events)
        }
        TeamScope::Both => {
            sequence_holds_for_team(kinds, within_minutes, Team::Home, &ctx.snapshot.raw_events)
                && sequence_holds_for_team(kinds, within_minutes, Team::Away, &ctx.snapshot.raw_events)
        }
    }
}

/// Finds an increasing subsequence of events matching `kinds` in order, all
/// from `team`, whose first-to-last minute span is `<= within_minutes`.
fn sequence_holds_for_team(kinds: &[EventType], within_minutes: u32, team: Team, events: &[Event]) -> bool {
    if kinds.is_empty() {
        return false;
    }
    let mut candidates: Vec<&Event> = events.iter().filter(|e| e.team == team).collect();
    candidates.sort_by_key(|e| e.minute);

    fn search(kinds: &[EventType], events: &[&Event], start_idx: usize, first_minute: Option<u32>, within: u32) -> bool {
        if kinds.is_empty() {
            return true;
        }
        for (offset, event) in events[start_idx..].iter().enumerate() {
            if event.kind != kinds[0] {
                continue;
            }
            let first = first_minute.unwrap_or(event.minute);
            if event.minute.saturating_sub(first) > within {
                continue;
            }
            if search(&kinds[1..], events, start_idx + offset + 1, Some(first), within) {
                return true;
            }
        }
        false
    }

    search(kinds, &candidates, 0, None, within_minutes)
}

/// Sharded per-alert mutex map enforcing at-most-one-evaluation-per-tick.
/// Shard count is fixed so the map never grows; contention is distributed
/// by hashing the alert id across a fixed number of lock shards.
pub struct AlertLocks {
    shards: Vec<Mutex<()>>,
}

impl AlertLocks {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(())).collect(),
        }
    }

    fn shard_for(&self, alert_id: i64) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        alert_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Blocks until this alert's shard is free, then returns a guard held
    /// for the duration of that alert's evaluation pass.
    pub fn lock(&self, alert_id: i64) -> parking_lot::MutexGuard<'_, ()> {
        self.shard_for(alert_id).lock()
    }
}

impl Default for AlertLocks {
    fn default() -> Self {
        Self::new(32)
    }
}

pub use metrics::flatten as flatten_metrics;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FixtureStatus, TeamStats};
    use chrono::Utc;

    fn snapshot_with_events(elapsed: u32, events: Vec<Event>) -> Snapshot {
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

    fn goal(minute: u32, team: Team) -> Event {
        Event {
            fixture_id: "f1".to_string(),
            minute,
            kind: EventType::Goal,
            team,
            player_id: None,
        }
    }

    #[test]
    fn simple_predicate_home_goals() {
        let mut snap = snapshot_with_events(30, vec![]);
        snap.home.goals = 1;
        let mv = metrics::extract(&snap);
        let no_patterns = std::collections::HashSet::new();
        let ctx = EvalContext::new(&mv, &snap, &no_patterns);
        let expr = Expression::Predicate {
            metric: "goals".to_string(),
            team_scope: TeamScope::Home,
            operator: Operator::Ge,
            value: 1.0,
            window: None,
            player_id: None,
        };
        assert!(evaluate(&expr, &ctx));
    }

    #[test]
    fn and_short_circuits_with_time_window() {
        let mut snap = snapshot_with_events(70, vec![goal(65, Team::Home)]);
        snap.home.goals = 1;
        snap.home.possession = 62.0;
        let mv = metrics::extract(&snap);
        let no_patterns = std::collections::HashSet::new();
        let ctx = EvalContext::new(&mv, &snap, &no_patterns);
        let expr = Expression::And(vec![
            Expression::Predicate {
                metric: "possession".to_string(),
                team_scope: TeamScope::Home,
                operator: Operator::Ge,
                value: 60.0,
                window: None,
                player_id: None,
            },
            Expression::Predicate {
                metric: "goals".to_string(),
                team_scope: TeamScope::Home,
                operator: Operator::Ge,
                value: 1.0,
                window: Some(TimeWindow { start_minute: 60, end_minute: 75 }),
                player_id: None,
            },
        ]);
        assert!(evaluate(&expr, &ctx));
    }

    #[test]
    fn sequence_within_window_triggers() {
        let snap = snapshot_with_events(30, vec![goal(12, Team::Home), goal(21, Team::Home)]);
        let mv = metrics::extract(&snap);
        let no_patterns = std::collections::HashSet::new();
        let ctx = EvalContext::new(&mv, &snap, &no_patterns);
        let expr = Expression::Sequence {
            kinds: vec![EventType::Goal, EventType::Goal],
            within_minutes: 10,
            team_scope: TeamScope::Home,
        };
        assert!(evaluate(&expr, &ctx));
    }

    #[test]
    fn sequence_outside_window_does_not_trigger() {
        let snap = snapshot_with_events(30, vec![goal(12, Team::Home), goal(23, Team::Home)]);
        let mv = metrics::extract(&snap);
        let no_patterns = std::collections::HashSet::new();
        let ctx = EvalContext::new(&mv, &snap, &no_patterns);
        let expr = Expression::Sequence {
            kinds: vec![EventType::Goal, EventType::Goal],
            within_minutes: 10,
            team_scope: TeamScope::Home,
        };
        assert!(!evaluate(&expr, &ctx));
    }

    #[test]
    fn alert_locks_allow_distinct_alerts_concurrently() {
        let locks = AlertLocks::new(4);
        let _g1 = locks.lock(1);
        let _g2 = locks.lock(2);
    }
}
