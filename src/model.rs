//! Core data model shared by every component: fixtures, snapshots, the
//! metric vector, events, alerts, custom metrics, patterns and trigger
//! records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Match lifecycle status as reported by the upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixtureStatus {
    Scheduled,
    Live1h,
    Ht,
    Live2h,
    Et,
    Pen,
    Finished,
    Postponed,
}

impl FixtureStatus {
    /// True for any in-progress status; `SCHEDULED` fixtures are never evaluated.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            FixtureStatus::Live1h
                | FixtureStatus::Ht
                | FixtureStatus::Live2h
                | FixtureStatus::Et
                | FixtureStatus::Pen
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FixtureStatus::Finished | FixtureStatus::Postponed)
    }

    /// Snapshot store TTL for this status.
    pub fn snapshot_ttl_secs(&self) -> u64 {
        match self {
            FixtureStatus::Live1h
            | FixtureStatus::Ht
            | FixtureStatus::Live2h
            | FixtureStatus::Et
            | FixtureStatus::Pen => 60,
            FixtureStatus::Finished | FixtureStatus::Postponed => 300,
            FixtureStatus::Scheduled => 600,
        }
    }
}

/// Fetch depth chosen per fixture status during ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailLevel {
    /// stats + events + lineups (3 calls)
    Full,
    /// stats + events (2 calls)
    Detailed,
    /// list entry only (0 calls)
    Basic,
}

impl DetailLevel {
    pub fn for_status(status: FixtureStatus) -> Self {
        if status.is_live() {
            DetailLevel::Full
        } else if status.is_terminal() {
            DetailLevel::Detailed
        } else {
            DetailLevel::Basic
        }
    }

    pub fn call_count(&self) -> u32 {
        match self {
            DetailLevel::Full => 3,
            DetailLevel::Detailed => 2,
            DetailLevel::Basic => 0,
        }
    }
}

/// A scheduled or in-progress match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub fixture_id: String,
    pub home_team: String,
    pub away_team: String,
    pub league: String,
    pub venue: Option<String>,
    pub referee: Option<String>,
    pub scheduled_start: DateTime<Utc>,
    pub status: FixtureStatus,
    pub elapsed: u32,
}

/// Per-team match statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamStats {
    pub goals: u32,
    pub possession: f64,
    pub shots: u32,
    pub shots_on_target: u32,
    pub corners: u32,
    pub fouls: u32,
    pub yellow_cards: u32,
    pub red_cards: u32,
    pub offsides: u32,
    pub passes: u32,
    pub pass_accuracy: f64,
    pub tackles: u32,
    pub clearances: u32,
    pub saves: u32,
    pub interceptions: u32,
    pub xg: Option<f64>,
}

impl TeamStats {
    /// Missing possession defaults to 50%; everything else defaults to 0.
    pub fn with_defaults(mut self) -> Self {
        if self.possession == 0.0 {
            self.possession = 50.0;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Home,
    Away,
}

impl Team {
    pub fn opponent(self) -> Team {
        match self {
            Team::Home => Team::Away,
            Team::Away => Team::Home,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Goal,
    Yellow,
    Red,
    Sub,
    Corner,
    ShotOn,
    ShotOff,
    Var,
}

/// A single match event, derived by diffing consecutive snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub fixture_id: String,
    pub minute: u32,
    pub kind: EventType,
    pub team: Team,
    pub player_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerStats {
    pub goals: u32,
    pub assists: u32,
    pub cards: u32,
    pub shots: u32,
    pub passes: u32,
    pub tackles: u32,
    pub rating: f64,
    pub minutes: u32,
}

/// An immutable point-in-time observation of a fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub fixture_id: String,
    pub observed_at: DateTime<Utc>,
    pub status: FixtureStatus,
    pub elapsed: u32,
    pub home: TeamStats,
    pub away: TeamStats,
    pub weather: Option<String>,
    pub lineups_available: bool,
    /// Raw events observed since kickoff, used to diff against the prior snapshot.
    pub raw_events: Vec<Event>,
    pub player_stats: HashMap<String, PlayerStats>,
}

impl Snapshot {
    pub fn total_goals(&self) -> u32 {
        self.home.goals + self.away.goals
    }
}

/// The canonical numeric projection of a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricVector {
    pub home: TeamMetrics,
    pub away: TeamMetrics,
    pub total_goals: u32,
    pub score_difference: i32,
    pub elapsed: u32,
    pub total_shots: u32,
    pub first_half_goals: u32,
    pub second_half_goals: u32,
    pub last_10_min_goals: u32,
    pub win_probability_home: f64,
    pub players: HashMap<String, PlayerMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamMetrics {
    pub goals: f64,
    pub shots: f64,
    pub shots_on_target: f64,
    pub possession: f64,
    pub corners: f64,
    pub fouls: f64,
    pub yellow_cards: f64,
    pub red_cards: f64,
    pub offsides: f64,
    pub passes: f64,
    pub pass_accuracy: f64,
    pub tackles: f64,
    pub clearances: f64,
    pub saves: f64,
    pub interceptions: f64,
    pub xg: f64,
    pub momentum: f64,
    pub pressure: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerMetrics {
    pub goals: f64,
    pub assists: f64,
    pub cards: f64,
    pub shots: f64,
    pub passes: f64,
    pub tackles: f64,
    pub rating: f64,
    pub minutes: f64,
    pub goal_contributions: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertChannel {
    Sms,
    Email,
    Websocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// A user-owned trigger specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub owner_user_id: i64,
    pub name: String,
    pub description: String,
    pub fixture_id: Option<String>,
    pub expression: crate::condition::Expression,
    pub channels: Vec<AlertChannel>,
    pub priority: Priority,
    pub cooldown_seconds: u64,
    pub active: bool,
    pub trigger_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

/// A user-owned custom formula.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomMetric {
    pub id: i64,
    pub owner_user_id: i64,
    pub name: String,
    pub formula_text: String,
    pub variable_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternKind {
    GoalSequence,
    CardSequence,
    PossessionSwing,
    MomentumShift,
    PressureBuildup,
    TimeBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// An automatically detected, labeled structure in the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub fixture_id: String,
    pub kind: PatternKind,
    pub severity: Severity,
    pub confidence: f64,
    pub started_at_minute: u32,
    pub ended_at_minute: Option<u32>,
    pub evidence: Vec<String>,
    pub team: Option<Team>,
}

/// Append-only audit record for a dispatched (or suppressed) trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub id: i64,
    pub alert_id: i64,
    pub fixture_id: String,
    pub triggered_at: DateTime<Utc>,
    pub metric_snapshot_json: String,
    pub channels_attempted: Vec<AlertChannel>,
    pub channels_succeeded: Vec<AlertChannel>,
}
