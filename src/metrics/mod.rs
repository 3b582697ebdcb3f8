//! Derives the canonical `MetricVector` from a `Snapshot`.
//!
//! A pure function over its input, no I/O and no shared state — everything
//! needed to reproduce a value lives in the snapshot itself, so two
//! extractions of the same snapshot always agree.

use std::collections::HashMap;

use crate::model::{EventType, PlayerMetrics, Snapshot, Team, TeamMetrics, MetricVector};

const MOMENTUM_WINDOW_MINUTES: u32 = 10;
const PRESSURE_WINDOW_MINUTES: u32 = 5;

pub fn extract(snapshot: &Snapshot) -> MetricVector {
    let elapsed = snapshot.elapsed;

    let mut home = team_metrics(snapshot, Team::Home);
    let mut away = team_metrics(snapshot, Team::Away);

    let momentum_diff = momentum_differential(snapshot, elapsed).clamp(-100.0, 100.0);
    home.momentum = momentum_diff;
    away.momentum = -momentum_diff;

    home.pressure = pressure_for(snapshot, Team::Home, elapsed).clamp(0.0, 100.0);
    away.pressure = pressure_for(snapshot, Team::Away, elapsed).clamp(0.0, 100.0);

    let total_goals = snapshot.total_goals();
    let score_difference = snapshot.home.goals as i32 - snapshot.away.goals as i32;
    let total_shots = snapshot.home.shots + snapshot.away.shots;

    let first_half_goals = count_goals_in_range(snapshot, 0, 45);
    let second_half_goals = count_goals_in_range(snapshot, 46, u32::MAX);
    let last_10_min_goals = if elapsed >= MOMENTUM_WINDOW_MINUTES {
        count_goals_in_range(snapshot, elapsed - MOMENTUM_WINDOW_MINUTES, elapsed)
    } else {
        count_goals_in_range(snapshot, 0, elapsed)
    };

    let win_probability_home = win_probability(score_difference, elapsed);

    let players = player_metrics(snapshot);

    MetricVector {
        home,
        away,
        total_goals,
        score_difference,
        elapsed,
        total_shots,
        first_half_goals,
        second_half_goals,
        last_10_min_goals,
        win_probability_home,
        players,
    }
}

fn team_metrics(snapshot: &Snapshot, team: Team) -> TeamMetrics {
    let stats = match team {
        Team::Home => &snapshot.home,
        Team::Away => &snapshot.away,
    };

    let xg = stats.xg.unwrap_or_else(|| estimate_xg(stats.shots, stats.shots_on_target));

    TeamMetrics {
        goals: stats.goals as f64,
        shots: stats.shots as f64,
        shots_on_target: stats.shots_on_target as f64,
        possession: stats.possession,
        corners: stats.corners as f64,
        fouls: stats.fouls as f64,
        yellow_cards: stats.yellow_cards as f64,
        red_cards: stats.red_cards as f64,
        offsides: stats.offsides as f64,
        passes: stats.passes as f64,
        pass_accuracy: stats.pass_accuracy,
        tackles: stats.tackles as f64,
        clearances: stats.clearances as f64,
        saves: stats.saves as f64,
        interceptions: stats.interceptions as f64,
        xg,
        momentum: 0.0,
        pressure: 0.0,
    }
}

/// Distance/angle data is unavailable from the normalized snapshot, so this
/// heuristic is monotone in shots-on-target (the only signal we have):
/// every shot contributes a small baseline, shots on target contribute more.
fn estimate_xg(shots: u32, shots_on_target: u32) -> f64 {
    shots as f64 * 0.03 + shots_on_target as f64 * 0.08
}

fn momentum_differential(snapshot: &Snapshot, elapsed: u32) -> f64 {
    let since = elapsed.saturating_sub(MOMENTUM_WINDOW_MINUTES);
    let mut score = 0.0;
    for event in &snapshot.raw_events {
        if event.minute < since || event.minute > elapsed {
            continue;
        }
        let sign = match event.team {
            Team::Home => 1.0,
            Team::Away => -1.0,
        };
        score += match event.kind {
            EventType::Goal => sign * 40.0,
            EventType::ShotOn => sign * 10.0,
            EventType::Corner => sign * 5.0,
            EventType::Yellow => sign * 3.0,
            // a red card against a team boosts the opponent's momentum
            EventType::Red => -sign * 30.0,
            _ => 0.0,
        };
    }
    score
}

fn pressure_for(snapshot: &Snapshot, team: Team, elapsed: u32) -> f64 {
    let since = elapsed.saturating_sub(PRESSURE_WINDOW_MINUTES);
    let mut score = 0.0;
    for event in &snapshot.raw_events {
        if event.team != team || event.minute < since || event.minute > elapsed {
            continue;
        }
        score += match event.kind {
            EventType::ShotOff => 6.0,
            EventType::ShotOn => 10.0,
            EventType::Corner => 4.0,
            _ => 0.0,
        };
    }
    score
}

fn count_goals_in_range(snapshot: &Snapshot, start: u32, end: u32) -> u32 {
    snapshot
        .raw_events
        .iter()
        .filter(|e| matches!(e.kind, EventType::Goal) && e.minute >= start && e.minute <= end)
        .count() as u32
}

/// Fixed logistic over score difference and match progress; purely a
/// function of the snapshot, so identical snapshots always agree.
fn win_probability(score_difference: i32, elapsed: u32) -> f64 {
    let progress = (elapsed.min(90) as f64 / 90.0).max(0.05);
    let logit = score_difference as f64 * (0.8 + progress);
    1.0 / (1.0 + (-logit).exp())
}

/// Flattens a `MetricVector` into the closed variable namespace the formula
/// evaluator and condition evaluator both index by name: `home_goals`,
/// `away_possession`, `total_goals`, `score_difference`, `elapsed`, and so
/// on, plus `player_<id>_<field>` for per-player metrics.
pub fn flatten(mv: &MetricVector) -> HashMap<String, f64> {
    let mut vars = HashMap::new();
    flatten_team("home", &mv.home, &mut vars);
    flatten_team("away", &mv.away, &mut vars);

    vars.insert("total_goals".to_string(), mv.total_goals as f64);
    vars.insert("score_difference".to_string(), mv.score_difference as f64);
    vars.insert("elapsed".to_string(), mv.elapsed as f64);
    vars.insert("total_shots".to_string(), mv.total_shots as f64);
    vars.insert("first_half_goals".to_string(), mv.first_half_goals as f64);
    vars.insert("second_half_goals".to_string(), mv.second_half_goals as f64);
    vars.insert("last_10_min_goals".to_string(), mv.last_10_min_goals as f64);
    vars.insert("win_probability_home".to_string(), mv.win_probability_home);

    for (player_id, pm) in &mv.players {
        let prefix = format!("player_{player_id}_");
        vars.insert(format!("{prefix}goals"), pm.goals);
        vars.insert(format!("{prefix}assists"), pm.assists);
        vars.insert(format!("{prefix}cards"), pm.cards);
        vars.insert(format!("{prefix}shots"), pm.shots);
        vars.insert(format!("{prefix}passes"), pm.passes);
        vars.insert(format!("{prefix}tackles"), pm.tackles);
        vars.insert(format!("{prefix}rating"), pm.rating);
        vars.insert(format!("{prefix}minutes"), pm.minutes);
        vars.insert(format!("{prefix}goal_contributions"), pm.goal_contributions);
    }

    vars
}

fn flatten_team(prefix: &str, tm: &TeamMetrics, out: &mut HashMap<String, f64>) {
    out.insert(format!("{prefix}_goals"), tm.goals);
    out.insert(format!("{prefix}_shots"), tm.shots);
    out.insert(format!("{prefix}_shots_on_target"), tm.shots_on_target);
    out.insert(format!("{prefix}_possession"), tm.possession);
    out.insert(format!("{prefix}_corners"), tm.corners);
    out.insert(format!("{prefix}_fouls"), tm.fouls);
    out.insert(format!("{prefix}_yellow_cards"), tm.yellow_cards);
    out.insert(format!("{prefix}_red_cards"), tm.red_cards);
    out.insert(format!("{prefix}_offsides"), tm.offsides);
    out.insert(format!("{prefix}_passes"), tm.passes);
    out.insert(format!("{prefix}_pass_accuracy"), tm.pass_accuracy);
    out.insert(format!("{prefix}_tackles"), tm.tackles);
    out.insert(format!("{prefix}_clearances"), tm.clearances);
    out.insert(format!("{prefix}_saves"), tm.saves);
    out.insert(format!("{prefix}_interceptions"), tm.interceptions);
    out.insert(format!("{prefix}_xg"), tm.xg);
    out.insert(format!("{prefix}_momentum"), tm.momentum);
    out.insert(format!("{prefix}_pressure"), tm.pressure);
}

fn player_metrics(snapshot: &Snapshot) -> HashMap<String, PlayerMetrics> {
    snapshot
        .player_stats
        .iter()
        .map(|(player_id, stats)| {
            let goal_contributions = stats.goals as f64 + stats.assists as f64;
            (
                player_id.clone(),
                PlayerMetrics {
                    goals: stats.goals as f64,
                    assists: stats.assists as f64,
                    cards: stats.cards as f64,
                    shots: stats.shots as f64,
                    passes: stats.passes as f64,
                    tackles: stats.tackles as f64,
                    rating: stats.rating,
                    minutes: stats.minutes as f64,
                    goal_contributions,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, FixtureStatus, TeamStats};
    use chrono::Utc;

    fn empty_snapshot(elapsed: u32) -> Snapshot {
        Snapshot {
            fixture_id: "f1".to_string(),
            observed_at: Utc::now(),
            status: FixtureStatus::Live1h,
            elapsed,
            home: TeamStats::default().with_defaults(),
            away: TeamStats::default().with_defaults(),
            weather: None,
            lineups_available: false,
            raw_events: vec![],
            player_stats: Default::default(),
        }
    }

    #[test]
    fn missing_possession_defaults_to_fifty_in_metric_vector() {
        let snap = empty_snapshot(10);
        let metrics = extract(&snap);
        assert_eq!(metrics.home.possession, 50.0);
        assert_eq!(metrics.away.possession, 50.0);
    }

    #[test]
    fn momentum_is_antisymmetric_between_teams() {
        let mut snap = empty_snapshot(30);
        snap.raw_events.push(Event {
            fixture_id: "f1".to_string(),
            minute: 28,
            kind: EventType::Goal,
            team: Team::Home,
            player_id: None,
        });
        let metrics = extract(&snap);
        assert_eq!(metrics.home.momentum, -metrics.away.momentum);
        assert!(metrics.home.momentum > 0.0);
    }

    #[test]
    fn win_probability_favors_leading_team() {
        let mut snap = empty_snapshot(60);
        snap.home.goals = 2;
        let metrics = extract(&snap);
        assert!(metrics.win_probability_home > 0.5);
    }

    #[test]
    fn last_10_min_goals_counts_only_recent_window() {
        let mut snap = empty_snapshot(50);
        snap.raw_events.push(Event {
            fixture_id: "f1".to_string(),
            minute: 41,
            kind: EventType::Goal,
            team: Team::Home,
            player_id: None,
        });
        snap.raw_events.push(Event {
            fixture_id: "f1".to_string(),
            minute: 10,
            kind: EventType::Goal,
            team: Team::Away,
            player_id: None,
        });
        let metrics = extract(&snap);
        assert_eq!(metrics.last_10_min_goals, 1);
    }
}
