//! Typed upstream sports-data client.
//!
//! A `reqwest::Client` wrapped with an `execute_with_retry` helper that
//! classifies failures and retries transient ones with jittered exponential
//! backoff. The retry wrapper additionally consults the shared
//! `UpstreamBudget` before every call and fails fast (never retries) on
//! `BudgetExceeded`.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::model::{Event, EventType, Fixture, FixtureStatus, Team, TeamStats};
use crate::upstream::budget::{BudgetDecision, UpstreamBudget};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Failure taxonomy for upstream calls.
#[derive(Debug, Clone)]
pub enum UpstreamError {
    /// 5xx, timeout, or network error; already retried up to `MAX_RETRIES` times.
    Transient { reason: String },
    /// Fatal; surfaced to the caller, never retried.
    AuthError { reason: String },
    /// Surfaced, not retried.
    NotFound { fixture_id: String },
    /// The hourly call budget is exhausted; this is not a failure, but callers
    /// that only accept `Result` route it through this variant (it is expected
    /// back-pressure, not an error to alarm on).
    BudgetExceeded,
    /// The response body did not parse into the expected shape.
    DataShape { reason: String },
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Transient { reason } => write!(f, "upstream transient error: {reason}"),
            UpstreamError::AuthError { reason } => write!(f, "upstream auth error: {reason}"),
            UpstreamError::NotFound { fixture_id } => {
                write!(f, "fixture {fixture_id} not found upstream")
            }
            UpstreamError::BudgetExceeded => write!(f, "upstream call budget exceeded"),
            UpstreamError::DataShape { reason } => write!(f, "upstream data shape error: {reason}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// The typed upstream surface every evaluator/ingestion caller depends on.
/// Implemented by `HttpUpstreamClient` for production and by a fake in tests.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn list_live(&self) -> Result<Vec<Fixture>, UpstreamError>;
    async fn list_by_date(&self, date: chrono::NaiveDate) -> Result<Vec<Fixture>, UpstreamError>;
    async fn fixture_stats(&self, fixture_id: &str) -> Result<(TeamStats, TeamStats, u32), UpstreamError>;
    async fn fixture_events(&self, fixture_id: &str) -> Result<Vec<Event>, UpstreamError>;
    async fn fixture_lineups(&self, fixture_id: &str) -> Result<bool, UpstreamError>;

    /// Remaining calls in the current rolling hour, for the caller's own bookkeeping.
    fn budget_remaining(&self) -> u32;
}

pub struct HttpUpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    budget: UpstreamBudget,
}

impl HttpUpstreamClient {
    pub fn new(base_url: String, api_key: String, budget: UpstreamBudget) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url,
            api_key,
            budget,
        }
    }

    /// Run `call` under the budget + retry policy.
    async fn execute_with_retry<T, F, Fut>(&self, call: F) -> Result<T, UpstreamError>
    where
        F: Fn(reqwest::Client, String, String) -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
        T: for<'de> Deserialize<'de>,
    {
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 0..MAX_RETRIES {
            match self.budget.check() {
                BudgetDecision::Exceeded => return Err(UpstreamError::BudgetExceeded),
                BudgetDecision::WaitForSpacing(d) => tokio::time::sleep(d).await,
                BudgetDecision::Allowed => {}
            }
            self.budget.record_call();
            let response = call(self.http.clone(), self.base_url.clone(), self.api_key.clone()).await;

            match response {
                Ok(resp) if resp.status() == 401 || resp.status() == 403 => {
                    return Err(UpstreamError::AuthError {
                        reason: format!("status {}", resp.status()),
                    });
                }
                Ok(resp) if resp.status() == 404 => {
                    return Err(UpstreamError::NotFound {
                        fixture_id: "unknown".to_string(),
                    });
                }
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| UpstreamError::DataShape {
                            reason: e.to_string(),
                        });
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), attempt, "upstream returned error status");
                }
                Err(e) => {
                    warn!(error = %e, attempt, "upstream request failed");
                }
            }

            if attempt + 1 < MAX_RETRIES {
                let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
                let jittered = backoff.mul_f64(1.0 + jitter_frac);
                debug!(?jittered, attempt, "retrying upstream call after backoff");
                tokio::time::sleep(jittered).await;
                backoff *= 2;
            }
        }

        Err(UpstreamError::Transient {
            reason: format!("exhausted {MAX_RETRIES} retries"),
        })
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn list_live(&self) -> Result<Vec<Fixture>, UpstreamError> {
        let payload: Vec<RawFixture> = self
            .execute_with_retry(|client, base, key| async move {
                client
                    .get(format!("{base}/fixtures/live"))
                    .header("Authorization", format!("Bearer {key}"))
                    .send()
                    .await
            })
            .await?;

        Ok(payload.into_iter().map(RawFixture::into_fixture).collect())
    }

    async fn list_by_date(&self, date: chrono::NaiveDate) -> Result<Vec<Fixture>, UpstreamError> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let payload: Vec<RawFixture> = self
            .execute_with_retry(move |client, base, key| {
                let date_str = date_str.clone();
                async move {
                    client
                        .get(format!("{base}/fixtures"))
                        .header("Authorization", format!("Bearer {key}"))
                        .query(&[("date", date_str)])
                        .send()
                        .await
                }
            })
            .await?;

        Ok(payload.into_iter().map(RawFixture::into_fixture).collect())
    }

    async fn fixture_stats(&self, fixture_id: &str) -> Result<(TeamStats, TeamStats, u32), UpstreamError> {
        let id = fixture_id.to_string();
        let payload: RawStats = self
            .execute_with_retry(move |client, base, key| {
                let id = id.clone();
                async move {
                    client
                        .get(format!("{base}/fixtures/{id}/stats"))
                        .header("Authorization", format!("Bearer {key}"))
                        .send()
                        .await
                }
            })
            .await?;

        Ok((payload.home.into_team_stats(), payload.away.into_team_stats(), payload.elapsed))
    }

    async fn fixture_events(&self, fixture_id: &str) -> Result<Vec<Event>, UpstreamError> {
        let id = fixture_id.to_string();
        let id_for_events = fixture_id.to_string();
        let payload: Vec<RawEvent> = self
            .execute_with_retry(move |client, base, key| {
                let id = id.clone();
                async move {
                    client
                        .get(format!("{base}/fixtures/{id}/events"))
                        .header("Authorization", format!("Bearer {key}"))
                        .send()
                        .await
                }
            })
            .await?;

        Ok(payload
            .into_iter()
            .filter_map(|e| e.into_event(&id_for_events))
            .collect())
    }

    async fn fixture_lineups(&self, fixture_id: &str) -> Result<bool, UpstreamError> {
        let id = fixture_id.to_string();
        let payload: RawLineups = self
            .execute_with_retry(move |client, base, key| {
                let id = id.clone();
                async move {
                    client
                        .get(format!("{base}/fixtures/{id}/lineups"))
                        .header("Authorization", format!("Bearer {key}"))
                        .send()
                        .await
                }
            })
            .await?;

        Ok(payload.available)
    }

    fn budget_remaining(&self) -> u32 {
        self.budget.remaining()
    }
}

// --- Raw provider response shapes, normalized into the internal model ---
// The provider's own JSON layout is external and undocumented, so every
// field here is deliberately defensive (`#[serde(default)]`).

#[derive(Debug, Deserialize)]
struct RawFixture {
    id: String,
    home_team: String,
    away_team: String,
    league: String,
    venue: Option<String>,
    referee: Option<String>,
    #[serde(default)]
    kickoff: Option<chrono::DateTime<chrono::Utc>>,
    status: String,
    #[serde(default)]
    elapsed: u32,
}

impl RawFixture {
    fn into_fixture(self) -> Fixture {
        Fixture {
            fixture_id: self.id,
            home_team: self.home_team,
            away_team: self.away_team,
            league: self.league,
            venue: self.venue,
            referee: self.referee,
            scheduled_start: self.kickoff.unwrap_or_else(chrono::Utc::now),
            status: parse_status(&self.status),
            elapsed: self.elapsed,
        }
    }
}

fn parse_status(raw: &str) -> FixtureStatus {
    match raw {
        "LIVE_1H" => FixtureStatus::Live1h,
        "HT" => FixtureStatus::Ht,
        "LIVE_2H" => FixtureStatus::Live2h,
        "ET" => FixtureStatus::Et,
        "PEN" => FixtureStatus::Pen,
        "FINISHED" => FixtureStatus::Finished,
        "POSTPONED" => FixtureStatus::Postponed,
        _ => FixtureStatus::Scheduled,
    }
}

#[derive(Debug, Deserialize)]
struct RawStats {
    home: RawTeamStats,
    away: RawTeamStats,
    #[serde(default)]
    elapsed: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RawTeamStats {
    #[serde(default)]
    goals: u32,
    #[serde(default)]
    possession: f64,
    #[serde(default)]
    shots: u32,
    #[serde(default)]
    shots_on_target: u32,
    #[serde(default)]
    corners: u32,
    #[serde(default)]
    fouls: u32,
    #[serde(default)]
    yellow_cards: u32,
    #[serde(default)]
    red_cards: u32,
    #[serde(default)]
    offsides: u32,
    #[serde(default)]
    passes: u32,
    #[serde(default)]
    pass_accuracy: f64,
    #[serde(default)]
    tackles: u32,
    #[serde(default)]
    clearances: u32,
    #[serde(default)]
    saves: u32,
    #[serde(default)]
    interceptions: u32,
    #[serde(default)]
    xg: Option<f64>,
}

impl RawTeamStats {
    fn into_team_stats(self) -> TeamStats {
        TeamStats {
            goals: self.goals,
            possession: self.possession,
            shots: self.shots,
            shots_on_target: self.shots_on_target,
            corners: self.corners,
            fouls: self.fouls,
            yellow_cards: self.yellow_cards,
            red_cards: self.red_cards,
            offsides: self.offsides,
            passes: self.passes,
            pass_accuracy: self.pass_accuracy,
            tackles: self.tackles,
            clearances: self.clearances,
            saves: self.saves,
            interceptions: self.interceptions,
            xg: self.xg,
        }
        .with_defaults()
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    minute: u32,
    #[serde(rename = "type")]
    kind: String,
    team: String,
    #[serde(default)]
    player_id: Option<String>,
}

impl RawEvent {
    fn into_event(self, fixture_id: &str) -> Option<Event> {
        let kind = match self.kind.as_str() {
            "GOAL" => EventType::Goal,
            "YELLOW" => EventType::Yellow,
            "RED" => EventType::Red,
            "SUB" => EventType::Sub,
            "CORNER" => EventType::Corner,
            "SHOT_ON" => EventType::ShotOn,
            "SHOT_OFF" => EventType::ShotOff,
            "VAR" => EventType::Var,
            _ => return None,
        };
        let team = match self.team.as_str() {
            "home" => Team::Home,
            "away" => Team::Away,
            _ => return None,
        };
        Some(Event {
            fixture_id: fixture_id.to_string(),
            minute: self.minute,
            kind,
            team,
            player_id: self.player_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawLineups {
    #[serde(default)]
    available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_statuses() {
        assert_eq!(parse_status("LIVE_1H"), FixtureStatus::Live1h);
        assert_eq!(parse_status("FINISHED"), FixtureStatus::Finished);
        assert_eq!(parse_status("garbage"), FixtureStatus::Scheduled);
    }

    #[test]
    fn missing_possession_defaults_to_fifty() {
        let raw = RawTeamStats::default();
        let stats = raw.into_team_stats();
        assert_eq!(stats.possession, 50.0);
        assert_eq!(stats.goals, 0);
    }
}
