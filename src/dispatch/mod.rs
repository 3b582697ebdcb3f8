//! Cooldown enforcement, durable trigger persistence, and multi-channel
//! fan-out on a `false -> true` condition transition.
//!
//! A small `Channel` trait with one async method (`async_trait`), concrete
//! channels wrapping an injected transport, and a sharded
//! `parking_lot::Mutex` map for per-key runtime state.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::broadcast::{BroadcastMessage, Broadcaster};
use crate::model::{Alert, AlertChannel, Fixture, MetricVector, TriggerRecord};
use crate::persistence::AlertStore;

#[derive(Debug, Clone)]
pub enum ChannelError {
    Transient { reason: String },
    Permanent { reason: String },
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Transient { reason } => write!(f, "channel transient error: {reason}"),
            ChannelError::Permanent { reason } => write!(f, "channel permanent error: {reason}"),
        }
    }
}

impl std::error::Error for ChannelError {}

#[derive(Debug, Clone)]
pub struct DispatchMessage {
    pub alert_name: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub home_score: u32,
    pub away_score: u32,
    pub elapsed: u32,
    pub condition_description: String,
    pub to_phone: Option<String>,
    pub to_email: Option<String>,
}

impl DispatchMessage {
    /// `"⚽ {alert_name}\n🏆 {league}\n📊 {home} {hs} - {as} {away}\n🎯 {condition}\n⏰ {elapsed}'"`
    pub fn sms_body(&self) -> String {
        let body = format!(
            "⚽ {}\n🏆 {}\n📊 {} {} - {} {}\n🎯 {}\n⏰ {}'",
            self.alert_name,
            self.league,
            self.home_team,
            self.home_score,
            self.away_score,
            self.away_team,
            self.condition_description,
            self.elapsed
        );
        if body.len() > 320 {
            body.chars().take(320).collect()
        } else {
            body
        }
    }
}

#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> AlertChannel;
    async fn deliver(&self, message: &DispatchMessage) -> Result<(), ChannelError>;
}

pub struct SmsChannel {
    transport: std::sync::Arc<dyn SmsTransport>,
}

impl SmsChannel {
    pub fn new(transport: std::sync::Arc<dyn SmsTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Channel for SmsChannel {
    fn kind(&self) -> AlertChannel {
        AlertChannel::Sms
    }

    async fn deliver(&self, message: &DispatchMessage) -> Result<(), ChannelError> {
        let to = message.to_phone.as_deref().ok_or_else(|| ChannelError::Permanent {
            reason: "no phone number on file".to_string(),
        })?;
        self.transport.send_sms(to, &message.sms_body()).await
    }
}

pub struct EmailChannel {
    transport: std::sync::Arc<dyn EmailTransport>,
}

impl EmailChannel {
    pub fn new(transport: std::sync::Arc<dyn EmailTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn kind(&self) -> AlertChannel {
        AlertChannel::Email
    }

    async fn deliver(&self, message: &DispatchMessage) -> Result<(), ChannelError> {
        let to = message.to_email.as_deref().ok_or_else(|| ChannelError::Permanent {
            reason: "no email on file".to_string(),
        })?;
        let subject = format!("Alert: {}", message.alert_name);
        self.transport.send_email(to, &subject, &message.sms_body()).await
    }
}

pub struct WebsocketChannel {
    broadcaster: Broadcaster,
}

impl WebsocketChannel {
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl Channel for WebsocketChannel {
    fn kind(&self) -> AlertChannel {
        AlertChannel::Websocket
    }

    // Best-effort: dropped if no client is connected, never retried.
    async fn deliver(&self, message: &DispatchMessage) -> Result<(), ChannelError> {
        self.broadcaster.publish(BroadcastMessage::alert_triggered(
            message.alert_name.clone(),
            message.home_team.clone(),
            message.away_team.clone(),
            message.home_score,
            message.away_score,
            message.elapsed,
            message.condition_description.clone(),
        ));
        Ok(())
    }
}

#[derive(Default)]
struct AlertRuntimeState {
    last_triggered_at: Option<chrono::DateTime<Utc>>,
    disabled_channels: HashSet<AlertChannel>,
    suppressed_count: u64,
    stale_served: u64,
}

struct CooldownMap {
    shards: Vec<Mutex<HashMap<i64, AlertRuntimeState>>>,
}

impl CooldownMap {
    fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, alert_id: i64) -> &Mutex<HashMap<i64, AlertRuntimeState>> {
        let mut hasher = DefaultHasher::new();
        alert_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }
}

pub struct Dispatcher {
    store: AlertStore,
    broadcaster: Broadcaster,
    channels: HashMap<AlertChannel, std::sync::Arc<dyn Channel>>,
    cooldowns: CooldownMap,
}

pub enum TriggerOutcome {
    Suppressed,
    Dispatched { channels_succeeded: Vec<AlertChannel> },
    PersistenceFailed,
}

impl Dispatcher {
    pub fn new(store: AlertStore, broadcaster: Broadcaster, channels: HashMap<AlertChannel, std::sync::Arc<dyn Channel>>) -> Self {
        Self {
            store,
            broadcaster,
            channels,
            cooldowns: CooldownMap::new(32),
        }
    }

    /// Called on every observed `false -> true` transition for `(alert, fixture)`.
    pub async fn trigger(
        &self,
        alert: &mut Alert,
        fixture: &Fixture,
        metrics: &MetricVector,
        condition_description: String,
        to_phone: Option<String>,
        to_email: Option<String>,
    ) -> TriggerOutcome {
        let now = Utc::now();

        let shard = self.cooldowns.shard_for(alert.id);
        {
            let mut guard = shard.lock();
            let state = guard.entry(alert.id).or_default();
            if let Some(last) = state.last_triggered_at {
                let elapsed = (now - last).num_seconds().max(0) as u64;
                if elapsed < alert.cooldown_seconds {
                    state.suppressed_count += 1;
                    return TriggerOutcome::Suppressed;
                }
            }
        }

        let metric_snapshot_json = serde_json::to_string(metrics).unwrap_or_else(|_| "{}".to_string());

        let attempted: Vec<AlertChannel> = {
            let guard = shard.lock();
            let disabled = guard.get(&alert.id).map(|s| s.disabled_channels.clone()).unwrap_or_default();
            alert
                .channels
                .iter()
                .copied()
                .filter(|c| !disabled.contains(c))
                .collect()
        };

        let record = TriggerRecord {
            id: 0,
            alert_id: alert.id,
            fixture_id: fixture.fixture_id.clone(),
            triggered_at: now,
            metric_snapshot_json,
            channels_attempted: attempted.clone(),
            channels_succeeded: vec![],
        };

        // Durable before dispatch, per the at-least-once-without-duplicates invariant.
        let record_id = match self.store.insert_trigger(&record) {
            Ok(id) => id,
            Err(e) => {
                warn!(alert_id = alert.id, error = %e, "failed to persist trigger record; dispatch deferred");
                return TriggerOutcome::PersistenceFailed;
            }
        };

        let message = DispatchMessage {
            alert_name: alert.name.clone(),
            league: fixture.league.clone(),
            home_team: fixture.home_team.clone(),
            away_team: fixture.away_team.clone(),
            home_score: metrics.home.goals as u32,
            away_score: metrics.away.goals as u32,
            elapsed: metrics.elapsed,
            condition_description,
            to_phone,
            to_email,
        };

        let futures = attempted.iter().map(|channel_kind| {
            let message = message.clone();
            async move {
                match self.channels.get(channel_kind) {
                    Some(channel) => (*channel_kind, deliver_with_retry(channel.as_ref(), &message).await),
                    None => (*channel_kind, Err(ChannelError::Permanent {
                        reason: "no transport configured for channel".to_string(),
                    })),
                }
            }
        });
        let results = futures::future::join_all(futures).await;

        let mut succeeded = Vec::new();
        {
            let mut guard = shard.lock();
            let state = guard.entry(alert.id).or_default();
            for (kind, result) in &results {
                match result {
                    Ok(()) => succeeded.push(*kind),
                    Err(ChannelError::Permanent { reason }) => {
                        warn!(alert_id = alert.id, channel = ?kind, reason, "channel permanently disabled for this alert");
                        state.disabled_channels.insert(*kind);
                    }
                    Err(ChannelError::Transient { reason }) => {
                        warn!(alert_id = alert.id, channel = ?kind, reason, "channel delivery failed after retries");
                    }
                }
            }
            state.last_triggered_at = Some(now);
        }

        let _ = self.store.update_trigger_channels_succeeded(record_id, &succeeded);

        alert.trigger_count += 1;
        alert.last_triggered_at = Some(now);
        let _ = self.store.update_alert_counters(alert.id, alert.trigger_count, now);

        info!(alert_id = alert.id, fixture_id = %fixture.fixture_id, succeeded = ?succeeded, "alert dispatched");

        TriggerOutcome::Dispatched { channels_succeeded: succeeded }
    }
}

const CHANNEL_BACKOFFS: [Duration; 3] = [Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)];

async fn deliver_with_retry(channel: &dyn Channel, message: &DispatchMessage) -> Result<(), ChannelError> {
    // WebSocket is best-effort with no retry; everything else retries Transient failures.
    if channel.kind() == AlertChannel::Websocket {
        return channel.deliver(message).await;
    }

    let mut last_err = None;
    for backoff in CHANNEL_BACKOFFS {
        match channel.deliver(message).await {
            Ok(()) => return Ok(()),
            Err(ChannelError::Permanent { reason }) => return Err(ChannelError::Permanent { reason }),
            Err(e @ ChannelError::Transient { .. }) => {
                last_err = Some(e);
                tokio::time::sleep(backoff).await;
            }
        }
    }
    Err(last_err.unwrap_or(ChannelError::Transient {
        reason: "exhausted retries".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sms_body_matches_template_and_truncates_to_320() {
        let message = DispatchMessage {
            alert_name: "Goal Watch".to_string(),
            league: "Premier League".to_string(),
            home_team: "Arsenal".to_string(),
            away_team: "Chelsea".to_string(),
            home_score: 2,
            away_score: 1,
            elapsed: 70,
            condition_description: "home_goals >= 1".to_string(),
            to_phone: Some("+15551234567".to_string()),
            to_email: None,
        };
        let body = message.sms_body();
        assert!(body.contains("Goal Watch"));
        assert!(body.contains("Arsenal 2 - 1 Chelsea"));
        assert!(body.len() <= 320);
    }
}
