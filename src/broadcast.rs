//! Single-producer multi-consumer fan-out for real-time UI updates.
//!
//! Wraps `tokio::sync::broadcast`. Drop-oldest on overflow is
//! `broadcast`'s native lagged-receiver behavior; subscribers that fall
//! behind get a `Lagged` error on their next `recv`, which we surface as a
//! counter rather than an error the evaluators need to handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, Receiver, Sender};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl BroadcastMessage {
    pub fn alert_triggered(
        alert_name: String,
        home_team: String,
        away_team: String,
        home_score: u32,
        away_score: u32,
        elapsed: u32,
        condition_description: String,
    ) -> Self {
        Self {
            kind: "alert_triggered".to_string(),
            data: serde_json::json!({
                "alert_name": alert_name,
                "home_team": home_team,
                "away_team": away_team,
                "home_score": home_score,
                "away_score": away_score,
                "elapsed": elapsed,
                "condition": condition_description,
            }),
            timestamp: Utc::now(),
            user_id: None,
        }
    }

    pub fn match_update(fixture_id: String, home_score: u32, away_score: u32, elapsed: u32) -> Self {
        Self {
            kind: "match_update".to_string(),
            data: serde_json::json!({
                "fixture_id": fixture_id,
                "home_score": home_score,
                "away_score": away_score,
                "elapsed": elapsed,
            }),
            timestamp: Utc::now(),
            user_id: None,
        }
    }

    pub fn pattern_detected(fixture_id: String, kind: &str, severity: &str, confidence: f64) -> Self {
        Self {
            kind: "pattern_detected".to_string(),
            data: serde_json::json!({
                "fixture_id": fixture_id,
                "pattern_kind": kind,
                "severity": severity,
                "confidence": confidence,
            }),
            timestamp: Utc::now(),
            user_id: None,
        }
    }

    pub fn system_status(status: &str) -> Self {
        Self {
            kind: "system_status".to_string(),
            data: serde_json::json!({ "status": status }),
            timestamp: Utc::now(),
            user_id: None,
        }
    }
}

struct BroadcasterInner {
    sender: Sender<BroadcastMessage>,
    lagged: AtomicU64,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Broadcaster {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self {
            inner: Arc::new(BroadcasterInner {
                sender,
                lagged: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> Receiver<BroadcastMessage> {
        self.inner.sender.subscribe()
    }

    /// Publish to all current subscribers; a channel with no subscribers is
    /// a normal idle state, not an error.
    pub fn publish(&self, message: BroadcastMessage) {
        let _ = self.inner.sender.send(message);
    }

    pub fn lagged_count(&self) -> u64 {
        self.inner.lagged.load(Ordering::Relaxed)
    }

    pub fn record_lag(&self) {
        self.inner.lagged.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let broadcaster = Broadcaster::new(16);
        let mut rx = broadcaster.subscribe();
        broadcaster.publish(BroadcastMessage::system_status("ready"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, "system_status");
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let broadcaster = Broadcaster::new(4);
        broadcaster.publish(BroadcastMessage::system_status("ready"));
    }
}
