//! Matchwatch - real-time sports alert evaluation daemon
//! Ingests live fixtures, detects patterns, evaluates alert conditions,
//! and dispatches notifications across SMS/email/websocket channels.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use matchwatch_core::broadcast::Broadcaster;
use matchwatch_core::dispatch::{
    Channel, ChannelError, Dispatcher, EmailChannel, EmailTransport, SmsChannel, SmsTransport,
    WebsocketChannel,
};
use matchwatch_core::model::AlertChannel;
use matchwatch_core::persistence::AlertStore;
use matchwatch_core::store::SnapshotStore;
use matchwatch_core::upstream::{HttpUpstreamClient, UpstreamBudget, UpstreamClient};
use matchwatch_core::{Config, Scheduler};

/// Logs the delivery instead of calling out to a real carrier. Real SMS/email
/// transport is an external collaborator the embedding application supplies;
/// this is only enough to run the daemon standalone.
struct LoggingSmsTransport;

#[async_trait]
impl SmsTransport for LoggingSmsTransport {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        info!(to, body, "sms transport not configured; logging instead of sending");
        Ok(())
    }
}

struct LoggingEmailTransport;

#[async_trait]
impl EmailTransport for LoggingEmailTransport {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        info!(to, subject, body, "email transport not configured; logging instead of sending");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!(
        poll_interval = config.poll_interval_seconds,
        max_monitored_fixtures = config.max_monitored_fixtures,
        "starting matchwatch"
    );

    let alert_store = AlertStore::open(&config.database_path)?;
    let snapshot_store = SnapshotStore::new();
    let broadcaster = Broadcaster::new(config.broadcast_buffer_size);

    let budget = UpstreamBudget::new(
        config.upstream_budget_per_hour,
        std::time::Duration::from_millis(config.upstream_min_delay_ms),
    );
    let upstream: Arc<dyn UpstreamClient> = Arc::new(HttpUpstreamClient::new(
        "https://api.football-data-provider.example".to_string(),
        config.upstream_api_key.clone(),
        budget,
    ));

    let ingestion = matchwatch_core::ingestion::IngestionPipeline::new(
        upstream,
        snapshot_store.clone(),
        config.max_monitored_fixtures,
        config.ingestion_concurrency,
    );

    let mut channels: HashMap<AlertChannel, Arc<dyn Channel>> = HashMap::new();
    channels.insert(AlertChannel::Sms, Arc::new(SmsChannel::new(Arc::new(LoggingSmsTransport))));
    channels.insert(AlertChannel::Email, Arc::new(EmailChannel::new(Arc::new(LoggingEmailTransport))));
    channels.insert(AlertChannel::Websocket, Arc::new(WebsocketChannel::new(broadcaster.clone())));

    let dispatcher = Dispatcher::new(alert_store.clone(), broadcaster.clone(), channels);

    let scheduler = Scheduler::new(
        ingestion,
        snapshot_store,
        alert_store,
        dispatcher,
        std::time::Duration::from_secs(config.poll_interval_seconds),
        config.evaluator_concurrency,
        std::time::Duration::from_secs(config.pattern_retention_seconds.max(0) as u64),
    );
    let handle = scheduler.handle();

    let run_task = tokio::spawn(scheduler.run());

    shutdown_signal().await;
    info!("shutdown signal received, stopping scheduler");
    handle.stop();

    if let Err(e) = run_task.await {
        warn!(error = %e, "scheduler task did not exit cleanly");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "matchwatch_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
