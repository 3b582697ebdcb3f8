//! The single coordinating loop: ingestion -> evaluation -> dispatch.
//!
//! One scheduler task per process: `tokio::time::interval` driving a
//! per-tick summary log line, generalized with a backpressure guard so a
//! slow tick is skipped rather than queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::condition::{self, AlertLocks, EvalContext};
use crate::dispatch::{Dispatcher, TriggerOutcome};
use crate::formula;
use crate::ingestion::IngestionPipeline;
use crate::metrics;
use crate::model::{Alert, Fixture, MetricVector, PatternKind, Snapshot};
use crate::patterns::PatternEngine;
use crate::persistence::AlertStore;
use crate::store::SnapshotStore;

#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub fixtures_monitored: usize,
    pub over_capacity: u64,
    pub skipped_ttl: u64,
    pub stale_served: u64,
    pub upstream_budget_remaining: u32,
    pub triggers_dispatched: u64,
    pub triggers_suppressed: u64,
}

enum ControlMessage {
    Stop,
    ReloadAlerts,
    ForcePollNow,
}

/// A cheap-to-clone handle for interacting with a running `Scheduler` from
/// any other task.
#[derive(Clone)]
pub struct SchedulerHandle {
    control: mpsc::UnboundedSender<ControlMessage>,
    stats: Arc<SchedulerStatsInner>,
    ingestion: Arc<IngestionPipeline>,
    store: SnapshotStore,
    pattern_engine: Arc<PatternEngine>,
}

impl SchedulerHandle {
    pub fn stop(&self) {
        let _ = self.control.send(ControlMessage::Stop);
    }

    pub fn reload_alerts(&self) {
        let _ = self.control.send(ControlMessage::ReloadAlerts);
    }

    pub fn force_poll_now(&self) {
        let _ = self.control.send(ControlMessage::ForcePollNow);
    }

    pub fn get_stats(&self) -> SchedulerStats {
        self.stats.snapshot(
            self.store.len(),
            self.ingestion.counters.over_capacity.load(Ordering::Relaxed),
            self.ingestion.counters.skipped_ttl.load(Ordering::Relaxed),
            self.ingestion.counters.stale_served.load(Ordering::Relaxed),
            self.ingestion.budget_remaining(),
        )
    }

    /// Patterns emitted for `fixture_id` within the configured retention
    /// window.
    pub fn recent_patterns(&self, fixture_id: &str) -> Vec<crate::model::Pattern> {
        self.pattern_engine.recent_patterns(fixture_id)
    }
}

#[derive(Default)]
struct SchedulerStatsInner {
    ticks_run: AtomicU64,
    ticks_skipped: AtomicU64,
    triggers_dispatched: AtomicU64,
    triggers_suppressed: AtomicU64,
}

impl SchedulerStatsInner {
    fn snapshot(
        &self,
        fixtures_monitored: usize,
        over_capacity: u64,
        skipped_ttl: u64,
        stale_served: u64,
        upstream_budget_remaining: u32,
    ) -> SchedulerStats {
        SchedulerStats {
            ticks_run: self.ticks_run.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            fixtures_monitored,
            over_capacity,
            skipped_ttl,
            stale_served,
            upstream_budget_remaining,
            triggers_dispatched: self.triggers_dispatched.load(Ordering::Relaxed),
            triggers_suppressed: self.triggers_suppressed.load(Ordering::Relaxed),
        }
    }
}

pub struct Scheduler {
    ingestion: Arc<IngestionPipeline>,
    store: SnapshotStore,
    alert_store: AlertStore,
    pattern_engine: Arc<PatternEngine>,
    dispatcher: Arc<Dispatcher>,
    alert_locks: Arc<AlertLocks>,
    poll_interval: std::time::Duration,
    evaluator_concurrency: usize,
    alerts: Mutex<Vec<Alert>>,
    truth_state: Arc<Mutex<HashMap<(i64, String), bool>>>,
    tick_in_progress: AtomicBool,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    stats: Arc<SchedulerStatsInner>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ingestion: IngestionPipeline,
        store: SnapshotStore,
        alert_store: AlertStore,
        dispatcher: Dispatcher,
        poll_interval: std::time::Duration,
        evaluator_concurrency: usize,
        pattern_retention: std::time::Duration,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            ingestion: Arc::new(ingestion),
            store,
            alert_store,
            pattern_engine: Arc::new(PatternEngine::with_retention(pattern_retention)),
            dispatcher: Arc::new(dispatcher),
            alert_locks: Arc::new(AlertLocks::default()),
            poll_interval,
            evaluator_concurrency: evaluator_concurrency.max(1),
            alerts: Mutex::new(Vec::new()),
            truth_state: Arc::new(Mutex::new(HashMap::new())),
            tick_in_progress: AtomicBool::new(false),
            control_tx,
            control_rx,
            stats: Arc::new(SchedulerStatsInner::default()),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            control: self.control_tx.clone(),
            stats: self.stats.clone(),
            ingestion: self.ingestion.clone(),
            store: self.store.clone(),
            pattern_engine: self.pattern_engine.clone(),
        }
    }

    /// Runs until a `stop()` control message arrives or a 30s shutdown
    /// deadline elapses while draining in-flight work.
    pub async fn run(mut self) {
        self.reload_alerts();

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.maybe_run_tick().await;
                }
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(ControlMessage::Stop) | None => break,
                        Some(ControlMessage::ReloadAlerts) => self.reload_alerts(),
                        Some(ControlMessage::ForcePollNow) => self.maybe_run_tick().await,
                    }
                }
            }
        }

        info!("scheduler shutting down, draining in-flight tick");
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
        while self.tick_in_progress.load(Ordering::Acquire) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    fn reload_alerts(&self) {
        match self.alert_store.active_alerts() {
            Ok(alerts) => {
                info!(count = alerts.len(), "reloaded active alerts");
                *self.alerts.lock() = alerts;
            }
            Err(e) => tracing::error!(error = %e, "failed to reload alerts; keeping previous set"),
        }
    }

    async fn maybe_run_tick(&self) {
        if self
            .tick_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            info!("skipping tick: previous tick still draining");
            return;
        }

        self.run_tick_inner().await;
        self.tick_in_progress.store(false, Ordering::Release);
    }

    /// Evaluators run on a bounded pool sized by `evaluator_concurrency`
    /// rather than inline on this task, so a slow formula or a slow
    /// dispatch on one alert does not hold up every other alert's tick.
    /// `alert_locks` still serializes repeat evaluations of the same alert
    /// across overlapping ticks within that pool.
    async fn run_tick_inner(&self) {
        let updated_fixtures = self.ingestion.run_tick().await;
        self.stats.ticks_run.fetch_add(1, Ordering::Relaxed);

        let alerts_snapshot: Vec<Alert> = self.alerts.lock().clone();
        let semaphore = Arc::new(Semaphore::new(self.evaluator_concurrency));
        let mut handles = Vec::new();

        for fixture_id in &updated_fixtures {
            let Some(fixture) = self.store.get_fixture(fixture_id) else { continue };
            // SCHEDULED fixtures are never evaluated.
            if !fixture.status.is_live() && !fixture.status.is_terminal() {
                continue;
            }
            let Some(snapshot) = self.store.get(fixture_id) else { continue };

            let metric_vector = Arc::new(metrics::extract(&snapshot));
            let new_patterns = self.pattern_engine.detect(fixture_id, &snapshot.raw_events, &metric_vector);
            for pattern in &new_patterns {
                info!(fixture_id = %fixture_id, kind = ?pattern.kind, severity = ?pattern.severity, "pattern detected");
            }
            let active_patterns = Arc::new(self.pattern_engine.active_kinds(fixture_id));

            for alert in &alerts_snapshot {
                if !alert.active {
                    continue;
                }
                if let Some(scope) = &alert.fixture_id {
                    if scope != fixture_id {
                        continue;
                    }
                }

                let semaphore = semaphore.clone();
                let alert = alert.clone();
                let fixture = fixture.clone();
                let fixture_id = fixture_id.clone();
                let snapshot = snapshot.clone();
                let metric_vector = metric_vector.clone();
                let active_patterns = active_patterns.clone();
                let alert_locks = self.alert_locks.clone();
                let truth_state = self.truth_state.clone();
                let alert_store = self.alert_store.clone();
                let dispatcher = self.dispatcher.clone();
                let stats = self.stats.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore not closed");
                    evaluate_alert(
                        alert,
                        fixture,
                        fixture_id,
                        snapshot,
                        metric_vector,
                        active_patterns,
                        alert_locks,
                        truth_state,
                        alert_store,
                        dispatcher,
                        stats,
                    )
                    .await;
                }));
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "alert evaluation task panicked");
            }
        }

        info!(
            fixtures_updated = updated_fixtures.len(),
            over_capacity = self.ingestion.counters.over_capacity.load(Ordering::Relaxed),
            skipped_ttl = self.ingestion.counters.skipped_ttl.load(Ordering::Relaxed),
            "tick complete"
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn evaluate_alert(
    alert: Alert,
    fixture: Fixture,
    fixture_id: String,
    snapshot: Arc<Snapshot>,
    metric_vector: Arc<MetricVector>,
    active_patterns: Arc<std::collections::HashSet<PatternKind>>,
    alert_locks: Arc<AlertLocks>,
    truth_state: Arc<Mutex<HashMap<(i64, String), bool>>>,
    alert_store: AlertStore,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<SchedulerStatsInner>,
) {
    let _guard = alert_locks.lock(alert.id);

    let ctx = EvalContext::new(&metric_vector, &snapshot, &active_patterns);
    let truth = condition::evaluate(&alert.expression, &ctx);

    let key = (alert.id, fixture_id);
    let was_true = truth_state.lock().get(&key).copied().unwrap_or(false);
    truth_state.lock().insert(key, truth);

    if truth && !was_true {
        let mut alert_mut = alert.clone();
        let (phone, email) = alert_store.contact_for_user(alert.owner_user_id).unwrap_or((None, None));
        let description = describe(&alert.expression);
        let outcome = dispatcher
            .trigger(&mut alert_mut, &fixture, &metric_vector, description, phone, email)
            .await;
        match outcome {
            TriggerOutcome::Dispatched { .. } => {
                stats.triggers_dispatched.fetch_add(1, Ordering::Relaxed);
            }
            TriggerOutcome::Suppressed => {
                stats.triggers_suppressed.fetch_add(1, Ordering::Relaxed);
            }
            TriggerOutcome::PersistenceFailed => {}
        }
    }
}

fn describe(expr: &crate::condition::Expression) -> String {
    match expr {
        crate::condition::Expression::Predicate { metric, operator, value, .. } => {
            format!("{metric} {operator:?} {value}")
        }
        crate::condition::Expression::And(children) => {
            format!("all({})", children.iter().map(describe).collect::<Vec<_>>().join(", "))
        }
        crate::condition::Expression::Or(children) => {
            format!("any({})", children.iter().map(describe).collect::<Vec<_>>().join(", "))
        }
        crate::condition::Expression::Not(child) => format!("not({})", describe(child)),
        crate::condition::Expression::Sequence { kinds, within_minutes, .. } => {
            format!("sequence({kinds:?} within {within_minutes}m)")
        }
    }
}

/// Validates a custom metric formula against the closed variable set before
/// it is persisted; a placeholder `MetricVector` supplies every known name.
pub fn validate_custom_metric_formula(formula_text: &str) -> Result<(), formula::FormulaError> {
    let placeholder = metrics::extract(&crate::model::Snapshot {
        fixture_id: String::new(),
        observed_at: chrono::Utc::now(),
        status: crate::model::FixtureStatus::Live1h,
        elapsed: 0,
        home: crate::model::TeamStats::default().with_defaults(),
        away: crate::model::TeamStats::default().with_defaults(),
        weather: None,
        lineups_available: false,
        raw_events: vec![],
        player_stats: Default::default(),
    });
    let vars = metrics::flatten(&placeholder);
    formula::validate(formula_text, &vars)
}
