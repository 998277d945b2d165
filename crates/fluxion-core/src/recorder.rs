// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use fluxion_types::{EntityFilter, EntityRecord, RecorderSnapshot, StateChangedEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::RecorderConfig;
use crate::errors::{RecorderError, RecorderResult};
use crate::live::LiveFeed;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::reconciler::{BackfillReport, DiscoveryReport, Reconciler, SeedReport};
use crate::stats::{RecorderStats, TrackedEntities};
use crate::tasks::{DetachedTasks, ScheduledTask};
use crate::traits::Services;
use crate::transform::{TransformSkip, reading_from_event};

pub const BACKFILL_KEY: &str = "backfill";
pub const RESEED_KEY: &str = "reseed";
pub const DISCOVERY_KEY: &str = "discovery";

/// How long `stop` waits for a loop run already in progress
const STOP_GRACE: Duration = Duration::from_secs(30);

/// What happened to one live event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Recorded,
    Skipped(TransformSkip),
    WriteFailed,
    ShuttingDown,
}

#[derive(Debug, Default)]
struct Lifecycle {
    events_rx: Option<mpsc::UnboundedReceiver<StateChangedEvent>>,
    pump: Option<JoinHandle<()>>,
    reconnect_watch: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    heartbeat: Option<ScheduledTask>,
    backfill: Option<ScheduledTask>,
    stopped: bool,
}

#[derive(Debug)]
struct RecorderInner {
    services: Services,
    config: RecorderConfig,
    stats: Arc<RecorderStats>,
    tracked: Arc<TrackedEntities>,
    live: Arc<LiveFeed>,
    reconciler: Arc<Reconciler>,
    limiter: RateLimiter,
    detached: Arc<DetachedTasks>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

/// Real-time event recorder
///
/// Mirrors `state_changed` events of energy entities into the time-series
/// store, keeps entity metadata current in the registry, and runs the
/// heartbeat and backfill loops that reconcile the live feed with the hub's
/// statistics.
#[derive(Debug, Clone)]
pub struct EventRecorder {
    inner: Arc<RecorderInner>,
}

impl EventRecorder {
    pub fn new(services: Services, config: RecorderConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RecorderStats::new());
        let tracked = Arc::new(TrackedEntities::new());
        let live = Arc::new(LiveFeed::new(Arc::clone(&services.hub), events_tx));
        let reconciler = Arc::new(Reconciler::new(
            services.clone(),
            config.clone(),
            Arc::clone(&stats),
            Arc::clone(&tracked),
            Arc::clone(&live),
        ));
        let limiter = RateLimiter::new(config.rate_limit_window, Arc::clone(&services.clock));

        Self {
            inner: Arc::new(RecorderInner {
                services,
                config,
                stats,
                tracked,
                live,
                reconciler,
                limiter,
                detached: Arc::new(DetachedTasks::new()),
                running: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle {
                    events_rx: Some(events_rx),
                    ..Lifecycle::default()
                }),
            }),
        }
    }

    /// Bring the recorder live
    ///
    /// Loads tracked entities, seeds an empty time-series store, subscribes
    /// to live events and starts the reconciliation loops. Step failures are
    /// logged and counted; the recorder still goes live. A second call on a
    /// running recorder does nothing. A stopped recorder cannot be restarted.
    pub async fn start(&self) -> RecorderResult<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;

        if lifecycle.stopped || inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RecorderError::ShuttingDown);
        }
        if inner.running.load(Ordering::SeqCst) {
            debug!("Recorder already running");
            return Ok(());
        }

        info!(
            hub = inner.services.hub.name(),
            registry = inner.services.registry.name(),
            sink = inner.services.sink.name(),
            "🚀 Starting event recorder"
        );

        inner.load_tracked_entities().await;

        match inner.services.registry.load_subscription_state().await {
            Ok(Some(previous)) => debug!(
                events = previous.event_count,
                errors = previous.error_count,
                last_event_at = ?previous.last_event_at,
                "Previous session state"
            ),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "No previous session state"),
        }

        match inner.services.sink.count_rows().await {
            Ok(0) => {
                info!("Time-series store is empty, seeding");
                let report = inner.reconciler.seed().await;
                if !report.success {
                    warn!("Seeding did not complete, continuing with live events");
                }
            }
            Ok(rows) => debug!(rows, "Time-series store already populated"),
            Err(e) => {
                inner.stats.record_error();
                warn!(error = %e, "Could not count stored rows, skipping seed");
            }
        }

        if inner.shutting_down.load(Ordering::SeqCst) {
            info!("Shutdown requested during startup, not going live");
            return Err(RecorderError::ShuttingDown);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        lifecycle.shutdown_tx = Some(shutdown_tx);

        // The pump must be running before events can arrive
        if let Some(events_rx) = lifecycle.events_rx.take() {
            lifecycle.pump = Some(tokio::spawn(pump_events(
                Arc::clone(inner),
                events_rx,
                shutdown_rx.clone(),
            )));
        }

        // Read before subscribing so a reconnect racing the subscribe is seen
        let generation = inner.services.hub.connection_generation();
        lifecycle.reconnect_watch = Some(tokio::spawn(follow_reconnects(
            Arc::clone(inner),
            generation,
            shutdown_rx,
        )));

        match inner.live.ensure_subscribed().await {
            Ok(_) => inner.stats.set_subscribed_at(inner.services.clock.now()),
            Err(e) => {
                inner.stats.record_error();
                error!(error = %e, "Failed to subscribe to live events, heartbeat will retry");
            }
        }

        let reconciler = Arc::clone(&inner.reconciler);
        lifecycle.heartbeat = Some(ScheduledTask::spawn(
            "heartbeat",
            inner.config.heartbeat_interval,
            move || {
                let reconciler = Arc::clone(&reconciler);
                async move {
                    reconciler.execute_heartbeat().await;
                    Ok(())
                }
            },
        ));

        let reconciler = Arc::clone(&inner.reconciler);
        lifecycle.backfill = Some(ScheduledTask::spawn(
            "backfill",
            inner.config.backfill_interval,
            move || {
                let reconciler = Arc::clone(&reconciler);
                async move {
                    reconciler.run_backfill().await;
                    Ok(())
                }
            },
        ));

        inner.running.store(true, Ordering::SeqCst);
        inner.persist_subscription_state(true).await;

        info!(
            tracked = inner.tracked.len(),
            "✅ Event recorder live"
        );
        Ok(())
    }

    /// Shut down: no new writes or side updates start, the loops stop after
    /// any run in progress, in-flight side updates are awaited and the final
    /// state is persisted. Safe to call at any time and more than once.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::SeqCst);
        inner.detached.close();

        let mut lifecycle = inner.lifecycle.lock().await;
        if lifecycle.stopped {
            return;
        }
        lifecycle.stopped = true;

        info!("🛑 Stopping event recorder");

        if let Some(task) = lifecycle.heartbeat.take() {
            task.stop(STOP_GRACE).await;
        }
        if let Some(task) = lifecycle.backfill.take() {
            task.stop(STOP_GRACE).await;
        }

        if let Some(shutdown) = lifecycle.shutdown_tx.take() {
            let _ = shutdown.send(true);
        }
        if let Some(pump) = lifecycle.pump.take()
            && let Err(e) = pump.await
        {
            warn!(error = %e, "Event pump ended abnormally");
        }
        if let Some(watcher) = lifecycle.reconnect_watch.take()
            && let Err(e) = watcher.await
        {
            warn!(error = %e, "Reconnect watcher ended abnormally");
        }
        lifecycle.events_rx = None;

        inner.live.release().await;
        inner.detached.wait_idle().await;

        inner.running.store(false, Ordering::SeqCst);
        inner.persist_subscription_state(false).await;

        info!(
            events = inner.stats.event_count(),
            errors = inner.stats.error_count(),
            "Event recorder stopped"
        );
    }

    /// Process one live event; the pump calls this in arrival order
    pub async fn on_event(&self, event: StateChangedEvent) -> EventOutcome {
        self.inner.on_event(event).await
    }

    pub fn get_state(&self) -> RecorderSnapshot {
        let inner = &self.inner;
        RecorderSnapshot {
            is_running: inner.running.load(Ordering::SeqCst),
            connected: inner.services.hub.is_connected(),
            subscribed_at: inner.stats.subscribed_at(),
            last_event_at: inner.stats.last_event_at(),
            entity_count: inner.tracked.len(),
            event_count: inner.stats.event_count(),
            error_count: inner.stats.error_count(),
            detached_failures: inner.detached.failures(),
        }
    }

    pub fn check_rate_limit(&self, key: &str) -> RateLimitDecision {
        self.inner.limiter.check(key)
    }

    /// Run a backfill now, subject to the rate limit
    pub async fn trigger_backfill(&self) -> RecorderResult<BackfillReport> {
        self.inner.admit(BACKFILL_KEY)?;
        info!("Manual backfill triggered");
        Ok(self.inner.reconciler.run_backfill().await)
    }

    /// Run cold-start seeding again regardless of stored rows, subject to the
    /// rate limit
    pub async fn reseed_database(&self) -> RecorderResult<SeedReport> {
        self.inner.admit(RESEED_KEY)?;
        info!("Manual reseed triggered");
        Ok(self.inner.reconciler.seed().await)
    }

    /// Refresh entity metadata from the hub, subject to the rate limit
    pub async fn rediscover_entities(&self) -> RecorderResult<DiscoveryReport> {
        self.inner.admit(DISCOVERY_KEY)?;
        info!("Manual entity discovery triggered");
        self.inner.reconciler.rediscover().await
    }

    /// Change an entity's tracking flag in the registry and in memory.
    /// Returns false for unknown entities.
    pub async fn set_entity_tracked(&self, entity_id: &str, tracked: bool) -> RecorderResult<bool> {
        let known = self
            .inner
            .services
            .registry
            .set_entity_tracked(entity_id, tracked)
            .await
            .map_err(|e| RecorderError::registry(&e))?;

        if known {
            if tracked {
                self.inner.tracked.insert(entity_id);
            } else {
                self.inner.tracked.remove(entity_id);
            }
            info!(entity_id, tracked, "Entity tracking changed");
        }
        Ok(known)
    }

    /// Tracked entity ids, sorted
    pub fn tracked_entities(&self) -> Vec<String> {
        self.inner.tracked.snapshot()
    }

    /// Wait until detached registry updates have finished
    pub async fn wait_for_side_updates(&self) {
        self.inner.detached.wait_idle().await;
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }
}

impl RecorderInner {
    fn admit(&self, key: &str) -> RecorderResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RecorderError::ShuttingDown);
        }
        let decision = self.limiter.check(key);
        if decision.allowed {
            Ok(())
        } else {
            debug!(key, retry_after_ms = decision.retry_after_ms, "Trigger rate limited");
            Err(RecorderError::RateLimited {
                retry_after_ms: decision.retry_after_ms,
            })
        }
    }

    async fn load_tracked_entities(&self) {
        match self
            .services
            .registry
            .get_entities(&EntityFilter::tracked())
            .await
        {
            Ok(records) => {
                self.tracked
                    .replace(records.into_iter().map(|r| r.entity_id));
                debug!(count = self.tracked.len(), "Loaded tracked entities");
            }
            Err(e) => {
                self.stats.record_error();
                error!(error = %e, "Failed to load tracked entities");
            }
        }
    }

    async fn persist_subscription_state(&self, active: bool) {
        let active = active && self.live.is_active().await;
        let state = self
            .stats
            .subscription_state(active, self.services.clock.now());
        if let Err(e) = self.services.registry.save_subscription_state(&state).await {
            warn!(error = %e, "Failed to persist subscription state");
        }
    }

    async fn on_event(self: &Arc<Self>, event: StateChangedEvent) -> EventOutcome {
        if self.shutting_down.load(Ordering::SeqCst) {
            return EventOutcome::ShuttingDown;
        }

        let reading = match reading_from_event(&event) {
            Ok(reading) => reading,
            Err(skip) => {
                trace!(reason = %skip, "Skipping event");
                return EventOutcome::Skipped(skip);
            }
        };

        if let Err(e) = self
            .services
            .sink
            .write_readings(std::slice::from_ref(&reading))
            .await
        {
            self.stats.record_error();
            let err = RecorderError::sink_write(&e);
            warn!(entity_id = %reading.entity_id, error = %err, "Failed to write reading");
            return EventOutcome::WriteFailed;
        }

        let seen_at = self.services.clock.now();
        self.stats.record_event(seen_at);
        trace!(entity_id = %reading.entity_id, state = reading.state, "Reading recorded");

        // The reading exists, so new_state is present
        if let Some(new_state) = event.new_state {
            let inner = Arc::clone(self);
            self.detached.spawn("entity-update", async move {
                inner.update_entity(new_state, seen_at).await
            });
        }

        EventOutcome::Recorded
    }

    /// Bump the registry's event counter, creating the record for entities
    /// seen for the first time
    async fn update_entity(
        &self,
        state: fluxion_types::HubEntityState,
        seen_at: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<()> {
        let registry = &self.services.registry;
        if registry
            .increment_event_count(&state.entity_id, &state.state, seen_at)
            .await?
        {
            return Ok(());
        }

        let track = self.config.auto_track_new_entities;
        let mut record = EntityRecord::from_hub_state(&state, track, seen_at);
        record.event_count = 1;
        registry.upsert_entity(&record).await?;

        if track {
            self.tracked.insert(&record.entity_id);
        }
        info!(entity_id = %record.entity_id, tracked = track, "New entity discovered from live events");
        Ok(())
    }
}

async fn pump_events(
    inner: Arc<RecorderInner>,
    mut events: mpsc::UnboundedReceiver<StateChangedEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Event pump started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => {
                    inner.on_event(event).await;
                }
                None => break,
            },
        }
    }
    debug!("Event pump stopped");
}

/// Restore the live subscription as soon as the hub session is back on a new
/// connection, instead of waiting for the next heartbeat
async fn follow_reconnects(
    inner: Arc<RecorderInner>,
    mut seen: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = inner.services.hub.wait_for_connection(seen) => next,
        };
        let Some(generation) = next else {
            debug!("Hub session closed, no longer following reconnects");
            break;
        };
        seen = generation;

        if inner.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        if inner.reconciler.resubscribe(inner.services.clock.now()).await {
            info!(connection = generation, "🔁 Live subscription restored after reconnect");
        }
    }
}
