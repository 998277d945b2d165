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

//! In-memory fakes of the recorder's collaborators

#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fluxion_core::{
    EntityRegistry, EventSink, HubSession, LiveFeed, ManualClock, Reconciler, RecorderConfig,
    RecorderStats, Services, TimeSeriesSink, TrackedEntities,
};
use fluxion_types::{
    EnergyReading, EnergyStatistic, EntityFilter, EntityRecord, HubEntityState, ReadingAggregate,
    StatPeriod, StateChangedEvent, StatisticsRow, SubscriptionState, SyncLogEntry,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 2, 12, 0, 0).unwrap()
}

pub fn hub_state(entity_id: &str, state: &str, attributes: Value) -> HubEntityState {
    HubEntityState {
        entity_id: entity_id.to_owned(),
        state: state.to_owned(),
        attributes,
        last_changed: t0(),
        last_updated: t0(),
    }
}

pub fn power_state(entity_id: &str, state: &str) -> HubEntityState {
    hub_state(
        entity_id,
        state,
        json!({"device_class": "power", "unit_of_measurement": "W", "friendly_name": entity_id}),
    )
}

pub fn energy_state(entity_id: &str, state: &str) -> HubEntityState {
    hub_state(
        entity_id,
        state,
        json!({"device_class": "energy", "unit_of_measurement": "kWh"}),
    )
}

pub fn state_changed(old: Option<HubEntityState>, new: HubEntityState) -> StateChangedEvent {
    StateChangedEvent {
        entity_id: Some(new.entity_id.clone()),
        old_state: old,
        new_state: Some(new),
        time_fired: Some(t0()),
    }
}

pub fn stat_row(start: DateTime<Utc>, sum: f64) -> StatisticsRow {
    StatisticsRow {
        start,
        state: Some(sum),
        sum: Some(sum),
        mean: None,
        min: None,
        max: None,
    }
}

/// Poll `condition` until it holds or a few seconds pass
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Holds a fake call open until released, reporting when one arrives
#[derive(Default)]
pub struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Let the held call continue and stop holding new ones
    pub fn open(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    /// Resolve once a call is being held
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    async fn pass(&self) {
        if self.armed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

// ============= Hub =============

#[derive(Debug, Clone)]
pub struct StatsCall {
    pub entity_ids: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period: StatPeriod,
}

#[derive(Default)]
pub struct FakeHub {
    states: Mutex<Vec<HubEntityState>>,
    stats: Mutex<HashMap<String, Vec<StatisticsRow>>>,
    failing_stats: Mutex<HashSet<String>>,
    pub stats_calls: Mutex<Vec<StatsCall>>,
    subscriptions: Mutex<BTreeMap<u64, (EventSink, bool)>>,
    next_subscription: AtomicU64,
    pub subscribe_calls: AtomicUsize,
    pub reconnect_calls: AtomicUsize,
    pub fail_get_states: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub fail_reconnect: AtomicBool,
    pub stats_gate: Gate,
    disconnected: AtomicBool,
    generation: AtomicU64,
    connected: Notify,
}

impl FakeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_states(&self, states: Vec<HubEntityState>) {
        *self.states.lock() = states;
    }

    pub fn set_stats(&self, entity_id: &str, rows: Vec<StatisticsRow>) {
        self.stats.lock().insert(entity_id.to_owned(), rows);
    }

    pub fn fail_stats_for(&self, entity_id: &str) {
        self.failing_stats.lock().insert(entity_id.to_owned());
    }

    pub fn stats_calls(&self) -> Vec<StatsCall> {
        self.stats_calls.lock().clone()
    }

    /// Deliver an event to every active subscription
    pub fn push(&self, event: StateChangedEvent) {
        for (sink, active) in self.subscriptions.lock().values() {
            if *active {
                let _ = sink.send(event.clone());
            }
        }
    }

    /// Simulate a dropped connection
    pub fn drop_subscriptions(&self) {
        for (_, active) in self.subscriptions.lock().values_mut() {
            *active = false;
        }
    }

    /// Simulate the transport dropping and coming back on its own
    pub fn cycle_connection(&self) {
        self.drop_subscriptions();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.connected.notify_waiters();
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|(_, active)| *active)
            .count()
    }

    pub fn known_subscriptions(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

#[async_trait]
impl HubSession for FakeHub {
    async fn get_states(&self) -> Result<Vec<HubEntityState>> {
        if self.fail_get_states.load(Ordering::SeqCst) {
            bail!("get_states: connection refused");
        }
        Ok(self.states.lock().clone())
    }

    async fn statistics_during_period(
        &self,
        entity_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: StatPeriod,
    ) -> Result<HashMap<String, Vec<StatisticsRow>>> {
        self.stats_gate.pass().await;
        self.stats_calls.lock().push(StatsCall {
            entity_ids: entity_ids.to_vec(),
            start,
            end,
            period,
        });

        if let Some(failing) = entity_ids
            .iter()
            .find(|id| self.failing_stats.lock().contains(*id))
        {
            bail!("statistics unavailable for {failing}");
        }

        let stats = self.stats.lock();
        Ok(entity_ids
            .iter()
            .filter_map(|id| {
                let rows: Vec<StatisticsRow> = stats
                    .get(id)?
                    .iter()
                    .filter(|row| row.start >= start && row.start <= end)
                    .cloned()
                    .collect();
                Some((id.clone(), rows))
            })
            .collect())
    }

    async fn subscribe_state_changes(&self, sink: EventSink) -> Result<u64> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            bail!("subscribe_events: connection lost");
        }
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscriptions.lock().insert(id, (sink, true));
        Ok(id)
    }

    fn is_subscription_active(&self, subscription_id: u64) -> bool {
        self.subscriptions
            .lock()
            .get(&subscription_id)
            .is_some_and(|(_, active)| *active)
    }

    fn forget_subscription(&self, subscription_id: u64) {
        self.subscriptions.lock().remove(&subscription_id);
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.drop_subscriptions();
        if self.fail_reconnect.load(Ordering::SeqCst) {
            self.disconnected.store(true, Ordering::SeqCst);
            bail!("reconnect: connection refused");
        }
        self.disconnected.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.connected.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    fn connection_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn wait_for_connection(&self, after: u64) -> Option<u64> {
        loop {
            let notified = self.connected.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let generation = self.generation.load(Ordering::SeqCst);
            if generation > after {
                return Some(generation);
            }
            notified.await;
        }
    }

    fn name(&self) -> &str {
        "fake-hub"
    }
}

// ============= Registry =============

#[derive(Default)]
pub struct MemoryRegistry {
    entities: Mutex<BTreeMap<String, EntityRecord>>,
    sync_log: Mutex<Vec<SyncLogEntry>>,
    subscription: Mutex<Option<SubscriptionState>>,
    pub subscription_saves: AtomicUsize,
    pub fail_log_sync: AtomicBool,
    pub fail_increment: AtomicBool,
    pub fail_get_entities: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entity(&self, entity_id: &str) -> Option<EntityRecord> {
        self.entities.lock().get(entity_id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.lock().len()
    }

    pub fn sync_log(&self) -> Vec<SyncLogEntry> {
        self.sync_log.lock().clone()
    }

    pub fn subscription_state(&self) -> Option<SubscriptionState> {
        self.subscription.lock().clone()
    }
}

#[async_trait]
impl EntityRegistry for MemoryRegistry {
    async fn upsert_entity(&self, record: &EntityRecord) -> Result<()> {
        let mut entities = self.entities.lock();
        match entities.get_mut(&record.entity_id) {
            Some(existing) => {
                existing.friendly_name.clone_from(&record.friendly_name);
                existing.device_class.clone_from(&record.device_class);
                existing.unit_of_measurement.clone_from(&record.unit_of_measurement);
                existing.last_state.clone_from(&record.last_state);
                existing.last_seen = record.last_seen;
            }
            None => {
                entities.insert(record.entity_id.clone(), record.clone());
            }
        }
        Ok(())
    }

    async fn get_entities(&self, filter: &EntityFilter) -> Result<Vec<EntityRecord>> {
        if self.fail_get_entities.load(Ordering::SeqCst) {
            bail!("registry unavailable");
        }
        Ok(self
            .entities
            .lock()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Option<EntityRecord>> {
        Ok(self.entity(entity_id))
    }

    async fn set_entity_tracked(&self, entity_id: &str, tracked: bool) -> Result<bool> {
        Ok(self
            .entities
            .lock()
            .get_mut(entity_id)
            .map(|r| r.tracked = tracked)
            .is_some())
    }

    async fn increment_event_count(
        &self,
        entity_id: &str,
        raw_state: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        if self.fail_increment.load(Ordering::SeqCst) {
            bail!("registry write failed");
        }
        let mut entities = self.entities.lock();
        let Some(record) = entities.get_mut(entity_id) else {
            return Ok(false);
        };
        record.event_count += 1;
        record.last_state = Some(raw_state.to_owned());
        record.last_seen = seen_at;
        Ok(true)
    }

    async fn log_sync(&self, entry: &SyncLogEntry) -> Result<()> {
        if self.fail_log_sync.load(Ordering::SeqCst) {
            bail!("sync log unavailable");
        }
        self.sync_log.lock().push(entry.clone());
        Ok(())
    }

    async fn get_recent_syncs(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        Ok(self
            .sync_log
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_subscription_state(&self, state: &SubscriptionState) -> Result<()> {
        self.subscription_saves.fetch_add(1, Ordering::SeqCst);
        *self.subscription.lock() = Some(state.clone());
        Ok(())
    }

    async fn load_subscription_state(&self) -> Result<Option<SubscriptionState>> {
        Ok(self.subscription_state())
    }

    fn name(&self) -> &str {
        "memory-registry"
    }
}

// ============= Time series =============

#[derive(Default)]
pub struct MemorySink {
    readings: Mutex<Vec<EnergyReading>>,
    stats: Mutex<HashMap<(String, StatPeriod, DateTime<Utc>), EnergyStatistic>>,
    pub reading_writes: AtomicUsize,
    /// Every `write_stats` batch, in call order
    pub stats_batches: Mutex<Vec<Vec<EnergyStatistic>>>,
    pub fail_write_readings: AtomicBool,
    pub fail_write_stats: AtomicBool,
    pub write_stats_gate: Gate,
    failing_latest: Mutex<HashSet<String>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn readings(&self) -> Vec<EnergyReading> {
        self.readings.lock().clone()
    }

    pub fn stats_batches(&self) -> Vec<Vec<EnergyStatistic>> {
        self.stats_batches.lock().clone()
    }

    pub fn stored_stats(&self, entity_id: &str) -> Vec<EnergyStatistic> {
        let mut rows: Vec<_> = self
            .stats
            .lock()
            .values()
            .filter(|s| s.entity_id == entity_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.start);
        rows
    }

    pub fn fail_latest_for(&self, entity_id: &str) {
        self.failing_latest.lock().insert(entity_id.to_owned());
    }

    /// Preload statistics without counting a write
    pub fn preload_stats(&self, rows: Vec<EnergyStatistic>) {
        let mut stats = self.stats.lock();
        for row in rows {
            stats.insert((row.entity_id.clone(), row.period, row.start), row);
        }
    }
}

#[async_trait]
impl TimeSeriesSink for MemorySink {
    async fn write_readings(&self, readings: &[EnergyReading]) -> Result<usize> {
        self.reading_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_write_readings.load(Ordering::SeqCst) {
            bail!("time-series store unavailable");
        }
        self.readings.lock().extend_from_slice(readings);
        Ok(readings.len())
    }

    async fn write_stats(&self, stats: &[EnergyStatistic]) -> Result<usize> {
        self.write_stats_gate.pass().await;
        self.stats_batches.lock().push(stats.to_vec());
        if self.fail_write_stats.load(Ordering::SeqCst) {
            bail!("time-series store unavailable");
        }
        self.preload_stats(stats.to_vec());
        Ok(stats.len())
    }

    async fn get_latest_stats_time(
        &self,
        entity_id: &str,
        period: StatPeriod,
    ) -> Result<Option<DateTime<Utc>>> {
        if self.failing_latest.lock().contains(entity_id) {
            bail!("latest lookup failed for {entity_id}");
        }
        Ok(self
            .stats
            .lock()
            .values()
            .filter(|s| s.entity_id == entity_id && s.period == period)
            .map(|s| s.start)
            .max())
    }

    async fn count_rows(&self) -> Result<u64> {
        Ok((self.readings.lock().len() + self.stats.lock().len()) as u64)
    }

    async fn query_readings(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EnergyReading>> {
        Ok(self
            .readings
            .lock()
            .iter()
            .filter(|r| r.entity_id == entity_id && r.timestamp >= start && r.timestamp < end)
            .cloned()
            .collect())
    }

    async fn query_stats(
        &self,
        entity_id: &str,
        period: StatPeriod,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EnergyStatistic>> {
        Ok(self
            .stored_stats(entity_id)
            .into_iter()
            .filter(|s| s.period == period && s.start >= start && s.start < end)
            .collect())
    }

    async fn aggregate_readings(
        &self,
        _entity_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _bucket: StatPeriod,
    ) -> Result<Vec<ReadingAggregate>> {
        bail!("aggregation is not supported by the in-memory sink")
    }

    fn name(&self) -> &str {
        "memory-sink"
    }
}

// ============= Harness =============

pub struct Harness {
    pub hub: Arc<FakeHub>,
    pub registry: Arc<MemoryRegistry>,
    pub sink: Arc<MemorySink>,
    pub clock: Arc<ManualClock>,
    pub services: Services,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let hub = FakeHub::new();
        let registry = MemoryRegistry::new();
        let sink = MemorySink::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let services = Services {
            hub: hub.clone(),
            registry: registry.clone(),
            sink: sink.clone(),
            clock: clock.clone(),
        };
        Self {
            hub,
            registry,
            sink,
            clock,
            services,
        }
    }

    /// Reconciler wired to its own stats and feed, without a recorder
    pub fn reconciler(&self) -> ReconcilerParts {
        let stats = Arc::new(RecorderStats::new());
        let tracked = Arc::new(TrackedEntities::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let live = Arc::new(LiveFeed::new(self.services.hub.clone(), events_tx));
        let reconciler = Reconciler::new(
            self.services.clone(),
            RecorderConfig::default(),
            stats.clone(),
            tracked.clone(),
            live.clone(),
        );
        ReconcilerParts {
            reconciler,
            stats,
            tracked,
            live,
            events_rx,
        }
    }
}

pub struct ReconcilerParts {
    pub reconciler: Reconciler,
    pub stats: Arc<RecorderStats>,
    pub tracked: Arc<TrackedEntities>,
    pub live: Arc<LiveFeed>,
    pub events_rx: mpsc::UnboundedReceiver<StateChangedEvent>,
}

/// Run `future` with a timeout so a hung recorder fails the test
pub async fn bounded<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("operation hung")
}
