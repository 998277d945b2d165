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

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fluxion_types::{
    EnergyReading, EnergyStatistic, EntityFilter, EntityRecord, HubEntityState, ReadingAggregate,
    StatPeriod, StateChangedEvent, StatisticsRow, SubscriptionState, SyncLogEntry,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::clock::Clock;

/// Channel the hub session pushes `state_changed` events into
pub type EventSink = mpsc::UnboundedSender<StateChangedEvent>;

// ============= Data Source Traits =============

/// Live session with the home-automation hub
#[async_trait]
pub trait HubSession: Send + Sync {
    /// Current state of every entity the hub knows
    async fn get_states(&self) -> Result<Vec<HubEntityState>>;

    /// Authoritative long-term statistics, keyed by entity id.
    /// Entities without data may be missing from the map.
    async fn statistics_during_period(
        &self,
        entity_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        period: StatPeriod,
    ) -> Result<HashMap<String, Vec<StatisticsRow>>>;

    /// Subscribe to `state_changed` events, returning the subscription id
    async fn subscribe_state_changes(&self, sink: EventSink) -> Result<u64>;

    /// False once the connection carrying the subscription has dropped
    fn is_subscription_active(&self, subscription_id: u64) -> bool;

    /// Drop local bookkeeping for a subscription
    fn forget_subscription(&self, subscription_id: u64);

    /// Tear down and re-establish the connection
    async fn reconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Number of the current connection, growing by one with every
    /// connection the session establishes. Zero while disconnected.
    fn connection_generation(&self) -> u64;

    /// Resolve once a connection newer than `after` is up, with its
    /// generation. `None` when the session can no longer connect.
    async fn wait_for_connection(&self, after: u64) -> Option<u64>;

    /// Get data source name for logging
    fn name(&self) -> &str;
}

// ============= Storage Traits =============

/// Document store holding entity metadata, the sync log and subscription state
#[async_trait]
pub trait EntityRegistry: Send + Sync {
    /// Insert or merge by entity id. Metadata takes the new values; the
    /// tracked flag, event counter and first-seen time are kept for
    /// existing records.
    async fn upsert_entity(&self, record: &EntityRecord) -> Result<()>;

    async fn get_entities(&self, filter: &EntityFilter) -> Result<Vec<EntityRecord>>;

    async fn get_entity(&self, entity_id: &str) -> Result<Option<EntityRecord>>;

    /// Returns false when the entity is unknown
    async fn set_entity_tracked(&self, entity_id: &str, tracked: bool) -> Result<bool>;

    /// Bump the event counter and refresh last state / last seen.
    /// Returns false when the entity is unknown.
    async fn increment_event_count(
        &self,
        entity_id: &str,
        raw_state: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn log_sync(&self, entry: &SyncLogEntry) -> Result<()>;

    /// Newest first
    async fn get_recent_syncs(&self, limit: usize) -> Result<Vec<SyncLogEntry>>;

    async fn save_subscription_state(&self, state: &SubscriptionState) -> Result<()>;

    async fn load_subscription_state(&self) -> Result<Option<SubscriptionState>>;

    fn name(&self) -> &str;
}

/// Time-series store for readings and aggregated statistics
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    /// Append readings, returning the number written
    async fn write_readings(&self, readings: &[EnergyReading]) -> Result<usize>;

    /// Write statistics, last write wins per `(entity_id, period, start)`
    async fn write_stats(&self, stats: &[EnergyStatistic]) -> Result<usize>;

    async fn get_latest_stats_time(
        &self,
        entity_id: &str,
        period: StatPeriod,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Readings plus statistics rows
    async fn count_rows(&self) -> Result<u64>;

    async fn query_readings(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EnergyReading>>;

    async fn query_stats(
        &self,
        entity_id: &str,
        period: StatPeriod,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EnergyStatistic>>;

    /// Bucket readings in `[start, end)` by `bucket`
    async fn aggregate_readings(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: StatPeriod,
    ) -> Result<Vec<ReadingAggregate>>;

    fn name(&self) -> &str;
}

/// Collaborators shared by the recorder and the reconciler
#[derive(Clone)]
pub struct Services {
    pub hub: Arc<dyn HubSession>,
    pub registry: Arc<dyn EntityRegistry>,
    pub sink: Arc<dyn TimeSeriesSink>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("hub", &self.hub.name())
            .field("registry", &self.registry.name())
            .field("sink", &self.sink.name())
            .field("clock", &self.clock)
            .finish()
    }
}
